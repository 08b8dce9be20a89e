//! Join tokens for worker instances
//!
//! Tokens use the kubeadm bootstrap token format `<id>.<secret>`, where the
//! id is 6 and the secret 16 characters of `[a-z0-9]`. The cluster side of a
//! token is a `bootstrap.kubernetes.io/token` Secret in `kube-system`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use super::BootstrapError;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// Secret type recognised by the bootstrap token authenticator
pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";

/// Group granted to nodes joining with a token
pub const DEFAULT_NODE_TOKEN_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

/// A kubeadm bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a token from the system's cryptographic RNG
    pub fn generate() -> Result<Self, BootstrapError> {
        Ok(Self {
            id: random_token_chars(TOKEN_ID_LEN)?,
            secret: random_token_chars(TOKEN_SECRET_LEN)?,
        })
    }

    /// Parse a `<id>.<secret>` token
    pub fn parse(token: &str) -> Option<Self> {
        let (id, secret) = token.split_once('.')?;
        let valid = |part: &str, len: usize| {
            part.len() == len && part.bytes().all(|b| TOKEN_ALPHABET.contains(&b))
        };
        (valid(id, TOKEN_ID_LEN) && valid(secret, TOKEN_SECRET_LEN)).then(|| Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Public token id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token secret
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Name of the Secret backing this token
    pub fn secret_name(&self) -> String {
        format!("bootstrap-token-{}", self.id)
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

fn random_token_chars(len: usize) -> Result<String, BootstrapError> {
    // bytes at or above the largest multiple of 36 are discarded
    let limit = (256 / TOKEN_ALPHABET.len() * TOKEN_ALPHABET.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while out.len() < len {
        aws_lc_rs::rand::fill(&mut buf).map_err(|_| {
            BootstrapError::TokenCreation("cryptographic RNG unavailable".to_string())
        })?;
        for b in buf.iter().copied().filter(|b| *b < limit) {
            if out.len() == len {
                break;
            }
            out.push(TOKEN_ALPHABET[b as usize % TOKEN_ALPHABET.len()] as char);
        }
    }
    Ok(out)
}

/// Issues join tokens for worker instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Create a token and return it as `<id>.<secret>`
    async fn create_token(&self) -> Result<String, BootstrapError>;
}

/// Token issuer that registers tokens as bootstrap token Secrets
pub struct KubeTokenIssuer {
    client: Client,
    namespace: String,
    ttl: Duration,
}

impl KubeTokenIssuer {
    /// Create an issuer writing Secrets to `namespace` with the given lifetime
    pub fn new(client: Client, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            ttl,
        }
    }

    /// Build the Secret that makes `token` valid until `expiration`
    pub fn token_secret(
        token: &BootstrapToken,
        namespace: &str,
        expiration: chrono::DateTime<chrono::Utc>,
    ) -> Secret {
        let data: BTreeMap<String, String> = [
            ("token-id", token.id().to_string()),
            ("token-secret", token.secret().to_string()),
            (
                "expiration",
                expiration.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            ("usage-bootstrap-authentication", "true".to_string()),
            ("usage-bootstrap-signing", "true".to_string()),
            ("auth-extra-groups", DEFAULT_NODE_TOKEN_GROUP.to_string()),
            ("description", "worker join token".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Secret {
            metadata: ObjectMeta {
                name: Some(token.secret_name()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some(BOOTSTRAP_TOKEN_SECRET_TYPE.to_string()),
            string_data: Some(data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TokenIssuer for KubeTokenIssuer {
    async fn create_token(&self) -> Result<String, BootstrapError> {
        let token = BootstrapToken::generate()?;
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| BootstrapError::TokenCreation(format!("invalid token ttl: {e}")))?;
        let secret = Self::token_secret(&token, &self.namespace, chrono::Utc::now() + ttl);

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        api.create(&PostParams::default(), &secret)
            .await
            .map_err(|e| BootstrapError::TokenCreation(e.to_string()))?;

        info!(token_id = %token.id(), ttl_secs = self.ttl.as_secs(), "created bootstrap token");
        debug!(
            secret = %token.secret_name(),
            namespace = %self.namespace,
            "bootstrap token secret written"
        );
        Ok(token.to_string())
    }
}
