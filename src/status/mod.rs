//! Instance status stored on the Machine itself
//!
//! The last observed state of an instance is kept as a JSON-encoded Machine
//! under the `instance-status` annotation of the same Machine. Before a
//! snapshot is encoded its own `instance-status` entry is blanked, so a
//! record never nests earlier copies of itself.

mod store;

pub use store::{KubeMachineStore, MachineStore};

#[cfg(test)]
pub use store::MockMachineStore;

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::crd::Machine;
use crate::{Error, Result};

/// Annotation key holding the encoded instance status
pub const INSTANCE_STATUS_ANNOTATION: &str = "instance-status";

/// Read the instance status snapshot stored on `machine`
///
/// Returns `None` when the annotation map is absent or the key is unset or
/// empty. A payload that names another group, version or kind is a decode
/// error; one that names none is read as a Machine.
pub fn machine_instance_status(machine: &Machine) -> Result<Option<Machine>> {
    let raw = match machine.annotations().get(INSTANCE_STATUS_ANNOTATION) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };

    let decode_error = |message: String| Error::Decode {
        machine: machine.identity(),
        message,
    };

    let mut value: Value = serde_json::from_str(raw).map_err(|e| decode_error(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| decode_error("instance status is not a JSON object".to_string()))?;

    for (field, expected) in [
        ("apiVersion", Machine::api_version(&()).into_owned()),
        ("kind", Machine::kind(&()).into_owned()),
    ] {
        match object.get(field).cloned() {
            None => {
                object.insert(field.to_string(), Value::String(expected));
            }
            Some(Value::String(found)) if found == expected => {}
            Some(found) => {
                return Err(decode_error(format!(
                    "expected {field} {expected}, found {found}"
                )))
            }
        }
    }

    let snapshot = serde_json::from_value(value).map_err(|e| decode_error(e.to_string()))?;
    Ok(Some(snapshot))
}

/// Store `status` as the instance status snapshot of `machine`
///
/// The snapshot's own `instance-status` annotation is forced to the empty
/// string before encoding. Annotation maps are created where missing.
pub fn set_machine_instance_status(
    machine: &mut Machine,
    mut status: Machine,
) -> Result<&mut Machine> {
    status
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(INSTANCE_STATUS_ANNOTATION.to_string(), String::new());

    let encoded = serde_json::to_string(&status).map_err(|e| Error::Encode {
        machine: machine.identity(),
        message: e.to_string(),
    })?;

    machine
        .annotations_mut()
        .insert(INSTANCE_STATUS_ANNOTATION.to_string(), encoded);
    Ok(machine)
}

/// Persist a snapshot of `machine` onto the stored copy of the same record
///
/// The stored record is re-read first so unrelated fields written by others
/// are kept. A record that no longer exists fails with
/// [`Error::RecordGone`] without any write.
#[instrument(skip(store, machine), fields(machine = %machine.identity()))]
pub async fn update_instance_status(
    store: &dyn MachineStore,
    machine: &Machine,
) -> Result<Machine> {
    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();

    let mut current = store
        .get_if_exists(&namespace, &name)
        .await?
        .ok_or_else(|| Error::record_gone(&namespace, &name))?;

    set_machine_instance_status(&mut current, machine.clone())?;
    let updated = store.update(&current).await?;
    debug!("instance status annotation written");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineSpec, MachineVersionInfo};
    use std::sync::{Arc, Mutex};

    fn sample_machine(name: &str) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                versions: MachineVersionInfo {
                    kubelet: "1.9.4".to_string(),
                    control_plane: "1.9.4".to_string(),
                },
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("default".to_string());
        machine
    }

    // ==========================================================================
    // Codec
    // ==========================================================================

    #[test]
    fn absent_annotation_map_reads_as_no_status() {
        let machine = sample_machine("m");
        assert!(machine.metadata.annotations.is_none());
        assert!(machine_instance_status(&machine).unwrap().is_none());
    }

    #[test]
    fn empty_annotation_reads_as_no_status() {
        let mut machine = sample_machine("m");
        machine
            .annotations_mut()
            .insert(INSTANCE_STATUS_ANNOTATION.to_string(), String::new());
        assert!(machine_instance_status(&machine).unwrap().is_none());
    }

    /// Story: the first status write on a bare record creates exactly one key
    #[test]
    fn story_first_write_on_bare_record() {
        let mut target = sample_machine("m");
        let snapshot = sample_machine("m");

        set_machine_instance_status(&mut target, snapshot).unwrap();

        let annotations = target.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(annotations.contains_key(INSTANCE_STATUS_ANNOTATION));

        let decoded = machine_instance_status(&target).unwrap().unwrap();
        assert!(machine_instance_status(&decoded).unwrap().is_none());
    }

    /// Story: writing a record's own state onto itself never nests
    ///
    /// Repeated passes snapshot a machine that already carries a status;
    /// the stored payload must not grow with each pass.
    #[test]
    fn story_repeated_snapshots_do_not_nest() {
        let mut machine = sample_machine("m");
        for _ in 0..3 {
            let snapshot = machine.clone();
            set_machine_instance_status(&mut machine, snapshot).unwrap();
        }
        let first_len = machine.annotations()[INSTANCE_STATUS_ANNOTATION].len();

        let snapshot = machine.clone();
        set_machine_instance_status(&mut machine, snapshot).unwrap();
        assert_eq!(
            machine.annotations()[INSTANCE_STATUS_ANNOTATION].len(),
            first_len
        );

        let decoded = machine_instance_status(&machine).unwrap().unwrap();
        assert_eq!(decoded.annotations()[INSTANCE_STATUS_ANNOTATION], "");
    }

    #[test]
    fn snapshot_round_trips() {
        let mut snapshot = sample_machine("worker-3");
        snapshot
            .labels_mut()
            .insert("set".to_string(), "node".to_string());
        snapshot
            .annotations_mut()
            .insert(INSTANCE_STATUS_ANNOTATION.to_string(), String::new());

        let mut target = sample_machine("worker-3");
        set_machine_instance_status(&mut target, snapshot.clone()).unwrap();

        assert_eq!(machine_instance_status(&target).unwrap(), Some(snapshot));
    }

    #[test]
    fn encoded_snapshot_is_compact_and_typed() {
        let mut target = sample_machine("m");
        set_machine_instance_status(&mut target, sample_machine("m")).unwrap();
        let raw = &target.annotations()[INSTANCE_STATUS_ANNOTATION];

        assert!(!raw.contains('\n'));
        let value: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(value["apiVersion"], "cluster.k8s.io/v1alpha1");
        assert_eq!(value["kind"], "Machine");
    }

    #[test]
    fn untyped_payload_defaults_to_machine() {
        let mut machine = sample_machine("m");
        machine.annotations_mut().insert(
            INSTANCE_STATUS_ANNOTATION.to_string(),
            r#"{"metadata":{"name":"m"},"spec":{"versions":{"kubelet":"1.9.4"}}}"#.to_string(),
        );
        let decoded = machine_instance_status(&machine).unwrap().unwrap();
        assert_eq!(decoded.spec.versions.kubelet, "1.9.4");
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let mut machine = sample_machine("m");
        machine
            .annotations_mut()
            .insert(INSTANCE_STATUS_ANNOTATION.to_string(), "{not json".to_string());
        match machine_instance_status(&machine) {
            Err(Error::Decode { machine, .. }) => assert_eq!(machine, "default/m"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn foreign_kind_is_decode_error() {
        let mut machine = sample_machine("m");
        machine.annotations_mut().insert(
            INSTANCE_STATUS_ANNOTATION.to_string(),
            r#"{"apiVersion":"v1","kind":"Pod","metadata":{},"spec":{}}"#.to_string(),
        );
        assert!(matches!(
            machine_instance_status(&machine),
            Err(Error::Decode { .. })
        ));
    }

    // ==========================================================================
    // Orchestrated update
    // ==========================================================================

    /// Story: a machine deleted between reconcile start and status write
    ///
    /// The write is abandoned with RecordGone and the store never sees an
    /// update call.
    #[tokio::test]
    async fn story_status_write_after_deletion_is_record_gone() {
        let mut store = MockMachineStore::new();
        store.expect_get_if_exists().returning(|_, _| Ok(None));
        store.expect_update().never();

        let err = update_instance_status(&store, &sample_machine("gone"))
            .await
            .unwrap_err();
        match err {
            Error::RecordGone { namespace, name } => {
                assert_eq!(namespace, "default");
                assert_eq!(name, "gone");
            }
            other => panic!("expected RecordGone, got {other:?}"),
        }
    }

    /// Story: the snapshot lands on the persisted copy, not the caller's copy
    #[tokio::test]
    async fn story_status_written_onto_persisted_record() {
        let mut persisted = sample_machine("m");
        persisted.metadata.resource_version = Some("42".to_string());
        persisted
            .annotations_mut()
            .insert("owner".to_string(), "ops".to_string());

        let written: Arc<Mutex<Option<Machine>>> = Arc::new(Mutex::new(None));
        let written_clone = written.clone();

        let mut store = MockMachineStore::new();
        let returned = persisted.clone();
        store
            .expect_get_if_exists()
            .withf(|ns, name| ns == "default" && name == "m")
            .returning(move |_, _| Ok(Some(returned.clone())));
        store.expect_update().times(1).returning(move |m| {
            *written_clone.lock().unwrap() = Some(m.clone());
            Ok(m.clone())
        });

        let mut observed = sample_machine("m");
        observed.spec.provider_id = Some("gce://p/z/m".to_string());
        update_instance_status(&store, &observed).await.unwrap();

        let written = written.lock().unwrap().clone().unwrap();
        assert_eq!(written.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(written.annotations()["owner"], "ops");

        let snapshot = machine_instance_status(&written).unwrap().unwrap();
        assert_eq!(snapshot.spec.provider_id.as_deref(), Some("gce://p/z/m"));
    }

    #[tokio::test]
    async fn conflict_from_store_propagates() {
        let mut store = MockMachineStore::new();
        store
            .expect_get_if_exists()
            .returning(|_, _| Ok(Some(sample_machine("m"))));
        store.expect_update().returning(|_| {
            Err(Error::Conflict {
                namespace: "default".to_string(),
                name: "m".to_string(),
            })
        });

        let err = update_instance_status(&store, &sample_machine("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }
}
