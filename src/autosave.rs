//! Save and restore field values through the generic field tables.
//!
//! A snapshot is a list of `record.field` values read with the same accessors
//! network clients use, so it works for every class and driver without
//! per-class code. Restoring writes them back in order and reports every
//! failure instead of stopping at the first.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MxError, MxResult};
use crate::field::{FieldFlags, FieldValue};
use crate::net::FieldAddress;
use crate::record::RecordList;

/// One saved field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Where the value was read.
    pub address: FieldAddress,
    /// Value at save time.
    pub value: FieldValue,
}

/// Ordered field values; restored in the same order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Saved values.
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Number of saved values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Saved value of `address`.
    pub fn get(&self, address: &FieldAddress) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|e| &e.address == address)
            .map(|e| &e.value)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> MxResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MxError::illegal_argument("autosave_to_json", e.to_string()))
    }

    /// Parse a snapshot written by [`Snapshot::to_json`].
    pub fn from_json(text: &str) -> MxResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| MxError::corrupt("autosave_from_json", e.to_string()))
    }
}

/// A field that could not be restored.
#[derive(Debug, Clone)]
pub struct RestoreFailure {
    /// Field that failed.
    pub address: FieldAddress,
    /// Why the write was rejected.
    pub error: MxError,
}

/// Every writable field of every record that is not marked `NO_AUTOSAVE`.
pub fn autosave_fields(list: &RecordList) -> Vec<FieldAddress> {
    let mut addresses = Vec::new();
    for record in list.records() {
        for field in record.fields() {
            let descriptor = &field.descriptor;
            if descriptor.is_writable() && !descriptor.flags.contains(FieldFlags::NO_AUTOSAVE) {
                addresses.push(FieldAddress::new(record.name(), field.name()));
            }
        }
    }
    addresses
}

/// Read the current value of each address.
///
/// Addresses naming a server belong to another process and are rejected.
pub fn snapshot(list: &RecordList, addresses: &[FieldAddress]) -> MxResult<Snapshot> {
    let mut entries = Vec::with_capacity(addresses.len());
    for address in addresses {
        let value = read(list, address).map_err(|e| e.in_operation("autosave_snapshot"))?;
        entries.push(SnapshotEntry {
            address: address.clone(),
            value,
        });
    }
    debug!(fields = entries.len(), "autosave snapshot taken");
    Ok(Snapshot { entries })
}

/// Write each saved value back. Returns the entries that failed.
pub fn restore(list: &RecordList, snapshot: &Snapshot) -> Vec<RestoreFailure> {
    let mut failures = Vec::new();
    for entry in &snapshot.entries {
        if let Err(error) = write(list, &entry.address, entry.value.clone()) {
            warn!(address = %entry.address, error = %error, "autosave restore failed");
            failures.push(RestoreFailure {
                address: entry.address.clone(),
                error,
            });
        }
    }
    debug!(
        fields = snapshot.len(),
        failed = failures.len(),
        "autosave restore finished"
    );
    failures
}

fn local(address: &FieldAddress) -> MxResult<()> {
    if address.has_server() {
        return Err(MxError::illegal_argument(
            "autosave",
            format!("'{}' names a remote server", address),
        ));
    }
    Ok(())
}

fn read(list: &RecordList, address: &FieldAddress) -> MxResult<FieldValue> {
    local(address)?;
    list.find(address.record())?.read_field(address.field())
}

fn write(list: &RecordList, address: &FieldAddress, value: FieldValue) -> MxResult<()> {
    local(address)?;
    list.find(address.record())?.write_field(address.field(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::motor;
    use crate::error::ErrorKind;

    fn list() -> RecordList {
        let list = RecordList::new();
        list.create_record("m1", "soft_motor", &"scale = 2.0".parse().unwrap())
            .unwrap();
        list.finish_initialization().unwrap();
        list
    }

    #[test]
    fn runtime_fields_are_not_saved() {
        let list = list();
        let fields = autosave_fields(&list);
        assert!(fields.contains(&FieldAddress::new("m1", "speed")));
        assert!(!fields.contains(&FieldAddress::new("m1", "destination")));
        assert!(!fields.contains(&FieldAddress::new("m1", "busy")));
    }

    #[test]
    fn restore_puts_saved_values_back() {
        let list = list();
        let m1 = list.find("m1").unwrap();
        motor::motor_set_speed(&m1, 3.0).unwrap();
        let saved = snapshot(&list, &[FieldAddress::new("m1", "speed")]).unwrap();

        motor::motor_set_speed(&m1, 0.5).unwrap();
        let json = saved.to_json().unwrap();
        let failures = restore(&list, &Snapshot::from_json(&json).unwrap());
        assert!(failures.is_empty());
        assert_eq!(motor::motor_get_speed(&m1).unwrap(), 3.0);
    }

    #[test]
    fn restore_reports_every_failure() {
        let list = list();
        let snapshot = Snapshot {
            entries: vec![
                SnapshotEntry {
                    address: FieldAddress::new("gone", "speed"),
                    value: FieldValue::double(1.0),
                },
                SnapshotEntry {
                    address: FieldAddress::new("m1", "speed"),
                    value: FieldValue::long(1),
                },
                SnapshotEntry {
                    address: FieldAddress::new("m1", "speed"),
                    value: FieldValue::double(1.5),
                },
            ],
        };
        let failures = restore(&list, &snapshot);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].error.kind, ErrorKind::NotFound);
        assert_eq!(failures[1].error.kind, ErrorKind::TypeMismatch);
        let m1 = list.find("m1").unwrap();
        assert_eq!(motor::motor_get_speed(&m1).unwrap(), 1.5);
    }
}
