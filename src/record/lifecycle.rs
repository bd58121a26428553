//! Driver lifecycle table and driver factories.
//!
//! Drivers are registered with a [`DriverRegistry`] under their driver type
//! name (`"soft_mca"`, `"network_motor"`, ...). The [`RecordList`] asks the
//! factory to build a class body from a parsed record description, then
//! drives the rest of the lifecycle through the [`RecordDriver`] supertrait
//! every class driver trait extends.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RecordList::create_record("mca1", "soft_mca", fields)       │
//! │   class fields + factory.type_fields()  → descriptor table  │
//! │   parse description fields, resolve varargs dimensions      │
//! │   factory.create_record_structures(ctx) → ClassBody         │
//! ├──────────────────────────────────────────────────────────────┤
//! │ RecordList::finish_initialization()                          │
//! │   class cross-links, driver.finish_record_initialization()  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ RecordList::open_all()          driver.open()               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`RecordList`]: super::RecordList

use std::collections::HashMap;
use std::sync::Arc;

use super::list::{RecordDefaults, RecordList};
use super::{ClassBody, Record, RecordClass};
use crate::error::{MxError, MxResult};
use crate::field::{FieldAssignments, FieldDescriptor, FieldValue};
use crate::net::server::NetworkServer;
use crate::net::NetworkContext;

/// Lifecycle operations every driver provides.
///
/// All methods have defaults, so drivers only implement the phases they need.
pub trait RecordDriver: Send {
    /// Phase 2: resolve references to other records.
    fn finish_record_initialization(&mut self, _ctx: &InitContext<'_>) -> MxResult<()> {
        Ok(())
    }

    /// Phase 3: perform the I/O needed to become ready.
    fn open(&mut self) -> MxResult<()> {
        Ok(())
    }

    /// Undo `open`. Called before delete and by `close_all`.
    fn close(&mut self) -> MxResult<()> {
        Ok(())
    }

    /// Release driver resources before the record is dropped.
    fn delete_record(&mut self) -> MxResult<()> {
        Ok(())
    }

    /// Read a driver-private field declared by the factory's `type_fields`.
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        Err(MxError::not_found(
            "read_type_field",
            format!("driver has no field '{}'", name),
        ))
    }

    /// Write a driver-private field declared by the factory's `type_fields`.
    fn write_type_field(&mut self, name: &str, _value: FieldValue) -> MxResult<()> {
        Err(MxError::not_found(
            "write_type_field",
            format!("driver has no field '{}'", name),
        ))
    }
}

/// What a factory sees while building a record.
pub struct CreateContext<'a> {
    /// Name of the record being built.
    pub name: &'a str,
    /// Description fields in assignment order, defaults included.
    pub assignments: &'a FieldAssignments,
    /// List-wide defaults.
    pub defaults: &'a RecordDefaults,
    /// Shared network state, for server records.
    pub network: &'a Arc<NetworkContext>,
}

/// What a driver sees while cross-linking.
pub struct InitContext<'a> {
    list: &'a RecordList,
    record_name: &'a str,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(list: &'a RecordList, record_name: &'a str) -> Self {
        Self { list, record_name }
    }

    /// Name of the record being initialized.
    pub fn record_name(&self) -> &str {
        self.record_name
    }

    /// List the record belongs to.
    pub fn list(&self) -> &RecordList {
        self.list
    }

    /// Find another record and check its class.
    ///
    /// A record may not reference itself.
    pub fn find(&self, name: &str, expected: RecordClass) -> MxResult<Arc<Record>> {
        if name == self.record_name {
            return Err(MxError::illegal_argument(
                "finish_record_initialization",
                format!("record '{}' cannot reference itself", name),
            ));
        }
        let record = self
            .list
            .find(name)
            .map_err(|e| e.in_operation("finish_record_initialization"))?;
        if record.class() != expected {
            return Err(MxError::type_mismatch(
                "finish_record_initialization",
                format!(
                    "record '{}' referenced by '{}' is of class {}, expected {}",
                    name,
                    self.record_name,
                    record.class(),
                    expected
                ),
            ));
        }
        Ok(record)
    }

    /// Find a server record and return its connection handle.
    pub fn find_server(&self, name: &str) -> MxResult<Arc<NetworkServer>> {
        let record = self.find(name, RecordClass::Server)?;
        crate::net::server::server_handle(&record)
    }
}

/// Builds records of one driver type.
pub trait DriverFactory: Send + Sync {
    /// Unique driver type name used in record descriptions.
    fn driver_type(&self) -> &'static str;

    /// Class of records this factory builds.
    fn class(&self) -> RecordClass;

    /// One-line description shown in driver listings.
    fn description(&self) -> &'static str {
        ""
    }

    /// Driver-private fields appended after the class fields.
    fn type_fields(&self) -> Vec<FieldDescriptor> {
        Vec::new()
    }

    /// Phase 1: allocate the class struct and driver state.
    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody>;
}

/// Driver factories keyed by driver type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<&'static str, Arc<dyn DriverFactory>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("driver_types", &self.driver_types())
            .finish()
    }
}

impl DriverRegistry {
    /// Registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every driver shipped with this crate.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        crate::drivers::register_builtin(&mut registry);
        registry
    }

    /// Register a factory, replacing any factory with the same driver type.
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        if self.factories.insert(driver_type, factory).is_some() {
            tracing::warn!(driver_type, "driver factory replaced");
        }
    }

    /// Factory for `driver_type`, or `NotFound`.
    pub fn get(&self, driver_type: &str) -> MxResult<Arc<dyn DriverFactory>> {
        self.factories.get(driver_type).cloned().ok_or_else(|| {
            MxError::not_found(
                "driver_lookup",
                format!("no driver registered for type '{}'", driver_type),
            )
        })
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }
}
