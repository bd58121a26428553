//! The record database.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::lifecycle::{CreateContext, DriverFactory, DriverRegistry};
use super::{Record, RecordClass, RecordTags};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::{MxError, MxResult};
use crate::field::{resolve_dimensions, FieldAssignments, FieldFlags, FieldValue, ResolvedField};
use crate::net::wire::WireFormat;
use crate::net::{NetworkContext, DEFAULT_HOST, DEFAULT_PORT};

/// Values a record description may omit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDefaults {
    /// Busy-start window in seconds for records that do not set one.
    pub busy_start_interval: f64,
    /// Per-connection timeout for server records.
    pub timeout: Duration,
    /// Value encoding requested by server records.
    pub wire_format: WireFormat,
    /// Host for server records that omit one.
    pub default_host: String,
    /// Port for server records that omit one.
    pub default_port: u16,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            busy_start_interval: 0.0,
            timeout: Duration::from_millis(5000),
            wire_format: WireFormat::Xdr,
            default_host: DEFAULT_HOST.to_string(),
            default_port: DEFAULT_PORT,
        }
    }
}

impl RecordDefaults {
    /// Defaults taken from the `[network]` section.
    pub fn from_settings(settings: &Settings) -> Self {
        let network = &settings.network;
        Self {
            busy_start_interval: network.busy_start_interval_secs,
            timeout: Duration::from_millis(network.timeout_ms),
            wire_format: network.wire_format,
            default_host: network.default_host.clone(),
            default_port: network.default_port,
        }
    }
}

/// Records by unique name, plus the drivers that can build them.
///
/// Lifecycle calls clone the record handles first, so no list lock is held
/// while a record body is locked.
pub struct RecordList {
    records: RwLock<Vec<Arc<Record>>>,
    drivers: RwLock<DriverRegistry>,
    clock: Arc<dyn Clock>,
    defaults: RecordDefaults,
    network: Arc<NetworkContext>,
}

impl std::fmt::Debug for RecordList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.records.read().iter().map(|r| r.name().to_string()).collect();
        f.debug_struct("RecordList")
            .field("records", &names)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Default for RecordList {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordList {
    /// Empty list with every built-in driver registered and the system clock.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            drivers: RwLock::new(DriverRegistry::with_builtin_drivers()),
            clock: Arc::new(SystemClock::new()),
            defaults: RecordDefaults::default(),
            network: Arc::new(NetworkContext::new()),
        }
    }

    /// Use `clock` for every record created afterwards.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the list-wide defaults.
    pub fn with_defaults(mut self, defaults: RecordDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Share `network` with another list.
    pub fn with_network(mut self, network: Arc<NetworkContext>) -> Self {
        self.network = network;
        self
    }

    /// Clock handed to new records.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// List-wide defaults.
    pub fn defaults(&self) -> &RecordDefaults {
        &self.defaults
    }

    /// Shared network state.
    pub fn network(&self) -> &Arc<NetworkContext> {
        &self.network
    }

    /// Add a driver factory, replacing one of the same type.
    pub fn register_driver(&self, factory: Arc<dyn DriverFactory>) {
        self.drivers.write().register(factory);
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        self.drivers.read().driver_types()
    }

    /// Phase 1 for one record: parse its description and build its structures.
    ///
    /// Description keys must name fields flagged `IN_DESCRIPTION`. Fields are
    /// assigned in table order, so a varargs dimension can only refer to a
    /// field that appears earlier in the table.
    pub fn create_record(
        &self,
        name: &str,
        driver_type: &str,
        description: &toml::Table,
    ) -> MxResult<Arc<Record>> {
        const OP: &str = "create_record";

        if name.is_empty() || name.contains(['.', ':', '@']) || name.contains(char::is_whitespace) {
            return Err(MxError::illegal_argument(
                OP,
                format!("'{}' is not a valid record name", name),
            ));
        }
        if self.records.read().iter().any(|r| r.name() == name) {
            return Err(MxError::illegal_argument(
                OP,
                format!("record '{}' already exists", name),
            ));
        }

        let factory = self.drivers.read().get(driver_type)?;
        let class = factory.class();

        let mut descriptors = crate::device::class_fields(class);
        descriptors.extend(factory.type_fields());

        for key in description.keys() {
            let known = descriptors
                .iter()
                .any(|d| d.name == key && d.flags.contains(FieldFlags::IN_DESCRIPTION));
            if !known {
                return Err(MxError::illegal_argument(
                    OP,
                    format!(
                        "driver '{}' has no description field '{}' (record '{}')",
                        driver_type, key, name
                    ),
                ));
            }
        }

        let mut assignments = FieldAssignments::new();
        let mut fields = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let dims = resolve_dimensions(&descriptor.dimensions, &assignments).map_err(|err| {
                MxError::illegal_argument(
                    OP,
                    format!("record '{}' field '{}': {}", name, descriptor.name, err.message),
                )
            })?;
            if descriptor.flags.contains(FieldFlags::IN_DESCRIPTION) {
                if let Some(raw) = description.get(descriptor.name) {
                    let value = FieldValue::from_toml(descriptor.datatype, &dims, raw)
                        .map_err(|err| err.in_operation(OP))?;
                    assignments.assign(descriptor.name, value);
                } else if let Some(default) = &descriptor.default {
                    assignments.assign(descriptor.name, default.clone());
                }
            }
            fields.push(ResolvedField { descriptor, dims });
        }

        let ctx = CreateContext {
            name,
            assignments: &assignments,
            defaults: &self.defaults,
            network: &self.network,
        };
        let body = factory.create_record_structures(&ctx)?;
        if body.class() != class {
            return Err(MxError::corrupt(
                OP,
                format!(
                    "driver '{}' declared class {} but built a {} class struct",
                    driver_type,
                    class,
                    body.class()
                ),
            ));
        }

        let tags = RecordTags {
            superclass: class.superclass(),
            class,
            driver_type: factory.driver_type(),
        };
        let record = Arc::new(Record::new(
            name.to_string(),
            tags,
            fields,
            body,
            Arc::clone(&self.clock),
        ));

        let mut records = self.records.write();
        if records.iter().any(|r| r.name() == name) {
            return Err(MxError::illegal_argument(
                OP,
                format!("record '{}' already exists", name),
            ));
        }
        records.push(Arc::clone(&record));
        debug!(record = name, driver = driver_type, class = %class, "record created");
        Ok(record)
    }

    /// Phase 2 for every record, in creation order.
    ///
    /// Every record is attempted; the first failure is returned.
    pub fn finish_initialization(&self) -> MxResult<()> {
        self.for_each_record("finish_record_initialization", |record| {
            record.finish_initialization(self)
        })
    }

    /// Phase 3 for every record, in creation order.
    pub fn open_all(&self) -> MxResult<()> {
        self.for_each_record("open", |record| record.open())
    }

    /// Close every open record, most recently created first.
    pub fn close_all(&self) -> MxResult<()> {
        let mut records = self.records();
        records.reverse();
        let mut first_error = None;
        for record in records {
            if let Err(err) = record.close() {
                warn!(record = record.name(), error = %err, "close failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn for_each_record(
        &self,
        phase: &'static str,
        f: impl Fn(&Record) -> MxResult<()>,
    ) -> MxResult<()> {
        let mut first_error = None;
        for record in self.records() {
            if let Err(err) = f(&record) {
                warn!(record = record.name(), phase, error = %err, "record lifecycle phase failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove a record and release its driver state.
    pub fn delete_record(&self, name: &str) -> MxResult<()> {
        let record = {
            let mut records = self.records.write();
            let index = records
                .iter()
                .position(|r| r.name() == name)
                .ok_or_else(|| {
                    MxError::not_found("delete_record", format!("no record named '{}'", name))
                })?;
            records.remove(index)
        };
        record.delete()?;
        info!(record = name, "record deleted");
        Ok(())
    }

    /// Record called `name`, or `NotFound`.
    pub fn find(&self, name: &str) -> MxResult<Arc<Record>> {
        self.records
            .read()
            .iter()
            .find(|r| r.name() == name)
            .cloned()
            .ok_or_else(|| MxError::not_found("find_record", format!("no record named '{}'", name)))
    }

    /// Every record of `class`, in creation order.
    pub fn find_class(&self, class: RecordClass) -> Vec<Arc<Record>> {
        self.records
            .read()
            .iter()
            .filter(|r| r.class() == class)
            .cloned()
            .collect()
    }

    /// Snapshot of every record handle, in creation order.
    pub fn records(&self) -> Vec<Arc<Record>> {
        self.records.read().clone()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when the list holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Build a list from configuration: create every record, then
    /// cross-link them. Records are not opened.
    pub fn load_from_settings(settings: &Settings) -> MxResult<Self> {
        let list = Self::new().with_defaults(RecordDefaults::from_settings(settings));
        for entry in &settings.records {
            list.create_record(&entry.name, &entry.driver, &entry.fields)?;
        }
        list.finish_initialization()?;
        info!(records = list.len(), "record list loaded");
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::record::LifecyclePhase;

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let list = RecordList::new();
        let fields = table("maximum_num_channels = 16\nmaximum_num_rois = 2");
        list.create_record("mca1", "soft_mca", &fields).unwrap();
        let err = list.create_record("mca1", "soft_mca", &fields).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn unknown_description_keys_are_rejected() {
        let list = RecordList::new();
        let fields = table("maximum_num_channels = 16\nmaximum_num_rois = 2\nbogus = 1");
        let err = list.create_record("mca1", "soft_mca", &fields).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
        assert!(list.is_empty());
    }

    #[test]
    fn unknown_driver_is_not_found() {
        let list = RecordList::new();
        let err = list
            .create_record("m1", "no_such_driver", &toml::Table::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn missing_varargs_source_fails_creation() {
        let list = RecordList::new();
        let err = list
            .create_record("mca1", "soft_mca", &table("maximum_num_rois = 2"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn resolved_dimensions_follow_description() {
        let list = RecordList::new();
        let record = list
            .create_record(
                "mca1",
                "soft_mca",
                &table("maximum_num_channels = 64\nmaximum_num_rois = 3"),
            )
            .unwrap();
        let channels = record.locate_field("channel_array").unwrap();
        assert_eq!(channels.dims(), &[64]);
        let rois = record.locate_field("roi_array").unwrap();
        assert_eq!(rois.dims(), &[3, 2]);
    }

    #[test]
    fn lifecycle_phases_advance() {
        let list = RecordList::new();
        let record = list
            .create_record("motor1", "soft_motor", &toml::Table::new())
            .unwrap();
        assert_eq!(record.phase(), LifecyclePhase::Created);
        list.finish_initialization().unwrap();
        assert_eq!(record.phase(), LifecyclePhase::Initialized);
        list.open_all().unwrap();
        assert_eq!(record.phase(), LifecyclePhase::Open);
        list.close_all().unwrap();
        assert_eq!(record.phase(), LifecyclePhase::Closed);
    }

    #[test]
    fn delete_removes_the_record() {
        let list = RecordList::new();
        list.create_record("motor1", "soft_motor", &toml::Table::new())
            .unwrap();
        list.delete_record("motor1").unwrap();
        assert_eq!(list.find("motor1").unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(
            list.delete_record("motor1").unwrap_err().kind,
            ErrorKind::NotFound
        );
    }

    #[test]
    fn find_class_filters() {
        let list = RecordList::new();
        list.create_record("motor1", "soft_motor", &toml::Table::new())
            .unwrap();
        list.create_record("scaler1", "soft_scaler", &toml::Table::new())
            .unwrap();
        assert_eq!(list.find_class(RecordClass::Motor).len(), 1);
        assert_eq!(list.find_class(RecordClass::Mca).len(), 0);
    }
}
