//! Records: named, typed instances in the device registry.
//!
//! A [`Record`] carries an immutable identity (name plus the three-level
//! superclass / class / driver-type taxonomy), a resolved field table, and a
//! [`RecordBody`] behind a per-record mutex. The body owns the class struct
//! (shape shared by every driver of the class) and the driver itself (the
//! type struct plus its operation table).
//!
//! Every class-level operation locks the body for its whole duration, so
//! calls on the same record are serialized and calls on different records run
//! independently.
//!
//! # Construction
//!
//! Records are built in three phases by [`RecordList`]:
//!
//! 1. `create_record_structures` - the driver factory builds the class body
//!    from the parsed record description.
//! 2. `finish_record_initialization` - records cross-link by name and check
//!    each other's classes.
//! 3. `open` - the driver performs whatever I/O it needs to become ready.

mod body;
mod lifecycle;
mod list;
mod notify;

pub use body::{with_driver, ClassBody, LifecyclePhase, RecordBody, RecordContext};
pub use lifecycle::{CreateContext, DriverFactory, DriverRegistry, InitContext, RecordDriver};
pub use list::{RecordDefaults, RecordList};
pub use notify::FieldWatchers;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

use crate::clock::Clock;
use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{FieldAccess, FieldFlags, FieldValue, ResolvedField};

/// Top level of the record taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Superclass {
    /// Hardware or simulated device.
    Device,
    /// Connection to a remote record server.
    Server,
}

/// Behavioural category shared by a set of drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass {
    /// Positioner.
    Motor,
    /// Multichannel analyzer.
    Mca,
    /// Multichannel encoder.
    Mce,
    /// Counter.
    Scaler,
    /// Gate timer.
    Timer,
    /// Gain control driven by a monitor.
    Autoscale,
    /// Pulse generator.
    PulseGenerator,
    /// Network server.
    Server,
}

impl RecordClass {
    /// Superclass the class belongs to.
    pub fn superclass(&self) -> Superclass {
        match self {
            RecordClass::Server => Superclass::Server,
            _ => Superclass::Device,
        }
    }

    /// Lowercase name used in messages.
    pub fn name(&self) -> &'static str {
        match self {
            RecordClass::Motor => "motor",
            RecordClass::Mca => "mca",
            RecordClass::Mce => "mce",
            RecordClass::Scaler => "scaler",
            RecordClass::Timer => "timer",
            RecordClass::Autoscale => "autoscale",
            RecordClass::PulseGenerator => "pulse_generator",
            RecordClass::Server => "server",
        }
    }
}

impl std::fmt::Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity tags of a record, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTags {
    /// Top-level category.
    pub superclass: Superclass,
    /// Class.
    pub class: RecordClass,
    /// Driver type the record was created with.
    pub driver_type: &'static str,
}

/// A record in the registry.
pub struct Record {
    name: String,
    tags: RecordTags,
    fields: Vec<ResolvedField>,
    body: Mutex<RecordBody>,
    fault: RwLock<Option<String>>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl Record {
    pub(crate) fn new(
        name: String,
        tags: RecordTags,
        fields: Vec<ResolvedField>,
        class: ClassBody,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let body = RecordBody::new(name.clone(), class, clock);
        Self {
            name,
            tags,
            fields,
            body: Mutex::new(body),
            fault: RwLock::new(None),
        }
    }

    /// Unique record name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity tags.
    pub fn tags(&self) -> RecordTags {
        self.tags
    }

    /// Record class.
    pub fn class(&self) -> RecordClass {
        self.tags.class
    }

    /// Record superclass.
    pub fn superclass(&self) -> Superclass {
        self.tags.superclass
    }

    /// Driver type name.
    pub fn driver_type(&self) -> &'static str {
        self.tags.driver_type
    }

    /// Class fields followed by driver fields, with resolved dimensions.
    pub fn fields(&self) -> &[ResolvedField] {
        &self.fields
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.body.lock().phase
    }

    /// Reason this record was quarantined, if it was.
    pub fn fault(&self) -> Option<String> {
        self.fault.read().clone()
    }

    /// True once a corrupt-data error has been raised for this record.
    pub fn is_quarantined(&self) -> bool {
        self.fault.read().is_some()
    }

    fn quarantine(&self, err: &MxError) {
        let mut fault = self.fault.write();
        if fault.is_none() {
            error!(record = %self.name, error = %err, "record quarantined after internal consistency failure");
            *fault = Some(err.to_string());
        }
    }

    /// Run `f` with the record body locked.
    ///
    /// Refuses to run on a quarantined record, and quarantines the record if
    /// `f` reports `CorruptDataStructure`.
    pub(crate) fn with_body<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut RecordBody) -> MxResult<R>,
    ) -> MxResult<R> {
        if let Some(reason) = self.fault.read().as_ref() {
            return Err(MxError::corrupt(
                operation,
                format!("record '{}' is quarantined: {}", self.name, reason),
            ));
        }
        let result = {
            let mut body = self.body.lock();
            f(&mut body)
        };
        if let Err(err) = &result {
            if err.kind == ErrorKind::CorruptDataStructure {
                self.quarantine(err);
            }
        }
        result
    }

    /// Check the record's class before locking its body.
    ///
    /// A record of the wrong class is a `TypeMismatch`. A record whose tags
    /// name the right class but whose body holds another class struct is
    /// `CorruptDataStructure`.
    pub(crate) fn with_class<R>(
        &self,
        operation: &'static str,
        class: RecordClass,
        f: impl FnOnce(&mut RecordBody) -> MxResult<R>,
    ) -> MxResult<R> {
        if self.tags.class != class {
            return Err(MxError::type_mismatch(
                operation,
                format!(
                    "record '{}' is of class {}, not {}",
                    self.name, self.tags.class, class
                ),
            ));
        }
        self.with_body(operation, |body| {
            if body.class.class() != class {
                return Err(MxError::corrupt(
                    operation,
                    format!(
                        "record '{}' is tagged {} but its class struct is {}",
                        self.name,
                        class,
                        body.class.class()
                    ),
                ));
            }
            f(body)
        })
    }

    /// Look a field up by name.
    pub fn locate_field(&self, name: &str) -> MxResult<FieldRef<'_>> {
        self.fields
            .iter()
            .position(|f| f.name() == name)
            .map(|index| FieldRef {
                record: self,
                index,
            })
            .ok_or_else(|| {
                MxError::not_found(
                    "locate_field",
                    format!("record '{}' has no field '{}'", self.name, name),
                )
            })
    }

    /// Read `name` through the generic field table.
    pub fn read_field(&self, name: &str) -> MxResult<FieldValue> {
        self.locate_field(name)?.get()
    }

    /// Write `name` through the generic field table. See [`FieldRef::put`].
    pub fn write_field(&self, name: &str, value: FieldValue) -> MxResult<()> {
        self.locate_field(name)?.put(value)
    }

    /// Register interest in a field. The receiver starts at the current value.
    pub fn subscribe(&self, name: &str) -> MxResult<watch::Receiver<FieldValue>> {
        let field = self.locate_field(name)?;
        let resolved = field.resolved().clone();
        self.with_body("subscribe", |body| {
            let current = read_resolved(body, &resolved)?;
            Ok(body.watchers.subscribe(resolved.name(), current))
        })
    }

    pub(crate) fn finish_initialization(&self, list: &RecordList) -> MxResult<()> {
        self.with_body("finish_record_initialization", |body| {
            if body.phase != LifecyclePhase::Created {
                return Ok(());
            }
            let ctx = InitContext::new(list, &self.name);
            body.class.finish_initialization(&ctx)?;
            body.phase = LifecyclePhase::Initialized;
            Ok(())
        })
    }

    pub(crate) fn open(&self) -> MxResult<()> {
        self.with_body("open", |body| match body.phase {
            LifecyclePhase::Open => Ok(()),
            LifecyclePhase::Created => Err(MxError::new(
                ErrorKind::NotReady,
                "open",
                format!("record '{}' has not finished initialization", self.name),
            )),
            LifecyclePhase::Initialized | LifecyclePhase::Closed => {
                with_driver!(&mut body.class, d => d.open())?;
                body.phase = LifecyclePhase::Open;
                tracing::info!(record = %self.name, driver = self.tags.driver_type, "record opened");
                Ok(())
            }
        })
    }

    pub(crate) fn close(&self) -> MxResult<()> {
        self.with_body("close", |body| {
            if body.phase != LifecyclePhase::Open {
                return Ok(());
            }
            with_driver!(&mut body.class, d => d.close())?;
            body.phase = LifecyclePhase::Closed;
            tracing::info!(record = %self.name, "record closed");
            Ok(())
        })
    }

    pub(crate) fn delete(&self) -> MxResult<()> {
        let mut body = self.body.lock();
        if body.phase == LifecyclePhase::Open {
            with_driver!(&mut body.class, d => d.close())?;
        }
        with_driver!(&mut body.class, d => d.delete_record())?;
        body.phase = LifecyclePhase::Closed;
        Ok(())
    }
}

/// A located field of a record.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    record: &'a Record,
    index: usize,
}

impl<'a> FieldRef<'a> {
    /// Owning record.
    pub fn record(&self) -> &'a Record {
        self.record
    }

    /// Descriptor and resolved dimensions.
    pub fn resolved(&self) -> &'a ResolvedField {
        &self.record.fields[self.index]
    }

    /// Field name.
    pub fn name(&self) -> &'static str {
        self.resolved().name()
    }

    /// Resolved dimensions.
    pub fn dims(&self) -> &'a [usize] {
        &self.resolved().dims
    }

    /// Current value.
    pub fn get(&self) -> MxResult<FieldValue> {
        let resolved = self.resolved();
        self.record
            .with_body("field_get", |body| read_resolved(body, resolved))
    }

    /// Write a value. The datatype must match the field exactly and the value
    /// may not hold more elements than the field's resolved dimensions.
    pub fn put(&self, value: FieldValue) -> MxResult<()> {
        let resolved = self.resolved();
        let descriptor = &resolved.descriptor;
        if !descriptor.is_writable() {
            return Err(MxError::new(
                ErrorKind::ClientRequestDenied,
                "field_put",
                format!("field '{}.{}' is read-only", self.record.name, descriptor.name),
            ));
        }
        if value.datatype() != descriptor.datatype {
            return Err(MxError::type_mismatch(
                "field_put",
                format!(
                    "field '{}.{}' is {}, value is {}",
                    self.record.name,
                    descriptor.name,
                    descriptor.datatype,
                    value.datatype()
                ),
            ));
        }
        let capacity = crate::field::element_count(&resolved.dims);
        if value.is_scalar() != resolved.dims.is_empty() || value.element_count() > capacity {
            return Err(MxError::would_exceed_limit(
                "field_put",
                format!(
                    "field '{}.{}' has dimensions {:?}, value has {:?}",
                    self.record.name,
                    descriptor.name,
                    resolved.dims,
                    value.dims()
                ),
            ));
        }

        self.record.with_body("field_put", |body| {
            match descriptor.access {
                FieldAccess::Class { set: Some(set), .. } => set(body, value)?,
                FieldAccess::Class { set: None, .. } => {
                    return Err(MxError::new(
                        ErrorKind::ClientRequestDenied,
                        "field_put",
                        format!("field '{}' has no setter", descriptor.name),
                    ))
                }
                FieldAccess::Driver => {
                    let name = descriptor.name;
                    with_driver!(&mut body.class, d => d.write_type_field(name, value))?
                }
            }
            if body.watchers.is_watched(descriptor.name) {
                if let Ok(current) = read_resolved(body, resolved) {
                    body.watchers.notify(descriptor.name, current, false);
                }
            }
            Ok(())
        })
    }
}

fn read_resolved(body: &mut RecordBody, resolved: &ResolvedField) -> MxResult<FieldValue> {
    let descriptor = &resolved.descriptor;
    match descriptor.access {
        FieldAccess::Class { get, .. } => get(body),
        FieldAccess::Driver => {
            let name = descriptor.name;
            with_driver!(&mut body.class, d => d.read_type_field(name))
        }
    }
}

/// Fields shown in summaries, in table order.
pub fn summary_fields(record: &Record) -> Vec<&'static str> {
    record
        .fields()
        .iter()
        .filter(|f| f.descriptor.flags.contains(FieldFlags::IN_SUMMARY))
        .map(|f| f.name())
        .collect()
}
