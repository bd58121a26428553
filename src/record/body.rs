//! Mutable record state held behind the record mutex.

use std::sync::Arc;

use super::lifecycle::InitContext;
use super::notify::FieldWatchers;
use super::RecordClass;
use crate::clock::Clock;
use crate::device::autoscale::AutoscaleBody;
use crate::device::mca::McaBody;
use crate::device::mce::MceBody;
use crate::device::motor::MotorBody;
use crate::device::pulse_generator::PulseGeneratorBody;
use crate::device::scaler::ScalerBody;
use crate::device::timer::TimerBody;
use crate::error::MxResult;
use crate::net::server::ServerBody;

/// Where a record is in its construction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Structures allocated; references not yet resolved.
    Created,
    /// Cross-links resolved.
    Initialized,
    /// Ready for class operations.
    Open,
    /// Closed; may be opened again.
    Closed,
}

/// Class struct plus driver, one variant per record class.
pub enum ClassBody {
    /// Motor record.
    Motor(MotorBody),
    /// Multichannel analyzer record.
    Mca(McaBody),
    /// Multichannel encoder record.
    Mce(MceBody),
    /// Scaler record.
    Scaler(ScalerBody),
    /// Timer record.
    Timer(TimerBody),
    /// Autoscale record.
    Autoscale(AutoscaleBody),
    /// Pulse generator record.
    PulseGenerator(PulseGeneratorBody),
    /// Network server record.
    Server(ServerBody),
}

/// Run an expression against the driver of any [`ClassBody`] through its
/// [`crate::record::RecordDriver`] supertrait.
#[macro_export]
#[doc(hidden)]
macro_rules! __with_driver {
    ($class:expr, $d:ident => $body:expr) => {
        match $class {
            $crate::record::ClassBody::Motor(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Mca(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Mce(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Scaler(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Timer(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Autoscale(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::PulseGenerator(b) => {
                let $d = &mut *b.driver;
                $body
            }
            $crate::record::ClassBody::Server(b) => {
                let $d = &mut *b.driver;
                $body
            }
        }
    };
}

pub use crate::__with_driver as with_driver;

impl ClassBody {
    /// Class of the held body.
    pub fn class(&self) -> RecordClass {
        match self {
            ClassBody::Motor(_) => RecordClass::Motor,
            ClassBody::Mca(_) => RecordClass::Mca,
            ClassBody::Mce(_) => RecordClass::Mce,
            ClassBody::Scaler(_) => RecordClass::Scaler,
            ClassBody::Timer(_) => RecordClass::Timer,
            ClassBody::Autoscale(_) => RecordClass::Autoscale,
            ClassBody::PulseGenerator(_) => RecordClass::PulseGenerator,
            ClassBody::Server(_) => RecordClass::Server,
        }
    }

    /// Class-level cross-linking followed by the driver's own hook.
    pub(crate) fn finish_initialization(&mut self, ctx: &InitContext<'_>) -> MxResult<()> {
        if let ClassBody::Autoscale(body) = self {
            crate::device::autoscale::link_monitor(body, ctx)?;
        }
        with_driver!(self, d => d.finish_record_initialization(ctx))
    }
}

/// Mutable part of a record, guarded by the record's mutex.
pub struct RecordBody {
    pub(crate) name: String,
    pub(crate) class: ClassBody,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) watchers: FieldWatchers,
    pub(crate) phase: LifecyclePhase,
}

/// Borrowed view of everything in a body except the class struct.
pub struct RecordContext<'a> {
    /// Record name.
    pub name: &'a str,
    /// Clock of the owning list.
    pub clock: &'a dyn Clock,
    /// Subscribers of this record's fields.
    pub watchers: &'a FieldWatchers,
}

impl RecordBody {
    pub(crate) fn new(name: String, class: ClassBody, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            class,
            clock,
            watchers: FieldWatchers::default(),
            phase: LifecyclePhase::Created,
        }
    }

    /// Class struct and driver.
    pub fn class(&self) -> &ClassBody {
        &self.class
    }

    /// Class struct and driver, mutably.
    pub fn class_mut(&mut self) -> &mut ClassBody {
        &mut self.class
    }

    /// Split into the class struct and the rest, so class operations can
    /// mutate the class struct while reading the clock and watchers.
    pub fn split(&mut self) -> (&mut ClassBody, RecordContext<'_>) {
        let RecordBody {
            name,
            class,
            clock,
            watchers,
            ..
        } = self;
        (
            class,
            RecordContext {
                name: name.as_str(),
                clock: &**clock,
                watchers,
            },
        )
    }
}
