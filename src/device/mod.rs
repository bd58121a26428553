//! Generic device-class API.
//!
//! One module per class. Each module provides:
//!
//! - the class struct (`*State`) holding the fields every driver of the class
//!   shares, and `*Body` pairing it with the boxed driver;
//! - a driver trait extending [`RecordDriver`](crate::record::RecordDriver)
//!   whose methods have defaults, so an unimplemented operation either falls
//!   back to a class default handler or reports `Unsupported`;
//! - `default_get_parameter_handler` / `default_set_parameter_handler`;
//! - the class field descriptor table;
//! - public, validated `class_operation(&Record, ..)` entry points.
//!
//! Every entry point checks the record's class (`TypeMismatch`), locks the
//! record, checks that the body holds the right class struct
//! (`CorruptDataStructure`), then calls the driver.

pub mod autoscale;
pub mod busy;
pub mod mca;
pub mod mce;
pub mod motor;
pub mod pulse_generator;
pub mod scaler;
pub mod timer;

use crate::error::{MxError, MxResult};
use crate::field::{FieldDescriptor, FieldValue};
use crate::record::RecordClass;

/// Generates `class_body`, `locked` and `with_record` for one class module.
macro_rules! class_access {
    ($variant:ident, $body:ty) => {
        #[allow(dead_code)]
        fn class_body<'a>(
            class: &'a mut $crate::record::ClassBody,
            operation: &'static str,
        ) -> $crate::error::MxResult<&'a mut $body> {
            match class {
                $crate::record::ClassBody::$variant(body) => Ok(body),
                other => Err($crate::device::class_mismatch(
                    operation,
                    $crate::record::RecordClass::$variant,
                    other.class(),
                )),
            }
        }

        /// Run `f` on the class body of an already locked record.
        #[allow(dead_code)]
        fn locked<R>(
            body: &mut $crate::record::RecordBody,
            operation: &'static str,
            f: impl FnOnce(&mut $body, &$crate::record::RecordContext<'_>) -> $crate::error::MxResult<R>,
        ) -> $crate::error::MxResult<R> {
            let (class, ctx) = body.split();
            let body = class_body(class, operation)?;
            f(body, &ctx)
        }

        /// Lock `record` and run `f` on its class body.
        #[allow(dead_code)]
        fn with_record<R>(
            record: &$crate::record::Record,
            operation: &'static str,
            f: impl FnOnce(&mut $body, &$crate::record::RecordContext<'_>) -> $crate::error::MxResult<R>,
        ) -> $crate::error::MxResult<R> {
            record.with_class(operation, $crate::record::RecordClass::$variant, |body| {
                locked(body, operation, f)
            })
        }
    };
}
pub(crate) use class_access;

pub(crate) fn class_mismatch(
    operation: &'static str,
    expected: RecordClass,
    found: RecordClass,
) -> MxError {
    MxError::corrupt(
        operation,
        format!("expected a {} class struct, found {}", expected, found),
    )
}

/// Error for a selector the class does not know.
pub(crate) fn unsupported_parameter(
    operation: &'static str,
    class: RecordClass,
    parameter: crate::parameter::ParameterType,
) -> MxError {
    MxError::unsupported(
        operation,
        format!("parameter '{}' is not supported by the {} class", parameter, class),
    )
}

/// Trigger fields (`start`, `stop`, `clear`) act only when written true.
pub(crate) fn is_trigger(value: &FieldValue) -> MxResult<bool> {
    value.as_bool()
}

/// Class field table for `class`.
pub fn class_fields(class: RecordClass) -> Vec<FieldDescriptor> {
    match class {
        RecordClass::Motor => motor::class_fields(),
        RecordClass::Mca => mca::class_fields(),
        RecordClass::Mce => mce::class_fields(),
        RecordClass::Scaler => scaler::class_fields(),
        RecordClass::Timer => timer::class_fields(),
        RecordClass::Autoscale => autoscale::class_fields(),
        RecordClass::PulseGenerator => pulse_generator::class_fields(),
        RecordClass::Server => crate::net::server::class_fields(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_are_unique_within_each_class() {
        for class in [
            RecordClass::Motor,
            RecordClass::Mca,
            RecordClass::Mce,
            RecordClass::Scaler,
            RecordClass::Timer,
            RecordClass::Autoscale,
            RecordClass::PulseGenerator,
            RecordClass::Server,
        ] {
            let fields = class_fields(class);
            let mut names: Vec<_> = fields.iter().map(|f| f.name).collect();
            names.sort_unstable();
            let before = names.len();
            names.dedup();
            assert_eq!(before, names.len(), "duplicate field in {}", class);
        }
    }
}
