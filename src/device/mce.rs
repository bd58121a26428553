//! Multichannel encoder class: records a sequence of encoder values during a
//! measurement.

use tracing::warn;

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{Dimension, FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Class struct shared by every MCE driver.
#[derive(Debug, Clone, PartialEq)]
pub struct MceState {
    /// Capacity of `value_array`.
    pub maximum_num_values: usize,
    /// Values recorded by the last measurement.
    pub current_num_values: usize,
    /// Recorded encoder values.
    pub value_array: Vec<f64>,
    /// Time per measurement, seconds.
    pub measurement_time: f64,
    /// Measurements per acquisition.
    pub num_measurements: u64,
    /// Driver-defined acquisition mode.
    pub mode: i64,
    /// Measurement selected for [`mce_read_measurement`].
    pub measurement_index: usize,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl MceState {
    /// Idle state with room for `maximum_num_values` values.
    pub fn new(maximum_num_values: usize) -> Self {
        Self {
            maximum_num_values,
            current_num_values: 0,
            value_array: vec![0.0; maximum_num_values],
            measurement_time: 0.0,
            num_measurements: 0,
            mode: 0,
            measurement_index: 0,
            busy: false,
            busy_start: BusyStart::default(),
        }
    }

    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        let maximum = assignments.require("maximum_num_values")?.as_usize()?;
        let mut state = Self::new(maximum);
        state.measurement_time = assignments.f64_or("measurement_time", 0.0)?;
        state.num_measurements = assignments.usize_or("num_measurements", maximum)? as u64;
        state.busy_start =
            BusyStart::new(assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?);
        Ok(state)
    }
}

/// Operations an MCE driver provides.
pub trait MceDriver: RecordDriver {
    /// Begin recording.
    fn start(&mut self, state: &mut MceState) -> MxResult<()>;

    /// Stop recording.
    fn stop(&mut self, state: &mut MceState) -> MxResult<()>;

    /// Discard recorded values.
    fn clear(&mut self, state: &mut MceState) -> MxResult<()> {
        state.value_array.iter_mut().for_each(|v| *v = 0.0);
        state.current_num_values = 0;
        Ok(())
    }

    /// Busy as reported by the device.
    fn busy(&mut self, state: &mut MceState) -> MxResult<bool>;

    /// Refresh `value_array` and `current_num_values`.
    fn read(&mut self, state: &mut MceState) -> MxResult<()>;

    /// Number of values recorded so far.
    fn get_current_num_values(&mut self, state: &mut MceState) -> MxResult<usize> {
        Ok(state.current_num_values)
    }

    /// Value of the measurement selected by `state.measurement_index`.
    fn read_measurement(&mut self, state: &mut MceState) -> MxResult<f64> {
        Ok(state
            .value_array
            .get(state.measurement_index)
            .copied()
            .unwrap_or(0.0))
    }

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut MceState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut MceState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// MCE class struct and its driver.
pub struct MceBody {
    /// Class-level state.
    pub state: MceState,
    /// Hardware driver.
    pub driver: Box<dyn MceDriver>,
}

impl MceBody {
    /// Pair `state` with `driver`.
    pub fn new(state: MceState, driver: Box<dyn MceDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Mce, MceBody);

/// Class-level parameter reads, for drivers that override only a few.
pub fn default_get_parameter_handler(
    state: &mut MceState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    match parameter {
        ParameterType::MeasurementTime => Ok(ParameterValue::Double(state.measurement_time)),
        ParameterType::NumMeasurements => Ok(ParameterValue::ULong(state.num_measurements)),
        ParameterType::MceMode => Ok(ParameterValue::Long(state.mode)),
        other => Err(unsupported_parameter(
            "mce_get_parameter",
            RecordClass::Mce,
            other,
        )),
    }
}

/// Class-level parameter writes with range checks.
pub fn default_set_parameter_handler(
    state: &mut MceState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "mce_set_parameter";
    match parameter {
        ParameterType::MeasurementTime => {
            let time = value.as_f64()?;
            if time < 0.0 || time.is_nan() {
                return Err(MxError::illegal_argument(
                    OP,
                    format!("measurement time {} is negative", time),
                ));
            }
            state.measurement_time = time;
        }
        ParameterType::NumMeasurements => {
            let count = value.as_u64()?;
            if count as usize > state.maximum_num_values {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "{} measurements requested, the encoder stores at most {}",
                        count, state.maximum_num_values
                    ),
                ));
            }
            state.num_measurements = count;
        }
        ParameterType::MceMode => state.mode = value.as_i64()?,
        other => return Err(unsupported_parameter(OP, RecordClass::Mce, other)),
    }
    Ok(())
}

/// Select measurement `index`, clamping to the last recorded measurement.
fn select_measurement(state: &mut MceState, index: usize) -> MxResult<()> {
    const OP: &str = "mce_read_measurement";
    let limit = state.current_num_values.min(state.value_array.len());
    if limit == 0 {
        return Err(MxError::illegal_argument(OP, "no measurements have been recorded"));
    }
    if index >= limit {
        state.measurement_index = limit - 1;
        warn!(requested = index, stored = limit - 1, "measurement index clamped");
        return Err(MxError::would_exceed_limit(
            OP,
            format!(
                "measurement {} requested but only {} are available",
                index, limit
            ),
        ));
    }
    state.measurement_index = index;
    Ok(())
}

fn start_locked(mce: &mut MceBody, ctx: &RecordContext<'_>) -> MxResult<()> {
    let issued = ctx.clock.now();
    mce.driver.start(&mut mce.state)?;
    mce.state.busy_start.record_start(issued);
    mce.state.busy = true;
    Ok(())
}

fn is_busy_locked(mce: &mut MceBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = mce.driver.busy(&mut mce.state)?;
    let busy = mce.state.busy_start.apply(ctx.name, reported, ctx.clock.now());
    if mce.state.busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    mce.state.busy = busy;
    Ok(busy)
}

/// Start recording and open the busy-start window.
pub fn mce_start(record: &Record) -> MxResult<()> {
    with_record(record, "mce_start", start_locked)
}

/// Stop recording.
pub fn mce_stop(record: &Record) -> MxResult<()> {
    with_record(record, "mce_stop", |mce, _| mce.driver.stop(&mut mce.state))
}

/// Discard recorded values.
pub fn mce_clear(record: &Record) -> MxResult<()> {
    with_record(record, "mce_clear", |mce, _| mce.driver.clear(&mut mce.state))
}

/// Busy with the busy-start override applied.
pub fn mce_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "mce_is_busy", is_busy_locked)
}

/// Recorded values, `current_num_values` long.
pub fn mce_read(record: &Record) -> MxResult<Vec<f64>> {
    with_record(record, "mce_read", |mce, _| {
        mce.driver.read(&mut mce.state)?;
        let count = mce.state.current_num_values.min(mce.state.value_array.len());
        Ok(mce.state.value_array[..count].to_vec())
    })
}

/// Number of values recorded, capped at `maximum_num_values`.
pub fn mce_get_current_num_values(record: &Record) -> MxResult<usize> {
    with_record(record, "mce_get_current_num_values", |mce, _| {
        let count = mce.driver.get_current_num_values(&mut mce.state)?;
        mce.state.current_num_values = count.min(mce.state.maximum_num_values);
        Ok(mce.state.current_num_values)
    })
}

/// Value of measurement `index`.
pub fn mce_read_measurement(record: &Record, index: usize) -> MxResult<f64> {
    with_record(record, "mce_read_measurement", |mce, _| {
        select_measurement(&mut mce.state, index)?;
        mce.driver.read_measurement(&mut mce.state)
    })
}

/// Read one parameter through the driver.
pub fn mce_get_parameter(record: &Record, parameter: ParameterType) -> MxResult<ParameterValue> {
    with_record(record, "mce_get_parameter", |mce, _| {
        mce.driver.get_parameter(&mut mce.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn mce_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "mce_set_parameter", |mce, _| {
        mce.driver.set_parameter(&mut mce.state, parameter, value)
    })
}

fn state(body: &mut RecordBody) -> MxResult<&mut MceState> {
    Ok(&mut class_body(body.class_mut(), "mce_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "mce_get_parameter", |mce, _| {
        mce.driver
            .get_parameter(&mut mce.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "mce_set_parameter", |mce, _| {
        mce.driver.set_parameter(&mut mce.state, parameter, value)
    })
}

/// Field table of the MCE class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("maximum_num_values", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.maximum_num_values as u64))
        })
        .in_description(),
        FieldDescriptor::class("busy_start_interval", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.busy_start.interval))
        })
        .with_setter(|b, v| {
            state(b)?.busy_start.interval = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("measurement_time", FieldType::Double, |b| {
            param_get(b, ParameterType::MeasurementTime, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::MeasurementTime, v))
        .in_description(),
        FieldDescriptor::class("num_measurements", FieldType::ULong, |b| {
            param_get(b, ParameterType::NumMeasurements, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::NumMeasurements, v))
        .in_description(),
        FieldDescriptor::class("mode", FieldType::Long, |b| {
            param_get(b, ParameterType::MceMode, FieldType::Long)
        })
        .with_setter(|b, v| param_set(b, ParameterType::MceMode, v)),
        FieldDescriptor::class("current_num_values", FieldType::ULong, |b| {
            locked(b, "mce_get_current_num_values", |mce, _| {
                let count = mce.driver.get_current_num_values(&mut mce.state)?;
                Ok(FieldValue::ulong(count as u64))
            })
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("value_array", FieldType::Double, |b| {
            Ok(FieldValue::double_array(state(b)?.value_array.clone()))
        })
        .with_dimensions(&[Dimension::Varargs("maximum_num_values")])
        .with_flags(runtime),
        FieldDescriptor::class("measurement_index", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.measurement_index as u64))
        })
        .with_setter(|b, v| select_measurement(state(b)?, v.as_usize()?))
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "mce_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime),
        FieldDescriptor::class("start", FieldType::Bool, |b| Ok(FieldValue::bool(state(b)?.busy)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mce_start", start_locked)?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("stop", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mce_stop", |mce, _| mce.driver.stop(&mut mce.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("clear", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mce_clear", |mce, _| mce.driver.clear(&mut mce.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn measurement_index_is_clamped_before_error() {
        let mut state = MceState::new(10);
        state.current_num_values = 4;
        let err = select_measurement(&mut state, 7).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(state.measurement_index, 3);
    }

    #[test]
    fn empty_encoder_has_no_measurement_to_select() {
        let mut state = MceState::new(10);
        let err = select_measurement(&mut state, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn num_measurements_bounded_by_storage() {
        let mut state = MceState::new(8);
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::NumMeasurements,
            ParameterValue::ULong(9),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
    }
}
