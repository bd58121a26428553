//! Scaler class: a counter with optional dark-current correction.
//!
//! `read` returns the raw count minus `dark_current * measurement_time`,
//! where the measurement time is the preset the scaler was last started for.

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Scaler mode: count for a preset time.
pub const SCALER_MODE_PRESET_TIME: i64 = 1;
/// Scaler mode: count until a preset count is reached.
pub const SCALER_MODE_PRESET_COUNT: i64 = 2;

/// Class struct shared by every scaler driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerState {
    /// Count from the last read, uncorrected.
    pub raw_value: i64,
    /// Count from the last read, corrected.
    pub value: i64,
    /// `SCALER_MODE_PRESET_TIME` or `SCALER_MODE_PRESET_COUNT`.
    pub mode: i64,
    /// Dark counts per second subtracted by `read`.
    pub dark_current: f64,
    /// Preset of the last start, seconds.
    pub last_measurement_time: f64,
    /// Counter overflowed.
    pub overflow: bool,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl Default for ScalerState {
    fn default() -> Self {
        Self {
            raw_value: 0,
            value: 0,
            mode: SCALER_MODE_PRESET_TIME,
            dark_current: 0.0,
            last_measurement_time: 0.0,
            overflow: false,
            busy: false,
            busy_start: BusyStart::default(),
        }
    }
}

impl ScalerState {
    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        Ok(Self {
            dark_current: assignments.f64_or("dark_current", 0.0)?,
            mode: assignments
                .get("mode")
                .map_or(Ok(SCALER_MODE_PRESET_TIME), |v| v.as_i64())?,
            busy_start: BusyStart::new(
                assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?,
            ),
            ..Self::default()
        })
    }

    /// Dark-current corrected count.
    pub fn corrected(&self, raw: i64) -> i64 {
        let correction = self.dark_current * self.last_measurement_time;
        (raw as f64 - correction).round() as i64
    }
}

/// Operations a scaler driver provides.
pub trait ScalerDriver: RecordDriver {
    /// Zero the counter.
    fn clear(&mut self, state: &mut ScalerState) -> MxResult<()>;

    /// Refresh `state.raw_value`.
    fn read(&mut self, state: &mut ScalerState) -> MxResult<()>;

    /// Whether the counter overflowed.
    fn overflow_set(&mut self, state: &mut ScalerState) -> MxResult<bool> {
        Ok(state.overflow)
    }

    /// Busy as reported by the device. Defaults to idle.
    fn busy(&mut self, _state: &mut ScalerState) -> MxResult<bool> {
        Ok(false)
    }

    /// Count for `preset` seconds or counts, depending on mode.
    fn start(&mut self, _state: &mut ScalerState, _preset: f64) -> MxResult<()> {
        Err(MxError::unsupported(
            "scaler_start",
            "driver cannot start an independent count",
        ))
    }

    /// Stop a count. Unsupported unless overridden.
    fn stop(&mut self, _state: &mut ScalerState) -> MxResult<()> {
        Err(MxError::unsupported("scaler_stop", "driver cannot stop a count"))
    }

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut ScalerState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut ScalerState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// Scaler class struct and its driver.
pub struct ScalerBody {
    /// Class-level state.
    pub state: ScalerState,
    /// Hardware driver.
    pub driver: Box<dyn ScalerDriver>,
}

impl ScalerBody {
    /// Pair `state` with `driver`.
    pub fn new(state: ScalerState, driver: Box<dyn ScalerDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Scaler, ScalerBody);

/// Class-level parameter reads.
pub fn default_get_parameter_handler(
    state: &mut ScalerState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    match parameter {
        ParameterType::ScalerMode => Ok(ParameterValue::Long(state.mode)),
        ParameterType::DarkCurrent => Ok(ParameterValue::Double(state.dark_current)),
        ParameterType::LastMeasurementTime => {
            Ok(ParameterValue::Double(state.last_measurement_time))
        }
        other => Err(unsupported_parameter(
            "scaler_get_parameter",
            RecordClass::Scaler,
            other,
        )),
    }
}

/// Class-level parameter writes with mode validation.
pub fn default_set_parameter_handler(
    state: &mut ScalerState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "scaler_set_parameter";
    match parameter {
        ParameterType::ScalerMode => {
            let mode = value.as_i64()?;
            if mode != SCALER_MODE_PRESET_TIME && mode != SCALER_MODE_PRESET_COUNT {
                return Err(MxError::illegal_argument(
                    OP,
                    format!("unknown scaler mode {}", mode),
                ));
            }
            state.mode = mode;
        }
        ParameterType::DarkCurrent => state.dark_current = value.as_f64()?,
        other => return Err(unsupported_parameter(OP, RecordClass::Scaler, other)),
    }
    Ok(())
}

fn read_locked(scaler: &mut ScalerBody) -> MxResult<i64> {
    scaler.driver.read(&mut scaler.state)?;
    let value = scaler.state.corrected(scaler.state.raw_value);
    scaler.state.value = value;
    Ok(value)
}

fn start_locked(scaler: &mut ScalerBody, ctx: &RecordContext<'_>, preset: f64) -> MxResult<()> {
    if preset < 0.0 || preset.is_nan() {
        return Err(MxError::illegal_argument(
            "scaler_start",
            format!("preset {} is negative", preset),
        ));
    }
    let issued = ctx.clock.now();
    scaler.driver.start(&mut scaler.state, preset)?;
    if scaler.state.mode == SCALER_MODE_PRESET_TIME {
        scaler.state.last_measurement_time = preset;
    }
    scaler.state.busy_start.record_start(issued);
    scaler.state.busy = true;
    Ok(())
}

fn is_busy_locked(scaler: &mut ScalerBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = scaler.driver.busy(&mut scaler.state)?;
    let busy = scaler.state.busy_start.apply(ctx.name, reported, ctx.clock.now());
    if scaler.state.busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    scaler.state.busy = busy;
    Ok(busy)
}

/// Zero the counter and clear the overflow flag.
pub fn scaler_clear(record: &Record) -> MxResult<()> {
    with_record(record, "scaler_clear", |s, _| {
        s.driver.clear(&mut s.state)?;
        s.state.raw_value = 0;
        s.state.value = 0;
        s.state.overflow = false;
        Ok(())
    })
}

/// Dark-current corrected count.
pub fn scaler_read(record: &Record) -> MxResult<i64> {
    with_record(record, "scaler_read", |s, _| read_locked(s))
}

/// Uncorrected count.
pub fn scaler_read_raw(record: &Record) -> MxResult<i64> {
    with_record(record, "scaler_read_raw", |s, _| {
        s.driver.read(&mut s.state)?;
        Ok(s.state.raw_value)
    })
}

/// Whether the counter overflowed.
pub fn scaler_overflow_set(record: &Record) -> MxResult<bool> {
    with_record(record, "scaler_overflow_set", |s, _| {
        let overflow = s.driver.overflow_set(&mut s.state)?;
        s.state.overflow = overflow;
        Ok(overflow)
    })
}

/// Busy with the busy-start override applied.
pub fn scaler_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "scaler_is_busy", is_busy_locked)
}

/// Count for `preset` seconds or counts, depending on mode.
pub fn scaler_start(record: &Record, preset: f64) -> MxResult<()> {
    with_record(record, "scaler_start", |s, ctx| start_locked(s, ctx, preset))
}

/// Stop the count.
pub fn scaler_stop(record: &Record) -> MxResult<()> {
    with_record(record, "scaler_stop", |s, _| s.driver.stop(&mut s.state))
}

/// Read one parameter through the driver.
pub fn scaler_get_parameter(record: &Record, parameter: ParameterType) -> MxResult<ParameterValue> {
    with_record(record, "scaler_get_parameter", |s, _| {
        s.driver.get_parameter(&mut s.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn scaler_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "scaler_set_parameter", |s, _| {
        s.driver.set_parameter(&mut s.state, parameter, value)
    })
}

fn state(body: &mut RecordBody) -> MxResult<&mut ScalerState> {
    Ok(&mut class_body(body.class_mut(), "scaler_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "scaler_get_parameter", |s, _| {
        s.driver
            .get_parameter(&mut s.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "scaler_set_parameter", |s, _| {
        s.driver.set_parameter(&mut s.state, parameter, value)
    })
}

/// Field table of the scaler class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("dark_current", FieldType::Double, |b| {
            param_get(b, ParameterType::DarkCurrent, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::DarkCurrent, v))
        .in_description(),
        FieldDescriptor::class("mode", FieldType::Long, |b| {
            param_get(b, ParameterType::ScalerMode, FieldType::Long)
        })
        .with_setter(|b, v| param_set(b, ParameterType::ScalerMode, v))
        .in_description(),
        FieldDescriptor::class("busy_start_interval", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.busy_start.interval))
        })
        .with_setter(|b, v| {
            state(b)?.busy_start.interval = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("value", FieldType::Long, |b| {
            locked(b, "scaler_read", |s, _| read_locked(s)).map(FieldValue::long)
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("raw_value", FieldType::Long, |b| {
            locked(b, "scaler_read_raw", |s, _| {
                s.driver.read(&mut s.state)?;
                Ok(FieldValue::long(s.state.raw_value))
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("last_measurement_time", FieldType::Double, |b| {
            param_get(b, ParameterType::LastMeasurementTime, FieldType::Double)
        })
        .with_flags(runtime),
        FieldDescriptor::class("overflow", FieldType::Bool, |b| {
            locked(b, "scaler_overflow_set", |s, _| {
                let overflow = s.driver.overflow_set(&mut s.state)?;
                s.state.overflow = overflow;
                Ok(FieldValue::bool(overflow))
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "scaler_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime),
        FieldDescriptor::class("start", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.last_measurement_time))
        })
        .with_setter(|b, v| {
            let preset = v.as_f64()?;
            locked(b, "scaler_start", |s, ctx| start_locked(s, ctx, preset))
        })
        .with_flags(runtime),
        FieldDescriptor::class("stop", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "scaler_stop", |s, _| s.driver.stop(&mut s.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("clear", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "scaler_clear", |s, _| {
                        s.driver.clear(&mut s.state)?;
                        s.state.raw_value = 0;
                        s.state.value = 0;
                        Ok(())
                    })?;
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
    fn dark_current_correction_uses_measurement_time() {
        let state = ScalerState {
            dark_current: 10.0,
            last_measurement_time: 2.5,
            ..ScalerState::default()
        };
        assert_eq!(state.corrected(1000), 975);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut state = ScalerState::default();
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::ScalerMode,
            ParameterValue::Long(7),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
        assert_eq!(state.mode, SCALER_MODE_PRESET_TIME);
    }
}
