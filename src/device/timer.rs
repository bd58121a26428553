//! Timer class.

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Timer mode: run for a preset time, then stop.
pub const TIMER_MODE_PRESET: i64 = 1;
/// Timer mode: count up until stopped.
pub const TIMER_MODE_COUNT_UP: i64 = 2;

/// Class struct shared by every timer driver.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerState {
    /// Elapsed seconds as of the last read.
    pub value: f64,
    /// `TIMER_MODE_PRESET` or `TIMER_MODE_COUNT_UP`.
    pub mode: i64,
    /// Preset of the last start, seconds.
    pub last_measurement_time: f64,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            value: 0.0,
            mode: TIMER_MODE_PRESET,
            last_measurement_time: 0.0,
            busy: false,
            busy_start: BusyStart::default(),
        }
    }
}

impl TimerState {
    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        Ok(Self {
            mode: assignments
                .get("mode")
                .map_or(Ok(TIMER_MODE_PRESET), |v| v.as_i64())?,
            busy_start: BusyStart::new(
                assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?,
            ),
            ..Self::default()
        })
    }
}

/// Operations a timer driver provides.
pub trait TimerDriver: RecordDriver {
    /// Run for `seconds`.
    fn start(&mut self, state: &mut TimerState, seconds: f64) -> MxResult<()>;

    /// Stop early.
    fn stop(&mut self, state: &mut TimerState) -> MxResult<()>;

    /// Zero the elapsed time.
    fn clear(&mut self, state: &mut TimerState) -> MxResult<()> {
        state.value = 0.0;
        Ok(())
    }

    /// Busy as reported by the device.
    fn busy(&mut self, state: &mut TimerState) -> MxResult<bool>;

    /// Refresh `state.value`. The default trusts the cached value.
    fn read(&mut self, _state: &mut TimerState) -> MxResult<()> {
        Ok(())
    }

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut TimerState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut TimerState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// Timer class struct and its driver.
pub struct TimerBody {
    /// Class-level state.
    pub state: TimerState,
    /// Hardware driver.
    pub driver: Box<dyn TimerDriver>,
}

impl TimerBody {
    /// Pair `state` with `driver`.
    pub fn new(state: TimerState, driver: Box<dyn TimerDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Timer, TimerBody);

/// Class-level parameter reads.
pub fn default_get_parameter_handler(
    state: &mut TimerState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    match parameter {
        ParameterType::TimerMode => Ok(ParameterValue::Long(state.mode)),
        ParameterType::LastMeasurementTime => {
            Ok(ParameterValue::Double(state.last_measurement_time))
        }
        other => Err(unsupported_parameter(
            "timer_get_parameter",
            RecordClass::Timer,
            other,
        )),
    }
}

/// Class-level parameter writes with mode validation.
pub fn default_set_parameter_handler(
    state: &mut TimerState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "timer_set_parameter";
    match parameter {
        ParameterType::TimerMode => {
            let mode = value.as_i64()?;
            if mode != TIMER_MODE_PRESET && mode != TIMER_MODE_COUNT_UP {
                return Err(MxError::illegal_argument(OP, format!("unknown timer mode {}", mode)));
            }
            state.mode = mode;
        }
        ParameterType::LastMeasurementTime => state.last_measurement_time = value.as_f64()?,
        other => return Err(unsupported_parameter(OP, RecordClass::Timer, other)),
    }
    Ok(())
}

fn start_locked(timer: &mut TimerBody, ctx: &RecordContext<'_>, seconds: f64) -> MxResult<()> {
    if seconds < 0.0 || seconds.is_nan() {
        return Err(MxError::illegal_argument(
            "timer_start",
            format!("{} is not a valid counting time", seconds),
        ));
    }
    let issued = ctx.clock.now();
    timer.driver.start(&mut timer.state, seconds)?;
    timer.state.last_measurement_time = seconds;
    timer.state.busy_start.record_start(issued);
    timer.state.busy = true;
    Ok(())
}

fn is_busy_locked(timer: &mut TimerBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = timer.driver.busy(&mut timer.state)?;
    let busy = timer.state.busy_start.apply(ctx.name, reported, ctx.clock.now());
    if timer.state.busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    timer.state.busy = busy;
    Ok(busy)
}

fn read_locked(timer: &mut TimerBody) -> MxResult<f64> {
    timer.driver.read(&mut timer.state)?;
    Ok(timer.state.value)
}

/// Run for `seconds` and open the busy-start window.
pub fn timer_start(record: &Record, seconds: f64) -> MxResult<()> {
    with_record(record, "timer_start", |t, ctx| start_locked(t, ctx, seconds))
}

/// Stop early.
pub fn timer_stop(record: &Record) -> MxResult<()> {
    with_record(record, "timer_stop", |t, _| t.driver.stop(&mut t.state))
}

/// Zero the elapsed time.
pub fn timer_clear(record: &Record) -> MxResult<()> {
    with_record(record, "timer_clear", |t, _| t.driver.clear(&mut t.state))
}

/// Busy with the busy-start override applied.
pub fn timer_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "timer_is_busy", is_busy_locked)
}

/// Elapsed seconds.
pub fn timer_read(record: &Record) -> MxResult<f64> {
    with_record(record, "timer_read", |t, _| read_locked(t))
}

/// Read one parameter through the driver.
pub fn timer_get_parameter(record: &Record, parameter: ParameterType) -> MxResult<ParameterValue> {
    with_record(record, "timer_get_parameter", |t, _| {
        t.driver.get_parameter(&mut t.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn timer_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "timer_set_parameter", |t, _| {
        t.driver.set_parameter(&mut t.state, parameter, value)
    })
}

fn state(body: &mut RecordBody) -> MxResult<&mut TimerState> {
    Ok(&mut class_body(body.class_mut(), "timer_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "timer_get_parameter", |t, _| {
        t.driver
            .get_parameter(&mut t.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "timer_set_parameter", |t, _| {
        t.driver.set_parameter(&mut t.state, parameter, value)
    })
}

/// Field table of the timer class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("mode", FieldType::Long, |b| {
            param_get(b, ParameterType::TimerMode, FieldType::Long)
        })
        .with_setter(|b, v| param_set(b, ParameterType::TimerMode, v))
        .in_description(),
        FieldDescriptor::class("busy_start_interval", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.busy_start.interval))
        })
        .with_setter(|b, v| {
            state(b)?.busy_start.interval = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("value", FieldType::Double, |b| {
            locked(b, "timer_read", |t, _| read_locked(t)).map(FieldValue::double)
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("last_measurement_time", FieldType::Double, |b| {
            param_get(b, ParameterType::LastMeasurementTime, FieldType::Double)
        })
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "timer_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime),
        FieldDescriptor::class("start", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.last_measurement_time))
        })
        .with_setter(|b, v| {
            let seconds = v.as_f64()?;
            locked(b, "timer_start", |t, ctx| start_locked(t, ctx, seconds))
        })
        .with_flags(runtime),
        FieldDescriptor::class("stop", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "timer_stop", |t, _| t.driver.stop(&mut t.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("clear", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "timer_clear", |t, _| t.driver.clear(&mut t.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
    ]
}
