//! Pulse generator class.

use serde::{Deserialize, Serialize};

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{Dimension, FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Output mode: pulses of `pulse_width`.
pub const PULSE_MODE_PULSE: i64 = 1;
/// Output mode: square wave of `pulse_period`.
pub const PULSE_MODE_SQUARE_WAVE: i64 = 2;

/// Trigger mode: start on command.
pub const TRIGGER_MODE_INTERNAL: i64 = 1;
/// Trigger mode: start on an external edge.
pub const TRIGGER_MODE_EXTERNAL: i64 = 2;

/// `num_pulses` value meaning "run until stopped".
pub const CONTINUOUS: u64 = 0;

/// Every pulse parameter at once, applied by [`pulse_generator_setup`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSetup {
    /// Seconds between pulse starts.
    pub pulse_period: f64,
    /// Seconds a pulse stays high.
    pub pulse_width: f64,
    /// Pulses to emit, or [`CONTINUOUS`].
    pub num_pulses: u64,
    /// Seconds from trigger to first pulse.
    pub pulse_delay: f64,
    /// Output mode.
    pub mode: i64,
    /// Trigger mode.
    pub trigger_mode: i64,
}

impl PulseSetup {
    /// Order of the values in the `setup` field array.
    fn to_array(self) -> Vec<f64> {
        vec![
            self.pulse_period,
            self.pulse_width,
            self.num_pulses as f64,
            self.pulse_delay,
            self.mode as f64,
            self.trigger_mode as f64,
        ]
    }

    fn from_array(values: &[f64]) -> MxResult<Self> {
        match values {
            [period, width, num, delay, mode, trigger] => Ok(Self {
                pulse_period: *period,
                pulse_width: *width,
                num_pulses: if *num <= 0.0 { CONTINUOUS } else { num.round() as u64 },
                pulse_delay: *delay,
                mode: mode.round() as i64,
                trigger_mode: trigger.round() as i64,
            }),
            _ => Err(MxError::illegal_argument(
                "pulse_generator_setup",
                format!("setup takes 6 values, {} given", values.len()),
            )),
        }
    }
}

/// Class struct shared by every pulse generator driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseGeneratorState {
    /// Seconds a pulse stays high.
    pub pulse_width: f64,
    /// Seconds from trigger to first pulse.
    pub pulse_delay: f64,
    /// Seconds between pulse starts.
    pub pulse_period: f64,
    /// Pulses to emit, or [`CONTINUOUS`].
    pub num_pulses: u64,
    /// Output mode.
    pub mode: i64,
    /// Trigger mode.
    pub trigger_mode: i64,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl Default for PulseGeneratorState {
    fn default() -> Self {
        Self {
            pulse_width: 0.0,
            pulse_delay: 0.0,
            pulse_period: 0.0,
            num_pulses: CONTINUOUS,
            mode: PULSE_MODE_PULSE,
            trigger_mode: TRIGGER_MODE_INTERNAL,
            busy: false,
            busy_start: BusyStart::default(),
        }
    }
}

impl PulseGeneratorState {
    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        let mut state = Self {
            busy_start: BusyStart::new(
                assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?,
            ),
            ..Self::default()
        };
        let setup = PulseSetup {
            pulse_period: assignments.f64_or("pulse_period", state.pulse_period)?,
            pulse_width: assignments.f64_or("pulse_width", state.pulse_width)?,
            num_pulses: assignments
                .get("num_pulses")
                .map_or(Ok(CONTINUOUS), |v| v.as_u64())?,
            pulse_delay: assignments.f64_or("pulse_delay", state.pulse_delay)?,
            mode: assignments
                .get("mode")
                .map_or(Ok(PULSE_MODE_PULSE), |v| v.as_i64())?,
            trigger_mode: assignments
                .get("trigger_mode")
                .map_or(Ok(TRIGGER_MODE_INTERNAL), |v| v.as_i64())?,
        };
        apply_setup(&mut state, setup)?;
        Ok(state)
    }
}

/// Operations a pulse generator driver provides.
pub trait PulseGeneratorDriver: RecordDriver {
    /// Begin emitting pulses.
    fn start(&mut self, state: &mut PulseGeneratorState) -> MxResult<()>;

    /// Stop emitting pulses.
    fn stop(&mut self, state: &mut PulseGeneratorState) -> MxResult<()>;

    /// Busy as reported by the device.
    fn busy(&mut self, state: &mut PulseGeneratorState) -> MxResult<bool>;

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut PulseGeneratorState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut PulseGeneratorState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// Pulse generator class struct and its driver.
pub struct PulseGeneratorBody {
    /// Class-level state.
    pub state: PulseGeneratorState,
    /// Hardware driver.
    pub driver: Box<dyn PulseGeneratorDriver>,
}

impl PulseGeneratorBody {
    /// Pair `state` with `driver`.
    pub fn new(state: PulseGeneratorState, driver: Box<dyn PulseGeneratorDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(PulseGenerator, PulseGeneratorBody);

fn non_negative(operation: &'static str, what: &str, value: f64) -> MxResult<f64> {
    if value < 0.0 || !value.is_finite() {
        return Err(MxError::illegal_argument(
            operation,
            format!("{} {} must be a non-negative number", what, value),
        ));
    }
    Ok(value)
}

fn apply_setup(state: &mut PulseGeneratorState, setup: PulseSetup) -> MxResult<()> {
    for (parameter, value) in setup_parameters(setup) {
        default_set_parameter_handler(state, parameter, value)?;
    }
    Ok(())
}

fn setup_parameters(setup: PulseSetup) -> [(ParameterType, ParameterValue); 6] {
    [
        (ParameterType::PulsePeriod, ParameterValue::Double(setup.pulse_period)),
        (ParameterType::PulseWidth, ParameterValue::Double(setup.pulse_width)),
        (ParameterType::NumPulses, ParameterValue::ULong(setup.num_pulses)),
        (ParameterType::PulseDelay, ParameterValue::Double(setup.pulse_delay)),
        (ParameterType::PulseMode, ParameterValue::Long(setup.mode)),
        (ParameterType::TriggerMode, ParameterValue::Long(setup.trigger_mode)),
    ]
}

/// Class-level parameter reads.
pub fn default_get_parameter_handler(
    state: &mut PulseGeneratorState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    let value = match parameter {
        ParameterType::PulseWidth => ParameterValue::Double(state.pulse_width),
        ParameterType::PulseDelay => ParameterValue::Double(state.pulse_delay),
        ParameterType::PulsePeriod => ParameterValue::Double(state.pulse_period),
        ParameterType::NumPulses => ParameterValue::ULong(state.num_pulses),
        ParameterType::PulseMode => ParameterValue::Long(state.mode),
        ParameterType::TriggerMode => ParameterValue::Long(state.trigger_mode),
        other => {
            return Err(unsupported_parameter(
                "pulse_generator_get_parameter",
                RecordClass::PulseGenerator,
                other,
            ))
        }
    };
    Ok(value)
}

/// Class-level parameter writes with range checks.
pub fn default_set_parameter_handler(
    state: &mut PulseGeneratorState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "pulse_generator_set_parameter";
    match parameter {
        ParameterType::PulseWidth => {
            state.pulse_width = non_negative(OP, "pulse width", value.as_f64()?)?
        }
        ParameterType::PulseDelay => {
            state.pulse_delay = non_negative(OP, "pulse delay", value.as_f64()?)?
        }
        ParameterType::PulsePeriod => {
            state.pulse_period = non_negative(OP, "pulse period", value.as_f64()?)?
        }
        ParameterType::NumPulses => state.num_pulses = value.as_u64()?,
        ParameterType::PulseMode => {
            let mode = value.as_i64()?;
            if mode != PULSE_MODE_PULSE && mode != PULSE_MODE_SQUARE_WAVE {
                return Err(MxError::illegal_argument(OP, format!("unknown pulse mode {}", mode)));
            }
            state.mode = mode;
        }
        ParameterType::TriggerMode => {
            let mode = value.as_i64()?;
            if mode != TRIGGER_MODE_INTERNAL && mode != TRIGGER_MODE_EXTERNAL {
                return Err(MxError::illegal_argument(
                    OP,
                    format!("unknown trigger mode {}", mode),
                ));
            }
            state.trigger_mode = mode;
        }
        other => return Err(unsupported_parameter(OP, RecordClass::PulseGenerator, other)),
    }
    Ok(())
}

fn start_locked(pulser: &mut PulseGeneratorBody, ctx: &RecordContext<'_>) -> MxResult<()> {
    let issued = ctx.clock.now();
    pulser.driver.start(&mut pulser.state)?;
    pulser.state.busy_start.record_start(issued);
    pulser.state.busy = true;
    Ok(())
}

fn is_busy_locked(pulser: &mut PulseGeneratorBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = pulser.driver.busy(&mut pulser.state)?;
    let busy = pulser
        .state
        .busy_start
        .apply(ctx.name, reported, ctx.clock.now());
    if pulser.state.busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    pulser.state.busy = busy;
    Ok(busy)
}

/// Every selector goes through the driver so proxies forward each one.
fn setup_locked(pulser: &mut PulseGeneratorBody, setup: PulseSetup) -> MxResult<()> {
    for (parameter, value) in setup_parameters(setup) {
        pulser
            .driver
            .set_parameter(&mut pulser.state, parameter, value)?;
    }
    Ok(())
}

fn current_setup(pulser: &mut PulseGeneratorBody) -> MxResult<PulseSetup> {
    let PulseGeneratorBody { state, driver } = pulser;
    Ok(PulseSetup {
        pulse_period: driver.get_parameter(state, ParameterType::PulsePeriod)?.as_f64()?,
        pulse_width: driver.get_parameter(state, ParameterType::PulseWidth)?.as_f64()?,
        num_pulses: driver.get_parameter(state, ParameterType::NumPulses)?.as_u64()?,
        pulse_delay: driver.get_parameter(state, ParameterType::PulseDelay)?.as_f64()?,
        mode: driver.get_parameter(state, ParameterType::PulseMode)?.as_i64()?,
        trigger_mode: driver.get_parameter(state, ParameterType::TriggerMode)?.as_i64()?,
    })
}

/// Start emitting and open the busy-start window.
pub fn pulse_generator_start(record: &Record) -> MxResult<()> {
    with_record(record, "pulse_generator_start", start_locked)
}

/// Stop emitting.
pub fn pulse_generator_stop(record: &Record) -> MxResult<()> {
    with_record(record, "pulse_generator_stop", |p, _| {
        p.driver.stop(&mut p.state)
    })
}

/// Busy with the busy-start override applied.
pub fn pulse_generator_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "pulse_generator_is_busy", is_busy_locked)
}

/// Configure period, width, count, delay and both modes in one call.
pub fn pulse_generator_setup(record: &Record, setup: PulseSetup) -> MxResult<()> {
    with_record(record, "pulse_generator_setup", |p, _| setup_locked(p, setup))
}

/// Every pulse parameter as the driver reports it.
pub fn pulse_generator_get_setup(record: &Record) -> MxResult<PulseSetup> {
    with_record(record, "pulse_generator_get_setup", |p, _| current_setup(p))
}

/// Read one parameter through the driver.
pub fn pulse_generator_get_parameter(
    record: &Record,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    with_record(record, "pulse_generator_get_parameter", |p, _| {
        p.driver.get_parameter(&mut p.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn pulse_generator_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "pulse_generator_set_parameter", |p, _| {
        p.driver.set_parameter(&mut p.state, parameter, value)
    })
}

fn state(body: &mut RecordBody) -> MxResult<&mut PulseGeneratorState> {
    Ok(&mut class_body(body.class_mut(), "pulse_generator_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "pulse_generator_get_parameter", |p, _| {
        p.driver
            .get_parameter(&mut p.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "pulse_generator_set_parameter", |p, _| {
        p.driver.set_parameter(&mut p.state, parameter, value)
    })
}

/// Field table of the pulse generator class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("pulse_period", FieldType::Double, |b| {
            param_get(b, ParameterType::PulsePeriod, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PulsePeriod, v))
        .in_description(),
        FieldDescriptor::class("pulse_width", FieldType::Double, |b| {
            param_get(b, ParameterType::PulseWidth, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PulseWidth, v))
        .in_description(),
        FieldDescriptor::class("num_pulses", FieldType::ULong, |b| {
            param_get(b, ParameterType::NumPulses, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::NumPulses, v))
        .in_description(),
        FieldDescriptor::class("pulse_delay", FieldType::Double, |b| {
            param_get(b, ParameterType::PulseDelay, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PulseDelay, v))
        .in_description(),
        FieldDescriptor::class("mode", FieldType::Long, |b| {
            param_get(b, ParameterType::PulseMode, FieldType::Long)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PulseMode, v))
        .in_description(),
        FieldDescriptor::class("trigger_mode", FieldType::Long, |b| {
            param_get(b, ParameterType::TriggerMode, FieldType::Long)
        })
        .with_setter(|b, v| param_set(b, ParameterType::TriggerMode, v))
        .in_description(),
        FieldDescriptor::class("busy_start_interval", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.busy_start.interval))
        })
        .with_setter(|b, v| {
            state(b)?.busy_start.interval = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("setup", FieldType::Double, |b| {
            locked(b, "pulse_generator_get_setup", |p, _| current_setup(p))
                .map(|setup| FieldValue::double_array(setup.to_array()))
        })
        .with_setter(|b, v| {
            let setup = PulseSetup::from_array(v.as_f64_slice()?)?;
            locked(b, "pulse_generator_setup", |p, _| setup_locked(p, setup))
        })
        .with_dimensions(&[Dimension::Fixed(6)])
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "pulse_generator_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("start", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "pulse_generator_start", start_locked)?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("stop", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "pulse_generator_stop", |p, _| p.driver.stop(&mut p.state))?;
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
    fn setup_array_keeps_field_order() {
        let setup = PulseSetup {
            pulse_period: 0.5,
            pulse_width: 0.1,
            num_pulses: 10,
            pulse_delay: 0.02,
            mode: PULSE_MODE_SQUARE_WAVE,
            trigger_mode: TRIGGER_MODE_EXTERNAL,
        };
        assert_eq!(PulseSetup::from_array(&setup.to_array()).unwrap(), setup);
        let err = PulseSetup::from_array(&[1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn negative_width_is_rejected_and_state_kept() {
        let mut state = PulseGeneratorState::default();
        state.pulse_width = 0.25;
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::PulseWidth,
            ParameterValue::Double(-1.0),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
        assert_eq!(state.pulse_width, 0.25);
    }

    #[test]
    fn unknown_modes_are_rejected() {
        let mut state = PulseGeneratorState::default();
        for parameter in [ParameterType::PulseMode, ParameterType::TriggerMode] {
            let err =
                default_set_parameter_handler(&mut state, parameter, ParameterValue::Long(9))
                    .unwrap_err();
            assert_eq!(err.kind, ErrorKind::IllegalArgument);
        }
    }
}
