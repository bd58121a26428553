//! Motor class.
//!
//! Positions are stored in raw controller units. User units are
//! `raw * scale + offset`; software limits are checked in user units before a
//! move reaches the driver.

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{Dimension, FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Motor status bits returned by [`motor_get_status`].
pub mod status {
    /// Motion in progress.
    pub const IS_BUSY: u64 = 0x1;
    /// At or beyond the positive software limit.
    pub const POSITIVE_LIMIT_HIT: u64 = 0x2;
    /// At or beyond the negative software limit.
    pub const NEGATIVE_LIMIT_HIT: u64 = 0x4;
    /// Last home search completed.
    pub const HOME_SEARCH_SUCCEEDED: u64 = 0x8;
    /// Axis is disabled.
    pub const AXIS_DISABLED: u64 = 0x10;
    /// Controller reported a fault.
    pub const ERROR: u64 = 0x8000;
}

/// Number of raw acceleration parameters a controller may use.
pub const NUM_RAW_ACCELERATION_PARAMETERS: usize = 4;

/// Class struct shared by every motor driver.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorState {
    /// Position in controller units.
    pub raw_position: f64,
    /// Target of the current or last move, controller units.
    pub raw_destination: f64,
    /// User units per controller unit.
    pub scale: f64,
    /// User position at raw zero.
    pub offset: f64,
    /// Positive software limit, user units.
    pub positive_limit: f64,
    /// Negative software limit, user units.
    pub negative_limit: f64,
    /// Move speed, user units per second.
    pub speed: f64,
    /// Starting speed of a ramp, user units per second.
    pub base_speed: f64,
    /// Upper bound for `speed`; zero means unbounded.
    pub maximum_speed: f64,
    /// Ramp time to full speed, seconds.
    pub acceleration_time: f64,
    /// Controller-specific acceleration settings.
    pub raw_acceleration_parameters: [f64; NUM_RAW_ACCELERATION_PARAMETERS],
    /// Direction of the last home search.
    pub home_search: i64,
    /// Servo loop engaged.
    pub closed_loop: bool,
    /// Axis powered and accepting moves.
    pub axis_enable: bool,
    /// [`status`] bits from the last status read.
    pub status: u64,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            raw_position: 0.0,
            raw_destination: 0.0,
            scale: 1.0,
            offset: 0.0,
            positive_limit: f64::MAX,
            negative_limit: f64::MIN,
            speed: 1.0,
            base_speed: 0.0,
            maximum_speed: 0.0,
            acceleration_time: 0.0,
            raw_acceleration_parameters: [0.0; NUM_RAW_ACCELERATION_PARAMETERS],
            home_search: 0,
            closed_loop: true,
            axis_enable: true,
            status: 0,
            busy: false,
            busy_start: BusyStart::default(),
        }
    }
}

impl MotorState {
    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        const OP: &str = "motor_create_record_structures";
        let base = MotorState::default();
        let state = MotorState {
            scale: assignments.f64_or("scale", base.scale)?,
            offset: assignments.f64_or("offset", base.offset)?,
            positive_limit: assignments.f64_or("positive_limit", base.positive_limit)?,
            negative_limit: assignments.f64_or("negative_limit", base.negative_limit)?,
            speed: assignments.f64_or("speed", base.speed)?,
            base_speed: assignments.f64_or("base_speed", base.base_speed)?,
            maximum_speed: assignments.f64_or("maximum_speed", base.maximum_speed)?,
            acceleration_time: assignments.f64_or("acceleration_time", base.acceleration_time)?,
            busy_start: BusyStart::new(
                assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?,
            ),
            ..base
        };
        if state.scale == 0.0 || !state.scale.is_finite() {
            return Err(MxError::illegal_argument(OP, "motor scale must be finite and non-zero"));
        }
        if state.negative_limit > state.positive_limit {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "negative limit {} is above positive limit {}",
                    state.negative_limit, state.positive_limit
                ),
            ));
        }
        Ok(state)
    }

    /// `raw_position` in user units.
    pub fn user_position(&self) -> f64 {
        self.raw_position * self.scale + self.offset
    }

    /// `raw_destination` in user units.
    pub fn user_destination(&self) -> f64 {
        self.raw_destination * self.scale + self.offset
    }

    /// Controller units corresponding to the user position `user`.
    pub fn raw_from_user(&self, user: f64) -> f64 {
        (user - self.offset) / self.scale
    }
}

/// Operations a motor driver provides.
pub trait MotorDriver: RecordDriver {
    /// Start a move to a raw destination.
    fn move_absolute(&mut self, state: &mut MotorState, raw_destination: f64) -> MxResult<()>;

    /// Refresh `state.raw_position`. The default trusts the cached value.
    fn get_position(&mut self, _state: &mut MotorState) -> MxResult<()> {
        Ok(())
    }

    /// Redefine the current raw position without moving.
    fn set_position(&mut self, state: &mut MotorState, raw_position: f64) -> MxResult<()> {
        state.raw_position = raw_position;
        Ok(())
    }

    /// Stop the move, decelerating normally.
    fn soft_abort(&mut self, state: &mut MotorState) -> MxResult<()>;

    /// Stop the move as fast as possible. Defaults to a soft abort.
    fn immediate_abort(&mut self, state: &mut MotorState) -> MxResult<()> {
        self.soft_abort(state)
    }

    /// Busy as reported by the device.
    fn busy(&mut self, state: &mut MotorState) -> MxResult<bool>;

    /// Start a home search. Unsupported unless overridden.
    fn find_home(&mut self, _state: &mut MotorState, _direction: i64) -> MxResult<()> {
        Err(MxError::unsupported(
            "motor_find_home",
            "driver does not support home searches",
        ))
    }

    /// Status bits. The default derives them from `busy` and the limits.
    fn get_status(&mut self, state: &mut MotorState) -> MxResult<u64> {
        let mut bits = 0;
        if self.busy(state)? {
            bits |= status::IS_BUSY;
        }
        let position = state.user_position();
        if position >= state.positive_limit {
            bits |= status::POSITIVE_LIMIT_HIT;
        }
        if position <= state.negative_limit {
            bits |= status::NEGATIVE_LIMIT_HIT;
        }
        if !state.axis_enable {
            bits |= status::AXIS_DISABLED;
        }
        Ok(bits)
    }

    /// Refresh position and status together.
    fn get_extended_status(&mut self, state: &mut MotorState) -> MxResult<()> {
        self.get_position(state)?;
        state.status = self.get_status(state)?;
        Ok(())
    }

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut MotorState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut MotorState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// Motor class struct and its driver.
pub struct MotorBody {
    /// Class-level state.
    pub state: MotorState,
    /// Hardware driver.
    pub driver: Box<dyn MotorDriver>,
}

impl MotorBody {
    /// Pair `state` with `driver`.
    pub fn new(state: MotorState, driver: Box<dyn MotorDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Motor, MotorBody);

/// Class-level parameter reads, for drivers that override only a few.
pub fn default_get_parameter_handler(
    state: &mut MotorState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    let value = match parameter {
        ParameterType::Speed => ParameterValue::Double(state.speed),
        ParameterType::BaseSpeed => ParameterValue::Double(state.base_speed),
        ParameterType::MaximumSpeed => ParameterValue::Double(state.maximum_speed),
        ParameterType::AccelerationTime => ParameterValue::Double(state.acceleration_time),
        ParameterType::RawAccelerationParameters => {
            ParameterValue::DoubleArray(state.raw_acceleration_parameters.to_vec())
        }
        ParameterType::HomeSearch => ParameterValue::Long(state.home_search),
        ParameterType::ClosedLoop => ParameterValue::Bool(state.closed_loop),
        ParameterType::AxisEnable => ParameterValue::Bool(state.axis_enable),
        other => {
            return Err(unsupported_parameter(
                "motor_get_parameter",
                RecordClass::Motor,
                other,
            ))
        }
    };
    Ok(value)
}

/// Class-level parameter writes with range checks.
pub fn default_set_parameter_handler(
    state: &mut MotorState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "motor_set_parameter";
    match parameter {
        ParameterType::Speed => {
            let speed = value.as_f64()?;
            if speed < 0.0 || speed.is_nan() {
                return Err(MxError::illegal_argument(OP, format!("speed {} is negative", speed)));
            }
            if state.maximum_speed > 0.0 && speed > state.maximum_speed {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "speed {} exceeds maximum speed {}",
                        speed, state.maximum_speed
                    ),
                ));
            }
            state.speed = speed;
        }
        ParameterType::BaseSpeed => state.base_speed = value.as_f64()?,
        ParameterType::MaximumSpeed => state.maximum_speed = value.as_f64()?,
        ParameterType::AccelerationTime => {
            let time = value.as_f64()?;
            if time < 0.0 || time.is_nan() {
                return Err(MxError::illegal_argument(
                    OP,
                    format!("acceleration time {} is negative", time),
                ));
            }
            state.acceleration_time = time;
        }
        ParameterType::RawAccelerationParameters => {
            let values = value.as_f64_array()?;
            if values.len() > NUM_RAW_ACCELERATION_PARAMETERS {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "{} acceleration parameters given, at most {} are used",
                        values.len(),
                        NUM_RAW_ACCELERATION_PARAMETERS
                    ),
                ));
            }
            state.raw_acceleration_parameters = [0.0; NUM_RAW_ACCELERATION_PARAMETERS];
            state.raw_acceleration_parameters[..values.len()].copy_from_slice(values);
        }
        ParameterType::HomeSearch => state.home_search = value.as_i64()?,
        ParameterType::ClosedLoop => state.closed_loop = value.as_bool()?,
        ParameterType::AxisEnable => state.axis_enable = value.as_bool()?,
        other => return Err(unsupported_parameter(OP, RecordClass::Motor, other)),
    }
    Ok(())
}

// =============================================================================
// Class API
// =============================================================================

fn move_absolute_locked(
    motor: &mut MotorBody,
    ctx: &RecordContext<'_>,
    destination: f64,
) -> MxResult<()> {
    const OP: &str = "motor_move_absolute";
    let state = &mut motor.state;
    if !destination.is_finite() {
        return Err(MxError::illegal_argument(
            OP,
            format!("destination {} is not finite", destination),
        ));
    }
    if destination > state.positive_limit || destination < state.negative_limit {
        return Err(MxError::new(
            ErrorKind::LimitExceeded,
            OP,
            format!(
                "destination {} for '{}' is outside the software limits [{}, {}]",
                destination, ctx.name, state.negative_limit, state.positive_limit
            ),
        ));
    }
    let raw = state.raw_from_user(destination);
    let issued = ctx.clock.now();
    motor.driver.move_absolute(state, raw)?;
    state.raw_destination = raw;
    state.busy_start.record_start(issued);
    state.busy = true;
    Ok(())
}

fn position_locked(motor: &mut MotorBody) -> MxResult<f64> {
    motor.driver.get_position(&mut motor.state)?;
    Ok(motor.state.user_position())
}

fn is_busy_locked(motor: &mut MotorBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = motor.driver.busy(&mut motor.state)?;
    let busy = motor.state.busy_start.apply(ctx.name, reported, ctx.clock.now());
    if motor.state.busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    motor.state.busy = busy;
    Ok(busy)
}

fn status_locked(motor: &mut MotorBody, ctx: &RecordContext<'_>) -> MxResult<u64> {
    let mut bits = motor.driver.get_status(&mut motor.state)?;
    if bits & status::IS_BUSY == 0
        && motor
            .state
            .busy_start
            .apply(ctx.name, false, ctx.clock.now())
    {
        bits |= status::IS_BUSY;
    }
    motor.state.status = bits;
    motor.state.busy = bits & status::IS_BUSY != 0;
    Ok(bits)
}

fn extended_status_locked(motor: &mut MotorBody, ctx: &RecordContext<'_>) -> MxResult<(f64, u64)> {
    motor.driver.get_extended_status(&mut motor.state)?;
    let mut bits = motor.state.status;
    if bits & status::IS_BUSY == 0
        && motor
            .state
            .busy_start
            .apply(ctx.name, false, ctx.clock.now())
    {
        bits |= status::IS_BUSY;
    }
    motor.state.status = bits;
    Ok((motor.state.user_position(), bits))
}

/// Move to a destination in user units.
pub fn motor_move_absolute(record: &Record, destination: f64) -> MxResult<()> {
    with_record(record, "motor_move_absolute", |motor, ctx| {
        move_absolute_locked(motor, ctx, destination)
    })
}

/// Move by `delta` user units from the current position.
pub fn motor_move_relative(record: &Record, delta: f64) -> MxResult<()> {
    with_record(record, "motor_move_relative", |motor, ctx| {
        let current = position_locked(motor)?;
        move_absolute_locked(motor, ctx, current + delta)
    })
}

/// Current position in user units.
pub fn motor_get_position(record: &Record) -> MxResult<f64> {
    with_record(record, "motor_get_position", |motor, _| position_locked(motor))
}

/// Redefine the current position in user units.
pub fn motor_set_position(record: &Record, position: f64) -> MxResult<()> {
    with_record(record, "motor_set_position", |motor, _| {
        let raw = motor.state.raw_from_user(position);
        motor.driver.set_position(&mut motor.state, raw)
    })
}

/// Stop the move, decelerating normally.
pub fn motor_soft_abort(record: &Record) -> MxResult<()> {
    with_record(record, "motor_soft_abort", |motor, _| {
        motor.driver.soft_abort(&mut motor.state)
    })
}

/// Stop the move as fast as possible.
pub fn motor_immediate_abort(record: &Record) -> MxResult<()> {
    with_record(record, "motor_immediate_abort", |motor, _| {
        motor.driver.immediate_abort(&mut motor.state)
    })
}

/// Busy with the busy-start override applied.
pub fn motor_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "motor_is_busy", is_busy_locked)
}

/// Start a home search. Positive directions search towards the positive limit.
pub fn motor_find_home(record: &Record, direction: i64) -> MxResult<()> {
    with_record(record, "motor_find_home", |motor, ctx| {
        let issued = ctx.clock.now();
        motor.driver.find_home(&mut motor.state, direction)?;
        motor.state.home_search = direction;
        motor.state.busy_start.record_start(issued);
        motor.state.busy = true;
        Ok(())
    })
}

/// [`status`] bits.
pub fn motor_get_status(record: &Record) -> MxResult<u64> {
    with_record(record, "motor_get_status", status_locked)
}

/// Position in user units together with the status bits.
pub fn motor_get_extended_status(record: &Record) -> MxResult<(f64, u64)> {
    with_record(record, "motor_get_extended_status", extended_status_locked)
}

/// Read one parameter through the driver.
pub fn motor_get_parameter(record: &Record, parameter: ParameterType) -> MxResult<ParameterValue> {
    with_record(record, "motor_get_parameter", |motor, _| {
        motor.driver.get_parameter(&mut motor.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn motor_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "motor_set_parameter", |motor, _| {
        motor.driver.set_parameter(&mut motor.state, parameter, value)
    })
}

/// Speed in user units per second.
pub fn motor_get_speed(record: &Record) -> MxResult<f64> {
    motor_get_parameter(record, ParameterType::Speed)?.as_f64()
}

/// Set the speed in user units per second.
pub fn motor_set_speed(record: &Record, speed: f64) -> MxResult<()> {
    motor_set_parameter(record, ParameterType::Speed, ParameterValue::Double(speed))
}

// =============================================================================
// Field table
// =============================================================================

fn state(body: &mut RecordBody) -> MxResult<&mut MotorState> {
    Ok(&mut class_body(body.class_mut(), "motor_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "motor_get_parameter", |motor, _| {
        motor
            .driver
            .get_parameter(&mut motor.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "motor_set_parameter", |motor, _| {
        motor.driver.set_parameter(&mut motor.state, parameter, value)
    })
}

/// "position status" with the status in hex, as served to network clients.
pub fn format_extended_status(position: f64, bits: u64) -> String {
    format!("{} {:x}", position, bits)
}

/// Field table of the motor class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("scale", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.scale))
        })
        .in_description(),
        FieldDescriptor::class("offset", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.offset))
        })
        .with_setter(|b, v| {
            state(b)?.offset = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("positive_limit", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.positive_limit))
        })
        .with_setter(|b, v| {
            state(b)?.positive_limit = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("negative_limit", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.negative_limit))
        })
        .with_setter(|b, v| {
            state(b)?.negative_limit = v.as_f64()?;
            Ok(())
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
        FieldDescriptor::class("speed", FieldType::Double, |b| {
            param_get(b, ParameterType::Speed, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::Speed, v))
        .in_description(),
        FieldDescriptor::class("base_speed", FieldType::Double, |b| {
            param_get(b, ParameterType::BaseSpeed, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::BaseSpeed, v))
        .in_description(),
        FieldDescriptor::class("maximum_speed", FieldType::Double, |b| {
            param_get(b, ParameterType::MaximumSpeed, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::MaximumSpeed, v))
        .in_description(),
        FieldDescriptor::class("acceleration_time", FieldType::Double, |b| {
            param_get(b, ParameterType::AccelerationTime, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::AccelerationTime, v))
        .in_description(),
        FieldDescriptor::class("raw_acceleration_parameters", FieldType::Double, |b| {
            param_get(b, ParameterType::RawAccelerationParameters, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::RawAccelerationParameters, v))
        .with_dimensions(&[Dimension::Fixed(NUM_RAW_ACCELERATION_PARAMETERS)]),
        FieldDescriptor::class("closed_loop", FieldType::Bool, |b| {
            param_get(b, ParameterType::ClosedLoop, FieldType::Bool)
        })
        .with_setter(|b, v| param_set(b, ParameterType::ClosedLoop, v)),
        FieldDescriptor::class("axis_enable", FieldType::Bool, |b| {
            param_get(b, ParameterType::AxisEnable, FieldType::Bool)
        })
        .with_setter(|b, v| param_set(b, ParameterType::AxisEnable, v)),
        FieldDescriptor::class("position", FieldType::Double, |b| {
            locked(b, "motor_get_position", |m, _| position_locked(m)).map(FieldValue::double)
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("raw_position", FieldType::Double, |b| {
            locked(b, "motor_get_position", |m, _| {
                m.driver.get_position(&mut m.state)?;
                Ok(FieldValue::double(m.state.raw_position))
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("destination", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.user_destination()))
        })
        .with_setter(|b, v| {
            let destination = v.as_f64()?;
            locked(b, "motor_move_absolute", |m, ctx| {
                move_absolute_locked(m, ctx, destination)
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("set_position", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.user_position()))
        })
        .with_setter(|b, v| {
            let position = v.as_f64()?;
            locked(b, "motor_set_position", |m, _| {
                let raw = m.state.raw_from_user(position);
                m.driver.set_position(&mut m.state, raw)
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("status", FieldType::Hex, |b| {
            locked(b, "motor_get_status", status_locked).map(FieldValue::hex)
        })
        .with_flags(runtime),
        FieldDescriptor::class("extended_status", FieldType::String, |b| {
            locked(b, "motor_get_extended_status", extended_status_locked)
                .map(|(position, bits)| FieldValue::string(format_extended_status(position, bits)))
        })
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "motor_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime),
        FieldDescriptor::class("home_search", FieldType::Long, |b| {
            param_get(b, ParameterType::HomeSearch, FieldType::Long)
        })
        .with_setter(|b, v| {
            let direction = v.as_i64()?;
            locked(b, "motor_find_home", |m, ctx| {
                let issued = ctx.clock.now();
                m.driver.find_home(&mut m.state, direction)?;
                m.state.home_search = direction;
                m.state.busy_start.record_start(issued);
                m.state.busy = true;
                Ok(())
            })
        })
        .with_flags(runtime),
        FieldDescriptor::class("soft_abort", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "motor_soft_abort", |m, _| m.driver.soft_abort(&mut m.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("immediate_abort", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "motor_immediate_abort", |m, _| {
                        m.driver.immediate_abort(&mut m.state)
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

    #[test]
    fn user_units_apply_scale_and_offset() {
        let state = MotorState {
            raw_position: 200.0,
            scale: 0.5,
            offset: -10.0,
            ..MotorState::default()
        };
        assert_eq!(state.user_position(), 90.0);
        assert_eq!(state.raw_from_user(90.0), 200.0);
    }

    #[test]
    fn speed_above_maximum_is_rejected() {
        let mut state = MotorState {
            maximum_speed: 100.0,
            ..MotorState::default()
        };
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::Speed,
            ParameterValue::Double(150.0),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(state.speed, 1.0);
    }

    #[test]
    fn raw_acceleration_parameters_are_padded() {
        let mut state = MotorState::default();
        default_set_parameter_handler(
            &mut state,
            ParameterType::RawAccelerationParameters,
            ParameterValue::DoubleArray(vec![1.0, 2.0]),
        )
        .unwrap();
        assert_eq!(state.raw_acceleration_parameters, [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn extended_status_format_splits_into_two_tokens() {
        let text = format_extended_status(12.5, status::IS_BUSY | status::ERROR);
        let tokens: Vec<_> = text.split_whitespace().collect();
        assert_eq!(tokens, vec!["12.5", "8001"]);
    }
}
