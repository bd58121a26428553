//! Software-only reference drivers.
//!
//! No hardware behind them: motion and acquisition complete after a
//! configurable number of busy polls (`busy_polls`, default 0: immediately),
//! which keeps their timing deterministic under test.

use tracing::debug;

use crate::device::autoscale::{AutoscaleBody, AutoscaleDriver, AutoscaleState};
use crate::device::mca::{McaBody, McaDriver, McaState};
use crate::device::mce::{MceBody, MceDriver, MceState};
use crate::device::motor::{status, MotorBody, MotorDriver, MotorState};
use crate::device::pulse_generator::{
    PulseGeneratorBody, PulseGeneratorDriver, PulseGeneratorState, CONTINUOUS,
};
use crate::device::scaler::{ScalerBody, ScalerDriver, ScalerState, SCALER_MODE_PRESET_COUNT};
use crate::device::timer::{TimerBody, TimerDriver, TimerState};
use crate::error::{MxError, MxResult};
use crate::field::{FieldDescriptor, FieldType, FieldValue};
use crate::record::{ClassBody, CreateContext, DriverFactory, RecordClass, RecordDriver};

/// Counts down busy polls after a start.
#[derive(Debug, Clone, Copy, Default)]
struct PollCountdown {
    per_start: u64,
    remaining: u64,
}

impl PollCountdown {
    fn new(per_start: u64) -> Self {
        Self {
            per_start,
            remaining: 0,
        }
    }

    /// Arm for a new start. Returns true if the action completes at once.
    fn arm(&mut self) -> bool {
        self.remaining = self.per_start;
        self.per_start == 0
    }

    /// One busy poll. Returns `(busy, finished_now)`.
    fn poll(&mut self) -> (bool, bool) {
        if self.remaining == 0 {
            return (false, false);
        }
        self.remaining -= 1;
        (true, self.remaining == 0)
    }

    fn cancel(&mut self) {
        self.remaining = 0;
    }

    fn is_running(&self) -> bool {
        self.remaining > 0
    }
}

fn busy_polls_field() -> FieldDescriptor {
    FieldDescriptor::driver("busy_polls", FieldType::ULong).in_description()
}

fn busy_polls(ctx: &CreateContext<'_>) -> MxResult<u64> {
    Ok(ctx.assignments.usize_or("busy_polls", 0)? as u64)
}

fn no_field(operation: &'static str, name: &str) -> MxError {
    MxError::not_found(operation, format!("driver has no field '{}'", name))
}

// =============================================================================
// soft_motor
// =============================================================================

struct SoftMotor {
    countdown: PollCountdown,
    target: f64,
    homing: bool,
    homed: bool,
}

impl RecordDriver for SoftMotor {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "busy_polls" => Ok(FieldValue::ulong(self.countdown.per_start)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "busy_polls" => self.countdown.per_start = value.as_u64()?,
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl SoftMotor {
    fn arrive(&mut self, state: &mut MotorState) {
        state.raw_position = self.target;
        if self.homing {
            self.homing = false;
            self.homed = true;
        }
    }
}

impl MotorDriver for SoftMotor {
    fn move_absolute(&mut self, state: &mut MotorState, raw_destination: f64) -> MxResult<()> {
        self.target = raw_destination;
        self.homing = false;
        if self.countdown.arm() {
            self.arrive(state);
        }
        Ok(())
    }

    fn soft_abort(&mut self, state: &mut MotorState) -> MxResult<()> {
        self.countdown.cancel();
        self.homing = false;
        self.target = state.raw_position;
        Ok(())
    }

    fn busy(&mut self, state: &mut MotorState) -> MxResult<bool> {
        let (busy, finished) = self.countdown.poll();
        if finished {
            self.arrive(state);
        }
        Ok(busy)
    }

    fn find_home(&mut self, state: &mut MotorState, direction: i64) -> MxResult<()> {
        debug!(direction, "soft motor home search");
        self.target = 0.0;
        self.homing = true;
        self.homed = false;
        if self.countdown.arm() {
            self.arrive(state);
        }
        Ok(())
    }

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
        if self.homed {
            bits |= status::HOME_SEARCH_SUCCEEDED;
        }
        if !state.axis_enable {
            bits |= status::AXIS_DISABLED;
        }
        Ok(bits)
    }
}

/// Builds `soft_motor` records.
pub struct SoftMotorFactory;

impl DriverFactory for SoftMotorFactory {
    fn driver_type(&self) -> &'static str {
        "soft_motor"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Motor
    }

    fn description(&self) -> &'static str {
        "simulated motor"
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![busy_polls_field()]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = MotorState::from_description(ctx.assignments, ctx.defaults)?;
        let driver = SoftMotor {
            countdown: PollCountdown::new(busy_polls(ctx)?),
            target: state.raw_position,
            homing: false,
            homed: false,
        };
        Ok(ClassBody::Motor(MotorBody::new(state, Box::new(driver))))
    }
}

// =============================================================================
// soft_mca
// =============================================================================

/// Adds `counts_per_poll` to every active channel on each busy poll
/// (once per start when `busy_polls` is 0), saturating at `u32::MAX`.
struct SoftMca {
    countdown: PollCountdown,
    counts_per_poll: u32,
}

impl SoftMca {
    fn accumulate(&self, state: &mut McaState) {
        let active = state.current_num_channels.min(state.channel_array.len());
        for channel in &mut state.channel_array[..active] {
            *channel = channel.saturating_add(self.counts_per_poll);
        }
    }

    fn finish(&self, state: &mut McaState) {
        state.real_time += state.preset_real_time;
        state.live_time += state.preset_live_time;
    }
}

impl RecordDriver for SoftMca {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "busy_polls" => Ok(FieldValue::ulong(self.countdown.per_start)),
            "counts_per_poll" => Ok(FieldValue::uint(self.counts_per_poll)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "busy_polls" => self.countdown.per_start = value.as_u64()?,
            "counts_per_poll" => {
                self.counts_per_poll = u32::try_from(value.as_u64()?).unwrap_or(u32::MAX)
            }
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl McaDriver for SoftMca {
    fn start(&mut self, state: &mut McaState) -> MxResult<()> {
        if self.countdown.arm() {
            self.accumulate(state);
            self.finish(state);
        }
        Ok(())
    }

    fn stop(&mut self, _state: &mut McaState) -> MxResult<()> {
        self.countdown.cancel();
        Ok(())
    }

    fn read(&mut self, _state: &mut McaState) -> MxResult<()> {
        Ok(())
    }

    fn busy(&mut self, state: &mut McaState) -> MxResult<bool> {
        let (busy, finished) = self.countdown.poll();
        if busy {
            self.accumulate(state);
        }
        if finished {
            self.finish(state);
        }
        Ok(busy)
    }
}

/// Builds `soft_mca` records.
pub struct SoftMcaFactory;

impl DriverFactory for SoftMcaFactory {
    fn driver_type(&self) -> &'static str {
        "soft_mca"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Mca
    }

    fn description(&self) -> &'static str {
        "simulated multichannel analyzer"
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![
            busy_polls_field(),
            FieldDescriptor::driver("counts_per_poll", FieldType::UInt).in_description(),
        ]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = McaState::from_description(ctx.assignments, ctx.defaults)?;
        let counts = ctx.assignments.usize_or("counts_per_poll", 1)?;
        let driver = SoftMca {
            countdown: PollCountdown::new(busy_polls(ctx)?),
            counts_per_poll: u32::try_from(counts).unwrap_or(u32::MAX),
        };
        Ok(ClassBody::Mca(McaBody::new(state, Box::new(driver))))
    }
}

// =============================================================================
// soft_mce
// =============================================================================

/// Records `num_measurements` values `0, step, 2 * step, ..` per start.
struct SoftMce {
    step: f64,
}

impl RecordDriver for SoftMce {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "step" => Ok(FieldValue::double(self.step)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "step" => self.step = value.as_f64()?,
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl MceDriver for SoftMce {
    fn start(&mut self, state: &mut MceState) -> MxResult<()> {
        let count = (state.num_measurements as usize).min(state.value_array.len());
        for (i, value) in state.value_array.iter_mut().take(count).enumerate() {
            *value = i as f64 * self.step;
        }
        state.current_num_values = count;
        Ok(())
    }

    fn stop(&mut self, _state: &mut MceState) -> MxResult<()> {
        Ok(())
    }

    fn busy(&mut self, _state: &mut MceState) -> MxResult<bool> {
        Ok(false)
    }

    fn read(&mut self, _state: &mut MceState) -> MxResult<()> {
        Ok(())
    }
}

/// Builds `soft_mce` records.
pub struct SoftMceFactory;

impl DriverFactory for SoftMceFactory {
    fn driver_type(&self) -> &'static str {
        "soft_mce"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Mce
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![FieldDescriptor::driver("step", FieldType::Double).in_description()]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = MceState::from_description(ctx.assignments, ctx.defaults)?;
        let driver = SoftMce {
            step: ctx.assignments.f64_or("step", 1.0)?,
        };
        Ok(ClassBody::Mce(MceBody::new(state, Box::new(driver))))
    }
}

// =============================================================================
// soft_scaler
// =============================================================================

/// A counter whose `counts` can be written directly. A timed start adds
/// `count_rate * seconds`; a preset-count start sets the count to the preset.
struct SoftScaler {
    counts: i64,
    count_rate: f64,
}

impl RecordDriver for SoftScaler {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "counts" => Ok(FieldValue::long(self.counts)),
            "count_rate" => Ok(FieldValue::double(self.count_rate)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "counts" => self.counts = value.as_i64()?,
            "count_rate" => self.count_rate = value.as_f64()?,
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl ScalerDriver for SoftScaler {
    fn clear(&mut self, _state: &mut ScalerState) -> MxResult<()> {
        self.counts = 0;
        Ok(())
    }

    fn read(&mut self, state: &mut ScalerState) -> MxResult<()> {
        state.raw_value = self.counts;
        Ok(())
    }

    fn start(&mut self, state: &mut ScalerState, preset: f64) -> MxResult<()> {
        if state.mode == SCALER_MODE_PRESET_COUNT {
            self.counts = preset.round() as i64;
        } else {
            self.counts = self
                .counts
                .saturating_add((self.count_rate * preset).round() as i64);
        }
        Ok(())
    }

    fn stop(&mut self, _state: &mut ScalerState) -> MxResult<()> {
        Ok(())
    }
}

/// Builds `soft_scaler` records.
pub struct SoftScalerFactory;

impl DriverFactory for SoftScalerFactory {
    fn driver_type(&self) -> &'static str {
        "soft_scaler"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Scaler
    }

    fn description(&self) -> &'static str {
        "simulated scaler"
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::driver("counts", FieldType::Long).in_description(),
            FieldDescriptor::driver("count_rate", FieldType::Double).in_description(),
        ]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = ScalerState::from_description(ctx.assignments, ctx.defaults)?;
        let counts = match ctx.assignments.get("counts") {
            Some(value) => value.as_i64()?,
            None => 0,
        };
        let driver = SoftScaler {
            counts,
            count_rate: ctx.assignments.f64_or("count_rate", 0.0)?,
        };
        Ok(ClassBody::Scaler(ScalerBody::new(state, Box::new(driver))))
    }
}

// =============================================================================
// soft_timer
// =============================================================================

struct SoftTimer {
    countdown: PollCountdown,
    preset: f64,
}

impl RecordDriver for SoftTimer {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "busy_polls" => Ok(FieldValue::ulong(self.countdown.per_start)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "busy_polls" => self.countdown.per_start = value.as_u64()?,
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl TimerDriver for SoftTimer {
    fn start(&mut self, state: &mut TimerState, seconds: f64) -> MxResult<()> {
        self.preset = seconds;
        state.value = 0.0;
        if self.countdown.arm() {
            state.value = seconds;
        }
        Ok(())
    }

    fn stop(&mut self, _state: &mut TimerState) -> MxResult<()> {
        self.countdown.cancel();
        Ok(())
    }

    fn busy(&mut self, state: &mut TimerState) -> MxResult<bool> {
        let (busy, finished) = self.countdown.poll();
        if finished {
            state.value = self.preset;
        }
        Ok(busy)
    }
}

/// Builds `soft_timer` records.
pub struct SoftTimerFactory;

impl DriverFactory for SoftTimerFactory {
    fn driver_type(&self) -> &'static str {
        "soft_timer"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Timer
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![busy_polls_field()]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = TimerState::from_description(ctx.assignments, ctx.defaults)?;
        let driver = SoftTimer {
            countdown: PollCountdown::new(busy_polls(ctx)?),
            preset: 0.0,
        };
        Ok(ClassBody::Timer(TimerBody::new(state, Box::new(driver))))
    }
}

// =============================================================================
// soft_pulser
// =============================================================================

/// Finite pulse trains end after `busy_polls` polls; continuous trains
/// (`num_pulses = 0`) run until stopped.
struct SoftPulser {
    countdown: PollCountdown,
    continuous: bool,
}

impl RecordDriver for SoftPulser {
    fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
        match name {
            "busy_polls" => Ok(FieldValue::ulong(self.countdown.per_start)),
            other => Err(no_field("read_type_field", other)),
        }
    }

    fn write_type_field(&mut self, name: &str, value: FieldValue) -> MxResult<()> {
        match name {
            "busy_polls" => self.countdown.per_start = value.as_u64()?,
            other => return Err(no_field("write_type_field", other)),
        }
        Ok(())
    }
}

impl PulseGeneratorDriver for SoftPulser {
    fn start(&mut self, state: &mut PulseGeneratorState) -> MxResult<()> {
        self.continuous = state.num_pulses == CONTINUOUS;
        self.countdown.arm();
        Ok(())
    }

    fn stop(&mut self, _state: &mut PulseGeneratorState) -> MxResult<()> {
        self.continuous = false;
        self.countdown.cancel();
        Ok(())
    }

    fn busy(&mut self, _state: &mut PulseGeneratorState) -> MxResult<bool> {
        if self.continuous {
            return Ok(true);
        }
        let running = self.countdown.is_running();
        self.countdown.poll();
        Ok(running)
    }
}

/// Builds `soft_pulser` records.
pub struct SoftPulserFactory;

impl DriverFactory for SoftPulserFactory {
    fn driver_type(&self) -> &'static str {
        "soft_pulser"
    }

    fn class(&self) -> RecordClass {
        RecordClass::PulseGenerator
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        vec![busy_polls_field()]
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = PulseGeneratorState::from_description(ctx.assignments, ctx.defaults)?;
        let driver = SoftPulser {
            countdown: PollCountdown::new(busy_polls(ctx)?),
            continuous: false,
        };
        Ok(ClassBody::PulseGenerator(PulseGeneratorBody::new(
            state,
            Box::new(driver),
        )))
    }
}

// =============================================================================
// scaler_autoscale
// =============================================================================

/// Autoscale on a scaler monitor that steps the offset index. Everything is
/// the class default.
struct ScalerAutoscale;

impl RecordDriver for ScalerAutoscale {}

impl AutoscaleDriver for ScalerAutoscale {}

/// Builds `scaler_autoscale` records.
pub struct ScalerAutoscaleFactory;

impl DriverFactory for ScalerAutoscaleFactory {
    fn driver_type(&self) -> &'static str {
        "scaler_autoscale"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Autoscale
    }

    fn description(&self) -> &'static str {
        "autoscale driven by a scaler monitor"
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = AutoscaleState::from_description(ctx.assignments)?;
        Ok(ClassBody::Autoscale(AutoscaleBody::new(
            state,
            Box::new(ScalerAutoscale),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{mca, motor, pulse_generator, scaler, timer};
    use crate::record::RecordList;

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    #[test]
    fn countdown_reports_busy_for_each_poll() {
        let mut countdown = PollCountdown::new(2);
        assert!(!countdown.arm());
        assert_eq!(countdown.poll(), (true, false));
        assert_eq!(countdown.poll(), (true, true));
        assert_eq!(countdown.poll(), (false, false));
    }

    #[test]
    fn motor_arrives_after_its_busy_polls() {
        let list = RecordList::new();
        let m = list
            .create_record("m1", "soft_motor", &table("busy_polls = 1"))
            .unwrap();
        motor::motor_move_absolute(&m, 5.0).unwrap();
        assert_eq!(motor::motor_get_position(&m).unwrap(), 0.0);
        assert!(motor::motor_is_busy(&m).unwrap());
        assert_eq!(motor::motor_get_position(&m).unwrap(), 5.0);
        assert!(!motor::motor_is_busy(&m).unwrap());
    }

    #[test]
    fn home_search_sets_the_status_bit() {
        let list = RecordList::new();
        let m = list
            .create_record("m1", "soft_motor", &toml::Table::new())
            .unwrap();
        motor::motor_move_absolute(&m, 3.0).unwrap();
        motor::motor_find_home(&m, 1).unwrap();
        let bits = motor::motor_get_status(&m).unwrap();
        assert_ne!(bits & motor::status::HOME_SEARCH_SUCCEEDED, 0);
        assert_eq!(motor::motor_get_position(&m).unwrap(), 0.0);
    }

    #[test]
    fn mca_counts_saturate() {
        let list = RecordList::new();
        let m = list
            .create_record(
                "mca1",
                "soft_mca",
                &table("maximum_num_channels = 4\ncounts_per_poll = 4000000000"),
            )
            .unwrap();
        mca::mca_start(&m).unwrap();
        mca::mca_start(&m).unwrap();
        assert_eq!(mca::mca_read(&m).unwrap(), vec![u32::MAX; 4]);
    }

    #[test]
    fn scaler_counts_follow_the_mode() {
        let list = RecordList::new();
        let s = list
            .create_record("s1", "soft_scaler", &table("count_rate = 100.0"))
            .unwrap();
        scaler::scaler_start(&s, 2.0).unwrap();
        assert_eq!(scaler::scaler_read(&s).unwrap(), 200);
        scaler::scaler_clear(&s).unwrap();
        assert_eq!(scaler::scaler_read_raw(&s).unwrap(), 0);
    }

    #[test]
    fn timer_value_is_the_preset_once_done() {
        let list = RecordList::new();
        let t = list
            .create_record("t1", "soft_timer", &table("busy_polls = 1"))
            .unwrap();
        timer::timer_start(&t, 1.5).unwrap();
        assert!(timer::timer_is_busy(&t).unwrap());
        assert!(!timer::timer_is_busy(&t).unwrap());
        assert_eq!(timer::timer_read(&t).unwrap(), 1.5);
    }

    #[test]
    fn continuous_pulse_train_runs_until_stopped() {
        let list = RecordList::new();
        let p = list
            .create_record("p1", "soft_pulser", &table("pulse_period = 1.0\npulse_width = 0.5"))
            .unwrap();
        pulse_generator::pulse_generator_start(&p).unwrap();
        assert!(pulse_generator::pulse_generator_is_busy(&p).unwrap());
        assert!(pulse_generator::pulse_generator_is_busy(&p).unwrap());
        pulse_generator::pulse_generator_stop(&p).unwrap();
        assert!(!pulse_generator::pulse_generator_is_busy(&p).unwrap());
    }
}
