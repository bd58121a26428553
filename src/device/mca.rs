//! Multichannel analyzer class.
//!
//! An MCA accumulates counts into an array of channels. Regions of interest
//! (ROIs) are inclusive channel ranges whose integrals the class computes
//! from the channel array when the driver does not provide them.
//!
//! Busy tracking has one class-level side effect: when [`mca_is_busy`] sees
//! the record go from busy to idle it sets `new_data_available` and forces a
//! value-changed notification on that field, even if it was already true.

use tracing::warn;

use super::busy::BusyStart;
use super::{class_access, is_trigger, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{Dimension, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::field::{Elements, FieldAssignments};
use crate::parameter::{ParameterType, ParameterValue, Roi};
use crate::record::{Record, RecordBody, RecordClass, RecordContext, RecordDefaults, RecordDriver};

/// Readout preference: read the whole channel array.
pub const MCA_PREFER_READ_MCA: i64 = 1;
/// Readout preference: read only ROI integrals.
pub const MCA_PREFER_ROI_INTEGRALS: i64 = 2;
/// Returned when the driver (or an older server) has no preference.
pub const MCA_DEFAULT_READOUT_PREFERENCE: i64 = MCA_PREFER_READ_MCA;

/// What ends an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum McaPreset {
    /// Run until stopped.
    #[default]
    None,
    /// Stop after `preset_real_time` seconds of clock time.
    RealTime,
    /// Stop after `preset_live_time` seconds of live time.
    LiveTime,
    /// Stop after `preset_count` counts.
    Count,
}

impl McaPreset {
    /// Numeric code used by the `preset_type` field.
    pub fn code(&self) -> u64 {
        match self {
            McaPreset::None => 0,
            McaPreset::RealTime => 1,
            McaPreset::LiveTime => 2,
            McaPreset::Count => 3,
        }
    }

    /// Inverse of [`McaPreset::code`]; unknown codes are `IllegalArgument`.
    pub fn from_code(code: u64) -> MxResult<Self> {
        match code {
            0 => Ok(McaPreset::None),
            1 => Ok(McaPreset::RealTime),
            2 => Ok(McaPreset::LiveTime),
            3 => Ok(McaPreset::Count),
            other => Err(MxError::illegal_argument(
                "mca_preset",
                format!("unknown preset type {}", other),
            )),
        }
    }
}

/// Class struct shared by every MCA driver.
#[derive(Debug, Clone, PartialEq)]
pub struct McaState {
    /// Capacity of `channel_array`.
    pub maximum_num_channels: usize,
    /// Channels in use, `1..=maximum_num_channels`.
    pub current_num_channels: usize,
    /// Capacity of `roi_array`.
    pub maximum_num_rois: usize,
    /// ROIs in use, at most `maximum_num_rois`.
    pub current_num_rois: usize,
    /// Counts per channel from the last read.
    pub channel_array: Vec<u32>,
    /// Inclusive `[lower, upper]` channel bounds.
    pub roi_array: Vec<Roi>,
    /// Counts summed over each ROI.
    pub roi_integral_array: Vec<u32>,
    /// Channel selected by the `channel_number` parameter.
    pub channel_number: usize,
    /// Counts in `channel_number`.
    pub channel_value: u32,
    /// What ends the next acquisition.
    pub preset_type: McaPreset,
    /// Real-time preset in seconds.
    pub preset_real_time: f64,
    /// Live-time preset in seconds.
    pub preset_live_time: f64,
    /// Count preset.
    pub preset_count: u64,
    /// Elapsed real time of the acquisition, seconds.
    pub real_time: f64,
    /// Elapsed live time of the acquisition, seconds.
    pub live_time: f64,
    /// One of the `MCA_PREFER_*` constants.
    pub readout_preference: i64,
    /// Busy as last reported, override applied.
    pub busy: bool,
    /// Set when an acquisition finishes; cleared by [`mca_read`].
    pub new_data_available: bool,
    /// Busy-start override state.
    pub busy_start: BusyStart,
}

impl McaState {
    /// Idle state with every channel and ROI in use.
    pub fn new(maximum_num_channels: usize, maximum_num_rois: usize) -> Self {
        Self {
            maximum_num_channels,
            current_num_channels: maximum_num_channels,
            maximum_num_rois,
            current_num_rois: maximum_num_rois,
            channel_array: vec![0; maximum_num_channels],
            roi_array: vec![[0, 0]; maximum_num_rois],
            roi_integral_array: vec![0; maximum_num_rois],
            channel_number: 0,
            channel_value: 0,
            preset_type: McaPreset::None,
            preset_real_time: 0.0,
            preset_live_time: 0.0,
            preset_count: 0,
            real_time: 0.0,
            live_time: 0.0,
            readout_preference: MCA_DEFAULT_READOUT_PREFERENCE,
            busy: false,
            new_data_available: false,
            busy_start: BusyStart::default(),
        }
    }

    /// Build the class struct from a parsed record description.
    pub fn from_description(
        assignments: &FieldAssignments,
        defaults: &RecordDefaults,
    ) -> MxResult<Self> {
        const OP: &str = "mca_create_record_structures";

        let maximum_num_channels = assignments.require("maximum_num_channels")?.as_usize()?;
        if maximum_num_channels == 0 {
            return Err(MxError::illegal_argument(
                OP,
                "maximum_num_channels must be at least 1",
            ));
        }
        let maximum_num_rois = assignments.require("maximum_num_rois")?.as_usize()?;
        let mut state = Self::new(maximum_num_channels, maximum_num_rois);

        state.current_num_channels =
            assignments.usize_or("current_num_channels", maximum_num_channels)?;
        if state.current_num_channels == 0 || state.current_num_channels > maximum_num_channels {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "current_num_channels {} is outside 1..={}",
                    state.current_num_channels, maximum_num_channels
                ),
            ));
        }
        state.current_num_rois = assignments.usize_or("current_num_rois", maximum_num_rois)?;
        if state.current_num_rois > maximum_num_rois {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "current_num_rois {} exceeds maximum_num_rois {}",
                    state.current_num_rois, maximum_num_rois
                ),
            ));
        }
        state.busy_start =
            BusyStart::new(assignments.f64_or("busy_start_interval", defaults.busy_start_interval)?);

        if let Some(rois) = assignments.get("roi_array") {
            let flat = rois.as_u32_slice()?;
            for (index, pair) in flat.chunks_exact(2).enumerate().take(maximum_num_rois) {
                let roi = [pair[0], pair[1]];
                if roi[0] > roi[1] || roi[1] as usize >= state.current_num_channels {
                    return Err(MxError::illegal_argument(
                        OP,
                        format!("configured roi {} {:?} is out of range", index, roi),
                    ));
                }
                state.roi_array[index] = roi;
            }
        }
        Ok(state)
    }
}

/// Operations an MCA driver provides.
pub trait McaDriver: RecordDriver {
    /// Begin an acquisition with the current presets.
    fn start(&mut self, state: &mut McaState) -> MxResult<()>;

    /// Stop the acquisition in progress.
    fn stop(&mut self, state: &mut McaState) -> MxResult<()>;

    /// Refresh `state.channel_array` from the device.
    fn read(&mut self, state: &mut McaState) -> MxResult<()>;

    /// Zero the channel data, integrals and elapsed times.
    fn clear(&mut self, state: &mut McaState) -> MxResult<()> {
        state.channel_array.iter_mut().for_each(|c| *c = 0);
        state.roi_integral_array.iter_mut().for_each(|c| *c = 0);
        state.real_time = 0.0;
        state.live_time = 0.0;
        Ok(())
    }

    /// Busy as reported by the device. The class layer applies the
    /// busy-start override afterwards.
    fn busy(&mut self, state: &mut McaState) -> MxResult<bool>;

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut McaState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut McaState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// MCA class struct and its driver.
pub struct McaBody {
    /// Class-level state.
    pub state: McaState,
    /// Hardware driver.
    pub driver: Box<dyn McaDriver>,
}

impl McaBody {
    /// Pair `state` with `driver`.
    pub fn new(state: McaState, driver: Box<dyn McaDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Mca, McaBody);

// =============================================================================
// Default handlers
// =============================================================================

/// Sum of `channels[lo..=hi]`, saturating at `u32::MAX`.
pub fn roi_integral(channels: &[u32], roi: Roi) -> u32 {
    let [lo, hi] = roi;
    let mut sum: u32 = 0;
    for &count in channels
        .iter()
        .take(hi as usize + 1)
        .skip(lo as usize)
    {
        if count > u32::MAX - sum {
            return u32::MAX;
        }
        sum += count;
    }
    sum
}

fn check_roi_index(state: &McaState, index: usize, operation: &'static str) -> MxResult<()> {
    if index >= state.current_num_rois {
        return Err(MxError::illegal_argument(
            operation,
            format!(
                "roi {} requested but only {} rois are in use",
                index, state.current_num_rois
            ),
        ));
    }
    Ok(())
}

/// Store an ROI, clamping bad bounds before reporting them.
///
/// Bounds must lie in `[0, current_num_channels)` with `lo <= hi`. An upper
/// or lower bound at or past the last channel is clamped to it and reported as
/// `WouldExceedLimit`; an inverted range has `lo` clamped to `hi` and is
/// reported as `IllegalArgument`. The clamped ROI is stored either way.
fn store_roi(state: &mut McaState, index: usize, requested: Roi) -> MxResult<()> {
    const OP: &str = "mca_set_roi";
    check_roi_index(state, index, OP)?;

    let limit = u32::try_from(state.current_num_channels).unwrap_or(u32::MAX);
    if limit == 0 {
        return Err(MxError::illegal_argument(OP, "mca has no channels"));
    }
    let [mut lo, mut hi] = requested;
    let mut error = None;
    if hi >= limit {
        hi = limit - 1;
        error = Some(MxError::would_exceed_limit(
            OP,
            format!(
                "roi {} upper bound {} is beyond the last channel {}",
                index, requested[1], hi
            ),
        ));
    }
    if lo >= limit {
        lo = limit - 1;
        error.get_or_insert_with(|| {
            MxError::would_exceed_limit(
                OP,
                format!(
                    "roi {} lower bound {} is beyond the last channel {}",
                    index, requested[0], lo
                ),
            )
        });
    }
    if lo > hi {
        lo = hi;
        error.get_or_insert_with(|| {
            MxError::illegal_argument(
                OP,
                format!(
                    "roi {} lower bound {} is above upper bound {}",
                    index, requested[0], hi
                ),
            )
        });
    }
    state.roi_array[index] = [lo, hi];
    match error {
        Some(err) => {
            warn!(roi = index, requested = ?requested, stored = ?[lo, hi], "roi bounds clamped");
            Err(err)
        }
        None => Ok(()),
    }
}

/// Select the channel read by `ChannelValue`, clamping to the last channel.
fn store_channel_number(state: &mut McaState, channel: u64) -> MxResult<()> {
    let limit = state.current_num_channels as u64;
    if channel >= limit {
        let clamped = limit.saturating_sub(1);
        state.channel_number = clamped as usize;
        warn!(requested = channel, stored = clamped, "channel number clamped");
        return Err(MxError::would_exceed_limit(
            "mca_set_channel_number",
            format!(
                "channel {} is beyond the last channel {}",
                channel, clamped
            ),
        ));
    }
    state.channel_number = channel as usize;
    Ok(())
}

fn refresh_roi_integral(state: &mut McaState, index: usize) -> u32 {
    let active = state.current_num_channels.min(state.channel_array.len());
    let integral = roi_integral(&state.channel_array[..active], state.roi_array[index]);
    state.roi_integral_array[index] = integral;
    integral
}

/// Class default for `get_parameter`, computed from the class struct.
pub fn default_get_parameter_handler(
    state: &mut McaState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    const OP: &str = "mca_get_parameter";
    let value = match parameter {
        ParameterType::CurrentNumChannels => ParameterValue::ULong(state.current_num_channels as u64),
        ParameterType::CurrentNumRois => ParameterValue::ULong(state.current_num_rois as u64),
        ParameterType::Roi(index) => {
            check_roi_index(state, index, OP)?;
            ParameterValue::Roi(state.roi_array[index])
        }
        ParameterType::RoiArray => {
            ParameterValue::RoiArray(state.roi_array[..state.current_num_rois].to_vec())
        }
        ParameterType::RoiIntegral(index) => {
            check_roi_index(state, index, OP)?;
            ParameterValue::ULong(u64::from(refresh_roi_integral(state, index)))
        }
        ParameterType::RoiIntegralArray => {
            let integrals = (0..state.current_num_rois)
                .map(|index| refresh_roi_integral(state, index))
                .collect();
            ParameterValue::UIntArray(integrals)
        }
        ParameterType::ChannelNumber => ParameterValue::ULong(state.channel_number as u64),
        ParameterType::ChannelValue => {
            state.channel_value = state
                .channel_array
                .get(state.channel_number)
                .copied()
                .unwrap_or(0);
            ParameterValue::ULong(u64::from(state.channel_value))
        }
        ParameterType::PresetType => ParameterValue::ULong(state.preset_type.code()),
        ParameterType::PresetRealTime => ParameterValue::Double(state.preset_real_time),
        ParameterType::PresetLiveTime => ParameterValue::Double(state.preset_live_time),
        ParameterType::PresetCount => ParameterValue::ULong(state.preset_count),
        ParameterType::RealTime => ParameterValue::Double(state.real_time),
        ParameterType::LiveTime => ParameterValue::Double(state.live_time),
        ParameterType::ReadoutPreference => ParameterValue::Long(state.readout_preference),
        other => return Err(unsupported_parameter(OP, RecordClass::Mca, other)),
    };
    Ok(value)
}

/// Class default for `set_parameter`, storing into the class struct.
pub fn default_set_parameter_handler(
    state: &mut McaState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "mca_set_parameter";
    match parameter {
        ParameterType::CurrentNumChannels => {
            let channels = value.as_u64()? as usize;
            if channels == 0 {
                return Err(MxError::illegal_argument(OP, "an mca needs at least one channel"));
            }
            if channels > state.maximum_num_channels {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "{} channels requested, maximum is {}",
                        channels, state.maximum_num_channels
                    ),
                ));
            }
            state.current_num_channels = channels;
        }
        ParameterType::CurrentNumRois => {
            let rois = value.as_u64()? as usize;
            if rois > state.maximum_num_rois {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "{} rois requested, maximum is {}",
                        rois, state.maximum_num_rois
                    ),
                ));
            }
            state.current_num_rois = rois;
        }
        ParameterType::Roi(index) => store_roi(state, index, value.as_roi()?)?,
        ParameterType::RoiArray => {
            let ParameterValue::RoiArray(rois) = value else {
                return Err(MxError::type_mismatch(OP, "roi_array needs an roi array value"));
            };
            let mut first_error = None;
            for (index, roi) in rois.into_iter().enumerate() {
                if let Err(err) = store_roi(state, index, roi) {
                    first_error.get_or_insert(err);
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        ParameterType::ChannelNumber => store_channel_number(state, value.as_u64()?)?,
        ParameterType::PresetType => state.preset_type = McaPreset::from_code(value.as_u64()?)?,
        ParameterType::PresetRealTime => state.preset_real_time = non_negative(OP, value.as_f64()?)?,
        ParameterType::PresetLiveTime => state.preset_live_time = non_negative(OP, value.as_f64()?)?,
        ParameterType::PresetCount => state.preset_count = value.as_u64()?,
        other => return Err(unsupported_parameter(OP, RecordClass::Mca, other)),
    }
    Ok(())
}

fn non_negative(operation: &'static str, value: f64) -> MxResult<f64> {
    if value < 0.0 || value.is_nan() {
        return Err(MxError::illegal_argument(
            operation,
            format!("{} is not a valid preset time", value),
        ));
    }
    Ok(value)
}

// =============================================================================
// Class API
// =============================================================================

fn start_locked(mca: &mut McaBody, ctx: &RecordContext<'_>) -> MxResult<()> {
    let issued = ctx.clock.now();
    mca.driver.start(&mut mca.state)?;
    mca.state.busy_start.record_start(issued);
    mca.state.busy = true;
    mca.state.new_data_available = false;
    Ok(())
}

fn is_busy_locked(mca: &mut McaBody, ctx: &RecordContext<'_>) -> MxResult<bool> {
    let reported = mca.driver.busy(&mut mca.state)?;
    let busy = mca.state.busy_start.apply(ctx.name, reported, ctx.clock.now());

    let was_busy = mca.state.busy;
    mca.state.busy = busy;
    if was_busy && !busy {
        mca.state.new_data_available = true;
        if ctx.watchers.is_watched("new_data_available") {
            ctx.watchers
                .notify("new_data_available", FieldValue::bool(true), true);
        }
    }
    if was_busy != busy {
        ctx.watchers.notify("busy", FieldValue::bool(busy), false);
    }
    Ok(busy)
}

/// Start an acquisition and open the busy-start window.
pub fn mca_start(record: &Record) -> MxResult<()> {
    with_record(record, "mca_start", start_locked)
}

/// Set the preset type and value, then start.
pub fn mca_start_for_preset(record: &Record, preset: McaPreset, value: f64) -> MxResult<()> {
    with_record(record, "mca_start_for_preset", |mca, ctx| {
        let state = &mut mca.state;
        mca.driver.set_parameter(
            state,
            ParameterType::PresetType,
            ParameterValue::ULong(preset.code()),
        )?;
        match preset {
            McaPreset::None => {}
            McaPreset::RealTime => mca.driver.set_parameter(
                state,
                ParameterType::PresetRealTime,
                ParameterValue::Double(value),
            )?,
            McaPreset::LiveTime => mca.driver.set_parameter(
                state,
                ParameterType::PresetLiveTime,
                ParameterValue::Double(value),
            )?,
            McaPreset::Count => {
                if value < 0.0 || value.is_nan() {
                    return Err(MxError::illegal_argument(
                        "mca_start_for_preset",
                        format!("{} is not a valid preset count", value),
                    ));
                }
                mca.driver.set_parameter(
                    state,
                    ParameterType::PresetCount,
                    ParameterValue::ULong(value as u64),
                )?
            }
        }
        start_locked(mca, ctx)
    })
}

/// Stop the acquisition.
pub fn mca_stop(record: &Record) -> MxResult<()> {
    with_record(record, "mca_stop", |mca, _| mca.driver.stop(&mut mca.state))
}

/// Read the active channels. Clears `new_data_available`.
pub fn mca_read(record: &Record) -> MxResult<Vec<u32>> {
    with_record(record, "mca_read", |mca, _| {
        mca.driver.read(&mut mca.state)?;
        mca.state.new_data_available = false;
        let active = mca.state.current_num_channels.min(mca.state.channel_array.len());
        Ok(mca.state.channel_array[..active].to_vec())
    })
}

/// Zero the channel data.
pub fn mca_clear(record: &Record) -> MxResult<()> {
    with_record(record, "mca_clear", |mca, _| mca.driver.clear(&mut mca.state))
}

/// Busy with the busy-start override applied.
pub fn mca_is_busy(record: &Record) -> MxResult<bool> {
    with_record(record, "mca_is_busy", is_busy_locked)
}

/// Whether an acquisition finished since the last [`mca_read`].
pub fn mca_is_new_data_available(record: &Record) -> MxResult<bool> {
    with_record(record, "mca_is_new_data_available", |mca, _| {
        Ok(mca.state.new_data_available)
    })
}

/// Read one parameter through the driver.
pub fn mca_get_parameter(record: &Record, parameter: ParameterType) -> MxResult<ParameterValue> {
    with_record(record, "mca_get_parameter", |mca, _| {
        mca.driver.get_parameter(&mut mca.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn mca_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "mca_set_parameter", |mca, _| {
        mca.driver.set_parameter(&mut mca.state, parameter, value)
    })
}

/// Bounds of ROI `index`.
pub fn mca_get_roi(record: &Record, index: usize) -> MxResult<Roi> {
    mca_get_parameter(record, ParameterType::Roi(index))?.as_roi()
}

/// Set ROI `index`. Its upper bound must lie below `current_num_channels`.
pub fn mca_set_roi(record: &Record, index: usize, roi: Roi) -> MxResult<()> {
    mca_set_parameter(record, ParameterType::Roi(index), ParameterValue::Roi(roi))
}

/// Counts summed over ROI `index`, saturating at `u32::MAX`.
pub fn mca_get_roi_integral(record: &Record, index: usize) -> MxResult<u32> {
    let integral = mca_get_parameter(record, ParameterType::RoiIntegral(index))?.as_u64()?;
    Ok(u32::try_from(integral).unwrap_or(u32::MAX))
}

/// Counts in one channel.
pub fn mca_get_channel(record: &Record, channel: usize) -> MxResult<u32> {
    with_record(record, "mca_get_channel", |mca, _| {
        mca.driver.set_parameter(
            &mut mca.state,
            ParameterType::ChannelNumber,
            ParameterValue::ULong(channel as u64),
        )?;
        let value = mca
            .driver
            .get_parameter(&mut mca.state, ParameterType::ChannelValue)?
            .as_u64()?;
        Ok(u32::try_from(value).unwrap_or(u32::MAX))
    })
}

/// Elapsed real time in seconds.
pub fn mca_get_real_time(record: &Record) -> MxResult<f64> {
    mca_get_parameter(record, ParameterType::RealTime)?.as_f64()
}

/// Elapsed live time in seconds.
pub fn mca_get_live_time(record: &Record) -> MxResult<f64> {
    mca_get_parameter(record, ParameterType::LiveTime)?.as_f64()
}

/// Channels in use.
pub fn mca_get_num_channels(record: &Record) -> MxResult<usize> {
    Ok(mca_get_parameter(record, ParameterType::CurrentNumChannels)?.as_u64()? as usize)
}

/// Change the channels in use.
pub fn mca_set_num_channels(record: &Record, channels: usize) -> MxResult<()> {
    mca_set_parameter(
        record,
        ParameterType::CurrentNumChannels,
        ParameterValue::ULong(channels as u64),
    )
}

/// Preferred readout, one of the `MCA_PREFER_*` constants.
pub fn mca_get_readout_preference(record: &Record) -> MxResult<i64> {
    mca_get_parameter(record, ParameterType::ReadoutPreference)?.as_i64()
}

// =============================================================================
// Field table
// =============================================================================

fn state(body: &mut RecordBody) -> MxResult<&mut McaState> {
    Ok(&mut class_body(body.class_mut(), "mca_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "mca_get_parameter", |mca, _| {
        mca.driver
            .get_parameter(&mut mca.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "mca_set_parameter", |mca, _| {
        mca.driver.set_parameter(&mut mca.state, parameter, value)
    })
}

fn roi_array_value(state: &McaState) -> MxResult<FieldValue> {
    FieldValue::new(
        FieldType::UInt,
        vec![state.maximum_num_rois, 2],
        Elements::UInt(state.roi_array.iter().flatten().copied().collect()),
    )
}

fn set_roi_array(body: &mut RecordBody, value: FieldValue) -> MxResult<()> {
    let flat = value.as_u32_slice()?;
    let rois: Vec<Roi> = flat.chunks_exact(2).map(|p| [p[0], p[1]]).collect();
    locked(body, "mca_set_roi_array", |mca, _| {
        let rois = rois
            .into_iter()
            .take(mca.state.current_num_rois)
            .collect();
        mca.driver.set_parameter(
            &mut mca.state,
            ParameterType::RoiArray,
            ParameterValue::RoiArray(rois),
        )
    })
}

fn roi_integral_array_value(body: &mut RecordBody) -> MxResult<FieldValue> {
    locked(body, "mca_get_roi_integral_array", |mca, _| {
        let integrals = mca
            .driver
            .get_parameter(&mut mca.state, ParameterType::RoiIntegralArray)?;
        let mut values = integrals.as_u32_array()?.to_vec();
        values.resize(mca.state.maximum_num_rois, 0);
        Ok(FieldValue::uint_array(values))
    })
}

/// Field table of the MCA class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("maximum_num_channels", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.maximum_num_channels as u64))
        })
        .in_description(),
        FieldDescriptor::class("maximum_num_rois", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.maximum_num_rois as u64))
        })
        .with_default(FieldValue::ulong(0)),
        FieldDescriptor::class("current_num_channels", FieldType::ULong, |b| {
            param_get(b, ParameterType::CurrentNumChannels, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::CurrentNumChannels, v))
        .in_description()
        .with_flags(FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("current_num_rois", FieldType::ULong, |b| {
            param_get(b, ParameterType::CurrentNumRois, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::CurrentNumRois, v))
        .in_description(),
        FieldDescriptor::class("busy_start_interval", FieldType::Double, |b| {
            Ok(FieldValue::double(state(b)?.busy_start.interval))
        })
        .with_setter(|b, v| {
            state(b)?.busy_start.interval = v.as_f64()?;
            Ok(())
        })
        .in_description(),
        FieldDescriptor::class("roi_array", FieldType::UInt, |b| roi_array_value(state(b)?))
            .with_setter(set_roi_array)
            .with_dimensions(&[Dimension::Varargs("maximum_num_rois"), Dimension::Fixed(2)])
            .in_description(),
        FieldDescriptor::class("channel_array", FieldType::UInt, |b| {
            locked(b, "mca_read", |mca, _| {
                mca.driver.read(&mut mca.state)?;
                Ok(FieldValue::uint_array(mca.state.channel_array.clone()))
            })
        })
        .with_dimensions(&[Dimension::Varargs("maximum_num_channels")])
        .with_flags(runtime),
        FieldDescriptor::class("roi_integral_array", FieldType::UInt, roi_integral_array_value)
            .with_dimensions(&[Dimension::Varargs("maximum_num_rois")])
            .with_flags(runtime),
        FieldDescriptor::class("channel_number", FieldType::ULong, |b| {
            param_get(b, ParameterType::ChannelNumber, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::ChannelNumber, v)),
        FieldDescriptor::class("channel_value", FieldType::UInt, |b| {
            param_get(b, ParameterType::ChannelValue, FieldType::UInt)
        })
        .with_flags(runtime),
        FieldDescriptor::class("preset_type", FieldType::ULong, |b| {
            param_get(b, ParameterType::PresetType, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PresetType, v)),
        FieldDescriptor::class("preset_real_time", FieldType::Double, |b| {
            param_get(b, ParameterType::PresetRealTime, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PresetRealTime, v)),
        FieldDescriptor::class("preset_live_time", FieldType::Double, |b| {
            param_get(b, ParameterType::PresetLiveTime, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PresetLiveTime, v)),
        FieldDescriptor::class("preset_count", FieldType::ULong, |b| {
            param_get(b, ParameterType::PresetCount, FieldType::ULong)
        })
        .with_setter(|b, v| param_set(b, ParameterType::PresetCount, v)),
        FieldDescriptor::class("real_time", FieldType::Double, |b| {
            param_get(b, ParameterType::RealTime, FieldType::Double)
        })
        .with_flags(runtime),
        FieldDescriptor::class("live_time", FieldType::Double, |b| {
            param_get(b, ParameterType::LiveTime, FieldType::Double)
        })
        .with_flags(runtime),
        FieldDescriptor::class("readout_preference", FieldType::Long, |b| {
            param_get(b, ParameterType::ReadoutPreference, FieldType::Long)
        })
        .with_flags(runtime),
        FieldDescriptor::class("busy", FieldType::Bool, |b| {
            locked(b, "mca_is_busy", is_busy_locked).map(FieldValue::bool)
        })
        .with_flags(runtime | FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("new_data_available", FieldType::Bool, |b| {
            Ok(FieldValue::bool(state(b)?.new_data_available))
        })
        .with_flags(runtime),
        FieldDescriptor::class("start", FieldType::Bool, |b| Ok(FieldValue::bool(state(b)?.busy)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mca_start", start_locked)?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("stop", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mca_stop", |mca, _| mca.driver.stop(&mut mca.state))?;
                }
                Ok(())
            })
            .with_flags(runtime),
        FieldDescriptor::class("clear", FieldType::Bool, |_| Ok(FieldValue::bool(false)))
            .with_setter(|b, v| {
                if is_trigger(&v)? {
                    locked(b, "mca_clear", |mca, _| mca.driver.clear(&mut mca.state))?;
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

    fn state_with_channels(channels: usize, rois: usize) -> McaState {
        McaState::new(channels, rois)
    }

    #[test]
    fn integral_sums_inclusive_range() {
        let channels = [1, 2, 3, 4, 5];
        assert_eq!(roi_integral(&channels, [1, 3]), 9);
        assert_eq!(roi_integral(&channels, [4, 4]), 5);
    }

    #[test]
    fn integral_saturates_instead_of_wrapping() {
        let channels = [u32::MAX - 1, 1, 1, 7];
        assert_eq!(roi_integral(&channels, [0, 1]), u32::MAX);
        assert_eq!(roi_integral(&channels, [0, 3]), u32::MAX);
        assert_eq!(roi_integral(&[0x8000_0000, 0x8000_0000], [0, 1]), u32::MAX);
    }

    #[test]
    fn upper_bound_is_clamped_then_reported() {
        let mut state = state_with_channels(1000, 4);
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::Roi(0),
            ParameterValue::Roi([100, 2000]),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(state.roi_array[0], [100, 999]);
    }

    #[tracing_test::traced_test]
    #[test]
    fn clamped_roi_is_logged() {
        let mut state = state_with_channels(16, 1);
        let _ = default_set_parameter_handler(
            &mut state,
            ParameterType::Roi(0),
            ParameterValue::Roi([0, 40]),
        );
        assert!(logs_contain("roi bounds clamped"));
    }

    #[test]
    fn inverted_bounds_clamp_lower_to_upper() {
        let mut state = state_with_channels(100, 1);
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::Roi(0),
            ParameterValue::Roi([50, 10]),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
        assert_eq!(state.roi_array[0], [10, 10]);
    }

    #[test]
    fn channel_number_follows_clamp_then_error() {
        let mut state = state_with_channels(16, 0);
        let err = default_set_parameter_handler(
            &mut state,
            ParameterType::ChannelNumber,
            ParameterValue::ULong(40),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(state.channel_number, 15);
    }

    #[test]
    fn roi_index_past_current_rois_is_illegal() {
        let mut state = state_with_channels(16, 2);
        let err = default_get_parameter_handler(&mut state, ParameterType::Roi(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn default_readout_preference() {
        let mut state = state_with_channels(8, 0);
        let value =
            default_get_parameter_handler(&mut state, ParameterType::ReadoutPreference).unwrap();
        assert_eq!(value, ParameterValue::Long(MCA_DEFAULT_READOUT_PREFERENCE));
    }

    #[test]
    fn motor_parameters_are_unsupported_here() {
        let mut state = state_with_channels(8, 0);
        let err = default_get_parameter_handler(&mut state, ParameterType::Speed).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn preset_codes() {
        assert_eq!(McaPreset::from_code(2).unwrap(), McaPreset::LiveTime);
        assert_eq!(
            McaPreset::from_code(9).unwrap_err().kind,
            ErrorKind::IllegalArgument
        );
    }
}
