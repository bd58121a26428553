//! Parameter selectors shared by every device class.
//!
//! Each class exposes one `get_parameter` / `set_parameter` pair instead of a
//! function per attribute. The caller passes a [`ParameterType`] naming the
//! attribute and receives (or supplies) a [`ParameterValue`]. Local drivers
//! match on the selector and fall back to the class default handler; network
//! proxy drivers map the same selector onto a remote field name with
//! [`ParameterType::field_name`].
//!
//! Selectors that address one element of an array carry the index, so no
//! scratch state is stored on the class struct between calls.

use serde::{Deserialize, Serialize};

use crate::error::{MxError, MxResult};
use crate::field::{Elements, FieldType, FieldValue};

// =============================================================================
// Selectors
// =============================================================================

/// Which attribute a get/set call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    // motor
    /// Move speed.
    Speed,
    /// Starting speed of a ramp.
    BaseSpeed,
    /// Speed ceiling.
    MaximumSpeed,
    /// Ramp time to full speed.
    AccelerationTime,
    /// Controller-specific acceleration settings.
    RawAccelerationParameters,
    /// Home search direction.
    HomeSearch,
    /// Servo loop state.
    ClosedLoop,
    /// Axis power.
    AxisEnable,

    // mca
    /// Channels in use.
    CurrentNumChannels,
    /// ROIs in use.
    CurrentNumRois,
    /// Bounds of one ROI.
    Roi(usize),
    /// Bounds of every ROI in use.
    RoiArray,
    /// Integral of one ROI.
    RoiIntegral(usize),
    /// Integrals of every ROI in use.
    RoiIntegralArray,
    /// Channel selected for `ChannelValue`.
    ChannelNumber,
    /// Counts in the selected channel.
    ChannelValue,
    /// Preset kind, as a [`crate::device::mca::McaPreset`] code.
    PresetType,
    /// Real-time preset.
    PresetRealTime,
    /// Live-time preset.
    PresetLiveTime,
    /// Count preset.
    PresetCount,
    /// Elapsed real time.
    RealTime,
    /// Elapsed live time.
    LiveTime,
    /// Preferred readout.
    ReadoutPreference,

    // mce
    /// Time per measurement.
    MeasurementTime,
    /// Measurements per acquisition.
    NumMeasurements,
    /// Acquisition mode.
    MceMode,

    // scaler
    /// Counting mode.
    ScalerMode,
    /// Dark counts per second.
    DarkCurrent,

    // timer
    /// Timer mode.
    TimerMode,
    /// Preset of the last start.
    LastMeasurementTime,

    // autoscale
    /// Lower edge of the band.
    LowLimit,
    /// Upper edge of the band.
    HighLimit,
    /// Tolerance below the band.
    LowDeadband,
    /// Tolerance above the band.
    HighDeadband,
    /// Offsets per gain setting.
    MonitorOffsetArray,

    // pulse generator
    /// Pulse high time.
    PulseWidth,
    /// Delay before the first pulse.
    PulseDelay,
    /// Time between pulse starts.
    PulsePeriod,
    /// Pulses to emit, zero for continuous.
    NumPulses,
    /// Output mode.
    PulseMode,
    /// Trigger source.
    TriggerMode,
}

impl ParameterType {
    /// Class field that stores this attribute.
    ///
    /// Network proxy drivers read and write this field on the remote record.
    /// Indexed selectors name the whole array.
    pub fn field_name(&self) -> &'static str {
        match self {
            ParameterType::Speed => "speed",
            ParameterType::BaseSpeed => "base_speed",
            ParameterType::MaximumSpeed => "maximum_speed",
            ParameterType::AccelerationTime => "acceleration_time",
            ParameterType::RawAccelerationParameters => "raw_acceleration_parameters",
            ParameterType::HomeSearch => "home_search",
            ParameterType::ClosedLoop => "closed_loop",
            ParameterType::AxisEnable => "axis_enable",
            ParameterType::CurrentNumChannels => "current_num_channels",
            ParameterType::CurrentNumRois => "current_num_rois",
            ParameterType::Roi(_) | ParameterType::RoiArray => "roi_array",
            ParameterType::RoiIntegral(_) | ParameterType::RoiIntegralArray => {
                "roi_integral_array"
            }
            ParameterType::ChannelNumber => "channel_number",
            ParameterType::ChannelValue => "channel_value",
            ParameterType::PresetType => "preset_type",
            ParameterType::PresetRealTime => "preset_real_time",
            ParameterType::PresetLiveTime => "preset_live_time",
            ParameterType::PresetCount => "preset_count",
            ParameterType::RealTime => "real_time",
            ParameterType::LiveTime => "live_time",
            ParameterType::ReadoutPreference => "readout_preference",
            ParameterType::MeasurementTime => "measurement_time",
            ParameterType::NumMeasurements => "num_measurements",
            ParameterType::MceMode => "mode",
            ParameterType::ScalerMode => "mode",
            ParameterType::DarkCurrent => "dark_current",
            ParameterType::TimerMode => "mode",
            ParameterType::LastMeasurementTime => "last_measurement_time",
            ParameterType::LowLimit => "low_limit",
            ParameterType::HighLimit => "high_limit",
            ParameterType::LowDeadband => "low_deadband",
            ParameterType::HighDeadband => "high_deadband",
            ParameterType::MonitorOffsetArray => "monitor_offset_array",
            ParameterType::PulseWidth => "pulse_width",
            ParameterType::PulseDelay => "pulse_delay",
            ParameterType::PulsePeriod => "pulse_period",
            ParameterType::NumPulses => "num_pulses",
            ParameterType::PulseMode => "mode",
            ParameterType::TriggerMode => "trigger_mode",
        }
    }
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterType::Roi(i) => write!(f, "roi[{}]", i),
            ParameterType::RoiIntegral(i) => write!(f, "roi_integral[{}]", i),
            other => f.write_str(other.field_name()),
        }
    }
}

// =============================================================================
// Values
// =============================================================================

/// Inclusive channel range `[lo, hi]`.
pub type Roi = [u32; 2];

/// Value carried by a get/set parameter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    /// Flag.
    Bool(bool),
    /// Signed integer.
    Long(i64),
    /// Unsigned integer.
    ULong(u64),
    /// Floating point.
    Double(f64),
    /// One ROI.
    Roi(Roi),
    /// Several ROIs.
    RoiArray(Vec<Roi>),
    /// Unsigned integers, e.g. ROI integrals.
    UIntArray(Vec<u32>),
    /// Floating point values.
    DoubleArray(Vec<f64>),
}

impl ParameterValue {
    fn mismatch(&self, wanted: &str) -> MxError {
        MxError::type_mismatch(
            "parameter_value",
            format!("expected a {} parameter value, found {:?}", wanted, self),
        )
    }

    /// Any numeric value as `f64`.
    pub fn as_f64(&self) -> MxResult<f64> {
        match self {
            ParameterValue::Double(v) => Ok(*v),
            ParameterValue::Long(v) => Ok(*v as f64),
            ParameterValue::ULong(v) => Ok(*v as f64),
            other => Err(other.mismatch("numeric")),
        }
    }

    /// Non-negative integer or flag as `u64`.
    pub fn as_u64(&self) -> MxResult<u64> {
        match self {
            ParameterValue::ULong(v) => Ok(*v),
            ParameterValue::Long(v) => u64::try_from(*v).map_err(|_| {
                MxError::illegal_argument(
                    "parameter_value",
                    format!("negative value {} where unsigned expected", v),
                )
            }),
            ParameterValue::Bool(v) => Ok(u64::from(*v)),
            other => Err(other.mismatch("unsigned integer")),
        }
    }

    /// Integer or flag as `i64`.
    pub fn as_i64(&self) -> MxResult<i64> {
        match self {
            ParameterValue::Long(v) => Ok(*v),
            ParameterValue::ULong(v) => i64::try_from(*v).map_err(|_| {
                MxError::illegal_argument("parameter_value", format!("{} is too large", v))
            }),
            ParameterValue::Bool(v) => Ok(i64::from(*v)),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Flag, or an integer compared against zero.
    pub fn as_bool(&self) -> MxResult<bool> {
        match self {
            ParameterValue::Bool(v) => Ok(*v),
            ParameterValue::Long(v) => Ok(*v != 0),
            ParameterValue::ULong(v) => Ok(*v != 0),
            other => Err(other.mismatch("boolean")),
        }
    }

    /// The ROI of a `Roi` value.
    pub fn as_roi(&self) -> MxResult<Roi> {
        match self {
            ParameterValue::Roi(v) => Ok(*v),
            other => Err(other.mismatch("roi")),
        }
    }

    /// Elements of a `DoubleArray` value.
    pub fn as_f64_array(&self) -> MxResult<&[f64]> {
        match self {
            ParameterValue::DoubleArray(v) => Ok(v),
            other => Err(other.mismatch("double array")),
        }
    }

    /// Elements of a `UIntArray` value.
    pub fn as_u32_array(&self) -> MxResult<&[u32]> {
        match self {
            ParameterValue::UIntArray(v) => Ok(v),
            other => Err(other.mismatch("unsigned array")),
        }
    }

    /// Convert to a field value of the given type.
    ///
    /// Used by network proxies to put a parameter into its remote field.
    pub fn to_field_value(&self, datatype: FieldType) -> MxResult<FieldValue> {
        let value = match (self, datatype) {
            (ParameterValue::Double(v), FieldType::Double) => FieldValue::double(*v),
            (ParameterValue::Double(v), FieldType::Float) => FieldValue::float(*v as f32),
            (ParameterValue::Bool(v), FieldType::Bool) => FieldValue::bool(*v),
            (ParameterValue::Long(v), FieldType::Long) => FieldValue::long(*v),
            (ParameterValue::Long(v), FieldType::Int) => FieldValue::int(i32::try_from(*v).map_err(
                |_| MxError::would_exceed_limit("parameter_value", format!("{} does not fit an int", v)),
            )?),
            (ParameterValue::ULong(v), FieldType::ULong) => FieldValue::ulong(*v),
            (ParameterValue::ULong(v), FieldType::Hex) => FieldValue::hex(*v),
            (ParameterValue::ULong(v), FieldType::UInt) => FieldValue::uint(u32::try_from(*v).map_err(
                |_| MxError::would_exceed_limit("parameter_value", format!("{} does not fit a uint", v)),
            )?),
            (ParameterValue::UIntArray(v), FieldType::UInt) => FieldValue::uint_array(v.clone()),
            (ParameterValue::DoubleArray(v), FieldType::Double) => FieldValue::double_array(v.clone()),
            (ParameterValue::RoiArray(v), FieldType::UInt) => FieldValue::new(
                FieldType::UInt,
                vec![v.len(), 2],
                Elements::UInt(v.iter().flatten().copied().collect()),
            )?,
            (other, datatype) => {
                return Err(MxError::type_mismatch(
                    "parameter_value",
                    format!("{:?} cannot be stored in a {} field", other, datatype),
                ))
            }
        };
        Ok(value)
    }

    /// Interpret a field value read for `parameter`.
    pub fn from_field_value(parameter: ParameterType, value: &FieldValue) -> MxResult<Self> {
        match parameter {
            ParameterType::Roi(index) => {
                let rois = rois_from_field(value)?;
                rois.get(index).copied().map(ParameterValue::Roi).ok_or_else(|| {
                    MxError::would_exceed_limit(
                        "parameter_value",
                        format!("roi {} requested from {} rois", index, rois.len()),
                    )
                })
            }
            ParameterType::RoiArray => Ok(ParameterValue::RoiArray(rois_from_field(value)?)),
            ParameterType::RoiIntegral(index) => {
                let integrals = value.as_u32_slice()?;
                integrals
                    .get(index)
                    .map(|v| ParameterValue::ULong(u64::from(*v)))
                    .ok_or_else(|| {
                        MxError::would_exceed_limit(
                            "parameter_value",
                            format!("roi {} requested from {} integrals", index, integrals.len()),
                        )
                    })
            }
            ParameterType::RoiIntegralArray => {
                Ok(ParameterValue::UIntArray(value.as_u32_slice()?.to_vec()))
            }
            _ => Self::from_scalar_or_array(value),
        }
    }

    fn from_scalar_or_array(value: &FieldValue) -> MxResult<Self> {
        if !value.is_scalar() {
            return match value.elements() {
                Elements::UInt(v) => Ok(ParameterValue::UIntArray(v.clone())),
                Elements::Double(v) => Ok(ParameterValue::DoubleArray(v.clone())),
                _ => Err(MxError::type_mismatch(
                    "parameter_value",
                    format!("{} arrays are not parameter values", value.datatype()),
                )),
            };
        }
        match value.datatype() {
            FieldType::Bool => Ok(ParameterValue::Bool(value.as_bool()?)),
            FieldType::Float | FieldType::Double => Ok(ParameterValue::Double(value.as_f64()?)),
            FieldType::UChar
            | FieldType::UShort
            | FieldType::UInt
            | FieldType::ULong
            | FieldType::Hex => Ok(ParameterValue::ULong(value.as_u64()?)),
            FieldType::Char | FieldType::Short | FieldType::Int | FieldType::Long => {
                Ok(ParameterValue::Long(value.as_i64()?))
            }
            FieldType::String | FieldType::RecordRef => Err(MxError::type_mismatch(
                "parameter_value",
                "string fields are not parameter values",
            )),
        }
    }
}

fn rois_from_field(value: &FieldValue) -> MxResult<Vec<Roi>> {
    let flat = value.as_u32_slice()?;
    if flat.len() % 2 != 0 {
        return Err(MxError::new(
            crate::error::ErrorKind::UnparseableString,
            "parameter_value",
            format!("roi array has an odd element count {}", flat.len()),
        ));
    }
    Ok(flat.chunks_exact(2).map(|pair| [pair[0], pair[1]]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_selectors_share_the_array_field() {
        assert_eq!(ParameterType::Roi(3).field_name(), "roi_array");
        assert_eq!(ParameterType::RoiIntegral(1).field_name(), "roi_integral_array");
        assert_eq!(ParameterType::Roi(3).to_string(), "roi[3]");
    }

    #[test]
    fn roi_element_is_selected_from_the_flat_array() {
        let field = FieldValue::new(
            FieldType::UInt,
            vec![2, 2],
            Elements::UInt(vec![0, 10, 100, 999]),
        )
        .unwrap();
        let value = ParameterValue::from_field_value(ParameterType::Roi(1), &field).unwrap();
        assert_eq!(value, ParameterValue::Roi([100, 999]));

        let err = ParameterValue::from_field_value(ParameterType::Roi(2), &field).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::WouldExceedLimit);
    }

    #[test]
    fn conversion_to_field_is_type_checked() {
        let err = ParameterValue::Double(1.5)
            .to_field_value(FieldType::Long)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeMismatch);

        let field = ParameterValue::ULong(7).to_field_value(FieldType::UInt).unwrap();
        assert_eq!(field.as_u64().unwrap(), 7);
    }
}
