//! Autoscale class.
//!
//! An autoscale record watches a scaler (its monitor) and asks for a gain
//! change when the monitor reading leaves the `[low_limit, high_limit]` band
//! by more than the matching deadband. Each gain setting has its own offset in
//! `monitor_offset_array`, selected by `monitor_offset_index`.

use std::sync::Arc;
use tracing::warn;

use super::{class_access, unsupported_parameter};
use crate::error::{MxError, MxResult};
use crate::field::{Dimension, FieldAssignments, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::parameter::{ParameterType, ParameterValue};
use crate::record::{InitContext, Record, RecordBody, RecordClass, RecordDriver};

/// Direction of a requested gain change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRequest {
    /// Reading inside the band.
    None,
    /// Reading is too low: increase the offset index.
    Up,
    /// Reading is too high: decrease the offset index.
    Down,
}

impl ChangeRequest {
    /// Wire code: 0, 1 or -1.
    pub fn code(&self) -> i64 {
        match self {
            ChangeRequest::None => 0,
            ChangeRequest::Up => 1,
            ChangeRequest::Down => -1,
        }
    }

    /// Inverse of [`ChangeRequest::code`].
    pub fn from_code(code: i64) -> MxResult<Self> {
        match code {
            0 => Ok(ChangeRequest::None),
            1 => Ok(ChangeRequest::Up),
            -1 => Ok(ChangeRequest::Down),
            other => Err(MxError::illegal_argument(
                "autoscale_change_control",
                format!("unknown change request {}", other),
            )),
        }
    }
}

/// Class struct shared by every autoscale driver.
#[derive(Debug, Clone)]
pub struct AutoscaleState {
    /// Name of the monitor scaler.
    pub monitor_record: String,
    /// Set during finish_record_initialization.
    pub monitor: Option<Arc<Record>>,
    /// Lower edge of the band.
    pub low_limit: f64,
    /// Upper edge of the band.
    pub high_limit: f64,
    /// Tolerance below `low_limit`.
    pub low_deadband: f64,
    /// Tolerance above `high_limit`.
    pub high_deadband: f64,
    /// Number of gain settings.
    pub num_monitor_offsets: usize,
    /// Monitor offset per gain setting.
    pub monitor_offset_array: Vec<f64>,
    /// Current gain setting.
    pub monitor_offset_index: usize,
    /// Last corrected monitor reading.
    pub monitor_value: f64,
}

impl AutoscaleState {
    /// Build the class struct from a parsed record description.
    pub fn from_description(assignments: &FieldAssignments) -> MxResult<Self> {
        const OP: &str = "autoscale_create_record_structures";
        let monitor_record = assignments.require("monitor_record")?.as_str()?.to_string();
        let num_monitor_offsets = assignments.require("num_monitor_offsets")?.as_usize()?;
        if num_monitor_offsets == 0 {
            return Err(MxError::illegal_argument(OP, "num_monitor_offsets must be at least 1"));
        }
        let mut monitor_offset_array = match assignments.get("monitor_offset_array") {
            Some(value) => value.as_f64_slice()?.to_vec(),
            None => Vec::new(),
        };
        monitor_offset_array.resize(num_monitor_offsets, 0.0);
        let state = Self {
            monitor_record,
            monitor: None,
            low_limit: assignments.f64_or("low_limit", 0.0)?,
            high_limit: assignments.f64_or("high_limit", f64::MAX)?,
            low_deadband: assignments.f64_or("low_deadband", 0.0)?,
            high_deadband: assignments.f64_or("high_deadband", 0.0)?,
            num_monitor_offsets,
            monitor_offset_array,
            monitor_offset_index: assignments.usize_or("monitor_offset_index", 0)?,
            monitor_value: 0.0,
        };
        if state.low_limit > state.high_limit {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "low limit {} is above high limit {}",
                    state.low_limit, state.high_limit
                ),
            ));
        }
        if state.monitor_offset_index >= num_monitor_offsets {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "monitor_offset_index {} is outside 0..{}",
                    state.monitor_offset_index, num_monitor_offsets
                ),
            ));
        }
        Ok(state)
    }

    /// Offset of the current gain setting.
    pub fn current_offset(&self) -> f64 {
        self.monitor_offset_array
            .get(self.monitor_offset_index)
            .copied()
            .unwrap_or(0.0)
    }

    /// Request a gain change for a corrected monitor reading.
    pub fn change_request_for(&self, value: f64) -> ChangeRequest {
        if value > self.high_limit + self.high_deadband {
            ChangeRequest::Down
        } else if value < self.low_limit - self.low_deadband {
            ChangeRequest::Up
        } else {
            ChangeRequest::None
        }
    }
}

/// Operations an autoscale driver provides. Every method has a default.
pub trait AutoscaleDriver: RecordDriver {
    /// Monitor reading with the current offset removed.
    fn read_monitor(&mut self, state: &mut AutoscaleState, raw: i64) -> MxResult<f64> {
        Ok(raw as f64 - state.current_offset())
    }

    /// Change request for the last monitor reading.
    fn get_change_request(&mut self, state: &mut AutoscaleState) -> MxResult<ChangeRequest> {
        Ok(state.change_request_for(state.monitor_value))
    }

    /// Act on a change request. The default steps the offset index.
    fn change_control(
        &mut self,
        state: &mut AutoscaleState,
        request: ChangeRequest,
    ) -> MxResult<()> {
        default_change_control(state, request)
    }

    /// Read a parameter. The default serves it from `state`.
    fn get_parameter(
        &mut self,
        state: &mut AutoscaleState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        default_get_parameter_handler(state, parameter)
    }

    /// Write a parameter. The default validates it and stores it in `state`.
    fn set_parameter(
        &mut self,
        state: &mut AutoscaleState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        default_set_parameter_handler(state, parameter, value)
    }
}

/// Autoscale class struct and its driver.
pub struct AutoscaleBody {
    /// Class-level state.
    pub state: AutoscaleState,
    /// Driver.
    pub driver: Box<dyn AutoscaleDriver>,
}

impl AutoscaleBody {
    /// Pair `state` with `driver`.
    pub fn new(state: AutoscaleState, driver: Box<dyn AutoscaleDriver>) -> Self {
        Self { state, driver }
    }
}

class_access!(Autoscale, AutoscaleBody);

/// Resolve the monitor record. It must be a scaler.
pub(crate) fn link_monitor(body: &mut AutoscaleBody, ctx: &InitContext<'_>) -> MxResult<()> {
    let monitor = ctx.find(&body.state.monitor_record, RecordClass::Scaler)?;
    body.state.monitor = Some(monitor);
    Ok(())
}

/// Select an offset index, clamping to the last offset.
fn store_offset_index(state: &mut AutoscaleState, index: i64) -> MxResult<()> {
    const OP: &str = "autoscale_set_offset_index";
    let last = state.num_monitor_offsets.saturating_sub(1);
    if index < 0 {
        state.monitor_offset_index = 0;
        warn!(requested = index, stored = 0, "offset index clamped");
        return Err(MxError::would_exceed_limit(
            OP,
            format!("offset index {} is below zero", index),
        ));
    }
    let index = index as usize;
    if index > last {
        state.monitor_offset_index = last;
        warn!(requested = index, stored = last, "offset index clamped");
        return Err(MxError::would_exceed_limit(
            OP,
            format!(
                "offset index {} is beyond the last offset {}",
                index, last
            ),
        ));
    }
    state.monitor_offset_index = index;
    Ok(())
}

/// Step the offset index one place in the requested direction.
pub fn default_change_control(state: &mut AutoscaleState, request: ChangeRequest) -> MxResult<()> {
    let current = state.monitor_offset_index as i64;
    match request {
        ChangeRequest::None => Ok(()),
        ChangeRequest::Up => store_offset_index(state, current + 1),
        ChangeRequest::Down => store_offset_index(state, current - 1),
    }
}

/// Class-level parameter reads.
pub fn default_get_parameter_handler(
    state: &mut AutoscaleState,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    let value = match parameter {
        ParameterType::LowLimit => ParameterValue::Double(state.low_limit),
        ParameterType::HighLimit => ParameterValue::Double(state.high_limit),
        ParameterType::LowDeadband => ParameterValue::Double(state.low_deadband),
        ParameterType::HighDeadband => ParameterValue::Double(state.high_deadband),
        ParameterType::MonitorOffsetArray => {
            ParameterValue::DoubleArray(state.monitor_offset_array.clone())
        }
        other => {
            return Err(unsupported_parameter(
                "autoscale_get_parameter",
                RecordClass::Autoscale,
                other,
            ))
        }
    };
    Ok(value)
}

/// Class-level parameter writes.
pub fn default_set_parameter_handler(
    state: &mut AutoscaleState,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    const OP: &str = "autoscale_set_parameter";
    match parameter {
        ParameterType::LowLimit => state.low_limit = value.as_f64()?,
        ParameterType::HighLimit => state.high_limit = value.as_f64()?,
        ParameterType::LowDeadband => state.low_deadband = value.as_f64()?.abs(),
        ParameterType::HighDeadband => state.high_deadband = value.as_f64()?.abs(),
        ParameterType::MonitorOffsetArray => {
            let offsets = value.as_f64_array()?;
            if offsets.len() > state.num_monitor_offsets {
                return Err(MxError::would_exceed_limit(
                    OP,
                    format!(
                        "{} offsets given, the record holds {}",
                        offsets.len(),
                        state.num_monitor_offsets
                    ),
                ));
            }
            state.monitor_offset_array[..offsets.len()].copy_from_slice(offsets);
        }
        other => return Err(unsupported_parameter(OP, RecordClass::Autoscale, other)),
    }
    Ok(())
}

fn monitor_of(state: &AutoscaleState, operation: &'static str) -> MxResult<Arc<Record>> {
    state.monitor.clone().ok_or_else(|| {
        MxError::new(
            crate::error::ErrorKind::NotReady,
            operation,
            format!("monitor record '{}' has not been linked", state.monitor_record),
        )
    })
}

fn read_monitor_locked(autoscale: &mut AutoscaleBody) -> MxResult<f64> {
    let monitor = monitor_of(&autoscale.state, "autoscale_read_monitor")?;
    let raw = super::scaler::scaler_read(&monitor)?;
    let value = autoscale.driver.read_monitor(&mut autoscale.state, raw)?;
    autoscale.state.monitor_value = value;
    Ok(value)
}

/// Read the monitor scaler and remove the current offset.
pub fn autoscale_read_monitor(record: &Record) -> MxResult<f64> {
    with_record(record, "autoscale_read_monitor", |a, _| read_monitor_locked(a))
}

/// Gain change wanted for the last monitor reading.
pub fn autoscale_get_change_request(record: &Record) -> MxResult<ChangeRequest> {
    with_record(record, "autoscale_get_change_request", |a, _| {
        a.driver.get_change_request(&mut a.state)
    })
}

/// Act on a change request through the driver.
pub fn autoscale_change_control(record: &Record, request: ChangeRequest) -> MxResult<()> {
    with_record(record, "autoscale_change_control", |a, _| {
        a.driver.change_control(&mut a.state, request)
    })
}

/// Current gain setting.
pub fn autoscale_get_offset_index(record: &Record) -> MxResult<usize> {
    with_record(record, "autoscale_get_offset_index", |a, _| {
        Ok(a.state.monitor_offset_index)
    })
}

/// Select a gain setting; it must be below `num_monitor_offsets`.
pub fn autoscale_set_offset_index(record: &Record, index: usize) -> MxResult<()> {
    let index = i64::try_from(index).unwrap_or(i64::MAX);
    with_record(record, "autoscale_set_offset_index", |a, _| {
        store_offset_index(&mut a.state, index)
    })
}

/// Read one parameter through the driver.
pub fn autoscale_get_parameter(
    record: &Record,
    parameter: ParameterType,
) -> MxResult<ParameterValue> {
    with_record(record, "autoscale_get_parameter", |a, _| {
        a.driver.get_parameter(&mut a.state, parameter)
    })
}

/// Write one parameter through the driver.
pub fn autoscale_set_parameter(
    record: &Record,
    parameter: ParameterType,
    value: ParameterValue,
) -> MxResult<()> {
    with_record(record, "autoscale_set_parameter", |a, _| {
        a.driver.set_parameter(&mut a.state, parameter, value)
    })
}

fn state(body: &mut RecordBody) -> MxResult<&mut AutoscaleState> {
    Ok(&mut class_body(body.class_mut(), "autoscale_field")?.state)
}

fn param_get(
    body: &mut RecordBody,
    parameter: ParameterType,
    datatype: FieldType,
) -> MxResult<FieldValue> {
    locked(body, "autoscale_get_parameter", |a, _| {
        a.driver
            .get_parameter(&mut a.state, parameter)?
            .to_field_value(datatype)
    })
}

fn param_set(body: &mut RecordBody, parameter: ParameterType, value: FieldValue) -> MxResult<()> {
    let value = ParameterValue::from_field_value(parameter, &value)?;
    locked(body, "autoscale_set_parameter", |a, _| {
        a.driver.set_parameter(&mut a.state, parameter, value)
    })
}

/// Field table of the autoscale class.
pub fn class_fields() -> Vec<FieldDescriptor> {
    let runtime = FieldFlags::NO_AUTOSAVE;
    vec![
        FieldDescriptor::class("monitor_record", FieldType::RecordRef, |b| {
            Ok(FieldValue::record_ref(state(b)?.monitor_record.clone()))
        })
        .in_description(),
        FieldDescriptor::class("low_limit", FieldType::Double, |b| {
            param_get(b, ParameterType::LowLimit, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::LowLimit, v))
        .in_description(),
        FieldDescriptor::class("high_limit", FieldType::Double, |b| {
            param_get(b, ParameterType::HighLimit, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::HighLimit, v))
        .in_description(),
        FieldDescriptor::class("low_deadband", FieldType::Double, |b| {
            param_get(b, ParameterType::LowDeadband, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::LowDeadband, v))
        .in_description(),
        FieldDescriptor::class("high_deadband", FieldType::Double, |b| {
            param_get(b, ParameterType::HighDeadband, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::HighDeadband, v))
        .in_description(),
        FieldDescriptor::class("num_monitor_offsets", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.num_monitor_offsets as u64))
        })
        .with_default(FieldValue::ulong(1)),
        FieldDescriptor::class("monitor_offset_array", FieldType::Double, |b| {
            param_get(b, ParameterType::MonitorOffsetArray, FieldType::Double)
        })
        .with_setter(|b, v| param_set(b, ParameterType::MonitorOffsetArray, v))
        .with_dimensions(&[Dimension::Varargs("num_monitor_offsets")])
        .in_description(),
        FieldDescriptor::class("monitor_offset_index", FieldType::ULong, |b| {
            Ok(FieldValue::ulong(state(b)?.monitor_offset_index as u64))
        })
        .with_setter(|b, v| {
            let index = i64::try_from(v.as_u64()?).unwrap_or(i64::MAX);
            store_offset_index(state(b)?, index)
        })
        .in_description()
        .with_flags(FieldFlags::IN_SUMMARY),
        FieldDescriptor::class("monitor_value", FieldType::Double, |b| {
            locked(b, "autoscale_read_monitor", |a, _| read_monitor_locked(a))
                .map(FieldValue::double)
        })
        .with_flags(runtime),
        FieldDescriptor::class("change_request", FieldType::Long, |b| {
            locked(b, "autoscale_get_change_request", |a, _| {
                a.driver.get_change_request(&mut a.state)
            })
            .map(|request| FieldValue::long(request.code()))
        })
        .with_flags(runtime),
        FieldDescriptor::class("change_control", FieldType::Long, |_| {
            Ok(FieldValue::long(ChangeRequest::None.code()))
        })
        .with_setter(|b, v| {
            let request = ChangeRequest::from_code(v.as_i64()?)?;
            locked(b, "autoscale_change_control", |a, _| {
                a.driver.change_control(&mut a.state, request)
            })
        })
        .with_flags(runtime),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn state(offsets: usize) -> AutoscaleState {
        AutoscaleState {
            monitor_record: "scaler1".into(),
            monitor: None,
            low_limit: 100.0,
            high_limit: 1000.0,
            low_deadband: 10.0,
            high_deadband: 50.0,
            num_monitor_offsets: offsets,
            monitor_offset_array: vec![0.0; offsets],
            monitor_offset_index: 0,
            monitor_value: 0.0,
        }
    }

    #[test]
    fn change_requests_respect_deadbands() {
        let s = state(3);
        assert_eq!(s.change_request_for(1040.0), ChangeRequest::None);
        assert_eq!(s.change_request_for(1051.0), ChangeRequest::Down);
        assert_eq!(s.change_request_for(95.0), ChangeRequest::None);
        assert_eq!(s.change_request_for(89.0), ChangeRequest::Up);
    }

    #[test]
    fn stepping_past_the_last_offset_clamps_then_errors() {
        let mut s = state(2);
        default_change_control(&mut s, ChangeRequest::Up).unwrap();
        assert_eq!(s.monitor_offset_index, 1);
        let err = default_change_control(&mut s, ChangeRequest::Up).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(s.monitor_offset_index, 1);
    }

    #[test]
    fn stepping_below_zero_clamps_then_errors() {
        let mut s = state(2);
        let err = default_change_control(&mut s, ChangeRequest::Down).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(s.monitor_offset_index, 0);
    }
}
