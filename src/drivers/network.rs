//! Network proxy drivers.
//!
//! A proxy record forwards every class operation to a record of the same
//! class on a remote server. Each parameter selector maps to the remote field
//! named by [`ParameterType::field_name`], so a proxy needs no per-parameter
//! code beyond the few selectors whose remote shape differs (single ROIs,
//! version-gated fields).
//!
//! Type fields: `server` (the server record) and `remote_record_name`
//! (defaults to the proxy's own name). The server is resolved during
//! `finish_record_initialization`; calls made before that fail `NotReady`.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::device::mca::{McaBody, McaDriver, McaState, MCA_DEFAULT_READOUT_PREFERENCE};
use crate::device::motor::{MotorBody, MotorDriver, MotorState};
use crate::device::scaler::{ScalerBody, ScalerDriver, ScalerState};
use crate::device::timer::{TimerBody, TimerDriver, TimerState};
use crate::error::{ErrorKind, MxError, MxResult};
use crate::field::{Elements, FieldDescriptor, FieldFlags, FieldType, FieldValue};
use crate::net::server::{NetworkServer, ServerVersion};
use crate::net::NetworkField;
use crate::parameter::{ParameterType, ParameterValue, Roi};
use crate::record::{
    ClassBody, CreateContext, DriverFactory, InitContext, RecordClass, RecordDriver,
};

/// First server version that has an MCA `readout_preference` field.
pub const READOUT_PREFERENCE_VERSION: ServerVersion = ServerVersion::new(1, 5, 7);

fn remote_type_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::driver("server", FieldType::RecordRef)
            .in_description()
            .with_flags(FieldFlags::READ_ONLY | FieldFlags::IN_SUMMARY),
        FieldDescriptor::driver("remote_record_name", FieldType::String)
            .in_description()
            .with_flags(FieldFlags::READ_ONLY),
    ]
}

/// The remote half of a proxy record: its server and the fields bound so far.
struct RemoteRecord {
    server_name: String,
    remote_record_name: String,
    server: Option<Arc<NetworkServer>>,
    fields: HashMap<&'static str, NetworkField>,
}

impl RemoteRecord {
    fn from_description(ctx: &CreateContext<'_>) -> MxResult<Self> {
        let a = ctx.assignments;
        Ok(Self {
            server_name: a.require("server")?.as_str()?.to_string(),
            remote_record_name: a.string_or("remote_record_name", ctx.name)?,
            server: None,
            fields: HashMap::new(),
        })
    }

    fn link(&mut self, ctx: &InitContext<'_>) -> MxResult<()> {
        self.server = Some(ctx.find_server(&self.server_name)?);
        debug!(
            record = ctx.record_name(),
            server = %self.server_name,
            remote = %self.remote_record_name,
            "network proxy linked"
        );
        Ok(())
    }

    fn server(&self) -> MxResult<&Arc<NetworkServer>> {
        self.server.as_ref().ok_or_else(|| {
            MxError::new(
                ErrorKind::NotReady,
                "network_proxy",
                format!(
                    "server '{}' for remote record '{}' has not been linked",
                    self.server_name, self.remote_record_name
                ),
            )
        })
    }

    /// Version of the remote server, without a round trip once known.
    fn version(&self) -> MxResult<ServerVersion> {
        let server = self.server()?;
        match server.cached_version() {
            Some(version) => Ok(version),
            None => server.version(),
        }
    }

    fn field(&mut self, name: &'static str) -> MxResult<&mut NetworkField> {
        let server = Arc::clone(self.server()?);
        let remote = &self.remote_record_name;
        Ok(self
            .fields
            .entry(name)
            .or_insert_with(|| NetworkField::new(server, remote.clone(), name)))
    }

    fn get(&mut self, name: &'static str) -> MxResult<FieldValue> {
        self.field(name)?.get_any()
    }

    fn get_f64(&mut self, name: &'static str) -> MxResult<f64> {
        self.field(name)?.get_f64()
    }

    fn get_bool(&mut self, name: &'static str) -> MxResult<bool> {
        self.field(name)?.get_bool()
    }

    fn put_f64(&mut self, name: &'static str, value: f64) -> MxResult<()> {
        self.field(name)?.put_f64(value)
    }

    /// Write `true` to a remote trigger field (`start`, `stop`, `clear`, ..).
    fn trigger(&mut self, name: &'static str) -> MxResult<()> {
        self.field(name)?.put_bool(true)
    }

    fn get_parameter(&mut self, parameter: ParameterType) -> MxResult<ParameterValue> {
        let value = self.get(parameter.field_name())?;
        ParameterValue::from_field_value(parameter, &value)
    }

    fn set_parameter(&mut self, parameter: ParameterType, value: ParameterValue) -> MxResult<()> {
        let field = self.field(parameter.field_name())?;
        let datatype = field.connect()?.datatype;
        field.put(value.to_field_value(datatype)?)
    }

    fn read_type_field(&self, name: &str) -> MxResult<FieldValue> {
        match name {
            "server" => Ok(FieldValue::record_ref(self.server_name.clone())),
            "remote_record_name" => Ok(FieldValue::string(self.remote_record_name.clone())),
            other => Err(MxError::not_found(
                "read_type_field",
                format!("network proxy has no field '{}'", other),
            )),
        }
    }

    fn close(&mut self) {
        for field in self.fields.values_mut() {
            field.invalidate();
        }
    }
}

/// Lifecycle shared by every proxy: link at phase 2, forget cached remote
/// shapes on close.
macro_rules! remote_lifecycle {
    ($driver:ty) => {
        impl RecordDriver for $driver {
            fn finish_record_initialization(&mut self, ctx: &InitContext<'_>) -> MxResult<()> {
                self.remote.link(ctx)
            }

            fn close(&mut self) -> MxResult<()> {
                self.remote.close();
                Ok(())
            }

            fn read_type_field(&mut self, name: &str) -> MxResult<FieldValue> {
                self.remote.read_type_field(name)
            }

            fn write_type_field(&mut self, name: &str, _value: FieldValue) -> MxResult<()> {
                Err(MxError::new(
                    ErrorKind::ClientRequestDenied,
                    "write_type_field",
                    format!("'{}' is fixed by the record description", name),
                ))
            }
        }
    };
}

// =============================================================================
// network_motor
// =============================================================================

/// Split a remote `extended_status` string into position and status bits.
pub fn parse_extended_status(text: &str) -> MxResult<(f64, u64)> {
    const OP: &str = "network_motor_get_extended_status";
    let unparseable = |reason: String| MxError::new(ErrorKind::UnparseableString, OP, reason);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let [position, bits] = tokens.as_slice() else {
        return Err(unparseable(format!(
            "extended status '{}' has {} tokens, 2 expected",
            text,
            tokens.len()
        )));
    };
    let position = position
        .parse::<f64>()
        .map_err(|e| unparseable(format!("position '{}': {}", position, e)))?;
    let bits = u64::from_str_radix(bits, 16)
        .map_err(|e| unparseable(format!("status '{}': {}", bits, e)))?;
    Ok((position, bits))
}

/// Raw positions of a proxy motor are the remote motor's user units.
struct NetworkMotor {
    remote: RemoteRecord,
}

remote_lifecycle!(NetworkMotor);

impl MotorDriver for NetworkMotor {
    fn move_absolute(&mut self, _state: &mut MotorState, raw_destination: f64) -> MxResult<()> {
        self.remote.put_f64("destination", raw_destination)
    }

    fn get_position(&mut self, state: &mut MotorState) -> MxResult<()> {
        state.raw_position = self.remote.get_f64("position")?;
        Ok(())
    }

    fn set_position(&mut self, state: &mut MotorState, raw_position: f64) -> MxResult<()> {
        self.remote.put_f64("set_position", raw_position)?;
        state.raw_position = raw_position;
        Ok(())
    }

    fn soft_abort(&mut self, _state: &mut MotorState) -> MxResult<()> {
        self.remote.trigger("soft_abort")
    }

    fn immediate_abort(&mut self, _state: &mut MotorState) -> MxResult<()> {
        self.remote.trigger("immediate_abort")
    }

    fn busy(&mut self, _state: &mut MotorState) -> MxResult<bool> {
        self.remote.get_bool("busy")
    }

    fn find_home(&mut self, _state: &mut MotorState, direction: i64) -> MxResult<()> {
        self.remote.field("home_search")?.put(FieldValue::long(direction))
    }

    fn get_status(&mut self, _state: &mut MotorState) -> MxResult<u64> {
        self.remote.field("status")?.get(FieldType::Hex)?.as_u64()
    }

    fn get_extended_status(&mut self, state: &mut MotorState) -> MxResult<()> {
        let text = self.remote.field("extended_status")?.get_string()?;
        let (position, bits) = parse_extended_status(&text)?;
        state.raw_position = position;
        state.status = bits;
        Ok(())
    }

    fn get_parameter(
        &mut self,
        _state: &mut MotorState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        self.remote.get_parameter(parameter)
    }

    fn set_parameter(
        &mut self,
        _state: &mut MotorState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        self.remote.set_parameter(parameter, value)
    }
}

// =============================================================================
// network_mca
// =============================================================================

struct NetworkMca {
    remote: RemoteRecord,
}

remote_lifecycle!(NetworkMca);

impl NetworkMca {
    /// Replace one entry of the remote ROI array. The remote side validates
    /// (and clamps) the whole array.
    fn set_roi(&mut self, index: usize, roi: Roi) -> MxResult<()> {
        let field = self.remote.field("roi_array")?;
        let current = field.get(FieldType::UInt)?;
        let mut flat = current.as_u32_slice()?.to_vec();
        if 2 * index + 1 >= flat.len() {
            return Err(MxError::illegal_argument(
                "network_mca_set_roi",
                format!("roi {} requested but the remote mca has {}", index, flat.len() / 2),
            ));
        }
        flat[2 * index] = roi[0];
        flat[2 * index + 1] = roi[1];
        field.put(FieldValue::new(
            FieldType::UInt,
            current.dims().to_vec(),
            Elements::UInt(flat),
        )?)
    }

    fn readout_preference(&mut self) -> MxResult<ParameterValue> {
        if self.remote.version()? < READOUT_PREFERENCE_VERSION {
            return Ok(ParameterValue::Long(MCA_DEFAULT_READOUT_PREFERENCE));
        }
        self.remote.get_parameter(ParameterType::ReadoutPreference)
    }
}

impl McaDriver for NetworkMca {
    fn start(&mut self, _state: &mut McaState) -> MxResult<()> {
        self.remote.trigger("start")
    }

    fn stop(&mut self, _state: &mut McaState) -> MxResult<()> {
        self.remote.trigger("stop")
    }

    /// Fetch only the active channels. The remote channel count is read
    /// first and used as the array length.
    fn read(&mut self, state: &mut McaState) -> MxResult<()> {
        let channels = self.remote.get("current_num_channels")?.as_usize()?;
        let channels = channels.min(state.maximum_num_channels);
        let value = self
            .remote
            .field("channel_array")?
            .get_array(FieldType::UInt, Some(&[channels]))?;
        let counts = value.as_u32_slice()?;
        state.channel_array[..counts.len()].copy_from_slice(counts);
        state.channel_array[counts.len()..]
            .iter_mut()
            .for_each(|c| *c = 0);
        state.current_num_channels = channels;
        Ok(())
    }

    fn clear(&mut self, state: &mut McaState) -> MxResult<()> {
        self.remote.trigger("clear")?;
        state.channel_array.iter_mut().for_each(|c| *c = 0);
        state.roi_integral_array.iter_mut().for_each(|c| *c = 0);
        Ok(())
    }

    fn busy(&mut self, _state: &mut McaState) -> MxResult<bool> {
        self.remote.get_bool("busy")
    }

    fn get_parameter(
        &mut self,
        _state: &mut McaState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        match parameter {
            ParameterType::ReadoutPreference => self.readout_preference(),
            other => self.remote.get_parameter(other),
        }
    }

    fn set_parameter(
        &mut self,
        _state: &mut McaState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        match parameter {
            ParameterType::Roi(index) => self.set_roi(index, value.as_roi()?),
            other => self.remote.set_parameter(other, value),
        }
    }
}

// =============================================================================
// network_scaler
// =============================================================================

struct NetworkScaler {
    remote: RemoteRecord,
}

remote_lifecycle!(NetworkScaler);

impl ScalerDriver for NetworkScaler {
    fn clear(&mut self, _state: &mut ScalerState) -> MxResult<()> {
        self.remote.trigger("clear")
    }

    /// The remote `value` is already dark-current corrected.
    fn read(&mut self, state: &mut ScalerState) -> MxResult<()> {
        state.raw_value = self.remote.get("value")?.as_i64()?;
        Ok(())
    }

    fn overflow_set(&mut self, _state: &mut ScalerState) -> MxResult<bool> {
        self.remote.get_bool("overflow")
    }

    fn busy(&mut self, _state: &mut ScalerState) -> MxResult<bool> {
        self.remote.get_bool("busy")
    }

    fn start(&mut self, _state: &mut ScalerState, preset: f64) -> MxResult<()> {
        self.remote.put_f64("start", preset)
    }

    fn stop(&mut self, _state: &mut ScalerState) -> MxResult<()> {
        self.remote.trigger("stop")
    }

    fn get_parameter(
        &mut self,
        _state: &mut ScalerState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        self.remote.get_parameter(parameter)
    }

    fn set_parameter(
        &mut self,
        _state: &mut ScalerState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        self.remote.set_parameter(parameter, value)
    }
}

// =============================================================================
// network_timer
// =============================================================================

struct NetworkTimer {
    remote: RemoteRecord,
}

remote_lifecycle!(NetworkTimer);

impl TimerDriver for NetworkTimer {
    fn start(&mut self, _state: &mut TimerState, seconds: f64) -> MxResult<()> {
        self.remote.put_f64("start", seconds)
    }

    fn stop(&mut self, _state: &mut TimerState) -> MxResult<()> {
        self.remote.trigger("stop")
    }

    fn clear(&mut self, state: &mut TimerState) -> MxResult<()> {
        self.remote.trigger("clear")?;
        state.value = 0.0;
        Ok(())
    }

    fn busy(&mut self, _state: &mut TimerState) -> MxResult<bool> {
        self.remote.get_bool("busy")
    }

    fn read(&mut self, state: &mut TimerState) -> MxResult<()> {
        state.value = self.remote.get_f64("value")?;
        Ok(())
    }

    fn get_parameter(
        &mut self,
        _state: &mut TimerState,
        parameter: ParameterType,
    ) -> MxResult<ParameterValue> {
        self.remote.get_parameter(parameter)
    }

    fn set_parameter(
        &mut self,
        _state: &mut TimerState,
        parameter: ParameterType,
        value: ParameterValue,
    ) -> MxResult<()> {
        self.remote.set_parameter(parameter, value)
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Factory for the proxy driver of one record class.
pub struct NetworkDriverFactory {
    class: RecordClass,
}

impl NetworkDriverFactory {
    /// Proxy for a remote motor.
    pub fn motor() -> Self {
        Self {
            class: RecordClass::Motor,
        }
    }

    /// Proxy for a remote MCA.
    pub fn mca() -> Self {
        Self {
            class: RecordClass::Mca,
        }
    }

    /// Proxy for a remote scaler.
    pub fn scaler() -> Self {
        Self {
            class: RecordClass::Scaler,
        }
    }

    /// Proxy for a remote timer.
    pub fn timer() -> Self {
        Self {
            class: RecordClass::Timer,
        }
    }
}

impl DriverFactory for NetworkDriverFactory {
    fn driver_type(&self) -> &'static str {
        match self.class {
            RecordClass::Motor => "network_motor",
            RecordClass::Mca => "network_mca",
            RecordClass::Scaler => "network_scaler",
            _ => "network_timer",
        }
    }

    fn class(&self) -> RecordClass {
        self.class
    }

    fn description(&self) -> &'static str {
        "proxy for a record of the same class on a remote server"
    }

    fn type_fields(&self) -> Vec<FieldDescriptor> {
        remote_type_fields()
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let remote = RemoteRecord::from_description(ctx)?;
        let (a, defaults) = (ctx.assignments, ctx.defaults);
        let body = match self.class {
            RecordClass::Motor => ClassBody::Motor(MotorBody::new(
                MotorState::from_description(a, defaults)?,
                Box::new(NetworkMotor { remote }),
            )),
            RecordClass::Mca => ClassBody::Mca(McaBody::new(
                McaState::from_description(a, defaults)?,
                Box::new(NetworkMca { remote }),
            )),
            RecordClass::Scaler => ClassBody::Scaler(ScalerBody::new(
                ScalerState::from_description(a, defaults)?,
                Box::new(NetworkScaler { remote }),
            )),
            RecordClass::Timer => ClassBody::Timer(TimerBody::new(
                TimerState::from_description(a, defaults)?,
                Box::new(NetworkTimer { remote }),
            )),
            other => {
                return Err(MxError::unsupported(
                    "network_create_record_structures",
                    format!("no network proxy for class {}", other),
                ))
            }
        };
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{mca, motor};
    use crate::net::server::LoopbackServerFactory;
    use crate::net::{Operation, RequestLog};
    use crate::record::RecordList;

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    fn remote_list() -> Arc<RecordList> {
        let remote = RecordList::new();
        remote
            .create_record("m1", "soft_motor", &table("scale = 2.0"))
            .unwrap();
        remote
            .create_record(
                "det1",
                "soft_mca",
                &table("maximum_num_channels = 1000\nmaximum_num_rois = 4"),
            )
            .unwrap();
        remote.finish_initialization().unwrap();
        remote.open_all().unwrap();
        Arc::new(remote)
    }

    fn proxy_list(version: ServerVersion) -> (RecordList, RequestLog) {
        let factory = LoopbackServerFactory::new(remote_list()).with_version(version);
        let log = factory.request_log();
        let list = RecordList::new();
        list.register_driver(Arc::new(factory));
        list.create_record("srv", "loopback_server", &toml::Table::new())
            .unwrap();
        list.create_record("motor1", "network_motor", &table("server = \"srv\"\nremote_record_name = \"m1\""))
            .unwrap();
        list.create_record(
            "mca1",
            "network_mca",
            &table("server = \"srv\"\nremote_record_name = \"det1\"\nmaximum_num_channels = 1000"),
        )
        .unwrap();
        (list, log)
    }

    #[test]
    fn extended_status_needs_two_tokens() {
        assert_eq!(parse_extended_status("12.5 8001").unwrap(), (12.5, 0x8001));
        let err = parse_extended_status("12.5").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnparseableString);
        let err = parse_extended_status("12.5 zz").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnparseableString);
    }

    #[test]
    fn proxy_is_not_ready_before_linking() {
        let (list, log) = proxy_list(ServerVersion::CURRENT);
        let motor1 = list.find("motor1").unwrap();
        let err = motor::motor_get_position(&motor1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert!(log.is_empty());
    }

    #[test]
    fn motor_proxy_moves_the_remote_motor() {
        let (list, log) = proxy_list(ServerVersion::CURRENT);
        list.finish_initialization().unwrap();
        let motor1 = list.find("motor1").unwrap();

        motor::motor_move_absolute(&motor1, 4.0).unwrap();
        assert_eq!(motor::motor_get_position(&motor1).unwrap(), 4.0);
        assert!(!log.for_address("m1.destination").is_empty());

        let (position, bits) = motor::motor_get_extended_status(&motor1).unwrap();
        assert_eq!(position, 4.0);
        assert_eq!(bits & motor::status::IS_BUSY, 0);
    }

    #[test]
    fn readout_preference_is_not_requested_from_old_servers() {
        let (list, log) = proxy_list(ServerVersion::new(1, 5, 0));
        list.finish_initialization().unwrap();
        let mca1 = list.find("mca1").unwrap();

        let preference = mca::mca_get_readout_preference(&mca1).unwrap();
        assert_eq!(preference, MCA_DEFAULT_READOUT_PREFERENCE);
        assert!(log.for_address("det1.readout_preference").is_empty());
        assert_eq!(log.count(Operation::GetArray), 0);
    }

    #[test]
    fn readout_preference_is_requested_from_current_servers() {
        let (list, log) = proxy_list(READOUT_PREFERENCE_VERSION);
        list.finish_initialization().unwrap();
        let mca1 = list.find("mca1").unwrap();

        mca::mca_get_readout_preference(&mca1).unwrap();
        assert!(!log.for_address("det1.readout_preference").is_empty());
    }

    #[test]
    fn remote_roi_clamp_comes_back_as_the_same_error() {
        let (list, _log) = proxy_list(ServerVersion::CURRENT);
        list.finish_initialization().unwrap();
        let mca1 = list.find("mca1").unwrap();

        let err = mca::mca_set_roi(&mca1, 0, [100, 2000]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
        assert_eq!(mca::mca_get_roi(&mca1, 0).unwrap(), [100, 999]);
    }
}
