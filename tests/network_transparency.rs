//! Proxy records served from an in-process list through the loopback transport.

use std::sync::Arc;

use mx_records::device::{mca, motor, scaler, timer};
use mx_records::net::server::{server_handle, LoopbackServerFactory};
use mx_records::net::{NetworkField, Operation, RequestLog, ServerVersion};
use mx_records::parameter::{ParameterType, ParameterValue};
use mx_records::{ErrorKind, FieldType, FieldValue, RecordList};

fn table(text: &str) -> toml::Table {
    text.parse().unwrap()
}

fn remote() -> Arc<RecordList> {
    let list = RecordList::new();
    list.create_record("m1", "soft_motor", &table("speed = 2.0"))
        .unwrap();
    list.create_record(
        "det1",
        "soft_mca",
        &table("maximum_num_channels = 1000\nmaximum_num_rois = 4"),
    )
    .unwrap();
    list.create_record("sc1", "soft_scaler", &table("count_rate = 100.0"))
        .unwrap();
    list.create_record("t1", "soft_timer", &table("busy_polls = 1"))
        .unwrap();
    list.finish_initialization().unwrap();
    list.open_all().unwrap();
    Arc::new(list)
}

struct Setup {
    remote: Arc<RecordList>,
    local: RecordList,
    log: RequestLog,
}

fn setup(version: ServerVersion, wire_format: &str) -> Setup {
    let remote = remote();
    let factory = LoopbackServerFactory::new(Arc::clone(&remote)).with_version(version);
    let log = factory.request_log();
    let local = RecordList::new();
    local.register_driver(Arc::new(factory));
    local
        .create_record(
            "srv",
            "loopback_server",
            &table(&format!("wire_format = \"{}\"", wire_format)),
        )
        .unwrap();
    for (name, driver, extra) in [
        ("motor1", "network_motor", "remote_record_name = \"m1\""),
        (
            "mca1",
            "network_mca",
            "remote_record_name = \"det1\"\nmaximum_num_channels = 1000",
        ),
        ("scaler1", "network_scaler", "remote_record_name = \"sc1\""),
        ("timer1", "network_timer", "remote_record_name = \"t1\""),
    ] {
        local
            .create_record(name, driver, &table(&format!("server = \"srv\"\n{}", extra)))
            .unwrap();
    }
    local.finish_initialization().unwrap();
    local.open_all().unwrap();
    Setup { remote, local, log }
}

#[test]
fn old_server_gets_no_readout_preference_request() {
    let s = setup(ServerVersion::new(1, 5, 0), "xdr");
    let mca1 = s.local.find("mca1").unwrap();

    let preference = mca::mca_get_readout_preference(&mca1).unwrap();
    assert_eq!(preference, mca::MCA_DEFAULT_READOUT_PREFERENCE);
    assert!(s.log.for_address("det1.readout_preference").is_empty());
}

#[test]
fn new_server_is_asked_for_readout_preference() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let mca1 = s.local.find("mca1").unwrap();

    let preference = mca::mca_get_readout_preference(&mca1).unwrap();
    assert_eq!(preference, mca::MCA_DEFAULT_READOUT_PREFERENCE);
    assert!(s
        .log
        .for_address("det1.readout_preference")
        .iter()
        .any(|r| r.operation == Operation::GetArray));
}

#[test]
fn wrong_type_put_sends_nothing() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let server = server_handle(&s.local.find("srv").unwrap()).unwrap();
    let mut field = NetworkField::new(server, "m1", "home_search");
    assert_eq!(field.connect().unwrap().datatype, FieldType::Long);
    let sent = s.log.len();

    let err = field.put(FieldValue::double(1.0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
    assert_eq!(s.log.len(), sent);
}

#[test]
fn motor_parameters_reach_the_remote_record() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let motor1 = s.local.find("motor1").unwrap();
    let m1 = s.remote.find("m1").unwrap();

    assert_eq!(motor::motor_get_speed(&motor1).unwrap(), 2.0);
    motor::motor_set_speed(&motor1, 4.5).unwrap();
    assert_eq!(motor::motor_get_speed(&m1).unwrap(), 4.5);

    motor::motor_move_absolute(&motor1, -3.0).unwrap();
    assert!(!motor::motor_is_busy(&motor1).unwrap());
    assert_eq!(motor::motor_get_position(&m1).unwrap(), -3.0);
}

#[test]
fn remote_errors_keep_their_kind_through_the_proxy() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let motor1 = s.local.find("motor1").unwrap();

    let err = motor::motor_set_speed(&motor1, -1.0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalArgument);
}

#[test]
fn home_search_status_comes_from_the_remote_motor() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let motor1 = s.local.find("motor1").unwrap();

    motor::motor_move_absolute(&motor1, 5.0).unwrap();
    motor::motor_find_home(&motor1, 1).unwrap();
    let (position, bits) = motor::motor_get_extended_status(&motor1).unwrap();
    assert_eq!(position, 0.0);
    assert_ne!(bits & motor::status::HOME_SEARCH_SUCCEEDED, 0);
    assert_eq!(bits & motor::status::IS_BUSY, 0);
}

#[test]
fn scaler_proxy_counts_on_the_remote() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let scaler1 = s.local.find("scaler1").unwrap();

    scaler::scaler_start(&scaler1, 2.0).unwrap();
    assert_eq!(scaler::scaler_read(&scaler1).unwrap(), 200);
    assert!(!scaler::scaler_overflow_set(&scaler1).unwrap());

    scaler::scaler_clear(&scaler1).unwrap();
    assert_eq!(scaler::scaler_read(&s.remote.find("sc1").unwrap()).unwrap(), 0);
}

#[test]
fn timer_proxy_follows_the_remote_countdown() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let timer1 = s.local.find("timer1").unwrap();

    timer::timer_start(&timer1, 1.5).unwrap();
    assert!(timer::timer_is_busy(&timer1).unwrap());
    assert!(!timer::timer_is_busy(&timer1).unwrap());
    assert_eq!(timer::timer_read(&timer1).unwrap(), 1.5);
}

fn read_ten_channels(wire_format: &str) -> (Vec<u32>, Vec<Vec<usize>>) {
    let s = setup(ServerVersion::CURRENT, wire_format);
    let det1 = s.remote.find("det1").unwrap();
    mca::mca_set_num_channels(&det1, 10).unwrap();

    let mca1 = s.local.find("mca1").unwrap();
    mca::mca_start(&mca1).unwrap();
    let channels = mca::mca_read(&mca1).unwrap();
    let requested = s
        .log
        .for_address("det1.channel_array")
        .into_iter()
        .filter(|r| r.operation == Operation::GetArray)
        .map(|r| r.dims)
        .collect();
    (channels, requested)
}

#[test]
fn raw_reads_only_the_active_channels() {
    let (channels, requested) = read_ten_channels("raw");
    assert_eq!(channels, vec![1; 10]);
    assert_eq!(requested, vec![vec![10]]);
}

#[test]
fn xdr_reads_the_full_buffer_and_truncates() {
    let (channels, requested) = read_ten_channels("xdr");
    assert_eq!(channels, vec![1; 10]);
    assert_eq!(requested, vec![vec![1000]]);
}

#[test]
fn single_roi_writes_keep_the_other_rois() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let mca1 = s.local.find("mca1").unwrap();

    mca::mca_set_roi(&mca1, 1, [10, 20]).unwrap();
    mca::mca_set_roi(&mca1, 2, [30, 40]).unwrap();
    let det1 = s.remote.find("det1").unwrap();
    assert_eq!(mca::mca_get_roi(&det1, 1).unwrap(), [10, 20]);
    assert_eq!(mca::mca_get_roi(&det1, 2).unwrap(), [30, 40]);

    let err = mca::mca_set_roi(&mca1, 7, [0, 1]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalArgument);
}

#[test]
fn proxy_type_fields_are_read_only() {
    let s = setup(ServerVersion::CURRENT, "xdr");
    let motor1 = s.local.find("motor1").unwrap();

    assert_eq!(
        motor1.read_field("remote_record_name").unwrap(),
        FieldValue::string("m1")
    );
    let err = motor1
        .write_field("server", FieldValue::record_ref("other"))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ClientRequestDenied);

    let value = motor::motor_get_parameter(&motor1, ParameterType::ClosedLoop).unwrap();
    assert_eq!(value, ParameterValue::Bool(true));
}

fn lower_roi_bounds(wire_format: &str) -> (Vec<u32>, Vec<usize>) {
    let s = setup(ServerVersion::CURRENT, wire_format);
    let det1 = s.remote.find("det1").unwrap();
    for (index, roi) in [[10, 19], [20, 29], [30, 39], [40, 49]].into_iter().enumerate() {
        mca::mca_set_roi(&det1, index, roi).unwrap();
    }

    let server = server_handle(&s.local.find("srv").unwrap()).unwrap();
    let mut field = NetworkField::new(server, "det1", "roi_array");
    assert_eq!(field.connect().unwrap().dims, vec![4, 2]);
    let value = field.get_array(FieldType::UInt, Some(&[4, 1])).unwrap();
    (value.as_u32_slice().unwrap().to_vec(), value.dims().to_vec())
}

#[test]
fn inner_axis_override_keeps_one_column_per_row() {
    for wire_format in ["raw", "xdr"] {
        let (bounds, dims) = lower_roi_bounds(wire_format);
        assert_eq!(bounds, vec![10, 20, 30, 40], "{} wire format", wire_format);
        assert_eq!(dims, vec![4, 1]);
    }
}
