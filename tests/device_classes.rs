//! Class-level behaviour exercised through the software drivers.

use std::sync::Arc;
use std::time::Duration;

use mx_records::clock::ManualClock;
use mx_records::device::autoscale::{self, ChangeRequest};
use mx_records::device::mca::{McaBody, McaDriver, McaState};
use mx_records::device::{mca, motor, scaler, timer};
use mx_records::field::{resolve_dimension, Dimension, FieldAssignments};
use mx_records::record::{ClassBody, CreateContext, DriverFactory, RecordDriver};
use mx_records::{ErrorKind, FieldValue, MxError, MxResult, RecordClass, RecordList};

fn table(text: &str) -> toml::Table {
    text.parse().unwrap()
}

fn opened(list: RecordList) -> RecordList {
    list.finish_initialization().unwrap();
    list.open_all().unwrap();
    list
}

#[test]
fn roi_past_the_last_channel_is_clamped_and_reported() {
    let list = RecordList::new();
    list.create_record(
        "mca1",
        "soft_mca",
        &table("maximum_num_channels = 1000\ncurrent_num_channels = 1000\nmaximum_num_rois = 4"),
    )
    .unwrap();
    let list = opened(list);
    let mca1 = list.find("mca1").unwrap();

    let err = mca::mca_set_roi(&mca1, 0, [100, 2000]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
    assert_eq!(mca::mca_get_roi(&mca1, 0).unwrap(), [100, 999]);

    // The stored ROI is also what the field table reports.
    let flat = mca1.read_field("roi_array").unwrap();
    assert_eq!(&flat.as_u32_slice().unwrap()[..2], &[100, 999]);
}

#[test]
fn varargs_dimension_needs_its_field_assigned_first() {
    let dimension = Dimension::Varargs("maximum_num_rois");
    let mut assigned = FieldAssignments::new();

    let err = resolve_dimension(&dimension, &assigned).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalArgument);

    assigned.assign("maximum_num_rois", FieldValue::ulong(6));
    assert_eq!(resolve_dimension(&dimension, &assigned).unwrap(), 6);
}

#[test]
fn roi_integral_saturates_over_the_record() {
    let list = RecordList::new();
    list.create_record(
        "mca1",
        "soft_mca",
        &table("maximum_num_channels = 4\nmaximum_num_rois = 1\ncounts_per_poll = 4000000000"),
    )
    .unwrap();
    let list = opened(list);
    let mca1 = list.find("mca1").unwrap();

    mca::mca_set_roi(&mca1, 0, [0, 3]).unwrap();
    mca::mca_start(&mca1).unwrap();
    mca::mca_read(&mca1).unwrap();
    assert_eq!(mca::mca_get_roi_integral(&mca1, 0).unwrap(), u32::MAX);
}

#[test]
fn busy_start_window_masks_an_early_idle() {
    let clock = ManualClock::new();
    let list = RecordList::new().with_clock(Arc::new(clock.clone()));
    list.create_record("m1", "soft_motor", &table("busy_start_interval = 0.5"))
        .unwrap();
    let list = opened(list);
    let m1 = list.find("m1").unwrap();

    clock.advance(Duration::from_secs(10));
    motor::motor_move_absolute(&m1, 1.0).unwrap();
    assert!(motor::motor_is_busy(&m1).unwrap());

    clock.advance(Duration::from_millis(500));
    assert!(motor::motor_is_busy(&m1).unwrap());

    clock.advance(Duration::from_millis(1));
    assert!(!motor::motor_is_busy(&m1).unwrap());
}

#[test]
fn zero_window_passes_driver_busy_through() {
    let clock = ManualClock::new();
    let list = RecordList::new().with_clock(Arc::new(clock.clone()));
    list.create_record("t1", "soft_timer", &table("busy_polls = 2"))
        .unwrap();
    let list = opened(list);
    let t1 = list.find("t1").unwrap();

    timer::timer_start(&t1, 2.5).unwrap();
    assert!(timer::timer_is_busy(&t1).unwrap());
    assert!(timer::timer_is_busy(&t1).unwrap());
    assert!(!timer::timer_is_busy(&t1).unwrap());
    assert_eq!(timer::timer_read(&t1).unwrap(), 2.5);

    timer::timer_clear(&t1).unwrap();
    assert_eq!(timer::timer_read(&t1).unwrap(), 0.0);
}

#[test]
fn motor_limits_are_checked_in_user_units() {
    let list = RecordList::new();
    list.create_record(
        "m1",
        "soft_motor",
        &table("scale = 2.0\noffset = 1.0\npositive_limit = 10.0\nnegative_limit = -10.0"),
    )
    .unwrap();
    let list = opened(list);
    let m1 = list.find("m1").unwrap();

    let err = motor::motor_move_absolute(&m1, 11.0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::LimitExceeded);

    motor::motor_move_absolute(&m1, 9.0).unwrap();
    assert_eq!(motor::motor_get_position(&m1).unwrap(), 9.0);
    assert_eq!(m1.read_field("raw_position").unwrap(), FieldValue::double(4.0));
}

#[test]
fn autoscale_steps_offsets_from_its_monitor() {
    let list = RecordList::new();
    list.create_record("sc1", "soft_scaler", &table("counts = 5000"))
        .unwrap();
    list.create_record(
        "auto1",
        "scaler_autoscale",
        &table(
            "monitor_record = \"sc1\"\nlow_limit = 100.0\nhigh_limit = 1000.0\n\
             num_monitor_offsets = 3\nmonitor_offset_array = [0.0, 10.0, 20.0]",
        ),
    )
    .unwrap();
    let list = opened(list);
    let sc1 = list.find("sc1").unwrap();
    let auto1 = list.find("auto1").unwrap();

    assert_eq!(scaler::scaler_read(&sc1).unwrap(), 5000);
    assert_eq!(autoscale::autoscale_read_monitor(&auto1).unwrap(), 5000.0);
    let request = autoscale::autoscale_get_change_request(&auto1).unwrap();
    assert_eq!(request, ChangeRequest::Down);

    // Already at the first offset: a further step down clamps and reports.
    let err = autoscale::autoscale_change_control(&auto1, request).unwrap_err();
    assert_eq!(err.kind, ErrorKind::WouldExceedLimit);
    assert_eq!(autoscale::autoscale_get_offset_index(&auto1).unwrap(), 0);

    autoscale::autoscale_change_control(&auto1, ChangeRequest::Up).unwrap();
    assert_eq!(autoscale::autoscale_get_offset_index(&auto1).unwrap(), 1);
    assert_eq!(autoscale::autoscale_read_monitor(&auto1).unwrap(), 4990.0);
}

#[test]
fn autoscale_monitor_must_be_a_scaler() {
    let list = RecordList::new();
    list.create_record("m1", "soft_motor", &toml::Table::new())
        .unwrap();
    list.create_record("auto1", "scaler_autoscale", &table("monitor_record = \"m1\""))
        .unwrap();
    let err = list.finish_initialization().unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn each_finished_acquisition_notifies_new_data() {
    let list = RecordList::new();
    list.create_record(
        "mca1",
        "soft_mca",
        &table("maximum_num_channels = 8\nmaximum_num_rois = 1\nbusy_polls = 2"),
    )
    .unwrap();
    let list = opened(list);
    let mca1 = list.find("mca1").unwrap();
    let mut rx = mca1.subscribe("new_data_available").unwrap();
    assert_eq!(*rx.borrow_and_update(), FieldValue::bool(false));

    for _ in 0..2 {
        mca::mca_start(&mca1).unwrap();
        assert!(!mca::mca_is_new_data_available(&mca1).unwrap());
        while mca::mca_is_busy(&mca1).unwrap() {}

        // The second pass publishes `true` again over an unchanged `true`.
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), FieldValue::bool(true));
        assert!(mca::mca_is_new_data_available(&mca1).unwrap());

        mca::mca_read(&mca1).unwrap();
        assert!(!mca::mca_is_new_data_available(&mca1).unwrap());
    }
}

#[test]
fn missing_roi_count_defaults_to_none() {
    let list = RecordList::new();
    list.create_record("mca1", "soft_mca", &table("maximum_num_channels = 8"))
        .unwrap();
    let list = opened(list);
    let mca1 = list.find("mca1").unwrap();

    assert_eq!(mca1.read_field("maximum_num_rois").unwrap(), FieldValue::ulong(0));
    assert_eq!(mca1.locate_field("roi_array").unwrap().dims(), &[0, 2]);
    let err = mca::mca_get_roi(&mca1, 0).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IllegalArgument);
}

/// MCA whose busy query reports a broken internal state.
struct BrokenMca;

impl RecordDriver for BrokenMca {}

impl McaDriver for BrokenMca {
    fn start(&mut self, _state: &mut McaState) -> MxResult<()> {
        Ok(())
    }

    fn stop(&mut self, _state: &mut McaState) -> MxResult<()> {
        Ok(())
    }

    fn read(&mut self, _state: &mut McaState) -> MxResult<()> {
        Ok(())
    }

    fn busy(&mut self, _state: &mut McaState) -> MxResult<bool> {
        Err(MxError::corrupt("broken_mca_busy", "status block checksum mismatch"))
    }
}

struct BrokenMcaFactory;

impl DriverFactory for BrokenMcaFactory {
    fn driver_type(&self) -> &'static str {
        "broken_mca"
    }

    fn class(&self) -> RecordClass {
        RecordClass::Mca
    }

    fn create_record_structures(&self, ctx: &CreateContext<'_>) -> MxResult<ClassBody> {
        let state = McaState::from_description(ctx.assignments, ctx.defaults)?;
        Ok(ClassBody::Mca(McaBody::new(state, Box::new(BrokenMca))))
    }
}

#[test]
fn corrupt_record_is_quarantined_and_others_keep_working() {
    let list = RecordList::new();
    list.register_driver(Arc::new(BrokenMcaFactory));
    let fields = table("maximum_num_channels = 8\nmaximum_num_rois = 1");
    list.create_record("bad1", "broken_mca", &fields).unwrap();
    list.create_record("good1", "soft_mca", &fields).unwrap();
    let list = opened(list);
    let bad1 = list.find("bad1").unwrap();
    let good1 = list.find("good1").unwrap();

    let err = mca::mca_is_busy(&bad1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptDataStructure);
    assert!(bad1.is_quarantined());
    assert!(bad1.fault().unwrap().contains("checksum"));

    // Calls that would succeed on a healthy record are refused now.
    let err = mca::mca_start(&bad1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptDataStructure);

    assert!(!good1.is_quarantined());
    mca::mca_start(&good1).unwrap();
    assert!(!mca::mca_is_busy(&good1).unwrap());
}
