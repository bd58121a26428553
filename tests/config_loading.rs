//! Building a record list from configuration files.

use std::io::Write;

use mx_records::autosave::{self, Snapshot};
use mx_records::config::Settings;
use mx_records::device::{mca, motor, scaler};
use mx_records::net::FieldAddress;
use mx_records::{ErrorKind, RecordClass, RecordList};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn shipped_configuration_builds_every_record() {
    let settings = Settings::load_from("config/mx.toml").unwrap();
    settings.validate().unwrap();

    let list = RecordList::load_from_settings(&settings).unwrap();
    list.open_all().unwrap();
    assert_eq!(list.len(), settings.records.len());
    assert_eq!(list.find_class(RecordClass::Motor).len(), 1);

    let mca1 = list.find("mca1").unwrap();
    assert_eq!(mca::mca_get_roi(&mca1, 1).unwrap(), [300, 400]);

    let sc1 = list.find("sc1").unwrap();
    scaler::scaler_start(&sc1, 1.0).unwrap();
    assert_eq!(scaler::scaler_read_raw(&sc1).unwrap(), 1000);
    list.close_all().unwrap();
}

#[test]
fn network_defaults_reach_the_records() {
    let file = write_config(
        r#"
[network]
busy_start_interval_secs = 30.0

[[records]]
name = "m1"
driver = "soft_motor"
"#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    let list = RecordList::load_from_settings(&settings).unwrap();
    let m1 = list.find("m1").unwrap();

    assert_eq!(
        m1.read_field("busy_start_interval").unwrap().as_f64().unwrap(),
        30.0
    );
    motor::motor_move_absolute(&m1, 1.0).unwrap();
    assert!(motor::motor_is_busy(&m1).unwrap());
}

#[test]
fn unknown_driver_type_fails_to_load() {
    let file = write_config(
        r#"
[[records]]
name = "x1"
driver = "no_such_driver"
"#,
    );
    let settings = Settings::load_from(file.path()).unwrap();
    let err = RecordList::load_from_settings(&settings).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[test]
fn autosave_survives_a_reload() {
    let settings = Settings::load_from("config/mx.toml").unwrap();
    let list = RecordList::load_from_settings(&settings).unwrap();
    let m1 = list.find("m1").unwrap();
    motor::motor_set_speed(&m1, 7.0).unwrap();
    let mca1 = list.find("mca1").unwrap();
    mca::mca_set_roi(&mca1, 3, [5, 6]).unwrap();

    let fields = autosave::autosave_fields(&list);
    assert!(fields.contains(&FieldAddress::new("mca1", "roi_array")));
    let json = autosave::snapshot(&list, &fields).unwrap().to_json().unwrap();

    let fresh = RecordList::load_from_settings(&settings).unwrap();
    let failures = autosave::restore(&fresh, &Snapshot::from_json(&json).unwrap());
    assert!(failures.is_empty(), "restore failures: {:?}", failures);
    assert_eq!(motor::motor_get_speed(&fresh.find("m1").unwrap()).unwrap(), 7.0);
    assert_eq!(mca::mca_get_roi(&fresh.find("mca1").unwrap(), 3).unwrap(), [5, 6]);
}
