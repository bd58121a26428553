//! # MX Records
//!
//! Instrument control built around self-describing records. Every device is a
//! record with a name, a class (motor, MCA, scaler, ..) and a driver type; its
//! state is exposed as a table of typed fields that can be read and written
//! generically, locally or over the network.
//!
//! ## Crate Structure
//!
//! - **`record`**: The `Record` type, the three-phase lifecycle
//!   (create, cross-link, open) and the `RecordList` that owns every record.
//! - **`field`**: Field datatypes, values and descriptor tables.
//! - **`device`**: One module per device class. Each defines the class state,
//!   the driver trait with its default handlers and the validated class API
//!   (`motor_move_absolute`, `mca_set_roi`, ..).
//! - **`parameter`**: Parameter selectors and values shared by the classes.
//! - **`drivers`**: Built-in drivers: software devices and network proxies.
//! - **`net`**: Server records, remote field handles, message framing and the
//!   TCP and loopback transports.
//! - **`handle`**: Generational handle tables.
//! - **`autosave`**: Snapshot and restore of field values.
//! - **`config`**, **`logging`**: Figment settings and `tracing` setup.
//! - **`error`**: `MxError` and its error kinds.
//!
//! ```no_run
//! use mx_records::{config::Settings, device::motor, logging, record::RecordList};
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = Settings::load()?;
//! settings.validate()?;
//! logging::init_from_settings(&settings)?;
//!
//! let list = RecordList::load_from_settings(&settings)?;
//! list.open_all()?;
//! let m1 = list.find("m1")?;
//! motor::motor_move_absolute(&m1, 10.0)?;
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod clock;
pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod field;
pub mod handle;
pub mod logging;
pub mod net;
pub mod parameter;
pub mod record;

pub use error::{ErrorKind, MxError, MxResult};
pub use field::{FieldType, FieldValue};
pub use record::{Record, RecordClass, RecordList};
