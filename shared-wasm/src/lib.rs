//! Wire protocol shared by the scope server and its clients.
//!
//! Everything here is plain serde data with no I/O so it can be compiled for
//! browser (WASM) clients as well as the native server.

pub mod command;
pub mod event;
pub mod log;
pub mod settings;
pub mod types;
pub mod wifi;

pub use command::ScopeCommand;
pub use event::{CommandError, FieldSetResult, ScopeEvent};
pub use log::{LogEntry, LogLevel};
pub use settings::{InstrumentSettings, SavedSettings, SettingsPatch};
pub use types::{
    Axis, Cam1Mode, CameraId, JobKind, JobState, LedChannel, Magnification, STEPS_PER_MM,
};
pub use wifi::{dedup_networks, WifiNetwork, WifiStatus};
