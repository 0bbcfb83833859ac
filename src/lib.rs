// src/lib.rs
//! Serial acquisition, live statistics and CSV export for a brake dynamometer.
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod session;
pub mod smoothing;
pub mod types;

pub use config::DaqConfig;
pub use session::Session;
pub use types::{Channel, ExportReport, Sample, SessionEvent, SessionState, SessionStatus};
