// src/drivers/mod.rs
pub mod buffer;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod source;
pub mod stats;

pub use buffer::{ChannelSnapshot, RingBufferStore};
pub use decoder::{decode, FIELD_COUNT};
pub use error::{
    ConfigError, ConnectionError, DecodeError, DecodeFault, ExportError, SessionError, StateError,
};
pub use filter::LowPass;
pub use source::{
    list_ports, LineEvent, LineReader, Link, LinkOpener, ManualOpener, PortInfo, ScriptedLink,
    SerialOpener, SimulatedLink, SimulatedOpener,
};
pub use stats::{RunningAverage, RunningStats};
