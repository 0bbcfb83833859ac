// src/types.rs
use std::fmt::{self, Write as _};
use std::path::PathBuf;

use crate::drivers::error::{ConnectionError, DecodeError, ExportError};

/// Header names for the 14 wire/export fields, in wire order.
pub const FIELD_NAMES: [&str; 14] = [
    "timestamp_ms",
    "ir1",
    "ir2",
    "ir3",
    "ir4",
    "ir5",
    "ir6",
    "ir7",
    "ir8",
    "thermocouple_pad",
    "thermocouple_caliper",
    "load_cell_force",
    "brake_pressure",
    "rotor_rpm",
];

/// One of the 13 measured series, in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ir1,
    Ir2,
    Ir3,
    Ir4,
    Ir5,
    Ir6,
    Ir7,
    Ir8,
    PadTemperature,
    CaliperTemperature,
    Force,
    Pressure,
    Rpm,
}

impl Channel {
    pub const COUNT: usize = 13;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Ir1,
        Channel::Ir2,
        Channel::Ir3,
        Channel::Ir4,
        Channel::Ir5,
        Channel::Ir6,
        Channel::Ir7,
        Channel::Ir8,
        Channel::PadTemperature,
        Channel::CaliperTemperature,
        Channel::Force,
        Channel::Pressure,
        Channel::Rpm,
    ];

    pub const IR: [Channel; 8] = [
        Channel::Ir1,
        Channel::Ir2,
        Channel::Ir3,
        Channel::Ir4,
        Channel::Ir5,
        Channel::Ir6,
        Channel::Ir7,
        Channel::Ir8,
    ];

    /// Position among the 13 channels (wire position minus the timestamp).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Channel> {
        Self::ALL.get(index).copied()
    }

    /// Field name used on the wire and in the export header.
    pub fn label(self) -> &'static str {
        FIELD_NAMES[self.index() + 1]
    }

    pub fn from_label(label: &str) -> Option<Channel> {
        Self::ALL.iter().copied().find(|c| c.label() == label)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One fully decoded telemetry record.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Device clock. Not assumed monotonic across reconnects.
    pub timestamp_ms: i64,
    pub ir_temperatures: [f64; 8],
    pub thermocouple_pad: f64,
    pub thermocouple_caliper: f64,
    pub load_cell_force: f64,
    pub brake_pressure: f64,
    pub rotor_rpm: f64,
}

impl Sample {
    pub fn from_values(timestamp_ms: i64, values: [f64; Channel::COUNT]) -> Self {
        let mut ir_temperatures = [0.0; 8];
        ir_temperatures.copy_from_slice(&values[..8]);
        Self {
            timestamp_ms,
            ir_temperatures,
            thermocouple_pad: values[8],
            thermocouple_caliper: values[9],
            load_cell_force: values[10],
            brake_pressure: values[11],
            rotor_rpm: values[12],
        }
    }

    pub fn value(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Ir1 => self.ir_temperatures[0],
            Channel::Ir2 => self.ir_temperatures[1],
            Channel::Ir3 => self.ir_temperatures[2],
            Channel::Ir4 => self.ir_temperatures[3],
            Channel::Ir5 => self.ir_temperatures[4],
            Channel::Ir6 => self.ir_temperatures[5],
            Channel::Ir7 => self.ir_temperatures[6],
            Channel::Ir8 => self.ir_temperatures[7],
            Channel::PadTemperature => self.thermocouple_pad,
            Channel::CaliperTemperature => self.thermocouple_caliper,
            Channel::Force => self.load_cell_force,
            Channel::Pressure => self.brake_pressure,
            Channel::Rpm => self.rotor_rpm,
        }
    }

    /// All channel values in wire order.
    pub fn values(&self) -> [f64; Channel::COUNT] {
        Channel::ALL.map(|c| self.value(c))
    }

    /// Export row without the trailing newline. `decode` of this row gives back `self`.
    ///
    /// Floats use the shortest representation that parses back to the same
    /// value; `Display` for `f64` never switches to exponent notation, so the
    /// output is stable across runs.
    pub fn to_csv_row(&self) -> String {
        let mut row = String::with_capacity(128);
        let _ = write!(row, "{}", self.timestamp_ms);
        for value in self.values() {
            let _ = write!(row, ",{}", value);
        }
        row
    }
}

/// The export header row, without the trailing newline.
pub fn csv_header() -> String {
    FIELD_NAMES.join(",")
}

/// Session lifecycle. Exporting is tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
}

/// Outcome of stopping an export.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportReport {
    pub path: PathBuf,
    /// Rows durably flushed to the file.
    pub written: u64,
    /// Samples handed to the sink that did not reach the file.
    pub unflushed: u64,
    pub failure: Option<ExportError>,
}

impl ExportReport {
    pub fn is_complete(&self) -> bool {
        self.unflushed == 0 && self.failure.is_none()
    }
}

// Signals from the background workers to whoever drives the session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    AcquisitionStarted { port: String, baud_rate: u32 },
    AcquisitionStopped,
    ConnectionLost(ConnectionError),
    ExportStarted { path: PathBuf },
    ExportStopped(ExportReport),
    ExportFailed(ExportError),
}

/// Point-in-time health view for the control surface.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub exporting: bool,
    pub export_path: Option<PathBuf>,
    pub lines_read: u64,
    pub samples_accepted: u64,
    pub malformed_lines: u64,
    pub export_overflows: u64,
    pub last_decode_error: Option<DecodeError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_labels_follow_wire_order() {
        assert_eq!(Channel::Ir1.label(), "ir1");
        assert_eq!(Channel::Ir8.label(), "ir8");
        assert_eq!(Channel::PadTemperature.label(), "thermocouple_pad");
        assert_eq!(Channel::Rpm.label(), "rotor_rpm");
        for (i, c) in Channel::ALL.iter().enumerate() {
            assert_eq!(c.index(), i);
            assert_eq!(Channel::from_index(i), Some(*c));
            assert_eq!(Channel::from_label(c.label()), Some(*c));
        }
        assert_eq!(Channel::from_index(13), None);
    }

    #[test]
    fn csv_row_keeps_exact_values() {
        let values = [
            25.4, 26.1, 27.3, 24.8, 25.6, 27.1, 26.5, 24.9, 300.4, 305.6, 125.3, 2.5, 3500.0,
        ];
        let sample = Sample::from_values(1620294785, values);
        assert_eq!(sample.values(), values);
        assert_eq!(
            sample.to_csv_row(),
            "1620294785,25.4,26.1,27.3,24.8,25.6,27.1,26.5,24.9,300.4,305.6,125.3,2.5,3500"
        );
        assert!(csv_header().starts_with("timestamp_ms,ir1,"));
        assert_eq!(csv_header().split(',').count(), 14);
    }
}
