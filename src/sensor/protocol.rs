//! # Sensor Protocol Constants and Types
//!
//! Core definitions for the sensor's line protocol.

/// Start a collection run
pub const CMD_START: u8 = b'S';

/// Stop the current collection run
pub const CMD_STOP: u8 = b'X';

/// Liveness probe, ignored by the firmware
pub const CMD_PROBE: u8 = 0x00;

/// Line terminator sent by the firmware
pub const LINE_TERMINATOR: u8 = b'\n';

/// Field separator in data lines
pub const FIELD_SEPARATOR: char = ',';

/// Fields in a data line: moisture, temperature, humidity
pub const DATA_FIELD_COUNT: usize = 3;

/// Prefix of a progress report, e.g. `Loop: 3`
pub const LOOP_PREFIX: &str = "Loop:";

/// Prefix of the end-of-run marker, e.g. `Complete: Finished 5 loops`
pub const COMPLETE_PREFIX: &str = "Complete:";

/// Marker substring of the start acknowledgement
pub const STARTED_MARKER: &str = "Started";

/// Marker substring of the stop acknowledgement
pub const STOPPED_MARKER: &str = "Stopped";

/// Host-to-device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Probe,
}

impl Command {
    /// Single-byte wire encoding of the command
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Start => CMD_START,
            Command::Stop => CMD_STOP,
            Command::Probe => CMD_PROBE,
        }
    }
}

/// One decoded data line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    /// Soil moisture in percent (not range checked)
    pub moisture_percent: f64,

    /// Air temperature in degrees Celsius
    pub temperature: f64,

    /// Relative humidity in percent
    pub humidity: f64,
}

/// Control message from the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Start acknowledgement, carrying the trimmed line
    Started(String),

    /// Stop acknowledgement, carrying the trimmed line
    Stopped(String),

    /// Number of completed sampling loops
    Loop(u32),

    /// End-of-run marker with its trailing message
    Complete(String),
}

/// Classification of a single line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Sample(SensorSample),
    Status(StatusEvent),
}
