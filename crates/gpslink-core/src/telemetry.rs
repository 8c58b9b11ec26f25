//! Telemetry record value object.

use serde::{Deserialize, Serialize};

/// A position fix carried by a telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
}

/// Where a record's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "millis", rename_all = "snake_case")]
pub enum RecordTimestamp {
    /// Supplied by the peer in the source line.
    Source(i64),
    /// Injected from the local clock at decode time.
    Injected(i64),
    /// Present in the source line but not a usable time value.
    Unparsed,
}

impl RecordTimestamp {
    /// Milliseconds since the Unix epoch, if the value could be read.
    pub fn millis(self) -> Option<i64> {
        match self {
            RecordTimestamp::Source(ms) | RecordTimestamp::Injected(ms) => Some(ms),
            RecordTimestamp::Unparsed => None,
        }
    }

    pub fn is_injected(self) -> bool {
        matches!(self, RecordTimestamp::Injected(_))
    }
}

/// One validated telemetry record.
///
/// Immutable: produced once per decoded line and handed to the caller.
/// `json` is the exact line to emit downstream: the original text when
/// the peer supplied a `timestamp` key (whatever its value), or the
/// object re-serialized with the injected timestamp otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    position: Position,
    timestamp: RecordTimestamp,
    raw: String,
    json: String,
}

impl TelemetryRecord {
    pub fn new(position: Position, timestamp: RecordTimestamp, raw: String, json: String) -> Self {
        Self {
            position,
            timestamp,
            raw,
            json,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn latitude(&self) -> f64 {
        self.position.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.position.longitude
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.position.accuracy
    }

    pub fn bearing(&self) -> Option<f64> {
        self.position.bearing
    }

    pub fn timestamp(&self) -> RecordTimestamp {
        self.timestamp
    }

    /// The line as it arrived, without the trailing newline.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The line to forward downstream.
    pub fn to_json_line(&self) -> &str {
        &self.json
    }
}
