//! Decoding NDJSON lines into telemetry records.
//!
//! Every line yields exactly one [`Frame`]. Nothing here returns an
//! error to the caller: a bad line is a value (`Frame::Malformed`) so the
//! stream keeps flowing.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use gpslink_core::{Position, RecordTimestamp, TelemetryRecord};

/// Maximum characters of a bad line echoed into diagnostics.
pub const PREVIEW_CHARS: usize = 50;

const LATITUDE: &str = "latitude";
const LONGITUDE: &str = "longitude";
const ACCURACY: &str = "accuracy";
const BEARING: &str = "bearing";
const TIMESTAMP: &str = "timestamp";

// ============================================================================
// Frame Types
// ============================================================================

/// Result of decoding one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Valid position-bearing record, ready to emit.
    Telemetry(TelemetryRecord),
    /// Valid JSON that carries no position. Logged, never forwarded.
    NonTelemetry(NonTelemetryRecord),
    /// Not JSON at all. Logged, never forwarded, never fatal.
    Malformed(MalformedLineError),
}

/// Why a JSON value was not accepted as telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTelemetryReason {
    /// Top-level value is an array, string, number, etc.
    NotAnObject,
    /// `latitude` or `longitude` is absent.
    MissingPosition,
    /// `latitude` or `longitude` is present but not a number.
    NonNumericPosition,
}

/// A JSON line that parsed but is not telemetry (status, ack, hello...).
#[derive(Debug, Clone, PartialEq)]
pub struct NonTelemetryRecord {
    pub reason: NonTelemetryReason,
    /// Value of a string `type` field, if the peer tagged the message.
    pub kind: Option<String>,
    /// Top-level keys, in arrival order.
    pub keys: Vec<String>,
}

impl NonTelemetryRecord {
    /// One-line summary for diagnostics.
    pub fn summary(&self) -> String {
        let reason = match self.reason {
            NonTelemetryReason::NotAnObject => "not_an_object",
            NonTelemetryReason::MissingPosition => "missing_position",
            NonTelemetryReason::NonNumericPosition => "non_numeric_position",
        };
        match &self.kind {
            Some(kind) => format!("{reason},type={kind},keys={}", self.keys.join("|")),
            None => format!("{reason},keys={}", self.keys.join("|")),
        }
    }
}

/// A line that is not valid JSON.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed line ({reason}): {preview}")]
pub struct MalformedLineError {
    /// First [`PREVIEW_CHARS`] characters of the line.
    pub preview: String,
    /// Parser message.
    pub reason: String,
}

/// Returns at most `max_chars` characters, never splitting a character.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text.get(..cut).unwrap_or(text).to_string(),
        None => text.to_string(),
    }
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// Stateless line decoder with an injectable clock.
///
/// Holds no per-stream state, so one bad line can never affect the next.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    clock: fn() -> i64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl FrameDecoder {
    /// Decoder stamping missing timestamps from the system clock.
    pub fn new() -> Self {
        Self {
            clock: wall_clock_millis,
        }
    }

    /// Decoder with a custom millisecond clock.
    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self { clock }
    }

    /// Decodes one line (trailing `\r`/whitespace is ignored).
    pub fn decode(&self, line: &str) -> Frame {
        self.decode_at(line, (self.clock)())
    }

    /// Decodes one line using `now_ms` for timestamp injection.
    pub fn decode_at(&self, line: &str, now_ms: i64) -> Frame {
        let text = line.trim();

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return Frame::Malformed(MalformedLineError {
                    preview: preview(text, PREVIEW_CHARS),
                    reason: e.to_string(),
                })
            }
        };

        let mut object = match value {
            Value::Object(object) => object,
            _ => {
                return Frame::NonTelemetry(NonTelemetryRecord {
                    reason: NonTelemetryReason::NotAnObject,
                    kind: None,
                    keys: Vec::new(),
                })
            }
        };

        let position = match read_position(&object) {
            Ok(position) => position,
            Err(reason) => {
                return Frame::NonTelemetry(NonTelemetryRecord {
                    reason,
                    kind: object
                        .get("type")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    keys: object.keys().cloned().collect(),
                })
            }
        };

        if object.contains_key(TIMESTAMP) {
            let timestamp = match read_timestamp(&object) {
                Some(ms) => RecordTimestamp::Source(ms),
                None => {
                    debug!(preview = %preview(text, PREVIEW_CHARS), "Forwarding record with unreadable timestamp");
                    RecordTimestamp::Unparsed
                }
            };
            return Frame::Telemetry(TelemetryRecord::new(
                position,
                timestamp,
                text.to_string(),
                text.to_string(),
            ));
        }

        object.insert(TIMESTAMP.to_string(), Value::from(now_ms));
        match serde_json::to_string(&object) {
            Ok(json) => Frame::Telemetry(TelemetryRecord::new(
                position,
                RecordTimestamp::Injected(now_ms),
                text.to_string(),
                json,
            )),
            Err(e) => Frame::Malformed(MalformedLineError {
                preview: preview(text, PREVIEW_CHARS),
                reason: e.to_string(),
            }),
        }
    }
}

fn read_position(object: &Map<String, Value>) -> Result<Position, NonTelemetryReason> {
    let (Some(lat), Some(lon)) = (object.get(LATITUDE), object.get(LONGITUDE)) else {
        return Err(NonTelemetryReason::MissingPosition);
    };
    let (Some(latitude), Some(longitude)) = (lat.as_f64(), lon.as_f64()) else {
        return Err(NonTelemetryReason::NonNumericPosition);
    };

    Ok(Position {
        latitude,
        longitude,
        accuracy: object.get(ACCURACY).and_then(Value::as_f64),
        bearing: object.get(BEARING).and_then(Value::as_f64),
    })
}

/// Integer millis, float millis (truncated) or an RFC 3339 string.
fn read_timestamp(object: &Map<String, Value>) -> Option<i64> {
    let value = object.get(TIMESTAMP)?;
    if let Some(ms) = value.as_i64() {
        return Some(ms);
    }
    if let Some(ms) = value.as_f64() {
        return Some(ms as i64);
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}
