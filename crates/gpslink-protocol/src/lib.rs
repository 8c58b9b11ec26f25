//! gpslink Protocol - Wire protocol for the telemetry feed
//!
//! The peer streams newline-delimited UTF-8 JSON over the transport.
//! This crate turns raw reads into lines ([`StreamBuffer`]), lines into
//! validated records ([`FrameDecoder`]), and provides the optional
//! client handshake line ([`ClientHello`]).

pub mod buffer;
pub mod decode;
pub mod message;

pub use buffer::StreamBuffer;
pub use decode::{
    preview, Frame, FrameDecoder, MalformedLineError, NonTelemetryReason, NonTelemetryRecord,
    PREVIEW_CHARS,
};
pub use message::{ClientHello, DEFAULT_CLIENT_NAME};
