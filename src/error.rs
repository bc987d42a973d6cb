//! Error types for encoding and printing.
//!
//! Encoding errors describe a malformed job and are surfaced unchanged. Transport
//! errors describe the environment (missing device, failed write, full disk) and
//! are scoped to the job that hit them.

use crate::device::PrinterDescriptor;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning an image or text into a command stream.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The source bytes are not a raster image the decoder understands.
    #[error("Can't decode source image")]
    ImageDecode(#[from] image::ImageError),

    /// Text contains a byte outside 7-bit ASCII.
    ///
    /// Undefined bytes can leave printer firmware in an odd code page state,
    /// so the encoder refuses instead of transliterating.
    #[error("Non-ASCII byte 0x{byte:02X} at line {line}, column {column}")]
    NonAsciiInput { line: usize, column: usize, byte: u8 },

    /// A header field can't hold the requested value.
    #[error("{field} of {value} exceeds the maximum of {max}")]
    DimensionOverflow {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("Bitmap data is {actual} bytes, expected {expected}")]
    InvalidBitmap { expected: usize, actual: usize },

    #[error("Invalid encoder configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while delivering a command stream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Can't enumerate attached devices: {0}")]
    DeviceEnumeration(String),

    /// No attached device answers to the descriptor, or it can't be opened.
    #[error("Device {descriptor} is not attached or can't be opened")]
    DeviceNotFound { descriptor: PrinterDescriptor },

    #[error("Device is missing a bulk OUT endpoint")]
    MissingEndpoint,

    /// The device stopped accepting bytes before the stream was complete.
    #[error("Write stopped after {written} of {total} bytes")]
    Write { written: usize, total: usize },

    /// The capture file could not be appended to.
    #[error("Can't write capture file {}", .path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

/// Result of a whole print job.
#[derive(Error, Debug)]
pub enum PrintError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Print failed: {0}")]
    Transport(#[from] TransportError),
}

/// Malformed configuration value.
#[derive(Error, Debug)]
#[error("Invalid value {value:?} for {key}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
