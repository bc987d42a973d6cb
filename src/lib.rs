//! ESC/POS Thermal Printer Core
//!
//! This crate turns images and ASCII text into ESC/POS command streams for
//! 58mm thermal receipt printers and delivers them over USB, a serial port, or
//! into a capture file when no hardware is around.
//!
//! # Example
//!
//! ```rust,no_run
//! use escpos_thermal::{Config, PrintJob, Printer};
//!
//! let config = Config::from_env().unwrap();
//! let printer = Printer::new(config).unwrap();
//! let job = PrintJob::new()
//!     .encoded_image(std::fs::read("drawing.png").unwrap())
//!     .text("What do you think this drawing shows?");
//! printer.print(&job).unwrap();
//! ```

mod bitmap;
mod device;
mod error;
mod escpos;
mod printer;
mod sanitize;
mod transport;

pub use crate::{
    bitmap::{bytes_per_row, normalize, normalize_image, Binarize, Bitmap},
    device::{
        resolve, select, AttachedDevice, DeviceId, DeviceProbe, DeviceTable, HostProbe,
        PrinterDescriptor, TransportKind, FALLBACK_PRINTER, KNOWN_PRINTERS,
    },
    error::{ConfigError, EncodeError, PrintError, TransportError},
    escpos::{concat, CommandStream, CutMode, Encoder, EncoderConfig},
    printer::{Config, PrintJob, Printer},
    sanitize::sanitize_for_receipt,
    transport::{
        DummyTransport, LinkConfig, PrinterTransport, RealTransport, SerialLink, Transport, UsbLink,
    },
};

/// Raster width in dots of a 58mm print head.
///
/// 384 dots pack into 48 bytes per row (384 / 8 = 48).
pub const PRINTER_WIDTH_DOTS: u32 = 384;

/// Rows per `GS v 0` block. Many firmwares only honour the low byte of the
/// row count, so blocks never exceed what fits in 8 bits.
pub const MAX_ROWS_PER_BLOCK: u16 = 255;

/// Default capture file of the dummy transport.
pub const CAPTURE_FILE: &str = "output.escpos";
