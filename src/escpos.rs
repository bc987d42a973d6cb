//! ESC/POS command encoding.
//!
//! Bitmaps become `GS v 0` raster blocks, text becomes LF terminated lines.
//! Every stream produced here is self-contained and can be concatenated with
//! another without changing either.

use log::debug;

use crate::{bitmap::Bitmap, error::EncodeError};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
const LF: u8 = 0x0A;

/// ESC @ : Initialize printer
pub const INITIALIZE: [u8; 2] = [ESC, 0x40];
/// GS v 0 : Print raster bit image, followed by m xL xH yL yH
pub const RASTER_IMAGE: [u8; 3] = [GS, 0x76, 0x30];
/// GS V 0 : Full cut
pub const FULL_CUT: [u8; 3] = [GS, 0x56, 0x00];
/// GS V 1 : Partial cut
pub const PARTIAL_CUT: [u8; 3] = [GS, 0x56, 0x01];
/// ESC d n : Print and feed n lines
pub const PRINT_AND_FEED: [u8; 2] = [ESC, 0x64];

/// Largest value of the two byte little-endian header fields.
const MAX_HEADER_FIELD: u64 = u16::MAX as u64;

/// An ordered sequence of command bytes for one print job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStream(Vec<u8>);

impl CommandStream {
    pub fn new() -> Self {
        CommandStream(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append another stream after this one.
    pub fn extend(&mut self, other: &CommandStream) {
        self.0.extend_from_slice(&other.0);
    }

    /// The stream played back `times` times in a row.
    pub fn repeat(&self, times: usize) -> CommandStream {
        CommandStream(self.0.repeat(times))
    }

    fn push(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

impl From<Vec<u8>> for CommandStream {
    fn from(bytes: Vec<u8>) -> Self {
        CommandStream(bytes)
    }
}

impl AsRef<[u8]> for CommandStream {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Concatenate streams in order.
pub fn concat<'a, I>(streams: I) -> CommandStream
where
    I: IntoIterator<Item = &'a CommandStream>,
{
    let mut out = CommandStream::new();
    for stream in streams {
        out.extend(stream);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutMode {
    Full,
    Partial,
}

/// Encoder settings.
///
/// Cutting is opt-in; the encoder never decides to cut from content.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    max_width_dots: u32,
    max_rows_per_block: u16,
    cut: Option<CutMode>,
    feed_lines: u8,
}

impl EncoderConfig {
    /// Defaults: 384 dot head, 255 rows per raster block, no cut, 6 feed lines.
    pub fn new() -> Self {
        EncoderConfig {
            max_width_dots: crate::PRINTER_WIDTH_DOTS,
            max_rows_per_block: crate::MAX_ROWS_PER_BLOCK,
            cut: None,
            feed_lines: 6,
        }
    }

    pub fn max_width_dots(self, dots: u32) -> Self {
        EncoderConfig {
            max_width_dots: dots,
            ..self
        }
    }

    pub fn max_rows_per_block(self, rows: u16) -> Self {
        EncoderConfig {
            max_rows_per_block: rows,
            ..self
        }
    }

    pub fn cut(self, cut: Option<CutMode>) -> Self {
        EncoderConfig { cut, ..self }
    }

    /// Lines fed before a full cut so the last line clears the cutter.
    pub fn feed_lines(self, lines: u8) -> Self {
        EncoderConfig {
            feed_lines: lines,
            ..self
        }
    }

    pub fn cut_mode(&self) -> Option<CutMode> {
        self.cut
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Result<Self, EncodeError> {
        if config.max_rows_per_block == 0 {
            return Err(EncodeError::InvalidConfig(
                "max rows per block must be at least 1".to_string(),
            ));
        }
        Ok(Encoder { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// ESC @ on its own.
    pub fn initialize(&self) -> CommandStream {
        CommandStream(INITIALIZE.to_vec())
    }

    /// The configured cut sequence, or an empty stream when cutting is off.
    pub fn cut(&self) -> CommandStream {
        let mut stream = CommandStream::new();
        let command = match self.config.cut {
            Some(CutMode::Full) => FULL_CUT,
            Some(CutMode::Partial) => PARTIAL_CUT,
            None => return stream,
        };
        if self.config.feed_lines > 0 {
            stream.push(&PRINT_AND_FEED);
            stream.push(&[self.config.feed_lines]);
        }
        stream.push(&command);
        stream
    }

    /// Initialize, then one raster block per `max_rows_per_block` rows, then
    /// the cut if one is configured.
    pub fn encode_bitmap(&self, bitmap: &Bitmap) -> Result<CommandStream, EncodeError> {
        self.encode_raster(bitmap, true)
    }

    /// Same as [`encode_bitmap`](Self::encode_bitmap) but never appends the cut,
    /// for jobs that continue with text.
    pub(crate) fn encode_raster(
        &self,
        bitmap: &Bitmap,
        with_cut: bool,
    ) -> Result<CommandStream, EncodeError> {
        if bitmap.width() > self.config.max_width_dots {
            return Err(EncodeError::DimensionOverflow {
                field: "bitmap width in dots",
                value: bitmap.width() as u64,
                max: self.config.max_width_dots as u64,
            });
        }

        let row_len = bitmap.bytes_per_row();
        let x_bytes = header_field("bytes per row", row_len as u64)?;
        let rows_per_block = self.config.max_rows_per_block as usize;

        let mut stream = self.initialize();
        stream.0.reserve(bitmap.data().len() + 8 * (bitmap.height() as usize / rows_per_block + 1));

        let mut blocks = 0;
        for chunk in bitmap.data().chunks((row_len * rows_per_block).max(1)) {
            if row_len == 0 {
                break;
            }
            let rows = header_field("rows per block", (chunk.len() / row_len) as u64)?;

            stream.push(&RASTER_IMAGE);
            stream.push(&[0x00]); // m : normal density
            stream.push(&x_bytes.to_le_bytes());
            stream.push(&rows.to_le_bytes());
            stream.push(chunk);
            blocks += 1;
        }

        debug!(
            "encoded {}x{} bitmap into {} raster blocks",
            bitmap.width(),
            bitmap.height(),
            blocks
        );

        if with_cut {
            stream.extend(&self.cut());
        }
        Ok(stream)
    }

    /// Encode ASCII lines, each terminated by LF. No wrapping is done.
    ///
    /// Empty input gives an empty stream.
    pub fn encode_text<I, S>(&self, lines: I) -> Result<CommandStream, EncodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stream = CommandStream::new();
        for (line_no, line) in lines.into_iter().enumerate() {
            let bytes = line.as_ref().as_bytes();
            if let Some(column) = bytes.iter().position(|b| !b.is_ascii()) {
                return Err(EncodeError::NonAsciiInput {
                    line: line_no,
                    column,
                    byte: bytes[column],
                });
            }
            stream.push(bytes);
            stream.push(&[LF]);
        }
        Ok(stream)
    }
}

fn header_field(field: &'static str, value: u64) -> Result<u16, EncodeError> {
    if value > MAX_HEADER_FIELD {
        return Err(EncodeError::DimensionOverflow {
            field,
            value,
            max: MAX_HEADER_FIELD,
        });
    }
    Ok(value as u16)
}
