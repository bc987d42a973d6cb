use image::DynamicImage;
use log::{debug, info, warn};
use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use crate::{
    bitmap::{self, Binarize, Bitmap},
    device::{self, DeviceId, DeviceProbe, DeviceTable, HostProbe, PrinterDescriptor, TransportKind},
    error::{ConfigError, EncodeError, PrintError, TransportError},
    escpos::{CommandStream, CutMode, Encoder, EncoderConfig},
    transport::{LinkConfig, PrinterTransport, Transport},
};

/// One physical printer per process: resolve, open, send and close happen
/// under this lock so no two jobs interleave their bytes.
static TRANSPORT_LOCK: Mutex<()> = Mutex::new(());

/// Printer configuration.
///
/// Built once and handed to [`Printer::new`]; not modifiable afterwards.
///
/// # Example
///
/// ```
/// use escpos_thermal::{Config, CutMode};
///
/// let config = Config::new(true)
///     .capture_path("output.escpos")
///     .cut(Some(CutMode::Partial))
///     .feed_lines(4);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    use_dummy: bool,
    width_dots: u32,
    binarize: Binarize,
    max_rows_per_block: u16,
    cut: Option<CutMode>,
    feed_lines: u8,
    devices: DeviceTable,
    link: LinkConfig,
}

impl Config {
    /// Defaults for a 58mm printer: 384 dots, dithered images, full cut.
    pub fn new(use_dummy: bool) -> Config {
        Config {
            use_dummy,
            width_dots: crate::PRINTER_WIDTH_DOTS,
            binarize: Binarize::default(),
            max_rows_per_block: crate::MAX_ROWS_PER_BLOCK,
            cut: Some(CutMode::Full),
            feed_lines: 6,
            devices: DeviceTable::default(),
            link: LinkConfig::default(),
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let use_dummy = lookup("USE_PRINTER_DUMMY")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mut config = Config::new(use_dummy);

        if let Some(v) = lookup("PRINTER_CAPTURE_PATH") {
            config = config.capture_path(v);
        }
        if let Some(v) = lookup("PRINTER_WIDTH_DOTS") {
            config = config.width_dots(parse_number("PRINTER_WIDTH_DOTS", &v)?);
        }
        if let Some(v) = lookup("PRINTER_MAX_ROWS_PER_BLOCK") {
            let rows: u16 = parse_number("PRINTER_MAX_ROWS_PER_BLOCK", &v)?;
            if rows == 0 {
                return Err(ConfigError::new("PRINTER_MAX_ROWS_PER_BLOCK", &v, "must be at least 1"));
            }
            config = config.max_rows_per_block(rows);
        }
        if let Some(v) = lookup("PRINTER_CUT") {
            let cut = match v.trim().to_ascii_lowercase().as_str() {
                "full" => Some(CutMode::Full),
                "partial" => Some(CutMode::Partial),
                "none" | "off" => None,
                _ => return Err(ConfigError::new("PRINTER_CUT", &v, "expected full, partial or none")),
            };
            config = config.cut(cut);
        }
        if let Some(v) = lookup("PRINTER_FEED_LINES") {
            config = config.feed_lines(parse_number("PRINTER_FEED_LINES", &v)?);
        }
        if let Some(v) = lookup("PRINTER_DEVICE_TABLE") {
            let entries = DeviceTable::parse_entries(&v)?;
            config.devices = DeviceTable::new(entries, config.devices.fallback());
        }
        if let Some(v) = lookup("PRINTER_FALLBACK") {
            let id: DeviceId = v
                .parse()
                .map_err(|reason: String| ConfigError::new("PRINTER_FALLBACK", &v, reason))?;
            let kind = config.devices.fallback().transport_kind;
            config.devices = config.devices.with_fallback(PrinterDescriptor::new(id, kind));
        }
        if let Some(v) = lookup("PRINTER_BAUD_RATE") {
            config.link.baud_rate = parse_number("PRINTER_BAUD_RATE", &v)?;
        }
        if let Some(v) = lookup("PRINTER_SERIAL_PATH") {
            let baud_rate = config.link.baud_rate;
            config = config.serial_port(v, baud_rate);
        }

        debug!("{:?}", config);
        Ok(config)
    }

    pub fn use_dummy(self, flag: bool) -> Self {
        Config {
            use_dummy: flag,
            ..self
        }
    }

    /// Raster width of the print head in dots.
    pub fn width_dots(self, dots: u32) -> Self {
        Config {
            width_dots: dots,
            ..self
        }
    }

    pub fn binarize(self, binarize: Binarize) -> Self {
        Config { binarize, ..self }
    }

    pub fn max_rows_per_block(self, rows: u16) -> Self {
        Config {
            max_rows_per_block: rows,
            ..self
        }
    }

    pub fn cut(self, cut: Option<CutMode>) -> Self {
        Config { cut, ..self }
    }

    pub fn feed_lines(self, lines: u8) -> Self {
        Config {
            feed_lines: lines,
            ..self
        }
    }

    pub fn device_table(self, devices: DeviceTable) -> Self {
        Config { devices, ..self }
    }

    pub fn capture_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.link.capture_path = path.into();
        self
    }

    /// Serial port or printer device file. The fallback printer is then
    /// reached through it.
    pub fn serial_port<P: Into<PathBuf>>(mut self, path: P, baud_rate: u32) -> Self {
        self.link.serial_path = Some(path.into());
        self.link.baud_rate = baud_rate;
        let fallback = self.devices.fallback();
        self.devices = self
            .devices
            .with_fallback(PrinterDescriptor::new(fallback.id(), TransportKind::Serial));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.link.timeout = timeout;
        self
    }

    pub fn is_dummy(&self) -> bool {
        self.use_dummy
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig::new()
            .max_width_dots(self.width_dots)
            .max_rows_per_block(self.max_rows_per_block)
            .cut(self.cut)
            .feed_lines(self.feed_lines)
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::new(key, value, err.to_string()))
}

#[derive(Debug, Clone)]
enum Artwork {
    Encoded(Vec<u8>),
    Decoded(DynamicImage),
    Packed(Bitmap),
}

/// What to print: an optional image followed by optional ASCII text.
#[derive(Debug, Clone)]
pub struct PrintJob {
    artwork: Option<Artwork>,
    text: Option<String>,
    copies: u16,
}

impl PrintJob {
    pub fn new() -> Self {
        PrintJob {
            artwork: None,
            text: None,
            copies: 1,
        }
    }

    /// An image still in its file format (PNG, JPEG, ...). It is decoded
    /// when the job is encoded.
    pub fn encoded_image(self, bytes: Vec<u8>) -> Self {
        PrintJob {
            artwork: Some(Artwork::Encoded(bytes)),
            ..self
        }
    }

    pub fn image(self, image: DynamicImage) -> Self {
        PrintJob {
            artwork: Some(Artwork::Decoded(image)),
            ..self
        }
    }

    /// An already normalized bitmap, printed as is.
    pub fn bitmap(self, bitmap: Bitmap) -> Self {
        PrintJob {
            artwork: Some(Artwork::Packed(bitmap)),
            ..self
        }
    }

    /// ASCII text printed below the image, one printer line per text line.
    pub fn text<S: Into<String>>(self, text: S) -> Self {
        PrintJob {
            text: Some(text.into()),
            ..self
        }
    }

    pub fn copies(self, copies: u16) -> Self {
        PrintJob { copies, ..self }
    }
}

impl Default for PrintJob {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Printer<P = HostProbe> {
    config: Config,
    encoder: Encoder,
    probe: P,
}

impl Printer<HostProbe> {
    pub fn new(config: Config) -> Result<Self, PrintError> {
        Self::with_probe(config, HostProbe)
    }
}

impl<P: DeviceProbe> Printer<P> {
    /// Use `probe` instead of the host's device list.
    pub fn with_probe(config: Config, probe: P) -> Result<Self, PrintError> {
        let encoder = Encoder::new(config.encoder_config())?;
        Ok(Printer {
            config,
            encoder,
            probe,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Encode a job without sending it: initialize, raster blocks, text,
    /// cut, repeated once per copy.
    pub fn encode(&self, job: &PrintJob) -> Result<CommandStream, EncodeError> {
        let normalized;
        let bitmap = match &job.artwork {
            Some(Artwork::Encoded(bytes)) => {
                normalized = bitmap::normalize(bytes, self.config.width_dots, self.config.binarize)?;
                Some(&normalized)
            }
            Some(Artwork::Decoded(image)) => {
                normalized = bitmap::normalize_image(image, self.config.width_dots, self.config.binarize);
                Some(&normalized)
            }
            Some(Artwork::Packed(bitmap)) => Some(bitmap),
            None => None,
        };

        let mut stream = match bitmap {
            Some(bitmap) => self.encoder.encode_raster(bitmap, false)?,
            None => self.encoder.initialize(),
        };
        if let Some(text) = &job.text {
            stream.extend(&self.encoder.encode_text(text.lines())?);
        }
        stream.extend(&self.encoder.cut());

        Ok(stream.repeat(job.copies as usize))
    }

    /// The printer a job would be sent to right now.
    pub fn descriptor(&self) -> Result<PrinterDescriptor, PrintError> {
        if self.config.use_dummy {
            return Ok(PrinterDescriptor::dummy());
        }
        let devices = &self.config.devices;
        match device::resolve(devices.entries(), devices.fallback(), &self.probe) {
            // An explicit device path still works on hosts without usbfs.
            Err(TransportError::DeviceEnumeration(reason))
                if self.config.link.serial_path.is_some() =>
            {
                warn!("{}, using {}", reason, devices.fallback());
                Ok(devices.fallback())
            }
            result => Ok(result?),
        }
    }

    /// Encode and deliver one job.
    ///
    /// Encoding runs before the transport lock is taken. The transport is
    /// released when this returns, on success or failure. Nothing is retried.
    pub fn print(&self, job: &PrintJob) -> Result<(), PrintError> {
        let stream = self.encode(job)?;
        if stream.is_empty() {
            debug!("nothing to print");
            return Ok(());
        }

        let _guard = TRANSPORT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("transport lock acquired");

        let descriptor = self.descriptor()?;
        let mut transport = Transport::open(&descriptor, &self.config.link)?;
        transport.send(&stream)?;
        transport.close()?;

        info!("printed {} bytes on {}", stream.len(), descriptor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::AttachedDevice,
        escpos::{FULL_CUT, INITIALIZE, RASTER_IMAGE},
    };
    use std::collections::HashMap;

    struct FixedProbe(Vec<AttachedDevice>);

    impl DeviceProbe for FixedProbe {
        fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError> {
            Ok(self.0.clone())
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn image_then_text_then_cut() {
        let printer = Printer::new(Config::new(true).feed_lines(0)).unwrap();
        let job = PrintJob::new()
            .bitmap(Bitmap::from_fn(384, 2, |_, _| true))
            .text("What do you think this drawing shows?\nWrite your story here:");

        let bytes = printer.encode(&job).unwrap().into_bytes();

        let mut expected = INITIALIZE.to_vec();
        expected.extend_from_slice(&RASTER_IMAGE);
        expected.extend_from_slice(&[0x00, 48, 0, 2, 0]);
        expected.extend(vec![0xFF; 96]);
        expected.extend_from_slice(b"What do you think this drawing shows?\nWrite your story here:\n");
        expected.extend_from_slice(&FULL_CUT);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn text_only_job() {
        let printer = Printer::new(Config::new(true).cut(None)).unwrap();
        let bytes = printer.encode(&PrintJob::new().text("hello")).unwrap().into_bytes();
        assert_eq!(bytes, b"\x1b@hello\n");
    }

    #[test]
    fn copies_repeat_the_whole_job() {
        let printer = Printer::new(Config::new(true)).unwrap();
        let one = printer.encode(&PrintJob::new().text("x")).unwrap();
        let three = printer.encode(&PrintJob::new().text("x").copies(3)).unwrap();
        assert_eq!(three, one.repeat(3));

        let none = printer.encode(&PrintJob::new().text("x").copies(0)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn image_is_scaled_to_head_width() {
        let printer = Printer::new(Config::new(true).cut(None)).unwrap();
        let image = DynamicImage::new_rgb8(100, 50);
        let bytes = printer.encode(&PrintJob::new().image(image)).unwrap().into_bytes();
        // 384x192 black, one block
        assert_eq!(&bytes[2..10], &[0x1Du8, 0x76, 0x30, 0x00, 48, 0, 192, 0]);
        assert_eq!(bytes.len(), 10 + 48 * 192);
    }

    #[test]
    fn encoding_errors_are_surfaced_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.escpos");
        let printer = Printer::new(Config::new(true).capture_path(&path)).unwrap();

        let err = printer.print(&PrintJob::new().text("caf\u{e9}")).unwrap_err();
        assert!(matches!(err, PrintError::Encode(EncodeError::NonAsciiInput { .. })));

        let err = printer
            .print(&PrintJob::new().encoded_image(b"not an image".to_vec()))
            .unwrap_err();
        assert!(matches!(err, PrintError::Encode(EncodeError::ImageDecode(_))));

        assert!(!path.exists());
    }

    #[test]
    fn dummy_print_writes_capture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.escpos");
        let printer = Printer::new(Config::new(true).capture_path(&path)).unwrap();
        let job = PrintJob::new().text("Printed successfully.");

        printer.print(&job).unwrap();

        let expected = printer.encode(&job).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), expected.into_bytes());
    }

    #[test]
    fn dummy_mode_never_probes() {
        let printer = Printer::with_probe(Config::new(true), FixedProbe(Vec::new())).unwrap();
        assert_eq!(printer.descriptor().unwrap(), PrinterDescriptor::dummy());
    }

    #[test]
    fn real_mode_reports_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(false).serial_port(dir.path().join("ttyNOPE"), 9600);
        let probe = FixedProbe(vec![AttachedDevice {
            id: DeviceId::new(0x0416, 0x5011),
            kind: TransportKind::Serial,
            port: None,
        }]);
        let printer = Printer::with_probe(config, probe).unwrap();

        let descriptor = printer.descriptor().unwrap();
        assert_eq!(descriptor.transport_kind, TransportKind::Serial);

        let err = printer.print(&PrintJob::new().text("hi")).unwrap_err();
        assert!(matches!(
            err,
            PrintError::Transport(TransportError::DeviceNotFound { .. })
        ));
    }

    struct BrokenProbe;

    impl DeviceProbe for BrokenProbe {
        fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError> {
            Err(TransportError::DeviceEnumeration("libusb unavailable".to_string()))
        }
    }

    #[test]
    fn serial_port_routes_fallback_over_serial() {
        let config = Config::new(false).serial_port("/dev/usb/lp0", 9600);
        assert_eq!(config.devices().fallback().transport_kind, TransportKind::Serial);
        assert_eq!(config.devices().fallback().id(), device::FALLBACK_PRINTER);

        let from_env =
            Config::from_lookup(lookup(&[("PRINTER_SERIAL_PATH", "/dev/usb/lp0")])).unwrap();
        assert_eq!(from_env.devices().fallback(), config.devices().fallback());
    }

    #[cfg(unix)]
    #[test]
    fn prints_to_device_file_when_nothing_matches() {
        let config = Config::new(false).serial_port("/dev/null", 9600);
        let printer = Printer::with_probe(config, FixedProbe(Vec::new())).unwrap();

        printer.print(&PrintJob::new().text("to the device file")).unwrap();
    }

    #[test]
    fn explicit_port_survives_failed_enumeration() {
        let config = Config::new(false).serial_port("/dev/usb/lp0", 9600);
        let printer = Printer::with_probe(config, BrokenProbe).unwrap();
        let descriptor = printer.descriptor().unwrap();
        assert_eq!(descriptor.transport_kind, TransportKind::Serial);

        let printer = Printer::with_probe(Config::new(false), BrokenProbe).unwrap();
        assert!(matches!(
            printer.descriptor().unwrap_err(),
            PrintError::Transport(TransportError::DeviceEnumeration(_))
        ));
    }

    #[test]
    fn zero_rows_per_block_is_rejected() {
        let err = Printer::new(Config::new(true).max_rows_per_block(0)).err().unwrap();
        assert!(matches!(err, PrintError::Encode(EncodeError::InvalidConfig(_))));
    }

    #[test]
    fn config_from_environment() {
        let config = Config::from_lookup(lookup(&[
            ("USE_PRINTER_DUMMY", "TRUE"),
            ("PRINTER_CAPTURE_PATH", "/tmp/capture.bin"),
            ("PRINTER_WIDTH_DOTS", "576"),
            ("PRINTER_CUT", "partial"),
            ("PRINTER_DEVICE_TABLE", "0416:5011,04b8:0e15"),
            ("PRINTER_FALLBACK", "1234:abcd"),
            ("PRINTER_SERIAL_PATH", "/dev/ttyUSB0"),
            ("PRINTER_BAUD_RATE", "19200"),
        ]))
        .unwrap();

        assert!(config.is_dummy());
        assert_eq!(config.width_dots, 576);
        assert_eq!(config.cut, Some(CutMode::Partial));
        assert_eq!(config.link().capture_path, PathBuf::from("/tmp/capture.bin"));
        assert_eq!(config.link().serial_path, Some(PathBuf::from("/dev/ttyUSB0")));
        assert_eq!(config.link().baud_rate, 19200);
        assert_eq!(
            config.devices().entries(),
            &[DeviceId::new(0x0416, 0x5011), DeviceId::new(0x04B8, 0x0E15)]
        );
        assert_eq!(
            config.devices().fallback(),
            PrinterDescriptor::new(DeviceId::new(0x1234, 0xABCD), TransportKind::Serial)
        );
    }

    #[test]
    fn config_defaults() {
        let config = Config::from_lookup(lookup(&[("USE_PRINTER_DUMMY", "yes")])).unwrap();
        assert!(!config.is_dummy());
        assert_eq!(config.width_dots, 384);
        assert_eq!(config.cut, Some(CutMode::Full));
        assert_eq!(config.link().capture_path, PathBuf::from("output.escpos"));
        assert_eq!(config.devices(), &DeviceTable::default());
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = Config::from_lookup(lookup(&[("PRINTER_WIDTH_DOTS", "wide")])).unwrap_err();
        assert_eq!(err.key, "PRINTER_WIDTH_DOTS");

        let err = Config::from_lookup(lookup(&[("PRINTER_CUT", "sideways")])).unwrap_err();
        assert_eq!(err.key, "PRINTER_CUT");

        let err = Config::from_lookup(lookup(&[("PRINTER_MAX_ROWS_PER_BLOCK", "0")])).unwrap_err();
        assert_eq!(err.key, "PRINTER_MAX_ROWS_PER_BLOCK");
    }
}
