//! Printer discovery.
//!
//! The host's attached devices are probed once per job and matched against an
//! ordered table of known vendor/product pairs. When nothing matches, the
//! configured fallback is used as is.

use log::{debug, info, warn};
use rusb::{Context, UsbContext};
use std::{fmt, str::FromStr};

use crate::error::{ConfigError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Serial,
    Dummy,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "usb"),
            Self::Serial => write!(f, "serial"),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}

/// USB vendor/product pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        DeviceId {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Parses `vvvv:pppp` in hex, with or without `0x` prefixes.
impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, product) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| "expected vvvv:pppp".to_string())?;

        let parse = |part: &str| {
            let part = part.trim();
            let digits = part
                .strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part);
            u16::from_str_radix(digits, 16).map_err(|e| format!("{:?} is not a 16-bit hex id: {}", part, e))
        };

        Ok(DeviceId::new(parse(vendor)?, parse(product)?))
    }
}

/// Where and how to reach one printer, built fresh for every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrinterDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub transport_kind: TransportKind,
}

impl PrinterDescriptor {
    pub fn new(id: DeviceId, transport_kind: TransportKind) -> Self {
        PrinterDescriptor {
            vendor_id: id.vendor_id,
            product_id: id.product_id,
            transport_kind,
        }
    }

    pub fn dummy() -> Self {
        PrinterDescriptor::new(DeviceId::new(0, 0), TransportKind::Dummy)
    }

    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.vendor_id, self.product_id)
    }
}

impl fmt::Display for PrinterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.transport_kind)
    }
}

/// Known 58mm ESC/POS printers, most likely first.
pub const KNOWN_PRINTERS: [DeviceId; 4] = [
    DeviceId::new(0x0FE6, 0x811E), // generic POS-58 (ICS Advent bridge)
    DeviceId::new(0x0416, 0x5011), // Winbond POS58
    DeviceId::new(0x28E9, 0x0289), // GD32 based 58mm
    DeviceId::new(0x04B8, 0x0E15), // Epson TM-T20II
];

/// Used when none of the table entries is attached.
pub const FALLBACK_PRINTER: DeviceId = DeviceId::new(0x0FE6, 0x811E);

/// Ordered priority table plus the fallback descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTable {
    entries: Vec<DeviceId>,
    fallback: PrinterDescriptor,
}

impl DeviceTable {
    pub fn new(entries: Vec<DeviceId>, fallback: PrinterDescriptor) -> Self {
        DeviceTable { entries, fallback }
    }

    /// Parse a comma separated list of `vvvv:pppp` pairs, keeping their order.
    pub fn parse_entries(list: &str) -> Result<Vec<DeviceId>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<DeviceId>()
                    .map_err(|reason: String| ConfigError::new("PRINTER_DEVICE_TABLE", s, reason))
            })
            .collect()
    }

    pub fn entries(&self) -> &[DeviceId] {
        &self.entries
    }

    pub fn fallback(&self) -> PrinterDescriptor {
        self.fallback
    }

    pub fn with_fallback(self, fallback: PrinterDescriptor) -> Self {
        DeviceTable { fallback, ..self }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        DeviceTable::new(
            KNOWN_PRINTERS.to_vec(),
            PrinterDescriptor::new(FALLBACK_PRINTER, TransportKind::Usb),
        )
    }
}

/// A device currently visible to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub id: DeviceId,
    pub kind: TransportKind,
    /// Port path for serial devices.
    pub port: Option<String>,
}

/// Source of the attached device list.
pub trait DeviceProbe {
    fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError>;
}

/// Probes libusb devices and USB-backed serial ports of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl DeviceProbe for HostProbe {
    fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError> {
        let mut devices = usb_devices()?;
        devices.extend(serial_devices());
        debug!("{} devices attached", devices.len());
        Ok(devices)
    }
}

/// A libusb context; a host without usbfs can't enumerate anything.
pub(crate) fn usb_context() -> Result<Context, TransportError> {
    Context::new()
        .map_err(|err| TransportError::DeviceEnumeration(format!("libusb unavailable: {}", err)))
}

fn usb_devices() -> Result<Vec<AttachedDevice>, TransportError> {
    let context = usb_context()?;
    let devices = context
        .devices()
        .map_err(|err| TransportError::DeviceEnumeration(format!("can't read device list: {}", err)))?;

    let mut found = Vec::with_capacity(devices.len());
    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(err) => {
                debug!("skipping device without descriptor: {:?}", err);
                continue;
            }
        };
        found.push(AttachedDevice {
            id: DeviceId::new(device_desc.vendor_id(), device_desc.product_id()),
            kind: TransportKind::Usb,
            port: None,
        });
    }
    Ok(found)
}

// Serial enumeration is best effort; libusb is the authoritative device list.
fn serial_devices() -> Vec<AttachedDevice> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            warn!("can't list serial ports: {}", err);
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(info) => Some(AttachedDevice {
                id: DeviceId::new(info.vid, info.pid),
                kind: TransportKind::Serial,
                port: Some(port.port_name),
            }),
            _ => None,
        })
        .collect()
}

/// First table entry with an attached device, else the fallback.
///
/// Pure function of its inputs; the table order decides, not the order in
/// which the host lists its devices.
pub fn select(
    attached: &[AttachedDevice],
    priority_table: &[DeviceId],
    fallback: PrinterDescriptor,
) -> PrinterDescriptor {
    for id in priority_table {
        if let Some(device) = attached.iter().find(|d| d.id == *id) {
            return PrinterDescriptor::new(device.id, device.kind);
        }
    }
    fallback
}

/// Probe the host and pick a printer.
///
/// Fails only when the device list itself can't be read; "nothing matched"
/// yields the fallback.
pub fn resolve<P: DeviceProbe>(
    priority_table: &[DeviceId],
    fallback: PrinterDescriptor,
    probe: &P,
) -> Result<PrinterDescriptor, TransportError> {
    let attached = probe.attached()?;
    let descriptor = select(&attached, priority_table, fallback);

    if descriptor == fallback && !attached.iter().any(|d| d.id == fallback.id()) {
        warn!("no known printer attached, falling back to {}", fallback);
    } else {
        info!("selected printer {}", descriptor);
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Vec<AttachedDevice>);

    impl DeviceProbe for FixedProbe {
        fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenProbe;

    impl DeviceProbe for BrokenProbe {
        fn attached(&self) -> Result<Vec<AttachedDevice>, TransportError> {
            Err(TransportError::DeviceEnumeration("USB detection failed".to_string()))
        }
    }

    fn usb(vendor_id: u16, product_id: u16) -> AttachedDevice {
        AttachedDevice {
            id: DeviceId::new(vendor_id, product_id),
            kind: TransportKind::Usb,
            port: None,
        }
    }

    fn fallback() -> PrinterDescriptor {
        PrinterDescriptor::new(FALLBACK_PRINTER, TransportKind::Usb)
    }

    #[test]
    fn table_order_wins_over_host_order() {
        let table = [DeviceId::new(0x0416, 0x5011), DeviceId::new(0x04B8, 0x0E15)];
        let probe = FixedProbe(vec![usb(0x1d6b, 0x0002), usb(0x04B8, 0x0E15), usb(0x0416, 0x5011)]);

        let descriptor = resolve(&table, fallback(), &probe).unwrap();
        assert_eq!(descriptor.id(), DeviceId::new(0x0416, 0x5011));
        assert_eq!(descriptor.transport_kind, TransportKind::Usb);
    }

    #[test]
    fn known_printer_is_found() {
        let probe = FixedProbe(vec![usb(0x0FE6, 0x811E)]);
        let table = DeviceTable::default();
        let descriptor = resolve(table.entries(), table.fallback(), &probe).unwrap();
        assert_eq!(descriptor, PrinterDescriptor::new(DeviceId::new(0x0FE6, 0x811E), TransportKind::Usb));
    }

    #[test]
    fn serial_match_keeps_serial_kind() {
        let probe = FixedProbe(vec![AttachedDevice {
            id: DeviceId::new(0x0416, 0x5011),
            kind: TransportKind::Serial,
            port: Some("/dev/ttyACM0".to_string()),
        }]);
        let descriptor = resolve(&KNOWN_PRINTERS, fallback(), &probe).unwrap();
        assert_eq!(descriptor.transport_kind, TransportKind::Serial);
    }

    #[test]
    fn no_match_returns_fallback() {
        let custom = PrinterDescriptor::new(DeviceId::new(0x1234, 0x5678), TransportKind::Serial);
        let probe = FixedProbe(vec![usb(0x1d6b, 0x0003)]);
        assert_eq!(resolve(&KNOWN_PRINTERS, custom, &probe).unwrap(), custom);

        let empty = FixedProbe(Vec::new());
        assert_eq!(resolve(&KNOWN_PRINTERS, custom, &empty).unwrap(), custom);
        assert_eq!(resolve(&[], custom, &empty).unwrap(), custom);
    }

    #[test]
    fn enumeration_failure_is_an_error() {
        let err = resolve(&KNOWN_PRINTERS, fallback(), &BrokenProbe).unwrap_err();
        assert!(matches!(err, TransportError::DeviceEnumeration(_)));
    }

    #[test]
    fn parses_device_ids() {
        assert_eq!("0fe6:811e".parse::<DeviceId>().unwrap(), DeviceId::new(0x0FE6, 0x811E));
        assert_eq!("0x04B8:0x0E15".parse::<DeviceId>().unwrap(), DeviceId::new(0x04B8, 0x0E15));
        assert!("0fe6".parse::<DeviceId>().is_err());
        assert!("10000:0001".parse::<DeviceId>().is_err());
    }

    #[test]
    fn parses_table_in_order() {
        let entries = DeviceTable::parse_entries("0416:5011, 0fe6:811e,").unwrap();
        assert_eq!(entries, vec![DeviceId::new(0x0416, 0x5011), DeviceId::new(0x0FE6, 0x811E)]);

        let err = DeviceTable::parse_entries("0416:5011,nope").unwrap_err();
        assert_eq!(err.key, "PRINTER_DEVICE_TABLE");
        assert_eq!(err.value, "nope");
    }

    #[test]
    fn descriptor_display() {
        let descriptor = PrinterDescriptor::new(DeviceId::new(0x0FE6, 0x811E), TransportKind::Usb);
        assert_eq!(descriptor.to_string(), "0fe6:811e (usb)");
    }
}
