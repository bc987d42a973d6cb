//! Delivery of command streams to a printer or a capture file.
//!
//! A transport is opened for one job, receives the whole stream, and is
//! released when it goes out of scope, whether the job succeeded or not.

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    device::{self, PrinterDescriptor, TransportKind},
    error::TransportError,
    escpos::CommandStream,
};

/// Largest single write handed to a device.
pub const WRITE_CHUNK: usize = 4096;

/// Capability set shared by every destination.
pub trait PrinterTransport {
    /// Deliver the whole stream. A partial delivery is reported as an error.
    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError>;

    /// Flush anything buffered. The handle itself is released on drop.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Settings needed to open a destination.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub capture_path: PathBuf,
    pub serial_path: Option<PathBuf>,
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            capture_path: PathBuf::from(crate::CAPTURE_FILE),
            serial_path: None,
            baud_rate: 9600,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Either transport, chosen from the descriptor's kind.
pub enum Transport {
    Real(RealTransport),
    Dummy(DummyTransport),
}

impl Transport {
    pub fn open(descriptor: &PrinterDescriptor, link: &LinkConfig) -> Result<Self, TransportError> {
        match descriptor.transport_kind {
            TransportKind::Dummy => Ok(Transport::Dummy(DummyTransport::open(&link.capture_path)?)),
            TransportKind::Usb | TransportKind::Serial => {
                Ok(Transport::Real(RealTransport::open(descriptor, link)?))
            }
        }
    }
}

impl PrinterTransport for Transport {
    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError> {
        match self {
            Transport::Real(t) => t.send(stream),
            Transport::Dummy(t) => t.send(stream),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Real(t) => t.close(),
            Transport::Dummy(t) => t.close(),
        }
    }
}

// Real device

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    config: u8,
    iface: u8,
    setting: u8,
    address: u8,
}

/// A claimed USB bulk endpoint or an open serial port.
pub enum RealTransport {
    Usb(UsbLink),
    Serial(SerialLink),
}

impl RealTransport {
    pub fn open(descriptor: &PrinterDescriptor, link: &LinkConfig) -> Result<Self, TransportError> {
        match descriptor.transport_kind {
            TransportKind::Usb => Ok(RealTransport::Usb(UsbLink::open(descriptor, link.timeout)?)),
            TransportKind::Serial => Ok(RealTransport::Serial(SerialLink::open(descriptor, link)?)),
            TransportKind::Dummy => Err(TransportError::DeviceNotFound {
                descriptor: *descriptor,
            }),
        }
    }
}

impl PrinterTransport for RealTransport {
    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError> {
        match self {
            RealTransport::Usb(link) => link.send(stream),
            RealTransport::Serial(link) => link.send(stream),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self {
            RealTransport::Usb(_) => Ok(()),
            RealTransport::Serial(link) => link.close(),
        }
    }
}

pub struct UsbLink {
    handle: DeviceHandle<Context>,
    endpoint: Endpoint,
    timeout: Duration,
}

impl UsbLink {
    fn open(descriptor: &PrinterDescriptor, timeout: Duration) -> Result<Self, TransportError> {
        let context = device::usb_context()?;
        let not_found = || TransportError::DeviceNotFound {
            descriptor: *descriptor,
        };

        let (device, device_desc) = Self::find_device(&context, descriptor).ok_or_else(not_found)?;
        let mut handle = device.open().map_err(|err| {
            debug!("Failed to open device {}: {:?}", descriptor, err);
            not_found()
        })?;

        let endpoint =
            Self::bulk_out(&device, &device_desc).ok_or(TransportError::MissingEndpoint)?;
        debug!("using endpoint {:?}", endpoint);

        // Usblp holds most printers; it has to let go before the claim.
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            debug!("auto detach not supported: {:?}", err);
        }
        if handle.active_configuration().ok() != Some(endpoint.config) {
            handle.set_active_configuration(endpoint.config)?;
        }
        handle.claim_interface(endpoint.iface)?;
        handle.set_alternate_setting(endpoint.iface, endpoint.setting)?;

        info!("opened usb printer {}", descriptor);
        Ok(UsbLink {
            handle,
            endpoint,
            timeout,
        })
    }

    fn find_device(
        context: &Context,
        descriptor: &PrinterDescriptor,
    ) -> Option<(Device<Context>, DeviceDescriptor)> {
        let devices = match context.devices() {
            Ok(d) => d,
            Err(err) => {
                debug!("Failed to read device list: {:?}", err);
                return None;
            }
        };

        for device in devices.iter() {
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(err) => {
                    debug!("{:?}", err);
                    continue;
                }
            };
            if device_desc.vendor_id() == descriptor.vendor_id
                && device_desc.product_id() == descriptor.product_id
            {
                return Some((device, device_desc));
            }
        }
        debug!("No device match with {}", descriptor);
        None
    }

    /// First bulk OUT endpoint across all configurations.
    fn bulk_out(device: &Device<Context>, device_desc: &DeviceDescriptor) -> Option<Endpoint> {
        (0..device_desc.num_configurations())
            .filter_map(|n| device.config_descriptor(n).ok())
            .find_map(|config_desc| {
                config_desc
                    .interfaces()
                    .flat_map(|interface| interface.descriptors())
                    .find_map(|interface_desc| {
                        interface_desc
                            .endpoint_descriptors()
                            .find(|ep| {
                                ep.direction() == Direction::Out
                                    && ep.transfer_type() == TransferType::Bulk
                            })
                            .map(|ep| Endpoint {
                                config: config_desc.number(),
                                iface: interface_desc.interface_number(),
                                setting: interface_desc.setting_number(),
                                address: ep.address(),
                            })
                    })
            })
    }

    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError> {
        let total = stream.len();
        let mut written = 0;

        for chunk in stream.as_bytes().chunks(WRITE_CHUNK) {
            let mut offset = 0;
            while offset < chunk.len() {
                match self
                    .handle
                    .write_bulk(self.endpoint.address, &chunk[offset..], self.timeout)
                {
                    Ok(0) => {
                        debug!("device accepted no bytes, possibly stalled");
                        return Err(TransportError::Write { written, total });
                    }
                    Ok(n) => {
                        offset += n;
                        written += n;
                    }
                    Err(err) => {
                        debug!("write error after {} bytes: {:?}", written, err);
                        return Err(TransportError::Write { written, total });
                    }
                }
            }
        }

        debug!("wrote {} bytes to usb endpoint {:#04x}", written, self.endpoint.address);
        Ok(())
    }
}

impl Drop for UsbLink {
    fn drop(&mut self) {
        if let Err(err) = self.handle.release_interface(self.endpoint.iface) {
            debug!("release interface {}: {:?}", self.endpoint.iface, err);
        }
    }
}

/// A serial port, or a printer character device such as `/dev/usb/lp0`.
pub struct SerialLink {
    port: Box<dyn Write + Send>,
    path: String,
}

impl SerialLink {
    fn open(descriptor: &PrinterDescriptor, link: &LinkConfig) -> Result<Self, TransportError> {
        let not_found = || TransportError::DeviceNotFound {
            descriptor: *descriptor,
        };

        let path = match &link.serial_path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => Self::find_port(descriptor).ok_or_else(not_found)?,
        };

        let port: Box<dyn Write + Send> = match serialport::new(path.as_str(), link.baud_rate)
            .timeout(link.timeout)
            .open()
        {
            Ok(port) => {
                info!("opened serial printer {} at {} baud", path, link.baud_rate);
                Box::new(port)
            }
            Err(err) => {
                // Not a tty: usblp and friends take plain writes.
                debug!("{} is not a serial port ({}), opening as a device file", path, err);
                let file = OpenOptions::new().write(true).open(&path).map_err(|err| {
                    debug!("Failed to open {}: {}", path, err);
                    not_found()
                })?;
                info!("opened printer device {}", path);
                Box::new(file)
            }
        };

        Ok(SerialLink { port, path })
    }

    fn find_port(descriptor: &PrinterDescriptor) -> Option<String> {
        let ports = serialport::available_ports()
            .map_err(|err| debug!("Failed to list serial ports: {}", err))
            .ok()?;

        ports.into_iter().find_map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(info)
                if info.vid == descriptor.vendor_id && info.pid == descriptor.product_id =>
            {
                Some(port.port_name)
            }
            _ => None,
        })
    }

    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError> {
        let total = stream.len();
        let mut written = 0;

        for chunk in stream.as_bytes().chunks(WRITE_CHUNK) {
            if let Err(err) = self.port.write_all(chunk) {
                debug!("write error on {} after {} bytes: {}", self.path, written, err);
                return Err(TransportError::Write { written, total });
            }
            written += chunk.len();
        }

        debug!("wrote {} bytes to {}", written, self.path);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.port.flush().map_err(|err| {
            warn!("flush {} failed: {}", self.path, err);
            TransportError::Serial(err.into())
        })
    }
}

// Capture file

/// Appends every stream, byte for byte, to a capture file.
#[derive(Debug)]
pub struct DummyTransport {
    path: PathBuf,
    file: File,
}

impl DummyTransport {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TransportError::StorageWrite {
                path: path.clone(),
                source,
            })?;

        debug!("opened capture file {}", path.display());
        Ok(DummyTransport { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the capture as it was before the failed job.
    fn truncate_to(&self, len: u64) {
        if let Err(err) = self.file.set_len(len) {
            warn!("can't roll back {}: {}", self.path.display(), err);
        }
    }

    fn storage_error(&self, source: std::io::Error) -> TransportError {
        TransportError::StorageWrite {
            path: self.path.clone(),
            source,
        }
    }
}

impl PrinterTransport for DummyTransport {
    fn send(&mut self, stream: &CommandStream) -> Result<(), TransportError> {
        let start = self
            .file
            .metadata()
            .map_err(|source| self.storage_error(source))?
            .len();

        let result = self.file.write_all(stream.as_bytes()).and_then(|_| self.file.flush());
        if let Err(source) = result {
            self.truncate_to(start);
            return Err(self.storage_error(source));
        }

        info!("captured {} bytes to {}", stream.len(), self.path.display());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.file.sync_data().map_err(|source| self.storage_error(source))
    }
}
