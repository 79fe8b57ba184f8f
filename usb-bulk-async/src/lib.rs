use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{self, DeviceDescriptor, GlobalContext, TransferType};
use tokio::task;

#[derive(Debug)]
pub enum UsbAsyncError {
    Usb(rusb::Error),
    Join(tokio::task::JoinError),
}

impl From<rusb::Error> for UsbAsyncError {
    fn from(err: rusb::Error) -> Self {
        UsbAsyncError::Usb(err)
    }
}

impl From<tokio::task::JoinError> for UsbAsyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        UsbAsyncError::Join(err)
    }
}

impl fmt::Display for UsbAsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbAsyncError::Usb(err) => write!(f, "USB operation failed: {err}"),
            UsbAsyncError::Join(err) => write!(f, "USB task join error: {err}"),
        }
    }
}

impl std::error::Error for UsbAsyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UsbAsyncError::Usb(err) => Some(err),
            UsbAsyncError::Join(err) => Some(err),
        }
    }
}

impl From<UsbAsyncError> for io::Error {
    fn from(err: UsbAsyncError) -> Self {
        match err {
            UsbAsyncError::Usb(rusb::Error::Timeout) => {
                io::Error::new(io::ErrorKind::TimedOut, rusb::Error::Timeout)
            }
            UsbAsyncError::Usb(rusb::Error::Pipe) => {
                io::Error::new(io::ErrorKind::BrokenPipe, rusb::Error::Pipe)
            }
            UsbAsyncError::Usb(rusb::Error::NoDevice) => {
                io::Error::new(io::ErrorKind::NotConnected, rusb::Error::NoDevice)
            }
            UsbAsyncError::Usb(other) => io::Error::new(io::ErrorKind::Other, other),
            UsbAsyncError::Join(e) => {
                io::Error::new(io::ErrorKind::Other, format!("USB task join error: {e}"))
            }
        }
    }
}

/// Endpoint layout of a vendor-class interface exposing two bulk pairs.
///
/// The first pair carries commands, the second carries the message stream.
#[derive(Clone, Copy, Debug)]
pub struct BulkInterfaceInfo {
    pub interface: u8,
    pub alt_setting: u8,
    pub cmd_in_ep: u8,
    pub cmd_out_ep: u8,
    pub msg_in_ep: u8,
    pub msg_out_ep: u8,
    pub ep_size: u16,
}

#[derive(Clone)]
pub struct Device {
    inner: rusb::Device<GlobalContext>,
}

impl Device {
    fn new(inner: rusb::Device<GlobalContext>) -> Self {
        Self { inner }
    }

    pub fn bus_number(&self) -> u8 {
        self.inner.bus_number()
    }

    pub fn address(&self) -> u8 {
        self.inner.address()
    }

    pub async fn device_descriptor(&self) -> Result<DeviceDescriptor, UsbAsyncError> {
        let device = self.inner.clone();
        Ok(task::spawn_blocking(move || Ok::<_, UsbAsyncError>(device.device_descriptor()?)).await??)
    }

    /// Search the active configuration for a vendor interface with at least
    /// two bulk endpoint pairs and report their addresses.
    pub async fn find_bulk_interface(&self) -> Result<Option<BulkInterfaceInfo>, UsbAsyncError> {
        let device = self.inner.clone();
        Ok(task::spawn_blocking(move || {
            let config = device.active_config_descriptor()?;

            for interface in config.interfaces() {
                for descriptor in interface.descriptors() {
                    if descriptor.class_code() != 0xff {
                        continue;
                    }

                    let mut in_eps: Vec<(u8, u16)> = Vec::new();
                    let mut out_eps: Vec<(u8, u16)> = Vec::new();

                    for endpoint in descriptor.endpoint_descriptors() {
                        if endpoint.transfer_type() != TransferType::Bulk {
                            continue;
                        }
                        let entry = (endpoint.address(), endpoint.max_packet_size());
                        if endpoint.address() & 0x80 != 0 {
                            in_eps.push(entry);
                        } else {
                            out_eps.push(entry);
                        }
                    }

                    if in_eps.len() < 2 || out_eps.len() < 2 {
                        continue;
                    }

                    return Ok::<_, UsbAsyncError>(Some(BulkInterfaceInfo {
                        interface: descriptor.interface_number(),
                        alt_setting: descriptor.setting_number(),
                        cmd_in_ep: in_eps[0].0,
                        cmd_out_ep: out_eps[0].0,
                        msg_in_ep: in_eps[1].0,
                        msg_out_ep: out_eps[1].0,
                        ep_size: in_eps[0].1,
                    }));
                }
            }

            Ok(None)
        })
        .await??)
    }

    pub async fn open(&self) -> Result<DeviceHandle, UsbAsyncError> {
        let device = self.inner.clone();
        let handle =
            task::spawn_blocking(move || Ok::<_, UsbAsyncError>(device.open()?)).await??;
        Ok(DeviceHandle::new(handle))
    }
}

pub async fn devices() -> Result<Vec<Device>, UsbAsyncError> {
    Ok(task::spawn_blocking(|| {
        let list = rusb::devices()?;
        let mut out = Vec::with_capacity(list.len());
        for device in list.iter() {
            out.push(Device::new(device));
        }
        Ok::<_, UsbAsyncError>(out)
    })
    .await??)
}

#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<Mutex<rusb::DeviceHandle<GlobalContext>>>,
}

impl DeviceHandle {
    fn new(handle: rusb::DeviceHandle<GlobalContext>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(handle)),
        }
    }

    async fn with_handle<T, F>(&self, f: F) -> Result<T, UsbAsyncError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusb::DeviceHandle<GlobalContext>) -> Result<T, rusb::Error> + Send + 'static,
    {
        let handle = self.inner.clone();
        task::spawn_blocking(move || {
            let mut guard = handle.lock().map_err(|_| rusb::Error::Other)?;
            f(&mut guard)
        })
        .await?
        .map_err(UsbAsyncError::from)
    }

    pub async fn set_auto_detach_kernel_driver(&self, enable: bool) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.set_auto_detach_kernel_driver(enable).map_err(|e| match e {
                rusb::Error::NotSupported => rusb::Error::Other,
                other => other,
            })?;
            Ok(())
        })
        .await
    }

    pub async fn claim_interface(&self, interface: u8) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.claim_interface(interface)?;
            Ok(())
        })
        .await
    }

    pub async fn release_interface(&self, interface: u8) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.release_interface(interface)?;
            Ok(())
        })
        .await
    }

    pub async fn set_alternate_setting(
        &self,
        interface: u8,
        setting: u8,
    ) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.set_alternate_setting(interface, setting)?;
            Ok(())
        })
        .await
    }

    pub async fn write_bulk(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<usize, UsbAsyncError> {
        self.with_handle(move |handle| handle.write_bulk(endpoint, &data, timeout))
            .await
    }

    /// Read up to `len` bytes from a bulk IN endpoint. Returns the bytes
    /// actually transferred; a zero-length packet yields an empty vec.
    pub async fn read_bulk(
        &self,
        endpoint: u8,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbAsyncError> {
        self.with_handle(move |handle| {
            let mut buffer = vec![0u8; len];
            let read = handle.read_bulk(endpoint, &mut buffer, timeout)?;
            buffer.truncate(read);
            Ok(buffer)
        })
        .await
    }

    pub async fn clear_halt(&self, endpoint: u8) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.clear_halt(endpoint)?;
            Ok(())
        })
        .await
    }

    pub async fn reset(&self) -> Result<(), UsbAsyncError> {
        self.with_handle(move |handle| {
            handle.reset()?;
            Ok(())
        })
        .await
    }

    pub async fn read_serial_number_string_ascii(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<String, UsbAsyncError> {
        let handle = self.inner.clone();
        task::block_in_place(move || {
            let guard = handle.lock().map_err(|_| rusb::Error::Other)?;
            Ok(guard.read_serial_number_string_ascii(descriptor)?)
        })
    }

    pub async fn read_product_string_ascii(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<String, UsbAsyncError> {
        let handle = self.inner.clone();
        task::block_in_place(move || {
            let guard = handle.lock().map_err(|_| rusb::Error::Other)?;
            Ok(guard.read_product_string_ascii(descriptor)?)
        })
    }
}
