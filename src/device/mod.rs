//! Device discovery, handshake, and the transport seam.
//!
//! [`BulkPipe`] is the boundary between the protocol stack and the USB
//! plumbing: one implementation wraps a real bulk endpoint pair through
//! `usb-bulk-async`, the test suites substitute an in-memory device.

pub mod cmd;
pub mod stream;
pub mod urb;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bittiming::HwConstraints;
use crate::error::{Error, Result};
use crate::wire::codec::{self, Message, MessageReader};
use crate::wire::{self, ByteOrder};

use cmd::CmdChannel;

/// Vendor/product id of the supported interface family.
pub const USB_VID: u16 = 0x1d50;
pub const USB_PID: u16 = 0x5035;

/// One bulk endpoint pair (IN/OUT) on the device.
#[async_trait]
pub trait BulkPipe: Send + Sync {
    /// Write `data` to the OUT endpoint. Returns the bytes transferred.
    async fn bulk_out(&self, data: Vec<u8>, timeout: Duration) -> Result<usize>;

    /// Read up to `len` bytes from the IN endpoint. A `timeout` of zero
    /// waits indefinitely.
    async fn bulk_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>>;
}

/// Everything learned about a channel during the handshake. Immutable for
/// the lifetime of the attached device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub proto_version: u8,
    pub byte_order_id: u8,
    pub cmd_buffer_size: u16,
    pub msg_buffer_size: u16,
    pub ep_size: u16,
    pub can_clock_hz: u32,
    pub feat_perm: u16,
    pub feat_conf: u16,
    pub tx_fifo_size: u8,
    pub rx_fifo_size: u8,
    pub fw_version: (u8, u8, u8),
    pub ch_index: u8,
    pub serial: String,
    pub name: String,
    pub nominal: HwConstraints,
    pub data: HwConstraints,
}

impl DeviceDescriptor {
    /// All feature bits the device can have enabled, permanent or not.
    pub fn features_supported(&self) -> u16 {
        self.feat_perm | self.feat_conf
    }

    pub fn supports_fd(&self) -> bool {
        self.features_supported() & wire::FEATURE_FDF != 0
    }
}

fn ranges_to_hw(ranges: &codec::WireBitTimingRanges, clock_hz: u32) -> HwConstraints {
    HwConstraints {
        clock_hz,
        brp_min: ranges.brp_min as u32,
        brp_max: ranges.brp_max as u32,
        brp_step: 1,
        tseg1_min: ranges.tseg1_min as u32,
        tseg1_max: ranges.tseg1_max as u32,
        tseg2_min: ranges.tseg2_min as u32,
        tseg2_max: ranges.tseg2_max as u32,
        sjw_max: ranges.sjw_max as u32,
    }
}

/// A probed channel: command channel, message pipe, and its descriptor.
pub struct UsbCanDevice {
    pub cmd: CmdChannel,
    pub msg_pipe: Arc<dyn BulkPipe>,
    pub descriptor: DeviceDescriptor,
    pub order: ByteOrder,
}

impl UsbCanDevice {
    /// Run the handshake on a freshly attached pair of bulk pipes.
    ///
    /// Order matters: RESET puts the device into a defined state, HELLO
    /// fixes the byte order and command buffer size, DEVICE_INFO and
    /// CAN_INFO fill in the descriptor.
    pub async fn probe(
        cmd_pipe: Arc<dyn BulkPipe>,
        msg_pipe: Arc<dyn BulkPipe>,
        ep_size: u16,
    ) -> Result<Self> {
        if (ep_size as usize) < wire::MIN_TRANSFER_SIZE {
            return Err(Error::DeviceUnsupported);
        }

        let mut cmd = CmdChannel::new(cmd_pipe, ep_size);

        // a bare header message, byte-order agnostic
        let mut req = Vec::new();
        codec::put_req(&mut req, wire::MSG_RESET);
        cmd.transact(req).await?;

        let mut req = Vec::new();
        codec::put_req(&mut req, wire::MSG_HELLO_DEVICE);
        let reply = cmd.transact(req).await?;

        let hello = match MessageReader::new(&reply, ByteOrder::Native).next() {
            Some(Ok(Message::HelloHost(hello))) => hello,
            _ => return Err(Error::DeviceUnsupported),
        };

        if hello.proto_version == 0 || hello.proto_version > wire::PROTO_VERSION {
            info!(
                "device protocol version {} not supported (host speaks {})",
                hello.proto_version,
                wire::PROTO_VERSION
            );
            return Err(Error::DeviceUnsupported);
        }

        if (hello.cmd_buffer_size as usize) < wire::MIN_TRANSFER_SIZE {
            warn!(
                "badly configured device: cmd buffer of {} bytes",
                hello.cmd_buffer_size
            );
            return Err(Error::DeviceUnsupported);
        }

        let order = ByteOrder::for_device(hello.byte_order);
        cmd.configure(order, hello.cmd_buffer_size, ep_size);

        info!(
            "device proto version {}, {} endian, cmd buffer of {} bytes",
            hello.proto_version,
            if hello.byte_order == wire::BYTE_ORDER_LE {
                "little"
            } else {
                "BIG"
            },
            hello.cmd_buffer_size
        );

        let mut req = Vec::new();
        codec::put_req(&mut req, wire::MSG_DEVICE_INFO);
        let reply = cmd.transact(req).await?;
        let dev_info = match MessageReader::new(&reply, order).next() {
            Some(Ok(Message::DeviceInfo(info))) => info,
            _ => return Err(Error::DeviceUnsupported),
        };

        let mut req = Vec::new();
        codec::put_req(&mut req, wire::MSG_CAN_INFO);
        let reply = cmd.transact(req).await?;
        let can_info = match MessageReader::new(&reply, order).next() {
            Some(Ok(Message::CanInfo(info))) => info,
            _ => return Err(Error::DeviceUnsupported),
        };

        if dev_info.feat_perm & wire::FEATURE_TXR == 0
            && dev_info.feat_conf & wire::FEATURE_TXR == 0
        {
            warn!("device does not support transmit receipts, required by this stack");
            return Err(Error::DeviceUnsupported);
        }

        let serial = hex::encode(&dev_info.serial);
        info!(
            "device {}, serial {}, firmware version {}.{}.{}",
            dev_info.name,
            serial,
            dev_info.fw_version.0,
            dev_info.fw_version.1,
            dev_info.fw_version.2
        );

        // an FD frame plus the larger of the two headers must fit the
        // device message buffer
        let fd_transfer_size = wire::round_up_len(
            crate::can::FD_MAX_DLEN + codec::CAN_TX_HDR_LEN.max(codec::CAN_RX_HDR_LEN),
        );
        let feat_perm = dev_info.feat_perm;
        let mut feat_conf = dev_info.feat_conf;
        if (feat_perm | feat_conf) & wire::FEATURE_FDF != 0
            && (can_info.msg_buffer_size as usize) < fd_transfer_size
        {
            if feat_perm & wire::FEATURE_FDF != 0 {
                warn!(
                    "device has CAN-FD permanently enabled but its {} byte message buffer \
                     cannot carry a {} byte FD transfer",
                    can_info.msg_buffer_size, fd_transfer_size
                );
                return Err(Error::DeviceUnsupported);
            }
            warn!(
                "device supports CAN-FD but its {} byte message buffer is too small; \
                 CAN-FD will not be available",
                can_info.msg_buffer_size
            );
            feat_conf &= !wire::FEATURE_FDF;
        }

        let descriptor = DeviceDescriptor {
            proto_version: hello.proto_version,
            byte_order_id: hello.byte_order,
            cmd_buffer_size: hello.cmd_buffer_size,
            msg_buffer_size: can_info.msg_buffer_size,
            ep_size,
            can_clock_hz: can_info.can_clk_hz,
            feat_perm,
            feat_conf,
            tx_fifo_size: can_info.tx_fifo_size.min(urb::MAX_TX_URBS as u8),
            rx_fifo_size: can_info.rx_fifo_size.min(urb::MAX_RX_URBS as u8),
            fw_version: dev_info.fw_version,
            ch_index: dev_info.ch_index,
            serial,
            name: dev_info.name,
            nominal: ranges_to_hw(&can_info.nominal, can_info.can_clk_hz),
            data: ranges_to_hw(&can_info.data, can_info.can_clk_hz),
        };

        debug!(
            "device has a CAN msg buffer of {} bytes, fifo sizes tx={} rx={}",
            descriptor.msg_buffer_size, descriptor.tx_fifo_size, descriptor.rx_fifo_size
        );

        Ok(UsbCanDevice {
            cmd,
            msg_pipe,
            descriptor,
            order,
        })
    }
}

/// A real bulk endpoint pair on an attached USB device.
pub struct UsbPipe {
    handle: usb_bulk_async::DeviceHandle,
    in_ep: u8,
    out_ep: u8,
}

#[async_trait]
impl BulkPipe for UsbPipe {
    async fn bulk_out(&self, data: Vec<u8>, timeout: Duration) -> Result<usize> {
        Ok(self.handle.write_bulk(self.out_ep, data, timeout).await?)
    }

    async fn bulk_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.handle.read_bulk(self.in_ep, len, timeout).await?)
    }
}

/// One row of a device scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanEntry {
    pub index: usize,
    pub serial: Option<String>,
    pub product: Option<String>,
    pub bus_address: String,
}

/// List attached devices of the supported family without opening them.
pub async fn scan() -> Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();
    let mut index = 0usize;

    for device in usb_bulk_async::devices().await? {
        let desc = device.device_descriptor().await?;
        if desc.vendor_id() != USB_VID || desc.product_id() != USB_PID {
            continue;
        }

        let (serial, product) = match device.open().await {
            Ok(handle) => (
                handle.read_serial_number_string_ascii(&desc).await.ok(),
                handle.read_product_string_ascii(&desc).await.ok(),
            ),
            Err(_) => (None, None),
        };

        entries.push(ScanEntry {
            index,
            serial,
            product,
            bus_address: format!("{:03}:{:03}", device.bus_number(), device.address()),
        });
        index += 1;
    }

    Ok(entries)
}

/// Open a device matched by `identifier`: "auto", a scan index, a serial
/// string, or a `bus:address` pair.
pub async fn open_usb(identifier: &str) -> Result<UsbCanDevice> {
    let ident = identifier.trim();
    let mut index = 0usize;

    for device in usb_bulk_async::devices().await? {
        let desc = device.device_descriptor().await?;
        if desc.vendor_id() != USB_VID || desc.product_id() != USB_PID {
            continue;
        }

        let Some(info) = device.find_bulk_interface().await? else {
            continue;
        };

        let handle = device.open().await?;

        let matches = if ident.eq_ignore_ascii_case("auto") || ident.parse::<usize>() == Ok(index) {
            true
        } else {
            let serial_match = match handle.read_serial_number_string_ascii(&desc).await {
                Ok(serial) => serial.eq_ignore_ascii_case(ident),
                Err(_) => false,
            };
            serial_match
                || format!("{:03}:{:03}", device.bus_number(), device.address())
                    .eq_ignore_ascii_case(ident)
        };

        if !matches {
            index += 1;
            continue;
        }

        let _ = handle.set_auto_detach_kernel_driver(true).await;
        handle.claim_interface(info.interface).await?;
        if info.alt_setting != 0 {
            handle
                .set_alternate_setting(info.interface, info.alt_setting)
                .await?;
        }

        info!(
            "selected device iface={} cmd_eps={:#04x}/{:#04x} msg_eps={:#04x}/{:#04x} ep_size={}",
            info.interface,
            info.cmd_in_ep,
            info.cmd_out_ep,
            info.msg_in_ep,
            info.msg_out_ep,
            info.ep_size
        );

        let cmd_pipe = Arc::new(UsbPipe {
            handle: handle.clone(),
            in_ep: info.cmd_in_ep,
            out_ep: info.cmd_out_ep,
        });
        let msg_pipe = Arc::new(UsbPipe {
            handle,
            in_ep: info.msg_in_ep,
            out_ep: info.msg_out_ep,
        });

        return UsbCanDevice::probe(cmd_pipe, msg_pipe, info.ep_size).await;
    }

    Err(Error::DeviceUnsupported)
}
