//! Host-side driver stack and multi-client hub for USB CAN(-FD)
//! interfaces speaking the framed bulk-pipe protocol.
//!
//! The stack opens a device ([`device::open_usb`]), probes it, and wraps
//! the channel in a [`Hub`] that up to eight clients share concurrently
//! through lock-free rings, with a timeout-based configuration-access
//! lease deciding who may reconfigure the channel.

pub mod bittiming;
pub mod can;
pub mod channel;
pub mod device;
pub mod error;
pub mod hub;
pub mod timetrack;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

/// Index of a client slot within a hub.
pub type ClientId = u8;

pub use can::{BusState, CanFrame};
pub use channel::{ChannelState, CONFIG_ACCESS_TIMEOUT};
pub use device::{open_usb, scan, DeviceDescriptor, UsbCanDevice};
pub use error::{Error, Result};
pub use hub::{
    discover_sessions, ClientHandle, ClientOptions, EchoMode, Hub, HubOptions, OpenParams,
    MAX_CLIENTS,
};
