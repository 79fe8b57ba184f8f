//! Wire protocol definitions for the USB CAN(-FD) interface family.
//!
//! Every message starts with `{id: u8, len: u8}` where `len` is the total
//! message size padded to [`LEN_MULTIPLE`]. Multi-byte fields are in device
//! byte order; the only exception is the handshake reply, whose
//! `cmd_buffer_size` is always network (big-endian) order so the host can
//! read it before a codec has been chosen.

pub mod chunk;
pub mod codec;

/// Protocol version spoken by this stack.
pub const PROTO_VERSION: u8 = 2;

/// All message lengths are padded to this granularity.
pub const LEN_MULTIPLE: usize = 4;

/// `{id, len}` message header size.
pub const HEADER_LEN: usize = 2;

/// Smallest transfer any conforming device supports.
pub const MIN_TRANSFER_SIZE: usize = 64;

// Message ids. `EOF` doubles as the in-buffer terminator.
pub const MSG_EOF: u8 = 0x00;
pub const MSG_HELLO_DEVICE: u8 = 0x01;
pub const MSG_HELLO_HOST: u8 = 0x02;
pub const MSG_DEVICE_INFO: u8 = 0x03;
pub const MSG_CAN_INFO: u8 = 0x04;
pub const MSG_ERROR: u8 = 0x05;
pub const MSG_FEATURES: u8 = 0x06;
pub const MSG_NM_BITTIMING: u8 = 0x07;
pub const MSG_DT_BITTIMING: u8 = 0x08;
pub const MSG_BUS: u8 = 0x09;
pub const MSG_RESET: u8 = 0x0a;

pub const MSG_CAN_STATUS: u8 = 0x10;
pub const MSG_CAN_RX: u8 = 0x11;
pub const MSG_CAN_TX: u8 = 0x12;
pub const MSG_CAN_TXR: u8 = 0x13;
pub const MSG_CAN_ERROR: u8 = 0x14;

// Byte order advertised in the handshake reply.
pub const BYTE_ORDER_LE: u8 = 0;
pub const BYTE_ORDER_BE: u8 = 1;

// Feature bits (u16), split by the device into permanent and configurable
// masks in DEVICE_INFO.
pub const FEATURE_TXR: u16 = 0x0001;
pub const FEATURE_FDF: u16 = 0x0002;
pub const FEATURE_DAR: u16 = 0x0004;
pub const FEATURE_MON_MODE: u16 = 0x0008;
pub const FEATURE_EXT_LOOP_MODE: u16 = 0x0010;
pub const FEATURE_BERR_REPORTING: u16 = 0x0020;

// FEATURES op codes.
pub const FEAT_OP_CLEAR: u8 = 0;
pub const FEAT_OP_OR: u8 = 1;
pub const FEAT_OP_AND: u8 = 2;

// Per-frame flags.
pub const CAN_FLAG_EXT: u8 = 0x01;
pub const CAN_FLAG_RTR: u8 = 0x02;
pub const CAN_FLAG_FDF: u8 = 0x04;
pub const CAN_FLAG_BRS: u8 = 0x08;
pub const CAN_FLAG_ESI: u8 = 0x10;
pub const CAN_FLAG_DRP: u8 = 0x20;

// CAN_STATUS bus_status values.
pub const CAN_STATUS_ERROR_ACTIVE: u8 = 0;
pub const CAN_STATUS_ERROR_WARNING: u8 = 1;
pub const CAN_STATUS_ERROR_PASSIVE: u8 = 2;
pub const CAN_STATUS_BUS_OFF: u8 = 3;

// CAN_STATUS flags.
pub const CAN_STATUS_FLAG_TXR_DESYNC: u8 = 0x01;

// CAN_ERROR error values.
pub const CAN_ERROR_NONE: u8 = 0;
pub const CAN_ERROR_STUFF: u8 = 1;
pub const CAN_ERROR_FORM: u8 = 2;
pub const CAN_ERROR_ACK: u8 = 3;
pub const CAN_ERROR_BIT1: u8 = 4;
pub const CAN_ERROR_BIT0: u8 = 5;
pub const CAN_ERROR_CRC: u8 = 6;

// CAN_ERROR flags.
pub const CAN_ERROR_FLAG_RXTX_TX: u8 = 0x01;
pub const CAN_ERROR_FLAG_NMDT_DT: u8 = 0x02;

// Device error codes carried in the ERROR command reply.
pub const DEV_ERROR_NONE: u8 = 0;
pub const DEV_ERROR_SHORT: u8 = 1;
pub const DEV_ERROR_PARAM: u8 = 2;
pub const DEV_ERROR_BUSY: u8 = 3;
pub const DEV_ERROR_UNSUPPORTED: u8 = 4;

/// Round a message length up to the protocol granularity.
#[inline]
pub fn round_up_len(len: usize) -> usize {
    (len + (LEN_MULTIPLE - 1)) & !(LEN_MULTIPLE - 1)
}

/// Integer byte-order codec, fixed once per device at handshake time.
///
/// The identity case compiles down to nothing; the swap case is a plain
/// `swap_bytes`. Chosen by comparing the device's advertised order against
/// the host's native one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Native,
    Swapped,
}

impl ByteOrder {
    /// Pick the codec for a device-advertised byte order id.
    pub fn for_device(device_order: u8) -> Self {
        if device_order == native_byte_order_id() {
            ByteOrder::Native
        } else {
            ByteOrder::Swapped
        }
    }

    #[inline]
    pub fn u16(self, value: u16) -> u16 {
        match self {
            ByteOrder::Native => value,
            ByteOrder::Swapped => value.swap_bytes(),
        }
    }

    #[inline]
    pub fn u32(self, value: u32) -> u32 {
        match self {
            ByteOrder::Native => value,
            ByteOrder::Swapped => value.swap_bytes(),
        }
    }

    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        self.u16(u16::from_ne_bytes([bytes[0], bytes[1]]))
    }

    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        self.u32(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[inline]
    pub fn write_u16(self, bytes: &mut [u8], value: u16) {
        bytes[..2].copy_from_slice(&self.u16(value).to_ne_bytes());
    }

    #[inline]
    pub fn write_u32(self, bytes: &mut [u8], value: u32) {
        bytes[..4].copy_from_slice(&self.u32(value).to_ne_bytes());
    }
}

/// Wire flag byte for a frame.
pub fn frame_flags(frame: &crate::can::CanFrame) -> u8 {
    let mut flags = 0u8;
    if frame.is_extended() {
        flags |= CAN_FLAG_EXT;
    }
    if frame.is_rtr() {
        flags |= CAN_FLAG_RTR;
    }
    if frame.is_fd() {
        flags |= CAN_FLAG_FDF;
    }
    if frame.is_brs() {
        flags |= CAN_FLAG_BRS;
    }
    if frame.is_esi() {
        flags |= CAN_FLAG_ESI;
    }
    flags
}

/// Byte order id of the host.
#[inline]
pub fn native_byte_order_id() -> u8 {
    if cfg!(target_endian = "little") {
        BYTE_ORDER_LE
    } else {
        BYTE_ORDER_BE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_matches_granularity() {
        assert_eq!(round_up_len(0), 0);
        assert_eq!(round_up_len(1), 4);
        assert_eq!(round_up_len(4), 4);
        assert_eq!(round_up_len(13), 16);
    }

    #[test]
    fn swapped_codec_round_trips() {
        let swapped = ByteOrder::Swapped;
        assert_eq!(swapped.u16(swapped.u16(0x1234)), 0x1234);
        assert_eq!(swapped.u32(swapped.u32(0xdead_beef)), 0xdead_beef);

        let mut buf = [0u8; 4];
        swapped.write_u32(&mut buf, 0x0102_0304);
        assert_eq!(swapped.read_u32(&buf), 0x0102_0304);
        // a native read sees the swapped representation
        assert_eq!(ByteOrder::Native.read_u32(&buf), 0x0102_0304u32.swap_bytes());
    }

    #[test]
    fn device_matching_host_order_is_identity() {
        assert_eq!(ByteOrder::for_device(native_byte_order_id()), ByteOrder::Native);
        let other = if native_byte_order_id() == BYTE_ORDER_LE {
            BYTE_ORDER_BE
        } else {
            BYTE_ORDER_LE
        };
        assert_eq!(ByteOrder::for_device(other), ByteOrder::Swapped);
    }
}
