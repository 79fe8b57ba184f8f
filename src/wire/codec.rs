//! Typed encode/decode for the bulk-pipe message protocol.
//!
//! Decoding walks a packed buffer of messages and yields one typed message
//! at a time. Unknown ids are surfaced as [`Message::Skipped`] so the caller
//! can log and move on; the protocol is forward compatible. Length
//! violations abort the buffer with a [`ProtocolViolation`] instead.
//!
//! [`ProtocolViolation`]: crate::error::Error::ProtocolViolation

use crate::can::dlc_to_len;
use crate::error::{Error, Result};

use super::*;

pub const HELLO_LEN: usize = 8;
pub const DEVICE_INFO_LEN: usize = 60;
pub const CAN_INFO_LEN: usize = 32;
pub const ERROR_LEN: usize = 4;
pub const FEATURES_LEN: usize = 8;
pub const BITTIMING_LEN: usize = 8;
pub const BUS_LEN: usize = 4;
pub const REQ_LEN: usize = 4;
pub const CAN_TX_HDR_LEN: usize = 12;
pub const CAN_RX_HDR_LEN: usize = 12;
pub const CAN_TXR_LEN: usize = 8;
pub const CAN_STATUS_LEN: usize = 16;
pub const CAN_ERROR_LEN: usize = 8;

pub const SN_BYTES_MAX: usize = 16;
pub const NAME_BYTES_MAX: usize = 32;

/// Handshake reply. `cmd_buffer_size` is big-endian on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloHost {
    pub proto_version: u8,
    pub byte_order: u8,
    pub cmd_buffer_size: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfoMsg {
    pub feat_perm: u16,
    pub feat_conf: u16,
    pub fw_version: (u8, u8, u8),
    pub ch_index: u8,
    pub serial: Vec<u8>,
    pub name: String,
}

/// Hardware bit-timing ranges for one phase as reported by CAN_INFO.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireBitTimingRanges {
    pub brp_min: u16,
    pub brp_max: u16,
    pub tseg1_min: u16,
    pub tseg1_max: u16,
    pub tseg2_min: u8,
    pub tseg2_max: u8,
    pub sjw_max: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanInfoMsg {
    pub msg_buffer_size: u16,
    pub can_clk_hz: u32,
    pub tx_fifo_size: u8,
    pub rx_fifo_size: u8,
    pub nominal: WireBitTimingRanges,
    pub data: WireBitTimingRanges,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanRxMsg<'a> {
    pub dlc: u8,
    pub flags: u8,
    pub can_id: u32,
    pub timestamp_us: u32,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanTxrMsg {
    pub track_id: u8,
    pub flags: u8,
    pub timestamp_us: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanStatusMsg {
    pub flags: u8,
    pub bus_status: u8,
    pub timestamp_us: u32,
    pub rx_lost: u16,
    pub tx_dropped: u16,
    pub rx_errors: u8,
    pub tx_errors: u8,
    pub rx_fifo_size: u8,
    pub tx_fifo_size: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanErrorMsg {
    pub error: u8,
    pub flags: u8,
    pub timestamp_us: u32,
}

/// One decoded message out of a packed buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Message<'a> {
    HelloHost(HelloHost),
    DeviceInfo(DeviceInfoMsg),
    CanInfo(CanInfoMsg),
    Error { error: u8 },
    CanStatus(CanStatusMsg),
    CanRx(CanRxMsg<'a>),
    CanTxr(CanTxrMsg),
    CanError(CanErrorMsg),
    /// Unknown id, skipped for forward compatibility.
    Skipped { id: u8, len: u8 },
}

/// Walks the packed messages in a completed bulk-in buffer.
///
/// Iteration stops cleanly at an EOF marker (`id == 0` or `len == 0`) or at
/// the end of the buffer. A malformed header ends iteration with an error;
/// the remainder of the buffer is not trusted after that.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
    poisoned: bool,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            pos: 0,
            order,
            poisoned: false,
        }
    }

    /// Offset of the next unread message, for diagnostics.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn decode(&self, msg: &'a [u8]) -> Result<Message<'a>> {
        let order = self.order;
        let id = msg[0];
        let len = msg[1];

        let check_len = |need: usize| -> Result<()> {
            if msg.len() < need {
                Err(Error::ProtocolViolation("short message"))
            } else {
                Ok(())
            }
        };

        match id {
            MSG_HELLO_HOST | MSG_HELLO_DEVICE => {
                check_len(HELLO_LEN)?;
                Ok(Message::HelloHost(HelloHost {
                    proto_version: msg[2],
                    byte_order: msg[3],
                    // network order, readable before the codec is chosen
                    cmd_buffer_size: u16::from_be_bytes([msg[4], msg[5]]),
                }))
            }
            MSG_DEVICE_INFO => {
                check_len(DEVICE_INFO_LEN)?;
                let sn_len = (msg[10] as usize).min(SN_BYTES_MAX);
                let name_len = (msg[11] as usize).min(NAME_BYTES_MAX);
                Ok(Message::DeviceInfo(DeviceInfoMsg {
                    feat_perm: order.read_u16(&msg[2..]),
                    feat_conf: order.read_u16(&msg[4..]),
                    fw_version: (msg[6], msg[7], msg[8]),
                    ch_index: msg[9],
                    serial: msg[12..12 + sn_len].to_vec(),
                    name: String::from_utf8_lossy(&msg[28..28 + name_len]).into_owned(),
                }))
            }
            MSG_CAN_INFO => {
                check_len(CAN_INFO_LEN)?;
                Ok(Message::CanInfo(CanInfoMsg {
                    msg_buffer_size: order.read_u16(&msg[2..]),
                    can_clk_hz: order.read_u32(&msg[4..]),
                    tx_fifo_size: msg[8],
                    rx_fifo_size: msg[9],
                    nominal: WireBitTimingRanges {
                        brp_min: order.read_u16(&msg[10..]),
                        brp_max: order.read_u16(&msg[12..]),
                        tseg1_min: order.read_u16(&msg[14..]),
                        tseg1_max: order.read_u16(&msg[16..]),
                        tseg2_min: msg[18],
                        tseg2_max: msg[19],
                        sjw_max: msg[20],
                    },
                    data: WireBitTimingRanges {
                        brp_min: msg[21] as u16,
                        brp_max: msg[22] as u16,
                        tseg1_min: msg[23] as u16,
                        tseg1_max: msg[24] as u16,
                        tseg2_min: msg[25],
                        tseg2_max: msg[26],
                        sjw_max: msg[27],
                    },
                }))
            }
            MSG_ERROR => {
                check_len(ERROR_LEN)?;
                Ok(Message::Error { error: msg[2] })
            }
            MSG_CAN_STATUS => {
                check_len(CAN_STATUS_LEN)?;
                Ok(Message::CanStatus(CanStatusMsg {
                    flags: msg[2],
                    bus_status: msg[3],
                    timestamp_us: order.read_u32(&msg[4..]),
                    rx_lost: order.read_u16(&msg[8..]),
                    tx_dropped: order.read_u16(&msg[10..]),
                    rx_errors: msg[12],
                    tx_errors: msg[13],
                    rx_fifo_size: msg[14],
                    tx_fifo_size: msg[15],
                }))
            }
            MSG_CAN_RX => {
                check_len(CAN_RX_HDR_LEN)?;
                let dlc = msg[2] & 0x0f;
                let flags = msg[3];
                let data_len = if flags & CAN_FLAG_RTR != 0 {
                    0
                } else {
                    dlc_to_len(dlc)
                };
                if msg.len() < CAN_RX_HDR_LEN + data_len {
                    return Err(Error::ProtocolViolation("rx data truncated"));
                }
                let data = &msg[CAN_RX_HDR_LEN..CAN_RX_HDR_LEN + data_len];
                Ok(Message::CanRx(CanRxMsg {
                    dlc,
                    flags,
                    can_id: order.read_u32(&msg[4..]),
                    timestamp_us: order.read_u32(&msg[8..]),
                    data,
                }))
            }
            MSG_CAN_TXR => {
                check_len(CAN_TXR_LEN)?;
                Ok(Message::CanTxr(CanTxrMsg {
                    track_id: msg[2],
                    flags: msg[3],
                    timestamp_us: order.read_u32(&msg[4..]),
                }))
            }
            MSG_CAN_ERROR => {
                check_len(CAN_ERROR_LEN)?;
                Ok(Message::CanError(CanErrorMsg {
                    error: msg[2],
                    flags: msg[3],
                    timestamp_us: order.read_u32(&msg[4..]),
                }))
            }
            other => Ok(Message::Skipped { id: other, len }),
        }
    }
}

impl<'a> Iterator for MessageReader<'a> {
    type Item = Result<Message<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos + LEN_MULTIPLE > self.buf.len() {
            return None;
        }

        let id = self.buf[self.pos];
        let len = self.buf[self.pos + 1] as usize;

        if id == MSG_EOF || len == 0 {
            self.pos = self.buf.len();
            return None;
        }

        if len % LEN_MULTIPLE != 0 {
            self.poisoned = true;
            return Some(Err(Error::ProtocolViolation("length not a multiple of 4")));
        }

        if self.pos + len > self.buf.len() {
            self.poisoned = true;
            return Some(Err(Error::ProtocolViolation("length exceeds buffer")));
        }

        let buf = self.buf;
        let msg = &buf[self.pos..self.pos + len];
        self.pos += len;

        let result = self.decode(msg);
        if result.is_err() {
            self.poisoned = true;
        }
        Some(result)
    }
}

// === Host → device encoders ===

/// Bare request carrying only the header (HELLO_DEVICE, DEVICE_INFO,
/// CAN_INFO, RESET).
pub fn put_req(out: &mut Vec<u8>, id: u8) {
    out.extend_from_slice(&[id, REQ_LEN as u8, 0, 0]);
}

pub fn put_features(out: &mut Vec<u8>, order: ByteOrder, op: u8, arg: u32) {
    let start = out.len();
    out.resize(start + FEATURES_LEN, 0);
    out[start] = MSG_FEATURES;
    out[start + 1] = FEATURES_LEN as u8;
    out[start + 2] = op;
    order.write_u32(&mut out[start + 4..], arg);
}

/// `id` selects nominal (`MSG_NM_BITTIMING`) or data (`MSG_DT_BITTIMING`).
pub fn put_bittiming(out: &mut Vec<u8>, order: ByteOrder, id: u8, brp: u16, tseg1: u16, tseg2: u8, sjw: u8) {
    let start = out.len();
    out.resize(start + BITTIMING_LEN, 0);
    out[start] = id;
    out[start + 1] = BITTIMING_LEN as u8;
    order.write_u16(&mut out[start + 2..], brp);
    order.write_u16(&mut out[start + 4..], tseg1);
    out[start + 6] = tseg2;
    out[start + 7] = sjw;
}

pub fn put_bus(out: &mut Vec<u8>, order: ByteOrder, on: bool) {
    let start = out.len();
    out.resize(start + BUS_LEN, 0);
    out[start] = MSG_BUS;
    out[start + 1] = BUS_LEN as u8;
    order.write_u16(&mut out[start + 2..], on as u16);
}

/// Encode a TX frame. Returns the padded message length.
pub fn put_can_tx(
    out: &mut Vec<u8>,
    order: ByteOrder,
    track_id: u8,
    can_id: u32,
    dlc: u8,
    flags: u8,
    data: &[u8],
) -> usize {
    let data_len = if flags & CAN_FLAG_RTR != 0 { 0 } else { data.len() };
    let len = round_up_len(CAN_TX_HDR_LEN + data_len);
    let start = out.len();
    out.resize(start + len, 0);
    out[start] = MSG_CAN_TX;
    out[start + 1] = len as u8;
    out[start + 2] = track_id;
    out[start + 3] = dlc;
    order.write_u32(&mut out[start + 4..], can_id);
    out[start + 8] = flags;
    out[start + CAN_TX_HDR_LEN..start + CAN_TX_HDR_LEN + data_len]
        .copy_from_slice(&data[..data_len]);
    len
}

/// Terminate a buffer early so the device stops parsing at this offset.
pub fn put_eof(out: &mut Vec<u8>) {
    out.extend_from_slice(&[MSG_EOF, 0, 0, 0]);
}

// === Device → host encoders ===
//
// Used by the loopback device in the test suites; a real device produces
// these on its own firmware side.

pub fn put_hello_host(out: &mut Vec<u8>, proto_version: u8, byte_order: u8, cmd_buffer_size: u16) {
    let start = out.len();
    out.resize(start + HELLO_LEN, 0);
    out[start] = MSG_HELLO_HOST;
    out[start + 1] = HELLO_LEN as u8;
    out[start + 2] = proto_version;
    out[start + 3] = byte_order;
    out[start + 4..start + 6].copy_from_slice(&cmd_buffer_size.to_be_bytes());
}

pub fn put_device_info(out: &mut Vec<u8>, order: ByteOrder, info: &DeviceInfoMsg) {
    let start = out.len();
    out.resize(start + DEVICE_INFO_LEN, 0);
    out[start] = MSG_DEVICE_INFO;
    out[start + 1] = DEVICE_INFO_LEN as u8;
    order.write_u16(&mut out[start + 2..], info.feat_perm);
    order.write_u16(&mut out[start + 4..], info.feat_conf);
    out[start + 6] = info.fw_version.0;
    out[start + 7] = info.fw_version.1;
    out[start + 8] = info.fw_version.2;
    out[start + 9] = info.ch_index;
    let sn_len = info.serial.len().min(SN_BYTES_MAX);
    let name_len = info.name.len().min(NAME_BYTES_MAX);
    out[start + 10] = sn_len as u8;
    out[start + 11] = name_len as u8;
    out[start + 12..start + 12 + sn_len].copy_from_slice(&info.serial[..sn_len]);
    out[start + 28..start + 28 + name_len].copy_from_slice(&info.name.as_bytes()[..name_len]);
}

pub fn put_can_info(out: &mut Vec<u8>, order: ByteOrder, info: &CanInfoMsg) {
    let start = out.len();
    out.resize(start + CAN_INFO_LEN, 0);
    out[start] = MSG_CAN_INFO;
    out[start + 1] = CAN_INFO_LEN as u8;
    order.write_u16(&mut out[start + 2..], info.msg_buffer_size);
    order.write_u32(&mut out[start + 4..], info.can_clk_hz);
    out[start + 8] = info.tx_fifo_size;
    out[start + 9] = info.rx_fifo_size;
    order.write_u16(&mut out[start + 10..], info.nominal.brp_min);
    order.write_u16(&mut out[start + 12..], info.nominal.brp_max);
    order.write_u16(&mut out[start + 14..], info.nominal.tseg1_min);
    order.write_u16(&mut out[start + 16..], info.nominal.tseg1_max);
    out[start + 18] = info.nominal.tseg2_min;
    out[start + 19] = info.nominal.tseg2_max;
    out[start + 20] = info.nominal.sjw_max;
    out[start + 21] = info.data.brp_min as u8;
    out[start + 22] = info.data.brp_max as u8;
    out[start + 23] = info.data.tseg1_min as u8;
    out[start + 24] = info.data.tseg1_max as u8;
    out[start + 25] = info.data.tseg2_min;
    out[start + 26] = info.data.tseg2_max;
    out[start + 27] = info.data.sjw_max;
}

pub fn put_error(out: &mut Vec<u8>, error: u8) {
    out.extend_from_slice(&[MSG_ERROR, ERROR_LEN as u8, error, 0]);
}

pub fn put_can_rx(
    out: &mut Vec<u8>,
    order: ByteOrder,
    can_id: u32,
    dlc: u8,
    flags: u8,
    timestamp_us: u32,
    data: &[u8],
) -> usize {
    let data_len = if flags & CAN_FLAG_RTR != 0 { 0 } else { data.len() };
    let len = round_up_len(CAN_RX_HDR_LEN + data_len);
    let start = out.len();
    out.resize(start + len, 0);
    out[start] = MSG_CAN_RX;
    out[start + 1] = len as u8;
    out[start + 2] = dlc;
    out[start + 3] = flags;
    order.write_u32(&mut out[start + 4..], can_id);
    order.write_u32(&mut out[start + 8..], timestamp_us);
    out[start + CAN_RX_HDR_LEN..start + CAN_RX_HDR_LEN + data_len]
        .copy_from_slice(&data[..data_len]);
    len
}

pub fn put_can_txr(out: &mut Vec<u8>, order: ByteOrder, track_id: u8, flags: u8, timestamp_us: u32) {
    let start = out.len();
    out.resize(start + CAN_TXR_LEN, 0);
    out[start] = MSG_CAN_TXR;
    out[start + 1] = CAN_TXR_LEN as u8;
    out[start + 2] = track_id;
    out[start + 3] = flags;
    order.write_u32(&mut out[start + 4..], timestamp_us);
}

pub fn put_can_status(out: &mut Vec<u8>, order: ByteOrder, status: &CanStatusMsg) {
    let start = out.len();
    out.resize(start + CAN_STATUS_LEN, 0);
    out[start] = MSG_CAN_STATUS;
    out[start + 1] = CAN_STATUS_LEN as u8;
    out[start + 2] = status.flags;
    out[start + 3] = status.bus_status;
    order.write_u32(&mut out[start + 4..], status.timestamp_us);
    order.write_u16(&mut out[start + 8..], status.rx_lost);
    order.write_u16(&mut out[start + 10..], status.tx_dropped);
    out[start + 12] = status.rx_errors;
    out[start + 13] = status.tx_errors;
    out[start + 14] = status.rx_fifo_size;
    out[start + 15] = status.tx_fifo_size;
}

pub fn put_can_error(out: &mut Vec<u8>, order: ByteOrder, error: u8, flags: u8, timestamp_us: u32) {
    let start = out.len();
    out.resize(start + CAN_ERROR_LEN, 0);
    out[start] = MSG_CAN_ERROR;
    out[start + 1] = CAN_ERROR_LEN as u8;
    out[start + 2] = error;
    out[start + 3] = flags;
    order.write_u32(&mut out[start + 4..], timestamp_us);
}
