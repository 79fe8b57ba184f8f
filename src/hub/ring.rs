//! Lock-free single-producer single-consumer rings between the hub and its
//! clients, backed by named shared-memory mappings.
//!
//! Each ring is one file in the hub's session directory, mapped shared by
//! both sides: a header of atomics (free-running put/get indices, loss
//! counters, a sticky error code, flags, and a reconnect generation)
//! followed by a power-of-two array of fixed-size slots. Producer and
//! consumer each own exactly one side; the only thing the non-owning side
//! ever writes is a loss counter. No locks are taken on the fast path, and
//! nothing in a slot is interpreted until the index publishing it has been
//! observed with acquire ordering.
//!
//! Slots are tagged unions in host byte order. File names embed the hub
//! session id so concurrent hub instances never collide.

use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::can::{BusState, CanFrame, ProtocolErrorKind};
use crate::error::{Error, Result};
use crate::wire;

use super::shm::SharedMapping;

/// Sticky: an asynchronous device error was posted to `error`.
pub const RING_FLAG_ERROR: u32 = 0x1;
/// The channel is on the bus.
pub const RING_FLAG_BUS_ON: u32 = 0x2;
/// Sticky until reconnect: the device was unplugged.
pub const RING_FLAG_GONE: u32 = 0x4;

/// Header size in the mapping; slots start here.
pub const RING_HEADER_SIZE: usize = 64;
/// Fixed element size, a power of two.
pub const SLOT_SIZE: usize = 128;

const RING_MAGIC: u32 = 0x5543_3152; // "UC1R"

// Header field offsets.
const OFF_GET: usize = 0;
const OFF_PUT: usize = 4;
const OFF_ERROR: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_GENERATION: usize = 16;
const OFF_LOST_RX: usize = 20;
const OFF_LOST_TX: usize = 24;
const OFF_LOST_STATUS: usize = 28;
const OFF_LOST_ERROR: usize = 32;
const OFF_LOST_LOG: usize = 36;
const OFF_CAPACITY: usize = 40;
const OFF_SLOT_SIZE: usize = 44;
const OFF_MAGIC: usize = 48;

// Slot type tags.
const SLOT_NONE: u8 = 0;
const SLOT_STATUS: u8 = 1;
const SLOT_RX: u8 = 2;
const SLOT_TX: u8 = 3;
const SLOT_ERROR: u8 = 4;
const SLOT_LOG: u8 = 5;

// TX slot option bits (slot byte 3).
const TX_SLOT_ECHO: u8 = 0x1;
const TX_SLOT_DROPPED: u8 = 0x2;

/// Longest log message a slot can carry.
pub const LOG_MESSAGE_MAX: usize = SLOT_SIZE - 8;

/// Bus/controller status snapshot fanned out to every client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub timestamp_us: u64,
    pub bus_state: BusState,
    pub rx_lost: u16,
    pub tx_dropped: u16,
    pub rx_errors: u8,
    pub tx_errors: u8,
    pub rx_fifo_size: u8,
    pub tx_fifo_size: u8,
    pub txr_desync: bool,
}

/// Error frame, either decoded from the device or synthesized from a
/// status change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrameRecord {
    pub timestamp_us: u64,
    pub kind: ProtocolErrorKind,
    /// Direction: true if the error hit a transmission.
    pub tx: bool,
    /// True if the error occurred in the FD data phase.
    pub data_phase: bool,
    pub bus_state: BusState,
    pub rx_lost: u16,
    pub tx_dropped: u16,
    pub rx_errors: u8,
    pub tx_errors: u8,
}

/// Transmit receipt/echo delivered to the client that sent the frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxEchoRecord {
    /// The client's own track id from the submission.
    pub track_id: u32,
    pub timestamp_us: u64,
    pub dropped: bool,
    pub frame: CanFrame,
}

/// Hub-generated textual log record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: log::Level,
    pub message: String,
}

/// One ring element.
#[derive(Clone, Debug, PartialEq)]
pub enum RingItem {
    Status(StatusRecord),
    Rx(CanFrame),
    /// A frame to transmit (TX rings) or an echo/receipt (RX rings).
    Tx { track_id: u32, frame: CanFrame },
    TxEcho(TxEchoRecord),
    Error(ErrorFrameRecord),
    Log(LogRecord),
}

/// Loss counter selector, one per fanned-out element kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LostKind {
    Rx,
    Tx,
    Status,
    Error,
    Log,
}

impl RingItem {
    pub fn lost_kind(&self) -> LostKind {
        match self {
            RingItem::Rx(_) => LostKind::Rx,
            RingItem::Tx { .. } | RingItem::TxEcho(_) => LostKind::Tx,
            RingItem::Status(_) => LostKind::Status,
            RingItem::Error(_) => LostKind::Error,
            RingItem::Log(_) => LostKind::Log,
        }
    }
}

// === Slot codec (host byte order, fixed offsets) ===

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_ne_bytes());
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(bytes)
}

fn bus_state_to_u8(state: BusState) -> u8 {
    match state {
        BusState::ErrorActive => 0,
        BusState::ErrorWarning => 1,
        BusState::ErrorPassive => 2,
        BusState::BusOff => 3,
    }
}

fn bus_state_from_u8(value: u8) -> BusState {
    match value {
        1 => BusState::ErrorWarning,
        2 => BusState::ErrorPassive,
        3 => BusState::BusOff,
        _ => BusState::ErrorActive,
    }
}

fn proto_error_to_u8(kind: ProtocolErrorKind) -> u8 {
    match kind {
        ProtocolErrorKind::None => 0,
        ProtocolErrorKind::Stuff => 1,
        ProtocolErrorKind::Form => 2,
        ProtocolErrorKind::Ack => 3,
        ProtocolErrorKind::Bit1 => 4,
        ProtocolErrorKind::Bit0 => 5,
        ProtocolErrorKind::Crc => 6,
    }
}

fn proto_error_from_u8(value: u8) -> ProtocolErrorKind {
    match value {
        1 => ProtocolErrorKind::Stuff,
        2 => ProtocolErrorKind::Form,
        3 => ProtocolErrorKind::Ack,
        4 => ProtocolErrorKind::Bit1,
        5 => ProtocolErrorKind::Bit0,
        6 => ProtocolErrorKind::Crc,
        _ => ProtocolErrorKind::None,
    }
}

fn log_level_from_u8(value: u8) -> log::Level {
    match value {
        1 => log::Level::Error,
        2 => log::Level::Warn,
        4 => log::Level::Debug,
        5 => log::Level::Trace,
        _ => log::Level::Info,
    }
}

fn decode_frame(dlc: u8, flags: u8, can_id: u32, data: &[u8]) -> Option<CanFrame> {
    let rtr = flags & wire::CAN_FLAG_RTR != 0;
    let data_len = if rtr { 0 } else { crate::can::dlc_to_len(dlc) };
    CanFrame::from_wire(
        can_id,
        dlc,
        flags & wire::CAN_FLAG_EXT != 0,
        rtr,
        flags & wire::CAN_FLAG_FDF != 0,
        flags & wire::CAN_FLAG_BRS != 0,
        flags & wire::CAN_FLAG_ESI != 0,
        &data[..data_len],
    )
    .ok()
}

/// Encode one element into a slot image.
fn encode_slot(item: &RingItem, buf: &mut [u8; SLOT_SIZE]) {
    buf.fill(0);
    match item {
        RingItem::Status(status) => {
            buf[0] = SLOT_STATUS;
            buf[1] = bus_state_to_u8(status.bus_state);
            buf[2] = status.txr_desync as u8;
            put_u16(buf, 4, status.rx_lost);
            put_u16(buf, 6, status.tx_dropped);
            buf[8] = status.rx_errors;
            buf[9] = status.tx_errors;
            buf[10] = status.rx_fifo_size;
            buf[11] = status.tx_fifo_size;
            put_u64(buf, 16, status.timestamp_us);
        }
        RingItem::Rx(frame) => {
            buf[0] = SLOT_RX;
            buf[1] = frame.dlc();
            buf[2] = wire::frame_flags(frame);
            put_u32(buf, 4, frame.id());
            put_u64(buf, 8, frame.timestamp_us().unwrap_or(u64::MAX));
            buf[16..16 + frame.data().len()].copy_from_slice(frame.data());
        }
        RingItem::Tx { track_id, frame } => {
            buf[0] = SLOT_TX;
            buf[1] = frame.dlc();
            buf[2] = wire::frame_flags(frame);
            put_u32(buf, 4, *track_id);
            put_u32(buf, 8, frame.id());
            put_u64(buf, 16, frame.timestamp_us().unwrap_or(u64::MAX));
            buf[24..24 + frame.data().len()].copy_from_slice(frame.data());
        }
        RingItem::TxEcho(echo) => {
            buf[0] = SLOT_TX;
            buf[1] = echo.frame.dlc();
            buf[2] = wire::frame_flags(&echo.frame);
            buf[3] = TX_SLOT_ECHO | if echo.dropped { TX_SLOT_DROPPED } else { 0 };
            put_u32(buf, 4, echo.track_id);
            put_u32(buf, 8, echo.frame.id());
            put_u64(buf, 16, echo.timestamp_us);
            buf[24..24 + echo.frame.data().len()].copy_from_slice(echo.frame.data());
        }
        RingItem::Error(error) => {
            buf[0] = SLOT_ERROR;
            buf[1] = proto_error_to_u8(error.kind);
            buf[2] = (error.tx as u8) | ((error.data_phase as u8) << 1);
            buf[3] = bus_state_to_u8(error.bus_state);
            put_u16(buf, 4, error.rx_lost);
            put_u16(buf, 6, error.tx_dropped);
            buf[8] = error.rx_errors;
            buf[9] = error.tx_errors;
            put_u64(buf, 16, error.timestamp_us);
        }
        RingItem::Log(record) => {
            buf[0] = SLOT_LOG;
            buf[1] = record.level as u8;
            let bytes = record.message.as_bytes();
            let len = bytes.len().min(LOG_MESSAGE_MAX);
            put_u16(buf, 2, len as u16);
            buf[8..8 + len].copy_from_slice(&bytes[..len]);
        }
    }
}

/// Decode a slot image. `None` for empty or unintelligible slots.
fn decode_slot(buf: &[u8; SLOT_SIZE]) -> Option<RingItem> {
    match buf[0] {
        SLOT_STATUS => Some(RingItem::Status(StatusRecord {
            timestamp_us: get_u64(buf, 16),
            bus_state: bus_state_from_u8(buf[1]),
            rx_lost: get_u16(buf, 4),
            tx_dropped: get_u16(buf, 6),
            rx_errors: buf[8],
            tx_errors: buf[9],
            rx_fifo_size: buf[10],
            tx_fifo_size: buf[11],
            txr_desync: buf[2] != 0,
        })),
        SLOT_RX => {
            let mut frame = decode_frame(buf[1], buf[2], get_u32(buf, 4), &buf[16..80])?;
            let ts = get_u64(buf, 8);
            frame.set_timestamp((ts != u64::MAX).then_some(ts));
            Some(RingItem::Rx(frame))
        }
        SLOT_TX => {
            let mut frame = decode_frame(buf[1], buf[2], get_u32(buf, 8), &buf[24..88])?;
            let ts = get_u64(buf, 16);
            if buf[3] & TX_SLOT_ECHO != 0 {
                frame.set_timestamp(Some(ts));
                Some(RingItem::TxEcho(TxEchoRecord {
                    track_id: get_u32(buf, 4),
                    timestamp_us: ts,
                    dropped: buf[3] & TX_SLOT_DROPPED != 0,
                    frame,
                }))
            } else {
                frame.set_timestamp((ts != u64::MAX).then_some(ts));
                Some(RingItem::Tx {
                    track_id: get_u32(buf, 4),
                    frame,
                })
            }
        }
        SLOT_ERROR => Some(RingItem::Error(ErrorFrameRecord {
            timestamp_us: get_u64(buf, 16),
            kind: proto_error_from_u8(buf[1]),
            tx: buf[2] & 0x1 != 0,
            data_phase: buf[2] & 0x2 != 0,
            bus_state: bus_state_from_u8(buf[3]),
            rx_lost: get_u16(buf, 4),
            tx_dropped: get_u16(buf, 6),
            rx_errors: buf[8],
            tx_errors: buf[9],
        })),
        SLOT_LOG => {
            let len = (get_u16(buf, 2) as usize).min(LOG_MESSAGE_MAX);
            Some(RingItem::Log(LogRecord {
                level: log_level_from_u8(buf[1]),
                message: String::from_utf8_lossy(&buf[8..8 + len]).into_owned(),
            }))
        }
        SLOT_NONE => None,
        other => {
            warn!("unknown ring slot type {other}");
            None
        }
    }
}

// === The ring proper ===

struct RingShared {
    mapping: SharedMapping,
    capacity: u32,
}

impl RingShared {
    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        // the mapping is page aligned and the offsets are 4-byte aligned
        unsafe { &*(self.mapping.ptr().add(off) as *const AtomicU32) }
    }

    fn atomic_i32(&self, off: usize) -> &AtomicI32 {
        unsafe { &*(self.mapping.ptr().add(off) as *const AtomicI32) }
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        let offset = RING_HEADER_SIZE + (index as usize) * SLOT_SIZE;
        unsafe { self.mapping.ptr().add(offset) }
    }
}

fn lost_offset(kind: LostKind) -> usize {
    match kind {
        LostKind::Rx => OFF_LOST_RX,
        LostKind::Tx => OFF_LOST_TX,
        LostKind::Status => OFF_LOST_STATUS,
        LostKind::Error => OFF_LOST_ERROR,
        LostKind::Log => OFF_LOST_LOG,
    }
}

/// Cloneable view of a ring's header, for control-plane flag and
/// generation updates from either side.
#[derive(Clone)]
pub struct HeaderHandle {
    shared: Arc<RingShared>,
}

impl HeaderHandle {
    /// Count one dropped element. Callable from either side.
    pub fn add_lost(&self, kind: LostKind) {
        self.shared
            .atomic_u32(lost_offset(kind))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read-and-clear a loss counter.
    pub fn take_lost(&self, kind: LostKind) -> u32 {
        self.shared.atomic_u32(lost_offset(kind)).swap(0, Ordering::Relaxed)
    }

    pub fn flags(&self) -> u32 {
        self.shared.atomic_u32(OFF_FLAGS).load(Ordering::Acquire)
    }

    pub fn set_flags(&self, bits: u32) {
        self.shared.atomic_u32(OFF_FLAGS).fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, bits: u32) {
        self.shared.atomic_u32(OFF_FLAGS).fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn error(&self) -> i32 {
        self.shared.atomic_i32(OFF_ERROR).load(Ordering::Acquire)
    }

    /// Post a sticky device error. The first error wins until cleared.
    pub fn post_error(&self, code: i32) {
        let _ = self.shared.atomic_i32(OFF_ERROR).compare_exchange(
            0,
            code,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.set_flags(RING_FLAG_ERROR);
    }

    pub fn clear_error(&self) {
        self.shared.atomic_i32(OFF_ERROR).store(0, Ordering::Release);
        self.clear_flags(RING_FLAG_ERROR);
    }

    pub fn generation(&self) -> u32 {
        self.shared.atomic_u32(OFF_GENERATION).load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.shared.atomic_u32(OFF_GENERATION).fetch_add(1, Ordering::AcqRel);
    }

    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    /// Elements currently queued.
    pub fn len(&self) -> u32 {
        self.shared
            .atomic_u32(OFF_PUT)
            .load(Ordering::Acquire)
            .wrapping_sub(self.shared.atomic_u32(OFF_GET).load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.shared.capacity
    }
}

/// One side of a ring, before it is committed to a direction.
pub struct RingMem {
    shared: Arc<RingShared>,
}

impl RingMem {
    pub fn into_producer(self) -> RingProducer {
        RingProducer {
            shared: self.shared,
        }
    }

    pub fn into_consumer(self) -> RingConsumer {
        RingConsumer {
            shared: self.shared,
        }
    }
}

fn validate_capacity(capacity: usize) -> Result<u32> {
    if capacity == 0 || !capacity.is_power_of_two() || capacity > 1 << 20 {
        return Err(Error::InvalidParam);
    }
    Ok(capacity as u32)
}

/// Create the backing file for a new ring. The creator owns the file.
pub fn create(path: &Path, capacity: usize) -> Result<RingMem> {
    let capacity = validate_capacity(capacity)?;
    let len = RING_HEADER_SIZE + capacity as usize * SLOT_SIZE;
    let mapping = SharedMapping::create(path, len)?;

    let shared = RingShared { mapping, capacity };
    shared.atomic_u32(OFF_CAPACITY).store(capacity, Ordering::Relaxed);
    shared
        .atomic_u32(OFF_SLOT_SIZE)
        .store(SLOT_SIZE as u32, Ordering::Relaxed);
    shared.atomic_u32(OFF_MAGIC).store(RING_MAGIC, Ordering::Release);

    Ok(RingMem {
        shared: Arc::new(shared),
    })
}

/// Map a ring created by the other side.
pub fn open(path: &Path) -> Result<RingMem> {
    let mapping = SharedMapping::open(path)?;
    if mapping.len() < RING_HEADER_SIZE {
        return Err(Error::InvalidParam);
    }

    let probe = RingShared {
        mapping,
        capacity: 0,
    };
    if probe.atomic_u32(OFF_MAGIC).load(Ordering::Acquire) != RING_MAGIC
        || probe.atomic_u32(OFF_SLOT_SIZE).load(Ordering::Relaxed) != SLOT_SIZE as u32
    {
        return Err(Error::InvalidParam);
    }

    let capacity = probe.atomic_u32(OFF_CAPACITY).load(Ordering::Relaxed);
    validate_capacity(capacity as usize)?;
    if probe.mapping.len() < RING_HEADER_SIZE + capacity as usize * SLOT_SIZE {
        return Err(Error::InvalidParam);
    }

    Ok(RingMem {
        shared: Arc::new(RingShared {
            capacity,
            ..probe
        }),
    })
}

pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    pub fn header(&self) -> HeaderHandle {
        HeaderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn header_handle(&self) -> HeaderHandle {
        self.header()
    }

    pub fn path(&self) -> &Path {
        self.shared.mapping.path()
    }

    /// Write one element. On overflow the element comes back and the
    /// caller decides which loss counter to bump.
    pub fn try_push(&mut self, item: RingItem) -> std::result::Result<(), RingItem> {
        let put = self.shared.atomic_u32(OFF_PUT).load(Ordering::Relaxed);
        let get = self.shared.atomic_u32(OFF_GET).load(Ordering::Acquire);

        if put.wrapping_sub(get) >= self.shared.capacity {
            return Err(item);
        }

        let mut slot = [0u8; SLOT_SIZE];
        encode_slot(&item, &mut slot);
        let index = put & (self.shared.capacity - 1);
        // sole producer: this slot is invisible until the store below
        unsafe {
            std::ptr::copy_nonoverlapping(slot.as_ptr(), self.shared.slot_ptr(index), SLOT_SIZE)
        };

        self.shared
            .atomic_u32(OFF_PUT)
            .store(put.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Push, counting the element's own kind on overflow.
    pub fn push_or_count_lost(&mut self, item: RingItem) -> bool {
        let kind = item.lost_kind();
        match self.try_push(item) {
            Ok(()) => true,
            Err(_) => {
                self.header().add_lost(kind);
                false
            }
        }
    }
}

pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    pub fn header(&self) -> HeaderHandle {
        HeaderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn header_handle(&self) -> HeaderHandle {
        self.header()
    }

    /// Take the next element, if any. Unintelligible slots (a rogue
    /// producer) are skipped.
    pub fn pop(&mut self) -> Option<RingItem> {
        loop {
            let get = self.shared.atomic_u32(OFF_GET).load(Ordering::Relaxed);
            let put = self.shared.atomic_u32(OFF_PUT).load(Ordering::Acquire);

            if get == put {
                return None;
            }

            let index = get & (self.shared.capacity - 1);
            let mut slot = [0u8; SLOT_SIZE];
            // the acquire above ordered the producer's writes before this
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.shared.slot_ptr(index),
                    slot.as_mut_ptr(),
                    SLOT_SIZE,
                )
            };

            self.shared
                .atomic_u32(OFF_GET)
                .store(get.wrapping_add(1), Ordering::Release);

            match decode_slot(&slot) {
                Some(item) => return Some(item),
                None => {
                    warn!("skipping undecodable ring slot at index {index}");
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_ring_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ucan-ringtest-{}-{tag}.ring", uuid::Uuid::new_v4()))
    }

    fn pair(capacity: usize, tag: &str) -> (RingProducer, RingConsumer, PathBuf) {
        let path = temp_ring_path(tag);
        let producer = create(&path, capacity).unwrap().into_producer();
        // the other side attaches through the file, like a second process
        let consumer = open(&path).unwrap().into_consumer();
        (producer, consumer, path)
    }

    fn frame(id: u32) -> RingItem {
        RingItem::Rx(CanFrame::new(id & 0x7ff, &[id as u8]).unwrap())
    }

    #[test]
    fn capacity_must_be_a_power_of_two() {
        assert!(create(&temp_ring_path("c0"), 0).is_err());
        assert!(create(&temp_ring_path("c3"), 3).is_err());
        assert!(create(&temp_ring_path("c8"), 8).is_ok());
    }

    #[test]
    fn open_validates_the_header() {
        let path = temp_ring_path("badmagic");
        let _keep = create(&path, 8).unwrap();
        // corrupt the magic through a raw view
        let raw = super::super::shm::SharedMapping::open(&path).unwrap();
        unsafe { *(raw.ptr().add(OFF_MAGIC) as *mut u32) = 0 };
        assert!(open(&path).is_err());
    }

    #[test]
    fn slot_codec_round_trips_every_kind() {
        let mut fd = CanFrame::new_fd(0x1abcd, &[7u8; 48], true, true, false).unwrap();
        fd.set_timestamp(Some(0x1_0000_0042));

        let items = vec![
            RingItem::Status(StatusRecord {
                timestamp_us: 123_456,
                bus_state: BusState::ErrorPassive,
                rx_lost: 3,
                tx_dropped: 1,
                rx_errors: 130,
                tx_errors: 7,
                rx_fifo_size: 12,
                tx_fifo_size: 2,
                txr_desync: true,
            }),
            RingItem::Rx(fd.clone()),
            RingItem::Rx(CanFrame::new_remote(0x42, 4, false).unwrap()),
            RingItem::Tx {
                track_id: 0xdead_beef,
                frame: CanFrame::new(0x123, &[1, 2, 3]).unwrap(),
            },
            RingItem::TxEcho(TxEchoRecord {
                track_id: 7,
                timestamp_us: 999,
                dropped: true,
                frame: {
                    let mut f = CanFrame::new(0x100, &[9]).unwrap();
                    f.set_timestamp(Some(999));
                    f
                },
            }),
            RingItem::Error(ErrorFrameRecord {
                timestamp_us: 55,
                kind: ProtocolErrorKind::Crc,
                tx: true,
                data_phase: true,
                bus_state: BusState::BusOff,
                rx_lost: 0,
                tx_dropped: 2,
                rx_errors: 1,
                tx_errors: 250,
            }),
            RingItem::Log(LogRecord {
                level: log::Level::Warn,
                message: "bus load high".to_string(),
            }),
        ];

        for item in items {
            let mut slot = [0u8; SLOT_SIZE];
            encode_slot(&item, &mut slot);
            assert_eq!(decode_slot(&slot).unwrap(), item, "{item:?}");
        }
    }

    #[test]
    fn oversized_log_messages_are_truncated() {
        let item = RingItem::Log(LogRecord {
            level: log::Level::Info,
            message: "x".repeat(500),
        });
        let mut slot = [0u8; SLOT_SIZE];
        encode_slot(&item, &mut slot);
        match decode_slot(&slot).unwrap() {
            RingItem::Log(record) => assert_eq!(record.message.len(), LOG_MESSAGE_MAX),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fifo_order_no_duplicates_across_mappings() {
        let (mut producer, mut consumer, _path) = pair(8, "fifo");

        for id in 0..6u32 {
            producer.try_push(frame(id)).unwrap();
        }
        for id in 0..6u32 {
            assert_eq!(consumer.pop(), Some(frame(id)));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn overflow_rejects_and_counts() {
        let (mut producer, mut consumer, _path) = pair(4, "overflow");

        for id in 0..4u32 {
            assert!(producer.push_or_count_lost(frame(id)));
        }
        assert!(!producer.push_or_count_lost(frame(4)));
        assert!(!producer.push_or_count_lost(frame(5)));
        // the consumer side reads the same counters
        assert_eq!(consumer.header().take_lost(LostKind::Rx), 2);
        assert_eq!(consumer.header().take_lost(LostKind::Rx), 0);

        for id in 0..4u32 {
            assert_eq!(consumer.pop(), Some(frame(id)));
        }
    }

    #[test]
    fn interleaved_producer_consumer_preserves_order() {
        let (mut producer, mut consumer, _path) = pair(4, "interleave");
        let mut next_push = 0u32;
        let mut next_pop = 0u32;

        // cycles the small ring thousands of times
        for step in 0..10_000 {
            if step % 3 != 2 {
                if producer.try_push(frame(next_push)).is_ok() {
                    next_push += 1;
                }
            } else if let Some(item) = consumer.pop() {
                assert_eq!(item, frame(next_pop));
                next_pop += 1;
            }
        }
        while let Some(item) = consumer.pop() {
            assert_eq!(item, frame(next_pop));
            next_pop += 1;
        }
        assert_eq!(next_push, next_pop);
    }

    #[test]
    fn concurrent_spsc_sees_every_element_in_order() {
        let (mut producer, mut consumer, _path) = pair(64, "spsc");
        const N: u32 = 50_000;

        let producer_thread = std::thread::spawn(move || {
            let mut id = 0u32;
            while id < N {
                if producer
                    .try_push(RingItem::Tx {
                        track_id: id,
                        frame: CanFrame::new(1, &[]).unwrap(),
                    })
                    .is_ok()
                {
                    id += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u32;
        while expected < N {
            match consumer.pop() {
                Some(RingItem::Tx { track_id, .. }) => {
                    assert_eq!(track_id, expected);
                    expected += 1;
                }
                Some(other) => panic!("unexpected {other:?}"),
                None => std::hint::spin_loop(),
            }
        }

        producer_thread.join().unwrap();
    }

    #[test]
    fn sticky_error_keeps_first_code() {
        let (producer, consumer, _path) = pair(4, "error");
        producer.header().post_error(5);
        producer.header().post_error(9);
        assert_eq!(consumer.header().error(), 5);
        assert_ne!(consumer.header().flags() & RING_FLAG_ERROR, 0);

        producer.header().clear_error();
        assert_eq!(consumer.header().error(), 0);
        assert_eq!(consumer.header().flags() & RING_FLAG_ERROR, 0);
    }

    #[test]
    fn generation_and_flags_cross_the_mapping() {
        let (producer, consumer, _path) = pair(4, "gen");
        assert_eq!(consumer.header().generation(), 0);
        producer.header().set_flags(RING_FLAG_GONE);
        producer.header().bump_generation();
        assert_ne!(consumer.header().flags() & RING_FLAG_GONE, 0);
        assert_eq!(consumer.header().generation(), 1);
        producer.header().clear_flags(RING_FLAG_GONE);
        assert_eq!(consumer.header().flags() & RING_FLAG_GONE, 0);
    }
}
