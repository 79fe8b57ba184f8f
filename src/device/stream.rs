//! The CAN data pipe: inbound demultiplex and outbound batch encoding.
//!
//! The RX half keeps a full complement of bulk-in transfers posted,
//! walks the packed messages of each completion, lifts timestamps, drives
//! the bus state machine, and forwards typed events to the hub. The TX
//! half fills one reserved transfer buffer with as many TX messages as fit
//! (a batch), then submits it; the bulk-out completion and the per-frame
//! transmit receipts release the buffer through [`TxEngine`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::can::{BusState, CanFrame, ProtocolErrorKind};
use crate::error::{Error, Result};
use crate::hub::ring::{ErrorFrameRecord, RingItem, StatusRecord, TxEchoRecord};
use crate::timetrack::DeviceTimeTracker;
use crate::wire::codec::{self, CanErrorMsg, CanRxMsg, CanStatusMsg, CanTxrMsg, Message, MessageReader};
use crate::wire::{self, ByteOrder};
use crate::ClientId;

use super::urb::{EchoRecord, TxEngine, TxReservation};
use super::{BulkPipe, DeviceDescriptor};

/// Deadline for a submitted bulk-out buffer.
const TX_SUBMIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Events flowing from the stream engine to the hub workers.
#[derive(Debug)]
pub enum StreamEvent {
    /// Fan out to every attached client.
    Item(RingItem),
    /// Deliver to one client only (TX receipt/echo).
    Echo { client: ClientId, item: RingItem },
    /// Echo generated at submission time (submit echo mode).
    EchoSubmit { client: ClientId, item: RingItem },
    /// Bus state machine moved.
    BusState(BusState),
    /// The device is gone; the stream has terminated.
    Detached,
}

fn map_proto_error(error: u8) -> ProtocolErrorKind {
    match error {
        wire::CAN_ERROR_STUFF => ProtocolErrorKind::Stuff,
        wire::CAN_ERROR_FORM => ProtocolErrorKind::Form,
        wire::CAN_ERROR_ACK => ProtocolErrorKind::Ack,
        wire::CAN_ERROR_BIT1 => ProtocolErrorKind::Bit1,
        wire::CAN_ERROR_BIT0 => ProtocolErrorKind::Bit0,
        wire::CAN_ERROR_CRC => ProtocolErrorKind::Crc,
        _ => ProtocolErrorKind::None,
    }
}

fn map_bus_status(bus_status: u8) -> BusState {
    match bus_status {
        wire::CAN_STATUS_BUS_OFF => BusState::BusOff,
        wire::CAN_STATUS_ERROR_PASSIVE => BusState::ErrorPassive,
        wire::CAN_STATUS_ERROR_WARNING => BusState::ErrorWarning,
        _ => BusState::ErrorActive,
    }
}

/// RX worker: drains bulk-in completions and parses them.
pub struct StreamRx {
    pipe: Arc<dyn BulkPipe>,
    order: ByteOrder,
    msg_buffer_size: usize,
    rx_urb_count: usize,
    tx: Arc<TxEngine>,
    tracker: DeviceTimeTracker,
    bus_state: BusState,
    static_rx_fifo: u8,
    static_tx_fifo: u8,
    prev_rx_fifo: u8,
    prev_tx_fifo: u8,
    rx_errors: u8,
    tx_errors: u8,
    events: mpsc::Sender<StreamEvent>,
    shutdown: watch::Receiver<bool>,
    out: Vec<StreamEvent>,
}

impl StreamRx {
    pub fn new(
        pipe: Arc<dyn BulkPipe>,
        descriptor: &DeviceDescriptor,
        order: ByteOrder,
        tx: Arc<TxEngine>,
        events: mpsc::Sender<StreamEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipe,
            order,
            msg_buffer_size: descriptor.msg_buffer_size as usize,
            rx_urb_count: (descriptor.rx_fifo_size as usize).min(super::urb::MAX_RX_URBS).max(1),
            tx,
            tracker: DeviceTimeTracker::new(),
            bus_state: BusState::ErrorActive,
            static_rx_fifo: descriptor.rx_fifo_size,
            static_tx_fifo: descriptor.tx_fifo_size,
            prev_rx_fifo: 0,
            prev_tx_fifo: 0,
            rx_errors: 0,
            tx_errors: 0,
            events,
            shutdown,
            out: Vec::new(),
        }
    }

    /// Keep `rx_urb_count` reads posted until shutdown or device loss.
    pub async fn run(mut self) {
        type ReadFuture = Pin<Box<dyn Future<Output = (usize, Result<Vec<u8>>)> + Send>>;

        let submit = |pipe: Arc<dyn BulkPipe>, index: usize, len: usize| -> ReadFuture {
            Box::pin(async move { (index, pipe.bulk_in(len, Duration::ZERO).await) })
        };

        let mut inflight: FuturesUnordered<ReadFuture> = (0..self.rx_urb_count)
            .map(|i| submit(self.pipe.clone(), i, self.msg_buffer_size))
            .collect();

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("rx stream: shutdown");
                        return;
                    }
                }

                Some((index, result)) = inflight.next() => {
                    match result {
                        Ok(buf) => {
                            if !buf.is_empty() {
                                self.process_buffer(&buf);
                            }
                            if !self.flush_events().await {
                                return;
                            }
                            inflight.push(submit(self.pipe.clone(), index, self.msg_buffer_size));
                        }
                        Err(Error::Gone) => {
                            info!("rx stream: device gone");
                            let _ = self.events.send(StreamEvent::Detached).await;
                            return;
                        }
                        Err(Error::Timeout) => {
                            inflight.push(submit(self.pipe.clone(), index, self.msg_buffer_size));
                        }
                        Err(e) => {
                            warn!("rx transfer {index} failed: {e}");
                            inflight.push(submit(self.pipe.clone(), index, self.msg_buffer_size));
                        }
                    }
                }
            }
        }
    }

    async fn flush_events(&mut self) -> bool {
        for event in self.out.drain(..) {
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Walk one completed buffer. Malformed content is hex-dumped and the
    /// rest of the buffer discarded; the stream itself continues.
    fn process_buffer(&mut self, buf: &[u8]) {
        let mut reader = MessageReader::new(buf, self.order);

        while let Some(message) = reader.next() {
            match message {
                Ok(Message::CanStatus(status)) => self.on_status(&status),
                Ok(Message::CanError(err)) => self.on_error(&err),
                Ok(Message::CanRx(rx)) => self.on_rx(&rx),
                Ok(Message::CanTxr(txr)) => self.on_txr(&txr),
                Ok(Message::Skipped { id, len }) => {
                    debug!("skip unknown msg id={id:#04x} len={len}");
                }
                Ok(other) => {
                    debug!("unexpected message on data pipe: {other:?}");
                }
                Err(e) => {
                    error!(
                        "malformed buffer at offset {}: {e}; dump: {}",
                        reader.position(),
                        hex::encode(buf)
                    );
                    return;
                }
            }
        }
    }

    fn on_status(&mut self, status: &CanStatusMsg) {
        if status.rx_fifo_size >= self.static_rx_fifo / 2
            && status.rx_fifo_size != self.prev_rx_fifo
        {
            debug!("rx fifo fill {}", status.rx_fifo_size);
            self.prev_rx_fifo = status.rx_fifo_size;
        }
        if status.tx_fifo_size >= self.static_tx_fifo / 2
            && status.tx_fifo_size != self.prev_tx_fifo
        {
            debug!("tx fifo fill {}", status.tx_fifo_size);
            self.prev_tx_fifo = status.tx_fifo_size;
        }

        let timestamp_us = self.tracker.track(status.timestamp_us);
        let desync = status.flags & wire::CAN_STATUS_FLAG_TXR_DESYNC != 0;

        // desync forces bus-off; restarting the bus clears it
        let next_state = if desync {
            if self.bus_state != BusState::BusOff {
                error!("txr desync");
            }
            BusState::BusOff
        } else {
            map_bus_status(status.bus_status)
        };

        let state_change = next_state != self.bus_state;
        if state_change {
            info!("can bus status {:?} -> {:?}", self.bus_state, next_state);
            self.bus_state = next_state;
            self.out.push(StreamEvent::BusState(next_state));
        }

        if status.rx_lost > 0 {
            debug!("device lost {} rx frames", status.rx_lost);
        }
        if status.tx_dropped > 0 {
            debug!("device dropped {} tx frames", status.tx_dropped);
        }

        self.rx_errors = status.rx_errors;
        self.tx_errors = status.tx_errors;

        self.out.push(StreamEvent::Item(RingItem::Status(StatusRecord {
            timestamp_us,
            bus_state: next_state,
            rx_lost: status.rx_lost,
            tx_dropped: status.tx_dropped,
            rx_errors: status.rx_errors,
            tx_errors: status.tx_errors,
            rx_fifo_size: status.rx_fifo_size,
            tx_fifo_size: status.tx_fifo_size,
            txr_desync: desync,
        })));

        // device-side losses and state changes surface as an error frame
        // with the controller bytes filled in
        if status.rx_lost > 0 || status.tx_dropped > 0 || state_change || desync {
            self.out.push(StreamEvent::Item(RingItem::Error(ErrorFrameRecord {
                timestamp_us,
                kind: ProtocolErrorKind::None,
                tx: false,
                data_phase: false,
                bus_state: next_state,
                rx_lost: status.rx_lost,
                tx_dropped: status.tx_dropped,
                rx_errors: status.rx_errors,
                tx_errors: status.tx_errors,
            })));
        }
    }

    fn on_error(&mut self, err: &CanErrorMsg) {
        if err.error == wire::CAN_ERROR_NONE {
            return;
        }

        let timestamp_us = self.tracker.track(err.timestamp_us);

        self.out.push(StreamEvent::Item(RingItem::Error(ErrorFrameRecord {
            timestamp_us,
            kind: map_proto_error(err.error),
            tx: err.flags & wire::CAN_ERROR_FLAG_RXTX_TX != 0,
            data_phase: err.flags & wire::CAN_ERROR_FLAG_NMDT_DT != 0,
            bus_state: self.bus_state,
            rx_lost: 0,
            tx_dropped: 0,
            rx_errors: self.rx_errors,
            tx_errors: self.tx_errors,
        })));
    }

    fn on_rx(&mut self, rx: &CanRxMsg<'_>) {
        let frame = CanFrame::from_wire(
            rx.can_id,
            rx.dlc,
            rx.flags & wire::CAN_FLAG_EXT != 0,
            rx.flags & wire::CAN_FLAG_RTR != 0,
            rx.flags & wire::CAN_FLAG_FDF != 0,
            rx.flags & wire::CAN_FLAG_BRS != 0,
            rx.flags & wire::CAN_FLAG_ESI != 0,
            rx.data,
        );

        match frame {
            Ok(mut frame) => {
                frame.set_timestamp(Some(self.tracker.track(rx.timestamp_us)));
                self.out.push(StreamEvent::Item(RingItem::Rx(frame)));
            }
            Err(_) => {
                warn!(
                    "rx frame with inconsistent flags: id={:#x} dlc={} flags={:#04x}",
                    rx.can_id, rx.dlc, rx.flags
                );
            }
        }
    }

    fn on_txr(&mut self, txr: &CanTxrMsg) {
        let timestamp_us = self.tracker.track(txr.timestamp_us);
        let dropped = txr.flags & wire::CAN_FLAG_DRP != 0;

        let Some(release) = self.tx.complete_txr(txr.track_id) else {
            return;
        };

        let (Some(client), Some(echo)) = (release.client, release.echo) else {
            // owner disconnected while the frame was in flight
            return;
        };

        if dropped {
            debug!("tx frame of client {client} dropped by device (track {})", txr.track_id);
        }

        let frame = CanFrame::from_wire(
            echo.can_id,
            echo.dlc,
            echo.flags & wire::CAN_FLAG_EXT != 0,
            echo.flags & wire::CAN_FLAG_RTR != 0,
            echo.flags & wire::CAN_FLAG_FDF != 0,
            echo.flags & wire::CAN_FLAG_BRS != 0,
            echo.flags & wire::CAN_FLAG_ESI != 0,
            &echo.data,
        );

        let Ok(mut frame) = frame else { return };
        frame.set_timestamp(Some(timestamp_us));

        self.out.push(StreamEvent::Echo {
            client,
            item: RingItem::TxEcho(TxEchoRecord {
                track_id: echo.client_track_id,
                timestamp_us,
                dropped,
                frame,
            }),
        });
    }
}

/// A transfer buffer being filled with TX messages.
pub struct TxBatch {
    reservation: TxReservation,
    tracks: Vec<u8>,
}

impl TxBatch {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// TX submission half, used by the hub's arbitration worker.
#[derive(Clone)]
pub struct StreamTx {
    pipe: Arc<dyn BulkPipe>,
    order: ByteOrder,
    msg_buffer_size: usize,
    ep_size: usize,
    tx: Arc<TxEngine>,
    events: mpsc::Sender<StreamEvent>,
}

impl StreamTx {
    pub fn new(
        pipe: Arc<dyn BulkPipe>,
        descriptor: &DeviceDescriptor,
        order: ByteOrder,
        tx: Arc<TxEngine>,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            pipe,
            order,
            msg_buffer_size: descriptor.msg_buffer_size as usize,
            ep_size: descriptor.ep_size as usize,
            tx,
            events,
        }
    }

    pub fn engine(&self) -> &Arc<TxEngine> {
        &self.tx
    }

    pub fn try_batch_begin(&self) -> Option<TxBatch> {
        self.tx.try_begin().map(|reservation| TxBatch {
            reservation,
            tracks: Vec::new(),
        })
    }

    pub async fn batch_begin(&self) -> TxBatch {
        TxBatch {
            reservation: self.tx.begin().await,
            tracks: Vec::new(),
        }
    }

    /// Claim a track id for `client`, storing what the receipt path needs.
    pub fn claim_track(&self, client: ClientId, frame: &CanFrame, client_track_id: u32) -> Option<u8> {
        self.tx.try_claim_track(
            client,
            EchoRecord {
                can_id: frame.id(),
                dlc: frame.dlc(),
                flags: frame_flags(frame),
                data: frame.data().to_vec(),
                client_track_id,
            },
        )
    }

    pub fn unclaim_track(&self, track: u8) {
        self.tx.unclaim_track(track);
    }

    /// Append one frame. Returns false if the buffer has no room; the
    /// caller then submits this batch and starts a new one.
    pub fn batch_add(&self, batch: &mut TxBatch, frame: &CanFrame, track: u8) -> bool {
        let data_len = if frame.is_rtr() { 0 } else { frame.data().len() };
        let needed = wire::round_up_len(codec::CAN_TX_HDR_LEN + data_len);

        // keep room for the 4-byte terminator appended at submit time
        if batch.reservation.buffer.len() + needed + wire::LEN_MULTIPLE > self.msg_buffer_size {
            return false;
        }

        codec::put_can_tx(
            &mut batch.reservation.buffer,
            self.order,
            track,
            frame.id(),
            frame.dlc(),
            frame_flags(frame),
            frame.data(),
        );
        batch.tracks.push(track);
        true
    }

    /// Return an empty batch's buffer without touching the device.
    pub fn batch_abort(&self, batch: TxBatch) {
        self.tx.abort(batch.reservation);
    }

    /// Seal the batch and hand it to the bulk pipe. The write completes in
    /// the background; the buffer frees once the completion and all
    /// receipts are in.
    pub fn batch_end(&self, batch: TxBatch) {
        if batch.tracks.is_empty() {
            self.batch_abort(batch);
            return;
        }

        let TxBatch { reservation, tracks } = batch;
        let TxReservation { slot, mut buffer } = reservation;

        // Devices that honor neither a short packet nor the zero-packet
        // transfer flag hang on exact packet multiples; an explicit
        // four-byte EOF tail sidesteps that.
        let tx_len = buffer.len();
        if tx_len < self.msg_buffer_size
            && self.ep_size < self.msg_buffer_size
            && tx_len % self.ep_size == 0
        {
            codec::put_eof(&mut buffer);
        }

        self.tx.mark_submitted(slot, &tracks);

        let pipe = self.pipe.clone();
        let tx = self.tx.clone();
        let events = self.events.clone();
        let msg_buffer_size = self.msg_buffer_size;

        tokio::spawn(async move {
            let expected = buffer.len();
            match pipe.bulk_out(buffer, TX_SUBMIT_TIMEOUT).await {
                Ok(written) if written == expected => {
                    tx.complete_tx(slot, Vec::with_capacity(msg_buffer_size));
                }
                Ok(written) => {
                    warn!("short bulk-out: {written}/{expected} bytes");
                    tx.fail_submitted(slot, Vec::with_capacity(msg_buffer_size));
                }
                Err(Error::Gone) => {
                    info!("tx stream: device gone");
                    tx.fail_submitted(slot, Vec::with_capacity(msg_buffer_size));
                    let _ = events.send(StreamEvent::Detached).await;
                }
                Err(e) => {
                    warn!("tx submit failed: {e}");
                    tx.fail_submitted(slot, Vec::with_capacity(msg_buffer_size));
                }
            }
        });
    }
}

pub use crate::wire::frame_flags;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::LoopbackDevice;

    struct Fixture {
        device: LoopbackDevice,
        stream_tx: StreamTx,
        events: mpsc::Receiver<StreamEvent>,
        shutdown: watch::Sender<bool>,
        engine: Arc<TxEngine>,
    }

    async fn fixture() -> Fixture {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();

        let engine = Arc::new(TxEngine::new(
            probed.descriptor.tx_fifo_size as usize,
            probed.descriptor.msg_buffer_size as usize,
        ));
        let (event_tx, events) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let rx = StreamRx::new(
            probed.msg_pipe.clone(),
            &probed.descriptor,
            probed.order,
            engine.clone(),
            event_tx.clone(),
            shutdown_rx,
        );
        tokio::spawn(rx.run());

        let stream_tx = StreamTx::new(
            probed.msg_pipe.clone(),
            &probed.descriptor,
            probed.order,
            engine.clone(),
            event_tx,
        );

        Fixture {
            device,
            stream_tx,
            events,
            shutdown,
            engine,
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn tx_produces_echo_and_releases_slot() {
        let mut fx = fixture().await;

        let frame = CanFrame::new(0x123, &[1, 2, 3]).unwrap();
        let track = fx.stream_tx.claim_track(2, &frame, 7).unwrap();
        let mut batch = fx.stream_tx.batch_begin().await;
        assert!(fx.stream_tx.batch_add(&mut batch, &frame, track));
        fx.stream_tx.batch_end(batch);

        match next_event(&mut fx.events).await {
            StreamEvent::Echo { client, item: RingItem::TxEcho(echo) } => {
                assert_eq!(client, 2);
                assert_eq!(echo.track_id, 7);
                assert!(!echo.dropped);
                assert_eq!(echo.frame.id(), 0x123);
                assert_eq!(echo.frame.data(), &[1, 2, 3]);
                assert!(echo.frame.timestamp_us().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        // both completion halves have fired; the pool is whole again
        tokio::time::timeout(Duration::from_secs(1), fx.engine.begin())
            .await
            .unwrap();
        drop(fx.shutdown);
    }

    #[tokio::test]
    async fn slot_is_held_until_the_receipt_arrives() {
        let fx = fixture().await;
        fx.device
            .msg
            .hold_txr
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let count = fx.engine.slot_count();
        let frame = CanFrame::new(0x10, &[]).unwrap();

        // exhaust every slot: writes complete, receipts are withheld
        for i in 0..count {
            let track = fx.stream_tx.claim_track(0, &frame, i as u32).unwrap();
            let mut batch = fx.stream_tx.batch_begin().await;
            assert!(fx.stream_tx.batch_add(&mut batch, &frame, track));
            fx.stream_tx.batch_end(batch);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.stream_tx.try_batch_begin().is_none());

        // receipts release the pool
        fx.device.msg.release_held_txrs();
        tokio::time::timeout(Duration::from_secs(1), fx.engine.begin())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_frame_reports_drp() {
        let mut fx = fixture().await;

        let frame = CanFrame::new(0x77, &[5]).unwrap();
        let track = fx.stream_tx.claim_track(1, &frame, 42).unwrap();
        fx.device.msg.drop_tracks.lock().unwrap().push(track);

        let mut batch = fx.stream_tx.batch_begin().await;
        assert!(fx.stream_tx.batch_add(&mut batch, &frame, track));
        fx.stream_tx.batch_end(batch);

        match next_event(&mut fx.events).await {
            StreamEvent::Echo { item: RingItem::TxEcho(echo), .. } => {
                assert!(echo.dropped);
                assert_eq!(echo.track_id, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_rx_frames_are_timestamped_and_forwarded() {
        let mut fx = fixture().await;

        let mut buf = Vec::new();
        codec::put_can_rx(&mut buf, fx.device.order, 0x456, 2, 0, 1000, &[0xaa, 0xbb]);
        codec::put_can_rx(
            &mut buf,
            fx.device.order,
            0x1234_5678 & crate::can::EFF_MASK,
            1,
            wire::CAN_FLAG_EXT,
            2000,
            &[0xcc],
        );
        fx.device.msg.inject(buf);

        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Rx(frame)) => {
                assert_eq!(frame.id(), 0x456);
                assert_eq!(frame.data(), &[0xaa, 0xbb]);
                assert_eq!(frame.timestamp_us(), Some(1000));
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Rx(frame)) => {
                assert!(frame.is_extended());
                assert_eq!(frame.timestamp_us(), Some(2000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_drives_the_bus_state_machine() {
        let mut fx = fixture().await;

        let status = CanStatusMsg {
            flags: 0,
            bus_status: wire::CAN_STATUS_ERROR_WARNING,
            timestamp_us: 500,
            rx_lost: 0,
            tx_dropped: 0,
            rx_errors: 97,
            tx_errors: 0,
            rx_fifo_size: 0,
            tx_fifo_size: 0,
        };
        let mut buf = Vec::new();
        codec::put_can_status(&mut buf, fx.device.order, &status);
        fx.device.msg.inject(buf);

        match next_event(&mut fx.events).await {
            StreamEvent::BusState(BusState::ErrorWarning) => {}
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Status(record)) => {
                assert_eq!(record.bus_state, BusState::ErrorWarning);
                assert_eq!(record.rx_errors, 97);
            }
            other => panic!("unexpected {other:?}"),
        }
        // the state change also synthesizes an error frame
        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Error(record)) => {
                assert_eq!(record.bus_state, BusState::ErrorWarning);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn txr_desync_forces_bus_off() {
        let mut fx = fixture().await;

        let status = CanStatusMsg {
            flags: wire::CAN_STATUS_FLAG_TXR_DESYNC,
            bus_status: wire::CAN_STATUS_ERROR_ACTIVE,
            timestamp_us: 100,
            rx_lost: 0,
            tx_dropped: 0,
            rx_errors: 0,
            tx_errors: 0,
            rx_fifo_size: 0,
            tx_fifo_size: 0,
        };
        let mut buf = Vec::new();
        codec::put_can_status(&mut buf, fx.device.order, &status);
        fx.device.msg.inject(buf);

        match next_event(&mut fx.events).await {
            StreamEvent::BusState(BusState::BusOff) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_errors_become_error_frames() {
        let mut fx = fixture().await;

        let mut buf = Vec::new();
        codec::put_can_error(
            &mut buf,
            fx.device.order,
            wire::CAN_ERROR_STUFF,
            wire::CAN_ERROR_FLAG_RXTX_TX,
            300,
        );
        // NONE errors are filtered out
        codec::put_can_error(&mut buf, fx.device.order, wire::CAN_ERROR_NONE, 0, 400);
        codec::put_can_error(&mut buf, fx.device.order, wire::CAN_ERROR_CRC, 0, 500);
        fx.device.msg.inject(buf);

        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Error(record)) => {
                assert_eq!(record.kind, ProtocolErrorKind::Stuff);
                assert!(record.tx);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Error(record)) => {
                assert_eq!(record.kind, ProtocolErrorKind::Crc);
                assert!(!record.tx);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_buffer_is_discarded_and_stream_continues() {
        let mut fx = fixture().await;

        // valid TXR-sized header with a misaligned length
        fx.device.msg.inject(vec![wire::MSG_CAN_RX, 13, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        // stream is still alive and parses the next buffer
        let mut buf = Vec::new();
        codec::put_can_rx(&mut buf, fx.device.order, 0x99, 0, 0, 50, &[]);
        fx.device.msg.inject(buf);

        match next_event(&mut fx.events).await {
            StreamEvent::Item(RingItem::Rx(frame)) => assert_eq!(frame.id(), 0x99),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unplug_surfaces_detached() {
        let mut fx = fixture().await;
        fx.device.unplug();

        match next_event(&mut fx.events).await {
            StreamEvent::Detached => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tx_tail_is_appended_on_packet_multiples() {
        let fx = fixture().await;

        // four 16-byte messages land exactly on the 64-byte packet size,
        // below the 512-byte message buffer, so the zero tail goes out too
        let mut batch = fx.stream_tx.batch_begin().await;
        for i in 0..4u32 {
            let frame = CanFrame::new(0x300 + i, &[0, 1, 2, 3]).unwrap();
            let track = fx.stream_tx.claim_track(0, &frame, i).unwrap();
            assert!(fx.stream_tx.batch_add(&mut batch, &frame, track));
        }
        assert_eq!(batch.reservation.buffer.len(), 64);
        fx.stream_tx.batch_end(batch);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let written = fx.device.msg.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), 68);
        assert_eq!(&written[0][64..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn batch_overflow_is_reported() {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();

        // a deeper TX fifo than the loopback advertises, to fill a buffer
        let mut descriptor = probed.descriptor.clone();
        descriptor.tx_fifo_size = 16;
        let engine = Arc::new(TxEngine::new(16, descriptor.msg_buffer_size as usize));
        let (event_tx, _events) = mpsc::channel(16);
        let stream_tx = StreamTx::new(
            probed.msg_pipe.clone(),
            &descriptor,
            probed.order,
            engine,
            event_tx,
        );

        // 76-byte FD messages: six fit under 512 with tail headroom, the
        // seventh does not
        let mut batch = stream_tx.batch_begin().await;
        let frame = CanFrame::new_fd(0x111, &[0u8; 64], false, true, false).unwrap();
        let mut added = 0;
        loop {
            let track = stream_tx.claim_track(0, &frame, added).unwrap();
            if !stream_tx.batch_add(&mut batch, &frame, track) {
                stream_tx.unclaim_track(track);
                break;
            }
            added += 1;
        }
        assert_eq!(added, 6);
        stream_tx.batch_abort(batch);
    }
}
