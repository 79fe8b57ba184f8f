//! Pre-allocated transfer bookkeeping for the message pipe.
//!
//! TX transfers draw from a fixed pool of buffers. A buffer is handed out
//! for encoding, submitted, and only returns to the free stack once both of
//! its completion conditions have fired: the bulk-out completion
//! (`tx_back`) and the device's transmit receipts for every frame the
//! buffer carried (`pending_txr` drained). This keeps a track id from being
//! reused while its receipt is still in flight.
//!
//! Track ids, their owner entries, and the echo records live behind the
//! same mutex as the slot stack; every critical section is a few loads and
//! stores.

use std::sync::Mutex;

use log::debug;
use tokio::sync::Notify;

use crate::ClientId;

/// Upper bounds on pre-allocated transfers per direction.
pub const MAX_RX_URBS: usize = 128;
pub const MAX_TX_URBS: usize = 128;

/// Size of the track-id owner/echo tables. Track ids are a u8 on the wire.
pub const TRACK_TABLE_SIZE: usize = 256;

/// What is needed to synthesize a TX echo when the receipt arrives.
#[derive(Clone, Debug, PartialEq)]
pub struct EchoRecord {
    pub can_id: u32,
    pub dlc: u8,
    pub flags: u8,
    pub data: Vec<u8>,
    /// The submitting client's own id for this frame.
    pub client_track_id: u32,
}

#[derive(Default)]
struct TxSlot {
    buffer: Option<Vec<u8>>,
    in_flight: bool,
    tx_back: bool,
    pending_txr: Vec<u8>,
}

struct TxEngineState {
    slots: Vec<TxSlot>,
    free_slots: Vec<u8>,
    free_tracks: Vec<u8>,
    owner: Vec<Option<ClientId>>,
    echo: Vec<Option<EchoRecord>>,
    track_slot: Vec<Option<u8>>,
}

/// A TX buffer checked out for encoding.
pub struct TxReservation {
    pub slot: u8,
    pub buffer: Vec<u8>,
}

/// Result of matching a transmit receipt against the in-flight state.
pub struct TxrRelease {
    pub client: Option<ClientId>,
    pub echo: Option<EchoRecord>,
}

pub struct TxEngine {
    inner: Mutex<TxEngineState>,
    available: Notify,
    slot_count: usize,
}

impl TxEngine {
    pub fn new(tx_urb_count: usize, msg_buffer_size: usize) -> Self {
        let tx_urb_count = tx_urb_count.min(MAX_TX_URBS).max(1);
        let slots = (0..tx_urb_count)
            .map(|_| TxSlot {
                buffer: Some(Vec::with_capacity(msg_buffer_size)),
                ..TxSlot::default()
            })
            .collect();
        // LIFO stacks: the most recently released index is reused first
        let free_slots: Vec<u8> = (0..tx_urb_count as u8).collect();
        let free_tracks: Vec<u8> = (0..tx_urb_count as u8).collect();

        Self {
            inner: Mutex::new(TxEngineState {
                slots,
                free_slots,
                free_tracks,
                owner: vec![None; TRACK_TABLE_SIZE],
                echo: vec![None; TRACK_TABLE_SIZE],
                track_slot: vec![None; TRACK_TABLE_SIZE],
            }),
            available: Notify::new(),
            slot_count: tx_urb_count,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Take a free TX buffer, if any.
    pub fn try_begin(&self) -> Option<TxReservation> {
        let mut state = self.inner.lock().unwrap();
        let slot = state.free_slots.pop()?;
        let mut buffer = state.slots[slot as usize].buffer.take().expect("slot buffer");
        buffer.clear();
        Some(TxReservation { slot, buffer })
    }

    /// Wait until a TX buffer is free.
    pub async fn begin(&self) -> TxReservation {
        loop {
            let notified = self.available.notified();
            if let Some(reservation) = self.try_begin() {
                return reservation;
            }
            notified.await;
        }
    }

    /// Return an unused reservation.
    pub fn abort(&self, reservation: TxReservation) {
        let mut state = self.inner.lock().unwrap();
        state.slots[reservation.slot as usize].buffer = Some(reservation.buffer);
        self.push_free_slot(&mut state, reservation.slot);
    }

    /// Claim a track id for a client's frame, recording the echo data
    /// needed when its receipt arrives.
    pub fn try_claim_track(&self, client: ClientId, echo: EchoRecord) -> Option<u8> {
        let mut state = self.inner.lock().unwrap();
        let track = state.free_tracks.pop()?;
        state.owner[track as usize] = Some(client);
        state.echo[track as usize] = Some(echo);
        Some(track)
    }

    /// Hand back a track id that was claimed but never submitted.
    pub fn unclaim_track(&self, track: u8) {
        let mut state = self.inner.lock().unwrap();
        state.owner[track as usize] = None;
        state.echo[track as usize] = None;
        self.push_free_track(&mut state, track);
    }

    /// True if a track id could be claimed right now. Only meaningful to
    /// the single claiming worker; concurrent releases only add ids.
    pub fn has_free_track(&self) -> bool {
        !self.inner.lock().unwrap().free_tracks.is_empty()
    }

    /// Wait for a slot or track release since the last check.
    pub async fn available_notified(&self) {
        self.available.notified().await;
    }

    /// Mark a reservation as submitted with the track ids it carries.
    pub fn mark_submitted(&self, slot: u8, tracks: &[u8]) {
        let mut state = self.inner.lock().unwrap();
        let entry = &mut state.slots[slot as usize];
        entry.in_flight = true;
        entry.tx_back = false;
        entry.pending_txr = tracks.to_vec();
        for &track in tracks {
            state.track_slot[track as usize] = Some(slot);
        }
    }

    /// The bulk-out completion fired for this slot.
    pub fn complete_tx(&self, slot: u8, buffer: Vec<u8>) {
        let mut state = self.inner.lock().unwrap();
        let release = {
            let entry = &mut state.slots[slot as usize];
            entry.buffer = Some(buffer);
            entry.tx_back = true;
            if entry.pending_txr.is_empty() {
                entry.in_flight = false;
                true
            } else {
                false
            }
        };
        if release {
            self.push_free_slot(&mut state, slot);
        }
    }

    /// The submission failed outright: no receipts will ever arrive for
    /// the frames in this buffer, so free everything it referenced.
    pub fn fail_submitted(&self, slot: u8, buffer: Vec<u8>) {
        let mut state = self.inner.lock().unwrap();
        let pending = std::mem::take(&mut state.slots[slot as usize].pending_txr);
        for track in pending {
            state.owner[track as usize] = None;
            state.echo[track as usize] = None;
            state.track_slot[track as usize] = None;
            self.push_free_track(&mut state, track);
        }
        {
            let entry = &mut state.slots[slot as usize];
            entry.buffer = Some(buffer);
            entry.in_flight = false;
            entry.tx_back = false;
        }
        self.push_free_slot(&mut state, slot);
    }

    /// Match a transmit receipt: drains the slot's pending entry, frees the
    /// track id, and reports the owning client plus the stored echo data.
    ///
    /// Unknown track ids yield `None` (stale receipt after a disconnect).
    pub fn complete_txr(&self, track: u8) -> Option<TxrRelease> {
        let mut state = self.inner.lock().unwrap();

        let slot = state.track_slot[track as usize].take();
        let client = state.owner[track as usize].take();
        let echo = state.echo[track as usize].take();

        let slot = match slot {
            Some(slot) => slot,
            None => {
                debug!("txr for unmapped track id {track}");
                return None;
            }
        };

        self.push_free_track(&mut state, track);

        let release = {
            let entry = &mut state.slots[slot as usize];
            entry.pending_txr.retain(|&t| t != track);
            if entry.tx_back && entry.pending_txr.is_empty() {
                entry.in_flight = false;
                entry.tx_back = false;
                true
            } else {
                false
            }
        };
        if release {
            self.push_free_slot(&mut state, slot);
        }

        Some(TxrRelease { client, echo })
    }

    /// Strand-clearing for a departing client: disown its in-flight track
    /// ids so late receipts are dropped, and free ids that will never see
    /// a receipt because their buffer already completed.
    pub fn release_client(&self, client: ClientId) {
        let mut state = self.inner.lock().unwrap();
        for track in 0..TRACK_TABLE_SIZE {
            if state.owner[track] == Some(client) {
                state.owner[track] = None;
                state.echo[track] = None;
            }
        }
    }

    /// Reset to the freshly-opened state. Outstanding transfers must have
    /// been cancelled by the caller.
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock().unwrap();
        for slot in state.slots.iter_mut() {
            slot.in_flight = false;
            slot.tx_back = false;
            slot.pending_txr.clear();
            if slot.buffer.is_none() {
                slot.buffer = Some(Vec::new());
            }
        }
        state.free_slots = (0..self.slot_count as u8).collect();
        state.free_tracks = (0..self.slot_count as u8).collect();
        state.owner.iter_mut().for_each(|o| *o = None);
        state.echo.iter_mut().for_each(|e| *e = None);
        state.track_slot.iter_mut().for_each(|t| *t = None);
        self.available.notify_one();
    }

    fn push_free_slot(&self, state: &mut TxEngineState, slot: u8) {
        let was_empty = state.free_slots.is_empty();
        state.free_slots.push(slot);
        if was_empty {
            self.available.notify_one();
        }
    }

    fn push_free_track(&self, state: &mut TxEngineState, track: u8) {
        let was_empty = state.free_tracks.is_empty();
        state.free_tracks.push(track);
        if was_empty {
            self.available.notify_one();
        }
    }

    /// Every track id is either free or mapped to an in-flight buffer,
    /// exactly once.
    #[cfg(test)]
    pub fn track_invariant_holds(&self) -> bool {
        let state = self.inner.lock().unwrap();
        let mut seen = vec![0u32; self.slot_count];
        for &track in &state.free_tracks {
            seen[track as usize] += 1;
        }
        for slot in &state.slots {
            for &track in &slot.pending_txr {
                seen[track as usize] += 1;
            }
        }
        // ids claimed but not yet submitted sit in the owner table only
        for track in 0..self.slot_count {
            if state.owner[track].is_some() && state.track_slot[track].is_none() {
                seen[track] += 1;
            }
        }
        seen.iter().all(|&count| count == 1)
    }

    #[cfg(test)]
    pub fn free_slot_count(&self) -> usize {
        self.inner.lock().unwrap().free_slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(track: u32) -> EchoRecord {
        EchoRecord {
            can_id: 0x100,
            dlc: 0,
            flags: 0,
            data: Vec::new(),
            client_track_id: track,
        }
    }

    #[test]
    fn slot_released_only_after_both_completions() {
        let engine = TxEngine::new(2, 64);

        let reservation = engine.try_begin().unwrap();
        let track = engine.try_claim_track(0, echo(7)).unwrap();
        let slot = reservation.slot;
        engine.mark_submitted(slot, &[track]);

        // bulk-out completion alone keeps the slot in flight
        engine.complete_tx(slot, reservation.buffer);
        assert_eq!(engine.free_slot_count(), 1);

        // the receipt releases it
        let release = engine.complete_txr(track).unwrap();
        assert_eq!(release.client, Some(0));
        assert_eq!(release.echo.unwrap().client_track_id, 7);
        assert_eq!(engine.free_slot_count(), 2);
        assert!(engine.track_invariant_holds());
    }

    #[test]
    fn txr_before_tx_completion_also_works() {
        let engine = TxEngine::new(2, 64);

        let reservation = engine.try_begin().unwrap();
        let track = engine.try_claim_track(1, echo(1)).unwrap();
        let slot = reservation.slot;
        engine.mark_submitted(slot, &[track]);

        engine.complete_txr(track).unwrap();
        assert_eq!(engine.free_slot_count(), 1);

        engine.complete_tx(slot, reservation.buffer);
        assert_eq!(engine.free_slot_count(), 2);
        assert!(engine.track_invariant_holds());
    }

    #[test]
    fn track_ids_are_conserved_across_interleavings() {
        let engine = TxEngine::new(4, 64);

        for round in 0..50 {
            let r1 = engine.try_begin().unwrap();
            let t1 = engine.try_claim_track(0, echo(round)).unwrap();
            let s1 = r1.slot;
            engine.mark_submitted(s1, &[t1]);

            let r2 = engine.try_begin().unwrap();
            let t2 = engine.try_claim_track(1, echo(round)).unwrap();
            let s2 = r2.slot;
            engine.mark_submitted(s2, &[t2]);

            assert!(engine.track_invariant_holds());

            // vary the completion order per round
            if round % 2 == 0 {
                engine.complete_tx(s1, r1.buffer);
                engine.complete_txr(t2).unwrap();
                engine.complete_txr(t1).unwrap();
                engine.complete_tx(s2, r2.buffer);
            } else {
                engine.complete_txr(t1).unwrap();
                engine.complete_tx(s2, r2.buffer);
                engine.complete_tx(s1, r1.buffer);
                engine.complete_txr(t2).unwrap();
            }

            assert!(engine.track_invariant_holds());
            assert_eq!(engine.free_slot_count(), 4);
        }
    }

    #[test]
    fn batched_buffer_waits_for_every_receipt() {
        let engine = TxEngine::new(2, 256);

        let reservation = engine.try_begin().unwrap();
        let t1 = engine.try_claim_track(0, echo(1)).unwrap();
        let t2 = engine.try_claim_track(0, echo(2)).unwrap();
        let slot = reservation.slot;
        engine.mark_submitted(slot, &[t1, t2]);
        engine.complete_tx(slot, reservation.buffer);

        engine.complete_txr(t1).unwrap();
        assert_eq!(engine.free_slot_count(), 1);
        engine.complete_txr(t2).unwrap();
        assert_eq!(engine.free_slot_count(), 2);
        assert!(engine.track_invariant_holds());
    }

    #[test]
    fn failed_submission_frees_everything() {
        let engine = TxEngine::new(1, 64);

        let reservation = engine.try_begin().unwrap();
        let track = engine.try_claim_track(3, echo(9)).unwrap();
        let slot = reservation.slot;
        engine.mark_submitted(slot, &[track]);

        engine.fail_submitted(slot, reservation.buffer);
        assert_eq!(engine.free_slot_count(), 1);
        assert!(engine.track_invariant_holds());

        // a stale receipt for the failed frame is ignored
        assert!(engine.complete_txr(track).is_none());
        assert!(engine.track_invariant_holds());
    }

    #[test]
    fn stale_txr_after_release_is_ignored() {
        let engine = TxEngine::new(1, 64);
        assert!(engine.complete_txr(0).is_none());
    }

    #[test]
    fn departing_client_is_disowned() {
        let engine = TxEngine::new(2, 64);

        let reservation = engine.try_begin().unwrap();
        let track = engine.try_claim_track(5, echo(1)).unwrap();
        let slot = reservation.slot;
        engine.mark_submitted(slot, &[track]);
        engine.complete_tx(slot, reservation.buffer);

        engine.release_client(5);

        // the receipt still releases the slot, but no client is reported
        let release = engine.complete_txr(track).unwrap();
        assert!(release.client.is_none());
        assert!(release.echo.is_none());
        assert_eq!(engine.free_slot_count(), 2);
    }

    #[tokio::test]
    async fn begin_wakes_when_a_slot_frees_up() {
        let engine = std::sync::Arc::new(TxEngine::new(1, 64));
        let reservation = engine.try_begin().unwrap();
        assert!(engine.try_begin().is_none());

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.begin().await.slot })
        };
        tokio::task::yield_now().await;

        let slot = reservation.slot;
        engine.mark_submitted(slot, &[]);
        engine.complete_tx(slot, reservation.buffer);

        assert_eq!(waiter.await.unwrap(), slot);
    }
}
