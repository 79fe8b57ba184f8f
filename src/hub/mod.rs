//! Shared-access multiplexer: one physical channel, up to [`MAX_CLIENTS`]
//! concurrent clients, in this process or any other.
//!
//! Every client gets a pair of SPSC rings in named shared-memory mappings
//! (RX fan-out, TX submission) plus named data-ready/data-consumed events,
//! all keyed by the hub's session id under one session directory. Two
//! workers own all cross-client state: the RX worker fans inbound traffic
//! out to every live ring and routes receipts to their owners; the TX
//! worker round-robins the client TX rings into batched bulk transfers.
//! Client arrival and departure are propagated to both workers as
//! notifications and confirmed through an acknowledge barrier before the
//! rings are handed over or torn down.
//!
//! Out-of-process clients attach through the control socket served by
//! [`server`]; in-process clients take the same path minus the socket.

pub mod client;
pub(crate) mod event;
pub(crate) mod proto;
pub mod ring;
pub mod server;
pub(crate) mod shm;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use uuid::Uuid;

use crate::bittiming::BitTiming;
use crate::channel::{ChannelController, ChannelState, CtrlRequest, TxGate};
use crate::device::stream::{StreamEvent, StreamRx, StreamTx};
use crate::device::urb::TxEngine;
use crate::device::{DeviceDescriptor, UsbCanDevice};
use crate::error::{Error, Result};
use crate::hub::event::{EventListener, EventSignal};
use crate::hub::ring::{
    HeaderHandle, LostKind, RingConsumer, RingItem, RingProducer, TxEchoRecord,
    RING_FLAG_BUS_ON, RING_FLAG_GONE,
};
use crate::ClientId;

pub use client::{ClientHandle, OpenParams};

/// Client slots per channel.
pub const MAX_CLIENTS: usize = 8;

/// When a client sees its own transmitted frames.
///
/// `Receipt` stamps the echo with the device timestamp from the transmit
/// receipt; `Submit` enqueues it at submission time with host wall-clock
/// time, kept for compatibility with consumers of the older behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EchoMode {
    Off,
    Submit,
    #[default]
    Receipt,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub echo_mode: EchoMode,
    /// Elements per ring; must be a power of two.
    pub ring_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            echo_mode: EchoMode::default(),
            ring_capacity: 128,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubOptions {
    /// Depth of the stream-event queue between the USB side and the
    /// fan-out worker.
    pub event_queue: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self { event_queue: 256 }
    }
}

/// All names a session derives from its id: the session directory, the
/// per-client ring files and event endpoints, and the control socket.
pub(crate) struct SessionPaths {
    // names the Windows pipe endpoints; the unix paths carry it in `dir`
    #[cfg_attr(unix, allow(dead_code))]
    session: String,
    dir: PathBuf,
}

impl SessionPaths {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            dir: std::env::temp_dir().join(format!("ucan-{session}")),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ring(&self, id: ClientId, side: &str) -> PathBuf {
        self.dir.join(format!("c{id}-{side}.ring"))
    }

    /// Named event endpoint: a socket in the session directory on unix, a
    /// named pipe on Windows.
    pub fn event(&self, id: ClientId, name: &str) -> String {
        #[cfg(unix)]
        {
            self.dir
                .join(format!("c{id}-{name}.evt"))
                .to_string_lossy()
                .into_owned()
        }
        #[cfg(windows)]
        {
            format!(r"\\.\pipe\ucan-{}-c{id}-{name}", self.session)
        }
    }

    /// Control-plane endpoint for out-of-process clients.
    pub fn control(&self) -> String {
        #[cfg(unix)]
        {
            self.dir.join("ctl.sock").to_string_lossy().into_owned()
        }
        #[cfg(windows)]
        {
            format!(r"\\.\pipe\ucan-{}-ctl", self.session)
        }
    }
}

/// Session ids of hubs currently serving on this host.
pub fn discover_sessions() -> Vec<String> {
    let mut sessions = Vec::new();
    if let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(session) = name.strip_prefix("ucan-") {
                    if entry.path().is_dir() {
                        sessions.push(session.to_string());
                    }
                }
            }
        }
    }
    sessions
}

/// Control-plane messages for the RX fan-out worker.
pub(crate) enum RxNotification {
    Add {
        id: ClientId,
        producer: RingProducer,
        ready: EventSignal,
        echo_mode: EchoMode,
        tx_header: HeaderHandle,
        /// Reserved data-consumed endpoint; the fan-out never waits for
        /// space, so this is held only to keep the name alive.
        done: EventListener,
    },
    Remove {
        id: ClientId,
        /// Whether the remover is waiting on the acknowledge barrier.
        ack: bool,
    },
    BusFlag(bool),
    Reconnected,
    Shutdown,
}

/// Control-plane messages for the TX arbitration worker.
pub(crate) enum TxNotification {
    Add {
        id: ClientId,
        consumer: RingConsumer,
        echo_mode: EchoMode,
        /// Signaled after this client's ring has been drained.
        done: EventSignal,
        /// The client pings this after queueing work.
        ready: EventListener,
    },
    Remove {
        id: ClientId,
        ack: bool,
    },
    Shutdown,
}

pub(crate) struct HubShared {
    pub(crate) session: Uuid,
    pub(crate) paths: SessionPaths,
    pub(crate) descriptor: DeviceDescriptor,
    pub(crate) ctrl: mpsc::Sender<CtrlRequest>,
    rx_notif: mpsc::Sender<RxNotification>,
    tx_notif: mpsc::Sender<TxNotification>,
    ack: Arc<Semaphore>,
    slots: Mutex<[bool; MAX_CLIENTS]>,
    shutdown: watch::Sender<bool>,
    engine: Arc<TxEngine>,
    events: mpsc::Sender<StreamEvent>,
}

impl HubShared {
    pub(crate) async fn acquire_access(&self, client: ClientId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.ctrl
            .send(CtrlRequest::AcquireConfigAccess { client, reply })
            .await
            .map_err(|_| Error::Aborted)?;
        rx.await.map_err(|_| Error::Aborted)
    }

    pub(crate) async fn release_access(&self, client: ClientId) -> Result<()> {
        self.ctrl
            .send(CtrlRequest::ReleaseConfigAccess { client })
            .await
            .map_err(|_| Error::Aborted)
    }

    async fn unit_request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> CtrlRequest,
    {
        let (reply, rx) = oneshot::channel();
        self.ctrl
            .send(build(reply))
            .await
            .map_err(|_| Error::Aborted)?;
        rx.await.map_err(|_| Error::Aborted)?
    }

    pub(crate) async fn set_features(&self, client: ClientId, flags: u16) -> Result<()> {
        self.unit_request(|reply| CtrlRequest::SetFeatures { client, flags, reply })
            .await
    }

    pub(crate) async fn set_nominal(&self, client: ClientId, timing: BitTiming) -> Result<()> {
        self.unit_request(|reply| CtrlRequest::SetNominalBitTiming { client, timing, reply })
            .await
    }

    pub(crate) async fn set_data(&self, client: ClientId, timing: BitTiming) -> Result<()> {
        self.unit_request(|reply| CtrlRequest::SetDataBitTiming { client, timing, reply })
            .await
    }

    pub(crate) async fn set_bus(&self, client: ClientId, on: bool) -> Result<()> {
        self.unit_request(|reply| CtrlRequest::SetBus { client, on, reply })
            .await
    }

    pub(crate) async fn client_gone(&self, client: ClientId) {
        let _ = self.ctrl.send(CtrlRequest::ClientGone { client }).await;
    }

    pub(crate) fn free_slot(&self, id: ClientId) {
        self.slots.lock().unwrap()[id as usize] = false;
    }

    pub(crate) fn rx_notif(&self) -> &mpsc::Sender<RxNotification> {
        &self.rx_notif
    }

    pub(crate) fn tx_notif(&self) -> &mpsc::Sender<TxNotification> {
        &self.tx_notif
    }
}

impl Drop for HubShared {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.paths.dir());
    }
}

/// One opened channel, shared by up to [`MAX_CLIENTS`] clients.
#[derive(Clone)]
pub struct Hub {
    pub(crate) shared: Arc<HubShared>,
}

impl Hub {
    /// Take ownership of a probed device, create the session directory,
    /// and start the channel workers.
    pub fn open(device: UsbCanDevice, options: HubOptions) -> Result<Hub> {
        let UsbCanDevice {
            cmd,
            msg_pipe,
            descriptor,
            order,
        } = device;

        let session = Uuid::new_v4();
        let paths = SessionPaths::new(&session.to_string());
        std::fs::create_dir_all(paths.dir())?;

        let engine = Arc::new(TxEngine::new(
            descriptor.tx_fifo_size as usize,
            descriptor.msg_buffer_size as usize,
        ));

        let (event_tx, event_rx) = mpsc::channel(options.event_queue);
        let (rx_notif_tx, rx_notif_rx) = mpsc::channel(16);
        let (tx_notif_tx, tx_notif_rx) = mpsc::channel(16);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (gate_tx, gate_rx) = watch::channel(TxGate::default());
        let ack = Arc::new(Semaphore::new(0));
        let tx_work = Arc::new(Notify::new());

        let stream_rx = StreamRx::new(
            msg_pipe.clone(),
            &descriptor,
            order,
            engine.clone(),
            event_tx.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(stream_rx.run());

        let stream_tx = StreamTx::new(msg_pipe, &descriptor, order, engine.clone(), event_tx.clone());

        let controller = ChannelController::new(
            cmd,
            descriptor.clone(),
            ctrl_rx,
            gate_tx,
            rx_notif_tx.clone(),
        );
        tokio::spawn(controller.run());

        tokio::spawn(rx_worker(event_rx, rx_notif_rx, ack.clone(), ctrl_tx.clone()));
        tokio::spawn(tx_worker(
            stream_tx,
            tx_notif_rx,
            ack.clone(),
            tx_work,
            gate_rx,
            event_tx.clone(),
            shutdown_rx,
        ));

        debug!("hub session {session} opened for {}", descriptor.name);

        Ok(Hub {
            shared: Arc::new(HubShared {
                session,
                paths,
                descriptor,
                ctrl: ctrl_tx,
                rx_notif: rx_notif_tx,
                tx_notif: tx_notif_tx,
                ack,
                slots: Mutex::new([false; MAX_CLIENTS]),
                shutdown: shutdown_tx,
                engine,
                events: event_tx,
            }),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub fn session(&self) -> Uuid {
        self.shared.session
    }

    /// Endpoint the control-plane server listens on.
    pub fn control_path(&self) -> String {
        self.shared.paths.control()
    }

    pub async fn state(&self) -> Result<ChannelState> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .ctrl
            .send(CtrlRequest::State { reply })
            .await
            .map_err(|_| Error::Aborted)?;
        rx.await.map_err(|_| Error::Aborted)
    }

    /// Create the rings and events for a new client and make it live on
    /// both workers. Returns once the acknowledge barrier has passed.
    async fn attach_internal(&self, options: &ClientOptions) -> Result<ClientId> {
        let id = {
            let mut slots = self.shared.slots.lock().unwrap();
            match slots.iter().position(|used| !used) {
                Some(index) => {
                    slots[index] = true;
                    index as ClientId
                }
                None => return Err(Error::DeviceBusy),
            }
        };

        let result = self.create_client_ports(id, options).await;
        if result.is_err() {
            self.shared.free_slot(id);
        }
        result.map(|_| id)
    }

    async fn create_client_ports(&self, id: ClientId, options: &ClientOptions) -> Result<()> {
        let paths = &self.shared.paths;

        let rx_producer = ring::create(&paths.ring(id, "rx"), options.ring_capacity)?.into_producer();
        let tx_consumer = ring::create(&paths.ring(id, "tx"), options.ring_capacity)?.into_consumer();

        // hub-side halves of the four named events
        let tx_ready = EventListener::bind(&paths.event(id, "tx-ready"))?;
        let rx_done = EventListener::bind(&paths.event(id, "rx-done"))?;
        let rx_ready = EventSignal::new(&paths.event(id, "rx-ready"))?;
        let tx_done = EventSignal::new(&paths.event(id, "tx-done"))?;

        let tx_header = tx_consumer.header_handle();

        self.shared
            .rx_notif
            .send(RxNotification::Add {
                id,
                producer: rx_producer,
                ready: rx_ready,
                echo_mode: options.echo_mode,
                tx_header,
                done: rx_done,
            })
            .await
            .map_err(|_| Error::Aborted)?;

        self.shared
            .tx_notif
            .send(TxNotification::Add {
                id,
                consumer: tx_consumer,
                echo_mode: options.echo_mode,
                done: tx_done,
                ready: tx_ready,
            })
            .await
            .map_err(|_| Error::Aborted)?;

        // acknowledge barrier: both workers have applied the addition
        Self::barrier_of(&self.shared).await
    }

    /// Attach a client living in this process.
    pub async fn attach_client(&self, options: ClientOptions) -> Result<ClientHandle> {
        let id = self.attach_internal(&options).await?;

        match ClientHandle::open_local(self.shared.clone(), id) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = Self::detach_client_of(&self.shared, id).await;
                Err(e)
            }
        }
    }

    /// Attach a client from another process; it opens its own ring and
    /// event views by name.
    pub(crate) async fn attach_remote(&self, options: ClientOptions) -> Result<ClientId> {
        self.attach_internal(&options).await
    }

    pub(crate) async fn barrier_of(shared: &HubShared) -> Result<()> {
        shared
            .ack
            .acquire_many(2)
            .await
            .map_err(|_| Error::Aborted)?
            .forget();
        Ok(())
    }

    pub(crate) async fn detach_client_of(shared: &Arc<HubShared>, id: ClientId) -> Result<()> {
        shared
            .rx_notif
            .send(RxNotification::Remove { id, ack: true })
            .await
            .map_err(|_| Error::Aborted)?;
        shared
            .tx_notif
            .send(TxNotification::Remove { id, ack: true })
            .await
            .map_err(|_| Error::Aborted)?;

        // wait until both workers have quiesced the client's state
        Self::barrier_of(shared).await?;

        shared.client_gone(id).await;
        shared.free_slot(id);
        Ok(())
    }

    /// Publish a textual log record into every client's RX ring.
    pub async fn publish_log(&self, level: log::Level, message: impl Into<String>) -> Result<()> {
        self.shared
            .events
            .send(StreamEvent::Item(RingItem::Log(ring::LogRecord {
                level,
                message: message.into(),
            })))
            .await
            .map_err(|_| Error::Aborted)
    }

    /// The device re-appeared after an unplug: clear the gone flags and
    /// tell clients to resynchronize by bumping the ring generation.
    pub async fn mark_reconnected(&self) -> Result<()> {
        self.shared
            .rx_notif
            .send(RxNotification::Reconnected)
            .await
            .map_err(|_| Error::Aborted)
    }

    /// Orderly shutdown: bus off, cancel outstanding transfers, stop the
    /// workers. The session directory disappears with the last reference.
    pub async fn close(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .shared
            .ctrl
            .send(CtrlRequest::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        let _ = self.shared.shutdown.send(true);
        let _ = self.shared.rx_notif.send(RxNotification::Shutdown).await;
        let _ = self.shared.tx_notif.send(TxNotification::Shutdown).await;
        self.shared.engine.cancel_all();
        Ok(())
    }
}

struct RxClientEntry {
    id: ClientId,
    producer: RingProducer,
    ready: EventSignal,
    echo_mode: EchoMode,
    tx_header: HeaderHandle,
    _done: EventListener,
}

/// Fans inbound stream events out to the live clients. Owns every RX ring
/// producer; the live list is only ever mutated here.
async fn rx_worker(
    mut events: mpsc::Receiver<StreamEvent>,
    mut notif: mpsc::Receiver<RxNotification>,
    ack: Arc<Semaphore>,
    ctrl: mpsc::Sender<CtrlRequest>,
) {
    let mut live: Vec<RxClientEntry> = Vec::new();
    let mut gone = false;
    let mut bus_on = false;

    loop {
        tokio::select! {
            notification = notif.recv() => {
                let Some(notification) = notification else { break };
                match notification {
                    RxNotification::Add { id, producer, ready, echo_mode, tx_header, done } => {
                        if gone {
                            producer.header().set_flags(RING_FLAG_GONE);
                            tx_header.set_flags(RING_FLAG_GONE);
                        }
                        if bus_on {
                            producer.header().set_flags(RING_FLAG_BUS_ON);
                            tx_header.set_flags(RING_FLAG_BUS_ON);
                        }
                        live.push(RxClientEntry {
                            id,
                            producer,
                            ready,
                            echo_mode,
                            tx_header,
                            _done: done,
                        });
                        ack.add_permits(1);
                    }
                    RxNotification::Remove { id, ack: wants_ack } => {
                        live.retain(|entry| entry.id != id);
                        if wants_ack {
                            ack.add_permits(1);
                        }
                    }
                    RxNotification::BusFlag(on) => {
                        bus_on = on;
                        for entry in &live {
                            if on {
                                entry.producer.header().set_flags(RING_FLAG_BUS_ON);
                                entry.tx_header.set_flags(RING_FLAG_BUS_ON);
                            } else {
                                entry.producer.header().clear_flags(RING_FLAG_BUS_ON);
                                entry.tx_header.clear_flags(RING_FLAG_BUS_ON);
                            }
                            entry.ready.signal();
                        }
                    }
                    RxNotification::Reconnected => {
                        gone = false;
                        for entry in &live {
                            entry.producer.header().clear_flags(RING_FLAG_GONE);
                            entry.producer.header().clear_error();
                            entry.producer.header().bump_generation();
                            entry.tx_header.clear_flags(RING_FLAG_GONE);
                            entry.tx_header.bump_generation();
                            entry.ready.signal();
                        }
                    }
                    RxNotification::Shutdown => break,
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    StreamEvent::Item(item) => {
                        for entry in live.iter_mut() {
                            entry.producer.push_or_count_lost(item.clone());
                            entry.ready.signal();
                        }
                    }
                    StreamEvent::Echo { client, item } => {
                        let Some(entry) = live.iter_mut().find(|e| e.id == client) else {
                            continue;
                        };
                        if entry.echo_mode != EchoMode::Receipt {
                            continue;
                        }
                        // dropped frames are freed without delivery
                        if let RingItem::TxEcho(record) = &item {
                            if record.dropped {
                                continue;
                            }
                        }
                        entry.producer.push_or_count_lost(item);
                        entry.ready.signal();
                    }
                    StreamEvent::EchoSubmit { client, item } => {
                        if let Some(entry) = live.iter_mut().find(|e| e.id == client) {
                            entry.producer.push_or_count_lost(item);
                            entry.ready.signal();
                        }
                    }
                    StreamEvent::BusState(state) => {
                        let _ = ctrl.try_send(CtrlRequest::BusStateChanged(state));
                    }
                    StreamEvent::Detached => {
                        gone = true;
                        for entry in &live {
                            entry.producer.header().set_flags(RING_FLAG_GONE);
                            entry.producer.header().post_error(Error::Gone.code());
                            entry.tx_header.set_flags(RING_FLAG_GONE);
                            entry.ready.signal();
                        }
                        let _ = ctrl.try_send(CtrlRequest::DeviceGone);
                    }
                }
            }
        }
    }
}

struct TxClientEntry {
    id: ClientId,
    consumer: RingConsumer,
    echo_mode: EchoMode,
    done: EventSignal,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Arbitrates client TX rings into batched bulk transfers, round-robin.
async fn tx_worker(
    stream: StreamTx,
    mut notif: mpsc::Receiver<TxNotification>,
    ack: Arc<Semaphore>,
    work: Arc<Notify>,
    mut gate: watch::Receiver<TxGate>,
    events: mpsc::Sender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut live: Vec<TxClientEntry> = Vec::new();
    let mut rr = 0usize;

    loop {
        tokio::select! {
            notification = notif.recv() => {
                let Some(notification) = notification else { break };
                match notification {
                    TxNotification::Add { id, consumer, echo_mode, done, ready } => {
                        // bridge the client's named event onto the local
                        // work notify
                        let forwarder = {
                            let work = work.clone();
                            let mut ready = ready;
                            tokio::spawn(async move {
                                loop {
                                    ready.wait().await;
                                    work.notify_one();
                                }
                            })
                        };
                        live.push(TxClientEntry { id, consumer, echo_mode, done, forwarder });
                        ack.add_permits(1);
                    }
                    TxNotification::Remove { id, ack: wants_ack } => {
                        // strand-clearing: disown the client's in-flight
                        // track ids, then drop its ring
                        stream.engine().release_client(id);
                        if let Some(position) = live.iter().position(|entry| entry.id == id) {
                            let entry = live.swap_remove(position);
                            entry.forwarder.abort();
                        }
                        if wants_ack {
                            ack.add_permits(1);
                        }
                    }
                    TxNotification::Shutdown => break,
                }
            }
            _ = work.notified() => {}
            _ = stream.engine().available_notified() => {}
            changed = gate.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }

        let tx_gate = *gate.borrow();
        if !tx_gate.on_bus {
            continue;
        }

        drain_clients(&stream, &mut live, &mut rr, tx_gate.fd, &events);
    }

    for entry in &live {
        entry.forwarder.abort();
    }
}

/// One arbitration pass: visit clients fairly, batch what fits, submit,
/// and ring the data-consumed doorbell of every ring that shrank.
/// Returns without waiting; resource releases re-wake the worker.
fn drain_clients(
    stream: &StreamTx,
    live: &mut [TxClientEntry],
    rr: &mut usize,
    fd_enabled: bool,
    events: &mpsc::Sender<StreamEvent>,
) {
    let count = live.len();
    if count == 0 {
        return;
    }

    let mut batch = match stream.try_batch_begin() {
        Some(batch) => Some(batch),
        None => return,
    };

    let mut drained = [false; MAX_CLIENTS];

    'pass: loop {
        let mut did_work = false;

        for step in 0..count {
            let entry = &mut live[(*rr + step) % count];

            if entry.consumer.is_empty() {
                continue;
            }

            // sole claimant: a free track now stays free until we take it
            if !stream.engine().has_free_track() {
                break 'pass;
            }

            let Some(item) = entry.consumer.pop() else {
                continue;
            };
            drained[entry.id as usize] = true;

            let (track_id, frame) = match item {
                RingItem::Tx { track_id, frame } => (track_id, frame),
                other => {
                    warn!(
                        "client {}: unhandled TX ring entry {:?} ignored",
                        entry.id,
                        other.lost_kind()
                    );
                    continue;
                }
            };

            if frame.check_against_mode(fd_enabled).is_err() {
                warn!(
                    "client {}: frame {:#x} rejected by channel mode",
                    entry.id,
                    frame.id()
                );
                entry.consumer.header().add_lost(LostKind::Tx);
                continue;
            }

            let Some(track) = stream.claim_track(entry.id, &frame, track_id) else {
                entry.consumer.header().add_lost(LostKind::Tx);
                break 'pass;
            };

            let added = stream.batch_add(batch.as_mut().unwrap(), &frame, track);
            if !added {
                // buffer full: submit and continue in a fresh one
                stream.batch_end(batch.take().unwrap());
                match stream.try_batch_begin() {
                    Some(next) => batch = Some(next),
                    None => {
                        stream.unclaim_track(track);
                        entry.consumer.header().add_lost(LostKind::Tx);
                        break 'pass;
                    }
                }
                if !stream.batch_add(batch.as_mut().unwrap(), &frame, track) {
                    warn!("tx frame larger than the transfer buffer, dropped");
                    stream.unclaim_track(track);
                    entry.consumer.header().add_lost(LostKind::Tx);
                    continue;
                }
            }

            if entry.echo_mode == EchoMode::Submit {
                submit_echo(events, entry.id, track_id, &frame);
            }

            did_work = true;
        }

        if !did_work {
            break;
        }
        *rr = (*rr + 1) % count;
    }

    if let Some(batch) = batch {
        // a no-op for an empty batch
        stream.batch_end(batch);
    }

    for entry in live.iter() {
        if drained[entry.id as usize] {
            entry.done.signal();
        }
    }
}

/// Submit-mode echo: enqueued at submission with host wall-clock time.
fn submit_echo(
    events: &mpsc::Sender<StreamEvent>,
    client: ClientId,
    track_id: u32,
    frame: &crate::can::CanFrame,
) {
    let timestamp_us = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;

    let mut echo_frame = frame.clone();
    echo_frame.set_timestamp(Some(timestamp_us));

    let item = RingItem::TxEcho(TxEchoRecord {
        track_id,
        timestamp_us,
        dropped: false,
        frame: echo_frame,
    });

    if events
        .try_send(StreamEvent::EchoSubmit { client, item })
        .is_err()
    {
        debug!("event queue full, submit echo for client {client} dropped");
    }
}
