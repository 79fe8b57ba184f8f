//! Per-client view of a shared channel, in-process or remote.
//!
//! A handle owns the consumer side of its RX ring and the producer side of
//! its TX ring, both named shared-memory mappings, plus its halves of the
//! four named events. Receiving drains the ring and parks on the
//! data-ready event; sending enqueues a frame and rings the hub's
//! doorbell. Configuration calls are gated by the configuration-access
//! lease in the channel controller — reached over an mpsc for in-process
//! handles, or as JSON lines on the hub's control socket for handles
//! created with [`ClientHandle::connect`] from another process.

use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::bittiming::{self, BitTiming, UserConstraints, SJW_TSEG2};
use crate::can::CanFrame;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::hub::event::{EventListener, EventSignal};
use crate::hub::proto::{self, HubReply, HubRequest};
use crate::hub::ring::{
    self, LostKind, RingConsumer, RingItem, RingProducer, RING_FLAG_GONE,
};
use crate::hub::{ClientOptions, Hub, HubShared, RxNotification, SessionPaths, TxNotification};
use crate::wire;
use crate::ClientId;

/// Channel bring-up parameters, the user-facing configuration surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenParams {
    pub bitrate: u32,
    pub data_bitrate: Option<u32>,
    /// Sample point in (0, 1); defaults to the CiA recommendation.
    pub sample_point: Option<f64>,
    pub data_sample_point: Option<f64>,
    /// Explicit sjw; `None` means "as large as tseg2 allows".
    pub sjw: Option<u32>,
    pub data_sjw: Option<u32>,
    pub fd: bool,
    /// One-shot mode: disable automatic retransmission.
    pub one_shot: bool,
    /// Listen-only mode.
    pub listen_only: bool,
}

impl OpenParams {
    pub fn classic(bitrate: u32) -> Self {
        Self {
            bitrate,
            data_bitrate: None,
            sample_point: None,
            data_sample_point: None,
            sjw: None,
            data_sjw: None,
            fd: false,
            one_shot: false,
            listen_only: false,
        }
    }

    pub fn fd(bitrate: u32, data_bitrate: u32) -> Self {
        Self {
            data_bitrate: Some(data_bitrate),
            fd: true,
            ..Self::classic(bitrate)
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Request/reply half of a control-socket connection.
pub(crate) struct ControlClient {
    reader: BufReader<BoxedRead>,
    writer: BoxedWrite,
}

impl ControlClient {
    pub async fn request(&mut self, request: &HubRequest) -> Result<HubReply> {
        proto::write_message(&mut self.writer, request).await?;
        match proto::read_message(&mut self.reader).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::Aborted),
        }
    }
}

enum ControlPath {
    Local(Arc<HubShared>),
    Remote(tokio::sync::Mutex<ControlClient>),
}

/// The client's halves of the rings and events.
struct ClientPorts {
    rx: RingConsumer,
    rx_ready: EventListener,
    rx_done: EventSignal,
    tx: RingProducer,
    tx_ready: EventSignal,
    tx_done: EventListener,
}

fn open_ports(paths: &SessionPaths, id: ClientId) -> Result<ClientPorts> {
    Ok(ClientPorts {
        rx: ring::open(&paths.ring(id, "rx"))?.into_consumer(),
        rx_ready: EventListener::bind(&paths.event(id, "rx-ready"))?,
        rx_done: EventSignal::new(&paths.event(id, "rx-done"))?,
        tx: ring::open(&paths.ring(id, "tx"))?.into_producer(),
        tx_ready: EventSignal::new(&paths.event(id, "tx-ready"))?,
        tx_done: EventListener::bind(&paths.event(id, "tx-done"))?,
    })
}

#[cfg(unix)]
async fn control_connect(paths: &SessionPaths) -> Result<(BoxedRead, BoxedWrite)> {
    let stream = tokio::net::UnixStream::connect(paths.control()).await?;
    let (reader, writer) = tokio::io::split(stream);
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(windows)]
async fn control_connect(paths: &SessionPaths) -> Result<(BoxedRead, BoxedWrite)> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new().open(paths.control())?;
    let (reader, writer) = tokio::io::split(client);
    Ok((Box::new(reader), Box::new(writer)))
}

pub struct ClientHandle {
    id: ClientId,
    descriptor: DeviceDescriptor,
    control: ControlPath,
    rx: RingConsumer,
    rx_ready: EventListener,
    rx_done: EventSignal,
    tx: RingProducer,
    tx_ready: EventSignal,
    tx_done: EventListener,
    next_track: u32,
    detached: bool,
}

impl ClientHandle {
    fn assemble(
        id: ClientId,
        descriptor: DeviceDescriptor,
        control: ControlPath,
        ports: ClientPorts,
    ) -> Self {
        Self {
            id,
            descriptor,
            control,
            rx: ports.rx,
            rx_ready: ports.rx_ready,
            rx_done: ports.rx_done,
            tx: ports.tx,
            tx_ready: ports.tx_ready,
            tx_done: ports.tx_done,
            next_track: 0,
            detached: false,
        }
    }

    /// In-process attach: open the freshly created named objects by name,
    /// exactly as a remote client would.
    pub(crate) fn open_local(shared: Arc<HubShared>, id: ClientId) -> Result<Self> {
        let ports = open_ports(&shared.paths, id)?;
        let descriptor = shared.descriptor.clone();
        Ok(Self::assemble(id, descriptor, ControlPath::Local(shared), ports))
    }

    /// Attach to a hub served by another process, identified by its
    /// session id.
    pub async fn connect(session: &str, options: ClientOptions) -> Result<Self> {
        let paths = SessionPaths::new(session);

        let (reader, writer) = control_connect(&paths).await?;
        let mut control = ControlClient {
            reader: BufReader::new(reader),
            writer,
        };

        let reply = control
            .request(&HubRequest::Attach {
                echo_mode: options.echo_mode,
                ring_capacity: options.ring_capacity,
            })
            .await?;

        let (id, descriptor) = match reply {
            HubReply::Attached { id, descriptor, .. } => (id, descriptor),
            HubReply::Failed { code, .. } => return Err(Error::from_code(code)),
            _ => return Err(Error::ProtocolViolation("unexpected attach reply")),
        };

        let ports = open_ports(&paths, id)?;
        Ok(Self::assemble(
            id,
            descriptor,
            ControlPath::Remote(tokio::sync::Mutex::new(control)),
            ports,
        ))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Wait for the next inbound element.
    ///
    /// Queued elements are drained before an unplug is reported, so
    /// nothing already fanned out is lost.
    pub async fn recv(&mut self) -> Result<RingItem> {
        loop {
            if let Some(item) = self.pop_and_credit() {
                return Ok(item);
            }

            if self.rx.header().flags() & RING_FLAG_GONE != 0 {
                return Err(Error::Gone);
            }

            self.rx_ready.wait().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<RingItem> {
        self.pop_and_credit()
    }

    fn pop_and_credit(&mut self) -> Option<RingItem> {
        let was_full = self.rx.header().is_full();
        let item = self.rx.pop()?;
        if was_full {
            // tell the fan-out side the ring has room again
            self.rx_done.signal();
        }
        Some(item)
    }

    /// Queue a frame for transmission under a caller-chosen track id,
    /// which comes back in the TX echo.
    pub fn send_with_track(&mut self, frame: CanFrame, track_id: u32) -> Result<()> {
        if self.tx.header().flags() & RING_FLAG_GONE != 0 {
            return Err(Error::Gone);
        }

        self.tx
            .try_push(RingItem::Tx { track_id, frame })
            .map_err(|_| Error::DeviceBusy)?;
        self.tx_ready.signal();
        Ok(())
    }

    /// Queue a frame for transmission; returns the assigned track id.
    pub fn send(&mut self, frame: CanFrame) -> Result<u32> {
        let track_id = self.next_track;
        self.send_with_track(frame, track_id)?;
        self.next_track = self.next_track.wrapping_add(1);
        Ok(track_id)
    }

    /// Like [`send_with_track`], but waits on the data-consumed event
    /// while the TX ring is full.
    ///
    /// [`send_with_track`]: ClientHandle::send_with_track
    pub async fn send_wait(&mut self, frame: CanFrame, track_id: u32) -> Result<()> {
        loop {
            match self.send_with_track(frame.clone(), track_id) {
                Err(Error::DeviceBusy) => self.tx_done.wait().await,
                other => return other,
            }
        }
    }

    pub fn rx_flags(&self) -> u32 {
        self.rx.header().flags()
    }

    pub fn generation(&self) -> u32 {
        self.rx.header().generation()
    }

    /// Sticky asynchronous device error, if one was posted.
    pub fn ring_error(&self) -> i32 {
        self.rx.header().error()
    }

    /// Read-and-clear a loss counter of the RX ring.
    pub fn take_lost(&self, kind: LostKind) -> u32 {
        self.rx.header().take_lost(kind)
    }

    /// Frames the arbitration worker had to drop from this client's TX
    /// ring (mode violations, resource exhaustion).
    pub fn take_tx_lost(&self) -> u32 {
        self.tx.header().take_lost(LostKind::Tx)
    }

    async fn remote_unit(&self, control: &tokio::sync::Mutex<ControlClient>, request: HubRequest) -> Result<()> {
        match control.lock().await.request(&request).await? {
            HubReply::Done => Ok(()),
            HubReply::Failed { code, .. } => Err(Error::from_code(code)),
            _ => Err(Error::ProtocolViolation("unexpected control reply")),
        }
    }

    /// Claim (or extend) the configuration-access lease. `false` means
    /// another client currently holds it.
    pub async fn acquire_configuration_access(&self) -> Result<bool> {
        match &self.control {
            ControlPath::Local(shared) => shared.acquire_access(self.id).await,
            ControlPath::Remote(control) => {
                let request = HubRequest::AcquireConfigAccess { id: self.id };
                match control.lock().await.request(&request).await? {
                    HubReply::Granted { granted } => Ok(granted),
                    HubReply::Failed { code, .. } => Err(Error::from_code(code)),
                    _ => Err(Error::ProtocolViolation("unexpected control reply")),
                }
            }
        }
    }

    pub async fn release_configuration_access(&self) -> Result<()> {
        match &self.control {
            ControlPath::Local(shared) => shared.release_access(self.id).await,
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::ReleaseConfigAccess { id: self.id })
                    .await
            }
        }
    }

    pub async fn set_feature_flags(&self, flags: u16) -> Result<()> {
        match &self.control {
            ControlPath::Local(shared) => shared.set_features(self.id, flags).await,
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::SetFeatureFlags { id: self.id, flags })
                    .await
            }
        }
    }

    pub async fn set_nominal_bit_timing(&self, timing: BitTiming) -> Result<()> {
        match &self.control {
            ControlPath::Local(shared) => shared.set_nominal(self.id, timing).await,
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::SetNominalBitTiming { id: self.id, timing })
                    .await
            }
        }
    }

    pub async fn set_data_bit_timing(&self, timing: BitTiming) -> Result<()> {
        match &self.control {
            ControlPath::Local(shared) => shared.set_data(self.id, timing).await,
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::SetDataBitTiming { id: self.id, timing })
                    .await
            }
        }
    }

    pub async fn set_bus(&self, on: bool) -> Result<()> {
        match &self.control {
            ControlPath::Local(shared) => shared.set_bus(self.id, on).await,
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::SetBus { id: self.id, on })
                    .await
            }
        }
    }

    /// Scripted bring-up: claim the lease, solve the bit timing for the
    /// requested rates, program features and timing, and go on bus.
    pub async fn bring_up(&self, params: &OpenParams) -> Result<()> {
        if !self.acquire_configuration_access().await? {
            return Err(Error::AccessDenied);
        }

        let descriptor = &self.descriptor;

        let nominal_user = match params.sample_point {
            Some(sp) => UserConstraints::from_real(params.bitrate, sp, SJW_TSEG2, 0)?,
            None => bittiming::cia_classic_defaults(params.bitrate),
        };

        let mut features = 0u16;
        if params.one_shot {
            features |= wire::FEATURE_DAR;
        }
        if params.listen_only {
            features |= wire::FEATURE_MON_MODE;
        }

        let (mut nominal, data) = if params.fd {
            let data_bitrate = params.data_bitrate.ok_or(Error::InvalidParam)?;
            let data_user = match params.data_sample_point {
                Some(sp) => UserConstraints::from_real(data_bitrate, sp, SJW_TSEG2, 0)?,
                None => bittiming::cia_fd_defaults(params.bitrate, data_bitrate).1,
            };
            let (nominal, data) = bittiming::cia_fd(
                &descriptor.nominal,
                &descriptor.data,
                &nominal_user,
                &data_user,
            )?;
            features |= wire::FEATURE_FDF;
            (nominal, Some(data))
        } else {
            (
                bittiming::cia_classic(&descriptor.nominal, &nominal_user)?,
                None,
            )
        };

        if let Some(sjw) = params.sjw {
            nominal.sjw = sjw.clamp(1, descriptor.nominal.sjw_max);
        }

        debug!(
            "bring up: nominal {:?} data {:?} features {:#06x}",
            nominal, data, features
        );

        self.set_feature_flags(features).await?;
        self.set_nominal_bit_timing(nominal).await?;

        if let Some(mut data) = data {
            if let Some(sjw) = params.data_sjw {
                data.sjw = sjw.clamp(1, descriptor.data.sjw_max);
            }
            self.set_data_bit_timing(data).await?;
        }

        self.set_bus(true).await
    }

    /// Graceful departure: both hub workers quiesce this client's rings
    /// and in-flight frames before the handle is dropped.
    pub async fn detach(mut self) -> Result<()> {
        self.detached = true;
        match &self.control {
            ControlPath::Local(shared) => {
                let shared = shared.clone();
                Hub::detach_client_of(&shared, self.id).await
            }
            ControlPath::Remote(control) => {
                self.remote_unit(control, HubRequest::Detach { id: self.id })
                    .await
            }
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        match &self.control {
            ControlPath::Local(shared) => {
                // best effort without the barrier; prefer detach()
                let _ = shared.rx_notif().try_send(RxNotification::Remove {
                    id: self.id,
                    ack: false,
                });
                let _ = shared.tx_notif().try_send(TxNotification::Remove {
                    id: self.id,
                    ack: false,
                });
                let _ = shared
                    .ctrl
                    .try_send(crate::channel::CtrlRequest::ClientGone { client: self.id });
                shared.free_slot(self.id);
                debug!("client {} dropped without detach", self.id);
            }
            ControlPath::Remote(_) => {
                // the closing control connection makes the daemon detach us
            }
        }
    }
}
