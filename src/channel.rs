//! Channel controller: configuration state machine and the exclusive
//! configuration-access lease.
//!
//! All mutation of device configuration funnels through one task that owns
//! the command channel. Requests arrive over an mpsc channel from client
//! handles; the lease decides who may mutate, and the bus-on script runs
//! the strict bring-up order against the device.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::bittiming::BitTiming;
use crate::can::BusState;
use crate::device::cmd::CmdChannel;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::wire::{self, codec};
use crate::ClientId;

/// How long a configuration-access claim stays valid without a re-claim.
pub const CONFIG_ACCESS_TIMEOUT: Duration = Duration::from_secs(8);

/// Channel lifecycle. `Closed` is terminal until the device is reopened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Opened,
    Configured,
    OnBus,
    Closed,
}

/// What the TX arbitration worker needs to know about the channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxGate {
    pub on_bus: bool,
    pub fd: bool,
}

/// Requests serviced by the controller task.
pub(crate) enum CtrlRequest {
    AcquireConfigAccess {
        client: ClientId,
        reply: oneshot::Sender<bool>,
    },
    ReleaseConfigAccess {
        client: ClientId,
    },
    SetFeatures {
        client: ClientId,
        flags: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    SetNominalBitTiming {
        client: ClientId,
        timing: BitTiming,
        reply: oneshot::Sender<Result<()>>,
    },
    SetDataBitTiming {
        client: ClientId,
        timing: BitTiming,
        reply: oneshot::Sender<Result<()>>,
    },
    SetBus {
        client: ClientId,
        on: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<ChannelState>,
    },
    /// A client is leaving; drop its lease if it holds one.
    ClientGone {
        client: ClientId,
    },
    /// Posted by the RX worker when the device reports a state change.
    BusStateChanged(BusState),
    /// Posted by the RX worker when the device disappears.
    DeviceGone,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Timeout-based single-writer lease over channel configuration.
struct Lease {
    holder: Option<ClientId>,
    claimed_at: Instant,
}

impl Lease {
    fn new() -> Self {
        Self {
            holder: None,
            claimed_at: Instant::now(),
        }
    }

    fn verify(&self, client: ClientId) -> bool {
        self.holder == Some(client) && self.claimed_at.elapsed() <= CONFIG_ACCESS_TIMEOUT
    }

    /// Claim or extend. `locked` blocks takeover from other clients even
    /// past expiry (the on-bus case).
    fn try_acquire(&mut self, client: ClientId, locked: bool) -> bool {
        match self.holder {
            Some(holder) if holder == client => {
                self.claimed_at = Instant::now();
                true
            }
            Some(_) => {
                if !locked && self.claimed_at.elapsed() > CONFIG_ACCESS_TIMEOUT {
                    self.holder = Some(client);
                    self.claimed_at = Instant::now();
                    true
                } else {
                    false
                }
            }
            None => {
                self.holder = Some(client);
                self.claimed_at = Instant::now();
                true
            }
        }
    }

    fn release(&mut self, client: ClientId) {
        if self.holder == Some(client) {
            self.holder = None;
        }
    }
}

pub(crate) struct ChannelController {
    cmd: CmdChannel,
    descriptor: DeviceDescriptor,
    state: ChannelState,
    lease: Lease,
    /// Configurable feature bits requested for the next bus-on.
    target_features: u16,
    nominal: Option<BitTiming>,
    data: Option<BitTiming>,
    requests: mpsc::Receiver<CtrlRequest>,
    gate: watch::Sender<TxGate>,
    /// RX-worker notification for the per-client BUS_ON ring flag.
    bus_flag: mpsc::Sender<crate::hub::RxNotification>,
}

impl ChannelController {
    pub fn new(
        cmd: CmdChannel,
        descriptor: DeviceDescriptor,
        requests: mpsc::Receiver<CtrlRequest>,
        gate: watch::Sender<TxGate>,
        bus_flag: mpsc::Sender<crate::hub::RxNotification>,
    ) -> Self {
        Self {
            cmd,
            descriptor,
            state: ChannelState::Opened,
            lease: Lease::new(),
            target_features: 0,
            nominal: None,
            data: None,
            requests,
            gate,
            bus_flag,
        }
    }

    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                CtrlRequest::AcquireConfigAccess { client, reply } => {
                    let locked = self.state == ChannelState::OnBus;
                    let granted = self.lease.try_acquire(client, locked);
                    debug!("client {client} config access claim: {granted}");
                    let _ = reply.send(granted);
                }
                CtrlRequest::ReleaseConfigAccess { client } => {
                    self.lease.release(client);
                }
                CtrlRequest::SetFeatures { client, flags, reply } => {
                    let _ = reply.send(self.set_features(client, flags));
                }
                CtrlRequest::SetNominalBitTiming { client, timing, reply } => {
                    let _ = reply.send(self.set_nominal(client, timing));
                }
                CtrlRequest::SetDataBitTiming { client, timing, reply } => {
                    let _ = reply.send(self.set_data(client, timing));
                }
                CtrlRequest::SetBus { client, on, reply } => {
                    let result = if on {
                        self.bus_on(client).await
                    } else {
                        self.bus_off(client).await
                    };
                    let _ = reply.send(result);
                }
                CtrlRequest::State { reply } => {
                    let _ = reply.send(self.state);
                }
                CtrlRequest::ClientGone { client } => {
                    self.lease.release(client);
                }
                CtrlRequest::BusStateChanged(state) => {
                    // the parser never cancels transfers; going off bus is
                    // a controller-side bookkeeping change
                    if state == BusState::BusOff && self.state == ChannelState::OnBus {
                        warn!("device went bus-off");
                        self.mark_off_bus().await;
                    }
                }
                CtrlRequest::DeviceGone => {
                    info!("controller: device gone");
                    self.state = ChannelState::Closed;
                    let _ = self.gate.send(TxGate::default());
                }
                CtrlRequest::Shutdown { reply } => {
                    if self.state == ChannelState::OnBus {
                        let mut req = Vec::new();
                        codec::put_bus(&mut req, self.cmd.order(), false);
                        if let Err(e) = self.cmd.run(req).await {
                            debug!("bus off on shutdown failed: {e}");
                        }
                    }
                    self.state = ChannelState::Closed;
                    let _ = self.gate.send(TxGate::default());
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn check_access(&self, client: ClientId) -> Result<()> {
        if self.lease.verify(client) {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    fn set_features(&mut self, client: ClientId, flags: u16) -> Result<()> {
        self.check_access(client)?;

        if flags & !self.descriptor.features_supported() != 0 {
            return Err(Error::InvalidParam);
        }

        self.target_features = flags & self.descriptor.feat_conf;
        Ok(())
    }

    fn clamp_timing(timing: BitTiming, hw: &crate::bittiming::HwConstraints) -> BitTiming {
        BitTiming {
            brp: timing.brp.clamp(hw.brp_min, hw.brp_max),
            tseg1: timing.tseg1.clamp(hw.tseg1_min, hw.tseg1_max),
            tseg2: timing.tseg2.clamp(hw.tseg2_min, hw.tseg2_max),
            sjw: timing.sjw.clamp(1, hw.sjw_max),
        }
    }

    fn set_nominal(&mut self, client: ClientId, timing: BitTiming) -> Result<()> {
        self.check_access(client)?;

        let clamped = Self::clamp_timing(timing, &self.descriptor.nominal);
        if clamped != timing {
            debug!("nominal bit timing clamped to hardware ranges: {clamped:?}");
        }
        self.nominal = Some(clamped);
        if self.state == ChannelState::Opened {
            self.state = ChannelState::Configured;
        }
        Ok(())
    }

    fn set_data(&mut self, client: ClientId, timing: BitTiming) -> Result<()> {
        self.check_access(client)?;

        if !self.descriptor.supports_fd() {
            return Err(Error::NotImplemented);
        }

        let clamped = Self::clamp_timing(timing, &self.descriptor.data);
        if clamped != timing {
            debug!("data bit timing clamped to hardware ranges: {clamped:?}");
        }
        self.data = Some(clamped);
        Ok(())
    }

    async fn send_bittiming(&self, id: u8, timing: &BitTiming) -> Result<()> {
        let mut req = Vec::new();
        codec::put_bittiming(
            &mut req,
            self.cmd.order(),
            id,
            timing.brp as u16,
            timing.tseg1 as u16,
            timing.tseg2 as u8,
            timing.sjw as u8,
        );
        self.cmd.run(req).await
    }

    /// The bring-up script, in strict order. Any failure unwinds with a
    /// best-effort bus-off.
    async fn bus_on(&mut self, client: ClientId) -> Result<()> {
        self.check_access(client)?;

        if self.state == ChannelState::OnBus {
            return Ok(());
        }
        if self.state == ChannelState::Closed {
            return Err(Error::Gone);
        }

        let nominal = self.nominal.ok_or(Error::InvalidParam)?;
        let fd = self.target_features & wire::FEATURE_FDF != 0;
        let data = if fd {
            Some(self.data.ok_or(Error::InvalidParam)?)
        } else {
            None
        };

        let result = self.bus_on_script(nominal, data).await;
        match result {
            Ok(()) => {
                self.state = ChannelState::OnBus;
                let _ = self.gate.send(TxGate { on_bus: true, fd });
                let _ = self
                    .bus_flag
                    .send(crate::hub::RxNotification::BusFlag(true))
                    .await;
                info!("channel on bus (features {:#06x})", self.effective_features());
                Ok(())
            }
            Err(e) => {
                warn!("bus on failed: {e}, unwinding");
                let mut req = Vec::new();
                codec::put_bus(&mut req, self.cmd.order(), false);
                if let Err(off) = self.cmd.run(req).await {
                    debug!("unwind bus off failed: {off}");
                }
                Err(e)
            }
        }
    }

    fn effective_features(&self) -> u16 {
        wire::FEATURE_TXR | self.descriptor.feat_perm | self.target_features
    }

    async fn bus_on_script(&self, nominal: BitTiming, data: Option<BitTiming>) -> Result<()> {
        let order = self.cmd.order();

        debug!("clear features");
        let mut req = Vec::new();
        codec::put_features(&mut req, order, wire::FEAT_OP_CLEAR, 0);
        self.cmd.run(req).await?;

        let features = self.effective_features();
        debug!("add features {features:#06x}");
        let mut req = Vec::new();
        codec::put_features(&mut req, order, wire::FEAT_OP_OR, features as u32);
        self.cmd.run(req).await?;

        debug!(
            "set nominal bit timing brp={} sjw={} tseg1={} tseg2={}",
            nominal.brp, nominal.sjw, nominal.tseg1, nominal.tseg2
        );
        self.send_bittiming(wire::MSG_NM_BITTIMING, &nominal).await?;

        if let Some(data) = data {
            debug!(
                "set data bit timing brp={} sjw={} tseg1={} tseg2={}",
                data.brp, data.sjw, data.tseg1, data.tseg2
            );
            self.send_bittiming(wire::MSG_DT_BITTIMING, &data).await?;
        }

        debug!("bus on");
        let mut req = Vec::new();
        codec::put_bus(&mut req, order, true);
        self.cmd.run(req).await?;

        Ok(())
    }

    async fn bus_off(&mut self, client: ClientId) -> Result<()> {
        self.check_access(client)?;

        if self.state != ChannelState::OnBus {
            return Ok(());
        }

        let mut req = Vec::new();
        codec::put_bus(&mut req, self.cmd.order(), false);
        self.cmd.run(req).await?;

        self.mark_off_bus().await;
        info!("channel off bus");
        Ok(())
    }

    async fn mark_off_bus(&mut self) {
        self.state = ChannelState::Configured;
        let _ = self.gate.send(TxGate::default());
        let _ = self
            .bus_flag
            .send(crate::hub::RxNotification::BusFlag(false))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_expiry() {
        let mut lease = Lease::new();
        assert!(lease.try_acquire(0, false));
        assert!(lease.verify(0));

        // a second claimant is refused while the lease is fresh
        assert!(!lease.try_acquire(1, false));
        assert!(!lease.verify(1));

        // the holder may extend
        assert!(lease.try_acquire(0, false));
    }

    #[test]
    fn expired_lease_transfers() {
        let mut lease = Lease::new();
        assert!(lease.try_acquire(0, false));
        lease.claimed_at = Instant::now() - CONFIG_ACCESS_TIMEOUT - Duration::from_millis(1);

        assert!(!lease.verify(0));
        assert!(lease.try_acquire(1, false));
        assert!(lease.verify(1));
        assert!(!lease.verify(0));
    }

    #[test]
    fn locked_lease_blocks_takeover_even_past_expiry() {
        let mut lease = Lease::new();
        assert!(lease.try_acquire(0, false));
        lease.claimed_at = Instant::now() - CONFIG_ACCESS_TIMEOUT - Duration::from_millis(1);

        // on-bus: nobody else can take it, but the holder can re-claim
        assert!(!lease.try_acquire(1, true));
        assert!(lease.try_acquire(0, true));
    }

    #[test]
    fn release_frees_the_lease() {
        let mut lease = Lease::new();
        assert!(lease.try_acquire(0, false));
        lease.release(1); // not the holder, no effect
        assert!(lease.verify(0));
        lease.release(0);
        assert!(lease.try_acquire(1, false));
    }
}
