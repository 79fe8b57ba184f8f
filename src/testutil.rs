//! In-memory bulk pipes for the test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::device::BulkPipe;
use crate::error::{Error, Result};
use crate::wire::codec::{self, CanInfoMsg, DeviceInfoMsg, WireBitTimingRanges};
use crate::wire::{self, ByteOrder};

/// A bulk pipe whose inbound traffic is scripted by the test.
pub(crate) struct ScriptedPipe {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    outbox: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
    gone: AtomicBool,
}

impl ScriptedPipe {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(Vec::new()),
            notify: Notify::new(),
            gone: AtomicBool::new(false),
        }
    }

    /// Queue a buffer to be returned by the next `bulk_in`.
    pub fn queue_in(&self, buf: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(buf);
        self.notify.notify_waiters();
    }

    /// Drain everything written so far.
    pub fn take_out(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    /// Simulate an unplug: all pending and future transfers fail.
    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BulkPipe for ScriptedPipe {
    async fn bulk_out(&self, data: Vec<u8>, _timeout: Duration) -> Result<usize> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(Error::Gone);
        }
        let len = data.len();
        self.outbox.lock().unwrap().push(data);
        Ok(len)
    }

    async fn bulk_in(&self, _len: usize, timeout: Duration) -> Result<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            if self.gone.load(Ordering::SeqCst) {
                return Err(Error::Gone);
            }
            if let Some(buf) = self.inbox.lock().unwrap().pop_front() {
                return Ok(buf);
            }
            if timeout.is_zero() {
                notified.await;
            } else if tokio::time::timeout(timeout, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }
}

/// Command endpoint of the loopback device: answers the handshake and
/// acknowledges configuration commands, recording them for assertions.
pub(crate) struct LoopbackCmdEndpoint {
    pipe: ScriptedPipe,
    order: ByteOrder,
    byte_order_id: u8,
    pub commands: Mutex<Vec<u8>>, // message ids in arrival order
    pub fail_bus_on: AtomicBool,
}

impl LoopbackCmdEndpoint {
    fn reply(&self, request: &[u8]) {
        let id = request[0];
        self.commands.lock().unwrap().push(id);

        let mut reply = Vec::new();
        match id {
            wire::MSG_HELLO_DEVICE => {
                codec::put_hello_host(&mut reply, wire::PROTO_VERSION, self.byte_order_id, 64);
            }
            wire::MSG_DEVICE_INFO => {
                codec::put_device_info(
                    &mut reply,
                    self.order,
                    &DeviceInfoMsg {
                        feat_perm: wire::FEATURE_TXR,
                        feat_conf: wire::FEATURE_FDF
                            | wire::FEATURE_DAR
                            | wire::FEATURE_MON_MODE
                            | wire::FEATURE_BERR_REPORTING,
                        fw_version: (0, 5, 1),
                        ch_index: 0,
                        serial: vec![0x12, 0x34, 0x56, 0x78],
                        name: "loopback".to_string(),
                    },
                );
            }
            wire::MSG_CAN_INFO => {
                codec::put_can_info(
                    &mut reply,
                    self.order,
                    &CanInfoMsg {
                        msg_buffer_size: 512,
                        can_clk_hz: 80_000_000,
                        tx_fifo_size: 4,
                        rx_fifo_size: 8,
                        nominal: WireBitTimingRanges {
                            brp_min: 1,
                            brp_max: 512,
                            tseg1_min: 2,
                            tseg1_max: 256,
                            tseg2_min: 2,
                            tseg2_max: 128,
                            sjw_max: 128,
                        },
                        data: WireBitTimingRanges {
                            brp_min: 1,
                            brp_max: 32,
                            tseg1_min: 1,
                            tseg1_max: 32,
                            tseg2_min: 1,
                            tseg2_max: 16,
                            sjw_max: 16,
                        },
                    },
                );
            }
            wire::MSG_BUS if self.fail_bus_on.load(Ordering::SeqCst) => {
                codec::put_error(&mut reply, wire::DEV_ERROR_BUSY);
            }
            _ => {
                codec::put_error(&mut reply, wire::DEV_ERROR_NONE);
            }
        }
        self.pipe.queue_in(reply);
    }
}

#[async_trait]
impl BulkPipe for LoopbackCmdEndpoint {
    async fn bulk_out(&self, data: Vec<u8>, timeout: Duration) -> Result<usize> {
        let len = self.pipe.bulk_out(data.clone(), timeout).await?;
        self.reply(&data);
        Ok(len)
    }

    async fn bulk_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.pipe.bulk_in(len, timeout).await
    }
}

/// Message endpoint of the loopback device: every TX frame written to it
/// produces a TXR on the inbound side. Tests inject RX/STATUS/ERROR traffic
/// directly through `inject`.
pub(crate) struct LoopbackMsgEndpoint {
    pipe: ScriptedPipe,
    order: ByteOrder,
    /// Track ids the device should report as dropped.
    pub drop_tracks: Mutex<Vec<u8>>,
    /// When set, TXRs are withheld entirely (the test releases them).
    pub hold_txr: AtomicBool,
    held: Mutex<Vec<(u8, u8)>>, // (track_id, flags)
    ts: Mutex<u32>,
}

impl LoopbackMsgEndpoint {
    pub fn inject(&self, buf: Vec<u8>) {
        self.pipe.queue_in(buf);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.pipe.take_out()
    }

    fn next_ts(&self) -> u32 {
        let mut ts = self.ts.lock().unwrap();
        *ts += 100;
        *ts
    }

    /// Deliver TXRs previously withheld by `hold_txr`.
    pub fn release_held_txrs(&self) {
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        let mut buf = Vec::new();
        for (track_id, flags) in held {
            codec::put_can_txr(&mut buf, self.order, track_id, flags, self.next_ts());
        }
        if !buf.is_empty() {
            self.pipe.queue_in(buf);
        }
    }

    fn process_tx(&self, data: &[u8]) {
        let mut txr_buf = Vec::new();
        let mut pos = 0usize;
        while pos + wire::LEN_MULTIPLE <= data.len() {
            let id = data[pos];
            let len = data[pos + 1] as usize;
            if id == wire::MSG_EOF || len == 0 {
                break;
            }
            if len % wire::LEN_MULTIPLE != 0 || pos + len > data.len() {
                break;
            }
            if id == wire::MSG_CAN_TX {
                let track_id = data[pos + 2];
                let drp = self.drop_tracks.lock().unwrap().contains(&track_id);
                let flags = if drp { wire::CAN_FLAG_DRP } else { 0 };
                if self.hold_txr.load(Ordering::SeqCst) {
                    self.held.lock().unwrap().push((track_id, flags));
                } else {
                    codec::put_can_txr(&mut txr_buf, self.order, track_id, flags, self.next_ts());
                }
            }
            pos += len;
        }
        if !txr_buf.is_empty() {
            self.pipe.queue_in(txr_buf);
        }
    }
}

#[async_trait]
impl BulkPipe for LoopbackMsgEndpoint {
    async fn bulk_out(&self, data: Vec<u8>, timeout: Duration) -> Result<usize> {
        let len = self.pipe.bulk_out(data.clone(), timeout).await?;
        self.process_tx(&data);
        Ok(len)
    }

    async fn bulk_in(&self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.pipe.bulk_in(len, timeout).await
    }
}

/// A complete in-memory device.
pub(crate) struct LoopbackDevice {
    pub cmd: Arc<LoopbackCmdEndpoint>,
    pub msg: Arc<LoopbackMsgEndpoint>,
    pub order: ByteOrder,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::with_byte_order(crate::wire::native_byte_order_id())
    }

    pub fn with_byte_order(byte_order_id: u8) -> Self {
        let order = ByteOrder::for_device(byte_order_id);
        Self {
            cmd: Arc::new(LoopbackCmdEndpoint {
                pipe: ScriptedPipe::new(),
                order,
                byte_order_id,
                commands: Mutex::new(Vec::new()),
                fail_bus_on: AtomicBool::new(false),
            }),
            msg: Arc::new(LoopbackMsgEndpoint {
                pipe: ScriptedPipe::new(),
                order,
                drop_tracks: Mutex::new(Vec::new()),
                hold_txr: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
                ts: Mutex::new(0),
            }),
            order,
        }
    }

    /// Unplug both pipes.
    pub fn unplug(&self) {
        self.cmd.pipe.set_gone();
        self.msg.pipe.set_gone();
    }

    pub async fn probe(&self) -> Result<crate::device::UsbCanDevice> {
        crate::device::UsbCanDevice::probe(self.cmd.clone(), self.msg.clone(), 64).await
    }
}
