//! Synchronous request/reply over the command bulk pipe.
//!
//! Configuration commands (FEATURES, BITTIMING, BUS) are answered by the
//! device with an ERROR message carrying its result code; [`CmdChannel::run`]
//! enforces that shape. The handshake messages answer with their own typed
//! replies and go through [`CmdChannel::transact`] instead.
//!
//! When the device advertises a command buffer larger than the endpoint
//! packet size, both directions are framed through the chunker so the
//! firmware can reassemble a whole command from per-packet DMA buffers.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::wire::chunk::{ChunkReader, ChunkWriter, CHUNK_HDR_LEN};
use crate::wire::codec::{Message, MessageReader};
use crate::wire::{self, ByteOrder};

use super::BulkPipe;

/// Deadline for each half of a command round trip.
pub const CMD_TIMEOUT: Duration = Duration::from_millis(3000);

pub struct CmdChannel {
    pipe: Arc<dyn BulkPipe>,
    order: ByteOrder,
    cmd_buffer_size: usize,
    ep_size: usize,
    chunked: bool,
    timeout: Duration,
}

impl CmdChannel {
    /// Pre-handshake channel: native order, transfers capped at one packet.
    pub fn new(pipe: Arc<dyn BulkPipe>, ep_size: u16) -> Self {
        Self {
            pipe,
            order: ByteOrder::Native,
            cmd_buffer_size: ep_size as usize,
            ep_size: ep_size as usize,
            chunked: false,
            timeout: CMD_TIMEOUT,
        }
    }

    /// Apply the parameters learned from the HELLO reply.
    pub fn configure(&mut self, order: ByteOrder, cmd_buffer_size: u16, ep_size: u16) {
        self.order = order;
        self.cmd_buffer_size = cmd_buffer_size as usize;
        self.ep_size = ep_size as usize;
        self.chunked = self.cmd_buffer_size > self.ep_size;
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn cmd_buffer_size(&self) -> usize {
        self.cmd_buffer_size
    }

    /// Bytes to request for a reply so a fully chunked command buffer fits.
    fn reply_read_len(&self) -> usize {
        if self.chunked {
            let payload = self.ep_size - CHUNK_HDR_LEN;
            let chunks = self.cmd_buffer_size.div_ceil(payload);
            chunks * self.ep_size
        } else {
            self.cmd_buffer_size
        }
    }

    /// One raw round trip: send the request, return the reply bytes.
    pub async fn transact(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        if request.is_empty() || request.len() > self.cmd_buffer_size {
            return Err(Error::InvalidParam);
        }

        let wire_buf = if self.chunked {
            let mut writer = ChunkWriter::new(self.ep_size as u16, self.order)?;
            writer.write(&request);
            writer.finish()
        } else {
            request
        };

        let expected = wire_buf.len();
        debug!("cmd: send {expected} bytes");
        let written = self.pipe.bulk_out(wire_buf, self.timeout).await?;
        if written != expected {
            return Err(Error::DeviceFailure);
        }

        let reply = self.pipe.bulk_in(self.reply_read_len(), self.timeout).await?;
        debug!("cmd: received {} bytes", reply.len());

        if self.chunked {
            let mut reader = ChunkReader::new(self.ep_size as u16, self.order)?;
            let mut out = Vec::with_capacity(self.cmd_buffer_size);
            reader.read(&reply, &mut out)?;
            Ok(out)
        } else {
            Ok(reply)
        }
    }

    /// Round trip for a configuration command: the reply's first message
    /// must be ERROR and its code is mapped into the host taxonomy.
    pub async fn run(&self, request: Vec<u8>) -> Result<()> {
        let reply = self.transact(request).await?;

        match MessageReader::new(&reply, self.order).next() {
            Some(Ok(Message::Error { error })) => map_device_error(error),
            Some(Ok(other)) => {
                debug!("cmd: unexpected reply {other:?}");
                Err(Error::ProtocolViolation("reply is not an ERROR message"))
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::ProtocolViolation("empty command reply")),
        }
    }
}

/// Map a device-reported command result to the host error taxonomy.
pub fn map_device_error(code: u8) -> Result<()> {
    match code {
        wire::DEV_ERROR_NONE => Ok(()),
        wire::DEV_ERROR_SHORT | wire::DEV_ERROR_PARAM => Err(Error::InvalidParam),
        wire::DEV_ERROR_BUSY => Err(Error::DeviceBusy),
        wire::DEV_ERROR_UNSUPPORTED => Err(Error::NotImplemented),
        _ => Err(Error::Unknown),
    }
}
