//! Control-plane protocol between the hub daemon and its clients.
//!
//! Line-delimited JSON over a local socket (unix) or named pipe (Windows).
//! The data path never touches this channel; it exists for attach/detach
//! and the lease-gated configuration calls. Ring and event names are
//! derived from the session id on both sides, so replies only need to
//! carry the client id and the device descriptor.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::bittiming::BitTiming;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::hub::EchoMode;
use crate::ClientId;

#[derive(Debug, Serialize, Deserialize)]
pub enum HubRequest {
    Attach {
        echo_mode: EchoMode,
        ring_capacity: usize,
    },
    Detach {
        id: ClientId,
    },
    AcquireConfigAccess {
        id: ClientId,
    },
    ReleaseConfigAccess {
        id: ClientId,
    },
    SetFeatureFlags {
        id: ClientId,
        flags: u16,
    },
    SetNominalBitTiming {
        id: ClientId,
        timing: BitTiming,
    },
    SetDataBitTiming {
        id: ClientId,
        timing: BitTiming,
    },
    SetBus {
        id: ClientId,
        on: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum HubReply {
    Attached {
        id: ClientId,
        ring_capacity: usize,
        descriptor: DeviceDescriptor,
    },
    Granted {
        granted: bool,
    },
    Done,
    Failed {
        code: i32,
        message: String,
    },
}

impl HubReply {
    pub fn failed(error: &Error) -> Self {
        HubReply::Failed {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Write one message as a JSON line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message).map_err(|_| Error::InvalidParam)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON-line message. `None` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|_| Error::ProtocolViolation("malformed control message"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_round_trips_through_the_framing() {
        let requests = vec![
            HubRequest::Attach {
                echo_mode: EchoMode::Submit,
                ring_capacity: 64,
            },
            HubRequest::SetNominalBitTiming {
                id: 3,
                timing: BitTiming {
                    brp: 1,
                    tseg1: 127,
                    tseg2: 32,
                    sjw: 32,
                },
            },
            HubRequest::SetBus { id: 0, on: true },
        ];

        let mut wire = Vec::new();
        for request in &requests {
            write_message(&mut wire, request).await.unwrap();
        }

        let mut reader = tokio::io::BufReader::new(&wire[..]);
        for request in &requests {
            let got: HubRequest = read_message(&mut reader).await.unwrap().unwrap();
            assert_eq!(format!("{got:?}"), format!("{request:?}"));
        }
        let eof: Option<HubRequest> = read_message(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_rejected() {
        let mut reader = tokio::io::BufReader::new(&b"not json\n"[..]);
        let result: Result<Option<HubRequest>> = read_message(&mut reader).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn failed_reply_carries_the_code() {
        match HubReply::failed(&Error::AccessDenied) {
            HubReply::Failed { code, .. } => assert_eq!(code, Error::AccessDenied.code()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
