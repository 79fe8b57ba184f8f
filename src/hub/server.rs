//! Control-plane server: lets clients in other processes attach to a hub.
//!
//! Listens on the session's control endpoint (a unix socket in the session
//! directory, a named pipe on Windows) and speaks the line-delimited JSON
//! protocol of [`proto`]. The data path never crosses this socket — after
//! a successful attach the client maps the rings and events by name and
//! talks to the hub workers through shared memory only.
//!
//! Each connection owns the clients it attached: when it closes, for any
//! reason, those clients are detached and their resources quiesced, so a
//! killed client process cannot leak slots.
//!
//! [`proto`]: crate::hub::proto

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::error::{Error, Result};
use crate::hub::proto::{self, HubReply, HubRequest};
use crate::hub::{ClientOptions, Hub};
use crate::ClientId;

/// Serve control connections until the listener fails or the task is
/// dropped. Typically spawned right after [`Hub::open`].
#[cfg(unix)]
pub async fn serve(hub: Hub) -> Result<()> {
    let path = hub.control_path();
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)?;
    info!("control socket at {path}");

    loop {
        let (stream, _) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(connection(hub, stream));
    }
}

#[cfg(windows)]
pub async fn serve(hub: Hub) -> Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let path = hub.control_path();
    info!("control pipe at {path}");

    let mut server = ServerOptions::new().first_pipe_instance(true).create(&path)?;
    loop {
        server.connect().await?;
        // hand the connected instance off and park a fresh one
        let connected = std::mem::replace(&mut server, ServerOptions::new().create(&path)?);
        let hub = hub.clone();
        tokio::spawn(connection(hub, connected));
    }
}

async fn connection<S>(hub: Hub, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // clients attached over this connection, detached when it closes
    let mut owned: Vec<ClientId> = Vec::new();

    loop {
        match proto::read_message::<_, HubRequest>(&mut reader).await {
            Ok(Some(request)) => {
                let reply = handle_request(&hub, &mut owned, request).await;
                if proto::write_message(&mut writer, &reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("control connection: {e}");
                let _ = proto::write_message(&mut writer, &HubReply::failed(&e)).await;
                break;
            }
        }
    }

    for id in owned {
        debug!("control connection closed, detaching client {id}");
        if let Err(e) = Hub::detach_client_of(&hub.shared, id).await {
            warn!("detach of client {id} failed: {e}");
        }
    }
}

fn not_owned() -> HubReply {
    HubReply::failed(&Error::AccessDenied)
}

async fn handle_request(hub: &Hub, owned: &mut Vec<ClientId>, request: HubRequest) -> HubReply {
    match request {
        HubRequest::Attach {
            echo_mode,
            ring_capacity,
        } => {
            let options = ClientOptions {
                echo_mode,
                ring_capacity,
            };
            match hub.attach_remote(options).await {
                Ok(id) => {
                    owned.push(id);
                    info!("remote client {id} attached");
                    HubReply::Attached {
                        id,
                        ring_capacity,
                        descriptor: hub.descriptor().clone(),
                    }
                }
                Err(e) => HubReply::failed(&e),
            }
        }
        HubRequest::Detach { id } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            match Hub::detach_client_of(&hub.shared, id).await {
                Ok(()) => {
                    owned.retain(|&o| o != id);
                    HubReply::Done
                }
                Err(e) => HubReply::failed(&e),
            }
        }
        HubRequest::AcquireConfigAccess { id } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            match hub.shared.acquire_access(id).await {
                Ok(granted) => HubReply::Granted { granted },
                Err(e) => HubReply::failed(&e),
            }
        }
        HubRequest::ReleaseConfigAccess { id } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            match hub.shared.release_access(id).await {
                Ok(()) => HubReply::Done,
                Err(e) => HubReply::failed(&e),
            }
        }
        HubRequest::SetFeatureFlags { id, flags } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            unit_reply(hub.shared.set_features(id, flags).await)
        }
        HubRequest::SetNominalBitTiming { id, timing } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            unit_reply(hub.shared.set_nominal(id, timing).await)
        }
        HubRequest::SetDataBitTiming { id, timing } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            unit_reply(hub.shared.set_data(id, timing).await)
        }
        HubRequest::SetBus { id, on } => {
            if !owned.contains(&id) {
                return not_owned();
            }
            unit_reply(hub.shared.set_bus(id, on).await)
        }
    }
}

fn unit_reply(result: Result<()>) -> HubReply {
    match result {
        Ok(()) => HubReply::Done,
        Err(e) => HubReply::failed(&e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::can::CanFrame;
    use crate::hub::ring::RingItem;
    use crate::hub::{ClientHandle, HubOptions, OpenParams};
    use crate::testutil::LoopbackDevice;
    use std::time::Duration;

    async fn connect_with_retry(session: &str, options: ClientOptions) -> ClientHandle {
        for _ in 0..100 {
            match ClientHandle::connect(session, options.clone()).await {
                Ok(client) => return client,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("control socket never came up");
    }

    #[tokio::test]
    async fn remote_client_attaches_and_round_trips() {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();
        let hub = Hub::open(probed, HubOptions::default()).unwrap();
        let session = hub.session().to_string();

        tokio::spawn(serve(hub.clone()));

        // attaches through the control socket, then uses only the named
        // shared-memory rings and events
        let mut client = connect_with_retry(&session, ClientOptions::default()).await;

        client
            .bring_up(&OpenParams::classic(500_000))
            .await
            .unwrap();

        client
            .send_with_track(CanFrame::new(0x321, &[4, 5]).unwrap(), 11)
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap()
        {
            RingItem::TxEcho(echo) => {
                assert_eq!(echo.track_id, 11);
                assert_eq!(echo.frame.id(), 0x321);
            }
            other => panic!("unexpected {other:?}"),
        }

        client.detach().await.unwrap();
    }

    #[tokio::test]
    async fn inbound_traffic_reaches_a_remote_client() {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();
        let hub = Hub::open(probed, HubOptions::default()).unwrap();
        let session = hub.session().to_string();

        tokio::spawn(serve(hub.clone()));
        let mut client = connect_with_retry(&session, ClientOptions::default()).await;

        let mut buf = Vec::new();
        crate::wire::codec::put_can_rx(&mut buf, device.order, 0x99, 2, 0, 77, &[8, 9]);
        device.msg.inject(buf);

        match tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap()
        {
            RingItem::Rx(frame) => {
                assert_eq!(frame.id(), 0x99);
                assert_eq!(frame.data(), &[8, 9]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_dead_connection_detaches_its_clients() {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();
        let hub = Hub::open(probed, HubOptions::default()).unwrap();
        let session = hub.session().to_string();

        tokio::spawn(serve(hub.clone()));

        let client = connect_with_retry(&session, ClientOptions::default()).await;
        let id = client.id();
        drop(client); // closes the control connection without a Detach

        // the daemon reclaims the slot
        for _ in 0..200 {
            if !hub.shared.slots.lock().unwrap()[id as usize] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot was never reclaimed");
    }

    #[tokio::test]
    async fn a_foreign_client_id_is_refused() {
        let device = LoopbackDevice::new();
        let probed = device.probe().await.unwrap();
        let hub = Hub::open(probed, HubOptions::default()).unwrap();
        let session = hub.session().to_string();

        tokio::spawn(serve(hub.clone()));
        let client = connect_with_retry(&session, ClientOptions::default()).await;

        // a raw second connection may not drive the first client's id
        let paths = crate::hub::SessionPaths::new(&session);
        let stream = tokio::net::UnixStream::connect(paths.control()).await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = tokio::io::BufReader::new(reader);

        proto::write_message(
            &mut writer,
            &HubRequest::SetBus {
                id: client.id(),
                on: false,
            },
        )
        .await
        .unwrap();

        let reply: HubReply = proto::read_message(&mut reader).await.unwrap().unwrap();
        match reply {
            HubReply::Failed { code, .. } => {
                assert_eq!(code, Error::AccessDenied.code());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
