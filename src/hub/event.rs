//! Named cross-process wakeup events.
//!
//! Each ring carries two of these (data-ready and data-consumed), named
//! with the hub session id so separate hub instances never collide. On
//! unix an event is a datagram socket in the session directory; on Windows
//! it is a named pipe, following the reconnect pattern the named-pipe IPC
//! layer has always used.
//!
//! Signals are best-effort doorbells: [`EventListener::wait`] also returns
//! on a short poll interval, so a lost datagram costs latency, never
//! progress. Waiters re-check their ring after every wakeup.

use std::time::Duration;

use crate::error::Result;

/// Upper bound on how stale a missed signal can leave a waiter.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(unix)]
pub(crate) struct EventListener {
    socket: tokio::net::UnixDatagram,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl EventListener {
    /// Bind the named endpoint. Replaces a leftover from a dead session.
    pub fn bind(name: &str) -> Result<Self> {
        let path = std::path::PathBuf::from(name);
        let _ = std::fs::remove_file(&path);
        Ok(Self {
            socket: tokio::net::UnixDatagram::bind(&path)?,
            path,
        })
    }

    /// Wait for a signal or the poll interval, whichever comes first.
    pub async fn wait(&mut self) {
        let mut buf = [0u8; 8];
        let _ = tokio::time::timeout(POLL_INTERVAL, self.socket.recv(&mut buf)).await;
    }
}

#[cfg(unix)]
impl Drop for EventListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub(crate) struct EventSignal {
    socket: std::os::unix::net::UnixDatagram,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl EventSignal {
    pub fn new(name: &str) -> Result<Self> {
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            path: std::path::PathBuf::from(name),
        })
    }

    /// Fire the doorbell. Failures (listener not bound yet, full socket
    /// buffer) are ignored; the waiter's poll fallback covers them.
    pub fn signal(&self) {
        let _ = self.socket.send_to(&[1], &self.path);
    }
}

#[cfg(windows)]
pub(crate) struct EventListener {
    path: String,
    server: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl EventListener {
    pub fn bind(name: &str) -> Result<Self> {
        let server = tokio::net::windows::named_pipe::ServerOptions::new().create(name)?;
        Ok(Self {
            path: name.to_string(),
            server: Some(server),
        })
    }

    pub async fn wait(&mut self) {
        use tokio::io::AsyncReadExt;

        if self.server.is_none() {
            self.server = tokio::net::windows::named_pipe::ServerOptions::new()
                .create(&self.path)
                .ok();
        }
        let Some(server) = self.server.as_mut() else {
            tokio::time::sleep(POLL_INTERVAL).await;
            return;
        };

        match tokio::time::timeout(POLL_INTERVAL, server.connect()).await {
            Ok(Ok(())) => {
                let mut buf = [0u8; 1];
                let _ =
                    tokio::time::timeout(Duration::from_millis(10), server.read(&mut buf)).await;
                let _ = server.disconnect();
            }
            Ok(Err(_)) => {
                // recreate the instance on the next wait
                self.server = None;
            }
            Err(_) => {} // poll tick
        }
    }
}

#[cfg(windows)]
pub(crate) struct EventSignal {
    path: String,
}

#[cfg(windows)]
impl EventSignal {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            path: name.to_string(),
        })
    }

    pub fn signal(&self) {
        use std::io::Write;

        if let Ok(mut pipe) = std::fs::OpenOptions::new().write(true).open(&self.path) {
            let _ = pipe.write_all(&[1]);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn temp_name(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("ucan-evtest-{}-{tag}.evt", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn signal_wakes_the_listener() {
        let name = temp_name("wake");
        let mut listener = EventListener::bind(&name).unwrap();
        let signal = EventSignal::new(&name).unwrap();

        signal.signal();
        // returns well before the poll interval because a datagram queued
        let start = std::time::Instant::now();
        listener.wait().await;
        assert!(start.elapsed() < POLL_INTERVAL);
    }

    #[tokio::test]
    async fn wait_falls_back_to_polling() {
        let name = temp_name("poll");
        let mut listener = EventListener::bind(&name).unwrap();

        let start = std::time::Instant::now();
        listener.wait().await;
        assert!(start.elapsed() >= POLL_INTERVAL - Duration::from_millis(5));
    }

    #[tokio::test]
    async fn signal_without_listener_is_harmless() {
        let name = temp_name("noone");
        let signal = EventSignal::new(&name).unwrap();
        signal.signal();
    }

    #[tokio::test]
    async fn rebinding_replaces_a_stale_endpoint() {
        let name = temp_name("stale");
        let first = EventListener::bind(&name).unwrap();
        drop(first);
        let mut second = EventListener::bind(&name).unwrap();
        EventSignal::new(&name).unwrap().signal();
        second.wait().await;
    }
}
