//! Client for the watchdog multiplexer socket.
//!
//! The multiplexer listens on an AF_UNIX stream socket. A connected client
//! keeps the hardware watchdog armed by writing a `\0` byte at least once
//! per timeout window. Writing the magic byte `V` before disconnecting
//! disarms the client slot; disconnecting without it leaves the watchdog
//! armed and the node reboots when the hardware timeout expires.

use crate::error::{HavenError, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{info, warn};

const UPDATE_BYTE: &[u8] = b"\0";
const MAGIC_CLOSE: &[u8] = b"V";

/// A connected watchdog client.
pub struct WatchdogClient {
    stream: UnixStream,
    path: String,
}

impl WatchdogClient {
    /// Connect to the multiplexer socket, arming the watchdog.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            HavenError::Watchdog(format!("connect to {}: {}", path.display(), e))
        })?;
        info!(socket = %path.display(), "Watchdog armed");
        Ok(Self {
            stream,
            path: path.display().to_string(),
        })
    }

    /// Ping the watchdog. Returns false when the write failed; the caller
    /// must assume the node will reboot within the hardware timeout.
    pub async fn update(&mut self) -> bool {
        match self.stream.write_all(UPDATE_BYTE).await {
            Ok(()) => true,
            Err(e) => {
                warn!(socket = %self.path, error = %e, "Watchdog update failed");
                false
            }
        }
    }

    /// Close the connection. With `graceful` the magic close byte is sent
    /// first, disarming the watchdog; without it the node will self-fence.
    pub async fn close(mut self, graceful: bool) {
        if graceful {
            if let Err(e) = self.stream.write_all(MAGIC_CLOSE).await {
                warn!(socket = %self.path, error = %e, "Graceful watchdog close failed");
            }
        } else {
            warn!(socket = %self.path, "Closing watchdog without disarming");
        }
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_update_and_graceful_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut client = WatchdogClient::connect(&path).await.unwrap();
        assert!(client.update().await);
        assert!(client.update().await);
        client.close(true).await;

        let received = server.await.unwrap();
        assert_eq!(received, b"\0\0V");
    }

    #[tokio::test]
    async fn test_non_graceful_close_sends_no_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut client = WatchdogClient::connect(&path).await.unwrap();
        assert!(client.update().await);
        client.close(false).await;

        let received = server.await.unwrap();
        assert_eq!(received, b"\0");
    }
}
