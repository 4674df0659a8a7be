//! Unix-socket client used by the orchestrator side to issue CSI requests.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::MAX_MESSAGE_SIZE;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// A lightweight CSI client that sends each [`CsiMessage`] request over a
/// fresh connection to the plugin socket and returns the server's response.
#[derive(Debug, Clone)]
pub struct CsiClient {
    socket_path: PathBuf,
}

impl CsiClient {
    /// Client for the plugin listening on `socket_path`.
    ///
    /// No connection is made until the first request.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// The request is written in full, the write half is shut down to mark
    /// its end, then the whole response is read and deserialized.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                CsiError::TransportError(format!(
                    "connect {}: {e}",
                    self.socket_path.display()
                ))
            })?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }
}
