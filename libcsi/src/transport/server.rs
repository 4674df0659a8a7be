//! Unix-socket server that runs on each worker node and dispatches incoming
//! CSI requests to the appropriate trait implementations.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_SIZE;
use crate::driver::ServiceRole;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A CSI server that accepts unix-socket connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiNode`]
/// implementation.
///
/// The socket file is removed when the server is dropped.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
    roles: Arc<HashSet<ServiceRole>>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiNode + 'static,
{
    /// Bind the socket at `path`, serving only the services in `roles`.
    ///
    /// A stale socket left by a previous run is removed first; any other
    /// kind of file at `path` is an error.  Must be called from within a
    /// Tokio runtime.
    pub fn bind(
        path: &Path,
        handler: Arc<T>,
        roles: HashSet<ServiceRole>,
    ) -> Result<Self, CsiError> {
        prepare_socket_path(path)?;
        let listener = UnixListener::bind(path).map_err(|e| {
            CsiError::TransportError(format!("failed to listen on {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), ?roles, "CSI server listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handler,
            roles: Arc::new(roles),
        })
    }

    /// Accept connections in a loop.
    ///
    /// Each accepted connection is handled on its own Tokio task, so calls
    /// for different volumes proceed concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "CSI accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);
            let roles = Arc::clone(&self.roles);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(stream, &handler, &roles).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Path of the bound socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process a single connection: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut stream: UnixStream,
        handler: &T,
        roles: &HashSet<ServiceRole>,
    ) -> Result<(), CsiError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_SIZE)
            .read_to_end(&mut buf)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => Self::dispatch(handler, roles, request).await,
            Err(e) => CsiMessage::Error(CsiError::TransportError(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;
        Ok(())
    }

    /// Gate, route and log one call.
    async fn dispatch(
        handler: &T,
        roles: &HashSet<ServiceRole>,
        request: CsiMessage,
    ) -> CsiMessage {
        let call_id = CALL_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(call_id, %request, "CSI call");

        let response = if !request.is_request() {
            warn!(call_id, msg = %request, "unexpected message variant received as request");
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {request}"
            )))
        } else {
            let role = required_role(&request);
            if roles.contains(&role) {
                Self::route(handler, request).await
            } else {
                CsiMessage::Error(CsiError::Unimplemented(format!(
                    "{role} service is not enabled"
                )))
            }
        };

        match &response {
            CsiMessage::Error(e) => {
                error!(call_id, code = %e.code(), error = %e, "CSI call failed")
            }
            ok => debug!(call_id, response = %ok, "CSI call succeeded"),
        }
        response
    }

    /// Map a request to the correct trait method call and wrap the result
    /// in a response [`CsiMessage`].
    async fn route(handler: &T, request: CsiMessage) -> CsiMessage {
        let result = match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => handler.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => handler
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => handler
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => handler.stage_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::PublishVolume(req) => {
                handler.publish_volume(req).await.map(|()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => handler
                .unpublish_volume(&volume_id, &target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetVolumeStats {
                volume_id,
                volume_path,
            } => handler
                .get_volume_stats(&volume_id, &volume_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::ExpandVolume {
                volume_id,
                volume_path,
                required_bytes,
            } => handler
                .expand_volume(&volume_id, &volume_path, required_bytes)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::GetNodeCapabilities => handler
                .get_capabilities()
                .await
                .map(CsiMessage::NodeCapabilitiesResponse),
            CsiMessage::GetNodeInfo => handler.get_info().await.map(CsiMessage::NodeInfoResponse),

            other => Err(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            ))),
        };
        result.unwrap_or_else(CsiMessage::Error)
    }
}

impl<T> Drop for CsiServer<T> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove CSI socket");
        }
    }
}

/// Service a request belongs to.
fn required_role(request: &CsiMessage) -> ServiceRole {
    match request {
        CsiMessage::Probe | CsiMessage::GetPluginInfo | CsiMessage::GetPluginCapabilities => {
            ServiceRole::Identity
        }
        _ => ServiceRole::Node,
    }
}

/// Make `path` bindable: create its parent and remove a stale socket.
fn prepare_socket_path(path: &Path) -> Result<(), CsiError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(|e| {
                CsiError::TransportError(format!(
                    "failed to remove stale socket {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(_) => {
            return Err(CsiError::InvalidArgument(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(CsiError::transport(e)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            CsiError::TransportError(format!(
                "failed to create socket directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}
