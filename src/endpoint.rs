//! Per-backend endpoint fabric: one Unix-socket accept loop per backend.
//!
//! Every accepted connection must win a slot in the proxy-wide connection
//! semaphore before a router is spawned for it; a connection that cannot
//! get a slot is closed immediately, without a single reply byte.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::proxy::ProxyCore;
use crate::router;

pub(crate) async fn accept_loop(
    core: Arc<ProxyCore>,
    backend_name: String,
    listener: UnixListener,
    socket_path: PathBuf,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    info!(backend = %backend_name, socket = %socket_path.display(), "endpoint listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _addr)) => {
                match Arc::clone(core.connections()).try_acquire_owned() {
                    Ok(permit) => {
                        debug!(backend = %backend_name, "client connected");
                        let core = Arc::clone(&core);
                        let name = backend_name.clone();
                        let conn_cancel = cancel.child_token();
                        tracker.spawn(async move {
                            router::serve_connection(core, name, stream, conn_cancel).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        warn!(
                            backend = %backend_name,
                            "connection refused: too many concurrent clients"
                        );
                        drop(stream);
                    }
                }
            }
            Err(e) => {
                error!(backend = %backend_name, error = %e, "accept failed");
            }
        }
    }

    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
    debug!(backend = %backend_name, "endpoint closed");
}
