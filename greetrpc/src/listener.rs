use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tokio_util::sync::DropGuard;

use crate::{Result, Router, TaskSupervisor, tcp::Connection};

/// Accepts TCP connections and serves the calls they carry.
///
/// The accept loops and every connection they start belong to one
/// supervisor, so `stop` shuts all of them down together.
#[derive(Debug)]
pub struct Listener {
    router: Arc<Router>,
    send_queue_size: usize,
    task_supervisor: TaskSupervisor,
}

impl Listener {
    #[must_use]
    pub fn new(router: Arc<Router>, send_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            router,
            send_queue_size,
            task_supervisor: TaskSupervisor::create(),
        })
    }

    /// # Errors
    ///
    /// Fails if `addr` cannot be bound.
    pub async fn start_listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let listener_addr = listener.local_addr()?;

        let this = self.clone();
        self.task_supervisor.spawn("accept loop", async move {
            tracing::info!("start listening: {listener_addr}");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::warn!("set nodelay for {peer} failed: {e}");
                        }
                        tracing::debug!("accepted connection from {peer}");
                        Connection::start(
                            stream,
                            peer,
                            Some(this.router.clone()),
                            this.send_queue_size,
                            &this.task_supervisor,
                        );
                    }
                    Err(e) => {
                        tracing::error!("accept on {listener_addr} failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(listener_addr)
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.task_supervisor.drop_guard()
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}
