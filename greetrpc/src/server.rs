use std::{net::SocketAddr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio_util::sync::DropGuard;

use crate::{Listener, Result, Router, Status, tcp::SEND_QUEUE_SIZE};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Encoded frames a connection may queue before senders wait.
    #[serde_inline_default(SEND_QUEUE_SIZE)]
    pub send_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            send_queue_size: SEND_QUEUE_SIZE,
        }
    }
}

/// RPC server serving the methods of a [`Router`] over TCP.
///
/// # Examples
///
/// ```rust,no_run
/// # use greetrpc::{Router, Server, ServerConfig, services::{Greeter, GreeterImpl}};
/// # use std::{net::SocketAddr, sync::Arc};
/// # #[tokio::main]
/// # async fn main() {
/// let mut router = Router::default();
/// Arc::new(GreeterImpl::default()).greetrpc_export(&mut router);
///
/// let server = Server::create(router, &ServerConfig::default()).unwrap();
/// let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
/// server.listen(addr).await.unwrap();
/// server.join().await;
/// # }
/// ```
pub struct Server {
    router: Arc<Router>,
    listener: Arc<Listener>,
    _drop_guard: DropGuard,
}

impl Server {
    /// Builds the router, built-in services included.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` on an unusable configuration.
    pub fn create(router: Router, config: &ServerConfig) -> Result<Self> {
        if config.send_queue_size == 0 {
            return Err(Status::invalid_argument("send_queue_size must be positive"));
        }
        let router = router.build();
        let listener = Listener::new(router.clone(), config.send_queue_size);
        let drop_guard = listener.drop_guard();
        Ok(Self {
            router,
            listener,
            _drop_guard: drop_guard,
        })
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Starts accepting connections on `addr` and returns the bound address,
    /// which differs from `addr` when port 0 was asked for.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listener.start_listen(addr).await
    }

    /// Stops accepting connections and closes the open ones. Their calls
    /// end with `Internal` on the caller side, and their handlers see their
    /// context canceled.
    pub fn stop(&self) {
        self.listener.stop();
    }

    /// Waits until every accept loop and connection has shut down.
    pub async fn join(&self) {
        self.listener.join().await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("router", &self.router)
            .finish()
    }
}
