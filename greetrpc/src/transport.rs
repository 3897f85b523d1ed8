use std::{net::SocketAddr, sync::Arc};

use crate::{
    Context, Result, Router,
    call::{CallHead, RawReceiver, RawSender},
    local,
    tcp::TcpTransport,
};

/// Carrier a [`Client`](crate::Client) opens its calls on.
#[derive(Clone, Debug)]
pub enum Transport {
    /// Runs handlers in the calling process.
    Local(Arc<Router>),
    /// Frames calls over a TCP connection to a [`Server`](crate::Server).
    Tcp(Arc<TcpTransport>),
}

impl Transport {
    #[must_use]
    pub fn local(router: Arc<Router>) -> Self {
        Transport::Local(router)
    }

    #[must_use]
    pub fn tcp(addr: SocketAddr) -> Self {
        Transport::Tcp(TcpTransport::new(addr))
    }

    pub(crate) async fn open_call(
        &self,
        head: &CallHead,
        ctx: &Context,
    ) -> Result<(RawSender, RawReceiver)> {
        match self {
            Transport::Local(router) => Ok(local::open_call(router, head, ctx)),
            Transport::Tcp(tcp_transport) => tcp_transport.open_call(head, ctx).await,
        }
    }

    pub fn stop(&self) {
        match self {
            Transport::Local(_) => {}
            Transport::Tcp(tcp_transport) => tcp_transport.stop(),
        }
    }

    pub async fn join(&self) {
        match self {
            Transport::Local(_) => {}
            Transport::Tcp(tcp_transport) => tcp_transport.join().await,
        }
    }
}
