use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpStream, sync::RwLock};
use tokio_util::sync::DropGuard;

use super::{Connection, SEND_QUEUE_SIZE};
use crate::{
    Context, Result, TaskSupervisor,
    call::{CallHead, RawReceiver, RawSender},
};

/// Caller side of the TCP transport.
///
/// Every call to the target address is multiplexed on one connection. The
/// connection is established on first use and again after it is lost.
pub struct TcpTransport {
    addr: SocketAddr,
    connection: RwLock<Option<Arc<Connection>>>,
    task_supervisor: TaskSupervisor,
}

impl TcpTransport {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            connection: RwLock::default(),
            task_supervisor: TaskSupervisor::create(),
        })
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
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

    pub(crate) async fn open_call(
        &self,
        head: &CallHead,
        ctx: &Context,
    ) -> Result<(RawSender, RawReceiver)> {
        let connection = self.acquire(ctx).await?;
        connection.open_call(head, ctx).await
    }

    async fn acquire(&self, ctx: &Context) -> Result<Arc<Connection>> {
        // Check if a live connection already exists.
        if let Ok(connection) = self.connection.try_read()
            && let Some(connection) = connection.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        // If not, connect and keep the new one.
        let mut connection = self.connection.write().await;
        if let Some(connection) = connection.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        let connect = TcpStream::connect(self.addr);
        let stream = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, connect).await??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        tracing::info!("connected to {}", self.addr);

        let new_connection = Connection::start(
            stream,
            self.addr,
            None,
            SEND_QUEUE_SIZE,
            &self.task_supervisor,
        );
        *connection = Some(new_connection.clone());
        Ok(new_connection)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.addr)
            .finish()
    }
}
