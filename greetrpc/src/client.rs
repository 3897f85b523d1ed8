use std::{net::SocketAddr, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;

use crate::{
    Codec, Context, RecvStream, Result, Router, SendStream, Shape, Status, Transport,
    call::{CallHead, RawReceiver, RawSender},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Encode messages with MessagePack rather than JSON.
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { use_msgpack: true }
    }
}

/// Caller side of the call dispatcher.
///
/// Each method opens one call of the matching shape. The context passed in
/// is bound to that call, and reusing it for another call fails with
/// `Internal`.
///
/// # Examples
///
/// ```rust
/// # use greetrpc::{Client, Context, Router};
/// # use greetrpc::services::{Greeter, GreeterClient, GreeterImpl, HelloRequest};
/// # use std::{sync::Arc, time::Duration};
/// # #[tokio::main]
/// # async fn main() {
/// let mut router = Router::default();
/// Arc::new(GreeterImpl::default()).greetrpc_export(&mut router);
/// let client = Client::local(router.build());
///
/// let ctx = Context::new(Some(Duration::from_secs(2)));
/// let req = HelloRequest { name: "Ada".into() };
/// let reply = client.say_hello(&ctx, &req).await.unwrap();
/// assert_eq!(reply.message, "Hello, Ada 👋");
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    pub config: ClientConfig,
    transport: Transport,
}

impl Client {
    #[must_use]
    pub fn new(config: ClientConfig, transport: Transport) -> Self {
        Self { config, transport }
    }

    /// A client whose calls run in this process against `router`.
    #[must_use]
    pub fn local(router: Arc<Router>) -> Self {
        Self::new(ClientConfig::default(), Transport::local(router))
    }

    /// A client whose calls go to the server listening on `addr`.
    #[must_use]
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(ClientConfig::default(), Transport::tcp(addr))
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn codec(&self) -> Codec {
        if self.config.use_msgpack {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    async fn open(
        &self,
        ctx: &Context,
        method: &str,
        shape: Shape,
    ) -> Result<(RawSender, RawReceiver)> {
        ctx.bind()?;
        if let Some(status) = ctx.err() {
            return Err(status);
        }
        let head = CallHead {
            method: method.to_string(),
            shape,
            codec: self.codec(),
        };
        tracing::debug!("call {method} as {shape:?}");
        self.transport.open_call(&head, ctx).await
    }

    /// Opens a call, sends `req` as its only request and closes the
    /// request stream.
    async fn open_with_request<Req, Rsp>(
        &self,
        ctx: &Context,
        method: &str,
        shape: Shape,
        req: &Req,
    ) -> Result<RecvStream<Rsp>>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let (tx, rx) = self.open(ctx, method, shape).await?;
        let mut tx = SendStream::<Req>::from_raw(tx);
        let mut rx = RecvStream::from_raw(rx);
        if let Err(status) = tx.send(req).await {
            return Err(peer_status(&mut rx, status).await);
        }
        tx.close(None);
        Ok(rx)
    }

    /// # Errors
    ///
    /// Returns the call's terminal status if it did not end with exactly
    /// one response.
    pub async fn unary<Req, Rsp>(&self, ctx: &Context, method: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        let mut rx = self
            .open_with_request::<Req, Rsp>(ctx, method, Shape::Unary, req)
            .await?;
        rx.single().await
    }

    /// # Errors
    ///
    /// Fails if the call cannot be opened or the request cannot be sent.
    /// Failures later in the call surface on the returned stream.
    pub async fn server_stream<Req, Rsp>(
        &self,
        ctx: &Context,
        method: &str,
        req: &Req,
    ) -> Result<RecvStream<Rsp>>
    where
        Req: Serialize + Sync,
        Rsp: DeserializeOwned,
    {
        self.open_with_request(ctx, method, Shape::ServerStream, req)
            .await
    }

    /// # Errors
    ///
    /// Fails if the call cannot be opened.
    pub async fn client_stream<Req, Rsp>(
        &self,
        ctx: &Context,
        method: &str,
    ) -> Result<ClientStreamingCall<Req, Rsp>> {
        let (tx, rx) = self.open(ctx, method, Shape::ClientStream).await?;
        Ok(ClientStreamingCall {
            tx: SendStream::from_raw(tx),
            rx: RecvStream::from_raw(rx),
        })
    }

    /// # Errors
    ///
    /// Fails if the call cannot be opened.
    pub async fn bidi_stream<Req, Rsp>(
        &self,
        ctx: &Context,
        method: &str,
    ) -> Result<(SendStream<Req>, RecvStream<Rsp>)> {
        let (tx, rx) = self.open(ctx, method, Shape::BidiStream).await?;
        Ok((SendStream::from_raw(tx), RecvStream::from_raw(rx)))
    }
}

/// Status to report when sending failed: the handler may already have ended
/// the call, and its status explains the failure better.
async fn peer_status<Rsp: DeserializeOwned>(rx: &mut RecvStream<Rsp>, status: Status) -> Status {
    match rx.recv().await {
        Err(peer) => peer,
        Ok(_) => status,
    }
}

/// A client-stream call in progress.
///
/// The response is only available through
/// [`close_and_recv`](Self::close_and_recv), after the request stream is
/// closed. Dropping the call cancels it.
#[derive(Debug)]
pub struct ClientStreamingCall<Req, Rsp> {
    tx: SendStream<Req>,
    rx: RecvStream<Rsp>,
}

impl<Req, Rsp> ClientStreamingCall<Req, Rsp> {
    #[must_use]
    pub fn context(&self) -> &Context {
        self.tx.context()
    }

    /// Aborts the call with `status`.
    pub fn abort(&mut self, status: Status) {
        self.tx.close(Some(status));
    }
}

impl<Req: Serialize, Rsp: DeserializeOwned> ClientStreamingCall<Req, Rsp> {
    /// # Errors
    ///
    /// Returns the call's status if it already ended.
    pub async fn send(&mut self, req: &Req) -> Result<()> {
        match self.tx.send(req).await {
            Ok(()) => Ok(()),
            Err(status) => Err(peer_status(&mut self.rx, status).await),
        }
    }

    /// Closes the request stream and waits for the single response.
    ///
    /// # Errors
    ///
    /// Returns the call's terminal status if it did not end with exactly
    /// one response.
    pub async fn close_and_recv(mut self) -> Result<Rsp> {
        self.tx.close(None);
        self.rx.single().await
    }
}
