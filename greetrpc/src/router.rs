use std::{collections::HashMap, future::Future, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Context, RecvStream, Result, SendStream, Status,
    call::{RawReceiver, RawSender},
    services::{MetaService, MetaServiceImpl},
};

/// Which sides of a call carry a stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStream,
    /// A stream of requests, one response after the stream is closed.
    ClientStream,
    /// Independent request and response streams.
    BidiStream,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub shape: Shape,
}

type Handler =
    Box<dyn Fn(Context, RawReceiver, RawSender) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Method {
    shape: Shape,
    handler: Handler,
}

/// Table binding method names to their call shape and handler.
///
/// Services fill it at startup, usually through the `export` function the
/// [`service`](crate::service) macro generates:
///
/// ```rust
/// # use greetrpc::{Router, services::{Greeter, GreeterImpl}};
/// # use std::sync::Arc;
/// let mut router = Router::default();
/// Arc::new(GreeterImpl::default()).greetrpc_export(&mut router);
/// assert_eq!(router.method_names().count(), 4);
/// ```
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, Method, RandomState>,
}

impl Router {
    pub fn add_unary<Req, Rsp, F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name.into(),
            Shape::Unary,
            Box::new(move |ctx, rx, tx| {
                let f = f.clone();
                Box::pin(async move {
                    let req = RecvStream::<Req>::from_raw(rx).single().await?;
                    let rsp = f(ctx, req).await?;
                    SendStream::from_raw(tx).send(&rsp).await
                })
            }),
        );
    }

    pub fn add_server_stream<Req, Rsp, F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, Req, SendStream<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name.into(),
            Shape::ServerStream,
            Box::new(move |ctx, rx, tx| {
                let f = f.clone();
                Box::pin(async move {
                    let req = RecvStream::<Req>::from_raw(rx).single().await?;
                    f(ctx, req, SendStream::from_raw(tx)).await
                })
            }),
        );
    }

    pub fn add_client_stream<Req, Rsp, F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + Sync + 'static,
        F: Fn(Context, RecvStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name.into(),
            Shape::ClientStream,
            Box::new(move |ctx, rx, tx| {
                let f = f.clone();
                Box::pin(async move {
                    let rsp = f(ctx, RecvStream::from_raw(rx)).await?;
                    SendStream::from_raw(tx).send(&rsp).await
                })
            }),
        );
    }

    pub fn add_bidi_stream<Req, Rsp, F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Context, RecvStream<Req>, SendStream<Rsp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name.into(),
            Shape::BidiStream,
            Box::new(move |ctx, rx, tx| {
                let f = f.clone();
                Box::pin(async move {
                    f(ctx, RecvStream::from_raw(rx), SendStream::from_raw(tx)).await
                })
            }),
        );
    }

    fn insert(&mut self, name: String, shape: Shape, handler: Handler) {
        if self.methods.contains_key(&name) {
            tracing::warn!("method {name} registered twice, keeping the last one");
        }
        self.methods.insert(name, Method { shape, handler });
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    #[must_use]
    pub fn shape(&self, name: &str) -> Option<Shape> {
        self.methods.get(name).map(|m| m.shape)
    }

    /// Registered methods sorted by name.
    #[must_use]
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<_> = self
            .methods
            .iter()
            .map(|(name, m)| MethodInfo {
                name: name.clone(),
                shape: m.shape,
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    /// Registers the built-in services and freezes the table.
    #[must_use]
    pub fn build(mut self) -> Arc<Self> {
        let meta = Arc::new(MetaServiceImpl::default());
        meta.clone().greetrpc_export(&mut self);
        meta.set_methods(self.methods());
        Arc::new(self)
    }

    /// Runs the handler of `method` against the server halves of a call and
    /// closes the response stream with the outcome.
    pub(crate) async fn serve(
        &self,
        method: &str,
        shape: Shape,
        ctx: Context,
        rx: RawReceiver,
        mut tx: RawSender,
    ) {
        let status = match self.methods.get(method) {
            None => {
                tracing::error!("method not found: {method}");
                Status::unimplemented(format!("method not found: {method}"))
            }
            Some(m) if m.shape != shape => Status::internal(format!(
                "method {method} is {:?}, called as {shape:?}",
                m.shape
            )),
            Some(m) => match (m.handler)(ctx, rx, tx.clone()).await {
                Ok(()) => tx.call().terminal().cloned().unwrap_or_default(),
                Err(status) => status,
            },
        };
        tracing::debug!("{method} finished: {status}");
        tx.close(Some(status));
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Code, Codec, call::CallState};
    use tokio::sync::mpsc;

    fn echo_router() -> Router {
        let mut router = Router::default();
        router.add_unary("Echo/echo", |_ctx, req: String| async move { Ok::<_, Status>(req) });
        router.add_bidi_stream(
            "Echo/chat",
            |_ctx, mut rx: RecvStream<String>, mut tx: SendStream<String>| async move {
                while let Some(msg) = rx.recv().await? {
                    tx.send(&msg).await?;
                }
                Ok::<_, Status>(())
            },
        );
        router
    }

    async fn serve_one(
        router: &Router,
        method: &str,
        shape: Shape,
        requests: &[&str],
    ) -> Vec<Result<Option<String>>> {
        let ctx = Context::default();
        let call = CallState::new(ctx.clone());
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (rsp_tx, rsp_rx) = mpsc::unbounded_channel();

        let raw = RawSender::new(req_tx, call.clone(), Codec::Json);
        let mut requester = SendStream::<String>::from_raw(raw);
        for request in requests {
            requester.send(&(*request).to_string()).await.unwrap();
        }
        requester.close(None);

        router
            .serve(
                method,
                shape,
                ctx,
                RawReceiver::new(req_rx, call.clone(), Codec::Json, false),
                RawSender::new(rsp_tx, call, Codec::Json),
            )
            .await;

        let client_call = CallState::new(Context::default());
        let raw = RawReceiver::new(rsp_rx, client_call, Codec::Json, true);
        let mut responses = RecvStream::<String>::from_raw(raw);
        let mut results = vec![];
        loop {
            let result = responses.recv().await;
            let done = !matches!(result, Ok(Some(_)));
            results.push(result);
            if done {
                return results;
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch() {
        let router = echo_router();
        assert_eq!(router.shape("Echo/echo"), Some(Shape::Unary));
        assert_eq!(router.shape("Echo/missing"), None);

        let results = serve_one(&router, "Echo/echo", Shape::Unary, &["hi"]).await;
        assert_eq!(results, [Ok(Some("hi".to_string())), Ok(None)]);

        let results = serve_one(&router, "Echo/chat", Shape::BidiStream, &["a", "b"]).await;
        assert_eq!(results, [Ok(Some("a".to_string())), Ok(Some("b".to_string())), Ok(None)]);
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let router = echo_router();

        let results = serve_one(&router, "Echo/missing", Shape::Unary, &["hi"]).await;
        assert_eq!(results[0].as_ref().unwrap_err().code(), Code::Unimplemented);

        let results = serve_one(&router, "Echo/echo", Shape::BidiStream, &["hi"]).await;
        assert_eq!(results[0].as_ref().unwrap_err().code(), Code::Internal);

        // a unary call takes exactly one request.
        let results = serve_one(&router, "Echo/echo", Shape::Unary, &["a", "b"]).await;
        assert_eq!(results[0].as_ref().unwrap_err().code(), Code::Internal);
        let results = serve_one(&router, "Echo/echo", Shape::Unary, &[]).await;
        assert_eq!(results[0].as_ref().unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn test_build_registers_meta_service() {
        let router = echo_router().build();
        let names: Vec<_> = router.methods().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["Echo/chat", "Echo/echo", "MetaService/list_methods"]);
    }
}
