use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{Context, RecvStream, Result, SendStream, Status};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GreetManyRequest {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GreetChunk {
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Name {
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChatMsg {
    pub text: String,
}

/// Reply to an empty chat message.
pub const EMPTY_TEXT_PROMPT: &str = "please send non-empty text";

/// The greet service, one method per call shape.
#[crate::service]
pub trait Greeter {
    /// Greets `req.name` once.
    async fn say_hello(&self, ctx: &Context, req: &HelloRequest) -> Result<HelloReply>;

    /// Streams numbered greetings for `req.name`.
    async fn greet_many(
        &self,
        ctx: &Context,
        req: &GreetManyRequest,
        tx: SendStream<GreetChunk>,
    ) -> Result<()>;

    /// Counts the names sent until the caller closes its stream.
    async fn upload_names(&self, ctx: &Context, rx: RecvStream<Name>) -> Result<Summary>;

    /// Answers every message with a timestamped echo.
    async fn chat(&self, ctx: &Context, rx: RecvStream<ChatMsg>, tx: SendStream<ChatMsg>)
    -> Result<()>;
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct GreeterConfig {
    /// Number of greetings `greet_many` sends.
    #[serde_inline_default(5)]
    pub count: u32,
    /// Delay between two greetings of `greet_many`.
    #[serde_inline_default(Duration::from_millis(300))]
    #[serde(with = "humantime_serde")]
    pub pacing: Duration,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            count: 5,
            pacing: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GreeterImpl {
    pub config: GreeterConfig,
}

impl GreeterImpl {
    #[must_use]
    pub fn new(config: GreeterConfig) -> Self {
        Self { config }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(Status::invalid_argument("name must not be empty"))
    } else {
        Ok(())
    }
}

fn client_canceled() -> Status {
    Status::cancelled("client canceled")
}

impl Greeter for GreeterImpl {
    async fn say_hello(&self, ctx: &Context, req: &HelloRequest) -> Result<HelloReply> {
        check_name(&req.name)?;
        if ctx.is_done() {
            return Err(Status::deadline_exceeded("request canceled or timed out"));
        }
        Ok(HelloReply {
            message: format!("Hello, {} 👋", req.name),
        })
    }

    async fn greet_many(
        &self,
        ctx: &Context,
        req: &GreetManyRequest,
        mut tx: SendStream<GreetChunk>,
    ) -> Result<()> {
        check_name(&req.name)?;

        for i in 1..=self.config.count {
            if i > 1 {
                tokio::select! {
                    () = tokio::time::sleep(self.config.pacing) => {}
                    _ = ctx.done() => {}
                }
            }
            if ctx.is_done() {
                return Err(client_canceled());
            }

            let chunk = GreetChunk {
                message: format!("Hello #{i}, {} 👋", req.name),
            };
            tx.send(&chunk).await?;
        }
        Ok(())
    }

    async fn upload_names(&self, ctx: &Context, mut rx: RecvStream<Name>) -> Result<Summary> {
        let mut count = 0;
        loop {
            if ctx.is_done() {
                return Err(client_canceled());
            }
            let name = match rx.recv().await {
                Ok(Some(name)) => name,
                Ok(None) => return Ok(Summary { count }),
                Err(_) if ctx.is_done() => return Err(client_canceled()),
                Err(status) => return Err(status),
            };
            check_name(&name.value)?;
            count += 1;
        }
    }

    async fn chat(
        &self,
        _ctx: &Context,
        mut rx: RecvStream<ChatMsg>,
        mut tx: SendStream<ChatMsg>,
    ) -> Result<()> {
        while let Some(msg) = rx.recv().await? {
            let text = if msg.text.is_empty() {
                EMPTY_TEXT_PROMPT.to_string()
            } else {
                format!(
                    "server echo: {:?} @ {}",
                    msg.text,
                    humantime::format_rfc3339_seconds(SystemTime::now())
                )
            };
            tx.send(&ChatMsg { text }).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Code, stream};

    async fn names(values: &[&str]) -> RecvStream<Name> {
        let (mut tx, rx) = stream::channel(&Context::default());
        for value in values {
            let name = Name {
                value: (*value).to_string(),
            };
            tx.send(&name).await.unwrap();
        }
        tx.close(None);
        rx
    }

    #[tokio::test]
    async fn test_say_hello() {
        let greeter = GreeterImpl::default();
        let ctx = Context::default();
        let req = HelloRequest { name: "Ada".into() };
        let reply = greeter.say_hello(&ctx, &req).await.unwrap();
        assert_eq!(reply.message, "Hello, Ada 👋");

        // an empty name is rejected whatever the state of the context.
        let req = HelloRequest::default();
        let err = greeter.say_hello(&ctx, &req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "name must not be empty");

        ctx.cancel();
        let err = greeter.say_hello(&ctx, &req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let req = HelloRequest { name: "Ada".into() };
        let err = greeter.say_hello(&ctx, &req).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greet_many() {
        let greeter = GreeterImpl::default();
        let ctx = Context::default();
        let (tx, rx) = stream::channel(&Context::default());
        let req = GreetManyRequest { name: "Ada".into() };

        let start = tokio::time::Instant::now();
        greeter.greet_many(&ctx, &req, tx).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(4 * 300));

        // the handler returned without closing, the router does that.
        let mut rx = rx;
        for i in 1..=5 {
            let chunk = rx.recv().await.unwrap().unwrap();
            assert_eq!(chunk.message, format!("Hello #{i}, Ada 👋"));
        }
        assert_eq!(rx.recv().await.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greet_many_stops_when_canceled() {
        let greeter = GreeterImpl::default();
        let ctx = Context::default();
        let (tx, mut rx) = stream::channel(&Context::default());
        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let req = GreetManyRequest { name: "Ada".into() };
                greeter.greet_many(&ctx, &req, tx).await
            }
        });

        for i in 1..=2 {
            let chunk = rx.recv().await.unwrap().unwrap();
            assert_eq!(chunk.message, format!("Hello #{i}, Ada 👋"));
        }
        ctx.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(err.message(), "client canceled");
        // message 3 was never sent.
        assert_eq!(rx.recv().await.unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_greet_many_rejects_empty_name() {
        let greeter = GreeterImpl::default();
        let (tx, _rx) = stream::channel(&Context::default());
        let err = greeter
            .greet_many(&Context::default(), &GreetManyRequest::default(), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_upload_names() {
        let greeter = GreeterImpl::default();
        let ctx = Context::default();

        let summary = greeter
            .upload_names(&ctx, names(&["Ada", "Brian", "Charlotte"]).await)
            .await
            .unwrap();
        assert_eq!(summary.count, 3);

        let summary = greeter.upload_names(&ctx, names(&[]).await).await.unwrap();
        assert_eq!(summary.count, 0);

        let err = greeter
            .upload_names(&ctx, names(&["Ada", "", "Charlotte"]).await)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        ctx.cancel();
        let err = greeter
            .upload_names(&ctx, names(&["Ada"]).await)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_names_deadline_while_waiting() {
        let greeter = GreeterImpl::default();
        let ctx = Context::new(Some(Duration::from_millis(100)));
        // the caller never ends its stream.
        let (mut tx, rx) = stream::channel(&ctx);
        tx.send(&Name {
            value: "Ada".into(),
        })
        .await
        .unwrap();

        let err = greeter.upload_names(&ctx, rx).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(err.message(), "client canceled");
        drop(tx);
    }

    #[tokio::test]
    async fn test_chat() {
        let greeter = GreeterImpl::default();
        let ctx = Context::default();
        let (mut req_tx, req_rx) = stream::channel(&ctx);
        let (rsp_tx, rsp_rx) = stream::channel::<ChatMsg>(&ctx);

        for text in ["hi", "", "bye"] {
            req_tx.send(&ChatMsg { text: text.into() }).await.unwrap();
        }
        req_tx.close(None);
        greeter.chat(&ctx, req_rx, rsp_tx).await.unwrap();

        let mut rsp_rx = rsp_rx;
        let first = rsp_rx.recv().await.unwrap().unwrap().text;
        assert!(first.starts_with("server echo: \"hi\" @ "), "{first}");
        let second = rsp_rx.recv().await.unwrap().unwrap().text;
        assert_eq!(second, EMPTY_TEXT_PROMPT);
        let third = rsp_rx.recv().await.unwrap().unwrap().text;
        assert!(third.starts_with("server echo: \"bye\" @ "), "{third}");
    }

    #[test]
    fn test_config() {
        let config: GreeterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GreeterConfig::default());

        let config: GreeterConfig =
            serde_json::from_str(r#"{"count": 2, "pacing": "1s 500ms"}"#).unwrap();
        assert_eq!(config.count, 2);
        assert_eq!(config.pacing, Duration::from_millis(1500));
    }
}
