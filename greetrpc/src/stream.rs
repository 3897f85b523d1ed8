//! Typed stream channels.
//!
//! A call carries at most one stream per direction. [`SendStream`] is the
//! outbound half and [`RecvStream`] the inbound half; each is single-pass
//! and delivers messages in send order.
//!
//! A receiving stream yields messages until it reports exactly one terminal
//! signal: `Ok(None)` for a clean end, or `Err(status)`. Asking again after
//! that returns the same signal. Any error on one half of a call ends the
//! call, and the other half fails with the same status on its next
//! operation.

use std::marker::PhantomData;

use futures_util::Stream;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;

use crate::{
    Codec, Context, Result, Status,
    call::{CallState, RawReceiver, RawSender},
};

/// Outbound half of a call.
#[derive(Debug)]
pub struct SendStream<T> {
    raw: RawSender,
    phantom: PhantomData<fn(T)>,
}

impl<T> SendStream<T> {
    pub(crate) fn from_raw(raw: RawSender) -> Self {
        Self {
            raw,
            phantom: PhantomData,
        }
    }

    /// Ends the stream. `None` is a clean end, an error status aborts the
    /// whole call with it. Only the first close has an effect.
    pub fn close(&mut self, status: Option<Status>) {
        self.raw.close(status);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        self.raw.call().ctx()
    }
}

impl<T: Serialize> SendStream<T> {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// - `Internal` if the stream is closed or the peer is gone.
    /// - `DeadlineExceeded` or `Cancelled` once the context is done.
    /// - The call's status if the call already failed.
    pub async fn send(&mut self, msg: &T) -> Result<()> {
        let payload = self.raw.codec().encode(msg)?;
        self.raw.send(payload)
    }
}

/// Inbound half of a call.
#[derive(Debug)]
pub struct RecvStream<T> {
    raw: RawReceiver,
    phantom: PhantomData<fn() -> T>,
}

impl<T> RecvStream<T> {
    pub(crate) fn from_raw(raw: RawReceiver) -> Self {
        Self {
            raw,
            phantom: PhantomData,
        }
    }

    /// The terminal signal, once the stream has reported it.
    #[must_use]
    pub fn terminal(&self) -> Option<&Status> {
        self.raw.terminal()
    }

    /// The context of the call. On the calling side its
    /// [`peer_metadata`](Context::peer_metadata) holds the handler's response
    /// metadata once the first response arrived.
    #[must_use]
    pub fn context(&self) -> &Context {
        self.raw.call().ctx()
    }
}

impl<T: DeserializeOwned> RecvStream<T> {
    /// Receives the next message, `Ok(None)` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns the terminal status of the stream. A message that fails to
    /// decode ends the stream with `InvalidArgument`.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        let Some(payload) = self.raw.recv().await? else {
            return Ok(None);
        };
        match self.raw.codec().decode(&payload) {
            Ok(msg) => Ok(Some(msg)),
            Err(status) => {
                self.raw.terminate(status)?;
                Ok(None)
            }
        }
    }

    /// Receives exactly one message followed by the end of the stream.
    pub(crate) async fn single(&mut self) -> Result<T> {
        let Some(msg) = self.recv().await? else {
            return Err(self.violation("expected one message, got none"));
        };
        if self.recv().await?.is_some() {
            return Err(self.violation("expected one message, got more"));
        }
        Ok(msg)
    }

    fn violation(&mut self, msg: &str) -> Status {
        match self.raw.terminate(Status::internal(msg)) {
            Err(status) => status,
            Ok(_) => Status::internal(msg),
        }
    }

    /// Turns the receiver into a [`Stream`] that yields every message and
    /// then, if the stream failed, its error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Ok(Some(msg)) => Some((Ok(msg), Some(rx))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }
}

/// Creates a standalone stream pair bound to `ctx`.
///
/// # Examples
///
/// ```rust
/// # use greetrpc::{Context, stream};
/// # #[tokio::main]
/// # async fn main() {
/// let ctx = Context::default();
/// let (mut tx, mut rx) = stream::channel::<String>(&ctx);
/// tx.send(&"hi".to_string()).await.unwrap();
/// tx.close(None);
/// assert_eq!(rx.recv().await.unwrap().as_deref(), Some("hi"));
/// assert_eq!(rx.recv().await.unwrap(), None);
/// # }
/// ```
#[must_use]
pub fn channel<T>(ctx: &Context) -> (SendStream<T>, RecvStream<T>) {
    let call = CallState::new(ctx.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SendStream::from_raw(RawSender::new(tx, call.clone(), Codec::Json)),
        RecvStream::from_raw(RawReceiver::new(rx, call, Codec::Json, true)),
    )
}
