use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Codec, Context, Result, Shape, Status};

/// Unit carried by one direction of a call.
#[derive(Debug)]
pub(crate) enum Frame {
    Message(Bytes),
    /// End of the stream. An OK status is a clean end.
    Close(Status),
}

pub(crate) type FrameSender = mpsc::UnboundedSender<Frame>;
pub(crate) type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// What the caller asks a transport to open.
#[derive(Clone, Debug)]
pub(crate) struct CallHead {
    pub method: String,
    pub shape: Shape,
    pub codec: Codec,
}

/// State shared by the halves of one side of a call.
///
/// The first terminal status recorded wins. Recording any status tears the
/// call down, which wakes every operation blocked on its halves.
#[derive(Debug)]
pub(crate) struct CallState {
    ctx: Context,
    terminal: OnceLock<Status>,
    torn_down: CancellationToken,
}

impl CallState {
    pub fn new(ctx: Context) -> Arc<Self> {
        let torn_down = ctx.cancel_token().child_token();
        Arc::new(Self {
            ctx,
            terminal: OnceLock::new(),
            torn_down,
        })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Canceled when the call is torn down or its context is canceled.
    pub fn teardown_token(&self) -> &CancellationToken {
        &self.torn_down
    }

    /// Records the outcome of the call and returns the one that stuck.
    pub fn finish(&self, status: Status) -> Status {
        let status = self.terminal.get_or_init(|| status).clone();
        self.torn_down.cancel();
        status
    }

    pub fn terminal(&self) -> Option<&Status> {
        self.terminal.get()
    }

    /// Records a failure reported by the other side of the call. A context
    /// already done at this side reports its own cause instead.
    pub fn peer_failed(&self, status: Status) -> Status {
        let status = self.ctx.err().unwrap_or(status);
        self.finish(status)
    }

    /// Fails when the call can no longer make progress.
    pub fn check(&self) -> Result<()> {
        if let Some(status) = self.terminal.get() {
            return Err(if status.is_ok() {
                Status::internal("call already finished")
            } else {
                status.clone()
            });
        }
        match self.ctx.err() {
            Some(status) => Err(self.finish(status)),
            None => Ok(()),
        }
    }

    /// Waits until the call is torn down or its context is done.
    pub async fn interrupted(&self) -> Status {
        tokio::select! {
            status = self.ctx.done() => self.finish(status),
            () = self.torn_down.cancelled() => {
                let status = self
                    .ctx
                    .err()
                    .unwrap_or_else(|| Status::cancelled("call torn down"));
                self.finish(status)
            }
        }
    }
}

/// Untyped sending half of a call.
///
/// When both sides of a call live in this process, the sender also holds
/// the other side's state: a failure closing this half ends that side at
/// once, and the first frame carries this side's response metadata over.
#[derive(Debug, Clone)]
pub(crate) struct RawSender {
    tx: FrameSender,
    call: Arc<CallState>,
    peer: Option<Arc<CallState>>,
    codec: Codec,
    closed: bool,
}

impl RawSender {
    pub fn new(tx: FrameSender, call: Arc<CallState>, codec: Codec) -> Self {
        Self {
            tx,
            call,
            peer: None,
            codec,
            closed: false,
        }
    }

    pub fn with_peer(mut self, peer: Arc<CallState>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn call(&self) -> &Arc<CallState> {
        &self.call
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn send(&mut self, payload: Bytes) -> Result<()> {
        if self.closed {
            return Err(Status::internal("send after close"));
        }
        self.call.check()?;
        self.hand_over_metadata();
        self.tx
            .send(Frame::Message(payload))
            .map_err(|_| match self.call.terminal() {
                Some(status) if !status.is_ok() => status.clone(),
                _ => Status::internal("stream closed by peer"),
            })
    }

    pub fn close(&mut self, status: Option<Status>) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.hand_over_metadata();
        let status = match status {
            Some(status) if !status.is_ok() => {
                if self.call.terminal().is_none()
                    && let Some(peer) = &self.peer
                {
                    peer.peer_failed(status.clone());
                }
                self.call.finish(status)
            }
            _ => Status::ok(),
        };
        let _ = self.tx.send(Frame::Close(status));
    }

    fn hand_over_metadata(&self) {
        if let Some(peer) = &self.peer {
            let metadata = self.call.ctx().take_response_metadata();
            peer.ctx().set_peer_metadata(metadata);
        }
    }
}

/// Untyped receiving half of a call.
///
/// The receiver carrying the responses back to the caller completes the
/// call when it reaches the end of its stream.
#[derive(Debug)]
pub(crate) struct RawReceiver {
    rx: FrameReceiver,
    call: Arc<CallState>,
    codec: Codec,
    completes_call: bool,
    terminal: Option<Status>,
}

impl RawReceiver {
    pub fn new(
        rx: FrameReceiver,
        call: Arc<CallState>,
        codec: Codec,
        completes_call: bool,
    ) -> Self {
        Self {
            rx,
            call,
            codec,
            completes_call,
            terminal: None,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn call(&self) -> &Arc<CallState> {
        &self.call
    }

    pub fn terminal(&self) -> Option<&Status> {
        self.terminal.as_ref()
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        if let Some(status) = &self.terminal {
            return Self::observe(status);
        }
        if let Err(status) = self.call.check() {
            return self.terminate(status);
        }
        let frame = tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            status = self.call.interrupted() => return self.terminate(status),
        };
        match frame {
            Some(Frame::Message(payload)) => Ok(Some(payload)),
            // a failure at or past this side's deadline is reported as such.
            Some(Frame::Close(status)) if !status.is_ok() => {
                let status = self.call.ctx().err().unwrap_or(status);
                self.terminate(status)
            }
            Some(Frame::Close(status)) => self.terminate(status),
            None => self.terminate(Status::cancelled("stream dropped before close")),
        }
    }

    /// Ends the stream with `status` and returns what later calls will see.
    pub fn terminate(&mut self, status: Status) -> Result<Option<Bytes>> {
        let status = if !status.is_ok() || self.completes_call {
            self.call.finish(status)
        } else {
            status
        };
        let result = Self::observe(&status);
        self.terminal = Some(status);
        result
    }

    fn observe(status: &Status) -> Result<Option<Bytes>> {
        if status.is_ok() {
            Ok(None)
        } else {
            Err(status.clone())
        }
    }
}

impl Drop for RawReceiver {
    fn drop(&mut self) {
        if self.completes_call && self.terminal.is_none() {
            let status = Status::cancelled("response stream dropped");
            self.call.finish(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn pair(ctx: Context, completes_call: bool) -> (RawSender, RawReceiver) {
        let call = CallState::new(ctx);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RawSender::new(tx, call.clone(), Codec::Json),
            RawReceiver::new(rx, call, Codec::Json, completes_call),
        )
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (mut tx, mut rx) = pair(Context::default(), true);
        tx.send(Bytes::from_static(b"1")).unwrap();
        tx.close(None);
        tx.close(Some(Status::internal("ignored")));

        assert_eq!(rx.recv().await.unwrap().unwrap(), "1");
        assert_eq!(rx.recv().await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap(), None);
        assert!(rx.terminal().unwrap().is_ok());

        let err = tx.send(Bytes::new()).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_error_tears_down_call() {
        let (mut tx, mut rx) = pair(Context::default(), false);
        let mut other = tx.clone();
        tx.close(Some(Status::invalid_argument("bad")));

        assert_eq!(rx.recv().await.unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(rx.recv().await.unwrap_err().code(), Code::InvalidArgument);
        let err = other.send(Bytes::new()).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_recv_unblocks_on_cancel() {
        let ctx = Context::default();
        let (_tx, mut rx) = pair(ctx.clone(), false);
        let handle = tokio::spawn(async move { rx.recv().await });
        ctx.cancel();
        assert_eq!(handle.await.unwrap().unwrap_err().code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_reaches_peer() {
        let caller = CallState::new(Context::default());
        let (server_tx, _server_rx) = pair(Context::default(), false);
        let mut server_tx = server_tx.with_peer(caller.clone());
        server_tx.close(Some(Status::invalid_argument("bad")));

        let err = caller.check().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "bad");
    }

    #[tokio::test]
    async fn test_failure_at_deadline_is_reported_as_such() {
        let caller = CallState::new(Context::new(Some(std::time::Duration::ZERO)));
        let status = caller.peer_failed(Status::cancelled("client canceled"));
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_first_frame_carries_metadata() {
        let caller = CallState::new(Context::default());
        let (server_tx, _server_rx) = pair(Context::default(), false);
        let mut server_tx = server_tx.with_peer(caller.clone());
        server_tx.call().ctx().add_response_metadata("x-served-by", "a");
        server_tx.send(Bytes::new()).unwrap();
        server_tx.call().ctx().add_response_metadata("x-served-by", "b");
        server_tx.close(None);

        let metadata = caller.ctx().peer_metadata();
        assert_eq!(metadata.get_all("x-served-by").collect::<Vec<_>>(), ["a"]);
    }

    #[tokio::test]
    async fn test_closed_pipe() {
        let (mut tx, rx) = pair(Context::default(), false);
        drop(rx);
        let err = tx.send(Bytes::new()).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.message(), "stream closed by peer");
    }

    #[tokio::test]
    async fn test_dropped_sender() {
        let (tx, mut rx) = pair(Context::default(), false);
        drop(tx);
        assert_eq!(rx.recv().await.unwrap_err().code(), Code::Cancelled);
    }
}
