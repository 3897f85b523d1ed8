use std::{
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Metadata, Result, Status};

/// Per-call state: deadline, cancellation and metadata.
///
/// A context is bound to exactly one call. Clones share the deadline, the
/// cancellation signal and the binding, so a clone can be handed to another
/// task to cancel the call.
///
/// Once canceled or past its deadline, a context stays done, and the cause
/// observed first is the one reported from then on.
///
/// Metadata goes both ways once per call: the caller's outgoing metadata is
/// sent when the call opens, and a handler's response metadata travels with
/// its first response. Each side reads what it got with
/// [`peer_metadata`](Self::peer_metadata).
///
/// # Examples
///
/// ```rust
/// # use greetrpc::Context;
/// # use std::time::Duration;
/// let ctx = Context::new(Some(Duration::from_secs(2))).with_metadata("x-client", "demo");
/// assert!(!ctx.is_done());
/// ctx.cancel();
/// assert!(ctx.is_done());
/// ```
#[derive(Clone, Debug)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    cause: Arc<OnceLock<Status>>,
    bound: Arc<AtomicBool>,
    metadata: Metadata,
    response_metadata: Arc<Mutex<Metadata>>,
    peer_metadata: Arc<OnceLock<Metadata>>,
}

static NO_METADATA: Metadata = Metadata::new();

impl Default for Context {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Context {
    /// Creates a context whose deadline is `now + timeout`, or none.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_token(timeout, CancellationToken::new())
    }

    fn with_token(timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            // a deadline past what `Instant` can hold is no deadline.
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            cancel,
            cause: Arc::default(),
            bound: Arc::default(),
            metadata: Metadata::default(),
            response_metadata: Arc::default(),
            peer_metadata: Arc::default(),
        }
    }

    /// Server-side context for a call opened by a remote peer.
    pub(crate) fn for_peer(timeout: Option<Duration>, peer_metadata: Metadata) -> Self {
        Self {
            peer_metadata: Arc::new(OnceLock::from(peer_metadata)),
            ..Self::new(timeout)
        }
    }

    /// Server-side context for an in-process call. It shares the caller's
    /// deadline and is canceled together with `cancel`.
    pub(crate) fn for_local_peer(&self, cancel: CancellationToken) -> Self {
        Self {
            deadline: self.deadline,
            peer_metadata: Arc::new(OnceLock::from(self.metadata.clone())),
            ..Self::with_token(None, cancel)
        }
    }

    /// Appends outgoing metadata. Metadata travels once, when the call opens.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.append(key, value);
        self
    }

    /// Metadata this side sends to its peer.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata received from the peer: on the serving side, what the
    /// caller sent at open; on the calling side, what the handler attached
    /// to its first response. Empty until then.
    #[must_use]
    pub fn peer_metadata(&self) -> &Metadata {
        self.peer_metadata.get().unwrap_or(&NO_METADATA)
    }

    /// Attaches metadata to the response of the call this context serves.
    ///
    /// It is sent with the first response message, or with the end of the
    /// call if there is none. Metadata added after that is dropped.
    pub fn add_response_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.response_metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .append(key, value);
    }

    /// Hands the pending response metadata over to the transport.
    pub(crate) fn take_response_metadata(&self) -> Metadata {
        std::mem::take(
            &mut *self
                .response_metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Records the metadata of the peer's first response. Later calls have
    /// no effect.
    pub(crate) fn set_peer_metadata(&self, metadata: Metadata) {
        let _ = self.peer_metadata.set(metadata);
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancels the call. Calling it again has no effect.
    pub fn cancel(&self) {
        // record the cause before waking anyone up.
        let _ = self.err();
        let _ = self.cause.set(Status::cancelled("call canceled"));
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<Status> {
        if let Some(status) = self.cause.get() {
            return Some(status.clone());
        }
        let status = if self.cancel.is_cancelled() {
            Status::cancelled("call canceled")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Status::deadline_exceeded("deadline exceeded")
        } else {
            return None;
        };
        Some(self.cause.get_or_init(|| status).clone())
    }

    /// Waits until the context is done and returns the cause.
    pub async fn done(&self) -> Status {
        if let Some(status) = self.err() {
            return status;
        }
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
        self.err()
            .unwrap_or_else(|| Status::cancelled("call canceled"))
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the context as used by a call.
    pub(crate) fn bind(&self) -> Result<()> {
        if self.bound.swap(true, Ordering::AcqRel) {
            Err(Status::internal("context is already bound to a call"))
        } else {
            Ok(())
        }
    }
}
