use std::{
    io::IoSlice,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Codec, Context, Message, MsgFlags, MsgMeta, Result, Router, Status, TaskSupervisor,
    call::{CallHead, CallState, Frame, FrameReceiver, FrameSender, RawReceiver, RawSender},
};

/// Inbound side of one call multiplexed on a connection.
struct StreamEntry {
    inbound: FrameSender,
    call: Arc<CallState>,
    /// Cancels the handler; only set on the serving side.
    cancel: Option<CancellationToken>,
}

impl StreamEntry {
    /// Delivers the end of the inbound stream. A failure ends this side of
    /// the call right away, so blocked and later sends fail with it too.
    fn close(&self, status: Status) {
        let status = if status.is_ok() {
            status
        } else {
            self.call.peer_failed(status)
        };
        let _ = self.inbound.send(Frame::Close(status));
    }
}

/// A framed TCP connection carrying any number of concurrent calls.
///
/// The caller side opens calls with [`open_call`](Self::open_call); the
/// serving side has a router and runs a handler for every `Open` frame.
pub(crate) struct Connection {
    addr: SocketAddr,
    sender: mpsc::Sender<Bytes>,
    streams: DashMap<u64, StreamEntry, RandomState>,
    next_stream_id: AtomicU64,
    closed: CancellationToken,
    router: Option<Arc<Router>>,
}

impl Connection {
    pub fn start(
        stream: TcpStream,
        addr: SocketAddr,
        router: Option<Arc<Router>>,
        send_queue_size: usize,
        task_supervisor: &TaskSupervisor,
    ) -> Arc<Self> {
        let (recv_stream, send_stream) = stream.into_split();
        let (sender, receiver) = mpsc::channel(send_queue_size);
        let this = Arc::new(Self {
            addr,
            sender,
            streams: DashMap::default(),
            next_stream_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            router,
        });

        let guard = task_supervisor.start_async_task();
        tokio::spawn({
            let this = this.clone();
            async move {
                let result = tokio::select! {
                    () = guard.stopped() => Ok(()),
                    () = this.closed.cancelled() => Ok(()),
                    r = Self::start_send_loop(send_stream, receiver) => r,
                };
                if let Err(e) = result {
                    tracing::error!("send loop for {} failed: {e}", this.addr);
                }
                this.shutdown(Status::internal("connection closed"));
            }
        });

        let guard = task_supervisor.start_async_task();
        tokio::spawn({
            let this = this.clone();
            async move {
                let result = tokio::select! {
                    () = guard.stopped() => Ok(()),
                    () = this.closed.cancelled() => Ok(()),
                    r = this.start_recv_loop(recv_stream) => r,
                };
                if let Err(e) = result {
                    tracing::error!("recv loop for {} failed: {e}", this.addr);
                }
                this.shutdown(Status::internal("connection closed"));
            }
        });

        this
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Opens a call on this connection and returns the caller's halves.
    ///
    /// # Errors
    ///
    /// Fails with `Internal` if the connection is gone.
    pub async fn open_call(
        self: &Arc<Self>,
        head: &CallHead,
        ctx: &Context,
    ) -> Result<(RawSender, RawReceiver)> {
        let call = CallState::new(ctx.clone());
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.streams.insert(
            stream_id,
            StreamEntry {
                inbound: in_tx,
                call: call.clone(),
                cancel: None,
            },
        );

        let meta = MsgMeta {
            method: head.method.clone(),
            flags: MsgFlags::IsReq | MsgFlags::Open | head.codec.flags(),
            stream_id,
            shape: Some(head.shape),
            timeout_us: ctx
                .remaining()
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX)),
            metadata: ctx.metadata().clone(),
            status: None,
        };
        if let Err(e) = self.send(meta).await {
            self.streams.remove(&stream_id);
            return Err(e);
        }
        tracing::debug!("open {} as stream {stream_id} on {}", head.method, self.addr);

        tokio::spawn(self.clone().forward(stream_id, out_rx, call.clone(), head.codec));
        Ok((
            RawSender::new(out_tx, call.clone(), head.codec),
            RawReceiver::new(in_rx, call, head.codec, true),
        ))
    }

    async fn send(&self, meta: MsgMeta) -> Result<()> {
        self.send_message(Message::new(meta, Bytes::new())).await
    }

    async fn send_message(&self, msg: Message) -> Result<()> {
        let bytes = msg.encode()?;
        self.sender
            .send(bytes)
            .await
            .map_err(|_| Status::internal(format!("connection to {} closed", self.addr)))
    }

    /// Turns the frames of one outbound stream into wire frames.
    ///
    /// On the caller side it also reports a failed call to the handler with
    /// a `Cancel` frame, which may happen after the request stream ended.
    ///
    /// On the serving side the first frame carries the handler's response
    /// metadata.
    async fn forward(
        self: Arc<Self>,
        stream_id: u64,
        mut outbound: FrameReceiver,
        call: Arc<CallState>,
        codec: Codec,
    ) {
        let is_client = self.router.is_none();
        let direction = if is_client {
            MsgFlags::IsReq
        } else {
            MsgFlags::IsRsp
        };
        let flags = direction | codec.flags();
        let meta = |flags: MsgFlags, status: Option<Status>| MsgMeta {
            flags,
            stream_id,
            status,
            ..Default::default()
        };

        let mut ended = false;
        let mut first = true;
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv(), if !ended => {
                    let (mut msg, end) = match frame {
                        Some(Frame::Message(payload)) => {
                            (Message::new(meta(flags, None), payload), false)
                        }
                        Some(Frame::Close(status)) => {
                            let end = meta(flags | MsgFlags::End, Some(status));
                            (Message::new(end, Bytes::new()), true)
                        }
                        None => {
                            let status = Status::cancelled("stream dropped before close");
                            let end = meta(flags | MsgFlags::End, Some(status));
                            (Message::new(end, Bytes::new()), true)
                        }
                    };
                    if std::mem::take(&mut first) && !is_client {
                        msg.meta.metadata = call.ctx().take_response_metadata();
                    }
                    if self.send_message(msg).await.is_err() {
                        break;
                    }
                    ended = end;
                    if ended && !is_client {
                        break;
                    }
                }
                status = call.interrupted(), if is_client => {
                    if !status.is_ok() {
                        tracing::debug!("cancel stream {stream_id} on {}: {status}", self.addr);
                        let _ = self.send(meta(flags | MsgFlags::Cancel, Some(status))).await;
                    }
                    break;
                }
                () = self.closed.cancelled() => break,
            }
        }
        self.streams.remove(&stream_id);
    }

    fn handle(self: &Arc<Self>, msg: Message) {
        let Message { meta, payload } = msg;
        let stream_id = meta.stream_id;

        if meta.has(MsgFlags::Open) {
            self.handle_open(meta);
        } else if meta.has(MsgFlags::Cancel) {
            if let Some(entry) = self.streams.get(&stream_id)
                && let Some(cancel) = &entry.cancel
            {
                cancel.cancel();
            }
        } else if meta.has(MsgFlags::End) {
            let status = meta.status.unwrap_or_default();
            if self.router.is_none() {
                // the response stream ended, nothing else arrives for this call.
                if let Some((_, entry)) = self.streams.remove(&stream_id) {
                    entry.call.ctx().set_peer_metadata(meta.metadata);
                    entry.close(status);
                }
            } else if let Some(entry) = self.streams.get(&stream_id) {
                entry.close(status);
            }
        } else if let Some(entry) = self.streams.get(&stream_id) {
            if self.router.is_none() {
                entry.call.ctx().set_peer_metadata(meta.metadata);
            }
            let _ = entry.inbound.send(Frame::Message(payload));
        } else {
            tracing::debug!("drop frame for finished stream {stream_id} on {}", self.addr);
        }
    }

    fn handle_open(self: &Arc<Self>, meta: MsgMeta) {
        let stream_id = meta.stream_id;
        let codec = Codec::from_flags(meta.flags);
        let (Some(router), true, Some(shape)) = (&self.router, meta.is_req(), meta.shape) else {
            tracing::warn!("unexpected open frame for stream {stream_id} from {}", self.addr);
            let end = MsgMeta {
                flags: MsgFlags::IsRsp | MsgFlags::End | codec.flags(),
                stream_id,
                status: Some(Status::internal("invalid open frame")),
                ..Default::default()
            };
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.send(end).await;
            });
            return;
        };

        let method = meta.method;
        let ctx = Context::for_peer(meta.timeout_us.map(Duration::from_micros), meta.metadata);
        let call = CallState::new(ctx.clone());
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.streams.insert(
            stream_id,
            StreamEntry {
                inbound: in_tx,
                call: call.clone(),
                cancel: Some(ctx.cancel_token().clone()),
            },
        );
        tracing::debug!("serve {method} as stream {stream_id} from {}", self.addr);

        tokio::spawn(self.clone().forward(stream_id, out_rx, call.clone(), codec));
        let router = router.clone();
        tokio::spawn(async move {
            router
                .serve(
                    &method,
                    shape,
                    ctx,
                    RawReceiver::new(in_rx, call.clone(), codec, false),
                    RawSender::new(out_tx, call, codec),
                )
                .await;
        });
    }

    /// Fails every open call on this connection.
    fn shutdown(&self, status: Status) {
        self.closed.cancel();
        let stream_ids: Vec<u64> = self.streams.iter().map(|entry| *entry.key()).collect();
        for stream_id in stream_ids {
            if let Some((_, entry)) = self.streams.remove(&stream_id) {
                entry.close(status.clone());
                if let Some(cancel) = entry.cancel {
                    cancel.cancel();
                }
            }
        }
    }

    async fn start_recv_loop(self: &Arc<Self>, mut recv_stream: OwnedReadHalf) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(1 << 20);
        loop {
            if let Some(body) = Message::split_frame(&mut buffer)? {
                self.handle(Message::parse(body)?);
            } else {
                let n = recv_stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    tracing::debug!("connection {} reached eof", self.addr);
                    return Ok(());
                }
            }
        }
    }

    async fn start_send_loop(
        mut send_stream: OwnedWriteHalf,
        mut receiver: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        const LIMIT: usize = 64;
        let mut msgs = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut msgs, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (msg, io_slice) in msgs.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(msg);
            }

            let mut slices = &mut bufs[..msgs.len()];
            while !slices.is_empty() {
                let n = send_stream.write_vectored(slices).await?;
                if n == 0 {
                    return Err(Status::internal("connection closed while writing"));
                }
                IoSlice::advance_slices(&mut slices, n);
            }
            msgs.clear();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("streams", &self.streams.len())
            .finish()
    }
}
