//! In-process transport: the handler runs on its own task and the two
//! directions of the call are in-memory pipes.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    Context, Router,
    call::{CallHead, CallState, RawReceiver, RawSender},
};

/// Starts the handler for `head` and returns the caller's halves.
///
/// The handler's context shares the caller's deadline and metadata, and is
/// canceled as soon as the caller's side of the call ends. A failure closing
/// either side ends the other side with the same status.
pub(crate) fn open_call(
    router: &Arc<Router>,
    head: &CallHead,
    ctx: &Context,
) -> (RawSender, RawReceiver) {
    let client_call = CallState::new(ctx.clone());
    let server_ctx = ctx.for_local_peer(client_call.teardown_token().child_token());
    let server_call = CallState::new(server_ctx.clone());

    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (rsp_tx, rsp_rx) = mpsc::unbounded_channel();
    let codec = head.codec;

    tokio::spawn({
        let router = router.clone();
        let head = head.clone();
        let client_call = client_call.clone();
        let server_call = server_call.clone();
        async move {
            router
                .serve(
                    &head.method,
                    head.shape,
                    server_ctx,
                    RawReceiver::new(req_rx, server_call.clone(), codec, false),
                    RawSender::new(rsp_tx, server_call, codec).with_peer(client_call),
                )
                .await;
        }
    });

    (
        RawSender::new(req_tx, client_call.clone(), codec).with_peer(server_call),
        RawReceiver::new(rsp_rx, client_call, codec, true),
    )
}
