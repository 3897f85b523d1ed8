//! # greetrpc
//!
//! Four-shape RPC calls (unary, server stream, client stream and bidi
//! stream) with per-call deadlines, cancellation and metadata, and a closed
//! status taxonomy shared by both sides of a call.
//!
//! Services are traits annotated with [`service`]; a [`Router`] maps method
//! names to handlers on the serving side and a [`Client`] opens calls on a
//! [`Transport`], either in the same process or over TCP.

#![forbid(unsafe_code)]

pub use greetrpc_macro::service;

mod status;
pub use status::{Code, Result, Status};

mod metadata;
pub use metadata::Metadata;

mod context;
pub use context::Context;

mod codec;
pub use codec::Codec;

mod msg;
pub use msg::{Message, MsgFlags, MsgMeta};

mod call;

pub mod stream;
pub use stream::{RecvStream, SendStream};

mod router;
pub use router::{MethodInfo, Router, Shape};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod local;
mod tcp;
pub use tcp::TcpTransport;

mod transport;
pub use transport::Transport;

mod client;
pub use client::{Client, ClientConfig, ClientStreamingCall};

mod listener;
pub use listener::Listener;

mod server;
pub use server::{Server, ServerConfig};

pub mod services;
