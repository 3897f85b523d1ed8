//! Built-in RPC services.
//!
//! - [`Greeter`]: the greet service in all four call shapes
//! - [`MetaService`]: introspection, registered by [`Router::build`](crate::Router::build)

mod greeter;
pub use greeter::{
    ChatMsg, GreetChunk, GreetManyRequest, Greeter, GreeterClient, GreeterConfig, GreeterImpl,
    HelloReply, HelloRequest, Name, Summary,
};

mod meta_service;
pub use meta_service::{MetaService, MetaServiceClient, MetaServiceImpl};
