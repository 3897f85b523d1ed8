use std::sync::Arc;

use clap::Parser;
use greetrpc::{
    Router, Server, ServerConfig,
    services::{Greeter, GreeterConfig, GreeterImpl},
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:50051")]
    pub addr: std::net::SocketAddr,

    /// Number of greetings per GreetMany call.
    #[arg(long, default_value_t = 5)]
    pub count: u32,

    /// Delay between two GreetMany greetings.
    #[arg(long, default_value = "300ms")]
    pub pacing: humantime::Duration,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let greeter = Arc::new(GreeterImpl::new(GreeterConfig {
        count: args.count,
        pacing: args.pacing.into(),
    }));
    let mut router = Router::default();
    greeter.greetrpc_export(&mut router);

    let server = match Server::create(router, &ServerConfig::default()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("create server failed: {e}");
            std::process::exit(1);
        }
    };
    let addr = match server.listen(args.addr).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("listen on {} failed: {e}", args.addr);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Serving {} on {addr}...",
        <GreeterImpl as Greeter>::NAME,
    );

    tokio::select! {
        () = server.join() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.stop();
            server.join().await;
        }
    }
}
