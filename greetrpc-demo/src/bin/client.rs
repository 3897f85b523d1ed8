use std::time::Duration;

use clap::Parser;
use greetrpc::{
    Client, ClientConfig, Code, Codec, Context, Status, Transport,
    services::{ChatMsg, GreetManyRequest, GreeterClient, HelloRequest, Name},
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:50051")]
    pub addr: std::net::SocketAddr,

    /// Name to greet.
    #[arg(short, long, default_value = "gopher")]
    pub name: String,

    /// Message encoding.
    #[arg(long, default_value = "message-pack")]
    pub codec: Codec,
}

fn report(what: &str, status: &Status) {
    tracing::error!("{what} failed: code={:?} msg={}", status.code(), status.message());
    if status.code() == Code::DeadlineExceeded {
        tracing::info!("hint: increase timeout or speed up server");
    }
}

async fn say_hello(client: &Client, name: &str) -> greetrpc::Result<()> {
    let ctx = Context::new(Some(Duration::from_secs(2))).with_metadata("x-client", "greetrpc-demo");
    let req = HelloRequest { name: name.into() };
    let reply = client.say_hello(&ctx, &req).await?;
    println!("{}", reply.message);
    Ok(())
}

async fn greet_many(client: &Client, name: &str) -> greetrpc::Result<()> {
    let ctx = Context::new(Some(Duration::from_secs(3)));
    let req = GreetManyRequest {
        name: format!("streamy {name}"),
    };
    let mut stream = client.greet_many(&ctx, &req).await?;
    while let Some(chunk) = stream.recv().await? {
        println!("chunk: {}", chunk.message);
    }
    Ok(())
}

async fn upload_names(client: &Client) -> greetrpc::Result<()> {
    let ctx = Context::new(Some(Duration::from_secs(2)));
    let mut call = client.upload_names(&ctx).await?;
    for value in ["Ada", "Brian", "Charlotte"] {
        call.send(&Name { value: value.into() }).await?;
    }
    let summary = call.close_and_recv().await?;
    println!("uploaded count: {}", summary.count);
    Ok(())
}

async fn chat(client: &Client) -> greetrpc::Result<()> {
    let ctx = Context::new(Some(Duration::from_secs(5)));
    let (mut tx, mut rx) = client.chat(&ctx).await?;
    for text in ["hi", "how are you?", "", "great, thanks", "bye"] {
        tx.send(&ChatMsg { text: text.into() }).await?;
        let Some(reply) = rx.recv().await? else {
            break;
        };
        println!("chat reply: {}", reply.text);
    }
    tx.close(None);
    // drain until the handler ends the call.
    while let Some(reply) = rx.recv().await? {
        println!("chat reply: {}", reply.text);
    }
    Ok(())
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let client = Client::new(
        ClientConfig {
            use_msgpack: args.codec == Codec::MessagePack,
        },
        Transport::tcp(args.addr),
    );

    if let Err(status) = say_hello(&client, &args.name).await {
        report("say_hello", &status);
        return;
    }
    if let Err(status) = greet_many(&client, &args.name).await {
        report("greet_many", &status);
    }
    if let Err(status) = upload_names(&client).await {
        report("upload_names", &status);
        return;
    }
    if let Err(status) = chat(&client).await {
        report("chat", &status);
    }

    client.transport().stop();
}
