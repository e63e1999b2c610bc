//! CLI entry point
//!
//! Configuration comes from the `METHOD`, `PASS`, and `PORT` environment
//! variables; the flags below override them.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use shadowsocks_ws_rust::crypto::CipherKind;
use shadowsocks_ws_rust::{Config, Server, VERSION};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shadowsocks-ws-rust")]
#[command(version = VERSION)]
#[command(about = "Shadowsocks AEAD tunnel server carried over WebSocket")]
struct Args {
    /// AEAD cipher method (overrides METHOD)
    #[arg(short, long)]
    method: Option<String>,

    /// Passphrase (overrides PASS)
    #[arg(long)]
    password: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("ssws-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shadowsocks_ws_rust=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("shadowsocks-ws-rust v{}", VERSION);

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Apply CLI overrides
    if let Some(ref method) = args.method {
        config.method = match CipherKind::try_from(method.as_str()) {
            Ok(m) => m,
            Err(e) => {
                error!("invalid configuration: {}", e);
                std::process::exit(1);
            }
        };
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
