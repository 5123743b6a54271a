use std::sync::Arc;

use clap::Parser;
use miette::Result;
use milter::MilterServer;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod handler;
mod injector;
mod policy;
mod socket;

use config::{Cfg, CfgLog, LogFormat, Overrides};
use injector::HeaderInjector;
use policy::SenderPolicy;

/// Milter that adds a Reply-To header to mail sent by local senders.
#[derive(Debug, Parser)]
#[command(name = "milter-replyto", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Protocol family to listen on (unix or tcp)
    #[arg(long)]
    proto: Option<String>,

    /// Address or unix domain socket path to bind to
    #[arg(long)]
    addr: Option<String>,

    /// Octal permission bits of the unix domain socket
    #[arg(long)]
    socket_mode: Option<String>,

    /// Value of the Reply-To header added to matching mail
    #[arg(long)]
    reply_to: Option<String>,

    /// Log filter directive, e.g. "debug" or "milter=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let overrides = Overrides {
        proto: args.proto,
        addr: args.addr,
        socket_mode: args.socket_mode,
        reply_to: args.reply_to,
        log_level: args.log_level,
    };
    let cfg = Cfg::load(args.config.as_deref(), &overrides)?;
    init_logging(&cfg.log);

    let policy = Arc::new(SenderPolicy::from_cfg(&cfg.policy)?);
    let injector = Arc::new(HeaderInjector::new(cfg.policy.reply_to.clone()));

    let listener = socket::bind(&cfg.server).await?;
    info!(
        proto = ?cfg.server.proto,
        addr = %cfg.server.addr,
        reply_to = injector.value(),
        "milter-replyto listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Only headers decide the verdict; the body is never inspected.
    let server = MilterServer::new(handler::factory(policy, injector)).body_limit(0);
    let result = server.serve(listener, shutdown).await;
    socket::cleanup(&cfg.server);
    result
}

fn init_logging(cfg: &CfgLog) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match cfg.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init(),
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
