mod cache;
mod cname;
mod config;
mod engine;
mod matcher;
mod policy;
mod proto_utils;
mod reload;
mod server;
mod upstream;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::ResponseCache;
use crate::engine::Engine;
use crate::reload::ConfigManager;
use crate::server::{ListenerState, ServerReloadListener};

#[derive(Parser, Debug)]
#[command(author, version, about = "steerdns: caching DNS forwarder steering domains onto CDN prefixes", long_about = None)]
struct Args {
    /// 配置文件路径（YAML）
    #[arg(short = 'c', long = "config", default_value = "config/config.yaml")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        std::env::current_dir()
            .context("resolve working directory")?
            .join(&args.config)
    };

    let manager = Arc::new(ConfigManager::new(config_path).context("load initial config")?);
    let cfg = manager.current();

    let cache = Arc::new(ResponseCache::new(cfg.cache_size, cfg.cache_ttl));
    let engine = Engine::new(manager.shared(), Arc::clone(&cache)).context("init engine")?;

    let socket = server::bind_udp(cfg.listen).context("bind listener")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server::run_listener(
        Arc::new(socket),
        engine.clone(),
        shutdown_rx,
    ));
    let state = Arc::new(Mutex::new(ListenerState {
        addr: cfg.listen,
        shutdown: shutdown_tx,
        handle: Some(handle),
    }));

    manager.add_listener(Arc::new(ServerReloadListener::new(
        engine,
        cache,
        Arc::clone(&state),
    )));
    manager.start_watching().context("start config watcher")?;

    info!(
        listen = %cfg.listen,
        upstream = %cfg.upstream,
        workers = cfg.workers,
        cdn_prefixes = cfg.cdn_ips.len(),
        domain_rules = cfg.domains.len(),
        "dns forwarder started"
    );

    wait_for_signal().await;
    info!("shutting down");

    manager.stop_watching();
    let handle = {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = guard.shutdown.send(true);
        guard.handle.take()
    };
    if let Some(handle) = handle {
        let _ = handle.await;
    }

    info!("dns forwarder stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
