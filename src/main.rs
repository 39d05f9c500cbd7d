// SPDX-License-Identifier: Apache-2.0
mod build_info;
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use chatrelay_agent::{AgentConfig, HttpModelAdapter};
use chatrelay_core::{
    acknowledge_pending_restart, InboundUpdate, ProgressConfig, WorkerContext,
};
use chatrelay_store::{default_data_dir, FileSessionStore};
use chatrelay_transport_telegram::TelegramTransport;
use cli::{Cli, Commands};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use build_info::BUILD_INFO;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command_or_default() {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            return Ok(());
        }
        Commands::ShowConfig => {
            let config = chatrelay_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        Commands::Run => run(cli).await,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = chatrelay_config::load(cli.config.as_deref())
        .context("loading configuration")?;

    let data_dir = config
        .store
        .data_dir
        .clone()
        .unwrap_or_else(default_data_dir);
    let store = Arc::new(
        FileSessionStore::open(data_dir)
            .await
            .context("opening session store")?,
    );

    let bot_token = config
        .telegram
        .bot_token
        .clone()
        .or_else(|| std::env::var(&config.telegram.bot_token_env).ok())
        .context("no Telegram bot token configured (set telegram.bot_token or the configured env var)")?;
    let transport = Arc::new(TelegramTransport::new(
        &bot_token,
        config.telegram.poll_timeout_secs,
        store.clone(),
    ));

    let agent = Arc::new(HttpModelAdapter::new(AgentConfig {
        base_url: std::env::var("CHATRELAY_AGENT_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8900".to_string()),
        api_key: std::env::var("CHATRELAY_AGENT_API_KEY").ok(),
    }));

    let worker = WorkerContext::with_restart_hook(
        agent,
        transport.clone(),
        store.clone(),
        config.turn.max_concurrent_topics,
        config.turn.max_queue_size,
        config.session.max_concurrent,
        config.session.idle_timeout_ms,
        config.session.retry_attempts,
        config.turn.relay_timeout_ms,
        ProgressConfig {
            first_ms: config.progress.first_ms,
            every_ms: config.progress.every_ms,
            max_count: config.progress.max_count,
        },
        config.session.default_workspace_path.clone(),
        BUILD_INFO.to_string(),
        Some(Box::new(|chat_id: &str, thread_id: Option<&str>| {
            tracing::warn!(chat_id, thread_id, "restart requested, exiting for the supervisor to restart us");
            // The worker already awaited the "restarting…" send before
            // invoking this hook; this delay just gives the transport's
            // own outbound buffering a moment to flush before we exit.
            tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                std::process::exit(0);
            });
        })),
    );

    acknowledge_pending_restart(store.as_ref(), transport.as_ref(), "Restart complete.")
        .await
        .context("acknowledging pending restart")?;

    let cancel = CancellationToken::new();

    let admin_handle = if config.admin.enabled {
        let router = chatrelay_admin::build_router(store.clone(), worker.clone());
        let bind = config.admin.bind.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::error!(%bind, error = %err, "failed to bind admin surface");
                    return;
                }
            };
            info!(%bind, "admin surface listening");
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
        }))
    } else {
        None
    };

    let (tx, mut rx) = mpsc::channel::<InboundUpdate>(256);
    let poll_cancel = cancel.clone();
    let poll_transport = transport.clone();
    let poll_handle = tokio::spawn(async move {
        poll_transport.run(tx, poll_cancel).await;
    });

    let dispatch_worker = worker.clone();
    let dispatch_handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            dispatch_worker.on_update(update).await;
        }
    });

    info!("chat relay worker started");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    cancel.cancel();
    let _ = poll_handle.await;
    drop(dispatch_handle);
    if let Some(handle) = admin_handle {
        let _ = handle.await;
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Logging is always on for this worker — there is no TUI mode to protect
/// from stderr corruption, so verbosity maps straight onto a level filter,
/// deferring to `RUST_LOG` when it's set.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
