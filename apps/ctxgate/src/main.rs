use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::get;
use clap::Parser;
use tracing::info;

use ctxgate_common::GatewayConfigPatch;
use ctxgate_core::{JsonlSink, build_state};

mod cli;
mod dashboard;

const DRAIN_DEADLINE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();
    // Layering: dotenv credential store < process env < CLI flags.
    let mut patch = GatewayConfigPatch::from_dotenv();
    patch.overlay(GatewayConfigPatch::from_env());
    patch.overlay(args.into_patch());
    let config = patch.into_config()?;

    let state = build_state(config).map_err(|err| anyhow::anyhow!(err))?;
    if let Some(dir) = state.session.session_dir.clone() {
        state.events.add_sink(Arc::new(JsonlSink::new(dir))).await;
    }
    state.status.spawn_refresh();

    let app = ctxgate_core::handler::router(state.clone())
        .route("/costs", get(dashboard::serve))
        .route("/costs/{*path}", get(dashboard::serve));

    let bind = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "gateway.listening", bind = %bind, session = %state.session.session_id);

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                drain_rx.await.ok();
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    // Stop accepting, let in-flight requests finish, then force-close.
    info!(event = "gateway.draining", deadline_secs = DRAIN_DEADLINE_SECS);
    let _ = drain_tx.send(());
    if tokio::time::timeout(Duration::from_secs(DRAIN_DEADLINE_SECS), &mut server)
        .await
        .is_err()
    {
        server.abort();
    }

    state.compactor.shutdown();
    state.auth.stop_all().await;
    info!(event = "gateway.stopped");
    Ok(())
}
