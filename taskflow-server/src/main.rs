//! `Taskflow` reference server.
//!
//! Serves the task REST API and the notification WebSocket from memory.
//!
//! # Usage
//!
//! ```bash
//! # Run on the default address 127.0.0.1:8000
//! cargo run --bin taskflow-server
//!
//! # Custom address with a demo account (demo / demo)
//! cargo run --bin taskflow-server -- --bind 0.0.0.0:9100 --seed-demo
//! ```

use std::sync::Arc;

use clap::Parser;
use taskflow_server::api::{self, AppState};
use taskflow_server::config::{ServerCliArgs, ServerConfig};

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting taskflow server");

    let state = Arc::new(AppState::new());
    if let Some(demo) = &config.demo {
        match api::seed_demo(&state, &demo.username, &demo.password).await {
            Ok(user) => tracing::info!(user_id = %user.id, username = %user.username, "seeded demo account"),
            Err(e) => tracing::warn!(error = %e, "failed to seed demo account"),
        }
    }

    match api::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
