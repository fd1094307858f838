// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// LabelBridge agent.
//
// Entry point. Initialises logging and backend services, brings up the
// configured producers, then runs until Ctrl-C.

use std::process::ExitCode;

use labelbridge_agent::AgentServices;
use labelbridge_agent::services::data_dir;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "LabelBridge starting");

    let svc = match AgentServices::init(&data_dir::config_path()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "agent failed to start");
            return ExitCode::FAILURE;
        }
    };

    if let Some(tenant) = svc.config().stream.auto_connect_tenant {
        if let Err(e) = svc.connect_stream(tenant).await {
            tracing::warn!(tenant_id = %tenant, error = %e, "auto-connect failed");
        }
    }

    if svc.config().polling.auto_start {
        if let Err(e) = svc.start_polling() {
            tracing::warn!(error = %e, "auto-start polling failed");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C");
    }

    svc.shutdown().await;
    ExitCode::SUCCESS
}
