// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::process::ExitCode;

use anyhow::{Context, Result};
use soulseek_client_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    client::client::SoulseekClient,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Exit codes: 0 success, 1 fatal configuration, 2 login rejection.
#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        },
    };

    let _logger_guard = init_logger("config/logger.yaml").ok();

    match run(cfg).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        },
    }
}

fn load_config() -> Result<Config> {
    resolve_config_path("config/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")
}

async fn run(cfg: Config) -> Result<ExitCode> {
    let client = SoulseekClient::new(cfg);
    let cancel = CancellationToken::new();

    client
        .connect(&cancel)
        .await
        .context("failed to reach the server")?;

    let login = client.login(&cancel).await.context("login exchange failed")?;
    if !login.success {
        eprintln!("login rejected: {}", login.message);
        return Ok(ExitCode::from(2));
    }
    info!("logged in: {}", login.message);

    // Demo: run one search from argv and print what comes back.
    if let Some(query) = std::env::args().nth(1) {
        let mut results = client.search(&query, None, &cancel).await?;
        while let Some(response) = results.next().await {
            for file in &response.files {
                println!(
                    "{}\t{}\t{} bytes",
                    response.username, file.filename, file.size
                );
            }
        }
        info!(
            "search complete: {} responses, {} files",
            results.session().response_count(),
            results.session().file_count()
        );
    }

    client.disconnect().await;
    Ok(ExitCode::SUCCESS)
}
