use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use tollgate::cli::{self, Cli, Command};
use tollgate::config::Config;
use tollgate::ledger::{Ledger, RequestRecord};
use tollgate::pricing::PricingTable;
use tollgate::server::{self, AppState};
use tollgate::tui;
use tollgate::util::{self, fmt_cost, fmt_latency, fmt_model_column, fmt_tokens};

#[actix_web::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Init { output, force }) = &cli.command {
        return cli::run_init(output, *force);
    }

    // defaults → file → env → flags (clap folds env into the flag values).
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        cfg.proxy.port = port;
    }
    if let Some(target) = &cli.target {
        cfg.proxy.target = target.clone();
    }

    let pricing = Arc::new(PricingTable::default());
    let (models, fallback) = cfg.pricing_overrides();
    if models.is_some() || fallback.is_some() {
        pricing.apply(models, fallback);
    }

    let ledger = Arc::new(Ledger::new());

    if cli.headless {
        util::init_tracing();
        ledger.set_on_record(headless_log);
    }

    let state = AppState::new(
        cfg.proxy.target.clone(),
        cfg.proxy_timeout(),
        pricing,
        ledger.clone(),
    );
    let server = server::bind(state, cfg.proxy.port)?;
    let handle = server.handle();
    let mut server_task = tokio::spawn(server);

    if cli.headless {
        eprintln!(
            "tollgate proxy listening on :{} → {} (ctrl-c to stop)",
            cfg.proxy.port, cfg.proxy.target
        );
        tokio::select! {
            res = &mut server_task => res??,
            _ = shutdown_signal() => {
                handle.stop(true).await;
                let _ = server_task.await;
            }
        }
        return Ok(());
    }

    let proxy_addr = format!("localhost:{}", cfg.proxy.port);
    let target = cfg.proxy.target.clone();
    let dashboard = tokio::task::spawn_blocking(move || tui::run(ledger, proxy_addr, target));
    let result = dashboard.await?;

    handle.stop(true).await;
    let _ = server_task.await;
    result
}

/// One stable-column line per recorded request, written straight to stderr.
fn headless_log(r: &RequestRecord) {
    let status = match &r.error {
        Some(_) => "ERR".to_string(),
        None => r.status.to_string(),
    };
    eprintln!(
        "{}  {}  {:>6} in  {:>6} out  {:>8}  {:>6}  {}",
        r.timestamp.format("%H:%M:%S"),
        fmt_model_column(&r.model, 22),
        fmt_tokens(r.input_tokens),
        fmt_tokens(r.output_tokens),
        fmt_cost(r.cost),
        fmt_latency(r.latency),
        status,
    );
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
