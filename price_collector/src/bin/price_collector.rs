use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Duration;
use clap::{Args, Parser, Subcommand};
use price_collector::{
    app::Collector,
    config::{CollectorConfig, load_config_path},
    db::{Db, migrate},
    granularity::Granularity,
    logging::{LogFormat, init_logging},
    query,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Minute price collector")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct ConfigArg {
    #[arg(long, value_name = "FILE", default_value = "collector.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Cmd {
    /// Collect every minute until Ctrl-C.
    Run(ConfigArg),
    /// One tick for the current minute.
    CollectOnce(ConfigArg),
    RefreshPriorities(ConfigArg),
    /// Retry due gap-queue entries once.
    Drain(ConfigArg),
    /// Health report as JSON.
    Status(ConfigArg),
    Migrate(ConfigArg),
    Runs {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    History {
        #[command(flatten)]
        cfg: ConfigArg,
        #[arg(long)]
        asset: String,
        #[arg(long, default_value = "minute")]
        granularity: Granularity,
        #[arg(long, default_value_t = 60)]
        since_minutes: i64,
    },
}

fn load(arg: &ConfigArg) -> Result<CollectorConfig> {
    load_config_path(&arg.config).with_context(|| format!("loading {}", arg.config.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            token.cancel();
        }
    });
}

/// Hydrates priorities, refreshing when nothing is stored yet.
async fn ensure_priorities(app: &Collector) -> Result<()> {
    if app.priorities.load()? == 0 {
        match app.scheduler.refresh_priorities().await {
            Some(Ok(report)) => info!(assets = report.assets, "priorities refreshed"),
            Some(Err(e)) => warn!(error = %e, "priority refresh failed"),
            None => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env(), "info")?;
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    match cli.cmd {
        Cmd::Run(arg) => {
            let app = Collector::from_config(&load(&arg)?)?;
            cancel_on_ctrl_c(cancel.clone());
            app.scheduler.clone().run(cancel).await?;
        }
        Cmd::CollectOnce(arg) => {
            let app = Collector::from_config(&load(&arg)?)?;
            cancel_on_ctrl_c(cancel.clone());
            ensure_priorities(&app).await?;
            let outcome = app.scheduler.tick(&cancel).await?;
            print_json(&outcome)?;
        }
        Cmd::RefreshPriorities(arg) => {
            let app = Collector::from_config(&load(&arg)?)?;
            match app.scheduler.refresh_priorities().await {
                Some(res) => print_json(&res?)?,
                None => bail!("a refresh is already running"),
            }
        }
        Cmd::Drain(arg) => {
            let app = Collector::from_config(&load(&arg)?)?;
            cancel_on_ctrl_c(cancel.clone());
            ensure_priorities(&app).await?;
            match app.scheduler.drain_once(&cancel).await? {
                Some(report) => print_json(&report)?,
                None => bail!("a collection run is in flight"),
            }
        }
        Cmd::Status(arg) => {
            let db = Db::open_existing(&load(&arg)?.database_url)?;
            let report = query::health(&db, chrono::Utc::now())?;
            print_json(&report)?;
            if !report.is_healthy() {
                std::process::exit(2);
            }
        }
        Cmd::Migrate(arg) => {
            let cfg = load(&arg)?;
            migrate::run_sqlite(&cfg.database_url)?;
            info!(database = %cfg.database_url, "migrations applied");
        }
        Cmd::Runs { cfg, limit } => {
            let db = Db::open_existing(&load(&cfg)?.database_url)?;
            print_json(&query::recent_runs(&db, limit)?)?;
        }
        Cmd::History {
            cfg,
            asset,
            granularity,
            since_minutes,
        } => {
            let db = Db::open_existing(&load(&cfg)?.database_url)?;
            let to = chrono::Utc::now();
            let from = to - Duration::minutes(since_minutes);
            let rows = query::snapshots(&db, granularity, &asset.to_lowercase(), from, to)?;
            print_json(&rows)?;
        }
    }

    Ok(())
}
