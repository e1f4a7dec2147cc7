// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::{env, path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{debug, error, info, warn, Instrument};
use tracing_subscriber::EnvFilter;

use run_telemetry::{
    cache::CacheStore,
    config::Config,
    logger,
    record::RecordKind,
    sender::{DrainOutcome, DrainReport},
    transport::HttpTransport,
    Sender,
};

/// Replays cached run telemetry to the tracking service.
#[derive(Parser, Debug)]
#[command(name = "run-telemetry-sender", version)]
struct Args {
    /// Cache root to drain (overrides RUN_TELEMETRY_CACHE_DIR)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Number of runs replayed concurrently (overrides RUN_TELEMETRY_MAX_WORKERS)
    #[arg(long, value_name = "N")]
    max_workers: Option<usize>,

    /// Retry runs that previously failed permanently
    #[arg(long)]
    retry_failed: bool,

    /// Record kinds to replay, e.g. `metric,event` (overrides RUN_TELEMETRY_REPLAY_KINDS)
    #[arg(long, value_name = "KINDS", value_delimiter = ',')]
    kinds: Vec<RecordKind>,

    /// trace, debug, info, warn or error (overrides RUN_TELEMETRY_LOG_LEVEL)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = args
        .log_level
        .clone()
        .or_else(|| env::var("RUN_TELEMETRY_LOG_LEVEL").ok())
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level '{log_level}': {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(logger::Formatter::new())
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    let config = match load_config(&args) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cache = match CacheStore::open(&config.cache_dir) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!(
                "Cannot open cache root {}: {e}",
                config.cache_dir.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let transport = Arc::new(HttpTransport::from_config(&config));
    let sender = Sender::new(Arc::clone(&config), cache, transport);

    let span = tracing::info_span!("drain", cache_dir = %config.cache_dir.display());
    match sender.drain().instrument(span).await {
        Ok(DrainOutcome::Busy { holder }) => {
            info!(
                "Lock held by pid {} since {}, exiting",
                holder.owner_pid, holder.acquired_at
            );
            ExitCode::SUCCESS
        }
        Ok(DrainOutcome::Completed(report)) => {
            log_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Drain aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config, run_telemetry::config::ConfigError> {
    let mut config = Config::from_env()?;
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(log_level) = &args.log_level {
        config.log_level = log_level.to_lowercase();
    }
    config.retry_failed |= args.retry_failed;
    if !args.kinds.is_empty() {
        config.replay_kinds = Some(args.kinds.clone());
    }
    config.validate()?;
    Ok(config)
}

fn log_summary(report: &DrainReport) {
    for run in report.runs.iter() {
        match &run.error {
            Some(e) => warn!("Run {} left in cache: {e}", run.run_id),
            None if run.skipped => debug!("Run {} skipped", run.run_id),
            None if run.held_back => info!(
                "Run {} has records of unselected kinds left in cache",
                run.run_id
            ),
            None => {}
        }
    }
    info!(
        "{} runs processed, {} records delivered, {} purged, {} failed",
        report.runs.len(),
        report.delivered(),
        report.purged(),
        report.failed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = Args::parse_from([
            "run-telemetry-sender",
            "--cache-dir",
            dir.path().to_str().unwrap(),
            "--max-workers",
            "2",
            "--retry-failed",
            "--log-level",
            "DEBUG",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.cache_dir, dir.path());
        assert_eq!(config.max_workers, 2);
        assert!(config.retry_failed);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_kinds_flag_selects_record_kinds() {
        let args = Args::parse_from(["run-telemetry-sender", "--kinds", "metric,alerts"]);
        let config = load_config(&args).unwrap();
        assert_eq!(
            config.replay_kinds,
            Some(vec![RecordKind::Metric, RecordKind::Alert])
        );

        assert!(Args::try_parse_from(["run-telemetry-sender", "--kinds", "logs"]).is_err());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let args = Args::parse_from(["run-telemetry-sender", "--max-workers", "0"]);
        assert!(load_config(&args).is_err());
    }
}
