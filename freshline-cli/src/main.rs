//! Freshline CLI: collection, backfill and freshness commands.
//!
//! Commands:
//! - `collect`: incremental (or `--force`) collection of one or all sources
//! - `backfill`: gap detection and two-phase backfill of a date-point source
//! - `sentinels`: choose a new sentinel sample with fresh baselines
//! - `check`: re-fetch the sentinels and raise the freshness flag on change
//! - `update`: full collection of flagged sources, then clear the flag
//! - `status`: freshness, tracking and quota per source
//!
//! Per-entity failures are reported in the run summary and never change the
//! exit code; only configuration and other fatal errors do.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use freshline_core::domain::NaiveDateRange;
use freshline_core::gap::BackfillConfig;
use freshline_runner::{
    CheckReport, FreshlineConfig, RunOptions, RunSummary, Runner, SelectionReport, SourceStatus,
    UpdateOutcome,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "freshline",
    about = "Freshline: incremental collection and freshness engine"
)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, global = true, default_value = "freshline.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which sources a command applies to.
#[derive(Args)]
struct Target {
    /// Source id from the configuration.
    #[arg(long, conflicts_with = "all")]
    source: Option<String>,

    /// Every configured source.
    #[arg(long, default_value_t = false)]
    all: bool,
}

/// Narrowing to fit a request budget.
#[derive(Args)]
struct Narrow {
    /// Only entities whose id starts with this prefix.
    #[arg(long)]
    filter: Option<String>,

    /// At most this many entities.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect new data, resuming each entity from its last synced point.
    Collect {
        #[command(flatten)]
        target: Target,

        /// First date to collect (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Last date to collect (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Refill the full history instead of resuming.
        #[arg(long, default_value_t = false)]
        force: bool,

        #[command(flatten)]
        narrow: Narrow,
    },
    /// Catch up to the newest upstream date, then fill historical gaps.
    Backfill {
        /// Source id from the configuration.
        #[arg(long)]
        source: String,

        /// Lookback window scanned for gaps, in days.
        #[arg(
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(BackfillConfig::MAX_DAYS))
        )]
        max_days: Option<u32>,

        /// Most missing dates fetched in one run.
        #[arg(long)]
        max_fills: Option<u32>,

        #[command(flatten)]
        narrow: Narrow,
    },
    /// Choose and persist a new sentinel sample.
    Sentinels {
        /// Source id from the configuration.
        #[arg(long)]
        source: String,

        /// Sample size. Defaults to the configured size.
        #[arg(long)]
        size: Option<usize>,
    },
    /// Compare the sentinels against their baselines.
    Check {
        #[command(flatten)]
        target: Target,
    },
    /// Run a full collection for sources flagged as changed.
    Update {
        #[command(flatten)]
        target: Target,
    },
    /// Show freshness, tracking and quota per source.
    Status {
        /// Source id. Defaults to every configured source.
        #[arg(long)]
        source: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FreshlineConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(path = %cli.config.display(), sources = config.sources.len(), "loaded config");
    let runner = Runner::new(config);
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Collect {
            target,
            start,
            end,
            force,
            narrow,
        } => {
            let opts = RunOptions {
                force,
                range: parse_range(start.as_deref(), end.as_deref())?,
                filter: narrow.filter,
                limit: narrow.limit,
                backfill: None,
            };
            run_collect(&runner, &target, &opts, &out)
        }
        Commands::Backfill {
            source,
            max_days,
            max_fills,
            narrow,
        } => {
            let limits = runner.config().source(&source)?.backfill.limits();
            let opts = RunOptions {
                filter: narrow.filter,
                limit: narrow.limit,
                backfill: Some(BackfillConfig {
                    max_days: max_days.unwrap_or(limits.max_days),
                    max_fills: max_fills.unwrap_or(limits.max_fills),
                }),
                ..RunOptions::default()
            };
            let summary = runner.backfill_source(&source, &opts)?;
            out.summary(&summary)
        }
        Commands::Sentinels { source, size } => {
            let report = runner.select_sentinels(&source, size)?;
            out.selection(&report)
        }
        Commands::Check { target } => {
            for id in target.sources(&runner)? {
                let report = runner.check_source(&id)?;
                out.check(&report)?;
            }
            Ok(())
        }
        Commands::Update { target } => {
            for id in target.sources(&runner)? {
                let outcome = runner.update_source(&id)?;
                out.update(&id, &outcome)?;
            }
            Ok(())
        }
        Commands::Status { source } => {
            let statuses = match source {
                Some(id) => vec![runner.source_status(&id)?],
                None => runner.status_all()?,
            };
            for status in &statuses {
                out.status(status)?;
            }
            Ok(())
        }
    }
}

impl Target {
    fn sources(&self, runner: &Runner) -> Result<Vec<String>> {
        match (&self.source, self.all) {
            (Some(id), false) => Ok(vec![id.clone()]),
            (None, true) => Ok(runner
                .config()
                .sources
                .iter()
                .map(|s| s.id.to_string())
                .collect()),
            _ => bail!("one of --source or --all is required"),
        }
    }
}

fn run_collect(runner: &Runner, target: &Target, opts: &RunOptions, out: &Output) -> Result<()> {
    if !target.all {
        let Some(id) = &target.source else {
            bail!("one of --source or --all is required");
        };
        let summary = runner.collect_source(id, opts)?;
        return out.summary(&summary);
    }

    let mut fatal = Vec::new();
    for (source, result) in runner.collect_all(opts) {
        match result {
            Ok(summary) => out.summary(&summary)?,
            Err(e) => {
                eprintln!("{source}: {e}");
                fatal.push(source.to_string());
            }
        }
    }
    if !fatal.is_empty() {
        bail!("{} source(s) aborted: {}", fatal.len(), fatal.join(", "));
    }
    Ok(())
}

/// `--start`/`--end` into a range. `--end` alone is rejected; `--start`
/// alone runs to today.
fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<Option<NaiveDateRange>> {
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
    };
    let Some(start) = start.map(parse).transpose()? else {
        if end.is_some() {
            bail!("--end requires --start");
        }
        return Ok(None);
    };
    let end = end
        .map(parse)
        .transpose()?
        .unwrap_or_else(|| Utc::now().date_naive());
    if start > end {
        bail!("--start {start} is after --end {end}");
    }
    Ok(Some(NaiveDateRange::new(start, end)))
}

struct Output {
    json: bool,
}

impl Output {
    fn emit_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn summary(&self, summary: &RunSummary) -> Result<()> {
        if self.json {
            return self.emit_json(summary);
        }
        println!("{}", summary.headline());
        for unit in summary.failures() {
            println!(
                "  {} {}: {}",
                unit.key,
                unit.failure.map(|k| k.as_str()).unwrap_or("failed"),
                unit.error.as_deref().unwrap_or("")
            );
        }
        for (category, report) in &summary.backfill {
            println!(
                "  {category}: {} caught up, {} of {} gaps filled, {} without data, {} deferred{}",
                report.forward_filled.len(),
                report.filled.len(),
                report.missing_before,
                report.empty.len(),
                report.deferred,
                if report.quota_exhausted {
                    " (quota exhausted)"
                } else {
                    ""
                }
            );
            for (date, reason) in report.forward_failed.iter().chain(&report.failed) {
                println!("    {date}: {reason}");
            }
        }
        if !summary.deferred.is_empty() {
            println!("  {} entities deferred to the next run", summary.deferred.len());
        }
        Ok(())
    }

    fn selection(&self, report: &SelectionReport) -> Result<()> {
        if self.json {
            return self.emit_json(report);
        }
        match &report.error {
            Some(e) => println!("{}: sentinel selection not saved: {e}", report.source),
            None => println!(
                "{}: {} sentinels ({} aggregate, {} diverse, {} random), {} with baseline",
                report.source,
                report.selected,
                report.aggregate,
                report.diverse,
                report.random,
                report.with_baseline
            ),
        }
        Ok(())
    }

    fn check(&self, report: &CheckReport) -> Result<()> {
        if self.json {
            return self.emit_json(report);
        }
        match &report.error {
            Some(e) => println!("{}: check failed: {e}", report.source),
            None => println!(
                "{}: {} of {} sentinels changed ({} responded), state {}",
                report.source,
                report.changed,
                report.sentinels,
                report.responded,
                report.status.state.as_str()
            ),
        }
        Ok(())
    }

    fn update(&self, source: &str, outcome: &UpdateOutcome) -> Result<()> {
        match outcome {
            UpdateOutcome::AlreadyFresh(status) => {
                if self.json {
                    return self.emit_json(status);
                }
                println!("{source}: fresh, nothing to update");
            }
            UpdateOutcome::Updated {
                summary,
                cleared,
                baselines_refreshed,
            } => {
                self.summary(summary)?;
                if !self.json {
                    if *cleared {
                        println!("  flag cleared, {baselines_refreshed} baselines refreshed");
                    } else {
                        println!("  incomplete, source stays flagged");
                    }
                }
            }
        }
        Ok(())
    }

    fn status(&self, status: &SourceStatus) -> Result<()> {
        if self.json {
            return self.emit_json(status);
        }
        let point = |p: Option<freshline_core::SyncPoint>| {
            p.map(|p| p.encode()).unwrap_or_else(|| "-".to_string())
        };
        println!("{}", status.source);
        println!("  state:        {}", status.freshness.state.as_str());
        if let Some(at) = status.freshness.last_checked_at {
            println!(
                "  last check:   {} ({} changed)",
                at.format("%Y-%m-%d %H:%M"),
                status.freshness.last_change_count
            );
        }
        println!(
            "  tracked keys: {} (oldest {}, newest {})",
            status.tracked_keys,
            point(status.oldest_point),
            point(status.newest_point)
        );
        println!("  observations: {}", status.observations);
        println!(
            "  quota today:  {} / {}",
            status.quota_spent_today, status.daily_quota
        );
        println!("  sentinels:    {}", status.sentinels);
        if let Some(run) = &status.last_run {
            println!("  last run:     {}", run.headline());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_days_outside_the_supported_window_is_refused() {
        let parse = |days: &str| {
            Cli::try_parse_from(["freshline", "backfill", "--source", "s", "--max-days", days])
        };
        assert!(parse("30").is_ok());
        assert!(parse("0").is_err());
        assert!(parse("4294967295").is_err());
    }

    #[test]
    fn end_without_start_is_refused() {
        assert!(parse_range(None, Some("2024-01-10")).is_err());
        assert!(parse_range(Some("2024-01-10"), Some("2024-01-01")).is_err());
        let range = parse_range(Some("2024-01-01"), Some("2024-01-10")).unwrap();
        assert_eq!(range.map(|r| r.end.to_string()), Some("2024-01-10".to_string()));
    }
}
