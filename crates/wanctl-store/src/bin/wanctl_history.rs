//! History CLI — query the metrics store from the shell.
//!
//! `wanctl-history --db /var/lib/wanctl/metrics.db --range 1h --wan primary`

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;

use wanctl_store::{parse_duration, MetricsStore, QueryFilter, SummaryRow};

#[derive(Parser, Debug)]
#[command(name = "wanctl-history", about = "Query wanctl metrics history")]
struct Cli {
    /// Metrics database path.
    #[arg(long, default_value = "/var/lib/wanctl/metrics.db")]
    db: PathBuf,

    /// Relative range, e.g. 90s, 15m, 1h, 2d. Mutually exclusive with --from/--to.
    #[arg(long)]
    range: Option<String>,

    /// Range start (ISO-8601).
    #[arg(long)]
    from: Option<String>,

    /// Range end (ISO-8601, default now).
    #[arg(long)]
    to: Option<String>,

    /// Comma-separated metric names.
    #[arg(long)]
    metrics: Option<String>,

    /// WAN name filter.
    #[arg(long)]
    wan: Option<String>,

    #[arg(long)]
    limit: Option<u32>,

    #[arg(long)]
    offset: Option<u32>,

    /// Print min/avg/p95/p99/count per (wan, metric) instead of rows.
    #[arg(long, default_value_t = false)]
    summary: bool,

    /// Emit JSON instead of a table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let now = Utc::now();
    let (start, end) = resolve_range(&cli, now)?;

    let Some(store) = MetricsStore::open_readonly(&cli.db).await? else {
        // Missing database is empty history, not an error.
        if cli.json {
            println!("{}", serde_json::json!({ "data": [] }));
        } else {
            println!("no metrics database at {}", cli.db.display());
        }
        return Ok(());
    };

    let filter = QueryFilter {
        start_seconds: start.timestamp(),
        end_seconds: end.timestamp(),
        metrics: cli
            .metrics
            .as_deref()
            .map(|m| m.split(',').map(|s| s.trim().to_string()).collect()),
        wan: cli.wan.clone(),
        granularity: None,
        limit: cli.limit,
        offset: cli.offset,
    };

    if cli.summary {
        let summary = store.compute_summary(&filter).await?;
        print_summary(&summary, cli.json);
    } else {
        let (rows, total) = store.query_metrics(&filter).await?;
        if cli.json {
            let data: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "timestamp": iso(r.timestamp_seconds),
                        "wan_name": r.wan_name,
                        "metric_name": r.metric_name,
                        "value": r.value,
                        "labels": r.labels.as_deref().and_then(|l| serde_json::from_str::<serde_json::Value>(l).ok()),
                        "granularity": r.granularity,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({ "data": data, "total_count": total })
            );
        } else {
            println!(
                "{:<25} {:<10} {:<28} {:>14} {:<5}",
                "TIMESTAMP", "WAN", "METRIC", "VALUE", "GRAN"
            );
            for r in &rows {
                println!(
                    "{:<25} {:<10} {:<28} {:>14.3} {:<5}",
                    iso(r.timestamp_seconds),
                    r.wan_name,
                    r.metric_name,
                    r.value,
                    r.granularity
                );
            }
            println!("{} of {total} rows", rows.len());
        }
    }

    Ok(())
}

fn resolve_range(cli: &Cli, now: DateTime<Utc>) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    if let Some(range) = &cli.range {
        let dur = parse_duration(range)
            .ok_or_else(|| anyhow::anyhow!("invalid --range \"{range}\" (use e.g. 15m, 1h, 2d)"))?;
        let dur = chrono::Duration::from_std(dur)?;
        return Ok((now - dur, now));
    }
    let end = match &cli.to {
        Some(to) => to.parse::<DateTime<Utc>>()?,
        None => now,
    };
    let start = match &cli.from {
        Some(from) => from.parse::<DateTime<Utc>>()?,
        // Default window: the last hour.
        None => end - chrono::Duration::hours(1),
    };
    if start > end {
        anyhow::bail!("--from is after --to");
    }
    Ok((start, end))
}

fn print_summary(summary: &[SummaryRow], json: bool) {
    if json {
        let data: Vec<serde_json::Value> = summary
            .iter()
            .map(|s| {
                serde_json::json!({
                    "wan_name": s.wan_name,
                    "metric_name": s.metric_name,
                    "min": s.min,
                    "avg": s.avg,
                    "p95": s.p95,
                    "p99": s.p99,
                    "count": s.count,
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "summary": data }));
        return;
    }
    println!(
        "{:<10} {:<28} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "WAN", "METRIC", "MIN", "AVG", "P95", "P99", "COUNT"
    );
    for s in summary {
        println!(
            "{:<10} {:<28} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>8}",
            s.wan_name, s.metric_name, s.min, s.avg, s.p95, s.p99, s.count
        );
    }
}

fn iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}
