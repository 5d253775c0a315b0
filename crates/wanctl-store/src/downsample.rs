//! Time-thresholded downsampling.
//!
//! raw → 1m after one hour, 1m → 5m after one day, 5m → 1h after
//! seven days. Buckets align to `(ts / bucket) * bucket`; numeric
//! metrics average, state/boolean metrics take the mode (ties break
//! toward the smaller value so a re-run over identical input
//! reproduces the same aggregate). Source rows are deleted after the
//! aggregated rows land, inside the same transaction.

use std::collections::HashMap;

use sqlx::Row;

use wanctl_common::metrics::{aggregation_for, Aggregation, Granularity};

use crate::store::{MetricsStore, Result};

/// Age before a granularity is rolled into the next coarser one.
fn age_threshold_seconds(source: Granularity) -> Option<i64> {
    match source {
        Granularity::Raw => Some(3_600),
        Granularity::OneMinute => Some(86_400),
        Granularity::FiveMinutes => Some(7 * 86_400),
        Granularity::OneHour => None,
    }
}

/// Run every due downsampling tier. Returns rows aggregated per tier.
pub async fn run_downsampling(store: &MetricsStore, now_seconds: i64) -> Result<u64> {
    let mut total = 0;
    for source in [
        Granularity::Raw,
        Granularity::OneMinute,
        Granularity::FiveMinutes,
    ] {
        total += downsample_tier(store, source, now_seconds).await?;
    }
    Ok(total)
}

/// Roll one granularity into the next coarser tier.
pub async fn downsample_tier(
    store: &MetricsStore,
    source: Granularity,
    now_seconds: i64,
) -> Result<u64> {
    let Some(age) = age_threshold_seconds(source) else {
        return Ok(0);
    };
    let Some(target) = source.next_coarser() else {
        return Ok(0);
    };
    let bucket = target
        .bucket_seconds()
        .expect("non-raw granularity has a bucket");
    let cutoff = now_seconds - age;

    let pool = store.pool().clone();
    let mut tx = pool.begin().await?;

    // Pull candidate rows grouped per (bucket, wan, metric, labels, value)
    // so both AVG and MODE can be computed from one pass.
    let rows = sqlx::query(
        "SELECT (timestamp_seconds / ?) * ? AS bucket, wan_name, metric_name, labels, \
                value, COUNT(*) AS n, SUM(value) AS sum \
         FROM metrics \
         WHERE granularity = ? AND timestamp_seconds < ? \
         GROUP BY bucket, wan_name, metric_name, labels, value",
    )
    .bind(bucket)
    .bind(bucket)
    .bind(source.as_str())
    .bind(cutoff)
    .fetch_all(&mut *tx)
    .await?;

    if rows.is_empty() {
        tx.rollback().await?;
        return Ok(0);
    }

    // (bucket, wan, metric, labels) → accumulated values.
    #[derive(Default)]
    struct Acc {
        sum: f64,
        count: i64,
        /// value → occurrences, for mode metrics.
        freq: Vec<(f64, i64)>,
    }
    let mut groups: HashMap<(i64, String, String, Option<String>), Acc> = HashMap::new();

    for row in &rows {
        let key = (
            row.try_get::<i64, _>("bucket")?,
            row.try_get::<String, _>("wan_name")?,
            row.try_get::<String, _>("metric_name")?,
            row.try_get::<Option<String>, _>("labels")?,
        );
        let value = row.try_get::<f64, _>("value")?;
        let n = row.try_get::<i64, _>("n")?;
        let sum = row.try_get::<f64, _>("sum")?;
        let acc = groups.entry(key).or_default();
        acc.sum += sum;
        acc.count += n;
        acc.freq.push((value, n));
    }

    let mut aggregated = 0u64;
    for ((bucket_ts, wan, metric, labels), acc) in groups {
        let value = match aggregation_for(&metric) {
            Aggregation::Avg => acc.sum / acc.count as f64,
            Aggregation::Mode => mode(&acc.freq),
        };
        sqlx::query(
            "INSERT INTO metrics \
             (timestamp_seconds, wan_name, metric_name, value, labels, granularity) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket_ts)
        .bind(&wan)
        .bind(&metric)
        .bind(value)
        .bind(&labels)
        .bind(target.as_str())
        .execute(&mut *tx)
        .await?;
        aggregated += 1;
    }

    // Source rows of this tier older than the threshold are replaced
    // by their aggregates.
    sqlx::query("DELETE FROM metrics WHERE granularity = ? AND timestamp_seconds < ?")
        .bind(source.as_str())
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::debug!(
        source = source.as_str(),
        target = target.as_str(),
        aggregated,
        "downsampling tier complete"
    );
    Ok(aggregated)
}

/// Most frequent value; ties break toward the smaller value.
fn mode(freq: &[(f64, i64)]) -> f64 {
    let mut best_value = 0.0;
    let mut best_count = 0i64;
    let mut sorted: Vec<(f64, i64)> = freq.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite metric values"));
    for &(value, count) in &sorted {
        if count > best_count {
            best_count = count;
            best_value = value;
        }
    }
    best_value
}
