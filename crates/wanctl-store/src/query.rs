//! Read path: filtered queries, granularity selection, summaries.

use std::time::Duration;

use sqlx::Row;

use wanctl_common::metrics::Granularity;

use crate::store::{MetricRow, MetricsStore, Result};

/// Hard cap on one page of history results.
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Query filters; `None` means unconstrained.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub start_seconds: i64,
    pub end_seconds: i64,
    pub metrics: Option<Vec<String>>,
    pub wan: Option<String>,
    pub granularity: Option<Granularity>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Aggregate summary per (wan, metric).
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub wan_name: String,
    pub metric_name: String,
    pub min: f64,
    pub avg: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: u64,
}

/// Pick the coarsest granularity that still yields a usable number of
/// points for the range: raw under an hour, 1m under a day, 5m under
/// a week, 1h beyond.
pub fn select_granularity(start_seconds: i64, end_seconds: i64) -> Granularity {
    let span = (end_seconds - start_seconds).max(0);
    if span < 3_600 {
        Granularity::Raw
    } else if span < 86_400 {
        Granularity::OneMinute
    } else if span < 7 * 86_400 {
        Granularity::FiveMinutes
    } else {
        Granularity::OneHour
    }
}

/// Parse `90s` / `15m` / `1h` / `2d` duration strings.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (value, unit) = s.split_at(s.len() - 1);
    let value: u64 = value.parse().ok()?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

impl MetricsStore {
    /// Filtered query, ordered by timestamp. Returns the page plus the
    /// unpaginated total so callers can report pagination metadata.
    pub async fn query_metrics(&self, filter: &QueryFilter) -> Result<(Vec<MetricRow>, u64)> {
        let granularity = filter
            .granularity
            .unwrap_or_else(|| select_granularity(filter.start_seconds, filter.end_seconds));
        let limit = filter.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0);

        let (where_clause, binds) = build_where(filter);

        let count_sql = format!("SELECT COUNT(*) AS n FROM metrics WHERE {where_clause}");
        let mut count_query = sqlx::query(&count_sql)
            .bind(filter.start_seconds)
            .bind(filter.end_seconds)
            .bind(granularity.as_str());
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total: i64 = count_query
            .fetch_one(self.pool())
            .await?
            .try_get("n")?;

        let rows_sql = format!(
            "SELECT timestamp_seconds, wan_name, metric_name, value, labels, granularity \
             FROM metrics WHERE {where_clause} \
             ORDER BY timestamp_seconds ASC, id ASC LIMIT ? OFFSET ?"
        );
        let mut rows_query = sqlx::query(&rows_sql)
            .bind(filter.start_seconds)
            .bind(filter.end_seconds)
            .bind(granularity.as_str());
        for bind in &binds {
            rows_query = rows_query.bind(bind);
        }
        rows_query = rows_query.bind(limit).bind(offset);

        let rows = rows_query.fetch_all(self.pool()).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MetricRow {
                timestamp_seconds: row.try_get("timestamp_seconds")?,
                wan_name: row.try_get("wan_name")?,
                metric_name: row.try_get("metric_name")?,
                value: row.try_get("value")?,
                labels: row.try_get("labels")?,
                granularity: row.try_get("granularity")?,
            });
        }
        Ok((out, total as u64))
    }

    /// min/avg/p95/p99/count per (metric, wan) over the filtered range.
    pub async fn compute_summary(&self, filter: &QueryFilter) -> Result<Vec<SummaryRow>> {
        let mut unlimited = filter.clone();
        unlimited.limit = Some(MAX_PAGE_SIZE);
        unlimited.offset = Some(0);
        let (rows, _) = self.query_metrics(&unlimited).await?;

        let mut groups: std::collections::BTreeMap<(String, String), Vec<f64>> =
            std::collections::BTreeMap::new();
        for row in rows {
            groups
                .entry((row.wan_name, row.metric_name))
                .or_default()
                .push(row.value);
        }

        let mut out = Vec::with_capacity(groups.len());
        for ((wan_name, metric_name), mut values) in groups {
            values.sort_by(|a, b| a.partial_cmp(b).expect("finite metric values"));
            let count = values.len() as u64;
            let min = values[0];
            let avg = values.iter().sum::<f64>() / count as f64;
            out.push(SummaryRow {
                wan_name,
                metric_name,
                min,
                avg,
                p95: percentile(&values, 0.95),
                p99: percentile(&values, 0.99),
                count,
            });
        }
        Ok(out)
    }
}

fn build_where(filter: &QueryFilter) -> (String, Vec<String>) {
    let mut clause =
        String::from("timestamp_seconds >= ? AND timestamp_seconds <= ? AND granularity = ?");
    let mut binds = Vec::new();
    if let Some(wan) = &filter.wan {
        clause.push_str(" AND wan_name = ?");
        binds.push(wan.clone());
    }
    if let Some(metrics) = &filter.metrics {
        if !metrics.is_empty() {
            let placeholders = vec!["?"; metrics.len()].join(", ");
            clause.push_str(&format!(" AND metric_name IN ({placeholders})"));
            binds.extend(metrics.iter().cloned());
        }
    }
    (clause, binds)
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricSample;
    use wanctl_common::metrics;

    async fn seeded_store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(&dir.path().join("metrics.db"))
            .await
            .unwrap();
        let samples: Vec<MetricSample> = (0..100)
            .map(|i| MetricSample::raw(1_000 + i, "primary", metrics::RTT_MS, 20.0 + i as f64))
            .collect();
        store.write_metrics_batch(&samples).await.unwrap();
        store
            .write_metric(&MetricSample::raw(1_050, "secondary", metrics::RTT_MS, 99.0))
            .await
            .unwrap();
        (dir, store)
    }

    #[test]
    fn granularity_selection_by_span() {
        assert_eq!(select_granularity(0, 1_800), Granularity::Raw);
        assert_eq!(select_granularity(0, 7_200), Granularity::OneMinute);
        assert_eq!(select_granularity(0, 2 * 86_400), Granularity::FiveMinutes);
        assert_eq!(select_granularity(0, 30 * 86_400), Granularity::OneHour);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("week"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("h"), None);
    }

    #[test]
    fn percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.99), 99.0);
        assert_eq!(percentile(&[42.0], 0.99), 42.0);
    }

    #[tokio::test]
    async fn query_filters_by_wan() {
        let (_dir, store) = seeded_store().await;
        let filter = QueryFilter {
            start_seconds: 0,
            end_seconds: 2_000,
            wan: Some("secondary".into()),
            granularity: Some(Granularity::Raw),
            ..Default::default()
        };
        let (rows, total) = store.query_metrics(&filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 99.0);
    }

    #[tokio::test]
    async fn pagination_reports_unpaginated_total() {
        let (_dir, store) = seeded_store().await;
        let filter = QueryFilter {
            start_seconds: 0,
            end_seconds: 2_000,
            granularity: Some(Granularity::Raw),
            limit: Some(10),
            offset: Some(20),
            ..Default::default()
        };
        let (rows, total) = store.query_metrics(&filter).await.unwrap();
        assert_eq!(total, 101);
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].timestamp_seconds, 1_020);
    }

    #[tokio::test]
    async fn metric_name_filter() {
        let (_dir, store) = seeded_store().await;
        let filter = QueryFilter {
            start_seconds: 0,
            end_seconds: 2_000,
            metrics: Some(vec![metrics::STATE.to_string()]),
            granularity: Some(Granularity::Raw),
            ..Default::default()
        };
        let (rows, total) = store.query_metrics(&filter).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn summary_shapes() {
        let (_dir, store) = seeded_store().await;
        let filter = QueryFilter {
            start_seconds: 0,
            end_seconds: 2_000,
            granularity: Some(Granularity::Raw),
            ..Default::default()
        };
        let summary = store.compute_summary(&filter).await.unwrap();
        assert_eq!(summary.len(), 2);
        let primary = summary
            .iter()
            .find(|s| s.wan_name == "primary")
            .expect("primary summary");
        assert_eq!(primary.count, 100);
        assert_eq!(primary.min, 20.0);
        assert!((primary.avg - 69.5).abs() < 1e-9);
        assert_eq!(primary.p95, 114.0);
    }
}
