// Analytics Aggregator - folds raw telemetry into daily rollups and enforces
// the retention window over raw rows.
//
// Rollups are upserted with overwrite semantics, so re-aggregating a date is
// idempotent. Retention deletion only runs after aggregation for the same
// window (see run_nightly), because deleting unaggregated raw rows would lose
// that day's detail permanently.

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Clone)]
pub struct AnalyticsAggregator {
    db_pool: PgPool,
    retention_days: i64,
}

/// One raw telemetry row, as read for aggregation.
type RawEventRow = (Uuid, Uuid, Uuid, String, Option<String>);

/// Per-(clinic, product, form) counters for one day.
#[derive(Debug, Clone, Default, PartialEq)]
struct DayTotals {
    views: i64,
    conversions: i64,
    /// Stage name -> drop-off count; BTreeMap so the serialized jsonb is
    /// deterministic regardless of event order.
    stages: BTreeMap<String, i64>,
}

/// Combined funnel counters for a query range.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FunnelReport {
    pub views: i64,
    pub conversions: i64,
    pub dropoff_stages: BTreeMap<String, i64>,
}

impl FunnelReport {
    fn absorb(&mut self, other: FunnelReport) {
        self.views += other.views;
        self.conversions += other.conversions;
        for (stage, count) in other.dropoff_stages {
            *self.dropoff_stages.entry(stage).or_default() += count;
        }
    }
}

fn fold_events(rows: &[RawEventRow]) -> BTreeMap<(Uuid, Uuid, Uuid), DayTotals> {
    let mut grouped: BTreeMap<(Uuid, Uuid, Uuid), DayTotals> = BTreeMap::new();

    for (clinic_id, product_id, form_id, event_type, dropoff_stage) in rows {
        let totals = grouped
            .entry((*clinic_id, *product_id, *form_id))
            .or_default();

        match event_type.as_str() {
            "view" => totals.views += 1,
            "conversion" => totals.conversions += 1,
            "dropoff" => {
                let stage = dropoff_stage.clone().unwrap_or_else(|| "unknown".to_string());
                *totals.stages.entry(stage).or_default() += 1;
            }
            _ => {}
        }
    }

    grouped
}

/// First calendar day still served from raw events. Both the retention sweep
/// and the read path derive their boundary from this, so a date is either
/// wholly raw or wholly rolled up, never split mid-day.
fn retention_boundary(today: NaiveDate, retention_days: i64) -> NaiveDate {
    today - Duration::days(retention_days)
}

/// Split a query range at the retention boundary: dates on or after the
/// boundary read from raw events, older dates read from rollups. The boundary
/// day itself belongs to exactly one tier (raw), never both.
fn split_range(
    from: NaiveDate,
    to: NaiveDate,
    boundary: NaiveDate,
) -> (Option<(NaiveDate, NaiveDate)>, Option<(NaiveDate, NaiveDate)>) {
    if from > to {
        return (None, None);
    }

    let rollup = if from < boundary {
        Some((from, to.min(boundary - Duration::days(1))))
    } else {
        None
    };

    let raw = if to >= boundary {
        Some((from.max(boundary), to))
    } else {
        None
    };

    (rollup, raw)
}

impl AnalyticsAggregator {
    pub fn new(db_pool: PgPool, retention_days: i64) -> Self {
        Self {
            db_pool,
            retention_days,
        }
    }

    /// Idempotent upsert of one day's rollup rows. Keys with zero events
    /// produce no row.
    pub async fn aggregate_day(&self, date: NaiveDate) -> Result<usize, AppError> {
        let rows: Vec<RawEventRow> = sqlx::query_as(
            "SELECT clinic_id, product_id, form_id, event_type, dropoff_stage
             FROM telemetry_events
             WHERE occurred_at::date = $1",
        )
        .bind(date)
        .fetch_all(&self.db_pool)
        .await?;

        let grouped = fold_events(&rows);
        let upserted = grouped.len();

        for ((clinic_id, product_id, form_id), totals) in grouped {
            sqlx::query(
                "INSERT INTO analytics_daily
                 (clinic_id, product_id, form_id, date, views, conversions, dropoff_stages, aggregated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                 ON CONFLICT (clinic_id, product_id, form_id, date) DO UPDATE
                 SET views = EXCLUDED.views,
                     conversions = EXCLUDED.conversions,
                     dropoff_stages = EXCLUDED.dropoff_stages,
                     aggregated_at = NOW()",
            )
            .bind(clinic_id)
            .bind(product_id)
            .bind(form_id)
            .bind(date)
            .bind(totals.views as i32)
            .bind(totals.conversions as i32)
            .bind(serde_json::to_value(&totals.stages).unwrap_or_default())
            .execute(&self.db_pool)
            .await?;
        }

        info!("Aggregated {}: {} rollup rows", date, upserted);
        Ok(upserted)
    }

    /// Aggregate exactly the calendar dates (within the last 365 days) that
    /// have raw events but no rollup yet. Filtered by date, not timestamp, so
    /// a lookback-edge day is aggregated whole or not at all.
    pub async fn ensure_aggregated(&self) -> Result<usize, AppError> {
        let lookback = Utc::now().date_naive() - Duration::days(365);

        let missing: Vec<(NaiveDate,)> = sqlx::query_as(
            "SELECT DISTINCT occurred_at::date AS day
             FROM telemetry_events
             WHERE occurred_at::date >= $1
             EXCEPT
             SELECT DISTINCT date FROM analytics_daily
             ORDER BY day",
        )
        .bind(lookback)
        .fetch_all(&self.db_pool)
        .await?;

        for (date,) in &missing {
            self.aggregate_day(*date).await?;
        }

        if !missing.is_empty() {
            info!("Backfilled rollups for {} dates", missing.len());
        }
        Ok(missing.len())
    }

    /// Hard-delete raw events on dates older than the retention boundary.
    /// Day-granular: the boundary date itself is never touched, matching the
    /// tier assignment in split_range. Callers must aggregate first;
    /// run_nightly enforces the ordering.
    pub async fn apply_retention(&self) -> Result<u64, AppError> {
        let boundary = retention_boundary(Utc::now().date_naive(), self.retention_days);

        let result = sqlx::query("DELETE FROM telemetry_events WHERE occurred_at::date < $1")
            .bind(boundary)
            .execute(&self.db_pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                "Retention sweep deleted {} raw events older than {} days",
                deleted, self.retention_days
            );
        }
        Ok(deleted)
    }

    /// Nightly maintenance: aggregate everything outstanding, then sweep.
    pub async fn run_nightly(&self) -> Result<(), AppError> {
        self.ensure_aggregated().await?;
        self.apply_retention().await?;
        Ok(())
    }

    /// Two-tier read: exact raw counts inside the retention window, rollups
    /// beyond it, summed without double-counting the boundary day.
    pub async fn query_range(
        &self,
        clinic_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<FunnelReport, AppError> {
        let boundary = retention_boundary(Utc::now().date_naive(), self.retention_days);
        let (rollup_range, raw_range) = split_range(from, to, boundary);

        let mut report = FunnelReport::default();

        if let Some((from, to)) = rollup_range {
            let rows: Vec<(i32, i32, serde_json::Value)> = sqlx::query_as(
                "SELECT views, conversions, dropoff_stages
                 FROM analytics_daily
                 WHERE clinic_id = $1 AND date BETWEEN $2 AND $3",
            )
            .bind(clinic_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.db_pool)
            .await?;

            for (views, conversions, stages) in rows {
                let stages: BTreeMap<String, i64> =
                    serde_json::from_value(stages).unwrap_or_default();
                report.absorb(FunnelReport {
                    views: views as i64,
                    conversions: conversions as i64,
                    dropoff_stages: stages,
                });
            }
        }

        if let Some((from, to)) = raw_range {
            let rows: Vec<RawEventRow> = sqlx::query_as(
                "SELECT clinic_id, product_id, form_id, event_type, dropoff_stage
                 FROM telemetry_events
                 WHERE clinic_id = $1 AND occurred_at::date BETWEEN $2 AND $3",
            )
            .bind(clinic_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.db_pool)
            .await?;

            for totals in fold_events(&rows).into_values() {
                report.absorb(FunnelReport {
                    views: totals.views,
                    conversions: totals.conversions,
                    dropoff_stages: totals.stages,
                });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn rows() -> Vec<RawEventRow> {
        let clinic = Uuid::new_v4();
        let product = Uuid::new_v4();
        let form = Uuid::new_v4();
        vec![
            (clinic, product, form, "view".to_string(), None),
            (clinic, product, form, "view".to_string(), None),
            (clinic, product, form, "conversion".to_string(), None),
            (
                clinic,
                product,
                form,
                "dropoff".to_string(),
                Some("payment".to_string()),
            ),
            (
                clinic,
                product,
                form,
                "dropoff".to_string(),
                Some("payment".to_string()),
            ),
            (
                clinic,
                product,
                form,
                "dropoff".to_string(),
                Some("intake".to_string()),
            ),
        ]
    }

    #[test]
    fn test_fold_counts_per_key() {
        let rows = rows();
        let grouped = fold_events(&rows);
        assert_eq!(grouped.len(), 1);

        let totals = grouped.values().next().unwrap();
        assert_eq!(totals.views, 2);
        assert_eq!(totals.conversions, 1);
        assert_eq!(totals.stages.get("payment"), Some(&2));
        assert_eq!(totals.stages.get("intake"), Some(&1));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let mut rows = rows();
        let forward = fold_events(&rows);
        rows.reverse();
        let backward = fold_events(&rows);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_fold_dropoff_without_stage() {
        let rows = vec![(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "dropoff".to_string(),
            None,
        )];
        let grouped = fold_events(&rows);
        let totals = grouped.values().next().unwrap();
        assert_eq!(totals.stages.get("unknown"), Some(&1));
    }

    #[test]
    fn test_split_range_straddling_boundary() {
        let boundary = date("2026-01-10");
        let (rollup, raw) = split_range(date("2026-01-01"), date("2026-01-20"), boundary);

        // The boundary day belongs to the raw tier only.
        assert_eq!(rollup, Some((date("2026-01-01"), date("2026-01-09"))));
        assert_eq!(raw, Some((date("2026-01-10"), date("2026-01-20"))));
    }

    #[test]
    fn test_split_range_entirely_one_tier() {
        let boundary = date("2026-01-10");

        let (rollup, raw) = split_range(date("2026-01-12"), date("2026-01-15"), boundary);
        assert_eq!(rollup, None);
        assert_eq!(raw, Some((date("2026-01-12"), date("2026-01-15"))));

        let (rollup, raw) = split_range(date("2025-12-01"), date("2025-12-31"), boundary);
        assert_eq!(rollup, Some((date("2025-12-01"), date("2025-12-31"))));
        assert_eq!(raw, None);
    }

    #[test]
    fn test_sweep_boundary_matches_read_tiering() {
        let today = date("2026-08-26");
        let boundary = retention_boundary(today, 365);
        assert_eq!(boundary, date("2025-08-26"));

        // Every date the day-granular sweep deletes is read from rollups.
        let swept_day = boundary - Duration::days(1);
        let (rollup, raw) = split_range(swept_day, swept_day, boundary);
        assert_eq!(rollup, Some((swept_day, swept_day)));
        assert_eq!(raw, None);

        // The boundary date survives the sweep and is read from raw only.
        let (rollup, raw) = split_range(boundary, boundary, boundary);
        assert_eq!(rollup, None);
        assert_eq!(raw, Some((boundary, boundary)));
    }

    #[test]
    fn test_split_range_inverted_is_empty() {
        let boundary = date("2026-01-10");
        let (rollup, raw) = split_range(date("2026-01-20"), date("2026-01-01"), boundary);
        assert_eq!(rollup, None);
        assert_eq!(raw, None);
    }

    #[test]
    fn test_report_absorb_sums_stage_maps() {
        let mut a = FunnelReport {
            views: 10,
            conversions: 2,
            dropoff_stages: BTreeMap::from([("payment".to_string(), 3)]),
        };
        let b = FunnelReport {
            views: 5,
            conversions: 1,
            dropoff_stages: BTreeMap::from([
                ("payment".to_string(), 1),
                ("intake".to_string(), 2),
            ]),
        };

        a.absorb(b);
        assert_eq!(a.views, 15);
        assert_eq!(a.conversions, 3);
        assert_eq!(a.dropoff_stages.get("payment"), Some(&4));
        assert_eq!(a.dropoff_stages.get("intake"), Some(&2));
    }
}
