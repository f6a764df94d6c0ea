// Analytics - daily funnel rollups over raw telemetry with a retention
// window, plus the two-tier read path that spans both stores.

pub mod aggregator;

pub use aggregator::{AnalyticsAggregator, FunnelReport};
