// Job Scheduler - cron-driven background maintenance

use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};

use crate::analytics::AnalyticsAggregator;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
}

pub type JobResult<T> = Result<T, JobError>;

/// Nightly cron: aggregate outstanding telemetry dates, then sweep raw rows
/// past the retention window. Aggregation always runs first so the sweep
/// never deletes un-rolled-up detail.
const NIGHTLY_ANALYTICS_CRON: &str = "0 10 2 * * *";

pub struct JobScheduler {
    scheduler: TokioScheduler,
    aggregator: AnalyticsAggregator,
}

impl JobScheduler {
    pub async fn new(aggregator: AnalyticsAggregator) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;
        Ok(Self {
            scheduler,
            aggregator,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        let aggregator = self.aggregator.clone();
        let job = Job::new_async(NIGHTLY_ANALYTICS_CRON, move |_id, _lock| {
            let aggregator = aggregator.clone();
            Box::pin(async move {
                info!("Nightly analytics maintenance starting");
                match aggregator.run_nightly().await {
                    Ok(()) => info!("Nightly analytics maintenance completed"),
                    Err(e) => error!("Nightly analytics maintenance failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        self.scheduler.start().await?;

        info!("Job scheduler started");
        Ok(())
    }
}
