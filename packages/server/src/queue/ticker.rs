//! Cron evaluator: the "separate process" referenced by the Schedule
//! invariant in spec §3 that ticks due schedules into new `Job` rows.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::job::SendOptions;
use super::store::QueueStore;

pub async fn run_schedule_ticker(
    store: Arc<dyn QueueStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("schedule ticker starting");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let now = chrono::Utc::now();
        match store.due_schedules(now).await {
            Ok(due) => {
                for due_schedule in due {
                    let schedule = &due_schedule.schedule;
                    let occurrence = due_schedule.occurrence;

                    let opts = match schedule.parsed_send_options() {
                        Ok(stored) => SendOptions::builder()
                            .expire_in_seconds(stored.expire_in_seconds)
                            .retry_limit(stored.retry_limit)
                            .retry_delay(stored.retry_delay)
                            .retention_seconds(stored.retention_seconds)
                            .singleton_key(schedule.occurrence_singleton_key(occurrence))
                            .build(),
                        Err(e) => {
                            error!(schedule_key = %schedule.schedule_key, error = %e, "invalid stored send options");
                            continue;
                        }
                    };

                    match store
                        .send(&schedule.queue_name, schedule.payload.clone(), opts)
                        .await
                    {
                        Ok(Some(job_id)) => {
                            debug!(
                                queue = %schedule.queue_name,
                                schedule_key = %schedule.schedule_key,
                                job_id = %job_id,
                                "enqueued scheduled job"
                            );
                            if let Err(e) = store.mark_schedule_ran(&schedule.queue_name, &schedule.schedule_key, occurrence).await {
                                error!(
                                    queue = %schedule.queue_name,
                                    schedule_key = %schedule.schedule_key,
                                    error = %e,
                                    "failed to record schedule occurrence"
                                );
                            }
                        }
                        Ok(None) => {
                            debug!(
                                queue = %schedule.queue_name,
                                schedule_key = %schedule.schedule_key,
                                "scheduled occurrence skipped, singleton key busy"
                            );
                            // Another tick already enqueued this occurrence but
                            // hadn't recorded it yet; record it now so we don't
                            // keep retrying the same occurrence.
                            if let Err(e) = store.mark_schedule_ran(&schedule.queue_name, &schedule.schedule_key, occurrence).await {
                                error!(
                                    queue = %schedule.queue_name,
                                    schedule_key = %schedule.schedule_key,
                                    error = %e,
                                    "failed to record schedule occurrence"
                                );
                            }
                        }
                        Err(e) => error!(
                            queue = %schedule.queue_name,
                            schedule_key = %schedule.schedule_key,
                            error = %e,
                            "failed to enqueue scheduled job"
                        ),
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to load due schedules"),
        }

        if let Err(e) = store.reap().await {
            error!(error = %e, "failed to reap expired/retained jobs");
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::info!("schedule ticker stopped");
}
