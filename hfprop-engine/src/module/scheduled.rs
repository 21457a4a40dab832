///! Scheduled task manager - periodic propagation updates
///!
///! Updates are aligned to multiples of the interval since midnight UTC
///! (every 5 minutes -> xx:00, xx:05, ...), so restarts keep the cadence.
///! The interval is owned by the engine and may change while running.

use super::engine::PropagationEngine;
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;

/// Configuration for scheduled tasks
#[derive(Debug, Clone)]
pub struct ScheduledTaskConfig {
    /// Perform initial update immediately
    pub perform_initial_update: bool,
}

impl Default for ScheduledTaskConfig {
    fn default() -> Self {
        Self {
            perform_initial_update: true,
        }
    }
}

impl From<&EngineConfig> for ScheduledTaskConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            perform_initial_update: config.perform_initial_update,
        }
    }
}

/// Scheduled task manager
pub struct ScheduledTaskManager {
    config: ScheduledTaskConfig,
    engine: Arc<PropagationEngine>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ScheduledTaskManager {
    pub fn new(config: ScheduledTaskConfig, engine: Arc<PropagationEngine>) -> Self {
        Self {
            config,
            engine,
            task_handles: Vec::new(),
        }
    }

    /// Start all scheduled tasks
    pub fn start_all(&mut self) {
        tracing::info!("Starting scheduled task manager...");

        let update_handle = self.start_propagation_update_task();
        self.task_handles.push(update_handle);

        tracing::info!(
            "Started {} scheduled tasks (propagation updates every {} min)",
            self.task_handles.len(),
            self.engine.update_interval_minutes()
        );
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    fn start_propagation_update_task(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let interval = engine.watch_update_interval();
        let perform_initial = self.config.perform_initial_update;

        tracing::info!(
            "Scheduling propagation update task (interval: {} minutes, initial: {})",
            *interval.borrow(),
            perform_initial
        );

        tokio::spawn(async move {
            if perform_initial {
                tracing::info!("Performing initial propagation update...");
                Self::run_propagation_update(&engine).await;
            }

            Self::propagation_update_loop(engine, interval).await;
        })
    }

    async fn propagation_update_loop(engine: Arc<PropagationEngine>, mut interval: watch::Receiver<u64>) {
        loop {
            let now = Utc::now();
            let next_trigger = Self::next_trigger(&mut interval, now);
            let sleep_duration = (next_trigger - now)
                .to_std()
                .unwrap_or(Duration::from_secs(60));

            tracing::debug!(
                "Next propagation update at: {} (in {:.1} min)",
                next_trigger.format("%Y-%m-%d %H:%M:%S UTC"),
                sleep_duration.as_secs_f64() / 60.0
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    Self::run_propagation_update(&engine).await;
                }
                changed = interval.changed() => {
                    if changed.is_err() {
                        // Engine gone; finish this cycle on the last interval
                        tokio::time::sleep(sleep_duration).await;
                        Self::run_propagation_update(&engine).await;
                    } else {
                        tracing::info!("Update interval changed, rescheduling");
                    }
                }
            }
        }
    }

    /// Next trigger under the interval currently set on the engine
    fn next_trigger(interval: &mut watch::Receiver<u64>, now: DateTime<Utc>) -> DateTime<Utc> {
        let minutes = *interval.borrow_and_update();
        Self::calculate_next_update_time(now, minutes)
    }

    /// Next multiple of `interval_minutes` since midnight, strictly after `now`
    fn calculate_next_update_time(now: DateTime<Utc>, interval_minutes: u64) -> DateTime<Utc> {
        let interval = interval_minutes.max(1) as i64;
        let seconds = now.num_seconds_from_midnight() as i64;
        let midnight = now
            - chrono::Duration::seconds(seconds)
            - chrono::Duration::nanoseconds(now.nanosecond() as i64);

        let slot = seconds / 60 / interval + 1;
        midnight + chrono::Duration::minutes(slot * interval)
    }

    async fn run_propagation_update(engine: &Arc<PropagationEngine>) {
        let report = engine.update_propagation().await;
        if report.feeds_started.is_empty() {
            tracing::info!("Propagation updated (season {})", report.season);
        } else {
            let feeds: Vec<&str> = report.feeds_started.iter().map(|feed| feed.as_str()).collect();
            tracing::info!(
                "Propagation updated (season {}), refreshing feeds: {}",
                report.season,
                feeds.join(", ")
            );
        }
    }

    /// Gracefully shutdown all tasks
    pub async fn shutdown(self) {
        tracing::info!("Shutting down scheduled task manager...");

        for handle in self.task_handles {
            handle.abort();
        }

        tracing::info!("All scheduled tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::engine::EngineBuilder;
    use crate::module::feed::updater::tests::MockFetcher;
    use chrono::TimeZone;
    use hfprop_common::PropagationEvent;

    #[test]
    fn test_calculate_next_update_time() {
        // 10:00:00 - next 5-minute slot is 10:05
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let next = ScheduledTaskManager::calculate_next_update_time(now, 5);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 10, 5, 0).unwrap());

        // 10:07:30 - 10:10
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 7, 30).unwrap();
        let next = ScheduledTaskManager::calculate_next_update_time(now, 5);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 10, 10, 0).unwrap());

        // 23:58 with a 5-minute interval rolls into the next day
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 23, 58, 0).unwrap();
        let next = ScheduledTaskManager::calculate_next_update_time(now, 5);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap());

        // Hourly
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 59, 59).unwrap();
        let next = ScheduledTaskManager::calculate_next_update_time(now, 60);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_update_always_in_future() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for minute in 0..(24 * 60) {
            let now = start + chrono::Duration::minutes(minute) + chrono::Duration::seconds(17);
            let next = ScheduledTaskManager::calculate_next_update_time(now, 7);
            assert!(next > now);
            assert!(next - now <= chrono::Duration::minutes(7));
        }
    }

    #[tokio::test]
    async fn test_next_trigger_follows_interval_changes() {
        let engine = EngineBuilder::new(EngineConfig::default())
            .with_fetcher(Arc::new(MockFetcher::default()))
            .build()
            .unwrap();
        let mut interval = engine.watch_update_interval();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 7, 30).unwrap();

        assert_eq!(
            ScheduledTaskManager::next_trigger(&mut interval, now),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 10, 0).unwrap()
        );

        engine.set_update_interval(60);
        assert!(interval.has_changed().unwrap());
        assert_eq!(
            ScheduledTaskManager::next_trigger(&mut interval, now),
            Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap()
        );
        assert!(!interval.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_initial_update_runs() {
        let config = EngineConfig {
            solar_drift: false,
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new(config.clone())
            .with_fetcher(Arc::new(MockFetcher::default()))
            .build()
            .unwrap();
        let mut rx = engine.subscribe();

        let mut manager = ScheduledTaskManager::new(ScheduledTaskConfig::from(&config), engine);
        manager.start_all();
        assert_eq!(manager.task_count(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PropagationEvent::PropagationUpdated);

        manager.shutdown().await;
    }
}
