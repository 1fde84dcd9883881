use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fedspend_core::CycleReport;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::orchestrator::Orchestrator;
use crate::report::write_cycle_reports;

/// Whatever the scheduler drives once per tick. An `Err` means the cycle itself broke,
/// as opposed to individual collectors failing inside a completed report.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleReport>;
}

#[async_trait]
impl CycleRunner for Orchestrator {
    async fn run_cycle(&self) -> Result<CycleReport> {
        Ok(Orchestrator::run_cycle(self).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Delay after a completed cycle, including partially failed ones.
    pub interval: Duration,
    /// Delay after a cycle that raised or panicked.
    pub retry_interval: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(300),
        }
    }
}

pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    policy: SchedulePolicy,
    reports_dir: Option<PathBuf>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, policy: SchedulePolicy) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            runner,
            policy,
            reports_dir: None,
            state,
        }
    }

    pub fn with_reports_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.reports_dir = dir;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Runs one cycle and returns how long to wait before the next one.
    pub async fn run_once(&self) -> Duration {
        self.state.send_replace(SchedulerState::Running);

        let runner = Arc::clone(&self.runner);
        let delay = match tokio::spawn(async move { runner.run_cycle().await }).await {
            Ok(Ok(report)) => {
                info!(
                    run_id = %report.run_id,
                    total = report.total_count(),
                    failed = ?report.failed_kinds(),
                    "cycle complete"
                );
                if let Some(dir) = &self.reports_dir {
                    match write_cycle_reports(dir, &report).await {
                        Ok(path) => info!(path = %path.display(), "cycle reports written"),
                        Err(err) => warn!(error = %format!("{err:#}"), "writing cycle reports failed"),
                    }
                }
                self.policy.interval
            }
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "cycle failed; retrying early");
                self.policy.retry_interval
            }
            Err(err) => {
                error!(error = %err, "cycle task panicked; retrying early");
                self.policy.retry_interval
            }
        };

        self.state.send_replace(SchedulerState::Idle);
        delay
    }

    /// Loops until `shutdown` resolves. Shutdown is only observed between cycles.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(
            interval_secs = self.policy.interval.as_secs(),
            retry_interval_secs = self.policy.retry_interval.as_secs(),
            "scheduler started"
        );
        loop {
            let delay = self.run_once().await;
            info!(next_in_secs = delay.as_secs(), "scheduler idle");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use chrono::Utc;
    use fedspend_core::{CollectionOutcome, EntityKind};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;
    use uuid::Uuid;

    enum Step {
        Fail,
        Panic,
        Complete { failed_entity: bool },
    }

    struct ScriptedRunner {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedRunner {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn gaps(&self) -> Vec<u64> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect()
        }
    }

    #[async_trait]
    impl CycleRunner for ScriptedRunner {
        async fn run_cycle(&self) -> Result<CycleReport> {
            self.calls.lock().unwrap().push(Instant::now());
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Complete { failed_entity: false });
            match step {
                Step::Fail => bail!("orchestrator exploded"),
                Step::Panic => panic!("orchestrator bug"),
                Step::Complete { failed_entity } => {
                    let mut outcomes = BTreeMap::new();
                    outcomes.insert(EntityKind::Subawards, CollectionOutcome::default());
                    if failed_entity {
                        outcomes.insert(
                            EntityKind::ContractOpportunities,
                            CollectionOutcome::failure("provider down"),
                        );
                    }
                    Ok(CycleReport {
                        run_id: Uuid::new_v4(),
                        started_at: Utc::now(),
                        finished_at: Utc::now(),
                        outcomes,
                        contractors_enriched: 0,
                        contractor_enrichment_failures: 0,
                    })
                }
            }
        }
    }

    #[tokio::test]
    async fn raised_cycle_retries_after_short_interval() {
        let scheduler = Scheduler::new(ScriptedRunner::new(vec![Step::Fail]), SchedulePolicy::default());
        assert_eq!(scheduler.run_once().await, Duration::from_secs(300));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn panicking_cycle_retries_after_short_interval() {
        let scheduler = Scheduler::new(ScriptedRunner::new(vec![Step::Panic]), SchedulePolicy::default());
        assert_eq!(scheduler.run_once().await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn partially_failed_cycle_waits_full_interval() {
        let scheduler = Scheduler::new(
            ScriptedRunner::new(vec![Step::Complete { failed_entity: true }]),
            SchedulePolicy::default(),
        );
        let mut state = scheduler.subscribe();
        assert_eq!(scheduler.run_once().await, Duration::from_secs(3600));
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_spacing_follows_backoff_policy() {
        let runner = ScriptedRunner::new(vec![
            Step::Fail,
            Step::Complete { failed_entity: true },
            Step::Complete { failed_entity: false },
        ]);
        let scheduler = Scheduler::new(runner.clone(), SchedulePolicy::default());

        scheduler
            .run_until(tokio::time::sleep(Duration::from_secs(300 + 3600 + 3600 + 10)))
            .await;

        assert_eq!(runner.gaps(), vec![300, 3600, 3600]);
    }

    #[tokio::test]
    async fn reports_are_written_and_write_failures_are_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(ScriptedRunner::new(vec![]), SchedulePolicy::default())
            .with_reports_dir(Some(tmp.path().to_path_buf()));
        assert_eq!(scheduler.run_once().await, Duration::from_secs(3600));
        let runs: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(runs.len(), 1);

        let blocked = tmp.path().join("not-a-dir");
        std::fs::write(&blocked, b"file").unwrap();
        let scheduler = Scheduler::new(ScriptedRunner::new(vec![]), SchedulePolicy::default())
            .with_reports_dir(Some(blocked));
        assert_eq!(scheduler.run_once().await, Duration::from_secs(3600));
    }
}
