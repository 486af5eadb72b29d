//! Deadline-bounded, fixed-interval polling of remote items.
//!
//! Each pass fetches every unresolved item once. An item resolves when its
//! fetch fails, when the resource is gone, or when the remote operation is
//! terminal and was started after the loop began (an older terminal operation
//! is a stale read of a previous sync). Items left at the deadline are
//! reported as still running.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use nodeflow_types::sync::{ItemReport, OperationPhase, RemoteStatus, SyncBuckets, SyncItem};

use super::remote::RemoteResourceApi;
use super::retry::RetryPolicy;

pub struct PollingLoop<A: RemoteResourceApi> {
    api: Arc<A>,
    interval: Duration,
    retry: RetryPolicy,
}

impl<A: RemoteResourceApi> PollingLoop<A> {
    pub fn new(api: Arc<A>, interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            api,
            interval,
            retry,
        }
    }

    /// Poll `items` until each resolves, `deadline` passes, or `cancel` fires.
    ///
    /// `started_at` is the wall-clock start used by the stale-operation guard.
    pub async fn run(
        &self,
        items: Vec<SyncItem>,
        started_at: DateTime<Utc>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> SyncBuckets {
        let mut buckets = SyncBuckets::default();
        let mut pending: Vec<(SyncItem, ItemReport)> = items
            .into_iter()
            .map(|item| {
                let report = ItemReport::for_item(&item);
                (item, report)
            })
            .collect();
        let mut passes = 0u32;

        while !pending.is_empty() && Instant::now() < deadline && !cancel.is_cancelled() {
            passes += 1;
            let mut interrupted = false;
            let mut unresolved = Vec::with_capacity(pending.len());
            for (item, mut report) in pending {
                if interrupted {
                    unresolved.push((item, report));
                    continue;
                }
                // A hung status call must not outlive the deadline or ignore
                // cancellation.
                let polled = tokio::select! {
                    _ = cancel.cancelled() => None,
                    polled = tokio::time::timeout_at(deadline, self.poll_item(&item, &mut report, started_at)) => polled.ok(),
                };
                match polled {
                    Some(Resolution::Succeeded) => buckets.succeeded.push(report),
                    Some(Resolution::Failed) => buckets.failed.push(report),
                    Some(Resolution::Pending) => unresolved.push((item, report)),
                    None => {
                        debug!(item = %item.name, "status call interrupted by deadline or cancellation");
                        interrupted = true;
                        unresolved.push((item, report));
                    }
                }
            }
            pending = unresolved;
            if pending.is_empty() || interrupted {
                break;
            }

            let wake = (Instant::now() + self.interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(remaining = pending.len(), "polling cancelled");
                    break;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        debug!(
            passes,
            succeeded = buckets.succeeded.len(),
            failed = buckets.failed.len(),
            still_running = pending.len(),
            "polling finished"
        );
        buckets
            .still_running
            .extend(pending.into_iter().map(|(_, report)| report));
        buckets
    }

    async fn poll_item(&self, item: &SyncItem, report: &mut ItemReport, started_at: DateTime<Utc>) -> Resolution {
        let api = &*self.api;
        match self.retry.run("status", move || api.status(item)).await {
            Ok(status) => {
                report.record(&status);
                match classify(&status, started_at) {
                    Some(true) => Resolution::Succeeded,
                    Some(false) => Resolution::Failed,
                    None => Resolution::Pending,
                }
            }
            Err(e) => {
                debug!(item = %item.name, error = %e, "status fetch failed");
                report.message = e.to_string();
                Resolution::Failed
            }
        }
    }
}

enum Resolution {
    Succeeded,
    Failed,
    Pending,
}

/// `Some(succeeded)` once the status reflects a terminal operation started
/// after `started_at`, `None` while it does not.
fn classify(status: &RemoteStatus, started_at: DateTime<Utc>) -> Option<bool> {
    let fresh = status
        .last_operation_started_at
        .is_some_and(|t| t > started_at);
    if !fresh || !status.phase.is_terminal() {
        return None;
    }
    Some(status.phase == OperationPhase::Succeeded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use nodeflow_types::sync::{HealthStatus, SyncState};

    use crate::polling::remote::RemoteError;

    /// Scripted remote behaviour per item.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Script {
        /// Succeeds on the n-th status call.
        SucceedOn(u32),
        /// Reports a failed operation on the n-th status call.
        FailOn(u32),
        /// Running forever.
        Never,
        /// Resource is gone.
        Gone,
        /// Terminal, but from an operation older than the loop.
        StaleTerminal,
        /// `n` transient errors, then success.
        Flaky(u32),
        /// Sync request is rejected.
        RejectSync,
        /// Every remote call hangs.
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct FakeRemote {
        scripts: HashMap<String, Script>,
        pub(crate) polls: Mutex<HashMap<String, u32>>,
        pub(crate) synced: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        pub(crate) fn with(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
                ..Default::default()
            }
        }

        pub(crate) fn polls_of(&self, name: &str) -> u32 {
            self.polls.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    fn remote(phase: OperationPhase, started: DateTime<Utc>) -> RemoteStatus {
        RemoteStatus {
            sync_state: if phase == OperationPhase::Succeeded {
                SyncState::Synced
            } else {
                SyncState::OutOfSync
            },
            phase,
            message: format!("{phase:?}"),
            health: HealthStatus::Progressing,
            last_operation_started_at: Some(started),
        }
    }

    impl RemoteResourceApi for FakeRemote {
        async fn status(&self, item: &SyncItem) -> Result<RemoteStatus, RemoteError> {
            let n = {
                let mut polls = self.polls.lock().unwrap();
                let n = polls.entry(item.name.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let fresh = Utc::now() + chrono::Duration::seconds(1);
            if matches!(self.scripts.get(&item.name), Some(Script::Hang)) {
                return std::future::pending().await;
            }
            match self.scripts.get(&item.name).copied().unwrap_or(Script::Never) {
                Script::SucceedOn(k) if n >= k => Ok(remote(OperationPhase::Succeeded, fresh)),
                Script::FailOn(k) if n >= k => Ok(remote(OperationPhase::Failed, fresh)),
                Script::SucceedOn(_) | Script::FailOn(_) | Script::Never => {
                    Ok(remote(OperationPhase::Running, fresh))
                }
                Script::Gone => Err(RemoteError::NotFound(item.name.clone())),
                Script::StaleTerminal => Ok(remote(
                    OperationPhase::Succeeded,
                    Utc::now() - chrono::Duration::hours(1),
                )),
                Script::Flaky(k) if n <= k => Err(RemoteError::Transient("503".into())),
                Script::Flaky(_) | Script::RejectSync | Script::Hang => {
                    Ok(remote(OperationPhase::Succeeded, fresh))
                }
            }
        }

        async fn sync(&self, item: &SyncItem) -> Result<(), RemoteError> {
            if matches!(self.scripts.get(&item.name), Some(Script::Hang)) {
                return std::future::pending().await;
            }
            if matches!(self.scripts.get(&item.name), Some(Script::RejectSync)) {
                return Err(RemoteError::Rejected(format!("{} is locked", item.name)));
            }
            self.synced.lock().unwrap().push(item.name.clone());
            Ok(())
        }
    }

    pub(crate) fn item(name: &str) -> SyncItem {
        SyncItem {
            name: name.into(),
            agent: "argo".into(),
            service: "checkout".into(),
            environment: "prod".into(),
            cluster: "eu-1".into(),
            read_only: false,
            stale: false,
            managed_resources: vec![format!("deployment/{name}")],
        }
    }

    fn polling(api: Arc<FakeRemote>) -> PollingLoop<FakeRemote> {
        PollingLoop::new(api, Duration::from_secs(5), RetryPolicy::new(3, Duration::from_millis(100)))
    }

    fn names(reports: &[ItemReport]) -> Vec<&str> {
        reports.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_polls_and_reports_still_running() {
        let api = Arc::new(FakeRemote::with(&[
            ("item1", Script::SucceedOn(1)),
            ("item2", Script::SucceedOn(2)),
            ("item3", Script::Never),
        ]));
        let start = Instant::now();
        // 65s step timeout minus a 30s safety margin.
        let deadline = start + Duration::from_secs(35);

        let buckets = polling(api.clone())
            .run(
                vec![item("item1"), item("item2"), item("item3")],
                Utc::now(),
                deadline,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(names(&buckets.succeeded), vec!["item1", "item2"]);
        assert!(buckets.failed.is_empty());
        assert_eq!(names(&buckets.still_running), vec!["item3"]);
        assert_eq!(api.polls_of("item3"), 7);
        assert_eq!(api.polls_of("item1"), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_everything_resolves() {
        let api = Arc::new(FakeRemote::with(&[("a", Script::SucceedOn(2)), ("b", Script::FailOn(1))]));
        let start = Instant::now();

        let buckets = polling(api)
            .run(
                vec![item("a"), item("b")],
                Utc::now(),
                start + Duration::from_secs(600),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(names(&buckets.succeeded), vec!["a"]);
        assert_eq!(names(&buckets.failed), vec!["b"]);
        assert_eq!(buckets.failed[0].phase, Some(OperationPhase::Failed));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_terminal_operation_is_not_trusted() {
        let api = Arc::new(FakeRemote::with(&[("a", Script::StaleTerminal)]));
        let start = Instant::now();
        let buckets = polling(api)
            .run(vec![item("a")], Utc::now(), start + Duration::from_secs(12), &CancellationToken::new())
            .await;
        assert!(buckets.succeeded.is_empty());
        assert_eq!(names(&buckets.still_running), vec!["a"]);
        assert_eq!(buckets.still_running[0].phase, Some(OperationPhase::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn gone_and_flaky_items() {
        let api = Arc::new(FakeRemote::with(&[
            ("gone", Script::Gone),
            ("flaky", Script::Flaky(2)),
            ("broken", Script::Flaky(10)),
        ]));
        let start = Instant::now();
        let buckets = polling(api.clone())
            .run(
                vec![item("gone"), item("flaky"), item("broken")],
                Utc::now(),
                start + Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(names(&buckets.succeeded), vec!["flaky"]);
        assert_eq!(names(&buckets.failed), vec!["gone", "broken"]);
        assert!(buckets.failed[0].message.contains("not found"));
        assert!(buckets.failed[1].message.contains("transient"));
        assert_eq!(api.polls_of("gone"), 1);
        assert_eq!(api.polls_of("broken"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_items_running() {
        let api = Arc::new(FakeRemote::with(&[("a", Script::Never)]));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });
        let buckets = polling(api.clone())
            .run(vec![item("a")], Utc::now(), start + Duration::from_secs(600), &cancel)
            .await;

        assert_eq!(names(&buckets.still_running), vec!["a"]);
        assert_eq!(api.polls_of("a"), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_polls_nothing() {
        let api = Arc::new(FakeRemote::with(&[("a", Script::SucceedOn(1))]));
        let buckets = polling(api.clone())
            .run(vec![item("a")], Utc::now(), Instant::now(), &CancellationToken::new())
            .await;
        assert_eq!(names(&buckets.still_running), vec!["a"]);
        assert_eq!(api.polls_of("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_call_is_cut_off_at_the_deadline() {
        let api = Arc::new(FakeRemote::with(&[("hung", Script::Hang), ("ok", Script::SucceedOn(1))]));
        let start = Instant::now();
        let deadline = start + Duration::from_secs(35);

        let buckets = polling(api.clone())
            .run(vec![item("ok"), item("hung")], Utc::now(), deadline, &CancellationToken::new())
            .await;

        assert_eq!(names(&buckets.succeeded), vec!["ok"]);
        assert_eq!(names(&buckets.still_running), vec!["hung"]);
        assert_eq!(start.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_call_yields_to_cancellation() {
        let api = Arc::new(FakeRemote::with(&[("hung", Script::Hang)]));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        let buckets = polling(api)
            .run(vec![item("hung")], Utc::now(), start + Duration::from_secs(600), &cancel)
            .await;

        assert_eq!(names(&buckets.still_running), vec!["hung"]);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_never_overshoots_the_deadline() {
        let api = Arc::new(FakeRemote::with(&[("a", Script::Never)]));
        let start = Instant::now();
        let buckets = polling(api.clone())
            .run(vec![item("a")], Utc::now(), start + Duration::from_secs(7), &CancellationToken::new())
            .await;
        assert_eq!(names(&buckets.still_running), vec!["a"]);
        assert_eq!(api.polls_of("a"), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }
}
