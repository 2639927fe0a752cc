//! Trigger-then-converge tracking for externally reconciled resources.
//!
//! The external controller owns reconciliation; the only thing we can
//! observe is an opaque marker it bumps whenever an attempt completes.
//! A session therefore captures each resource's marker before triggering,
//! then polls until every marker has moved away from its baseline or the
//! deadline passes. Detection is level-triggered against the baseline, so
//! a marker that changes several times between two polls is still caught.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Identity of a trackable resource, unique within one session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Convergence signal for a single resource, as reported by a [`StatusReader`].
#[derive(Clone, Debug, Default)]
pub struct ResourceStatus {
    /// Opaque value the external controller bumps on every completed
    /// reconciliation attempt. Absent if the resource never converged.
    pub marker: Option<String>,
    pub ready: Readiness,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Readiness {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Error)]
#[error("status unreachable: {0}")]
pub struct Unreachable(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TriggerError(pub String);

#[derive(Debug, Error)]
#[error("cannot track an empty resource set")]
pub struct EmptySet;

#[async_trait]
pub trait StatusReader {
    /// Queries the resource's current convergence signal.
    async fn read(&self, resource: &ResourceRef) -> Result<ResourceStatus, Unreachable>;
}

#[async_trait]
pub trait SyncTrigger {
    /// Asks the external controller to re-run reconciliation for the
    /// resource. Must be safe to call redundantly; completion is only
    /// observable through the [`StatusReader`] marker.
    async fn fire(&self, resource: &ResourceRef) -> Result<(), TriggerError>;
}

/// Marker value observed before the trigger was sent. `None` means the
/// resource had never converged (or could not be read) at session start.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Baseline {
    pub marker: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Synced,
    Failed,
    TimedOut,
}

impl Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Synced => f.write_str("Synced"),
            SyncState::Failed => f.write_str("Failed"),
            SyncState::TimedOut => f.write_str("TimedOut"),
        }
    }
}

/// Terminal result for one resource, produced at most once per session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub state: SyncState,
    pub message: String,
}

/// One trigger-then-converge run over a fixed set of resources.
#[derive(Debug)]
pub struct TrackingSession {
    resources: BTreeSet<ResourceRef>,
    baselines: BTreeMap<ResourceRef, Baseline>,
    outcomes: BTreeMap<ResourceRef, Outcome>,
    deadline: Instant,
}

impl TrackingSession {
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources.iter()
    }

    pub fn outcome(&self, resource: &ResourceRef) -> Option<&Outcome> {
        self.outcomes.get(resource)
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.len() == self.resources.len()
    }

    fn pending(&self) -> Vec<ResourceRef> {
        self.resources
            .iter()
            .filter(|resource| !self.outcomes.contains_key(*resource))
            .cloned()
            .collect()
    }

    fn baseline_marker(&self, resource: &ResourceRef) -> Option<&str> {
        self.baselines
            .get(resource)
            .and_then(|baseline| baseline.marker.as_deref())
    }

    /// The first terminal observation for a resource wins; later writes
    /// for the same resource are dropped.
    fn record(&mut self, resource: ResourceRef, outcome: Outcome) {
        if !self.resources.contains(&resource) {
            return;
        }
        self.outcomes.entry(resource).or_insert(outcome);
    }

    fn expire(&mut self) {
        for resource in self.pending() {
            debug!("{resource} never moved away from its baseline marker");
            self.record(
                resource,
                Outcome {
                    state: SyncState::TimedOut,
                    message: "no reconciliation observed before the deadline".to_string(),
                },
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn with_outcomes(
        resources: BTreeSet<ResourceRef>,
        outcomes: BTreeMap<ResourceRef, Outcome>,
    ) -> Self {
        Self {
            resources,
            baselines: BTreeMap::new(),
            outcomes,
            deadline: Instant::now(),
        }
    }
}

pub struct ConvergenceTracker<R, T> {
    reader: R,
    trigger: T,
    interval: Duration,
}

impl<R, T> ConvergenceTracker<R, T>
where
    R: StatusReader,
    T: SyncTrigger,
{
    pub fn new(reader: R, trigger: T) -> Self {
        Self {
            reader,
            trigger,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Captures the pre-trigger marker for every resource. A resource whose
    /// status cannot be read gets an absent baseline marker, so a later
    /// change is still detectable.
    pub async fn start_session(
        &self,
        resources: BTreeSet<ResourceRef>,
        timeout: Duration,
    ) -> Result<TrackingSession, EmptySet> {
        if resources.is_empty() {
            return Err(EmptySet);
        }

        let baselines = join_all(resources.iter().map(|resource| async move {
            let marker = match self.reader.read(resource).await {
                Ok(status) => status.marker,
                Err(err) => {
                    debug!("baseline read for {resource} failed, treating as never converged: {err}");
                    None
                }
            };
            (resource.clone(), Baseline { marker })
        }))
        .await
        .into_iter()
        .collect();

        Ok(TrackingSession {
            resources,
            baselines,
            outcomes: BTreeMap::new(),
            deadline: Instant::now() + timeout,
        })
    }

    /// Fires the trigger for every resource in the session. A resource whose
    /// trigger cannot be delivered is resolved as Failed immediately and not
    /// polled further.
    pub async fn trigger(&self, session: &mut TrackingSession) {
        let results = join_all(
            session
                .resources
                .iter()
                .map(|resource| async move { (resource.clone(), self.trigger.fire(resource).await) }),
        )
        .await;

        for (resource, result) in results {
            if let Err(err) = result {
                warn!("trigger for {resource} failed: {err}");
                session.record(
                    resource,
                    Outcome {
                        state: SyncState::Failed,
                        message: err.to_string(),
                    },
                );
            }
        }
    }

    /// Blocks until every resource has an outcome or the deadline passes,
    /// polling pending resources on the configured interval. At the deadline
    /// every still-pending resource is resolved as TimedOut.
    pub async fn poll_until_converged(&self, session: &mut TrackingSession) {
        loop {
            if session.is_complete() {
                return;
            }
            let now = Instant::now();
            if now >= session.deadline {
                session.expire();
                return;
            }
            self.poll_once(session).await;
            if session.is_complete() {
                return;
            }
            tokio::time::sleep_until((now + self.interval).min(session.deadline)).await;
        }
    }

    async fn poll_once(&self, session: &mut TrackingSession) {
        let pending = session.pending();
        let reads = join_all(
            pending
                .iter()
                .map(|resource| async move { (resource.clone(), self.reader.read(resource).await) }),
        )
        .await;

        for (resource, result) in reads {
            let status = match result {
                Ok(status) => status,
                Err(err) => {
                    // Transient read blips degrade to "no new marker
                    // observed"; the resource stays pending.
                    debug!("status read for {resource} failed: {err}");
                    continue;
                }
            };

            if status.marker.as_deref() == session.baseline_marker(&resource) {
                continue;
            }

            let state = if status.ready == Readiness::True {
                SyncState::Synced
            } else {
                SyncState::Failed
            };
            debug!("{resource} completed a reconciliation attempt: {state}");
            session.record(
                resource,
                Outcome {
                    state,
                    message: status.message,
                },
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeRemote;
    use super::*;
    use std::sync::Arc;

    fn tracker(remote: &Arc<FakeRemote>) -> ConvergenceTracker<Arc<FakeRemote>, Arc<FakeRemote>> {
        ConvergenceTracker::new(remote.clone(), remote.clone())
    }

    fn refs(names: &[&str]) -> BTreeSet<ResourceRef> {
        names
            .iter()
            .map(|name| ResourceRef::new("default", *name))
            .collect()
    }

    fn states(session: &TrackingSession) -> Vec<SyncState> {
        session
            .resources()
            .map(|resource| session.outcome(resource).unwrap().state)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_resources_converge_within_one_interval() {
        let remote = Arc::new(FakeRemote::default());
        let resources = refs(&["alpha", "bravo", "charlie"]);
        for resource in &resources {
            remote.set_status(resource, "t1", Readiness::True, "Secret was synced");
        }

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(resources.clone(), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        for resource in &resources {
            remote.set_status(resource, "t2", Readiness::True, "Secret was synced");
        }
        tracker.poll_until_converged(&mut session).await;

        assert!(session.is_complete());
        assert_eq!(states(&session), vec![SyncState::Synced; 3]);
        assert_eq!(remote.fired().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_resource_times_out() {
        let remote = Arc::new(FakeRemote::default());
        let resource = ResourceRef::new("default", "alpha");
        remote.set_unreachable(&resource);

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(6))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        tracker.poll_until_converged(&mut session).await;

        let outcome = session.outcome(&resource).unwrap();
        assert_eq!(outcome.state, SyncState::TimedOut);
    }

    /// Reader whose marker only moves after a fixed delay, to exercise
    /// changes that land past the deadline.
    struct LateRefresh {
        started: Instant,
        delay: Duration,
    }

    #[async_trait]
    impl StatusReader for LateRefresh {
        async fn read(&self, _resource: &ResourceRef) -> Result<ResourceStatus, Unreachable> {
            let marker = if self.started.elapsed() >= self.delay {
                "t2"
            } else {
                "t1"
            };
            Ok(ResourceStatus {
                marker: Some(marker.to_string()),
                ready: Readiness::True,
                message: "Secret was synced".to_string(),
            })
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl SyncTrigger for AcceptAll {
        async fn fire(&self, _resource: &ResourceRef) -> Result<(), TriggerError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn marker_change_after_deadline_is_timed_out() {
        let reader = LateRefresh {
            started: Instant::now(),
            delay: Duration::from_secs(6),
        };
        let tracker = ConvergenceTracker::new(reader, AcceptAll);
        let resource = ResourceRef::new("default", "alpha");

        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(5))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        tracker.poll_until_converged(&mut session).await;

        let outcome = session.outcome(&resource).unwrap();
        assert_eq!(outcome.state, SyncState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_change_without_readiness_is_failed() {
        let remote = Arc::new(FakeRemote::default());
        let resource = ResourceRef::new("default", "alpha");
        remote.set_status(&resource, "t1", Readiness::True, "Secret was synced");

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        remote.set_status(
            &resource,
            "t2",
            Readiness::False,
            "could not get secret data from provider",
        );
        tracker.poll_until_converged(&mut session).await;

        let outcome = session.outcome(&resource).unwrap();
        assert_eq!(outcome.state, SyncState::Failed);
        assert_eq!(outcome.message, "could not get secret data from provider");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_trigger_is_failed_and_not_polled() {
        let remote = Arc::new(FakeRemote::default());
        let rejected = ResourceRef::new("default", "alpha");
        let accepted = ResourceRef::new("default", "bravo");
        remote.set_status(&rejected, "t1", Readiness::True, "Secret was synced");
        remote.set_status(&accepted, "t1", Readiness::True, "Secret was synced");
        remote.reject_trigger(&rejected);

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha", "bravo"]), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        // Both markers move; only the accepted resource may resolve from it.
        remote.set_status(&rejected, "t2", Readiness::True, "Secret was synced");
        remote.set_status(&accepted, "t2", Readiness::True, "Secret was synced");
        tracker.poll_until_converged(&mut session).await;

        assert_eq!(
            session.outcome(&rejected).unwrap().state,
            SyncState::Failed
        );
        assert_eq!(
            session.outcome(&rejected).unwrap().message,
            "apiserver rejected the patch"
        );
        assert_eq!(session.outcome(&accepted).unwrap().state, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn triggering_twice_records_a_single_outcome() {
        let remote = Arc::new(FakeRemote::default());
        let resource = ResourceRef::new("default", "alpha");
        remote.set_status(&resource, "t1", Readiness::True, "Secret was synced");

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        tracker.trigger(&mut session).await;
        remote.set_status(&resource, "t2", Readiness::True, "Secret was synced");
        tracker.poll_until_converged(&mut session).await;

        assert_eq!(remote.fired().len(), 2);
        assert!(session.is_complete());
        assert_eq!(session.outcome(&resource).unwrap().state, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_resource_set_is_rejected() {
        let remote = Arc::new(FakeRemote::default());
        let tracker = tracker(&remote);

        let result = tracker
            .start_session(BTreeSet::new(), Duration::from_secs(30))
            .await;

        assert!(result.is_err());
        assert!(remote.fired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_ever_convergence_is_detected_from_absent_baseline() {
        let remote = Arc::new(FakeRemote::default());
        let resource = ResourceRef::new("default", "alpha");
        // No status at all before the trigger: baseline marker is absent.

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        remote.set_status(&resource, "t1", Readiness::True, "Secret was synced");
        tracker.poll_until_converged(&mut session).await;

        assert_eq!(session.outcome(&resource).unwrap().state, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_baseline_degrades_to_absent_marker() {
        let remote = Arc::new(FakeRemote::default());
        let resource = ResourceRef::new("default", "alpha");
        remote.set_unreachable(&resource);

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(refs(&["alpha"]), Duration::from_secs(30))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;

        // The resource becomes reachable again mid-run; its marker now
        // differs from the absent baseline.
        remote.clear_unreachable();
        remote.set_status(&resource, "t1", Readiness::True, "Secret was synced");
        tracker.poll_until_converged(&mut session).await;

        assert_eq!(session.outcome(&resource).unwrap().state, SyncState::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn every_resource_has_exactly_one_outcome() {
        let remote = Arc::new(FakeRemote::default());
        let resources = refs(&["alpha", "bravo", "charlie"]);
        let alpha = ResourceRef::new("default", "alpha");
        remote.set_status(&alpha, "t1", Readiness::True, "Secret was synced");
        remote.reject_trigger(&ResourceRef::new("default", "bravo"));
        remote.set_unreachable(&ResourceRef::new("default", "charlie"));

        let tracker = tracker(&remote);
        let mut session = tracker
            .start_session(resources.clone(), Duration::from_secs(6))
            .await
            .unwrap();
        tracker.trigger(&mut session).await;
        remote.set_status(&alpha, "t2", Readiness::True, "Secret was synced");
        tracker.poll_until_converged(&mut session).await;

        assert!(session.is_complete());
        assert_eq!(
            states(&session),
            vec![SyncState::Synced, SyncState::Failed, SyncState::TimedOut]
        );
    }
}
