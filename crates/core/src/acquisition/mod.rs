//! Frame acquisition scheduling.
//!
//! Each session acquires frames in exactly one way, fixed when the session is
//! started:
//!
//! * [`AcquisitionModel::BackgroundLoop`]: direct sessions without a consumer
//!   tick. The connection worker pulls frames back to back.
//! * [`AcquisitionModel::ConsumerTick`]: direct sessions whose consumer calls
//!   `tick()`. One frame is pulled per tick and no loop is spawned.
//! * [`AcquisitionModel::ClockDriven`]: retimed sessions. Each tick advances
//!   the retiming clock.
//!
//! Every acquisition also applies the pending subject filter until it has been
//! applied once.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::{BackendMode, MocapError, Result, SharedBackend, Status, StreamBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionModel {
    BackgroundLoop,
    ConsumerTick,
    ClockDriven,
}

impl AcquisitionModel {
    pub fn select(mode: BackendMode, consumer_ticks: bool) -> Self {
        match (mode, consumer_ticks) {
            (BackendMode::Retimed, _) => AcquisitionModel::ClockDriven,
            (BackendMode::Direct, true) => AcquisitionModel::ConsumerTick,
            (BackendMode::Direct, false) => AcquisitionModel::BackgroundLoop,
        }
    }

    /// Whether the connection worker owns acquisition for this model.
    pub fn runs_in_background(self) -> bool {
        self == AcquisitionModel::BackgroundLoop
    }
}

/// Subjects the server should restrict its stream to.
///
/// The filter is applied lazily on acquisition. Each name is sent until the
/// backend accepts it and never again afterwards. Once every name has been
/// accepted the filter is immutable until [`clear`](Self::clear).
#[derive(Debug, Clone, Default)]
pub struct SubjectFilter {
    names: BTreeSet<String>,
    accepted: BTreeSet<String>,
    applied: bool,
    reported_stuck: bool,
}

impl SubjectFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds names to the pending filter. Returns `false` and leaves the filter
    /// untouched once it has been applied.
    pub fn extend<I, S>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.applied {
            return false;
        }
        self.names.extend(names.into_iter().map(Into::into));
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Names the backend has not accepted yet.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.names.difference(&self.accepted).map(String::as_str)
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Drops every name. Called when a session ends, since the server forgets
    /// the filter on disconnect.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Sends the names not yet accepted to `backend`, unless the filter is
    /// empty or already applied. Returns `true` when this call completed the
    /// application.
    pub fn apply(&mut self, backend: &mut dyn StreamBackend) -> bool {
        if self.applied || self.names.is_empty() {
            return false;
        }

        let mut rejected = Vec::new();
        for name in &self.names {
            if self.accepted.contains(name) {
                continue;
            }
            let status = backend.add_to_subject_filter(name);
            if status.is_success() {
                self.accepted.insert(name.clone());
            } else {
                debug!(subject = %name, %status, "subject filter not accepted yet");
                rejected.push(name.as_str());
            }
        }

        if rejected.is_empty() {
            info!(subjects = self.names.len(), "subject filter applied");
            self.applied = true;
            return true;
        }

        if !self.reported_stuck {
            warn!(subjects = ?rejected, "subject filter rejected, retrying on every frame");
            self.reported_stuck = true;
        }
        false
    }
}

/// Performs acquisitions against a session's backend.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    backend: SharedBackend,
    filter: Arc<Mutex<SubjectFilter>>,
    model: AcquisitionModel,
    offset_seconds: f64,
    acquired: Arc<AtomicU64>,
}

impl FrameScheduler {
    pub fn new(
        backend: SharedBackend,
        filter: Arc<Mutex<SubjectFilter>>,
        consumer_ticks: bool,
        offset_seconds: f64,
    ) -> Self {
        let model = AcquisitionModel::select(backend.mode(), consumer_ticks);
        Self {
            backend,
            filter,
            model,
            offset_seconds,
            acquired: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn model(&self) -> AcquisitionModel {
        self.model
    }

    /// Number of successful acquisitions so far.
    pub fn frames_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Acquires one frame, applying the subject filter first if it is still
    /// pending. The backend stays locked for the whole call.
    pub fn acquire(&self) -> Result<Status> {
        let mut backend = self.backend.lock()?;
        self.lock_filter()?.apply(backend.as_mut());

        let status = match self.model {
            AcquisitionModel::ClockDriven => backend.advance_clock(self.offset_seconds),
            AcquisitionModel::BackgroundLoop | AcquisitionModel::ConsumerTick => {
                backend.acquire_frame()
            }
        };

        if status.is_success() {
            self.acquired.fetch_add(1, Ordering::Relaxed);
        }
        Ok(status)
    }

    /// Consumer tick hook. Acquires one frame unless the background loop owns
    /// acquisition, in which case nothing happens and `None` is returned.
    pub fn on_tick(&self) -> Result<Option<Status>> {
        if self.model.runs_in_background() {
            return Ok(None);
        }
        self.acquire().map(Some)
    }

    fn lock_filter(&self) -> Result<MutexGuard<'_, SubjectFilter>> {
        self.filter
            .lock()
            .map_err(|_| MocapError::Poisoned("subject filter"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CallLog, SimBehaviour, SimScene, SimulatedBackend};

    fn connected_backend(mode: BackendMode, behaviour: SimBehaviour) -> (SharedBackend, CallLog) {
        let backend = SimulatedBackend::new(mode, SimScene::demo(), behaviour);
        let log = backend.call_log();
        let shared = SharedBackend::new(Box::new(backend));
        assert!(shared.lock().unwrap().connect("localhost:801").is_success());
        (shared, log)
    }

    fn filter_of(names: &[&str]) -> Arc<Mutex<SubjectFilter>> {
        let mut filter = SubjectFilter::new();
        filter.extend(names.iter().copied());
        Arc::new(Mutex::new(filter))
    }

    #[test]
    fn selects_one_model_per_session() {
        assert_eq!(
            AcquisitionModel::select(BackendMode::Direct, false),
            AcquisitionModel::BackgroundLoop
        );
        assert_eq!(
            AcquisitionModel::select(BackendMode::Direct, true),
            AcquisitionModel::ConsumerTick
        );
        assert_eq!(
            AcquisitionModel::select(BackendMode::Retimed, false),
            AcquisitionModel::ClockDriven
        );
        assert!(!AcquisitionModel::ConsumerTick.runs_in_background());
        assert!(!AcquisitionModel::ClockDriven.runs_in_background());
    }

    #[test]
    fn filter_is_applied_once_across_many_acquisitions() {
        let (backend, log) = connected_backend(BackendMode::Direct, SimBehaviour::default());
        let filter = filter_of(&["Actor1", "Prop"]);
        let scheduler = FrameScheduler::new(backend, filter.clone(), true, 0.0);

        for _ in 0..25 {
            assert_eq!(scheduler.acquire().unwrap(), Status::Success);
        }

        assert_eq!(log.count("add_to_subject_filter"), 2);
        assert_eq!(log.count("acquire_frame"), 25);
        assert_eq!(scheduler.frames_acquired(), 25);
        assert!(filter.lock().unwrap().is_applied());
    }

    #[test]
    fn filter_is_retried_until_accepted() {
        let behaviour = SimBehaviour {
            failed_filter_calls: 2,
            ..Default::default()
        };
        let (backend, log) = connected_backend(BackendMode::Direct, behaviour);
        let scheduler = FrameScheduler::new(backend, filter_of(&["Actor1"]), true, 0.0);

        for _ in 0..10 {
            scheduler.acquire().unwrap();
        }

        assert_eq!(log.count("add_to_subject_filter"), 3);
    }

    #[test]
    fn accepted_names_are_not_sent_again() {
        let behaviour = SimBehaviour {
            failed_filter_calls: 1,
            ..Default::default()
        };
        let (backend, log) = connected_backend(BackendMode::Direct, behaviour);
        let filter = filter_of(&["Actor1", "Prop"]);
        let scheduler = FrameScheduler::new(backend, filter.clone(), true, 0.0);

        // "Actor1" is sent first and rejected, "Prop" is accepted.
        scheduler.acquire().unwrap();
        assert_eq!(log.count("add_to_subject_filter"), 2);
        assert_eq!(filter.lock().unwrap().pending().collect::<Vec<_>>(), vec!["Actor1"]);

        for _ in 0..5 {
            scheduler.acquire().unwrap();
        }
        assert_eq!(log.count("add_to_subject_filter"), 3);
        assert!(filter.lock().unwrap().is_applied());
    }

    #[test]
    fn cleared_filter_starts_over() {
        let mut filter = SubjectFilter::new();
        filter.extend(["Prop"]);
        let (backend, _log) = connected_backend(BackendMode::Direct, SimBehaviour::default());
        assert!(filter.apply(backend.lock().unwrap().as_mut()));

        filter.clear();
        assert!(!filter.is_applied());
        assert_eq!(filter.names().count(), 0);
        assert!(filter.extend(["Actor1"]));
        assert_eq!(filter.pending().collect::<Vec<_>>(), vec!["Actor1"]);
    }

    #[test]
    fn applied_filter_rejects_new_names() {
        let mut filter = SubjectFilter::new();
        assert!(filter.extend(["Actor1"]));
        let (backend, _log) = connected_backend(BackendMode::Direct, SimBehaviour::default());
        assert!(filter.apply(backend.lock().unwrap().as_mut()));

        assert!(!filter.extend(["Actor2"]));
        assert_eq!(filter.names().collect::<Vec<_>>(), vec!["Actor1"]);
        assert!(!filter.apply(backend.lock().unwrap().as_mut()));
    }

    #[test]
    fn empty_filter_makes_no_calls() {
        let (backend, log) = connected_backend(BackendMode::Direct, SimBehaviour::default());
        let scheduler = FrameScheduler::new(backend, filter_of(&[]), true, 0.0);
        scheduler.acquire().unwrap();
        assert_eq!(log.count("add_to_subject_filter"), 0);
    }

    #[test]
    fn background_model_ignores_consumer_ticks() {
        let (backend, log) = connected_backend(BackendMode::Direct, SimBehaviour::default());
        let scheduler = FrameScheduler::new(backend, filter_of(&[]), false, 0.0);

        for _ in 0..5 {
            assert_eq!(scheduler.on_tick().unwrap(), None);
        }
        assert_eq!(log.count("acquire_frame"), 0);
    }

    #[test]
    fn retimed_ticks_advance_the_clock() {
        let (backend, log) = connected_backend(BackendMode::Retimed, SimBehaviour::default());
        let scheduler = FrameScheduler::new(backend, filter_of(&[]), false, 0.02);

        assert_eq!(scheduler.model(), AcquisitionModel::ClockDriven);
        assert_eq!(scheduler.on_tick().unwrap(), Some(Status::Success));
        assert_eq!(log.count("advance_clock"), 1);
        assert_eq!(log.count("acquire_frame"), 0);
        assert_eq!(log.last_offset(), Some(0.02));
    }
}
