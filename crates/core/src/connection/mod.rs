//! Session lifecycle for a stream backend.
//!
//! [`ConnectionManager`] owns the backends and runs one session at a time. A
//! session spawns a single worker thread that:
//!
//! 1. retries `connect` on a fixed interval until it succeeds, the attempt
//!    bound is hit, or the session is cancelled;
//! 2. negotiates the stream (stream mode, segment data format, axis mapping)
//!    as the backend variant requires;
//! 3. marks the session connected and notifies the registered callback;
//! 4. keeps pulling frames when the session uses the background acquisition
//!    loop, otherwise exits and leaves acquisition to [`ConnectionManager::tick`].
//!
//! `stop()` cancels the worker, joins it, and only then disconnects every
//! backend the manager has created.

mod cancel;
mod retry;
mod state;

pub use cancel::CancellationToken;
pub use retry::RetryPolicy;
pub(crate) use state::ConnectionEvent;
pub use state::{ConnectionState, ConnectionStatus};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionModel, FrameScheduler, SubjectFilter};
use crate::{
    AxisMapping, BackendFactory, BackendMode, MocapError, QueryFacade, Result, SharedBackend,
    Status, StreamBackend, StreamConfig, StreamMode,
};

/// Invoked with `true` once a session is connected and negotiated, and with
/// `false` when a connected session is stopped or the worker gives up
/// connecting after its attempt bound.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Pause after a failed background frame pull.
const FAILED_FRAME_BACKOFF: Duration = Duration::from_millis(10);

/// Segment payload negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDataFormat {
    Lightweight,
    Standard,
    Unavailable,
}

/// Enables lightweight segment data when preferred, falling back to the
/// standard form. The standard form is requested only when lightweight data
/// was not preferred or was refused.
pub fn enable_segment_data(
    backend: &mut dyn StreamBackend,
    prefer_lightweight: bool,
) -> SegmentDataFormat {
    if prefer_lightweight {
        let status = backend.enable_lightweight_segment_data();
        if status.is_success() {
            return SegmentDataFormat::Lightweight;
        }
        warn!(%status, "lightweight segment data unavailable, using standard segment data");
    }

    let status = backend.enable_segment_data();
    if status.is_success() {
        SegmentDataFormat::Standard
    } else {
        warn!(%status, "failed to enable segment data");
        SegmentDataFormat::Unavailable
    }
}

struct Session {
    backend: SharedBackend,
    scheduler: FrameScheduler,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

/// Owns the stream backends and drives one session at a time.
pub struct ConnectionManager {
    factory: Box<dyn BackendFactory>,
    backends: HashMap<BackendMode, SharedBackend>,
    status: ConnectionStatus,
    filter: Arc<Mutex<SubjectFilter>>,
    callback: Option<ConnectionCallback>,
    session: Option<Session>,
}

impl ConnectionManager {
    pub fn new(factory: impl BackendFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            backends: HashMap::new(),
            status: ConnectionStatus::new(),
            filter: Arc::new(Mutex::new(SubjectFilter::new())),
            callback: None,
            session: None,
        }
    }

    /// Registers the connection-state callback used by sessions started
    /// afterwards.
    pub fn on_connection_changed(&mut self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Cloneable accessor other threads can poll.
    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    /// Mode of the current session, if any.
    pub fn mode(&self) -> Option<BackendMode> {
        self.session.as_ref().map(|s| s.backend.mode())
    }

    pub fn acquisition_model(&self) -> Option<AcquisitionModel> {
        self.session.as_ref().map(|s| s.scheduler.model())
    }

    /// Successful acquisitions in the current session.
    pub fn frames_acquired(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.scheduler.frames_acquired())
    }

    /// Adds subjects to the stream filter of the running session, or of the
    /// next one when none is running. Once the filter has reached the backend
    /// it is fixed for the session and this returns `false`. Stopping a
    /// session clears the filter.
    pub fn set_subject_filter<I, S>(&self, names: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accepted = self.lock_filter()?.extend(names);
        if !accepted {
            info!("subject filter already applied for this session, ignoring new names");
        }
        Ok(accepted)
    }

    /// Starts a session on a background thread. A running session is stopped
    /// first, which is also how the backend mode is switched.
    pub fn start(&mut self, config: &StreamConfig) -> Result<()> {
        config.validate()?;
        let target = config.combined_target()?;

        if self.session.is_some() {
            info!(mode = ?config.mode, "restarting stream session");
            self.stop()?;
        }

        self.lock_filter()?
            .extend(config.subject_filter.iter().cloned());

        let backend = self.backend_for(config.mode);
        let scheduler = FrameScheduler::new(
            backend.clone(),
            Arc::clone(&self.filter),
            config.consumer_ticks,
            config.offset_seconds,
        );
        self.status.transition(ConnectionEvent::Start)?;

        let cancel = CancellationToken::new();
        let worker = SessionWorker {
            backend: backend.clone(),
            target,
            stream_mode: config.stream_mode,
            use_lightweight: config.use_lightweight_data,
            retry: RetryPolicy::from(&config.retry),
            cancel: cancel.clone(),
            status: self.status.clone(),
            callback: self.callback.clone(),
            scheduler: scheduler.clone(),
        };

        info!(
            endpoints = %worker.target,
            mode = ?config.mode,
            model = ?scheduler.model(),
            "starting stream session"
        );

        let handle = thread::Builder::new()
            .name("mocap-connection".to_string())
            .spawn(move || worker.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.status.transition(ConnectionEvent::Stop)?;
                return Err(err.into());
            }
        };

        self.session = Some(Session {
            backend,
            scheduler,
            cancel,
            worker: Some(handle),
        });
        Ok(())
    }

    /// Stops the session: cancels and joins the worker, then disconnects
    /// every backend. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        let mut panicked = false;
        if let Some(mut session) = self.session.take() {
            session.cancel.cancel();
            if let Some(worker) = session.worker.take() {
                panicked = worker.join().is_err();
            }
        }

        // Stale query handles see the state change before the backends close.
        let previous = self.status.transition(ConnectionEvent::Stop)?;
        self.teardown();
        self.lock_filter()?.clear();

        if previous == ConnectionState::Connected {
            info!("stream session stopped");
            if let Some(callback) = &self.callback {
                callback(false);
            }
        }

        if panicked {
            error!("connection worker panicked");
            return Err(MocapError::WorkerPanicked);
        }
        Ok(())
    }

    /// Per-tick hook for the consumer. Acquires one frame when the session is
    /// connected and the consumer owns acquisition; returns `None` otherwise.
    pub fn tick(&self) -> Result<Option<Status>> {
        match &self.session {
            Some(session) if self.status.is_connected() => session.scheduler.on_tick(),
            _ => Ok(None),
        }
    }

    /// Query access to the current session's backend.
    pub fn query(&self) -> Option<QueryFacade> {
        self.session
            .as_ref()
            .map(|s| QueryFacade::new(s.backend.clone(), self.status.clone()))
    }

    /// Asks the active backend to write client and stream timing records to
    /// the given files.
    pub fn start_timing_log(
        &self,
        client_log: impl AsRef<Path>,
        stream_log: impl AsRef<Path>,
    ) -> Result<Status> {
        let backend = self.active_backend("start_timing_log")?;
        let status = backend
            .lock()?
            .start_timing_log(client_log.as_ref(), stream_log.as_ref());
        if status.is_success() {
            info!(
                client = %client_log.as_ref().display(),
                stream = %stream_log.as_ref().display(),
                "timing log started"
            );
        } else {
            warn!(%status, "failed to start timing log");
        }
        Ok(status)
    }

    pub fn stop_timing_log(&self) -> Result<Status> {
        let backend = self.active_backend("stop_timing_log")?;
        let status = backend.lock()?.stop_timing_log();
        Ok(status)
    }

    fn active_backend(&self, action: &'static str) -> Result<&SharedBackend> {
        self.session
            .as_ref()
            .map(|s| &s.backend)
            .ok_or(MocapError::InvalidState {
                state: self.status.state(),
                action,
            })
    }

    fn backend_for(&mut self, mode: BackendMode) -> SharedBackend {
        let factory = &self.factory;
        self.backends
            .entry(mode)
            .or_insert_with(|| SharedBackend::new(factory.create(mode)))
            .clone()
    }

    /// Disconnects every backend this manager has created. Backends that are
    /// already disconnected treat this as a no-op.
    fn teardown(&self) {
        for (mode, backend) in &self.backends {
            match backend.lock() {
                Ok(mut backend) => {
                    let status = backend.disconnect();
                    debug!(?mode, %status, "backend disconnected");
                }
                Err(err) => warn!(?mode, %err, "cannot disconnect backend"),
            }
        }
    }

    fn lock_filter(&self) -> Result<MutexGuard<'_, SubjectFilter>> {
        self.filter
            .lock()
            .map_err(|_| MocapError::Poisoned("subject filter"))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "error while stopping stream session");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.status.state())
            .field("mode", &self.mode())
            .field("backends", &self.backends.len())
            .finish()
    }
}

/// Everything the worker thread needs, moved in at spawn time.
struct SessionWorker {
    backend: SharedBackend,
    target: String,
    stream_mode: StreamMode,
    use_lightweight: bool,
    retry: RetryPolicy,
    cancel: CancellationToken,
    status: ConnectionStatus,
    callback: Option<ConnectionCallback>,
    scheduler: FrameScheduler,
}

impl SessionWorker {
    fn run(self) {
        if let Err(err) = self.drive() {
            error!(%err, "connection worker failed");
        }
        debug!("connection worker exited");
    }

    fn drive(&self) -> Result<()> {
        if !self.connect_with_retry()? {
            return Ok(());
        }

        self.negotiate()?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.status.transition(ConnectionEvent::Established)?;
        info!(endpoints = %self.target, mode = ?self.backend.mode(), "stream connected");
        if let Some(callback) = &self.callback {
            callback(true);
        }

        if self.scheduler.model().runs_in_background() {
            self.acquisition_loop()?;
        }
        Ok(())
    }

    /// Returns `false` when the session was cancelled or gave up.
    fn connect_with_retry(&self) -> Result<bool> {
        let interval = self.retry.interval();
        let mut attempt: u32 = 0;

        while !self.cancel.is_cancelled() {
            attempt = attempt.saturating_add(1);
            let (status, connected) = {
                let mut backend = self.backend.lock()?;
                let status = backend.connect(&self.target);
                (status, backend.is_connected())
            };

            if connected {
                info!(endpoints = %self.target, attempt, "connected to stream server");
                return Ok(true);
            }

            if !self.retry.allows_retry_after(attempt) {
                error!(endpoints = %self.target, attempt, %status, "giving up on stream server");
                self.status.transition(ConnectionEvent::Stop)?;
                // Consumers waiting for the connected notification learn it
                // will not come.
                if let Some(callback) = &self.callback {
                    callback(false);
                }
                return Ok(false);
            }

            warn!(
                endpoints = %self.target,
                attempt,
                %status,
                retry_in_ms = interval.as_millis() as u64,
                "failed to connect to stream server"
            );
            if self.cancel.wait_timeout(interval) {
                break;
            }
        }

        debug!(attempt, "connect loop cancelled");
        Ok(false)
    }

    fn negotiate(&self) -> Result<()> {
        let mut guard = self.backend.lock()?;
        let backend = guard.as_mut();

        match backend.mode() {
            BackendMode::Direct => {
                let status = backend.set_stream_mode(self.stream_mode);
                log_step("set stream mode", status);

                // Supported data types are only known once a frame has arrived.
                let status = backend.acquire_frame();
                log_step("pre-fetch frame", status);

                let format = enable_segment_data(backend, self.use_lightweight);
                info!(?format, "segment data negotiated");

                let status = backend.set_axis_mapping(AxisMapping::FORWARD_LEFT_UP);
                log_step("set axis mapping", status);
            }
            BackendMode::Retimed => {
                if self.use_lightweight {
                    let status = backend.enable_lightweight_segment_data();
                    if status.is_success() {
                        info!("lightweight segment data enabled");
                    } else {
                        warn!(%status, "lightweight segment data not enabled");
                    }
                }
            }
        }
        Ok(())
    }

    fn acquisition_loop(&self) -> Result<()> {
        debug!("background acquisition started");
        while !self.cancel.is_cancelled() {
            let status = self.scheduler.acquire()?;
            if !status.is_success() {
                debug!(%status, "frame acquisition failed");
                if self.cancel.wait_timeout(FAILED_FRAME_BACKOFF) {
                    break;
                }
            }
            // Let queued consumers take the backend lock between frames.
            thread::yield_now();
        }
        debug!(
            frames = self.scheduler.frames_acquired(),
            "background acquisition stopped"
        );
        Ok(())
    }
}

fn log_step(step: &str, status: Status) {
    if status.is_success() {
        debug!(step, "negotiation step done");
    } else {
        warn!(step, %status, "negotiation step failed");
    }
}
