//! Capability contract for the vendor stream client.
//!
//! The wire protocol, transport and frame decoding live in the vendor SDK.
//! This module only describes the narrow surface the rest of the crate needs:
//! lifecycle calls, the two acquisition calls (one per [`BackendMode`]) and the
//! per-entity getters. Every call reports a [`Status`]; value-bearing calls
//! wrap their value in an [`Output`].

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{MocapError, Result};

/// Which of the two mutually exclusive stream clients drives a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Pull/push client: frames are fetched explicitly with `acquire_frame`.
    #[default]
    Direct,
    /// Retiming client: server frames are resampled onto the local clock.
    Retimed,
}

/// Server streaming strategy. Only meaningful for [`BackendMode::Direct`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    ServerPush,
    ClientPull,
    #[default]
    ClientPullPreFetch,
}

/// Outcome code of a single backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    Success,
    NotConnected,
    NoFrame,
    InvalidHostName,
    InvalidSubjectName,
    InvalidSegmentName,
    InvalidMarkerName,
    InvalidDeviceName,
    InvalidDeviceOutputName,
    InvalidIndex,
    NotSupported,
    /// The backend handle itself could not be used (its lock was poisoned).
    #[default]
    Unavailable,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A backend value paired with the status of the call that produced it.
///
/// The value is only meaningful when `status` is [`Status::Success`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output<T> {
    pub status: Status,
    pub value: T,
}

impl<T> Output<T> {
    pub fn new(status: Status, value: T) -> Self {
        Self { status, value }
    }

    pub fn success(value: T) -> Self {
        Self::new(Status::Success, value)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns the value when the call succeeded.
    pub fn ok(self) -> Option<T> {
        if self.is_success() {
            Some(self.value)
        } else {
            None
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Output<U> {
        Output {
            status: self.status,
            value: f(self.value),
        }
    }
}

impl<T: Default> Output<T> {
    /// Output carrying a failure status and a default value.
    pub fn failed(status: Status) -> Self {
        Self::new(status, T::default())
    }
}

impl<T: Default> From<std::result::Result<T, Status>> for Output<T> {
    fn from(result: std::result::Result<T, Status>) -> Self {
        match result {
            Ok(value) => Output::success(value),
            Err(status) => Output::failed(status),
        }
    }
}

/// World direction assigned to a local axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Backward,
}

/// Axis convention requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMapping {
    pub x: Direction,
    pub y: Direction,
    pub z: Direction,
}

impl AxisMapping {
    /// X forward, Y left, Z up. Applied on every direct-mode connect.
    pub const FORWARD_LEFT_UP: AxisMapping = AxisMapping {
        x: Direction::Forward,
        y: Direction::Left,
        z: Direction::Up,
    };
}

/// Kind of an analog device streamed next to the pose data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    ForcePlate,
    #[default]
    Unknown,
}

/// Capability surface of a vendor stream client.
///
/// Implementations are not assumed to be thread-safe; the crate serialises all
/// access through [`SharedBackend`]. Getters report stale or undefined values
/// when called before the first frame has been acquired.
pub trait StreamBackend: Send {
    /// Variant implemented by this backend.
    fn mode(&self) -> BackendMode;

    /// Connects to a `;`-joined list of `host:port` targets. The backend
    /// decides how to fall back between hosts.
    fn connect(&mut self, target: &str) -> Status;

    fn is_connected(&self) -> bool;

    /// Disconnects. Must be a no-op when already disconnected.
    fn disconnect(&mut self) -> Status;

    fn set_stream_mode(&mut self, mode: StreamMode) -> Status;

    fn enable_lightweight_segment_data(&mut self) -> Status;

    fn enable_segment_data(&mut self) -> Status;

    fn set_axis_mapping(&mut self, mapping: AxisMapping) -> Status;

    fn add_to_subject_filter(&mut self, subject: &str) -> Status;

    /// Pulls the next frame. Direct variant only.
    fn acquire_frame(&mut self) -> Status {
        Status::NotSupported
    }

    /// Moves the retiming clock forward, sampling `offset_seconds` behind
    /// real time. Retimed variant only.
    fn advance_clock(&mut self, _offset_seconds: f64) -> Status {
        Status::NotSupported
    }

    fn start_timing_log(&mut self, _client_log: &Path, _stream_log: &Path) -> Status {
        Status::NotSupported
    }

    fn stop_timing_log(&mut self) -> Status {
        Status::NotSupported
    }

    fn frame_number(&self) -> Output<u32>;
    fn frame_rate(&self) -> Output<f64>;
    fn latency_total(&self) -> Output<f64>;

    fn subject_count(&self) -> Output<u32>;
    fn subject_name(&self, index: u32) -> Output<String>;
    fn subject_root_segment_name(&self, subject: &str) -> Output<String>;

    fn segment_count(&self, subject: &str) -> Output<u32>;
    fn segment_name(&self, subject: &str, index: u32) -> Output<String>;
    /// Parent of a segment. Fails (or yields an empty name) at the root.
    fn segment_parent_name(&self, subject: &str, segment: &str) -> Output<String>;
    fn segment_local_translation(&self, subject: &str, segment: &str) -> Output<[f64; 3]>;
    /// Rotation as an `[x, y, z, w]` quaternion.
    fn segment_local_rotation(&self, subject: &str, segment: &str) -> Output<[f64; 4]>;
    fn segment_static_scale(&self, subject: &str, segment: &str) -> Output<[f64; 3]>;

    fn marker_count(&self, subject: &str) -> Output<u32>;
    fn marker_name(&self, subject: &str, index: u32) -> Output<String>;
    /// Global marker position and whether the marker is occluded.
    fn marker_global_translation(&self, subject: &str, marker: &str) -> Output<([f64; 3], bool)>;

    fn device_count(&self) -> Output<u32>;
    fn device_name(&self, index: u32) -> Output<(String, DeviceKind)>;
    fn device_output_count(&self, device: &str) -> Output<u32>;
    /// Output name and unit label.
    fn device_output_name(&self, device: &str, index: u32) -> Output<(String, String)>;
    fn device_output_subsamples(&self, device: &str, output: &str) -> Output<u32>;
    /// Output value and occlusion flag. `subsample` selects a sub-frame
    /// sample; `None` reads the first one.
    fn device_output_value(
        &self,
        device: &str,
        output: &str,
        subsample: Option<u32>,
    ) -> Output<(f64, bool)>;

    fn force_plate_count(&self) -> Output<u32>;
    fn global_force(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]>;
    fn global_moment(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]>;
    fn global_center_of_pressure(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]>;
}

/// Creates backends on demand for a given mode.
pub trait BackendFactory: Send + Sync {
    fn create(&self, mode: BackendMode) -> Box<dyn StreamBackend>;
}

impl<F> BackendFactory for F
where
    F: Fn(BackendMode) -> Box<dyn StreamBackend> + Send + Sync,
{
    fn create(&self, mode: BackendMode) -> Box<dyn StreamBackend> {
        self(mode)
    }
}

/// Shared, lock-guarded handle over one backend instance.
///
/// Holding the guard is what keeps a frame pull and a query from overlapping
/// on the same backend.
#[derive(Clone)]
pub struct SharedBackend {
    mode: BackendMode,
    inner: Arc<Mutex<Box<dyn StreamBackend>>>,
}

impl SharedBackend {
    pub fn new(backend: Box<dyn StreamBackend>) -> Self {
        Self {
            mode: backend.mode(),
            inner: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn StreamBackend>>> {
        self.inner
            .lock()
            .map_err(|_| MocapError::Poisoned("stream backend"))
    }
}

impl fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBackend")
            .field("mode", &self.mode)
            .finish()
    }
}
