//! Consumer-facing read access to the active backend.
//!
//! [`QueryFacade`] forwards each query to the backend of the session it was
//! handed out for and returns the backend's status unchanged. It only narrows
//! values to `f32` and gathers per-entity calls into one result. Nothing is
//! read while the session is not connected.

use serde::Serialize;
use tracing::warn;

use crate::connection::ConnectionStatus;
use crate::{hierarchy, BackendMode, DeviceKind, Output, SharedBackend, Status, StreamBackend};

/// Frame number reported by retimed sessions, which have no stable counter.
pub const FRAME_NUMBER_SENTINEL: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0] as f32, v[1] as f32, v[2] as f32)
    }
}

/// Rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

impl From<[f64; 4]> for Quat {
    fn from(q: [f64; 4]) -> Self {
        Self {
            x: q[0] as f32,
            y: q[1] as f32,
            z: q[2] as f32,
            w: q[3] as f32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MarkerSample {
    pub position: Vec3,
    pub occluded: bool,
}

/// Every marker of one subject, gathered in a single call.
///
/// The three sequences are parallel. Markers whose own query failed are
/// reported at the origin and flagged occluded.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SkeletonMarkers {
    pub names: Vec<String>,
    pub positions: Vec<Vec3>,
    pub occluded: Vec<bool>,
}

impl SkeletonMarkers {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceOutputInfo {
    pub name: String,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DeviceSample {
    pub value: f32,
    pub occluded: bool,
}

/// Read-only view over a session's backend.
///
/// A facade belongs to the session it was handed out for. Once that session
/// stops or is replaced, every query reports [`Status::NotConnected`] even if a
/// later session is connected.
#[derive(Debug, Clone)]
pub struct QueryFacade {
    backend: SharedBackend,
    status: ConnectionStatus,
    session: u64,
}

impl QueryFacade {
    pub(crate) fn new(backend: SharedBackend, status: ConnectionStatus) -> Self {
        let session = status.session();
        Self {
            backend,
            status,
            session,
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_session_connected(self.session)
    }

    fn read<T: Default>(&self, query: impl FnOnce(&dyn StreamBackend) -> Output<T>) -> Output<T> {
        if !self.is_connected() {
            return Output::failed(Status::NotConnected);
        }
        match self.backend.lock() {
            // Teardown may have run while we waited for the lock.
            Ok(_) if !self.is_connected() => Output::failed(Status::NotConnected),
            Ok(backend) => query(backend.as_ref()),
            Err(err) => {
                warn!(%err, "query skipped");
                Output::failed(Status::Unavailable)
            }
        }
    }

    /// Direct sessions only; retimed sessions report
    /// [`FRAME_NUMBER_SENTINEL`] with [`Status::NotSupported`].
    pub fn frame_number(&self) -> Output<u32> {
        if self.mode() == BackendMode::Retimed {
            return Output::new(Status::NotSupported, FRAME_NUMBER_SENTINEL);
        }
        self.read(|b| b.frame_number())
    }

    pub fn frame_rate(&self) -> Output<f64> {
        self.read(|b| b.frame_rate())
    }

    pub fn latency_total(&self) -> Output<f64> {
        self.read(|b| b.latency_total())
    }

    pub fn subject_names(&self) -> Output<Vec<String>> {
        self.read(|b| {
            let count = b.subject_count();
            if !count.is_success() {
                return Output::failed(count.status);
            }
            collect_names(count.value, |i| b.subject_name(i))
        })
    }

    pub fn segment_names(&self, subject: &str) -> Output<Vec<String>> {
        self.read(|b| {
            let count = b.segment_count(subject);
            if !count.is_success() {
                return Output::failed(count.status);
            }
            collect_names(count.value, |i| b.segment_name(subject, i))
        })
    }

    pub fn root_segment_name(&self, subject: &str) -> Output<String> {
        self.read(|b| b.subject_root_segment_name(subject))
    }

    pub fn segment_parent_name(&self, subject: &str, segment: &str) -> Output<String> {
        self.read(|b| b.segment_parent_name(subject, segment))
    }

    pub fn segment_rotation(&self, subject: &str, segment: &str) -> Output<Quat> {
        self.read(|b| b.segment_local_rotation(subject, segment).map(Quat::from))
    }

    pub fn segment_translation(&self, subject: &str, segment: &str) -> Output<Vec3> {
        self.read(|b| b.segment_local_translation(subject, segment).map(Vec3::from))
    }

    pub fn segment_scale(&self, subject: &str, segment: &str) -> Output<Vec3> {
        self.read(|b| b.segment_static_scale(subject, segment).map(Vec3::from))
    }

    /// Local translation with the ancestors' static scale divided out.
    pub fn scaled_segment_translation(&self, subject: &str, segment: &str) -> Output<Vec3> {
        self.read(|b| hierarchy::scaled_translation(b, subject, segment).map(Vec3::from))
    }

    pub fn marker_names(&self, subject: &str) -> Output<Vec<String>> {
        self.read(|b| {
            let count = b.marker_count(subject);
            if !count.is_success() {
                return Output::failed(count.status);
            }
            collect_names(count.value, |i| b.marker_name(subject, i))
        })
    }

    pub fn marker_position(&self, subject: &str, marker: &str) -> Output<MarkerSample> {
        self.read(|b| {
            b.marker_global_translation(subject, marker)
                .map(|(position, occluded)| MarkerSample {
                    position: position.into(),
                    occluded,
                })
        })
    }

    /// Names, positions and occlusion flags for all markers of `subject`.
    /// The status is that of the marker enumeration.
    pub fn skeleton_markers(&self, subject: &str) -> Output<SkeletonMarkers> {
        self.read(|b| {
            let count = b.marker_count(subject);
            if !count.is_success() {
                return Output::failed(count.status);
            }

            let mut markers = SkeletonMarkers::default();
            for index in 0..count.value {
                let name = b.marker_name(subject, index);
                if !name.is_success() {
                    continue;
                }
                let (position, occluded) = b
                    .marker_global_translation(subject, &name.value)
                    .ok()
                    .map(|(position, occluded)| (Vec3::from(position), occluded))
                    .unwrap_or((Vec3::ZERO, true));
                markers.names.push(name.value);
                markers.positions.push(position);
                markers.occluded.push(occluded);
            }
            Output::success(markers)
        })
    }

    pub fn devices(&self) -> Output<Vec<DeviceInfo>> {
        self.read(|b| {
            let count = b.device_count();
            if !count.is_success() {
                return Output::failed(count.status);
            }
            let devices = (0..count.value)
                .filter_map(|i| b.device_name(i).ok())
                .map(|(name, kind)| DeviceInfo { name, kind })
                .collect();
            Output::success(devices)
        })
    }

    pub fn device_outputs(&self, device: &str) -> Output<Vec<DeviceOutputInfo>> {
        self.read(|b| {
            let count = b.device_output_count(device);
            if !count.is_success() {
                return Output::failed(count.status);
            }
            let outputs = (0..count.value)
                .filter_map(|i| b.device_output_name(device, i).ok())
                .map(|(name, unit)| DeviceOutputInfo { name, unit })
                .collect();
            Output::success(outputs)
        })
    }

    pub fn device_output_subsamples(&self, device: &str, output: &str) -> Output<u32> {
        self.read(|b| b.device_output_subsamples(device, output))
    }

    /// `subsample` picks a sample inside the frame; `None` reads the first.
    pub fn device_output_value(
        &self,
        device: &str,
        output: &str,
        subsample: Option<u32>,
    ) -> Output<DeviceSample> {
        self.read(|b| {
            b.device_output_value(device, output, subsample)
                .map(|(value, occluded)| DeviceSample {
                    value: value as f32,
                    occluded,
                })
        })
    }

    pub fn force_plate_count(&self) -> Output<u32> {
        self.read(|b| b.force_plate_count())
    }

    pub fn force_plate_center_of_pressure(
        &self,
        plate: u32,
        subsample: Option<u32>,
    ) -> Output<Vec3> {
        self.read(|b| b.global_center_of_pressure(plate, subsample).map(Vec3::from))
    }

    pub fn force_plate_force(&self, plate: u32, subsample: Option<u32>) -> Output<Vec3> {
        self.read(|b| b.global_force(plate, subsample).map(Vec3::from))
    }

    pub fn force_plate_moment(&self, plate: u32, subsample: Option<u32>) -> Output<Vec3> {
        self.read(|b| b.global_moment(plate, subsample).map(Vec3::from))
    }
}

/// Enumerates `count` names, skipping indices whose lookup failed.
fn collect_names(count: u32, name_at: impl Fn(u32) -> Output<String>) -> Output<Vec<String>> {
    Output::success((0..count).filter_map(|i| name_at(i).ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use crate::sim::{CallLog, SimBehaviour, SimScene, SimulatedBackend};

    fn facade(mode: BackendMode) -> (QueryFacade, CallLog) {
        let mut backend = SimulatedBackend::new(mode, SimScene::demo(), SimBehaviour::default());
        backend.connect("localhost:801");
        match mode {
            BackendMode::Direct => backend.acquire_frame(),
            BackendMode::Retimed => backend.advance_clock(0.0),
        };
        let log = backend.call_log();

        let status = ConnectionStatus::new();
        status.transition(ConnectionEvent::Start).unwrap();
        status.transition(ConnectionEvent::Established).unwrap();
        (
            QueryFacade::new(SharedBackend::new(Box::new(backend)), status),
            log,
        )
    }

    #[test]
    fn refuses_to_read_before_connected() {
        let backend =
            SimulatedBackend::new(BackendMode::Direct, SimScene::demo(), SimBehaviour::default());
        let log = backend.call_log();
        let query =
            QueryFacade::new(SharedBackend::new(Box::new(backend)), ConnectionStatus::new());

        assert_eq!(query.subject_names().status, Status::NotConnected);
        assert_eq!(query.segment_translation("Actor1", "Hips").status, Status::NotConnected);
        assert_eq!(log.count("query"), 0);
    }

    #[test]
    fn enumerates_subjects_and_segments() {
        let (query, _) = facade(BackendMode::Direct);

        assert_eq!(query.subject_names().value, vec!["Actor1", "Prop"]);
        assert_eq!(
            query.segment_names("Actor1").value,
            vec!["Hips", "Spine", "Head"]
        );
        assert_eq!(query.root_segment_name("Actor1").value, "Hips");
        assert_eq!(query.segment_parent_name("Actor1", "Head").value, "Spine");
        assert_eq!(query.segment_parent_name("Actor1", "Hips").value, "");
    }

    #[test]
    fn narrows_segment_values() {
        let (query, _) = facade(BackendMode::Direct);

        assert_eq!(
            query.segment_translation("Actor1", "Spine"),
            Output::success(Vec3::new(0.0, 0.0, 120.0))
        );
        assert_eq!(
            query.segment_scale("Actor1", "Spine").value,
            Vec3::from([1.05, 1.05, 1.1])
        );
        let rotation = query.segment_rotation("Actor1", "Head").value;
        assert!((rotation.w - 0.923_879_5).abs() < 1e-6);
        assert_eq!(
            query.segment_rotation("Actor1", "Nope").status,
            Status::InvalidSegmentName
        );
    }

    #[test]
    fn scaled_translation_uses_ancestor_scale() {
        let (query, _) = facade(BackendMode::Direct);
        // Head sits under Spine (1.05, 1.05, 1.1) and Hips (1, 1, 1).
        let scaled = query.scaled_segment_translation("Actor1", "Head").value;
        assert!((scaled.y - (10.0 / 1.05) as f32).abs() < 1e-4);
        assert!((scaled.z - (460.0 / 1.1) as f32).abs() < 1e-3);
    }

    #[test]
    fn gathers_skeleton_markers_in_parallel_sequences() {
        let (query, _) = facade(BackendMode::Direct);
        let markers = query.skeleton_markers("Actor1");

        assert!(markers.is_success());
        let markers = markers.value;
        assert_eq!(markers.len(), 3);
        assert_eq!(markers.names, vec!["LFHD", "RFHD", "C7"]);
        assert_eq!(markers.occluded, vec![false, true, false]);
        assert_eq!(markers.positions[0], Vec3::new(80.0, 60.0, 1700.0));
        assert_eq!(markers.positions[1], Vec3::ZERO);

        assert_eq!(
            query.skeleton_markers("Ghost").status,
            Status::InvalidSubjectName
        );
    }

    #[test]
    fn reads_single_marker() {
        let (query, _) = facade(BackendMode::Direct);
        let sample = query.marker_position("Prop", "Prop1");
        assert_eq!(
            sample.value,
            MarkerSample {
                position: Vec3::new(510.0, 250.0, 820.0),
                occluded: false,
            }
        );
        assert_eq!(query.marker_names("Prop").value, vec!["Prop1"]);
        assert_eq!(
            query.marker_position("Prop", "Nope").status,
            Status::InvalidMarkerName
        );
    }

    #[test]
    fn enumerates_devices_and_outputs() {
        let (query, _) = facade(BackendMode::Direct);

        let devices = query.devices().value;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].kind, DeviceKind::ForcePlate);
        assert_eq!(devices[1].name, "EMG");

        let outputs = query.device_outputs("ForcePlate1").value;
        assert_eq!(
            outputs[0],
            DeviceOutputInfo {
                name: "Fz".into(),
                unit: "N".into()
            }
        );
        assert_eq!(query.device_output_subsamples("ForcePlate1", "Mz").value, 4);
        assert_eq!(
            query.device_output_value("ForcePlate1", "Fz", None).value.value,
            698.0
        );
        assert_eq!(
            query.device_output_value("ForcePlate1", "Fz", Some(1)).value.value,
            700.0
        );
        assert_eq!(
            query.device_outputs("Nope").status,
            Status::InvalidDeviceName
        );
    }

    #[test]
    fn reads_force_plates() {
        let (query, _) = facade(BackendMode::Direct);

        assert_eq!(query.force_plate_count().value, 1);
        assert_eq!(
            query.force_plate_force(0, None).value,
            Vec3::new(2.0, -1.0, 700.0)
        );
        assert_eq!(
            query.force_plate_moment(0, Some(3)).value,
            Vec3::new(0.5, 0.25, 1.5)
        );
        assert_eq!(
            query.force_plate_center_of_pressure(0, None).value,
            Vec3::new(120.0, 240.0, 0.0)
        );
        assert_eq!(query.force_plate_force(3, None).status, Status::InvalidIndex);
    }

    #[test]
    fn frame_number_depends_on_mode() {
        let (direct, _) = facade(BackendMode::Direct);
        assert_eq!(direct.frame_number(), Output::success(1));
        assert_eq!(direct.frame_rate().value, 100.0);

        let (retimed, log) = facade(BackendMode::Retimed);
        let before = log.count("query");
        assert_eq!(
            retimed.frame_number(),
            Output::new(Status::NotSupported, FRAME_NUMBER_SENTINEL)
        );
        assert_eq!(log.count("query"), before);
        assert!(retimed.latency_total().is_success());
    }
}
