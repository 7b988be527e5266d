//! Scripted in-process backend.
//!
//! [`SimulatedBackend`] plays a static [`SimScene`] through the
//! [`StreamBackend`] contract for either [`BackendMode`]. Only the frame
//! counter advances between frames. [`SimBehaviour`] scripts the awkward parts
//! of a real server (refused connections, missing lightweight support,
//! rejected filters, slow frames) and [`CallLog`] records what the client
//! asked for.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    AxisMapping, BackendFactory, BackendMode, DeviceKind, Output, Status, StreamBackend,
    StreamMode,
};

type Lookup<T> = std::result::Result<T, Status>;

#[derive(Debug, Clone, Default)]
pub struct SimScene {
    pub subjects: Vec<SimSubject>,
    pub devices: Vec<SimDevice>,
    pub force_plates: Vec<SimForcePlate>,
    pub frame_rate: f64,
    pub latency_seconds: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SimSubject {
    pub name: String,
    pub segments: Vec<SimSegment>,
    pub markers: Vec<SimMarker>,
}

#[derive(Debug, Clone)]
pub struct SimSegment {
    pub name: String,
    pub parent: Option<String>,
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
    pub scale: [f64; 3],
}

impl SimSegment {
    pub fn new(name: &str, parent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }

    pub fn translation(mut self, translation: [f64; 3]) -> Self {
        self.translation = translation;
        self
    }

    pub fn rotation(mut self, rotation: [f64; 4]) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scale(mut self, scale: [f64; 3]) -> Self {
        self.scale = scale;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimMarker {
    pub name: String,
    pub position: [f64; 3],
    pub occluded: bool,
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub kind: DeviceKind,
    pub outputs: Vec<SimDeviceOutput>,
}

#[derive(Debug, Clone)]
pub struct SimDeviceOutput {
    pub name: String,
    pub unit: String,
    /// One value per subsample; the first one is the frame value.
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SimForcePlate {
    pub force: [f64; 3],
    pub moment: [f64; 3],
    pub center_of_pressure: [f64; 3],
    pub subsamples: u32,
}

impl SimScene {
    /// One skeleton, one rigid prop, a force plate and an EMG channel.
    pub fn demo() -> Self {
        let actor = SimSubject {
            name: "Actor1".to_string(),
            segments: vec![
                SimSegment::new("Hips", None)
                    .translation([0.0, 0.0, 950.0])
                    .scale([1.0, 1.0, 1.0]),
                SimSegment::new("Spine", Some("Hips"))
                    .translation([0.0, 0.0, 120.0])
                    .scale([1.05, 1.05, 1.1]),
                SimSegment::new("Head", Some("Spine"))
                    .translation([0.0, 10.0, 460.0])
                    .rotation([0.0, 0.0, 0.38268343, 0.92387953]),
            ],
            markers: vec![
                SimMarker {
                    name: "LFHD".to_string(),
                    position: [80.0, 60.0, 1700.0],
                    occluded: false,
                },
                SimMarker {
                    name: "RFHD".to_string(),
                    position: [80.0, -60.0, 1700.0],
                    occluded: true,
                },
                SimMarker {
                    name: "C7".to_string(),
                    position: [-40.0, 0.0, 1450.0],
                    occluded: false,
                },
            ],
        };

        let prop = SimSubject {
            name: "Prop".to_string(),
            segments: vec![SimSegment::new("Prop", None).translation([500.0, 250.0, 800.0])],
            markers: vec![SimMarker {
                name: "Prop1".to_string(),
                position: [510.0, 250.0, 820.0],
                occluded: false,
            }],
        };

        Self {
            subjects: vec![actor, prop],
            devices: vec![
                SimDevice {
                    name: "ForcePlate1".to_string(),
                    kind: DeviceKind::ForcePlate,
                    outputs: vec![
                        SimDeviceOutput {
                            name: "Fz".to_string(),
                            unit: "N".to_string(),
                            samples: vec![698.0, 700.0, 702.0, 701.0],
                        },
                        SimDeviceOutput {
                            name: "Mz".to_string(),
                            unit: "Nm".to_string(),
                            samples: vec![1.5, 1.6, 1.4, 1.5],
                        },
                    ],
                },
                SimDevice {
                    name: "EMG".to_string(),
                    kind: DeviceKind::Unknown,
                    outputs: vec![SimDeviceOutput {
                        name: "Channel1".to_string(),
                        unit: "V".to_string(),
                        samples: vec![0.012, 0.015],
                    }],
                },
            ],
            force_plates: vec![SimForcePlate {
                force: [2.0, -1.0, 700.0],
                moment: [0.5, 0.25, 1.5],
                center_of_pressure: [120.0, 240.0, 0.0],
                subsamples: 4,
            }],
            frame_rate: 100.0,
            latency_seconds: 0.008,
        }
    }
}

/// Scripted server behaviour.
#[derive(Debug, Clone)]
pub struct SimBehaviour {
    /// Connect attempts refused before the first success.
    pub failed_connects: u32,
    pub lightweight_supported: bool,
    /// Subject filter calls rejected before they start succeeding.
    pub failed_filter_calls: u32,
    /// Time a frame pull blocks for, standing in for network I/O.
    pub frame_delay: Option<Duration>,
}

impl Default for SimBehaviour {
    fn default() -> Self {
        Self {
            failed_connects: 0,
            lightweight_supported: true,
            failed_filter_calls: 0,
            frame_delay: None,
        }
    }
}

/// Shared record of the calls made against a simulated backend.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<CallLogInner>>,
}

#[derive(Debug, Default)]
struct CallLogInner {
    calls: Vec<&'static str>,
    connect_times: Vec<Instant>,
    targets: Vec<String>,
    offsets: Vec<f64>,
    timing_logs: Vec<(PathBuf, PathBuf)>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call name in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub fn last_target(&self) -> Option<String> {
        self.lock().targets.last().cloned()
    }

    pub fn last_offset(&self) -> Option<f64> {
        self.lock().offsets.last().copied()
    }

    pub fn timing_logs(&self) -> Vec<(PathBuf, PathBuf)> {
        self.lock().timing_logs.clone()
    }

    fn record(&self, call: &'static str) {
        self.lock().calls.push(call);
    }

    fn lock(&self) -> MutexGuard<'_, CallLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct SimulatedBackend {
    mode: BackendMode,
    scene: SimScene,
    behaviour: SimBehaviour,
    log: CallLog,
    connected: bool,
    connects_to_refuse: u32,
    filter_calls_to_reject: u32,
    frame: Option<u32>,
    filter: BTreeSet<String>,
    stream_mode: Option<StreamMode>,
    axis_mapping: Option<AxisMapping>,
    timing_log: bool,
}

impl SimulatedBackend {
    pub fn new(mode: BackendMode, scene: SimScene, behaviour: SimBehaviour) -> Self {
        Self::with_log(mode, scene, behaviour, CallLog::new())
    }

    pub fn with_log(
        mode: BackendMode,
        scene: SimScene,
        behaviour: SimBehaviour,
        log: CallLog,
    ) -> Self {
        Self {
            mode,
            connects_to_refuse: behaviour.failed_connects,
            filter_calls_to_reject: behaviour.failed_filter_calls,
            scene,
            behaviour,
            log,
            connected: false,
            frame: None,
            filter: BTreeSet::new(),
            stream_mode: None,
            axis_mapping: None,
            timing_log: false,
        }
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn stream_mode(&self) -> Option<StreamMode> {
        self.stream_mode
    }

    pub fn axis_mapping(&self) -> Option<AxisMapping> {
        self.axis_mapping
    }

    pub fn is_timing_logging(&self) -> bool {
        self.timing_log
    }

    fn require_connection(&self) -> Lookup<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Status::NotConnected)
        }
    }

    /// Getters need a connection and at least one frame.
    fn ready(&self) -> Lookup<()> {
        self.log.record("query");
        self.require_connection()?;
        self.frame.map(|_| ()).ok_or(Status::NoFrame)
    }

    fn visible_subjects(&self) -> impl Iterator<Item = &SimSubject> {
        self.scene
            .subjects
            .iter()
            .filter(move |s| self.filter.is_empty() || self.filter.contains(&s.name))
    }

    fn subject(&self, name: &str) -> Lookup<&SimSubject> {
        self.ready()?;
        self.visible_subjects()
            .find(|s| s.name == name)
            .ok_or(Status::InvalidSubjectName)
    }

    fn segment(&self, subject: &str, segment: &str) -> Lookup<&SimSegment> {
        self.subject(subject)?
            .segments
            .iter()
            .find(|s| s.name == segment)
            .ok_or(Status::InvalidSegmentName)
    }

    fn device(&self, name: &str) -> Lookup<&SimDevice> {
        self.ready()?;
        self.scene
            .devices
            .iter()
            .find(|d| d.name == name)
            .ok_or(Status::InvalidDeviceName)
    }

    fn device_output(&self, device: &str, output: &str) -> Lookup<&SimDeviceOutput> {
        self.device(device)?
            .outputs
            .iter()
            .find(|o| o.name == output)
            .ok_or(Status::InvalidDeviceOutputName)
    }

    fn force_plate(&self, plate: u32, subsample: Option<u32>) -> Lookup<&SimForcePlate> {
        self.ready()?;
        let plate = self
            .scene
            .force_plates
            .get(plate as usize)
            .ok_or(Status::InvalidIndex)?;
        match subsample {
            Some(index) if index >= plate.subsamples => Err(Status::InvalidIndex),
            _ => Ok(plate),
        }
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn nth<T>(items: impl IntoIterator<Item = T>, index: u32) -> Lookup<T> {
    items
        .into_iter()
        .nth(index as usize)
        .ok_or(Status::InvalidIndex)
}

impl StreamBackend for SimulatedBackend {
    fn mode(&self) -> BackendMode {
        self.mode
    }

    fn connect(&mut self, target: &str) -> Status {
        {
            let mut log = self.log.lock();
            log.calls.push("connect");
            log.connect_times.push(Instant::now());
            log.targets.push(target.to_string());
        }

        if target.trim().is_empty() {
            return Status::InvalidHostName;
        }
        if self.connected {
            return Status::Success;
        }
        if self.connects_to_refuse > 0 {
            self.connects_to_refuse -= 1;
            return Status::NotConnected;
        }

        self.connected = true;
        self.frame = None;
        Status::Success
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) -> Status {
        self.log.record("disconnect");
        if self.connected {
            self.log.record("link_closed");
            self.connected = false;
            self.frame = None;
            self.filter.clear();
        }
        Status::Success
    }

    fn set_stream_mode(&mut self, mode: StreamMode) -> Status {
        self.log.record("set_stream_mode");
        if self.mode == BackendMode::Retimed {
            return Status::NotSupported;
        }
        if let Err(status) = self.require_connection() {
            return status;
        }
        self.stream_mode = Some(mode);
        Status::Success
    }

    fn enable_lightweight_segment_data(&mut self) -> Status {
        self.log.record("enable_lightweight_segment_data");
        if let Err(status) = self.require_connection() {
            return status;
        }
        // A direct client only learns the supported data types from a frame.
        if self.mode == BackendMode::Direct && self.frame.is_none() {
            return Status::NoFrame;
        }
        if self.behaviour.lightweight_supported {
            Status::Success
        } else {
            Status::NotSupported
        }
    }

    fn enable_segment_data(&mut self) -> Status {
        self.log.record("enable_segment_data");
        match self.require_connection() {
            Ok(()) => Status::Success,
            Err(status) => status,
        }
    }

    fn set_axis_mapping(&mut self, mapping: AxisMapping) -> Status {
        self.log.record("set_axis_mapping");
        if let Err(status) = self.require_connection() {
            return status;
        }
        self.axis_mapping = Some(mapping);
        Status::Success
    }

    fn add_to_subject_filter(&mut self, subject: &str) -> Status {
        self.log.record("add_to_subject_filter");
        if let Err(status) = self.require_connection() {
            return status;
        }
        if self.filter_calls_to_reject > 0 {
            self.filter_calls_to_reject -= 1;
            return Status::NoFrame;
        }
        self.filter.insert(subject.to_string());
        Status::Success
    }

    fn acquire_frame(&mut self) -> Status {
        self.log.record("acquire_frame");
        if self.mode != BackendMode::Direct {
            return Status::NotSupported;
        }
        if let Err(status) = self.require_connection() {
            return status;
        }
        if let Some(delay) = self.behaviour.frame_delay {
            thread::sleep(delay);
        }
        self.frame = Some(self.frame.map_or(1, |n| n.wrapping_add(1)));
        Status::Success
    }

    fn advance_clock(&mut self, offset_seconds: f64) -> Status {
        {
            let mut log = self.log.lock();
            log.calls.push("advance_clock");
            log.offsets.push(offset_seconds);
        }
        if self.mode != BackendMode::Retimed {
            return Status::NotSupported;
        }
        if let Err(status) = self.require_connection() {
            return status;
        }
        self.frame = Some(self.frame.map_or(1, |n| n.wrapping_add(1)));
        Status::Success
    }

    fn start_timing_log(&mut self, client_log: &Path, stream_log: &Path) -> Status {
        {
            let mut log = self.log.lock();
            log.calls.push("start_timing_log");
            log.timing_logs
                .push((client_log.to_path_buf(), stream_log.to_path_buf()));
        }
        self.timing_log = true;
        Status::Success
    }

    fn stop_timing_log(&mut self) -> Status {
        self.log.record("stop_timing_log");
        self.timing_log = false;
        Status::Success
    }

    fn frame_number(&self) -> Output<u32> {
        if let Err(status) = self.ready() {
            return Output::failed(status);
        }
        match (self.mode, self.frame) {
            (BackendMode::Direct, Some(frame)) => Output::success(frame),
            _ => Output::failed(Status::NotSupported),
        }
    }

    fn frame_rate(&self) -> Output<f64> {
        self.ready().map(|_| self.scene.frame_rate).into()
    }

    fn latency_total(&self) -> Output<f64> {
        self.ready().map(|_| self.scene.latency_seconds).into()
    }

    fn subject_count(&self) -> Output<u32> {
        self.ready()
            .map(|_| count(self.visible_subjects().count()))
            .into()
    }

    fn subject_name(&self, index: u32) -> Output<String> {
        self.ready()
            .and_then(|_| nth(self.visible_subjects(), index))
            .map(|s| s.name.clone())
            .into()
    }

    fn subject_root_segment_name(&self, subject: &str) -> Output<String> {
        self.subject(subject)
            .and_then(|s| {
                s.segments
                    .iter()
                    .find(|seg| seg.parent.is_none())
                    .ok_or(Status::InvalidSegmentName)
            })
            .map(|seg| seg.name.clone())
            .into()
    }

    fn segment_count(&self, subject: &str) -> Output<u32> {
        self.subject(subject)
            .map(|s| count(s.segments.len()))
            .into()
    }

    fn segment_name(&self, subject: &str, index: u32) -> Output<String> {
        self.subject(subject)
            .and_then(|s| nth(&s.segments, index))
            .map(|seg| seg.name.clone())
            .into()
    }

    fn segment_parent_name(&self, subject: &str, segment: &str) -> Output<String> {
        self.segment(subject, segment)
            .map(|seg| seg.parent.clone().unwrap_or_default())
            .into()
    }

    fn segment_local_translation(&self, subject: &str, segment: &str) -> Output<[f64; 3]> {
        self.segment(subject, segment)
            .map(|seg| seg.translation)
            .into()
    }

    fn segment_local_rotation(&self, subject: &str, segment: &str) -> Output<[f64; 4]> {
        self.segment(subject, segment).map(|seg| seg.rotation).into()
    }

    fn segment_static_scale(&self, subject: &str, segment: &str) -> Output<[f64; 3]> {
        self.segment(subject, segment).map(|seg| seg.scale).into()
    }

    fn marker_count(&self, subject: &str) -> Output<u32> {
        self.subject(subject)
            .map(|s| count(s.markers.len()))
            .into()
    }

    fn marker_name(&self, subject: &str, index: u32) -> Output<String> {
        self.subject(subject)
            .and_then(|s| nth(&s.markers, index))
            .map(|m| m.name.clone())
            .into()
    }

    fn marker_global_translation(&self, subject: &str, marker: &str) -> Output<([f64; 3], bool)> {
        self.subject(subject)
            .and_then(|s| {
                s.markers
                    .iter()
                    .find(|m| m.name == marker)
                    .ok_or(Status::InvalidMarkerName)
            })
            // Occluded markers report the origin.
            .map(|m| if m.occluded { ([0.0; 3], true) } else { (m.position, false) })
            .into()
    }

    fn device_count(&self) -> Output<u32> {
        self.ready()
            .map(|_| count(self.scene.devices.len()))
            .into()
    }

    fn device_name(&self, index: u32) -> Output<(String, DeviceKind)> {
        self.ready()
            .and_then(|_| nth(&self.scene.devices, index))
            .map(|d| (d.name.clone(), d.kind))
            .into()
    }

    fn device_output_count(&self, device: &str) -> Output<u32> {
        self.device(device).map(|d| count(d.outputs.len())).into()
    }

    fn device_output_name(&self, device: &str, index: u32) -> Output<(String, String)> {
        self.device(device)
            .and_then(|d| nth(&d.outputs, index))
            .map(|o| (o.name.clone(), o.unit.clone()))
            .into()
    }

    fn device_output_subsamples(&self, device: &str, output: &str) -> Output<u32> {
        self.device_output(device, output)
            .map(|o| count(o.samples.len()))
            .into()
    }

    fn device_output_value(
        &self,
        device: &str,
        output: &str,
        subsample: Option<u32>,
    ) -> Output<(f64, bool)> {
        self.device_output(device, output)
            .and_then(|o| nth(&o.samples, subsample.unwrap_or(0)))
            .map(|value| (*value, false))
            .into()
    }

    fn force_plate_count(&self) -> Output<u32> {
        self.ready()
            .map(|_| count(self.scene.force_plates.len()))
            .into()
    }

    fn global_force(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]> {
        self.force_plate(plate, subsample).map(|p| p.force).into()
    }

    fn global_moment(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]> {
        self.force_plate(plate, subsample).map(|p| p.moment).into()
    }

    fn global_center_of_pressure(&self, plate: u32, subsample: Option<u32>) -> Output<[f64; 3]> {
        self.force_plate(plate, subsample)
            .map(|p| p.center_of_pressure)
            .into()
    }
}

/// Factory handing out simulated backends that share one scene and keep a
/// call log per mode.
#[derive(Debug, Clone, Default)]
pub struct SimFactory {
    scene: SimScene,
    behaviour: SimBehaviour,
    logs: Arc<Mutex<HashMap<BackendMode, CallLog>>>,
}

impl SimFactory {
    pub fn new(scene: SimScene, behaviour: SimBehaviour) -> Self {
        Self {
            scene,
            behaviour,
            logs: Arc::default(),
        }
    }

    /// Call log shared by every backend of `mode` this factory creates.
    pub fn log(&self, mode: BackendMode) -> CallLog {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(mode)
            .or_default()
            .clone()
    }
}

impl BackendFactory for SimFactory {
    fn create(&self, mode: BackendMode) -> Box<dyn StreamBackend> {
        Box::new(SimulatedBackend::with_log(
            mode,
            self.scene.clone(),
            self.behaviour.clone(),
            self.log(mode),
        ))
    }
}
