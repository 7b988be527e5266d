//! Core library for the mocap stream client.
//!
//! The crate keeps a live connection to a motion-capture stream server and
//! exposes the latest frame to a consumer. Each module owns one concern:
//! the backend contract ([`backend`]), session lifecycle and connect retry
//! ([`connection`]), frame acquisition ([`acquisition`]), scale correction
//! along segment chains ([`hierarchy`]) and the consumer-facing queries
//! ([`query`]). [`sim`] provides a scripted backend for tests and the demo
//! binary.

pub mod acquisition;
pub mod backend;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod hierarchy;
pub mod query;
pub mod sim;

pub use acquisition::{AcquisitionModel, FrameScheduler, SubjectFilter};
pub use backend::{
    AxisMapping, BackendFactory, BackendMode, DeviceKind, Direction, Output, SharedBackend,
    Status, StreamBackend, StreamMode,
};
pub use config::{AppConfig, LoggingConfig, RetryConfig, StreamConfig};
pub use connection::{
    CancellationToken, ConnectionCallback, ConnectionManager, ConnectionState, ConnectionStatus,
    RetryPolicy, SegmentDataFormat,
};
pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use error::{MocapError, Result};
pub use query::{
    DeviceInfo, DeviceOutputInfo, DeviceSample, MarkerSample, QueryFacade, Quat, SkeletonMarkers,
    Vec3, FRAME_NUMBER_SENTINEL,
};
