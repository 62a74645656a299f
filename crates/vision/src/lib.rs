mod backend;
mod detector;
mod pose_snap;
mod slicer;

pub use backend::{AprilTagBackend, DetectError, MarkerBackend};
pub use detector::{DetectionResult, DetectorStatus, MarkerDetector};
pub use pose_snap::{PoseSnap, PoseSnapConfig};
pub use slicer::FrameSlicer;
