//! Dead-reckoning pose estimation, collision geometry, and motion
//! clamping (§4.3/§4.4).
//!
//! `PoseEstimator` owns the running pose and fuses either raw wheel
//! encoder deltas or the vendor's scalar distance/angle totals;
//! `CollisionGeometry` holds the inflated floor plan the estimator
//! clamps translation against via `MotionClamper`.

mod clamper;
mod estimator;
mod geometry;

pub use clamper::MotionClamper;
pub use estimator::{HistoryEvent, OdometryInput, OdometrySource, PoseEstimator};
pub use geometry::{CollisionGeometry, Edge};
