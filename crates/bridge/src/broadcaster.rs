//! Periodic telemetry push loop (§4.8 `TelemetryBroadcaster`).
//!
//! Cooperatively scheduled on the async reactor, per §5's "broadcaster
//! stays single-threaded and interacts via snapshots" design note. Never
//! blocks the serial thread: it only reads the driver's and estimator's
//! already-published state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use localization::PoseEstimator;
use robot::RobotDriver;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;
use types::{Pose, TelemetrySnapshot};

/// One telemetry push: the raw sensor snapshot plus the fused odometry pose.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPush {
    #[serde(flatten)]
    pub telemetry: TelemetrySnapshot,
    pub odometry: Odometry,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Odometry {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
}

impl From<Pose> for Odometry {
    fn from(pose: Pose) -> Self {
        Self {
            x_mm: pose.x_mm,
            y_mm: pose.y_mm,
            theta_deg: pose.theta_rad.to_degrees(),
        }
    }
}

/// Configuration for the push loop's pacing and watchdog thresholds.
#[derive(Debug, Clone, Copy)]
pub struct BroadcasterConfig {
    pub telemetry_interval: Duration,
    pub max_stale: Duration,
    pub restart_cooldown: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_millis(100),
            max_stale: Duration::from_secs(2),
            restart_cooldown: Duration::from_secs(5),
        }
    }
}

/// Periodically samples the driver and estimator and publishes a
/// `TelemetryPush` onto a watch channel that any number of websocket
/// connections can subscribe to.
pub struct TelemetryBroadcaster {
    driver: RobotDriver,
    estimator: PoseEstimator,
    config: BroadcasterConfig,
}

impl TelemetryBroadcaster {
    pub fn new(driver: RobotDriver, estimator: PoseEstimator, config: BroadcasterConfig) -> Self {
        Self { driver, estimator, config }
    }

    /// One sample: the driver's current telemetry plus the estimator's pose.
    pub fn snapshot(&self) -> TelemetryPush {
        TelemetryPush {
            telemetry: self.driver.telemetry(),
            odometry: self.estimator.pose().into(),
        }
    }

    /// Run forever, servicing the stream watchdog and publishing a sample
    /// every `telemetry_interval`. `reader_alive` is flipped by the serial
    /// reader thread to report whether it is still pumping bytes; a
    /// watchdog-restart failure is logged and otherwise ignored — it must
    /// never stop the loop (§4.8, §5).
    pub async fn run(self, reader_alive: Arc<AtomicBool>, tx: watch::Sender<TelemetryPush>) {
        let mut interval = tokio::time::interval(self.config.telemetry_interval);
        loop {
            interval.tick().await;
            let restarted = self.driver.service_watchdog(
                reader_alive.load(Ordering::Relaxed),
                self.config.max_stale,
                self.config.restart_cooldown,
            );
            if restarted {
                warn!("telemetry broadcaster restarted the stream subscription");
            }
            if tx.send(self.snapshot()).is_err() {
                // No receivers left; keep servicing the watchdog regardless.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localization::OdometrySource;

    #[test]
    fn snapshot_combines_telemetry_and_odometry() {
        let driver = RobotDriver::new(link::SerialLink::closed_for_test());
        let estimator = PoseEstimator::new(OdometrySource::Encoders, 0.445, 1.0, 1.0);
        estimator.reset(10.0, 20.0, 90.0, None, None, None, None);

        let broadcaster = TelemetryBroadcaster::new(driver, estimator, BroadcasterConfig::default());
        let push = broadcaster.snapshot();
        assert_eq!(push.odometry.x_mm, 10.0);
        assert_eq!(push.odometry.y_mm, 20.0);
        assert!((push.odometry.theta_deg - 90.0).abs() < 1e-6);
        assert!(!push.telemetry.roomba_connected);
    }

    #[test]
    fn telemetry_push_serializes_flattened() {
        let driver = RobotDriver::new(link::SerialLink::closed_for_test());
        let estimator = PoseEstimator::new(OdometrySource::Encoders, 0.445, 1.0, 1.0);
        let broadcaster = TelemetryBroadcaster::new(driver, estimator, BroadcasterConfig::default());
        let json = serde_json::to_value(broadcaster.snapshot()).unwrap();
        assert!(json.get("odometry").is_some());
        assert!(json.get("bump_left").is_some());
    }
}
