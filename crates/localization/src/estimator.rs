//! Dead-reckoning pose fusion from encoder or scalar-total deltas, plus
//! external pose blending and collision-aware snapping (§4.3
//! `PoseEstimator`).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use types::Pose;

use crate::clamper::MotionClamper;
use crate::geometry::CollisionGeometry;

const ENCODER_MAX: i64 = 65536;
const WHEEL_BASE_MM: f64 = 235.0;
const DEFAULT_MM_PER_TICK: f64 = 0.445;
const EPSILON: f64 = 1e-9;

/// Which sensor feeds the pose update: raw wheel encoders, the vendor's
/// own scalar distance/angle totals, or "encoders when available".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdometrySource {
    Encoders,
    DistanceAngle,
    Auto,
}

impl OdometrySource {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "distance_angle" => Self::DistanceAngle,
            "auto" => Self::Auto,
            _ => Self::Encoders,
        }
    }
}

/// One telemetry-derived update. Encoder fields are `None` when no
/// encoder packet has been decoded yet; callers otherwise always supply
/// both or neither.
#[derive(Debug, Clone, Default)]
pub struct OdometryInput {
    pub total_distance_mm: i64,
    pub total_angle_deg: i64,
    pub left_encoder_counts: Option<u16>,
    pub right_encoder_counts: Option<u16>,
    pub bump_left: bool,
    pub bump_right: bool,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One mutation of the estimator, handed to the injected history sink.
/// Errors raised by the sink never propagate into the caller.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEvent {
    pub event: &'static str,
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_mm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blend_pos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blend_theta: Option<f64>,
}

type HistorySink = Arc<dyn Fn(&HistoryEvent) + Send + Sync>;

fn normalize_theta(theta_rad: f64) -> f64 {
    types::normalize_theta(theta_rad)
}

fn delta_encoder_counts(previous: u16, current: u16) -> i64 {
    let previous = previous as i64;
    let current = current as i64;
    ((current - previous + ENCODER_MAX / 2).rem_euclid(ENCODER_MAX)) - ENCODER_MAX / 2
}

struct State {
    x_mm: f64,
    y_mm: f64,
    theta_rad: f64,
    last_delta_distance_mm: f64,
    last_delta_angle_deg: f64,
    last_total_distance_mm: Option<f64>,
    last_total_angle_deg: Option<f64>,
    last_left_encoder_counts: Option<u16>,
    last_right_encoder_counts: Option<u16>,
    source: OdometrySource,
    mm_per_tick: f64,
    linear_scale: f64,
    angular_scale: f64,
    geometry: CollisionGeometry,
}

impl Default for State {
    fn default() -> Self {
        Self {
            x_mm: 0.0,
            y_mm: 0.0,
            theta_rad: 0.0,
            last_delta_distance_mm: 0.0,
            last_delta_angle_deg: 0.0,
            last_total_distance_mm: None,
            last_total_angle_deg: None,
            last_left_encoder_counts: None,
            last_right_encoder_counts: None,
            source: OdometrySource::Encoders,
            mm_per_tick: DEFAULT_MM_PER_TICK,
            linear_scale: 1.0,
            angular_scale: 1.0,
            geometry: CollisionGeometry::default(),
        }
    }
}

impl State {
    fn pose(&self) -> Pose {
        Pose {
            x_mm: self.x_mm,
            y_mm: self.y_mm,
            theta_rad: self.theta_rad,
            last_delta_distance_mm: self.last_delta_distance_mm,
            last_delta_angle_deg: self.last_delta_angle_deg,
        }
    }

    fn snap_to_valid(&mut self) {
        if !self.geometry.is_installed() {
            return;
        }
        let (x, y) = self.geometry.snap_to_valid(self.x_mm, self.y_mm);
        self.x_mm = x;
        self.y_mm = y;
    }

    fn apply_theta_then_translate(&mut self, d_mm: f64, a_rad: f64) -> f64 {
        self.theta_rad = normalize_theta(self.theta_rad + a_rad);
        let clamper = MotionClamper::new();
        let geometry = self.geometry.is_installed().then_some(&self.geometry);
        let (dx, dy, signed) = clamper.apply(geometry, self.x_mm, self.y_mm, self.theta_rad, d_mm);
        self.x_mm += dx;
        self.y_mm += dy;
        signed
    }
}

/// Fuses encoder or scalar-total deltas into a running pose estimate,
/// clamps translation against installed collision geometry, and blends
/// in externally observed poses (e.g. from fiducial markers).
///
/// Cheap to clone; internal state is behind a single mutex, and the
/// history sink is invoked after that mutex is released (§5).
#[derive(Clone)]
pub struct PoseEstimator {
    state: Arc<Mutex<State>>,
    history_sink: Arc<Mutex<Option<HistorySink>>>,
}

impl Default for PoseEstimator {
    fn default() -> Self {
        Self::new(OdometrySource::Encoders, DEFAULT_MM_PER_TICK, 1.0, 1.0)
    }
}

impl PoseEstimator {
    pub fn new(source: OdometrySource, mm_per_tick: f64, linear_scale: f64, angular_scale: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                source,
                mm_per_tick,
                linear_scale,
                angular_scale,
                ..State::default()
            })),
            history_sink: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_history_sink<F>(&self, sink: F)
    where
        F: Fn(&HistoryEvent) + Send + Sync + 'static,
    {
        *self.history_sink.lock().unwrap() = Some(Arc::new(sink));
    }

    fn emit(&self, event: HistoryEvent) {
        if let Some(sink) = self.history_sink.lock().unwrap().clone() {
            sink(&event);
        }
    }

    pub fn pose(&self) -> Pose {
        self.state.lock().unwrap().pose()
    }

    /// Install (or replace) collision geometry built from a plan.
    pub fn set_collision_plan(&self, plan: &types::Plan, robot_radius_mm: f64) {
        let mut state = self.state.lock().unwrap();
        state.geometry = CollisionGeometry::from_plan(plan, robot_radius_mm);
    }

    /// Uninstall collision geometry: every subsequent move passes through
    /// unclamped until a new plan is installed.
    pub fn clear_collision_plan(&self) {
        self.state.lock().unwrap().geometry.clear();
    }

    /// Directly set pose, optionally installing new baselines for the
    /// scalar and/or encoder accumulators, then snap into the valid
    /// region if geometry is installed.
    #[allow(clippy::too_many_arguments)]
    pub fn reset(
        &self,
        x_mm: f64,
        y_mm: f64,
        theta_deg: f64,
        base_total_distance_mm: Option<f64>,
        base_total_angle_deg: Option<f64>,
        base_left_encoder_counts: Option<u16>,
        base_right_encoder_counts: Option<u16>,
    ) {
        let (event, x, y, theta_deg_out) = {
            let mut state = self.state.lock().unwrap();
            state.x_mm = x_mm;
            state.y_mm = y_mm;
            state.theta_rad = normalize_theta(theta_deg.to_radians());
            state.snap_to_valid();
            state.last_total_distance_mm = base_total_distance_mm;
            state.last_total_angle_deg = base_total_angle_deg;
            state.last_left_encoder_counts = base_left_encoder_counts;
            state.last_right_encoder_counts = base_right_encoder_counts;
            state.last_delta_distance_mm = 0.0;
            state.last_delta_angle_deg = 0.0;
            let theta_deg_out = state.theta_rad.to_degrees();
            (
                HistoryEvent {
                    event: "reset",
                    x_mm: state.x_mm,
                    y_mm: state.y_mm,
                    theta_deg: theta_deg_out,
                    distance_mm: None,
                    angle_deg: None,
                    telemetry_ts: None,
                    source: None,
                    blend_pos: None,
                    blend_theta: None,
                },
                state.x_mm,
                state.y_mm,
                theta_deg_out,
            )
        };
        debug!(x, y, theta_deg_out, "pose estimator reset");
        self.emit(event);
    }

    /// Fuse one telemetry reading into the running pose, dispatching to
    /// encoder or scalar-total integration per the configured source.
    pub fn update(&self, input: &OdometryInput) -> Pose {
        let has_encoders = input.left_encoder_counts.is_some() && input.right_encoder_counts.is_some();
        let use_encoders = matches!(
            self.state.lock().unwrap().source,
            OdometrySource::Encoders | OdometrySource::Auto | OdometrySource::DistanceAngle
        );

        if use_encoders && has_encoders {
            self.update_from_encoders(input)
        } else {
            self.update_from_totals(input)
        }
    }

    fn update_from_encoders(&self, input: &OdometryInput) -> Pose {
        let left = input.left_encoder_counts.unwrap();
        let right = input.right_encoder_counts.unwrap();

        let (event, pose) = {
            let mut state = self.state.lock().unwrap();

            let oi_delta_angle_deg = if state.source == OdometrySource::DistanceAngle {
                Self::consume_oi_angle_delta(&mut state, input.total_angle_deg as f64)
            } else {
                None
            };

            let (dl_mm, dr_mm) = Self::consume_encoder_wheels_mm(&mut state, left, right);
            let mut d = ((dl_mm + dr_mm) * 0.5) * state.linear_scale;
            let bump_active = input.bump_left || input.bump_right;
            if bump_active && d > 0.0 {
                d = 0.0;
            }
            let angle_deg = match oi_delta_angle_deg {
                Some(oi) => oi * state.angular_scale,
                None => ((dr_mm - dl_mm) / WHEEL_BASE_MM).to_degrees() * state.angular_scale,
            };
            let a_rad = angle_deg.to_radians();

            let applied_d = state.apply_theta_then_translate(d, a_rad);
            state.last_delta_distance_mm = applied_d;
            state.last_delta_angle_deg = angle_deg;

            let event = (applied_d != 0.0 || a_rad != 0.0).then(|| HistoryEvent {
                event: "update",
                x_mm: state.x_mm,
                y_mm: state.y_mm,
                theta_deg: state.theta_rad.to_degrees(),
                distance_mm: Some(applied_d),
                angle_deg: Some(angle_deg),
                telemetry_ts: input.timestamp,
                source: Some("encoders"),
                blend_pos: None,
                blend_theta: None,
            });
            (event, state.pose())
        };
        if let Some(event) = event {
            self.emit(event);
        }
        pose
    }

    fn consume_encoder_wheels_mm(state: &mut State, left: u16, right: u16) -> (f64, f64) {
        let (Some(last_left), Some(last_right)) =
            (state.last_left_encoder_counts, state.last_right_encoder_counts)
        else {
            state.last_left_encoder_counts = Some(left);
            state.last_right_encoder_counts = Some(right);
            return (0.0, 0.0);
        };
        let dl = delta_encoder_counts(last_left, left) as f64 * state.mm_per_tick;
        let dr = delta_encoder_counts(last_right, right) as f64 * state.mm_per_tick;
        state.last_left_encoder_counts = Some(left);
        state.last_right_encoder_counts = Some(right);
        (dl, dr)
    }

    fn consume_oi_angle_delta(state: &mut State, total_angle_deg: f64) -> Option<f64> {
        let Some(last) = state.last_total_angle_deg else {
            state.last_total_angle_deg = Some(total_angle_deg);
            return None;
        };
        state.last_total_angle_deg = Some(total_angle_deg);
        Some(total_angle_deg - last)
    }

    fn update_from_totals(&self, input: &OdometryInput) -> Pose {
        let total_distance_mm = input.total_distance_mm as f64;
        let total_angle_deg = input.total_angle_deg as f64;

        let (event, pose) = {
            let mut state = self.state.lock().unwrap();

            let (Some(last_distance), Some(last_angle)) =
                (state.last_total_distance_mm, state.last_total_angle_deg)
            else {
                state.last_total_distance_mm = Some(total_distance_mm);
                state.last_total_angle_deg = Some(total_angle_deg);
                return state.pose();
            };

            let delta_distance_mm = (total_distance_mm - last_distance) * state.linear_scale;
            let delta_angle_deg = (total_angle_deg - last_angle) * state.angular_scale;
            state.last_total_distance_mm = Some(total_distance_mm);
            state.last_total_angle_deg = Some(total_angle_deg);

            if delta_distance_mm.abs() <= EPSILON && delta_angle_deg.abs() <= EPSILON {
                state.last_delta_distance_mm = 0.0;
                state.last_delta_angle_deg = 0.0;
                return state.pose();
            }

            let a_rad = delta_angle_deg.to_radians();
            let applied_d = state.apply_theta_then_translate(delta_distance_mm, a_rad);
            state.last_delta_distance_mm = applied_d;
            state.last_delta_angle_deg = delta_angle_deg;

            let event = HistoryEvent {
                event: "update",
                x_mm: state.x_mm,
                y_mm: state.y_mm,
                theta_deg: state.theta_rad.to_degrees(),
                distance_mm: Some(applied_d),
                angle_deg: Some(delta_angle_deg),
                telemetry_ts: input.timestamp,
                source: Some("distance_angle"),
                blend_pos: None,
                blend_theta: None,
            };
            (Some(event), state.pose())
        };
        if let Some(event) = event {
            self.emit(event);
        }
        pose
    }

    /// Blend an externally observed pose into the running estimate.
    /// `blend_pos`/`blend_theta` are clamped to `[0, 1]`; theta blends via
    /// the shortest signed angular difference. Never touches accumulators
    /// or encoder baselines.
    pub fn apply_external_pose(
        &self,
        x_mm: f64,
        y_mm: f64,
        theta_deg: f64,
        blend_pos: f64,
        blend_theta: f64,
        source: &'static str,
    ) -> Pose {
        let (event, pose) = {
            let mut state = self.state.lock().unwrap();
            let bp = blend_pos.clamp(0.0, 1.0);
            let bt = blend_theta.clamp(0.0, 1.0);

            state.x_mm += (x_mm - state.x_mm) * bp;
            state.y_mm += (y_mm - state.y_mm) * bp;

            let current_theta_deg = state.theta_rad.to_degrees();
            let delta_theta_deg = ((theta_deg - current_theta_deg + 180.0).rem_euclid(360.0)) - 180.0;
            let new_theta_deg = current_theta_deg + delta_theta_deg * bt;
            state.theta_rad = normalize_theta(new_theta_deg.to_radians());

            state.snap_to_valid();
            state.last_delta_distance_mm = 0.0;
            state.last_delta_angle_deg = 0.0;

            let event = HistoryEvent {
                event: "external_pose",
                x_mm: state.x_mm,
                y_mm: state.y_mm,
                theta_deg: state.theta_rad.to_degrees(),
                distance_mm: None,
                angle_deg: None,
                telemetry_ts: None,
                source: Some(source),
                blend_pos: Some(bp),
                blend_theta: Some(bt),
            };
            (event, state.pose())
        };
        self.emit(event);
        pose
    }
}
