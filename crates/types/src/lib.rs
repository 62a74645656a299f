//! Shared data model for the cleaning-robot bridge.
//!
//! Plain serde structs and enums with no behavior; `robot`, `localization`,
//! `plan`, `vision`, `history` and `bridge` all build on these.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 2D pose in millimeters/radians. `theta_rad` is always normalized to
/// `(-pi, pi]` by every operation that mutates a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_rad: f64,
    /// Signed distance applied by the most recent motion update (diagnostic).
    pub last_delta_distance_mm: f64,
    /// Signed heading change applied by the most recent motion update, in degrees (diagnostic).
    pub last_delta_angle_deg: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            x_mm: 0.0,
            y_mm: 0.0,
            theta_rad: 0.0,
            last_delta_distance_mm: 0.0,
            last_delta_angle_deg: 0.0,
        }
    }
}

/// Normalize an angle in radians to `(-pi, pi]`.
pub fn normalize_theta(theta_rad: f64) -> f64 {
    let mut t = (theta_rad + std::f64::consts::PI) % (2.0 * std::f64::consts::PI);
    if t <= 0.0 {
        t += 2.0 * std::f64::consts::PI;
    }
    t - std::f64::consts::PI
}

/// Charging state decoded from OI sensor packet 21.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingState {
    NotCharging,
    Reconditioning,
    FullCharging,
    TrickleCharging,
    Waiting,
    ChargingFault,
    Unknown(u8),
}

impl ChargingState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NotCharging,
            1 => Self::Reconditioning,
            2 => Self::FullCharging,
            3 => Self::TrickleCharging,
            4 => Self::Waiting,
            5 => Self::ChargingFault,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            Self::NotCharging => "not_charging".to_string(),
            Self::Reconditioning => "reconditioning".to_string(),
            Self::FullCharging => "full_charging".to_string(),
            Self::TrickleCharging => "trickle_charging".to_string(),
            Self::Waiting => "waiting".to_string(),
            Self::ChargingFault => "charging_fault".to_string(),
            Self::Unknown(code) => format!("unknown_{code}"),
        }
    }
}

impl Default for ChargingState {
    fn default() -> Self {
        Self::NotCharging
    }
}

impl Serialize for ChargingState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChargingState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "not_charging" => Self::NotCharging,
            "reconditioning" => Self::Reconditioning,
            "full_charging" => Self::FullCharging,
            "trickle_charging" => Self::TrickleCharging,
            "waiting" => Self::Waiting,
            "charging_fault" => Self::ChargingFault,
            other => other
                .strip_prefix("unknown_")
                .and_then(|n| n.parse().ok())
                .map(Self::Unknown)
                .unwrap_or(Self::Unknown(0)),
        })
    }
}

/// Live sensor-stream state, served by value so readers never observe a
/// half-applied frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: DateTime<Utc>,
    pub roomba_connected: bool,

    pub bump_left: bool,
    pub bump_right: bool,
    pub wheel_drop_left: bool,
    pub wheel_drop_right: bool,
    pub wheel_drop_caster: bool,
    pub wall_seen: bool,
    pub cliff_left: bool,
    pub cliff_front_left: bool,
    pub cliff_front_right: bool,
    pub cliff_right: bool,
    pub charging_source_home_base: bool,
    pub charging_source_internal: bool,

    pub charging_state_code: u8,
    pub state: ChargingState,
    pub battery_charge_mah: u16,
    pub battery_capacity_mah: u16,
    pub battery_pct: u8,
    pub distance_mm: i16,
    pub angle_deg: i16,
    pub total_distance_mm: i64,
    pub total_angle_deg: i64,
    pub left_encoder_counts: u16,
    pub right_encoder_counts: u16,
}

impl TelemetrySnapshot {
    /// True if either bumper is presently tripped.
    pub fn bumper(&self) -> bool {
        self.bump_left || self.bump_right
    }

    /// Dock beacon visibility is carried on the same bit as the home-base
    /// charging source (packet 34, bit 1).
    pub fn dock_visible(&self) -> bool {
        self.charging_source_home_base
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            roomba_connected: false,
            bump_left: false,
            bump_right: false,
            wheel_drop_left: false,
            wheel_drop_right: false,
            wheel_drop_caster: false,
            wall_seen: false,
            cliff_left: false,
            cliff_front_left: false,
            cliff_front_right: false,
            cliff_right: false,
            charging_source_home_base: false,
            charging_source_internal: false,
            charging_state_code: 0,
            state: ChargingState::NotCharging,
            battery_charge_mah: 0,
            battery_capacity_mah: 0,
            battery_pct: 0,
            distance_mm: 0,
            angle_deg: 0,
            total_distance_mm: 0,
            total_angle_deg: 0,
            left_encoder_counts: 0,
            right_encoder_counts: 0,
        }
    }
}

/// A point in the plan's coordinate frame, in millimeters.
pub type PlanPoint = (f64, f64);

/// A rigid obstacle placed in the plan: either an inline local contour or a
/// reference into `Plan::object_shapes`, positioned by `(x_mm, y_mm, theta_deg)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanObject {
    #[serde(default)]
    pub shape_ref: Option<String>,
    #[serde(default)]
    pub contour: Option<Vec<PlanPoint>>,
    #[serde(default)]
    pub x_mm: f64,
    #[serde(default)]
    pub y_mm: f64,
    #[serde(default)]
    pub theta_deg: f64,
}

/// Starting pose seeded from a plan file when no history is available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoseSeed {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
}

/// A fiducial marker's known plan-frame anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerAnchor {
    pub id: i32,
    pub x_mm: f64,
    pub y_mm: f64,
    #[serde(default)]
    pub size_mm: Option<f64>,
    #[serde(default)]
    pub theta_deg: Option<f64>,
    #[serde(default)]
    pub snap_pose: Option<PlanPoint>,
    #[serde(default)]
    pub front_offset_mm: Option<f64>,
}

/// Validated floor plan: room contour, obstacles, marker anchors, optional
/// start pose. Units are millimeters throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub contour: Vec<PlanPoint>,
    #[serde(default)]
    pub objects: Vec<PlanObject>,
    #[serde(default)]
    pub object_shapes: HashMap<String, Vec<PlanPoint>>,
    #[serde(default)]
    pub start_pose: Option<PoseSeed>,
    #[serde(default)]
    pub aruco_markers: Vec<MarkerAnchor>,
}

/// Transient: one detected fiducial marker in pixel space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub id: i32,
    /// Four image corners in detection order.
    pub corners: [(f64, f64); 4],
    pub center: (f64, f64),
    pub area_px: f64,
}

/// A derived absolute-pose estimate from one or two matched markers.
#[derive(Debug, Clone, Copy)]
pub struct MarkerObservation {
    pub target_x_mm: f64,
    pub target_y_mm: f64,
    pub target_theta_deg: f64,
    pub blend_pos: f64,
    pub blend_theta: f64,
    pub source: PoseSnapSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseSnapSource {
    ArucoSnap,
    ArucoPairSnap,
}

impl PoseSnapSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArucoSnap => "aruco_snap",
            Self::ArucoPairSnap => "aruco_pair_snap",
        }
    }
}

/// Client-issued control command (§6 command surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Init,
    Mode { value: String },
    Drive { velocity: i32, radius: i32 },
    Stop,
    Clean,
    Dock,
}

impl Command {
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Init => "init",
            Self::Mode { .. } => "mode",
            Self::Drive { .. } => "drive",
            Self::Stop => "stop",
            Self::Clean => "clean",
            Self::Dock => "dock",
        }
    }
}

/// Structured acknowledgement for a successfully handled command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Ack {
    pub ok: bool,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guarded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_reason: Option<String>,
}

/// Structured error reply for an unhandled or rejected command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandError {
    pub ok: bool,
    pub error: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_default_is_origin() {
        let pose = Pose::default();
        assert_eq!(pose.x_mm, 0.0);
        assert_eq!(pose.y_mm, 0.0);
        assert_eq!(pose.theta_rad, 0.0);
    }

    #[test]
    fn normalize_theta_wraps_into_half_open_range() {
        assert!((normalize_theta(0.0) - 0.0).abs() < 1e-9);
        assert!((normalize_theta(std::f64::consts::PI) - std::f64::consts::PI).abs() < 1e-9);
        // -pi wraps up to +pi (half-open on the low end).
        assert!((normalize_theta(-std::f64::consts::PI) - std::f64::consts::PI).abs() < 1e-9);
        let wrapped = normalize_theta(3.0 * std::f64::consts::PI);
        assert!((wrapped - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn normalize_theta_is_idempotent_in_range() {
        for i in -20..20 {
            let raw = i as f64 * 0.3;
            let once = normalize_theta(raw);
            let twice = normalize_theta(once);
            assert!((once - twice).abs() < 1e-9);
            assert!(once > -std::f64::consts::PI && once <= std::f64::consts::PI);
        }
    }

    #[test]
    fn charging_state_roundtrips_known_codes() {
        for code in 0..=5u8 {
            let state = ChargingState::from_code(code);
            let json = serde_json::to_string(&state).unwrap();
            let decoded: ChargingState = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded.as_str(), state.as_str());
        }
    }

    #[test]
    fn charging_state_unknown_code_formats_with_value() {
        let state = ChargingState::from_code(42);
        assert_eq!(state.as_str(), "unknown_42");
    }

    #[test]
    fn telemetry_snapshot_bumper_is_either_bump() {
        let mut snap = TelemetrySnapshot::default();
        assert!(!snap.bumper());
        snap.bump_left = true;
        assert!(snap.bumper());
    }

    #[test]
    fn telemetry_snapshot_dock_visible_tracks_home_base_bit() {
        let mut snap = TelemetrySnapshot::default();
        assert!(!snap.dock_visible());
        snap.charging_source_home_base = true;
        assert!(snap.dock_visible());
    }

    #[test]
    fn command_serde_tags_on_action() {
        let cmd = Command::Drive {
            velocity: 200,
            radius: 1000,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"action\":\"drive\""));
        let decoded: Command = serde_json::from_str(&json).unwrap();
        assert!(matches!(decoded, Command::Drive { velocity: 200, radius: 1000 }));
    }

    #[test]
    fn command_mode_carries_value_field() {
        let json = r#"{"action":"mode","value":"full"}"#;
        let decoded: Command = serde_json::from_str(json).unwrap();
        match decoded {
            Command::Mode { value } => assert_eq!(value, "full"),
            other => panic!("expected Mode, got {other:?}"),
        }
    }

    #[test]
    fn plan_deserializes_minimal_json() {
        let json = r#"{"contour":[[0,0],[100,0],[100,100],[0,100]]}"#;
        let plan: Plan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.contour.len(), 4);
        assert!(plan.objects.is_empty());
        assert!(plan.start_pose.is_none());
    }

    #[test]
    fn pose_snap_source_names_match_spec_wire_values() {
        assert_eq!(PoseSnapSource::ArucoSnap.as_str(), "aruco_snap");
        assert_eq!(PoseSnapSource::ArucoPairSnap.as_str(), "aruco_pair_snap");
    }
}
