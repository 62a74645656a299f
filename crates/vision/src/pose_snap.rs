//! Marker-to-absolute-pose derivation (§4.6 `PoseSnap`).
//!
//! Turns a detection result plus the current plan's marker anchors into a
//! `MarkerObservation` ready for `PoseEstimator::apply_external_pose`. Has
//! no precedent in the original roomba bridge — it was dropped from the
//! retrieval pack along with the rest of its caller — so the geometry
//! below is authored directly from the target formulas, in the same
//! plain-function, no-hidden-state shape as the rest of this crate.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use types::{MarkerAnchor, MarkerDetection, MarkerObservation, Plan, PoseSnapSource};

const MIN_DISTANCE_MM: f64 = 70.0;
const MAX_DISTANCE_MM: f64 = 2500.0;
const PAIR_MIN_WORLD_SEPARATION_MM: f64 = 80.0;
const PAIR_MIN_PIXEL_SEPARATION_PX: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct PoseSnapConfig {
    pub snap_enabled: bool,
    pub focal_px: f64,
    pub default_marker_size_mm: f64,
    pub heading_gain_deg: f64,
    /// Upper bound applied to the computed positional blend factor.
    pub pose_blend_cap: f64,
    /// Upper bound applied to the computed heading blend factor.
    pub theta_blend_cap: f64,
}

impl Default for PoseSnapConfig {
    fn default() -> Self {
        Self {
            snap_enabled: true,
            focal_px: 900.0,
            default_marker_size_mm: 150.0,
            heading_gain_deg: 40.0,
            pose_blend_cap: 1.0,
            theta_blend_cap: 1.0,
        }
    }
}

/// Derives absolute pose observations from detected fiducial markers,
/// deduplicating repeated detections of the same physical observation.
pub struct PoseSnap {
    config: PoseSnapConfig,
    last_snap_key: Mutex<Option<(DateTime<Utc>, Vec<i32>)>>,
}

impl PoseSnap {
    pub fn new(config: PoseSnapConfig) -> Self {
        Self {
            config,
            last_snap_key: Mutex::new(None),
        }
    }

    /// No-op (returns `None`) if snapping is disabled, nothing was
    /// detected, the plan has no marker anchors, or no detected id
    /// matches one.
    pub fn process(
        &self,
        markers: &[MarkerDetection],
        frame_width: u32,
        timestamp: Option<DateTime<Utc>>,
        plan: &Plan,
    ) -> Option<MarkerObservation> {
        if !self.config.snap_enabled || markers.is_empty() || plan.aruco_markers.is_empty() {
            return None;
        }

        let mut matched: Vec<(&MarkerAnchor, &MarkerDetection)> = markers
            .iter()
            .filter_map(|det| {
                plan.aruco_markers
                    .iter()
                    .find(|anchor| anchor.id == det.id)
                    .map(|anchor| (anchor, det))
            })
            .collect();
        if matched.is_empty() {
            return None;
        }
        matched.sort_by(|a, b| b.1.area_px.total_cmp(&a.1.area_px));

        if self.is_duplicate(timestamp, &matched) {
            return None;
        }

        pair_snap(&matched, frame_width, &self.config)
            .or_else(|| single_snap(matched[0].0, matched[0].1, frame_width, &self.config))
    }

    fn is_duplicate(&self, timestamp: Option<DateTime<Utc>>, matched: &[(&MarkerAnchor, &MarkerDetection)]) -> bool {
        let Some(ts) = timestamp else { return false };
        let mut ids: Vec<i32> = matched.iter().map(|(_, det)| det.id).collect();
        ids.sort_unstable();
        let mut last = self.last_snap_key.lock().unwrap();
        let is_dup = last.as_ref().is_some_and(|(last_ts, last_ids)| *last_ts == ts && *last_ids == ids);
        if !is_dup {
            *last = Some((ts, ids));
        }
        is_dup
    }
}

struct ShapeMetrics {
    cos: f64,
    /// Signed yaw, in degrees.
    yaw_deg: f64,
}

fn shape_metrics(corners: &[(f64, f64); 4]) -> ShapeMetrics {
    let edge = |a: usize, b: usize| {
        let (ax, ay) = corners[a];
        let (bx, by) = corners[b];
        ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
    };
    let e01 = edge(0, 1);
    let e12 = edge(1, 2);
    let e23 = edge(2, 3);
    let e30 = edge(3, 0);
    let width = (e01 + e23) / 2.0;
    let height = (e12 + e30) / 2.0;
    let cos = (width.min(height) / width.max(height)).clamp(0.08, 1.0);
    let yaw_abs = cos.acos();
    let sign = if e12 - e30 >= 0.0 { 1.0 } else { -1.0 };
    ShapeMetrics {
        cos,
        yaw_deg: sign * yaw_abs.to_degrees(),
    }
}

fn avg_edge_px(corners: &[(f64, f64); 4]) -> f64 {
    let edge = |a: usize, b: usize| {
        let (ax, ay) = corners[a];
        let (bx, by) = corners[b];
        ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
    };
    (edge(0, 1) + edge(1, 2) + edge(2, 3) + edge(3, 0)) / 4.0
}

fn anchor_size_mm(anchor: &MarkerAnchor, config: &PoseSnapConfig) -> f64 {
    anchor.size_mm.unwrap_or(config.default_marker_size_mm)
}

fn area_anchor(size_mm: f64) -> f64 {
    3253.0 * (size_mm / 150.0).powi(2)
}

/// Anchor's outward unit axis and its fallback base offset (mm).
fn anchor_axis(anchor: &MarkerAnchor) -> (f64, f64, f64) {
    if let Some((sx, sy)) = anchor.snap_pose {
        let dx = sx - anchor.x_mm;
        let dy = sy - anchor.y_mm;
        let len = (dx * dx + dy * dy).sqrt();
        if len > f64::EPSILON {
            return (dx / len, dy / len, len);
        }
    }
    let theta_rad = anchor.theta_deg.unwrap_or(0.0).to_radians();
    (theta_rad.cos(), theta_rad.sin(), anchor.front_offset_mm.unwrap_or(0.0))
}

fn normalize_deg(theta_deg: f64) -> f64 {
    let mut theta = theta_deg % 360.0;
    if theta <= -180.0 {
        theta += 360.0;
    } else if theta > 180.0 {
        theta -= 360.0;
    }
    theta
}

fn blend_factors(shape_cos: f64, p: f64, config: &PoseSnapConfig) -> (bool, f64, f64) {
    if shape_cos >= 0.96 - 0.08 * p {
        return (true, config.pose_blend_cap.min(1.0), config.theta_blend_cap.min(1.0));
    }
    let blend_pos = (0.88 + 0.2 * p).clamp(0.9, 1.0).min(config.pose_blend_cap);
    let blend_theta = (0.86 + 0.25 * p).clamp(0.9, 1.0).min(config.theta_blend_cap);
    (false, blend_pos, blend_theta)
}

fn single_snap(
    anchor: &MarkerAnchor,
    detection: &MarkerDetection,
    frame_width: u32,
    config: &PoseSnapConfig,
) -> Option<MarkerObservation> {
    let (ax, ay, base) = anchor_axis(anchor);
    let size_mm = anchor_size_mm(anchor, config);
    let anchor_area = area_anchor(size_mm);
    let p = (detection.area_px / anchor_area).clamp(0.0, 1.0);
    let shape = shape_metrics(&detection.corners);

    let distance = if detection.area_px > 1.0 {
        150.0 * (size_mm / 150.0) * (anchor_area / detection.area_px).sqrt() * shape.cos.sqrt()
    } else {
        let edge_px = avg_edge_px(&detection.corners);
        if edge_px > f64::EPSILON {
            (config.focal_px * size_mm / edge_px) * 0.18
        } else if base > 0.0 {
            base
        } else {
            250.0
        }
    }
    .clamp(MIN_DISTANCE_MM, MAX_DISTANCE_MM);

    let target_x = anchor.x_mm + ax * distance;
    let target_y = anchor.y_mm + ay * distance;
    let base_heading = (-ay).atan2(-ax).to_degrees();

    let frame_width = frame_width.max(1) as f64;
    let pixel_offset_deg = ((detection.center.0 / frame_width) - 0.5) * config.heading_gain_deg * 0.2 * (1.0 - p);
    let shape_correction_deg = shape.yaw_deg * 0.33 * (1.0 - 0.5 * p);

    let (frontal, blend_pos, blend_theta) = blend_factors(shape.cos, p, config);
    let heading = if frontal {
        base_heading
    } else {
        normalize_deg(base_heading + pixel_offset_deg + shape_correction_deg)
    };

    Some(MarkerObservation {
        target_x_mm: target_x,
        target_y_mm: target_y,
        target_theta_deg: normalize_deg(heading),
        blend_pos,
        blend_theta,
        source: PoseSnapSource::ArucoSnap,
    })
}

fn pair_snap(matched: &[(&MarkerAnchor, &MarkerDetection)], frame_width: u32, config: &PoseSnapConfig) -> Option<MarkerObservation> {
    let mut best: Option<(f64, usize, usize)> = None;
    for i in 0..matched.len() {
        for j in 0..matched.len() {
            if i == j {
                continue;
            }
            let (anchor_a, det_a) = matched[i];
            let (anchor_b, det_b) = matched[j];
            let world_sep = ((anchor_b.x_mm - anchor_a.x_mm).powi(2) + (anchor_b.y_mm - anchor_a.y_mm).powi(2)).sqrt();
            let pixel_sep = ((det_b.center.0 - det_a.center.0).powi(2) + (det_b.center.1 - det_a.center.1).powi(2)).sqrt();
            if world_sep < PAIR_MIN_WORLD_SEPARATION_MM || pixel_sep < PAIR_MIN_PIXEL_SEPARATION_PX {
                continue;
            }
            let score = det_a.area_px + det_b.area_px + 120.0 * pixel_sep;
            if best.map(|(best_score, ..)| score > best_score).unwrap_or(true) {
                best = Some((score, i, j));
            }
        }
    }
    let (_, i, j) = best?;
    let (anchor_a, det_a) = matched[i];
    let (anchor_b, det_b) = matched[j];

    let dx = anchor_b.x_mm - anchor_a.x_mm;
    let dy = anchor_b.y_mm - anchor_a.y_mm;
    let spacing_mm = (dx * dx + dy * dy).sqrt();
    let (tx, ty) = (dx / spacing_mm, dy / spacing_mm);
    let candidates = [(-ty, tx), (ty, -tx)];

    let (ax_a, ay_a, _) = anchor_axis(anchor_a);
    let (ax_b, ay_b, _) = anchor_axis(anchor_b);
    let avg_axis = (ax_a + ax_b, ay_a + ay_b);
    let outward = candidates
        .into_iter()
        .max_by(|a, b| (a.0 * avg_axis.0 + a.1 * avg_axis.1).total_cmp(&(b.0 * avg_axis.0 + b.1 * avg_axis.1)))
        .unwrap();

    let pixel_distance = ((det_b.center.0 - det_a.center.0).powi(2) + (det_b.center.1 - det_a.center.1).powi(2)).sqrt();
    let d_pair = config.focal_px * spacing_mm / pixel_distance;

    let size_a = anchor_size_mm(anchor_a, config);
    let size_b = anchor_size_mm(anchor_b, config);
    let avg_size_mm = (size_a + size_b) / 2.0;
    let avg_side_px = (avg_edge_px(&det_a.corners) + avg_edge_px(&det_b.corners)) / 2.0;
    let d_size = config.focal_px * avg_size_mm / avg_side_px;

    let shape_a = shape_metrics(&det_a.corners);
    let shape_b = shape_metrics(&det_b.corners);
    let avg_area = (det_a.area_px + det_b.area_px) / 2.0;
    let avg_shape_cos = (shape_a.cos + shape_b.cos) / 2.0;
    let d_area = config.focal_px * avg_size_mm / avg_area.sqrt() * avg_shape_cos.sqrt();

    let prev = 0.75 * d_pair + 0.25 * d_size;
    let distance = (0.85 * prev + 0.15 * d_area).clamp(MIN_DISTANCE_MM, MAX_DISTANCE_MM);

    let mid_x = (anchor_a.x_mm + anchor_b.x_mm) / 2.0;
    let mid_y = (anchor_a.y_mm + anchor_b.y_mm) / 2.0;
    let target_x = mid_x + outward.0 * distance;
    let target_y = mid_y + outward.1 * distance;
    let base_heading = (-outward.1).atan2(-outward.0).to_degrees();

    let anchor_area_avg = (area_anchor(size_a) + area_anchor(size_b)) / 2.0;
    let p = (avg_area / anchor_area_avg).clamp(0.0, 1.0);

    let mid_cx = (det_a.center.0 + det_b.center.0) / 2.0;
    let frame_width = frame_width.max(1) as f64;
    let pixel_offset_deg = ((mid_cx / frame_width) - 0.5) * config.heading_gain_deg * 0.25 * (1.0 - p);
    let avg_shape_yaw_deg = (shape_a.yaw_deg + shape_b.yaw_deg) / 2.0;
    let shape_correction_deg = avg_shape_yaw_deg * 0.22 * (1.0 - 0.5 * p);

    let (frontal, blend_pos, blend_theta) = blend_factors(avg_shape_cos, p, config);
    let heading = if frontal {
        base_heading
    } else {
        normalize_deg(base_heading + pixel_offset_deg + shape_correction_deg)
    };

    Some(MarkerObservation {
        target_x_mm: target_x,
        target_y_mm: target_y,
        target_theta_deg: normalize_deg(heading),
        blend_pos,
        blend_theta,
        source: PoseSnapSource::ArucoPairSnap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_corners(cx: f64, cy: f64, half: f64) -> [(f64, f64); 4] {
        [
            (cx - half, cy - half),
            (cx + half, cy - half),
            (cx + half, cy + half),
            (cx - half, cy + half),
        ]
    }

    fn frontal_anchor(id: i32, x_mm: f64, y_mm: f64, snap_pose: (f64, f64)) -> MarkerAnchor {
        MarkerAnchor {
            id,
            x_mm,
            y_mm,
            size_mm: Some(150.0),
            theta_deg: None,
            snap_pose: Some(snap_pose),
            front_offset_mm: None,
        }
    }

    fn plan_with(anchors: Vec<MarkerAnchor>) -> Plan {
        Plan {
            contour: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)],
            objects: Vec::new(),
            object_shapes: Default::default(),
            start_pose: None,
            aruco_markers: anchors,
        }
    }

    #[test]
    fn no_matching_anchor_is_a_no_op() {
        let snap = PoseSnap::new(PoseSnapConfig::default());
        let plan = plan_with(vec![frontal_anchor(1, 0.0, 0.0, (0.0, 300.0))]);
        let det = MarkerDetection {
            id: 99,
            corners: square_corners(320.0, 240.0, 50.0),
            center: (320.0, 240.0),
            area_px: 10000.0,
        };
        assert!(snap.process(&[det], 640, None, &plan).is_none());
    }

    #[test]
    fn frontal_square_detection_snaps_hard_with_full_blend() {
        let snap = PoseSnap::new(PoseSnapConfig::default());
        let anchor = frontal_anchor(12, 500.0, 1200.0, (500.0, 1500.0));
        let plan = plan_with(vec![anchor]);
        let det = MarkerDetection {
            id: 12,
            corners: square_corners(320.0, 240.0, 50.0),
            center: (320.0, 240.0),
            area_px: 3200.0,
        };
        let observation = snap.process(&[det], 640, None, &plan).expect("observation");
        assert_eq!(observation.blend_pos, 1.0);
        assert_eq!(observation.blend_theta, 1.0);
        assert!((-100.0..=-80.0).contains(&observation.target_theta_deg));
        assert_eq!(observation.source, PoseSnapSource::ArucoSnap);
    }

    #[test]
    fn consecutive_identical_detections_are_deduplicated() {
        let snap = PoseSnap::new(PoseSnapConfig::default());
        let anchor = frontal_anchor(12, 500.0, 1200.0, (500.0, 1500.0));
        let plan = plan_with(vec![anchor]);
        let det = MarkerDetection {
            id: 12,
            corners: square_corners(320.0, 240.0, 50.0),
            center: (320.0, 240.0),
            area_px: 3200.0,
        };
        let ts = Some(Utc::now());
        assert!(snap.process(&[det], 640, ts, &plan).is_some());
        assert!(snap.process(&[det], 640, ts, &plan).is_none());
    }

    #[test]
    fn shape_metrics_of_a_square_report_no_yaw() {
        let shape = shape_metrics(&square_corners(0.0, 0.0, 10.0));
        assert!((shape.cos - 1.0).abs() < 1e-9);
        assert!(shape.yaw_deg.abs() < 1e-9);
    }

    #[test]
    fn pair_snap_is_skipped_when_markers_are_too_close() {
        let anchor_a = frontal_anchor(1, 0.0, 0.0, (0.0, 300.0));
        let anchor_b = frontal_anchor(2, 10.0, 0.0, (10.0, 300.0));
        let matched = vec![
            (
                &anchor_a,
                &MarkerDetection {
                    id: 1,
                    corners: square_corners(300.0, 240.0, 40.0),
                    center: (300.0, 240.0),
                    area_px: 6400.0,
                },
            ),
            (
                &anchor_b,
                &MarkerDetection {
                    id: 2,
                    corners: square_corners(340.0, 240.0, 40.0),
                    center: (340.0, 240.0),
                    area_px: 6400.0,
                },
            ),
        ];
        assert!(pair_snap(&matched, 640, &PoseSnapConfig::default()).is_none());
    }
}
