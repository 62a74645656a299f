//! Step-and-slide motion clamping against installed collision geometry
//! (§4.4 `MotionClamper`).

use crate::geometry::CollisionGeometry;

const EPSILON: f64 = 1e-6;
const CLEARANCE_TOL_MM: f64 = 2.0;
const SLIDE_SCALES: [f64; 4] = [1.0, 0.7, 0.45, 0.25];

fn accept_clearance(start_clearance: f64, candidate_clearance: f64) -> bool {
    if start_clearance >= 0.0 {
        candidate_clearance >= 0.0
    } else {
        candidate_clearance >= start_clearance - CLEARANCE_TOL_MM
    }
}

/// Clamps a desired translation against a `CollisionGeometry`, sliding
/// along blocking edges when the direct step would leave the valid
/// region.
#[derive(Debug, Default)]
pub struct MotionClamper;

impl MotionClamper {
    pub fn new() -> Self {
        Self
    }

    /// Apply `desired_distance_mm` (signed; negative means reverse) in
    /// direction `heading_rad`, starting from `(start_x_mm, start_y_mm)`.
    /// Returns the cumulative `(dx, dy, signed_distance)` actually applied.
    /// With no geometry installed, the step passes through unclamped.
    pub fn apply(
        &self,
        geometry: Option<&CollisionGeometry>,
        start_x_mm: f64,
        start_y_mm: f64,
        heading_rad: f64,
        desired_distance_mm: f64,
    ) -> (f64, f64, f64) {
        if desired_distance_mm.abs() <= EPSILON {
            return (0.0, 0.0, 0.0);
        }
        let Some(geometry) = geometry.filter(|g| g.is_installed()) else {
            return (
                desired_distance_mm * heading_rad.cos(),
                desired_distance_mm * heading_rad.sin(),
                desired_distance_mm,
            );
        };

        let direction = if desired_distance_mm >= 0.0 { 1.0 } else { -1.0 };
        let distance = desired_distance_mm.abs();
        let radius = geometry.radius_mm();
        let max_step = 20.0_f64.min(if radius > 0.0 { radius * 0.5 } else { 20.0 }).max(5.0);
        let step_dx_unit = direction * heading_rad.cos();
        let step_dy_unit = direction * heading_rad.sin();

        let mut remaining = distance;
        let mut cur_x = start_x_mm;
        let mut cur_y = start_y_mm;
        let mut start_clearance = geometry.clearance_mm(cur_x, cur_y);
        let mut moved_dx = 0.0;
        let mut moved_dy = 0.0;

        while remaining > EPSILON {
            let step_len = max_step.min(remaining);
            let step_dx = step_dx_unit * step_len;
            let step_dy = step_dy_unit * step_len;
            let probe_x = cur_x + step_dx;
            let probe_y = cur_y + step_dy;
            let probe_clearance = geometry.clearance_mm(probe_x, probe_y);

            if accept_clearance(start_clearance, probe_clearance) {
                cur_x = probe_x;
                cur_y = probe_y;
                moved_dx += step_dx;
                moved_dy += step_dy;
                start_clearance = probe_clearance;
                remaining -= step_len;
                continue;
            }

            match self.try_slide(geometry, cur_x, cur_y, step_dx, step_dy, probe_x, probe_y, start_clearance) {
                Some((sdx, sdy)) => {
                    cur_x += sdx;
                    cur_y += sdy;
                    moved_dx += sdx;
                    moved_dy += sdy;
                    start_clearance = geometry.clearance_mm(cur_x, cur_y);
                    remaining -= step_len;
                }
                None => break,
            }
        }

        let moved_norm = (moved_dx * moved_dx + moved_dy * moved_dy).sqrt();
        let moved_signed = if direction >= 0.0 { moved_norm } else { -moved_norm };
        (moved_dx, moved_dy, moved_signed)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_slide(
        &self,
        geometry: &CollisionGeometry,
        base_x: f64,
        base_y: f64,
        step_dx: f64,
        step_dy: f64,
        probe_x: f64,
        probe_y: f64,
        start_clearance: f64,
    ) -> Option<(f64, f64)> {
        let edge = geometry
            .nearest_blocking_edge(probe_x, probe_y)
            .or_else(|| geometry.nearest_blocking_edge(base_x, base_y))?;
        let (tx, ty) = edge.tangent().map(|t| (t.x, t.y))?;

        let tangent_step = step_dx * tx + step_dy * ty;
        if tangent_step.abs() <= EPSILON {
            return None;
        }

        for scale in SLIDE_SCALES {
            let move_len = tangent_step * scale;
            let cand_dx = tx * move_len;
            let cand_dy = ty * move_len;
            let clearance = geometry.clearance_mm(base_x + cand_dx, base_y + cand_dy);
            if accept_clearance(start_clearance, clearance) {
                return Some((cand_dx, cand_dy));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f64) -> Vec<(f64, f64)> {
        vec![(0.0, 0.0), (side, 0.0), (side, side), (0.0, side)]
    }

    #[test]
    fn no_geometry_passes_step_through() {
        let clamper = MotionClamper::new();
        let (dx, dy, d) = clamper.apply(None, 0.0, 0.0, 0.0, 100.0);
        assert!((dx - 100.0).abs() < 1e-6);
        assert!(dy.abs() < 1e-6);
        assert!((d - 100.0).abs() < 1e-6);
    }

    #[test]
    fn unobstructed_step_advances_fully() {
        let geometry = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        let clamper = MotionClamper::new();
        let (dx, dy, d) = clamper.apply(Some(&geometry), 500.0, 500.0, 0.0, 100.0);
        assert!((dx - 100.0).abs() < 1.0);
        assert!(dy.abs() < 1.0);
        assert!((d - 100.0).abs() < 1.0);
    }

    #[test]
    fn wall_slide_scenario() {
        // §8 scenario 5: room 1000x1000, r=50, start (200, 940, 45deg),
        // forward step large enough to push past the top wall.
        let geometry = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        let clamper = MotionClamper::new();
        let heading = 45.0_f64.to_radians();
        let (dx, dy, _) = clamper.apply(Some(&geometry), 200.0, 940.0, heading, 300.0);
        assert!(dx >= 30.0);
        assert!(940.0 + dy <= 951.0);
    }

    #[test]
    fn collision_clamp_scenario() {
        // §8 scenario 6: obstacle square 400..600 x 300..500, r=80, start
        // (300, 500, 0deg), forward step of ~800mm.
        let room = vec![(0.0, 0.0), (1200.0, 0.0), (1200.0, 1000.0), (0.0, 1000.0)];
        let obstacle = vec![(400.0, 300.0), (600.0, 300.0), (600.0, 500.0), (400.0, 500.0)];
        let geometry = CollisionGeometry::new(room, vec![obstacle], 80.0);
        let clamper = MotionClamper::new();
        let (dx, dy, _) = clamper.apply(Some(&geometry), 300.0, 500.0, 0.0, 800.0);
        assert!(300.0 + dx <= 420.0);
        assert!(dy.abs() < 1.0);
    }

    #[test]
    fn zero_distance_is_a_no_op() {
        let clamper = MotionClamper::new();
        let (dx, dy, d) = clamper.apply(None, 0.0, 0.0, 1.0, 0.0);
        assert_eq!((dx, dy, d), (0.0, 0.0, 0.0));
    }
}
