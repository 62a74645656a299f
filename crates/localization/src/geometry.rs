//! Polygon clearance and point-in-polygon for the floor plan (§4.4
//! `CollisionGeometry`).
//!
//! `CollisionGeometry` holds the room contour and a list of obstacle
//! polygons, both already transformed into world coordinates, plus the
//! robot's disc radius. "Valid" means the disc of that radius around a
//! query point lies within the room and outside every obstacle.

use nalgebra::Vector2;
use types::{Plan, PlanPoint};

const EPSILON: f64 = 1e-6;

/// An edge of a polygon, used as a candidate to slide along.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub a: Vector2<f64>,
    pub b: Vector2<f64>,
}

impl Edge {
    fn tangent_unit(&self) -> Option<Vector2<f64>> {
        let d = self.b - self.a;
        let norm = d.norm();
        if norm <= EPSILON {
            None
        } else {
            Some(d / norm)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Polygon {
    points: Vec<Vector2<f64>>,
}

impl Polygon {
    pub fn new(points: Vec<PlanPoint>) -> Self {
        Self {
            points: points.into_iter().map(|(x, y)| Vector2::new(x, y)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.len() < 3
    }

    fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| Edge {
            a: self.points[i],
            b: self.points[(i + 1) % n],
        })
    }

    /// Crossing-number point-in-polygon test, with a collinear-on-edge
    /// fast path counted as "inside" (§4.4).
    fn contains(&self, p: Vector2<f64>) -> bool {
        if self.is_empty() {
            return false;
        }
        let mut inside = false;
        for edge in self.edges() {
            if point_on_segment(p, edge.a, edge.b) {
                return true;
            }
            let (x1, y1) = (edge.a.x, edge.a.y);
            let (x2, y2) = (edge.b.x, edge.b.y);
            let intersects =
                ((y1 > p.y) != (y2 > p.y)) && (p.x < (x2 - x1) * (p.y - y1) / (y2 - y1 + EPSILON) + x1);
            if intersects {
                inside = !inside;
            }
        }
        inside
    }

    /// Minimum distance from `p` to any edge of this polygon.
    fn edge_distance(&self, p: Vector2<f64>) -> f64 {
        self.edges()
            .map(|e| distance_point_segment(p, e.a, e.b))
            .fold(f64::INFINITY, f64::min)
    }

    fn closest_edge(&self, p: Vector2<f64>) -> Option<(Edge, f64)> {
        self.edges()
            .map(|e| (e, distance_point_segment(p, e.a, e.b)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Drop a closing duplicate of the first point, and reject polygons that
/// still have fewer than 3 vertices.
fn normalize_polygon(points: &[PlanPoint]) -> Vec<PlanPoint> {
    let mut points = points.to_vec();
    if points.len() >= 2 {
        let (fx, fy) = points[0];
        let (lx, ly) = points[points.len() - 1];
        if (fx - lx).abs() < EPSILON && (fy - ly).abs() < EPSILON {
            points.pop();
        }
    }
    if points.len() >= 3 {
        points
    } else {
        Vec::new()
    }
}

fn point_on_segment(p: Vector2<f64>, a: Vector2<f64>, b: Vector2<f64>) -> bool {
    let ab = b - a;
    let ap = p - a;
    let cross = (ab.x * ap.y - ab.y * ap.x).abs();
    if cross > 1e-3 {
        return false;
    }
    let dot = ap.dot(&ab);
    if dot < -EPSILON {
        return false;
    }
    let sq_len = ab.norm_squared();
    dot - sq_len <= EPSILON
}

fn distance_point_segment(p: Vector2<f64>, a: Vector2<f64>, b: Vector2<f64>) -> f64 {
    let ab = b - a;
    let den = ab.norm_squared();
    if den <= EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / den).clamp(0.0, 1.0);
    let q = a + ab * t;
    (p - q).norm()
}

/// Inflated floor plan: room contour plus obstacle polygons in world
/// coordinates, and the robot disc radius to check against.
#[derive(Debug, Clone, Default)]
pub struct CollisionGeometry {
    room: Polygon,
    obstacles: Vec<Polygon>,
    radius_mm: f64,
}

impl CollisionGeometry {
    pub fn new(room: Vec<PlanPoint>, obstacles: Vec<Vec<PlanPoint>>, radius_mm: f64) -> Self {
        Self {
            room: Polygon::new(room),
            obstacles: obstacles.into_iter().map(Polygon::new).collect(),
            radius_mm: radius_mm.max(0.0),
        }
    }

    /// Build world-space geometry from a `Plan`: the room contour as-is,
    /// and each object's local contour (or its `shape_ref` lookup)
    /// rotated and translated by the object's pose (§4.4).
    pub fn from_plan(plan: &Plan, robot_radius_mm: f64) -> Self {
        let contour = normalize_polygon(&plan.contour);
        let mut obstacles = Vec::with_capacity(plan.objects.len());
        for obj in &plan.objects {
            let local = match &obj.contour {
                Some(points) => normalize_polygon(points),
                None => obj
                    .shape_ref
                    .as_deref()
                    .and_then(|name| plan.object_shapes.get(name))
                    .map(|points| normalize_polygon(points))
                    .unwrap_or_default(),
            };
            if local.len() < 3 {
                continue;
            }
            let theta = obj.theta_deg.to_radians();
            let (sin, cos) = theta.sin_cos();
            let world: Vec<PlanPoint> = local
                .into_iter()
                .map(|(x, y)| (obj.x_mm + (x * cos - y * sin), obj.y_mm + (x * sin + y * cos)))
                .collect();
            obstacles.push(world);
        }
        Self::new(contour, obstacles, robot_radius_mm)
    }

    /// Uninstall geometry entirely: a distinct state from an installed but
    /// degenerate polygon (original-source `set_collision_plan(None)`).
    pub fn clear(&mut self) {
        self.room = Polygon::default();
        self.obstacles = Vec::new();
        self.radius_mm = 0.0;
    }

    pub fn is_installed(&self) -> bool {
        !self.room.is_empty()
    }

    pub fn radius_mm(&self) -> f64 {
        self.radius_mm
    }

    /// Signed clearance of `(x_mm, y_mm)`: negative means inside an
    /// obstacle or outside the room (§4.4).
    pub fn clearance_mm(&self, x_mm: f64, y_mm: f64) -> f64 {
        if self.room.is_empty() {
            return f64::INFINITY;
        }
        let p = Vector2::new(x_mm, y_mm);
        let room_edge = self.room.edge_distance(p);
        let mut clearance = if self.room.contains(p) {
            room_edge - self.radius_mm
        } else {
            -room_edge
        };
        for obstacle in &self.obstacles {
            let obs_edge = obstacle.edge_distance(p);
            let obs_clearance = if obstacle.contains(p) {
                -obs_edge
            } else {
                obs_edge - self.radius_mm
            };
            clearance = clearance.min(obs_clearance);
        }
        clearance
    }

    pub fn is_valid(&self, x_mm: f64, y_mm: f64) -> bool {
        self.clearance_mm(x_mm, y_mm) >= 0.0
    }

    /// The nearest edge that is "blocking" at `(x, y)`: a room edge within
    /// `radius_mm` of the point (or with the point outside the room), or
    /// any obstacle edge similarly qualifying.
    pub fn nearest_blocking_edge(&self, x_mm: f64, y_mm: f64) -> Option<Edge> {
        let p = Vector2::new(x_mm, y_mm);
        let mut candidates: Vec<(Edge, f64)> = Vec::new();

        if let Some((edge, dist)) = self.room.closest_edge(p) {
            if !self.room.contains(p) || dist < self.radius_mm {
                candidates.push((edge, dist));
            }
        }
        for obstacle in &self.obstacles {
            if let Some((edge, dist)) = obstacle.closest_edge(p) {
                if obstacle.contains(p) || dist < self.radius_mm {
                    candidates.push((edge, dist));
                }
            }
        }
        candidates
            .into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(edge, _)| edge)
    }

    /// If `(x_mm, y_mm)` is already valid (or no geometry is installed),
    /// returns it unchanged. Otherwise spirals outward in 20mm rings and
    /// 12-degree steps, up to `max(300, 3 * radius)` mm, returning the
    /// first valid point found in the nearest ring that has one.
    pub fn snap_to_valid(&self, x_mm: f64, y_mm: f64) -> (f64, f64) {
        if self.room.is_empty() || self.is_valid(x_mm, y_mm) {
            return (x_mm, y_mm);
        }
        const RING_STEP_MM: f64 = 20.0;
        const ANGLE_STEP_DEG: f64 = 12.0;
        let max_radius = 300.0_f64.max(self.radius_mm * 3.0);
        let rings = (max_radius / RING_STEP_MM) as u32;

        for ring in 1..=rings {
            let r = ring as f64 * RING_STEP_MM;
            let mut angle_deg = 0.0;
            while angle_deg < 360.0 {
                let a = angle_deg.to_radians();
                let cx = x_mm + r * a.cos();
                let cy = y_mm + r * a.sin();
                if self.is_valid(cx, cy) {
                    return (cx, cy);
                }
                angle_deg += ANGLE_STEP_DEG;
            }
        }
        (x_mm, y_mm)
    }
}

impl Edge {
    /// Unit tangent direction of this edge, or `None` for a degenerate
    /// (zero-length) edge.
    pub fn tangent(&self) -> Option<Vector2<f64>> {
        self.tangent_unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f64) -> Vec<PlanPoint> {
        vec![(0.0, 0.0), (side, 0.0), (side, side), (0.0, side)]
    }

    #[test]
    fn center_of_room_is_valid() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert!(geom.is_valid(500.0, 500.0));
        assert!(geom.clearance_mm(500.0, 500.0) > 0.0);
    }

    #[test]
    fn point_outside_room_has_negative_clearance() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert!(geom.clearance_mm(-10.0, 500.0) < 0.0);
    }

    #[test]
    fn point_near_wall_within_radius_is_invalid() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert!(!geom.is_valid(10.0, 500.0));
    }

    #[test]
    fn point_inside_obstacle_has_negative_clearance() {
        let geom = CollisionGeometry::new(square(1200.0), vec![square(200.0)], 10.0);
        assert!(geom.clearance_mm(100.0, 100.0) < 0.0);
    }

    #[test]
    fn clear_uninstalls_geometry() {
        let mut geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert!(geom.is_installed());
        geom.clear();
        assert!(!geom.is_installed());
        assert_eq!(geom.clearance_mm(500.0, 500.0), f64::INFINITY);
    }

    #[test]
    fn nearest_blocking_edge_finds_room_wall_when_close() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        let edge = geom.nearest_blocking_edge(10.0, 500.0);
        assert!(edge.is_some());
    }

    #[test]
    fn nearest_blocking_edge_none_when_far_from_everything() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert!(geom.nearest_blocking_edge(500.0, 500.0).is_none());
    }

    #[test]
    fn snap_to_valid_is_a_no_op_for_a_valid_point() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        assert_eq!(geom.snap_to_valid(500.0, 500.0), (500.0, 500.0));
    }

    #[test]
    fn snap_to_valid_pulls_an_invalid_point_back_in() {
        let geom = CollisionGeometry::new(square(1000.0), vec![], 50.0);
        let (x, y) = geom.snap_to_valid(-10.0, 500.0);
        assert!(geom.is_valid(x, y));
    }

    #[test]
    fn from_plan_builds_room_and_object_obstacles() {
        use std::collections::HashMap;
        use types::{Plan, PlanObject};

        let plan = Plan {
            contour: square(1000.0),
            objects: vec![PlanObject {
                shape_ref: None,
                contour: Some(square(100.0)),
                x_mm: 500.0,
                y_mm: 500.0,
                theta_deg: 0.0,
            }],
            object_shapes: HashMap::new(),
            start_pose: None,
            aruco_markers: vec![],
        };
        let geom = CollisionGeometry::from_plan(&plan, 10.0);
        assert!(geom.is_installed());
        assert!(geom.clearance_mm(520.0, 520.0) < 0.0);
    }
}
