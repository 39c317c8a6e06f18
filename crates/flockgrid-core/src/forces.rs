//! Acceleration kernels applied after the neighbor query, and the integrator.

use std::f32::consts::PI;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::NeighborList;
use crate::strategy::AgentView;

/// Pulls every agent outside the cage straight back towards the origin.
const WALL_SOLID_COEF: f32 = 200.0;

const VORTEX_V_PERIOD: f32 = 0.8 * PI;
const VORTEX_H_PERIOD: f32 = 0.625 * PI;
const VORTEX_CENTER_MASK: f32 = 0.1;
const VORTEX_VERTICAL_C0: f32 = 0.6;
/// Radial gradient of the vertical component, per wall distance.
const VORTEX_VERTICAL_C1: f32 = -0.4;
const VORTEX_HORIZONTAL: f32 = 0.05;

/// Relative strength of the three flocking rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlockWeights {
    pub alignment: f32,
    pub cohesion: f32,
    pub separation: f32,
}

/// Running sums of the flocking rules over accepted neighbors.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlockAccumulator {
    alignment: Vec3,
    cohesion: Vec3,
    separation: Vec3,
    count: u32,
}

impl FlockAccumulator {
    /// Record one neighbor at `position` moving with `velocity`; `direction` is the unit
    /// vector from the agent towards it.
    #[inline]
    pub fn add(&mut self, position: Vec3, velocity: Vec3, direction: Vec3) {
        self.alignment += velocity;
        self.cohesion += position;
        self.separation -= direction;
        self.count += 1;
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Combined steering for an agent at `position` with `velocity`; zero without neighbors.
    #[must_use]
    pub fn acceleration(&self, position: Vec3, velocity: Vec3, weights: FlockWeights) -> Vec3 {
        if self.count == 0 {
            return Vec3::ZERO;
        }
        let inv = 1.0 / self.count as f32;
        (self.alignment * inv - velocity) * weights.alignment
            + (self.cohesion * inv - position) * weights.cohesion
            + self.separation * inv * weights.separation
    }
}

/// Flocking acceleration of `row` from its materialised neighbor list.
#[must_use]
pub fn flock_acceleration(
    view: AgentView<'_>,
    row: usize,
    neighbors: &NeighborList,
    weights: FlockWeights,
) -> Vec3 {
    let origin = view.position(row);
    let mut acc = FlockAccumulator::default();
    for other in neighbors.iter() {
        let position = view.position(other);
        acc.add(
            position,
            view.velocity(other),
            (position - origin).normalize_or_zero(),
        );
    }
    acc.acceleration(origin, view.velocity(row), weights)
}

/// Soft repulsion from the six faces of the cube `[-scale/2, scale/2]^3`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallField {
    half_extent: f32,
    distance: f32,
    weight: f32,
}

impl WallField {
    #[must_use]
    pub fn new(wall_scale: f32, distance: f32, weight: f32) -> Self {
        Self {
            half_extent: wall_scale * 0.5,
            distance,
            weight,
        }
    }

    #[must_use]
    pub fn is_inside(&self, pos: Vec3) -> bool {
        pos.abs().cmple(Vec3::splat(self.half_extent)).all()
    }

    #[inline]
    fn axis_push(&self, x: f32) -> f32 {
        let gap = (self.half_extent - x.abs()).max(f32::EPSILON);
        let push = self.weight * self.distance / gap;
        if x >= 0.0 { -push } else { push }
    }

    /// Acceleration after applying the walls to `acc` at `pos`.
    ///
    /// Outside the cage the incoming acceleration is replaced, not added to.
    #[must_use]
    pub fn apply(&self, pos: Vec3, acc: Vec3) -> Vec3 {
        if self.is_inside(pos) {
            acc + Vec3::new(
                self.axis_push(pos.x),
                self.axis_push(pos.y),
                self.axis_push(pos.z),
            )
        } else {
            (-pos).normalize_or_zero() * WALL_SOLID_COEF
        }
    }
}

/// Vortex around the vertical (Y) axis through the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VortexField {
    intensity: f32,
    dist_wall_inv: f32,
}

impl VortexField {
    #[must_use]
    pub fn new(wall_scale: f32, intensity: f32) -> Self {
        Self {
            intensity,
            dist_wall_inv: 2.0 / wall_scale,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.intensity != 0.0
    }

    #[must_use]
    pub fn acceleration(&self, pos: Vec3) -> Vec3 {
        let planar = Vec2::new(pos.x, pos.z);
        let r = planar.length();
        if r <= VORTEX_CENTER_MASK {
            return Vec3::new(0.0, VORTEX_VERTICAL_C0 * self.intensity, 0.0);
        }
        let side = Vec2::new(-planar.y, planar.x) / r;
        let reach = r * self.dist_wall_inv;
        let grad = VORTEX_VERTICAL_C1 * self.dist_wall_inv;
        let vertical = (VORTEX_VERTICAL_C0 + grad * r) * (VORTEX_V_PERIOD * reach).cos();
        let horizontal = side * (VORTEX_HORIZONTAL * (1.0 - (VORTEX_H_PERIOD * reach).cos()));
        Vec3::new(horizontal.x, vertical, horizontal.y) * self.intensity
    }
}

/// Semi-implicit Euler step with the speed clamped to `[min_speed, max_speed]`.
///
/// Resets the acceleration for the next tick.
pub fn integrate(
    position: &mut Vec3,
    velocity: &mut Vec3,
    acceleration: &mut Vec3,
    dt: f32,
    min_speed: f32,
    max_speed: f32,
) {
    *velocity += *acceleration * dt;
    let speed = velocity.length();
    *velocity = velocity.normalize_or_zero() * speed.clamp(min_speed, max_speed);
    *position += *velocity * dt;
    *acceleration = Vec3::ZERO;
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEIGHTS: FlockWeights = FlockWeights {
        alignment: 2.0,
        cohesion: 3.0,
        separation: 2.0,
    };

    #[test]
    fn accumulator_without_neighbors_is_zero() {
        let acc = FlockAccumulator::default();
        assert_eq!(acc.acceleration(Vec3::ONE, Vec3::X, WEIGHTS), Vec3::ZERO);
    }

    #[test]
    fn accumulator_averages_rules() {
        let mut acc = FlockAccumulator::default();
        acc.add(Vec3::new(1.0, 0.0, 0.0), Vec3::Y, Vec3::X);
        acc.add(Vec3::new(-1.0, 0.0, 0.0), Vec3::Y, -Vec3::X);
        let out = acc.acceleration(Vec3::ZERO, Vec3::ZERO, WEIGHTS);
        assert!((out - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-6);
        assert_eq!(acc.count(), 2);
    }

    #[test]
    fn list_kernel_matches_accumulator() {
        let positions = [Vec3::ZERO, Vec3::new(0.3, 0.0, 0.2), Vec3::new(-0.1, 0.4, 0.0)];
        let velocities = [Vec3::Z, Vec3::X, Vec3::Y];
        let view = AgentView::new(&positions, &velocities);
        let mut list = NeighborList::default();
        list.push(1);
        list.push(2);

        let mut acc = FlockAccumulator::default();
        for other in [1, 2] {
            acc.add(
                positions[other],
                velocities[other],
                positions[other].normalize_or_zero(),
            );
        }
        let expected = acc.acceleration(Vec3::ZERO, Vec3::Z, WEIGHTS);
        assert!((flock_acceleration(view, 0, &list, WEIGHTS) - expected).length() < 1e-6);
    }

    #[test]
    fn wall_pushes_inwards_and_recalls_escapees() {
        let wall = WallField::new(10.0, 3.0, 1.0);
        let near_top = wall.apply(Vec3::new(0.0, 4.0, 0.0), Vec3::ZERO);
        assert!(near_top.y < -2.9, "push {near_top}");
        assert!(near_top.x < 0.0 && near_top.z < 0.0, "zero coordinate counts as positive side");

        let outside = wall.apply(Vec3::new(6.0, 0.0, 0.0), Vec3::splat(9.0));
        assert!((outside - Vec3::new(-200.0, 0.0, 0.0)).length() < 1e-3);
    }

    #[test]
    fn wall_push_is_felt_beyond_wall_distance() {
        let wall = WallField::new(10.0, 3.0, 1.0);
        // Gap 4 on x and 5 on y and z, all wider than the wall distance.
        let acc = wall.apply(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO);
        assert!((acc - Vec3::new(-0.75, -0.6, -0.6)).length() < 1e-5, "push {acc}");
    }

    #[test]
    fn vortex_is_tangential_and_scaled() {
        let vortex = VortexField::new(10.0, 2.0);
        let acc = vortex.acceleration(Vec3::new(3.0, 0.0, 0.0));
        let tangential = Vec3::new(acc.x, 0.0, acc.z);
        assert!(tangential.dot(Vec3::X).abs() < 1e-6);
        assert!(acc.z > 0.0);
        let center = vortex.acceleration(Vec3::new(0.01, 1.0, 0.0));
        assert_eq!(center, Vec3::new(0.0, 1.2, 0.0));
        assert!(!VortexField::new(10.0, 0.0).is_enabled());
    }

    #[test]
    fn integrate_clamps_speed_and_resets_acceleration() {
        let mut pos = Vec3::ZERO;
        let mut vel = Vec3::new(0.1, 0.0, 0.0);
        let mut acc = Vec3::ZERO;
        integrate(&mut pos, &mut vel, &mut acc, 0.5, 2.0, 5.0);
        assert!((vel.length() - 2.0).abs() < 1e-5);
        assert!((pos.x - 1.0).abs() < 1e-5);

        let mut acc = Vec3::new(0.0, 100.0, 0.0);
        integrate(&mut pos, &mut vel, &mut acc, 1.0, 2.0, 5.0);
        assert!((vel.length() - 5.0).abs() < 1e-4);
        assert_eq!(acc, Vec3::ZERO);
    }
}
