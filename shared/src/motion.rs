//! Motion integration and terrain collision on the sphere.
//!
//! This is the single solver used by the authority for every tank and by the
//! client when predicting its own tank, so it must stay a pure function of
//! `(state, keys, dt, terrain, tuning)`.

use crate::sphere::{clamp_phi, safe_sin_phi, wrap_signed, wrap_theta, SpherePoint, SPHERE_RADIUS};
use crate::terrain::{GridTerrain, TerrainOracle};
use crate::{DirectionalKeys, TANK_HALF_LENGTH, TANK_HALF_WIDTH};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Speed multiplier applied when the move was salvaged by sliding along one axis.
pub const SLIDE_SPEED_FACTOR: f64 = 0.85;
/// Speed multiplier applied when every slide option was blocked.
pub const BLOCKED_SPEED_FACTOR: f64 = 0.3;
/// Headings sampled when checking that a tank can turn in place.
const CLEARANCE_HEADINGS: usize = 16;

/// Tank handling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionTuning {
    /// Radians per second while a turn key is held.
    pub turn_rate: f64,
    pub acceleration: f64,
    /// Deceleration when no throttle key is held.
    pub friction: f64,
    pub max_speed: f64,
    pub max_reverse_speed: f64,
    pub half_length: f64,
    pub half_width: f64,
}

impl Default for MotionTuning {
    fn default() -> Self {
        Self {
            turn_rate: 1.8,
            acceleration: 30.0,
            friction: 20.0,
            max_speed: 40.0,
            max_reverse_speed: 15.0,
            half_length: TANK_HALF_LENGTH,
            half_width: TANK_HALF_WIDTH,
        }
    }
}

/// Everything the solver reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionState {
    pub theta: f64,
    pub phi: f64,
    /// Radians clockwise from north.
    pub heading: f64,
    /// Signed speed along the heading, world units per second.
    pub speed: f64,
}

impl MotionState {
    pub fn at(point: SpherePoint, heading: f64) -> Self {
        Self {
            theta: point.theta,
            phi: point.phi,
            heading: wrap_theta(heading),
            speed: 0.0,
        }
    }

    pub fn position(&self) -> SpherePoint {
        SpherePoint {
            theta: self.theta,
            phi: self.phi,
        }
    }
}

/// How the terrain shaped the last move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    None,
    /// New longitude kept, latitude reverted.
    SlideLongitude,
    /// New latitude kept, longitude reverted.
    SlideLatitude,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOutcome {
    pub state: MotionState,
    pub collision: Collision,
}

/// Moves `point` by `forward`/`right` world units in the frame of `heading`.
pub fn offset_point(point: &SpherePoint, heading: f64, forward: f64, right: f64) -> SpherePoint {
    let (sin_h, cos_h) = heading.sin_cos();
    let north = forward * cos_h - right * sin_h;
    let east = forward * sin_h + right * cos_h;
    SpherePoint {
        theta: wrap_theta(point.theta + east / (SPHERE_RADIUS * safe_sin_phi(point.phi))),
        phi: clamp_phi(point.phi - north / SPHERE_RADIUS),
    }
}

/// Inverse of [`offset_point`]: `(forward, right)` of `target` as seen from
/// `origin` facing `heading`.
pub fn to_local_frame(origin: &SpherePoint, heading: f64, target: &SpherePoint) -> (f64, f64) {
    let east = wrap_signed(target.theta - origin.theta) * SPHERE_RADIUS * safe_sin_phi(origin.phi);
    let north = -(target.phi - origin.phi) * SPHERE_RADIUS;
    let (sin_h, cos_h) = heading.sin_cos();
    (north * cos_h + east * sin_h, -north * sin_h + east * cos_h)
}

/// True when any probe of the footprint at `center`/`heading` is on blocked terrain.
pub fn footprint_blocked<T: TerrainOracle + ?Sized>(
    terrain: &T,
    center: &SpherePoint,
    heading: f64,
    tuning: &MotionTuning,
) -> bool {
    let (l, w) = (tuning.half_length, tuning.half_width);
    let probes = [(0.0, 0.0), (l, w), (l, -w), (-l, w), (-l, -w)];
    probes.iter().any(|(forward, right)| {
        let probe = offset_point(center, heading, *forward, *right);
        terrain.is_blocked(probe.theta, probe.phi)
    })
}

/// Integrates one frame of input and resolves it against the terrain.
pub fn integrate<T: TerrainOracle + ?Sized>(
    state: MotionState,
    keys: &DirectionalKeys,
    dt: f64,
    terrain: &T,
    tuning: &MotionTuning,
) -> MotionOutcome {
    let turn = f64::from(keys.right as u8) - f64::from(keys.left as u8);
    let heading = wrap_theta(state.heading + turn * tuning.turn_rate * dt);

    let mut speed = state.speed;
    match (keys.forward, keys.back) {
        (true, false) => speed += tuning.acceleration * dt,
        (false, true) => speed -= tuning.acceleration * dt,
        _ => {
            let decay = tuning.friction * dt;
            speed = if speed > 0.0 {
                (speed - decay).max(0.0)
            } else {
                (speed + decay).min(0.0)
            };
        }
    }
    speed = speed.clamp(-tuning.max_reverse_speed, tuning.max_speed);

    let (sin_h, cos_h) = heading.sin_cos();
    let north = speed * cos_h;
    let east = speed * sin_h;
    let moved = SpherePoint {
        theta: wrap_theta(state.theta + east * dt / (SPHERE_RADIUS * safe_sin_phi(state.phi))),
        phi: clamp_phi(state.phi - north * dt / SPHERE_RADIUS),
    };

    let old = state.position();
    let candidates = [
        (moved, Collision::None, 1.0),
        (
            SpherePoint {
                theta: moved.theta,
                phi: old.phi,
            },
            Collision::SlideLongitude,
            SLIDE_SPEED_FACTOR,
        ),
        (
            SpherePoint {
                theta: old.theta,
                phi: moved.phi,
            },
            Collision::SlideLatitude,
            SLIDE_SPEED_FACTOR,
        ),
    ];

    for (point, collision, factor) in candidates {
        // a slide that lands back on the old position is no slide at all
        if collision != Collision::None && point == old {
            continue;
        }
        if !footprint_blocked(terrain, &point, heading, tuning) {
            return MotionOutcome {
                state: MotionState {
                    theta: point.theta,
                    phi: point.phi,
                    heading,
                    speed: speed * factor,
                },
                collision,
            };
        }
    }

    // Rotating into a wall is reverted along with the position.
    let heading = if footprint_blocked(terrain, &old, heading, tuning) {
        state.heading
    } else {
        heading
    };
    MotionOutcome {
        state: MotionState {
            theta: old.theta,
            phi: old.phi,
            heading,
            speed: speed * BLOCKED_SPEED_FACTOR,
        },
        collision: Collision::Blocked,
    }
}

/// Moves a point a fixed distance along a heading without any terrain test.
/// Projectiles use this with the same tangent-plane projection as tanks.
pub fn advance_point(point: &SpherePoint, heading: f64, distance: f64) -> SpherePoint {
    let (sin_h, cos_h) = heading.sin_cos();
    SpherePoint {
        theta: wrap_theta(point.theta + distance * sin_h / (SPHERE_RADIUS * safe_sin_phi(point.phi))),
        phi: clamp_phi(point.phi - distance * cos_h / SPHERE_RADIUS),
    }
}

/// True when a tank centered on `center` clears the terrain at every sampled
/// heading, so it can turn in place and drive off in any direction.
pub fn spot_is_clear<T: TerrainOracle + ?Sized>(
    terrain: &T,
    center: &SpherePoint,
    tuning: &MotionTuning,
) -> bool {
    (0..CLEARANCE_HEADINGS).all(|step| {
        let heading = step as f64 * TAU / CLEARANCE_HEADINGS as f64;
        !footprint_blocked(terrain, center, heading, tuning)
    })
}

/// Spot nearest `point` where a tank fits without touching terrain.
pub fn nearest_clear_spot(
    terrain: &GridTerrain,
    point: &SpherePoint,
    tuning: &MotionTuning,
) -> Option<SpherePoint> {
    terrain.nearest_where(point, |candidate| spot_is_clear(terrain, candidate, tuning))
}

/// Random spot outside the polar caps where a tank fits.
pub fn random_clear_spot<R: Rng>(
    terrain: &GridTerrain,
    rng: &mut R,
    tuning: &MotionTuning,
) -> Option<SpherePoint> {
    terrain.random_where(rng, |candidate| spot_is_clear(terrain, candidate, tuning))
}
