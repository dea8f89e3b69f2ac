//! Spherical coordinate helpers shared by the authority and the predictor.
//!
//! Positions are `(theta, phi)`: longitude in `[0, 2π)` and colatitude in
//! `(0, π)`, where `phi = 0` is the north pole. Distances along the surface are
//! expressed in world units on a sphere of radius [`SPHERE_RADIUS`].

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Radius of the playable sphere in world units.
pub const SPHERE_RADIUS: f64 = 400.0;

/// Colatitude is kept this far away from either pole.
pub const POLE_EPSILON: f64 = 0.05;

/// Lower bound for `sin(phi)` when dividing east velocity into longitude.
pub const SIN_EPSILON: f64 = 0.05;

/// A point on the sphere's surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpherePoint {
    pub theta: f64,
    pub phi: f64,
}

impl SpherePoint {
    /// Builds a point, normalising longitude and clamping colatitude.
    pub fn new(theta: f64, phi: f64) -> Self {
        Self {
            theta: wrap_theta(theta),
            phi: clamp_phi(phi),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.theta.is_finite() && self.phi.is_finite()
    }

    /// Cartesian unit vector for the point.
    pub fn unit_vector(&self) -> [f64; 3] {
        let (sin_phi, cos_phi) = self.phi.sin_cos();
        let (sin_theta, cos_theta) = self.theta.sin_cos();
        [sin_phi * cos_theta, sin_phi * sin_theta, cos_phi]
    }

    /// Central angle to `other`, in radians.
    pub fn angle_to(&self, other: &SpherePoint) -> f64 {
        dot(&self.unit_vector(), &other.unit_vector())
            .clamp(-1.0, 1.0)
            .acos()
    }

    /// Great-circle distance to `other`, in world units.
    pub fn distance_to(&self, other: &SpherePoint) -> f64 {
        self.angle_to(other) * SPHERE_RADIUS
    }
}

pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Wraps a longitude into `[0, 2π)`.
pub fn wrap_theta(theta: f64) -> f64 {
    let wrapped = theta.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Wraps an angle difference into `[-π, π)`.
pub fn wrap_signed(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped >= PI {
        wrapped - TAU
    } else {
        wrapped
    }
}

/// How far inside the pole bounds a clamped colatitude lands.
const POLE_MARGIN: f64 = 1e-9;

/// Clamps a colatitude into the open band `(POLE_EPSILON, PI - POLE_EPSILON)`.
pub fn clamp_phi(phi: f64) -> f64 {
    phi.clamp(POLE_EPSILON + POLE_MARGIN, PI - POLE_EPSILON - POLE_MARGIN)
}

/// `sin(phi)` clamped away from zero, used as the longitude divisor.
pub fn safe_sin_phi(phi: f64) -> f64 {
    phi.sin().max(SIN_EPSILON)
}

/// Surface-distance magnitude of the displacement `a -> b` measured in the
/// tangent plane at `a`, with longitude wrap-around normalised first.
pub fn tangent_distance(a: &SpherePoint, b: &SpherePoint) -> f64 {
    let east = wrap_signed(b.theta - a.theta) * SPHERE_RADIUS * a.phi.sin();
    let north = (b.phi - a.phi) * SPHERE_RADIUS;
    (east * east + north * north).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_wrap_theta_range() {
        assert_approx_eq!(wrap_theta(-0.5), TAU - 0.5, 1e-12);
        assert_approx_eq!(wrap_theta(TAU + 0.25), 0.25, 1e-12);
        assert_eq!(wrap_theta(-1e-18), 0.0);
        assert!(wrap_theta(TAU) < TAU);
    }

    #[test]
    fn test_wrap_signed() {
        assert_approx_eq!(wrap_signed(TAU - 0.1), -0.1, 1e-12);
        assert_approx_eq!(wrap_signed(0.1 - TAU), 0.1, 1e-12);
        assert!(wrap_signed(PI) < PI);
    }

    #[test]
    fn test_clamp_phi() {
        assert!(clamp_phi(0.0) > POLE_EPSILON);
        assert!(clamp_phi(PI) < PI - POLE_EPSILON);
        assert_approx_eq!(clamp_phi(0.0), POLE_EPSILON, 1e-6);
        assert_approx_eq!(clamp_phi(PI), PI - POLE_EPSILON, 1e-6);
        assert!(clamp_phi(POLE_EPSILON) > POLE_EPSILON);
        assert_eq!(clamp_phi(1.0), 1.0);
    }

    #[test]
    fn test_distance_across_seam() {
        let a = SpherePoint::new(0.01, PI / 2.0);
        let b = SpherePoint::new(TAU - 0.01, PI / 2.0);
        assert_approx_eq!(a.distance_to(&b), 0.02 * SPHERE_RADIUS, 1e-6);
        assert_approx_eq!(tangent_distance(&a, &b), 0.02 * SPHERE_RADIUS, 1e-6);
    }

    #[test]
    fn test_unit_vector_is_normalised() {
        let p = SpherePoint::new(1.3, 0.7);
        let v = p.unit_vector();
        assert_approx_eq!(dot(&v, &v), 1.0, 1e-12);
    }
}
