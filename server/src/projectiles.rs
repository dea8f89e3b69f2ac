//! Projectile flight and swept hit detection.
//!
//! Shells are fast and thin compared to a tank's footprint, so every tick the
//! path is walked in sub-steps no longer than half of the hitbox's narrow side
//! and each sample is tested against every eligible tank. The first
//! step/target pair to register a hit consumes the shell.

use crate::game::Tank;
use log::debug;
use shared::motion::{advance_point, offset_point, to_local_frame};
use shared::sphere::SpherePoint;
use shared::terrain::TerrainOracle;
use shared::{EntityId, Faction, Lifecycle, MotionTuning, ProjectileState};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectileTuning {
    pub min_speed: f64,
    pub max_speed: f64,
    pub min_damage: i32,
    pub max_damage: i32,
    pub min_range: f64,
    pub max_range: f64,
    /// Seconds a shell may fly before it is discarded.
    pub max_age: f64,
    pub radius: f64,
    /// Minimum seconds between two shots of the same tank.
    pub refire_interval: f64,
    pub respawn_delay: f64,
}

impl Default for ProjectileTuning {
    fn default() -> Self {
        Self {
            min_speed: 120.0,
            max_speed: 260.0,
            min_damage: 15,
            max_damage: 45,
            min_range: 150.0,
            max_range: 450.0,
            max_age: 3.0,
            radius: 0.5,
            refire_interval: 0.8,
            respawn_delay: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub id: u32,
    pub owner: EntityId,
    pub owner_faction: Faction,
    pub position: SpherePoint,
    pub origin: SpherePoint,
    pub heading: f64,
    pub speed: f64,
    pub age: f64,
    pub max_age: f64,
    pub max_distance: f64,
    pub damage: i32,
}

impl Projectile {
    pub fn to_state(&self) -> ProjectileState {
        ProjectileState {
            id: self.id,
            owner: self.owner,
            faction: self.owner_faction,
            position: self.position,
            heading: self.heading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitReport {
    pub projectile_id: u32,
    pub owner: EntityId,
    pub target: EntityId,
    pub damage: i32,
    pub killed: bool,
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Builds a shell from a validated charge in `[0, 1]`. Every parameter is
/// derived here; nothing the client sent besides the charge is used.
pub fn spawn_projectile(
    tank: &Tank,
    charge_power: f32,
    id: u32,
    tuning: &ProjectileTuning,
    hitbox: &MotionTuning,
) -> Projectile {
    let charge = f64::from(charge_power.clamp(0.0, 1.0));
    let heading = tank.motion.heading + tank.turret_angle;
    // leave the muzzle just outside the firing tank's own footprint
    let muzzle = offset_point(
        &tank.motion.position(),
        heading,
        hitbox.half_length + tuning.radius + 1.0,
        0.0,
    );

    Projectile {
        id,
        owner: tank.id,
        owner_faction: tank.faction,
        position: muzzle,
        origin: muzzle,
        heading,
        speed: lerp(tuning.min_speed, tuning.max_speed, charge),
        age: 0.0,
        max_age: tuning.max_age,
        max_distance: lerp(tuning.min_range, tuning.max_range, charge),
        damage: lerp(f64::from(tuning.min_damage), f64::from(tuning.max_damage), charge).round()
            as i32,
    }
}

/// Exact oriented-box test in the target's heading frame.
pub fn hits_tank(point: &SpherePoint, tank: &Tank, radius: f64, hitbox: &MotionTuning) -> bool {
    let (forward, right) = to_local_frame(&tank.motion.position(), tank.motion.heading, point);
    forward.abs() <= hitbox.half_length + radius && right.abs() <= hitbox.half_width + radius
}

fn find_target(
    point: &SpherePoint,
    projectile: &Projectile,
    tanks: &BTreeMap<EntityId, Tank>,
    remaining_hp: &BTreeMap<EntityId, i32>,
    tuning: &ProjectileTuning,
    hitbox: &MotionTuning,
) -> Option<EntityId> {
    let reach = hitbox.half_length.hypot(hitbox.half_width) + tuning.radius;

    tanks
        .values()
        .filter(|tank| tank.lifecycle == Lifecycle::Deployed && tank.id != projectile.owner)
        // a tank destroyed earlier this tick takes no further hits
        .filter(|tank| remaining_hp.get(&tank.id).map_or(true, |hp| *hp > 0))
        // friendly fire is ruled out before the box test
        .filter(|tank| tank.faction != projectile.owner_faction)
        .filter(|tank| tank.motion.position().distance_to(point) <= reach)
        .find(|tank| hits_tank(point, tank, tuning.radius, hitbox))
        .map(|tank| tank.id)
}

/// Number of sub-steps needed so no step exceeds half the hitbox's narrow side.
pub fn required_substeps(distance: f64, hitbox: &MotionTuning) -> u32 {
    let max_step = hitbox.half_length.min(hitbox.half_width);
    if distance <= max_step {
        1
    } else {
        (distance / max_step).ceil() as u32
    }
}

/// Advances every shell by `dt`, applying damage on hit and dropping shells
/// that hit, leave their range, outlive their age or strike terrain.
pub fn advance_projectiles<T: TerrainOracle + ?Sized>(
    projectiles: &mut Vec<Projectile>,
    tanks: &mut BTreeMap<EntityId, Tank>,
    terrain: &T,
    dt: f64,
    tuning: &ProjectileTuning,
    hitbox: &MotionTuning,
) -> Vec<HitReport> {
    let mut survivors = Vec::with_capacity(projectiles.len());
    let hits = fly_projectiles(projectiles, tanks, terrain, dt, tuning, hitbox, &mut survivors);
    *projectiles = survivors;
    apply_hits(tanks, &hits, tuning);
    hits
}

/// Flies every shell for `dt` without touching the world.
///
/// Shells still in flight afterwards are pushed onto `survivors`; the hits
/// are returned for [`apply_hits`].
pub fn fly_projectiles<T: TerrainOracle + ?Sized>(
    projectiles: &[Projectile],
    tanks: &BTreeMap<EntityId, Tank>,
    terrain: &T,
    dt: f64,
    tuning: &ProjectileTuning,
    hitbox: &MotionTuning,
    survivors: &mut Vec<Projectile>,
) -> Vec<HitReport> {
    let mut hits = Vec::new();
    let mut remaining_hp: BTreeMap<EntityId, i32> = BTreeMap::new();

    'shells: for shell in projectiles {
        let mut projectile = shell.clone();
        let distance = projectile.speed * dt;
        let steps = required_substeps(distance, hitbox);
        let step_len = distance / f64::from(steps);

        for _ in 0..steps {
            projectile.position = advance_point(&projectile.position, projectile.heading, step_len);

            if terrain.is_point_blocked(&projectile.position) {
                debug!("Projectile {} struck terrain", projectile.id);
                continue 'shells;
            }

            let target = find_target(&projectile.position, &projectile, tanks, &remaining_hp, tuning, hitbox);
            if let Some(target_id) = target {
                let hp = remaining_hp
                    .entry(target_id)
                    .or_insert_with(|| tanks.get(&target_id).map_or(0, |tank| tank.hp));
                *hp -= projectile.damage;
                debug!(
                    "Projectile {} from {} hit {} for {} (hp {})",
                    projectile.id, projectile.owner, target_id, projectile.damage, (*hp).max(0)
                );
                hits.push(HitReport {
                    projectile_id: projectile.id,
                    owner: projectile.owner,
                    target: target_id,
                    damage: projectile.damage,
                    killed: *hp <= 0,
                });
                continue 'shells;
            }
        }

        projectile.age += dt;
        let traveled = projectile.origin.distance_to(&projectile.position);
        if projectile.age < projectile.max_age && traveled < projectile.max_distance {
            survivors.push(projectile);
        }
    }

    hits
}

/// Applies damage and kill bookkeeping for hits from [`fly_projectiles`].
pub fn apply_hits(tanks: &mut BTreeMap<EntityId, Tank>, hits: &[HitReport], tuning: &ProjectileTuning) {
    for hit in hits {
        let Some(target) = tanks.get_mut(&hit.target) else {
            continue;
        };
        target.hp = (target.hp - hit.damage).max(0);
        if hit.killed {
            target.hp = 0;
            target.lifecycle = Lifecycle::Dead;
            target.killed_by = Some(hit.owner);
            target.respawn_timer = tuning.respawn_delay;
            target.motion.speed = 0.0;
            target.pending_fire = None;
        }
    }
}
