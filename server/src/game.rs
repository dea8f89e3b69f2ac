//! Authoritative world state and the per-tick simulation pipeline.
//!
//! One tick runs, in order: human inputs, automated commands, projectiles,
//! capture, respawn timers. Every stage runs under [`run_guarded`] against
//! read-only state and hands back what it produced; the result is only
//! committed once the stage returns, so a stage that panics leaves the world
//! as the previous tick left it.

use crate::bots::{BotCommand, BotRequest, BotView};
use crate::capture::{CaptureEngine, CaptureTuning, OwnershipChange};
use crate::interest::WorldView;
use crate::projectiles::{apply_hits, fly_projectiles, spawn_projectile, HitReport, Projectile, ProjectileTuning};
use crate::scheduler::run_guarded;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::motion::{integrate, nearest_clear_spot, random_clear_spot, Collision};
use shared::sphere::{wrap_signed, SpherePoint};
use shared::terrain::{GridTerrain, TerrainOracle};
use shared::{
    DirectionalKeys, EntityId, EntityKind, EntityState, Faction, GameEvent, InputSample, Lifecycle,
    MotionState, MotionTuning, FACTION_COUNT, TANK_MAX_HP,
};
use std::collections::BTreeMap;
use std::f64::consts::TAU;

/// Radians per second the world's cosmetic rotation advances.
pub const ROTATION_SPEED: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct Tank {
    pub id: EntityId,
    pub kind: EntityKind,
    pub faction: Faction,
    pub motion: MotionState,
    /// Turret angle relative to the hull.
    pub turret_angle: f64,
    pub hp: i32,
    pub max_hp: i32,
    pub lifecycle: Lifecycle,
    pub fire_cooldown: f64,
    pub pending_fire: Option<f32>,
    pub respawn_timer: f64,
    pub killed_by: Option<EntityId>,
    /// Where an undeployed player is looking at the map.
    pub preview: Option<SpherePoint>,
}

impl Tank {
    pub fn new(id: EntityId, kind: EntityKind, faction: Faction) -> Self {
        Self {
            id,
            kind,
            faction,
            motion: MotionState::at(SpherePoint::new(0.0, std::f64::consts::FRAC_PI_2), 0.0),
            turret_angle: 0.0,
            hp: TANK_MAX_HP,
            max_hp: TANK_MAX_HP,
            lifecycle: Lifecycle::AwaitingDeployment,
            fire_cooldown: 0.0,
            pending_fire: None,
            respawn_timer: 0.0,
            killed_by: None,
            preview: None,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.lifecycle == Lifecycle::Deployed
    }

    /// Places the tank at `point` with full health.
    pub fn deploy_at(&mut self, point: SpherePoint, heading: f64) {
        self.motion = MotionState::at(point, heading);
        self.hp = self.max_hp;
        self.lifecycle = Lifecycle::Deployed;
        self.killed_by = None;
        self.respawn_timer = 0.0;
        self.fire_cooldown = 0.0;
        self.pending_fire = None;
    }

    pub fn to_state(&self, commander: bool) -> EntityState {
        EntityState {
            id: self.id,
            kind: self.kind,
            faction: self.faction,
            motion: self.motion,
            turret_angle: self.turret_angle as f32,
            hp: self.hp,
            max_hp: self.max_hp,
            lifecycle: self.lifecycle,
            commander,
        }
    }

    fn bot_view(&self) -> BotView {
        BotView {
            id: self.id,
            faction: self.faction,
            motion: self.motion,
            turret_angle: self.turret_angle,
        }
    }
}

/// Why a deploy request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployError {
    UnknownEntity,
    NotAwaitingDeployment,
    NoOpenGround,
}

/// What one tick produced, for logging and tests.
#[derive(Debug, Default)]
pub struct StepReport {
    pub hits: Vec<HitReport>,
    pub ownership_changes: Vec<OwnershipChange>,
    pub collisions: u32,
    pub failed_stages: u32,
}

pub struct GameState {
    pub tick: u32,
    pub tanks: BTreeMap<EntityId, Tank>,
    pub projectiles: Vec<Projectile>,
    pub territory: CaptureEngine,
    pub commanders: [Option<EntityId>; FACTION_COUNT],
    pub rotation_phase: f64,
    pub motion_tuning: MotionTuning,
    pub projectile_tuning: ProjectileTuning,
    terrain: GridTerrain,
    world_seed: u64,
    next_entity_id: u32,
    next_projectile_id: u32,
    events: Vec<GameEvent>,
    rng: StdRng,
    /// Survivor buffer swapped with `projectiles` every tick.
    flight: Vec<Projectile>,
}

impl GameState {
    /// World generated from `world_seed`.
    pub fn new(world_seed: u64) -> Self {
        Self::with_terrain(GridTerrain::generate(world_seed), world_seed)
    }

    pub fn with_terrain(terrain: GridTerrain, world_seed: u64) -> Self {
        let territory = CaptureEngine::from_terrain(&terrain, CaptureTuning::default());
        Self {
            tick: 0,
            tanks: BTreeMap::new(),
            projectiles: Vec::new(),
            territory,
            commanders: [None; FACTION_COUNT],
            rotation_phase: 0.0,
            motion_tuning: MotionTuning::default(),
            projectile_tuning: ProjectileTuning::default(),
            terrain,
            world_seed,
            next_entity_id: 1,
            next_projectile_id: 1,
            events: Vec::new(),
            rng: StdRng::seed_from_u64(world_seed ^ 0x5eed),
            flight: Vec::new(),
        }
    }

    pub fn terrain(&self) -> &GridTerrain {
        &self.terrain
    }

    pub fn world_seed(&self) -> u64 {
        self.world_seed
    }

    fn allocate_entity_id(&mut self) -> EntityId {
        let id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        id
    }

    /// Faction with the fewest tanks, earliest faction on ties.
    fn least_populated_faction(&self) -> Faction {
        let mut counts = [0usize; FACTION_COUNT];
        for tank in self.tanks.values() {
            counts[tank.faction.index()] += 1;
        }
        Faction::ALL
            .into_iter()
            .min_by_key(|faction| counts[faction.index()])
            .unwrap_or(Faction::Red)
    }

    /// Creates an undeployed tank for a newly connected player.
    pub fn add_human(&mut self) -> (EntityId, Faction) {
        let id = self.allocate_entity_id();
        let faction = self.least_populated_faction();
        self.tanks.insert(id, Tank::new(id, EntityKind::Human, faction));

        if self.commanders[faction.index()].is_none() {
            self.commanders[faction.index()] = Some(id);
            info!("Tank {} is now commander of {:?}", id, faction);
        }

        info!("Added human tank {} for {:?}", id, faction);
        self.events.push(GameEvent::EntityJoined {
            entity_id: id,
            kind: EntityKind::Human,
            faction,
        });
        (id, faction)
    }

    /// Creates an automated tank already deployed on open ground.
    pub fn add_bot(&mut self) -> Option<EntityId> {
        let point = random_clear_spot(&self.terrain, &mut self.rng, &self.motion_tuning)?;
        let id = self.allocate_entity_id();
        let faction = self.least_populated_faction();
        let heading = rand::Rng::gen_range(&mut self.rng, 0.0..TAU);

        let mut tank = Tank::new(id, EntityKind::Automated, faction);
        tank.deploy_at(point, heading);
        self.tanks.insert(id, tank);

        debug!("Added bot {} for {:?}", id, faction);
        self.events.push(GameEvent::EntityJoined {
            entity_id: id,
            kind: EntityKind::Automated,
            faction,
        });
        Some(id)
    }

    /// Tears down a tank: its projectiles and commander role go with it.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        let Some(tank) = self.tanks.remove(&id) else {
            return false;
        };

        self.projectiles.retain(|projectile| projectile.owner != id);
        self.territory.forget(id);

        let slot = tank.faction.index();
        if self.commanders[slot] == Some(id) {
            self.commanders[slot] = self
                .tanks
                .values()
                .find(|t| t.kind == EntityKind::Human && t.faction == tank.faction)
                .map(|t| t.id);
            info!(
                "Commander of {:?} reassigned to {:?}",
                tank.faction, self.commanders[slot]
            );
        }

        info!("Removed tank {}", id);
        self.events.push(GameEvent::EntityLeft { entity_id: id });
        true
    }

    pub fn is_commander(&self, id: EntityId) -> bool {
        self.commanders.contains(&Some(id))
    }

    /// Places an awaiting tank at the nearest spot around `point` its whole
    /// footprint fits on.
    pub fn deploy(&mut self, id: EntityId, point: SpherePoint) -> Result<SpherePoint, DeployError> {
        let spot = nearest_clear_spot(&self.terrain, &point, &self.motion_tuning)
            .ok_or(DeployError::NoOpenGround)?;
        let tank = self.tanks.get_mut(&id).ok_or(DeployError::UnknownEntity)?;
        if tank.lifecycle != Lifecycle::AwaitingDeployment {
            return Err(DeployError::NotAwaitingDeployment);
        }

        tank.deploy_at(spot, 0.0);
        tank.preview = None;
        info!(
            "Tank {} deployed at ({:.3}, {:.3})",
            id, spot.theta, spot.phi
        );
        Ok(spot)
    }

    pub fn set_preview(&mut self, id: EntityId, point: SpherePoint) {
        if let Some(tank) = self.tanks.get_mut(&id) {
            tank.preview = Some(point);
        }
    }

    /// Records a validated fire request; consumed by the next projectile stage.
    pub fn queue_fire(&mut self, id: EntityId, charge_power: f32) -> bool {
        match self.tanks.get_mut(&id) {
            Some(tank) if tank.is_deployed() => {
                tank.pending_fire = Some(charge_power);
                true
            }
            _ => false,
        }
    }

    /// Position snapshots for `id` are filtered around.
    pub fn reference_point(&self, id: EntityId) -> Option<SpherePoint> {
        let tank = self.tanks.get(&id)?;
        if tank.is_deployed() {
            Some(tank.motion.position())
        } else {
            tank.preview
        }
    }

    pub fn bot_request(&self) -> BotRequest {
        let deployed = self.tanks.values().filter(|tank| tank.is_deployed());
        BotRequest {
            tick: self.tick,
            bots: deployed
                .clone()
                .filter(|tank| tank.kind == EntityKind::Automated)
                .map(Tank::bot_view)
                .collect(),
            targets: deployed.map(Tank::bot_view).collect(),
        }
    }

    /// Runs one frame of input through the motion solver for one tank.
    fn drive(&mut self, id: EntityId, keys: &DirectionalKeys, turret_angle: f64, dt: f64) -> Option<Collision> {
        let tick = self.tick;
        let terrain = &self.terrain;
        let tuning = self.motion_tuning;
        let tank = self.tanks.get_mut(&id)?;

        if turret_angle.is_finite() {
            tank.turret_angle = wrap_signed(turret_angle);
        }
        if !tank.is_deployed() {
            return None;
        }

        let start = tank.motion;
        let outcome = run_guarded("motion", tick, || integrate(start, keys, dt, terrain, &tuning))?;
        if !outcome.state.position().is_finite() || !outcome.state.speed.is_finite() {
            warn!("Tank {} produced non-finite motion, keeping previous state", id);
            return None;
        }
        tank.motion = outcome.state;
        Some(outcome.collision)
    }

    pub fn apply_input(&mut self, id: EntityId, input: &InputSample) -> Option<Collision> {
        self.drive(id, &input.keys, f64::from(input.turret_angle), input.dt_seconds())
    }

    pub fn apply_bot_command(&mut self, command: &BotCommand, dt: f64) -> Option<Collision> {
        let is_bot = self
            .tanks
            .get(&command.entity_id)
            .is_some_and(|tank| tank.kind == EntityKind::Automated);
        if !is_bot {
            return None;
        }
        if let Some(charge) = command.fire {
            self.queue_fire(command.entity_id, charge.clamp(0.0, 1.0));
        }
        self.drive(command.entity_id, &command.keys, command.turret_angle, dt)
    }

    /// Shells for every deployed tank with a pending fire request that is
    /// off cooldown. Ids are handed out from `next_id` in tank order.
    fn ready_shots(
        tanks: &BTreeMap<EntityId, Tank>,
        next_id: u32,
        tuning: &ProjectileTuning,
        hitbox: &MotionTuning,
    ) -> Vec<Projectile> {
        let mut id = next_id;
        let mut shots = Vec::new();
        for tank in tanks.values() {
            let Some(charge) = tank.pending_fire else {
                continue;
            };
            if !tank.is_deployed() {
                continue;
            }
            if tank.fire_cooldown > 0.0 {
                debug!("Tank {} fired during cooldown, ignoring", tank.id);
                continue;
            }
            shots.push(spawn_projectile(tank, charge, id, tuning, hitbox));
            id = id.wrapping_add(1);
        }
        shots
    }

    /// Advances the world by one tick.
    ///
    /// `inputs` are this tick's human samples, each integrated with its own
    /// frame time. `bot_commands` are integrated with the tick's `dt`.
    pub fn step(
        &mut self,
        inputs: &[(EntityId, InputSample)],
        bot_commands: &[BotCommand],
        dt: f64,
    ) -> StepReport {
        let mut report = StepReport::default();

        for (entity_id, input) in inputs {
            if let Some(collision) = self.apply_input(*entity_id, input) {
                if collision != Collision::None {
                    report.collisions += 1;
                }
            }
        }
        for command in bot_commands {
            if let Some(collision) = self.apply_bot_command(command, dt) {
                if collision != Collision::None {
                    report.collisions += 1;
                }
            }
        }

        self.step_projectiles(dt, &mut report);
        self.step_capture(dt, &mut report);
        self.step_respawns(dt);

        self.rotation_phase = (self.rotation_phase + ROTATION_SPEED * dt).rem_euclid(TAU);
        self.tick = self.tick.wrapping_add(1);
        report
    }

    fn step_projectiles(&mut self, dt: f64, report: &mut StepReport) {
        let tuning = self.projectile_tuning;
        let hitbox = self.motion_tuning;
        for tank in self.tanks.values_mut() {
            tank.fire_cooldown = (tank.fire_cooldown - dt).max(0.0);
        }

        let tanks = &self.tanks;
        let next_id = self.next_projectile_id;
        match run_guarded("fire", self.tick, || Self::ready_shots(tanks, next_id, &tuning, &hitbox)) {
            Some(shots) => {
                for tank in self.tanks.values_mut() {
                    tank.pending_fire = None;
                }
                for shot in shots {
                    if let Some(tank) = self.tanks.get_mut(&shot.owner) {
                        tank.fire_cooldown = tuning.refire_interval;
                    }
                    self.next_projectile_id = shot.id.wrapping_add(1);
                    self.projectiles.push(shot);
                }
            }
            None => report.failed_stages += 1,
        }

        let mut survivors = std::mem::take(&mut self.flight);
        survivors.clear();
        let (projectiles, tanks, terrain) = (&self.projectiles, &self.tanks, &self.terrain);
        let hits = run_guarded("projectiles", self.tick, || {
            fly_projectiles(projectiles, tanks, terrain, dt, &tuning, &hitbox, &mut survivors)
        });

        let Some(hits) = hits else {
            self.flight = survivors;
            report.failed_stages += 1;
            return;
        };

        self.flight = std::mem::replace(&mut self.projectiles, survivors);
        apply_hits(&mut self.tanks, &hits, &tuning);

        for hit in &hits {
            if hit.killed {
                // the shooter may have left while the shell was in flight
                let killer = self.tanks.contains_key(&hit.owner).then_some(hit.owner);
                info!("Tank {} destroyed by {:?}", hit.target, killer);
                self.events.push(GameEvent::EntityKilled {
                    victim: hit.target,
                    killer,
                });
            }
        }
        report.hits = hits;
    }

    fn step_capture(&mut self, dt: f64, report: &mut StepReport) {
        let territory = &self.territory;
        let terrain = &self.terrain;
        let occupants = self.tanks.values().filter(|tank| tank.is_deployed()).map(|tank| {
            let region = terrain.region_at(tank.motion.theta, tank.motion.phi);
            (tank.id, tank.faction, region)
        });

        let staged = run_guarded("capture", self.tick, || {
            let membership = territory.next_membership(occupants);
            let regions = territory.stage(&membership, dt);
            (membership, regions)
        });

        let Some((membership, regions)) = staged else {
            report.failed_stages += 1;
            return;
        };

        self.territory.set_membership(membership);
        let changes = self.territory.commit(regions);
        for change in &changes {
            self.events.push(GameEvent::OwnershipChanged {
                region: change.region,
                previous: change.previous,
                owner: change.owner,
            });
        }
        report.ownership_changes = changes;
    }

    fn step_respawns(&mut self, dt: f64) {
        let mut redeploy = Vec::new();
        for tank in self.tanks.values_mut() {
            if tank.lifecycle != Lifecycle::Dead {
                continue;
            }
            tank.respawn_timer -= dt;
            if tank.respawn_timer > 0.0 {
                continue;
            }
            match tank.kind {
                EntityKind::Human => {
                    tank.lifecycle = Lifecycle::AwaitingDeployment;
                    tank.hp = tank.max_hp;
                    debug!("Tank {} may redeploy", tank.id);
                }
                EntityKind::Automated => redeploy.push(tank.id),
            }
        }

        for id in redeploy {
            let point = random_clear_spot(&self.terrain, &mut self.rng, &self.motion_tuning);
            let heading = rand::Rng::gen_range(&mut self.rng, 0.0..TAU);
            if let (Some(point), Some(tank)) = (point, self.tanks.get_mut(&id)) {
                tank.deploy_at(point, heading);
                debug!("Bot {} respawned", id);
            }
        }
    }

    /// Flattens every tank and projectile for the interest filter.
    pub fn fill_view(&self, view: &mut WorldView) {
        view.clear();
        for tank in self.tanks.values() {
            view.push_entity(tank.to_state(self.is_commander(tank.id)));
        }
        for projectile in &self.projectiles {
            view.push_projectile(projectile.to_state());
        }
    }

    /// Events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn territory_sync(&self) -> GameEvent {
        GameEvent::TerritorySync {
            owners: self.territory.owners(),
        }
    }

    pub fn chat(&mut self, from: EntityId, text: &str) {
        let text: String = text.chars().take(shared::MAX_CHAT_LEN).collect();
        if text.trim().is_empty() {
            return;
        }
        self.events.push(GameEvent::Chat { from, text });
    }

    pub fn count_kind(&self, kind: EntityKind) -> usize {
        self.tanks.values().filter(|tank| tank.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::motion::offset_point;
    use shared::SPHERE_RADIUS;
    use std::f64::consts::FRAC_PI_2;

    fn open_world() -> GameState {
        GameState::with_terrain(GridTerrain::open(120, 60), 7)
    }

    fn forward(sequence: u32) -> InputSample {
        InputSample {
            sequence,
            keys: DirectionalKeys {
                forward: true,
                ..DirectionalKeys::default()
            },
            turret_angle: 0.0,
            dt: 0.05,
        }
    }

    #[test]
    fn test_humans_balance_factions_and_take_command() {
        let mut game = open_world();
        let (a, fa) = game.add_human();
        let (b, fb) = game.add_human();
        let (c, fc) = game.add_human();

        assert_eq!(
            [fa, fb, fc],
            [Faction::Red, Faction::Green, Faction::Blue]
        );
        assert!(game.is_commander(a) && game.is_commander(b) && game.is_commander(c));
        assert_eq!(game.tanks[&a].lifecycle, Lifecycle::AwaitingDeployment);
    }

    #[test]
    fn test_commander_reassigned_on_removal() {
        let mut game = open_world();
        let (first, faction) = game.add_human();
        game.add_human();
        game.add_human();
        let (second, same) = game.add_human();
        assert_eq!(faction, same);

        assert!(game.remove_entity(first));
        assert_eq!(game.commanders[faction.index()], Some(second));
        let events = game.drain_events();
        assert!(events.contains(&GameEvent::EntityLeft { entity_id: first }));
    }

    #[test]
    fn test_deploy_only_when_awaiting() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        let spot = SpherePoint::new(1.0, FRAC_PI_2);

        assert!(game.deploy(id, spot).is_ok());
        assert!(game.tanks[&id].is_deployed());
        assert_eq!(game.deploy(id, spot), Err(DeployError::NotAwaitingDeployment));
        assert_eq!(game.deploy(EntityId(999), spot), Err(DeployError::UnknownEntity));
    }

    #[test]
    fn test_deploy_beside_wall_can_drive_away() {
        let mut terrain = GridTerrain::open(120, 60);
        let (col, row) = terrain.cell_at(1.0, FRAC_PI_2);
        terrain.set_blocked(col + 1, row, true);
        let mut game = GameState::with_terrain(terrain, 7);
        let (id, _) = game.add_human();

        let edge = (col + 1) as f64 / 120.0 * TAU;
        let beside = SpherePoint::new(edge - 1.0 / SPHERE_RADIUS, FRAC_PI_2);
        let spot = game.deploy(id, beside).unwrap();
        assert_ne!(spot, beside);
        let start = game.tanks[&id].motion;

        let turn_and_go = DirectionalKeys {
            forward: true,
            left: true,
            ..DirectionalKeys::default()
        };
        for sequence in 1..=40 {
            let input = InputSample {
                sequence,
                keys: turn_and_go,
                turret_angle: 0.0,
                dt: 0.05,
            };
            game.step(&[(id, input)], &[], 0.05);
        }

        let end = game.tanks[&id].motion;
        assert_ne!(end.heading, start.heading);
        assert!(end.position().distance_to(&start.position()) > 5.0);
    }

    #[test]
    fn test_bots_spawn_with_room_to_turn() {
        let mut game = GameState::new(11);
        for _ in 0..64 {
            game.add_bot().unwrap();
        }
        let tuning = game.motion_tuning;
        for tank in game.tanks.values() {
            assert!(shared::motion::spot_is_clear(
                game.terrain(),
                &tank.motion.position(),
                &tuning
            ));
        }
    }

    #[test]
    fn test_input_moves_deployed_tank_north() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        game.deploy(id, SpherePoint::new(1.0, FRAC_PI_2)).unwrap();
        let before = game.tanks[&id].motion;

        game.step(&[(id, forward(1))], &[], 0.05);

        let after = game.tanks[&id].motion;
        assert_approx_eq!(after.speed, 1.5, 1e-9);
        assert_approx_eq!(after.phi, before.phi - 1.5 * 0.05 / SPHERE_RADIUS, 1e-12);
        assert_eq!(game.tick, 1);
    }

    #[test]
    fn test_inputs_ignored_while_awaiting() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        let before = game.tanks[&id].motion;
        game.step(&[(id, forward(1))], &[], 0.05);
        assert_eq!(game.tanks[&id].motion, before);
    }

    #[test]
    fn test_fire_spawns_once_and_respects_cooldown() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        game.deploy(id, SpherePoint::new(1.0, FRAC_PI_2)).unwrap();

        assert!(game.queue_fire(id, 0.5));
        game.step(&[], &[], 0.05);
        assert_eq!(game.projectiles.len(), 1);

        game.queue_fire(id, 0.5);
        game.step(&[], &[], 0.05);
        assert_eq!(game.projectiles.len(), 1);
    }

    #[test]
    fn test_kill_emits_event_and_bot_respawns() {
        let mut game = open_world();
        let (shooter, _) = game.add_human();
        game.deploy(shooter, SpherePoint::new(1.0, FRAC_PI_2)).unwrap();
        let bot = game.add_bot().unwrap();
        // park the bot 30 units ahead of the shooter, facing it sideways
        let ahead = offset_point(&SpherePoint::new(1.0, FRAC_PI_2), 0.0, 30.0, 0.0);
        {
            let tank = game.tanks.get_mut(&bot).unwrap();
            tank.faction = Faction::Blue;
            tank.motion = MotionState::at(ahead, FRAC_PI_2);
            tank.hp = 1;
        }
        game.tanks.get_mut(&shooter).unwrap().faction = Faction::Red;
        game.drain_events();

        game.queue_fire(shooter, 1.0);
        for _ in 0..5 {
            game.step(&[], &[], 0.05);
        }

        assert_eq!(game.tanks[&bot].lifecycle, Lifecycle::Dead);
        let events = game.drain_events();
        assert!(events.contains(&GameEvent::EntityKilled {
            victim: bot,
            killer: Some(shooter),
        }));

        let delay = game.projectile_tuning.respawn_delay;
        for _ in 0..((delay / 0.05) as usize + 2) {
            game.step(&[], &[], 0.05);
        }
        assert!(game.tanks[&bot].is_deployed());
        assert_eq!(game.tanks[&bot].hp, TANK_MAX_HP);
    }

    #[test]
    fn test_removed_tank_takes_projectiles_with_it() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        game.deploy(id, SpherePoint::new(1.0, FRAC_PI_2)).unwrap();
        game.queue_fire(id, 0.0);
        game.step(&[], &[], 0.05);
        assert_eq!(game.projectiles.len(), 1);

        game.remove_entity(id);
        assert!(game.projectiles.is_empty());
    }

    #[test]
    fn test_reference_point_prefers_position_then_preview() {
        let mut game = open_world();
        let (id, _) = game.add_human();
        assert_eq!(game.reference_point(id), None);

        let preview = SpherePoint::new(2.0, 1.0);
        game.set_preview(id, preview);
        assert_eq!(game.reference_point(id), Some(preview));

        let spot = game.deploy(id, SpherePoint::new(1.0, FRAC_PI_2)).unwrap();
        assert_eq!(game.reference_point(id), Some(spot));
    }

    #[test]
    fn test_chat_is_truncated() {
        let mut game = open_world();
        let long = "x".repeat(shared::MAX_CHAT_LEN + 50);
        game.chat(EntityId(1), &long);
        game.chat(EntityId(1), "   ");

        let events = game.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            GameEvent::Chat { text, .. } => assert_eq!(text.len(), shared::MAX_CHAT_LEN),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_rotation_phase_advances() {
        let mut game = open_world();
        game.step(&[], &[], 0.05);
        assert_approx_eq!(game.rotation_phase, ROTATION_SPEED * 0.05, 1e-12);
    }
}
