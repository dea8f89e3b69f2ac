use crate::prediction::{PredictionReconciler, Reconciliation};
use log::{debug, info};
use shared::motion::MotionState;
use shared::sphere::{clamp_phi, wrap_signed, wrap_theta};
use shared::terrain::GridTerrain;
use shared::{
    EntityId, EntityKind, EntityState, Faction, GameEvent, InputSample, Lifecycle,
    ProjectileState, RegionId, Snapshot,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Lines kept in the kill feed and the chat log.
pub const FEED_LEN: usize = 6;

/// Remembers which reliable event ids were already applied.
///
/// Ids are dense and start at 1, so everything up to `floor` is known to be
/// seen and only the out-of-order ids above it are kept in the set.
#[derive(Debug, Default)]
pub struct EventDeduper {
    floor: u64,
    above: BTreeSet<u64>,
}

impl EventDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `event_id` is seen.
    pub fn accept(&mut self, event_id: u64) -> bool {
        if event_id <= self.floor || !self.above.insert(event_id) {
            return false;
        }
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        true
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn gaps(&self) -> usize {
        self.above.len()
    }
}

/// A tank seen in snapshots, drawn between its last two known states.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub state: EntityState,
    previous: MotionState,
}

impl RemoteEntity {
    fn interpolated(&self, alpha: f64) -> EntityState {
        let from = self.previous;
        let to = self.state.motion;
        let mut state = self.state;
        state.motion = MotionState {
            theta: wrap_theta(from.theta + wrap_signed(to.theta - from.theta) * alpha),
            phi: clamp_phi(from.phi + (to.phi - from.phi) * alpha),
            heading: wrap_theta(from.heading + wrap_signed(to.heading - from.heading) * alpha),
            speed: to.speed,
        };
        state
    }
}

/// Everything the client knows about the session and the world.
pub struct ClientGameState {
    pub client_id: Option<u32>,
    pub entity_id: Option<EntityId>,
    pub faction: Option<Faction>,
    pub session_token: Option<u64>,
    pub tick_rate: u32,
    pub tick: u32,
    pub last_processed_input: u32,
    pub rotation_phase: f64,
    pub entities: BTreeMap<EntityId, RemoteEntity>,
    pub projectiles: Vec<ProjectileState>,
    pub territory: BTreeMap<RegionId, Faction>,
    pub roster: BTreeMap<EntityId, (EntityKind, Faction)>,
    pub kill_feed: VecDeque<String>,
    pub chat_log: VecDeque<String>,
    pub last_reconciliation: Option<Reconciliation>,
    terrain: Option<GridTerrain>,
    world_seed: Option<u64>,
    prediction: PredictionReconciler,
    deduper: EventDeduper,
    since_snapshot: f64,
    since_decay: f64,
}

impl ClientGameState {
    pub fn new() -> Self {
        Self {
            client_id: None,
            entity_id: None,
            faction: None,
            session_token: None,
            tick_rate: 20,
            tick: 0,
            last_processed_input: 0,
            rotation_phase: 0.0,
            entities: BTreeMap::new(),
            projectiles: Vec::new(),
            territory: BTreeMap::new(),
            roster: BTreeMap::new(),
            kill_feed: VecDeque::new(),
            chat_log: VecDeque::new(),
            last_reconciliation: None,
            terrain: None,
            world_seed: None,
            prediction: PredictionReconciler::default(),
            deduper: EventDeduper::new(),
            since_snapshot: 0.0,
            since_decay: 0.0,
        }
    }

    /// Applies a `Welcome`. A session that was not resumed starts from scratch.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_welcome(
        &mut self,
        client_id: u32,
        entity_id: EntityId,
        faction: Faction,
        session_token: u64,
        world_seed: u64,
        tick_rate: u32,
        resumed: bool,
    ) {
        if !resumed || self.session_token != Some(session_token) {
            self.deduper = EventDeduper::new();
            self.prediction = PredictionReconciler::default();
            self.entities.clear();
            self.projectiles.clear();
            self.territory.clear();
            self.roster.clear();
            self.tick = 0;
            self.last_processed_input = 0;
        }
        if self.world_seed != Some(world_seed) {
            info!("Generating terrain for seed {}", world_seed);
            self.terrain = Some(GridTerrain::generate(world_seed));
            self.world_seed = Some(world_seed);
        }

        self.client_id = Some(client_id);
        self.entity_id = Some(entity_id);
        self.faction = Some(faction);
        self.session_token = Some(session_token);
        self.tick_rate = tick_rate.max(1);
        self.roster.insert(entity_id, (EntityKind::Human, faction));
    }

    pub fn terrain(&self) -> Option<&GridTerrain> {
        self.terrain.as_ref()
    }

    fn tick_interval(&self) -> f64 {
        1.0 / f64::from(self.tick_rate)
    }

    /// Applies one snapshot. Snapshots older than the newest one seen are
    /// dropped, since UDP may reorder them.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Option<Reconciliation> {
        if self.tick != 0 && snapshot.tick <= self.tick {
            debug!("Dropping stale snapshot {} (have {})", snapshot.tick, self.tick);
            return None;
        }
        self.tick = snapshot.tick;
        self.last_processed_input = snapshot.last_processed_input;
        self.rotation_phase = snapshot.rotation_phase;
        self.since_snapshot = 0.0;

        let mut local = None;
        let mut seen = BTreeSet::new();
        for state in snapshot.entities {
            seen.insert(state.id);
            if Some(state.id) == self.entity_id {
                local = Some(state);
            }
            match self.entities.get_mut(&state.id) {
                Some(entity) => {
                    entity.previous = if entity.state.lifecycle == state.lifecycle {
                        entity.state.motion
                    } else {
                        state.motion
                    };
                    entity.state = state;
                }
                None => {
                    self.entities.insert(
                        state.id,
                        RemoteEntity {
                            state,
                            previous: state.motion,
                        },
                    );
                }
            }
        }
        self.entities.retain(|id, _| seen.contains(id));
        self.projectiles = snapshot.projectiles;

        let local = local?;
        if local.lifecycle != Lifecycle::Deployed {
            self.prediction.clear();
            return None;
        }
        let terrain = self.terrain.as_ref()?;
        if self.prediction.predicted().is_none() {
            self.prediction.reset(local.motion);
            return None;
        }
        let result = self
            .prediction
            .reconcile(local.motion, snapshot.last_processed_input, terrain);
        self.last_reconciliation = Some(result);
        Some(result)
    }

    /// Applies a reliable event unless it was already applied.
    pub fn apply_event(&mut self, event_id: u64, event: GameEvent) -> bool {
        if !self.deduper.accept(event_id) {
            return false;
        }

        match event {
            GameEvent::EntityJoined {
                entity_id,
                kind,
                faction,
            } => {
                self.roster.insert(entity_id, (kind, faction));
                if kind == EntityKind::Human && Some(entity_id) != self.entity_id {
                    push_line(&mut self.chat_log, format!("{} joined {:?}", entity_id, faction));
                }
            }
            GameEvent::EntityLeft { entity_id } => {
                if let Some((EntityKind::Human, _)) = self.roster.remove(&entity_id) {
                    push_line(&mut self.chat_log, format!("{} left", entity_id));
                }
                self.entities.remove(&entity_id);
            }
            GameEvent::EntityKilled { victim, killer } => {
                let line = match killer {
                    Some(killer) => format!("{} destroyed {}", killer, victim),
                    None => format!("{} was destroyed", victim),
                };
                push_line(&mut self.kill_feed, line);
            }
            GameEvent::OwnershipChanged { region, owner, .. } => {
                self.territory.insert(region, owner);
            }
            GameEvent::Chat { from, text } => {
                push_line(&mut self.chat_log, format!("{}: {}", from, text));
            }
            GameEvent::TerritorySync { owners } => {
                self.territory = owners.into_iter().collect();
            }
        }
        true
    }

    /// Predicts the local tank forward with a sample that is about to be sent.
    pub fn predict(&mut self, sample: InputSample) {
        if let Some(terrain) = self.terrain.as_ref() {
            self.prediction.record(sample, terrain);
        }
    }

    /// Advances the render clocks by one frame.
    pub fn advance(&mut self, dt: f64) {
        self.since_snapshot += dt;
        self.since_decay += dt;
        let interval = self.tick_interval();
        while self.since_decay >= interval {
            self.since_decay -= interval;
            self.prediction.decay_correction();
        }
    }

    pub fn local_state(&self) -> Option<&EntityState> {
        self.entity_id
            .and_then(|id| self.entities.get(&id))
            .map(|entity| &entity.state)
    }

    pub fn is_deployed(&self) -> bool {
        self.local_state()
            .is_some_and(|state| state.lifecycle == Lifecycle::Deployed)
    }

    pub fn pending_inputs(&self) -> usize {
        self.prediction.pending_len()
    }

    /// Tanks to draw: the local one where prediction puts it, the rest
    /// interpolated between their last two snapshots.
    pub fn render_entities(&self, interpolation_enabled: bool) -> Vec<EntityState> {
        let alpha = if interpolation_enabled {
            (self.since_snapshot / self.tick_interval()).clamp(0.0, 1.0)
        } else {
            1.0
        };

        self.entities
            .values()
            .map(|entity| {
                if Some(entity.state.id) == self.entity_id {
                    if let Some(motion) = self.prediction.display_motion() {
                        let mut state = entity.state;
                        state.motion = motion;
                        return state;
                    }
                }
                entity.interpolated(alpha)
            })
            .collect()
    }
}

impl Default for ClientGameState {
    fn default() -> Self {
        Self::new()
    }
}

fn push_line(lines: &mut VecDeque<String>, line: String) {
    if lines.len() >= FEED_LEN {
        lines.pop_front();
    }
    lines.push_back(line);
}
