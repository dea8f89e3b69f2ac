//! Automated tank control on a background task.
//!
//! The tick loop never waits for decisions. Every tick it hands the worker a
//! fresh view of the world and picks up whatever the worker finished since
//! the previous tick, so commands are at most one tick stale. A worker that
//! dies is respawned and the last good commands keep being applied meanwhile.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::motion::to_local_frame;
use shared::sphere::wrap_signed;
use shared::{DirectionalKeys, EntityId, Faction, MotionState};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;

/// Enemies closer than this (world units) are engaged.
pub const ENGAGE_RANGE: f64 = 160.0;
/// Turret must be within this many radians of the target to fire.
const FIRE_CONE: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BotView {
    pub id: EntityId,
    pub faction: Faction,
    pub motion: MotionState,
    pub turret_angle: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BotRequest {
    pub tick: u32,
    /// Deployed automated tanks that need orders.
    pub bots: Vec<BotView>,
    /// Every deployed tank, used for target selection.
    pub targets: Vec<BotView>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BotCommand {
    pub entity_id: EntityId,
    pub keys: DirectionalKeys,
    /// Turret angle relative to the hull.
    pub turret_angle: f64,
    /// Charge in `[0, 1]` when the bot wants to shoot.
    pub fire: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct BotResponse {
    pub tick: u32,
    pub commands: Vec<BotCommand>,
}

/// Per-bot wander state kept by the worker between requests.
#[derive(Debug, Clone, Copy)]
struct Brain {
    turn: i8,
    ticks_left: u32,
    reverse: bool,
}

struct Planner {
    rng: StdRng,
    brains: HashMap<EntityId, Brain>,
}

impl Planner {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            brains: HashMap::new(),
        }
    }

    fn plan(&mut self, request: &BotRequest) -> BotResponse {
        self.brains
            .retain(|id, _| request.bots.iter().any(|bot| bot.id == *id));

        let commands = request
            .bots
            .iter()
            .map(|bot| self.command_for(bot, &request.targets))
            .collect();

        BotResponse {
            tick: request.tick,
            commands,
        }
    }

    fn command_for(&mut self, bot: &BotView, targets: &[BotView]) -> BotCommand {
        let rng = &mut self.rng;
        let brain = self.brains.entry(bot.id).or_insert(Brain {
            turn: 0,
            ticks_left: 0,
            reverse: false,
        });

        if brain.ticks_left == 0 {
            brain.turn = rng.gen_range(-1..=1);
            brain.ticks_left = rng.gen_range(20..80);
            brain.reverse = rng.gen_bool(0.1);
        }
        brain.ticks_left -= 1;

        // A wall contact shows up as a stalled tank; back off and turn.
        if bot.motion.speed.abs() < 1.0 && brain.ticks_left % 30 == 0 {
            brain.reverse = !brain.reverse;
        }

        let keys = DirectionalKeys {
            forward: !brain.reverse,
            back: brain.reverse,
            left: brain.turn < 0,
            right: brain.turn > 0,
        };

        let position = bot.motion.position();
        let nearest = targets
            .iter()
            .filter(|target| target.faction != bot.faction && target.id != bot.id)
            .map(|target| (target, position.distance_to(&target.motion.position())))
            .filter(|(_, distance)| *distance <= ENGAGE_RANGE)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let (turret_angle, fire) = match nearest {
            Some((target, distance)) => {
                let (north, east) = to_local_frame(&position, 0.0, &target.motion.position());
                let bearing = east.atan2(north);
                let aim = wrap_signed(bearing - bot.motion.heading);
                let on_target = wrap_signed(aim - bot.turret_angle).abs() < FIRE_CONE;
                let charge = (distance / ENGAGE_RANGE).clamp(0.2, 1.0) as f32;
                (aim, on_target.then_some(charge))
            }
            None => (bot.turret_angle, None),
        };

        BotCommand {
            entity_id: bot.id,
            keys,
            turret_angle,
            fire,
        }
    }
}

async fn run_worker(
    mut requests: mpsc::Receiver<BotRequest>,
    responses: mpsc::Sender<BotResponse>,
    seed: u64,
) {
    let mut planner = Planner::new(seed);
    while let Some(request) = requests.recv().await {
        let response = planner.plan(&request);
        if responses.send(response).await.is_err() {
            break;
        }
    }
    debug!("Bot worker exiting");
}

fn start_worker(
    seed: u64,
) -> (mpsc::Sender<BotRequest>, mpsc::Receiver<BotResponse>, JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (response_tx, response_rx) = mpsc::channel(1);
    let handle = tokio::spawn(run_worker(request_rx, response_tx, seed));
    (request_tx, response_rx, handle)
}

pub struct BotWorker {
    request_tx: mpsc::Sender<BotRequest>,
    response_rx: mpsc::Receiver<BotResponse>,
    handle: JoinHandle<()>,
    last_output: BotResponse,
    seed: u64,
    restarts: u32,
}

impl BotWorker {
    /// Starts the worker task. Must be called inside a tokio runtime.
    pub fn spawn(seed: u64) -> Self {
        let (request_tx, response_rx, handle) = start_worker(seed);

        Self {
            request_tx,
            response_rx,
            handle,
            last_output: BotResponse::default(),
            seed,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_output(&self) -> &BotResponse {
        &self.last_output
    }

    /// Sends this tick's request and returns the newest finished decision.
    pub fn exchange(&mut self, request: BotRequest) -> &BotResponse {
        let mut disconnected = false;
        loop {
            match self.response_rx.try_recv() {
                Ok(response) => self.last_output = response,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if disconnected || self.handle.is_finished() {
            self.respawn();
        }

        match self.request_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Bot worker still busy, skipping request");
            }
            Err(TrySendError::Closed(request)) => {
                self.respawn();
                let _ = self.request_tx.try_send(request);
            }
        }

        &self.last_output
    }

    fn respawn(&mut self) {
        self.restarts += 1;
        warn!("Bot worker died, restarting (restart #{})", self.restarts);
        self.handle.abort();
        let (request_tx, response_rx, handle) =
            start_worker(self.seed.wrapping_add(u64::from(self.restarts)));
        self.request_tx = request_tx;
        self.response_rx = response_rx;
        self.handle = handle;
    }

    #[cfg(test)]
    fn kill(&self) {
        self.handle.abort();
    }
}

impl Drop for BotWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::SpherePoint;
    use std::f64::consts::FRAC_PI_2;
    use tokio::time::{sleep, Duration};

    fn view(id: u32, faction: Faction, theta: f64) -> BotView {
        BotView {
            id: EntityId(id),
            faction,
            motion: MotionState::at(SpherePoint::new(theta, FRAC_PI_2), 0.0),
            turret_angle: 0.0,
        }
    }

    fn request(tick: u32) -> BotRequest {
        let bot = view(1, Faction::Red, 1.0);
        BotRequest {
            tick,
            bots: vec![bot],
            targets: vec![bot],
        }
    }

    #[tokio::test]
    async fn test_exchange_returns_previous_tick_output() {
        let mut worker = BotWorker::spawn(1);

        let first = worker.exchange(request(1));
        assert!(first.commands.is_empty());

        sleep(Duration::from_millis(20)).await;
        let second = worker.exchange(request(2));
        assert_eq!(second.tick, 1);
        assert_eq!(second.commands.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_worker_is_respawned_and_last_output_kept() {
        let mut worker = BotWorker::spawn(1);
        worker.exchange(request(1));
        sleep(Duration::from_millis(20)).await;
        worker.exchange(request(2));

        worker.kill();
        sleep(Duration::from_millis(20)).await;

        let output = worker.exchange(request(3));
        assert_eq!(output.commands.len(), 1);
        assert_eq!(worker.restarts(), 1);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.exchange(request(4)).tick, 3);
    }

    #[test]
    fn test_planner_aims_at_nearby_enemy() {
        let mut planner = Planner::new(3);
        let bot = view(1, Faction::Red, 1.0);
        // 0.1 rad of longitude at the equator is 40 units due east
        let enemy = view(2, Faction::Blue, 1.1);
        let friend = view(3, Faction::Red, 0.98);

        let response = planner.plan(&BotRequest {
            tick: 9,
            bots: vec![bot],
            targets: vec![bot, enemy, friend],
        });

        let command = response.commands[0];
        assert!((command.turret_angle - FRAC_PI_2).abs() < 1e-6);
        assert!(command.fire.is_none(), "turret has not swung round yet");

        let mut aimed = bot;
        aimed.turret_angle = command.turret_angle;
        let response = planner.plan(&BotRequest {
            tick: 10,
            bots: vec![aimed],
            targets: vec![aimed, enemy],
        });
        assert!(response.commands[0].fire.is_some());
    }

    #[test]
    fn test_planner_is_deterministic_per_seed() {
        let mut a = Planner::new(11);
        let mut b = Planner::new(11);
        for tick in 0..50 {
            let ra = a.plan(&request(tick));
            let rb = b.plan(&request(tick));
            assert_eq!(ra.commands, rb.commands);
        }
    }
}
