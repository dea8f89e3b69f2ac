//! Server network layer: UDP I/O tasks and the fixed-rate tick loop

use crate::bots::BotWorker;
use crate::client_manager::{ClientManager, Observer};
use crate::config::{ServerConfig, SNAPSHOT_QUEUE_LEN};
use crate::game::GameState;
use crate::interest::{InterestManager, WorldView};
use crate::scheduler::TickScheduler;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    validate_charge, validate_point, EntityId, InputSample, Packet, Snapshot, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant};

/// Largest datagram the receiver accepts.
pub const MAX_DATAGRAM: usize = 65_507;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    #[allow(dead_code)]
    Shutdown,
}

/// Encoded datagram waiting for the sender task
#[derive(Debug)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// How an outgoing packet is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dropped when the snapshot queue is full
    BestEffort,
    /// Always queued; retransmission is the caller's business
    Control,
}

/// Counters logged periodically
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStats {
    pub snapshots_sent: u64,
    pub snapshots_dropped: u64,
    pub rejected_inputs: u64,
    pub dropped_ticks: u64,
    pub failed_stages: u64,
}

/// Main server coordinating networking and game simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    clients: ClientManager,
    game_state: GameState,
    interest: InterestManager,
    bots: BotWorker,
    scheduler: TickScheduler,
    rng: StdRng,
    stats: ServerStats,

    // Scratch reused every tick
    view: WorldView,
    observers: Vec<Observer>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    control_tx: mpsc::UnboundedSender<Outgoing>,
    control_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
    snapshot_tx: mpsc::Sender<Outgoing>,
    snapshot_rx: Option<mpsc::Receiver<Outgoing>>,
}

impl Server {
    /// Binds the socket and builds the world. Must run inside a tokio runtime.
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE_LEN);

        let mut game_state = GameState::new(config.world_seed);
        for _ in 0..config.bot_count {
            if game_state.add_bot().is_none() {
                warn!("No open ground left for automated tanks");
                break;
            }
        }
        game_state.drain_events();
        info!(
            "World {} ready with {} automated tanks and {} regions",
            config.world_seed,
            game_state.tanks.len(),
            game_state.territory.region_count()
        );

        Ok(Server {
            socket,
            clients: ClientManager::with_timeouts(
                config.max_clients,
                config.client_timeout,
                config.reconnect_grace,
            ),
            game_state,
            interest: InterestManager::new(config.interest_enter_deg, config.interest_leave_deg),
            bots: BotWorker::spawn(config.world_seed),
            scheduler: TickScheduler::from_rate(config.tick_rate, Instant::now()),
            rng: StdRng::from_entropy(),
            stats: ServerStats::default(),
            view: WorldView::default(),
            observers: Vec::new(),
            server_tx,
            server_rx,
            control_tx,
            control_rx: Some(control_rx),
            snapshot_tx,
            snapshot_rx: Some(snapshot_rx),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn game_state(&self) -> &GameState {
        &self.game_state
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains both outgoing queues, control traffic first
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let (Some(mut control_rx), Some(mut snapshot_rx)) =
            (self.control_rx.take(), self.snapshot_rx.take())
        else {
            warn!("Network sender already running");
            return;
        };

        tokio::spawn(async move {
            loop {
                let outgoing = tokio::select! {
                    biased;
                    Some(outgoing) = control_rx.recv() => outgoing,
                    Some(outgoing) = snapshot_rx.recv() => outgoing,
                    else => break,
                };
                if let Err(e) = socket.send_to(&outgoing.bytes, outgoing.addr).await {
                    debug!("Failed to send packet to {}: {}", outgoing.addr, e);
                }
            }
        });
    }

    /// Encodes and queues one packet
    fn send_packet(&mut self, packet: &Packet, addr: SocketAddr, delivery: Delivery) {
        let bytes = match serialize(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode packet for {}: {}", addr, e);
                return;
            }
        };
        self.queue_bytes(bytes, addr, delivery);
    }

    fn queue_bytes(&mut self, bytes: Vec<u8>, addr: SocketAddr, delivery: Delivery) {
        let outgoing = Outgoing { addr, bytes };
        match delivery {
            Delivery::Control => {
                if let Err(e) = self.control_tx.send(outgoing) {
                    error!("Failed to queue packet for sending: {}", e);
                }
            }
            Delivery::BestEffort => match self.snapshot_tx.try_send(outgoing) {
                Ok(()) => self.stats.snapshots_sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => self.stats.snapshots_dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!("Snapshot queue closed");
                }
            },
        }
    }

    fn reject(&mut self, addr: SocketAddr, reason: &str) {
        self.send_packet(
            &Packet::Rejected {
                reason: reason.to_string(),
            },
            addr,
            Delivery::Control,
        );
    }

    fn welcome(&mut self, client_id: u32, addr: SocketAddr, resumed: bool) {
        let Some(client) = self.clients.client(client_id) else {
            return;
        };
        let Some(entity_id) = client.entity_id else {
            return;
        };
        let session_token = client.session_token;
        let Some(faction) = self.game_state.tanks.get(&entity_id).map(|t| t.faction) else {
            return;
        };

        let packet = Packet::Welcome {
            client_id,
            entity_id,
            faction,
            session_token,
            world_seed: self.game_state.world_seed(),
            tick_rate: self.config.tick_rate,
            resumed,
        };
        self.send_packet(&packet, addr, Delivery::Control);
    }

    fn handle_connect(&mut self, addr: SocketAddr, client_version: u32, resume_token: Option<u64>) {
        if client_version != PROTOCOL_VERSION {
            info!(
                "Rejecting {} with protocol version {} (expected {})",
                addr, client_version, PROTOCOL_VERSION
            );
            self.reject(addr, "Protocol version mismatch");
            return;
        }

        // Connect is retried until a welcome arrives, so repeat it idempotently.
        if let Some(client_id) = self.clients.find_client_by_addr(addr) {
            self.clients.touch(client_id);
            self.welcome(client_id, addr, true);
            return;
        }

        if let Some(token) = resume_token {
            if let Some(client_id) = self.clients.resume(token, addr) {
                let sync = self.game_state.territory_sync();
                self.clients.push_event(client_id, sync);
                self.welcome(client_id, addr, true);
                return;
            }
            debug!("Resume token from {} unknown, starting new session", addr);
        }

        let token: u64 = self.rng.gen();
        let Some(client_id) = self.clients.add_client(addr, token) else {
            self.reject(addr, "Server full");
            return;
        };

        let (entity_id, _) = self.game_state.add_human();
        self.clients.attach_entity(client_id, entity_id);
        let sync = self.game_state.territory_sync();
        self.clients.push_event(client_id, sync);
        self.welcome(client_id, addr, false);
    }

    fn entity_for(&self, addr: SocketAddr) -> Option<(u32, EntityId)> {
        let client_id = self.clients.find_client_by_addr(addr)?;
        let entity_id = self.clients.client(client_id)?.entity_id?;
        Some((client_id, entity_id))
    }

    fn handle_input(&mut self, addr: SocketAddr, input: InputSample) {
        let Some(client_id) = self.clients.find_client_by_addr(addr) else {
            return;
        };
        if let Err(e) = self.clients.add_input(client_id, input) {
            self.stats.rejected_inputs += 1;
            debug!("Dropped input from client {}: {}", client_id, e);
        }
    }

    /// Processes incoming packets and updates game state
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                resume_token,
            } => self.handle_connect(addr, client_version, resume_token),

            Packet::Input(input) => self.handle_input(addr, input),

            Packet::Fire {
                fire_sequence,
                charge_power,
            } => {
                let Some((client_id, entity_id)) = self.entity_for(addr) else {
                    return;
                };
                self.clients.touch(client_id);
                let charge = match validate_charge(charge_power) {
                    Ok(charge) => charge,
                    Err(e) => {
                        debug!("Dropped fire from client {}: {}", client_id, e);
                        return;
                    }
                };
                let fresh = self
                    .clients
                    .client_mut(client_id)
                    .is_some_and(|client| client.accept_fire(fire_sequence));
                if fresh {
                    self.game_state.queue_fire(entity_id, charge);
                }
                // Ack duplicates too: the first ack may have been lost.
                self.send_packet(&Packet::FireAck { fire_sequence }, addr, Delivery::Control);
            }

            Packet::PreviewDeploy { theta, phi } => {
                if let Some((client_id, entity_id)) = self.entity_for(addr) {
                    self.clients.touch(client_id);
                    match validate_point(theta, phi) {
                        Ok(point) => self.game_state.set_preview(entity_id, point),
                        Err(e) => debug!("Dropped preview from client {}: {}", client_id, e),
                    }
                }
            }

            Packet::Deploy { theta, phi } => {
                if let Some((client_id, entity_id)) = self.entity_for(addr) {
                    self.clients.touch(client_id);
                    match validate_point(theta, phi) {
                        Ok(point) => {
                            if let Err(e) = self.game_state.deploy(entity_id, point) {
                                debug!("Deploy from client {} refused: {:?}", client_id, e);
                            }
                        }
                        Err(e) => debug!("Dropped deploy from client {}: {}", client_id, e),
                    }
                }
            }

            Packet::Ack { event_ids } => {
                if let Some(client_id) = self.clients.find_client_by_addr(addr) {
                    self.clients.touch(client_id);
                    self.clients.ack_events(client_id, &event_ids);
                }
            }

            Packet::Chat { text } => {
                if let Some((client_id, entity_id)) = self.entity_for(addr) {
                    self.clients.touch(client_id);
                    self.game_state.chat(entity_id, &text);
                }
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.clients.find_client_by_addr(addr) {
                    self.clients.detach(client_id, StdInstant::now());
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    fn housekeeping(&mut self) {
        self.housekeeping_at(StdInstant::now());
    }

    /// Detaches silent clients and tears down those past their grace period
    fn housekeeping_at(&mut self, now: StdInstant) {
        self.clients.check_timeouts(now);

        for client in self.clients.expire_detached(now) {
            self.interest.forget(client.id);
            if let Some(entity_id) = client.entity_id {
                self.game_state.remove_entity(entity_id);
            }
        }
    }

    /// Runs one simulation tick and publishes its results
    pub fn tick(&mut self) {
        let timing = self.scheduler.on_tick(Instant::now());
        self.stats.dropped_ticks += u64::from(timing.dropped_ticks);
        let dt = self.scheduler.dt();

        self.housekeeping();

        let inputs: Vec<(EntityId, InputSample)> = self
            .clients
            .drain_inputs()
            .into_iter()
            .map(|(_, entity_id, input)| (entity_id, input))
            .collect();
        let request = self.game_state.bot_request();
        let commands = self.bots.exchange(request).commands.clone();

        let report = self.game_state.step(&inputs, &commands, dt);
        self.stats.failed_stages += u64::from(report.failed_stages);

        for event in self.game_state.drain_events() {
            self.clients.push_event_all(&event);
        }

        self.broadcast_snapshots();
        self.send_due_events();

        if self.game_state.tick % self.config.stats_every() == 0 {
            self.log_stats(report.hits.len());
        }
    }

    /// Sends each attached client a snapshot filtered to its interest
    fn broadcast_snapshots(&mut self) {
        let mut observers = std::mem::take(&mut self.observers);
        self.clients.observers(&mut observers);
        if observers.is_empty() {
            self.observers = observers;
            return;
        }

        self.game_state.fill_view(&mut self.view);

        for observer in &observers {
            let reference = observer
                .entity_id
                .and_then(|entity_id| self.game_state.reference_point(entity_id));
            let interest = self
                .interest
                .rebuild(observer.client_id, reference, &self.view);

            let packet = Packet::Snapshot(Snapshot {
                tick: self.game_state.tick,
                last_processed_input: observer.last_processed_input,
                rotation_phase: self.game_state.rotation_phase,
                entities: std::mem::take(&mut interest.entities),
                projectiles: std::mem::take(&mut interest.projectiles),
            });
            let encoded = serialize(&packet);

            // hand the buffers back so their capacity is reused next tick
            if let Packet::Snapshot(snapshot) = packet {
                interest.entities = snapshot.entities;
                interest.projectiles = snapshot.projectiles;
            }

            match encoded {
                Ok(bytes) => self.queue_bytes(bytes, observer.addr, Delivery::BestEffort),
                Err(e) => error!("Failed to encode snapshot for {}: {}", observer.addr, e),
            }
        }

        self.observers = observers;
    }

    fn send_due_events(&mut self) {
        let due = self
            .clients
            .due_events(StdInstant::now(), self.config.resend_interval);
        for (addr, event_id, event) in due {
            self.send_packet(&Packet::Reliable { event_id, event }, addr, Delivery::Control);
        }
    }

    fn log_stats(&self, hits: usize) {
        let [red, green, blue] = self.game_state.territory.owned_counts();
        debug!(
            "Tick {}: {} clients ({} attached), {} tanks, {} projectiles, {} hits, regions R/G/B {}/{}/{}",
            self.game_state.tick,
            self.clients.len(),
            self.clients.attached_count(),
            self.game_state.tanks.len(),
            self.game_state.projectiles.len(),
            hits,
            red,
            green,
            blue
        );
        debug!(
            "Snapshots sent {} dropped {}, rejected inputs {}, dropped ticks {}, failed stages {}, bot restarts {}, stalled events {}",
            self.stats.snapshots_sent,
            self.stats.snapshots_dropped,
            self.stats.rejected_inputs,
            self.stats.dropped_ticks,
            self.stats.failed_stages,
            self.bots.restarts(),
            self.clients.stalled_events()
        );
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.scheduler = TickScheduler::from_rate(self.config.tick_rate, Instant::now());

        let mut resend_timer = interval(self.config.resend_interval);

        info!("Server started at {} Hz", self.config.tick_rate);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = sleep_until(self.scheduler.deadline()) => {
                    self.tick();
                },

                _ = resend_timer.tick() => {
                    self.send_due_events();
                },
            }
        }

        Ok(())
    }
}
