use crate::game::ClientGameState;
use crate::input::{FrameActions, InputManager};
use crate::rendering::{RenderConfig, Renderer, Scene};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use macroquad::prelude::{get_frame_time, next_frame};
use shared::sphere::SpherePoint;
use shared::{Lifecycle, Packet, PROTOCOL_VERSION};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;

/// Largest datagram the socket will read.
pub const MAX_DATAGRAM: usize = 65507;
/// How often an unacknowledged fire request is sent again.
pub const FIRE_RESEND_INTERVAL: Duration = Duration::from_millis(200);
/// How often `Connect` is repeated until a `Welcome` arrives.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum gap between deployment previews sent to the server.
const PREVIEW_INTERVAL: Duration = Duration::from_millis(100);

/// Requests from the render loop to the socket thread.
#[derive(Debug)]
pub enum NetCommand {
    Send(Packet),
    Shutdown,
}

/// Messages from the socket thread to the render loop.
#[derive(Debug)]
pub enum NetEvent {
    Packet(Packet),
    Error(String),
}

/// A UDP socket served by a tokio runtime on its own thread.
///
/// macroquad owns the main thread, so the socket lives on a background
/// thread and talks to the render loop through unbounded channels.
pub struct NetworkHandle {
    commands: UnboundedSender<NetCommand>,
    events: UnboundedReceiver<NetEvent>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkHandle {
    pub fn spawn(server_addr: &str, fake_ping_ms: u64) -> Result<Self, Box<dyn std::error::Error>> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = std::thread::Builder::new()
            .name("network".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    if let Err(e) =
                        socket_loop(server_addr, fake_ping_ms, command_rx, event_tx.clone()).await
                    {
                        error!("Network thread stopped: {}", e);
                        let _ = event_tx.send(NetEvent::Error(e.to_string()));
                    }
                });
            })?;

        Ok(Self {
            commands,
            events,
            thread: Some(thread),
        })
    }

    pub fn send(&self, packet: Packet) {
        if self.commands.send(NetCommand::Send(packet)).is_err() {
            warn!("Network thread is gone, dropping packet");
        }
    }

    /// Everything that arrived since the last call.
    pub fn poll(&mut self) -> Vec<NetEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.thread.as_ref().is_some_and(|thread| thread.is_finished()) {
                        events.push(NetEvent::Error("network thread exited".to_string()));
                        self.thread = None;
                    }
                    break;
                }
            }
        }
        events
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(NetCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn socket_loop(
    server_addr: SocketAddr,
    fake_ping_ms: u64,
    mut commands: UnboundedReceiver<NetCommand>,
    events: UnboundedSender<NetEvent>,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    info!("Client socket bound to {}", socket.local_addr()?);

    let delay = Duration::from_millis(fake_ping_ms / 2);
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            command = commands.recv() => {
                let packet = match command {
                    Some(NetCommand::Send(packet)) => packet,
                    Some(NetCommand::Shutdown) | None => break,
                };
                let data = serialize(&packet)?;
                if delay.is_zero() {
                    socket.send_to(&data, server_addr).await?;
                } else {
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        if let Err(e) = socket.send_to(&data, server_addr).await {
                            error!("Error sending packet: {}", e);
                        }
                    });
                }
            }

            result = socket.recv_from(&mut buffer) => {
                let (len, addr) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        continue;
                    }
                };
                if addr != server_addr {
                    debug!("Ignoring datagram from {}", addr);
                    continue;
                }
                let packet = match deserialize::<Packet>(&buffer[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Undecodable datagram: {}", e);
                        continue;
                    }
                };

                if delay.is_zero() {
                    if events.send(NetEvent::Packet(packet)).is_err() {
                        break;
                    }
                } else {
                    let events = events.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        let _ = events.send(NetEvent::Packet(packet));
                    });
                }
            }
        }
    }

    Ok(())
}

/// Fire requests waiting for a `FireAck`.
#[derive(Debug, Default)]
pub struct FireOutbox {
    next_sequence: u32,
    pending: BTreeMap<u32, (f32, Instant)>,
}

impl FireOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new shot and returns the packet to send now.
    pub fn fire(&mut self, charge_power: f32, now: Instant) -> Packet {
        self.next_sequence += 1;
        self.pending
            .insert(self.next_sequence, (charge_power, now));
        Packet::Fire {
            fire_sequence: self.next_sequence,
            charge_power,
        }
    }

    /// Returns true when the sequence was still waiting.
    pub fn ack(&mut self, fire_sequence: u32) -> bool {
        self.pending.remove(&fire_sequence).is_some()
    }

    /// Packets whose last send is at least `interval` old.
    pub fn due(&mut self, now: Instant, interval: Duration) -> Vec<Packet> {
        let mut packets = Vec::new();
        for (sequence, (charge_power, sent_at)) in self.pending.iter_mut() {
            if now.duration_since(*sent_at) >= interval {
                *sent_at = now;
                packets.push(Packet::Fire {
                    fire_sequence: *sequence,
                    charge_power: *charge_power,
                });
            }
        }
        packets
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct Client {
    network: NetworkHandle,
    connected: bool,
    rejected: Option<String>,

    game_state: ClientGameState,
    input_manager: InputManager,
    renderer: Renderer,
    fires: FireOutbox,

    ping_ms: u64,
    fake_ping_ms: u64,
    last_connect_sent: Option<Instant>,
    last_preview: Option<(SpherePoint, Instant)>,
    pending_acks: Vec<u64>,

    prediction_enabled: bool,
    interpolation_enabled: bool,
}

impl Client {
    pub fn new(
        server_addr: &str,
        fake_ping_ms: u64,
        width: usize,
        height: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let network = NetworkHandle::spawn(server_addr, fake_ping_ms)?;
        let renderer = Renderer::new(width, height)?;

        Ok(Client {
            network,
            connected: false,
            rejected: None,
            game_state: ClientGameState::new(),
            input_manager: InputManager::default(),
            renderer,
            fires: FireOutbox::new(),
            ping_ms: 0,
            fake_ping_ms,
            last_connect_sent: None,
            last_preview: None,
            pending_acks: Vec::new(),
            prediction_enabled: true,
            interpolation_enabled: true,
        })
    }

    /// Sends `Connect`, resuming the previous session when there is one.
    fn connect(&mut self) {
        info!("Connecting to server...");
        self.network.send(Packet::Connect {
            client_version: PROTOCOL_VERSION,
            resume_token: self.game_state.session_token,
        });
        self.last_connect_sent = Some(Instant::now());
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Welcome {
                client_id,
                entity_id,
                faction,
                session_token,
                world_seed,
                tick_rate,
                resumed,
            } => {
                if let Some(sent) = self.last_connect_sent.take() {
                    self.ping_ms = now.duration_since(sent).as_millis() as u64;
                }
                if self.connected && self.game_state.client_id == Some(client_id) {
                    return;
                }
                info!(
                    "Connected! Client ID: {}, tank {} ({:?}){}",
                    client_id,
                    entity_id,
                    faction,
                    if resumed { ", resumed" } else { "" }
                );
                if !resumed || self.game_state.session_token != Some(session_token) {
                    self.input_manager.restart(tick_rate);
                    self.fires = FireOutbox::new();
                }
                self.game_state.apply_welcome(
                    client_id,
                    entity_id,
                    faction,
                    session_token,
                    world_seed,
                    tick_rate,
                    resumed,
                );
                self.connected = true;
                self.rejected = None;
            }

            Packet::Snapshot(snapshot) => {
                if !self.connected {
                    return;
                }
                if let Some(result) = self.game_state.apply_snapshot(snapshot) {
                    if result.snapped {
                        debug!("Snapped local tank, divergence {:.2}", result.divergence);
                    }
                }
            }

            Packet::Reliable { event_id, event } => {
                self.pending_acks.push(event_id);
                if !self.game_state.apply_event(event_id, event) {
                    debug!("Duplicate event {}", event_id);
                }
            }

            Packet::FireAck { fire_sequence } => {
                self.fires.ack(fire_sequence);
            }

            Packet::Rejected { reason } => {
                warn!("Rejected by server: {}", reason);
                self.connected = false;
                self.rejected = Some(reason);
            }

            other => {
                warn!("Unexpected packet type: {:?}", other);
            }
        }
    }

    fn handle_actions(&mut self, actions: FrameActions, now: Instant) {
        if actions.toggles.prediction {
            self.prediction_enabled = !self.prediction_enabled;
            info!("Client-side prediction: {}", self.prediction_enabled);
        }
        if actions.toggles.interpolation {
            self.interpolation_enabled = !self.interpolation_enabled;
            info!("Interpolation: {}", self.interpolation_enabled);
        }
        if actions.toggles.reconnect {
            info!("Reconnecting");
            self.connected = false;
            self.connect();
        }

        if !self.connected {
            return;
        }

        if let Some(text) = actions.chat.clone() {
            self.network.send(Packet::Chat { text });
        }

        if self.game_state.is_deployed() {
            if let Some(sample) = actions.sample {
                if self.prediction_enabled {
                    self.game_state.predict(sample);
                }
                self.network.send(Packet::Input(sample));
            }
            if let Some(charge_power) = actions.fire {
                let packet = self.fires.fire(charge_power, now);
                self.network.send(packet);
            }
        } else if self.awaiting_deployment() {
            self.handle_deployment(&actions, now);
        }
    }

    fn awaiting_deployment(&self) -> bool {
        self.game_state
            .local_state()
            .is_some_and(|state| state.lifecycle == Lifecycle::AwaitingDeployment)
    }

    fn handle_deployment(&mut self, actions: &FrameActions, now: Instant) {
        if let Some(point) = actions.click.and_then(|(x, y)| self.renderer.pick(x, y)) {
            info!("Deploying at ({:.3}, {:.3})", point.theta, point.phi);
            self.network.send(Packet::Deploy {
                theta: point.theta,
                phi: point.phi,
            });
            return;
        }

        let (x, y) = actions.mouse;
        let Some(point) = self.renderer.pick(x, y) else {
            return;
        };
        let due = self.last_preview.map_or(true, |(last, sent)| {
            last != point && now.duration_since(sent) >= PREVIEW_INTERVAL
        });
        if due {
            self.network.send(Packet::PreviewDeploy {
                theta: point.theta,
                phi: point.phi,
            });
            self.last_preview = Some((point, now));
        }
    }

    fn resend(&mut self, now: Instant) {
        if !self.pending_acks.is_empty() {
            let event_ids = std::mem::take(&mut self.pending_acks);
            self.network.send(Packet::Ack { event_ids });
        }

        if !self.connected && self.rejected.is_none() {
            let retry = self
                .last_connect_sent
                .map_or(true, |sent| now.duration_since(sent) >= CONNECT_RETRY_INTERVAL);
            if retry {
                self.connect();
            }
            return;
        }

        for packet in self.fires.due(now, FIRE_RESEND_INTERVAL) {
            self.network.send(packet);
        }
    }

    fn render(&mut self) {
        let entities = self.game_state.render_entities(self.interpolation_enabled);
        let config = RenderConfig {
            client_id: self.game_state.client_id,
            entity_id: self.game_state.entity_id,
            faction: self.game_state.faction,
            prediction_enabled: self.prediction_enabled,
            interpolation_enabled: self.interpolation_enabled,
            ping_ms: self.ping_ms,
            fake_ping_ms: self.fake_ping_ms,
            tick: self.game_state.tick,
            pending_inputs: self.game_state.pending_inputs(),
            divergence: self
                .game_state
                .last_reconciliation
                .map(|result| result.divergence),
            charge: self.input_manager.charge(),
            chat_draft: self.input_manager.chat_draft().map(str::to_string),
            awaiting_deployment: self.awaiting_deployment(),
            preview: self.last_preview.map(|(point, _)| point),
        };
        let scene = Scene {
            entities: &entities,
            projectiles: &self.game_state.projectiles,
            territory: &self.game_state.territory,
            terrain: self.game_state.terrain(),
            kill_feed: &self.game_state.kill_feed,
            chat_log: &self.game_state.chat_log,
        };
        self.renderer.render(&scene, &config);
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect();

        loop {
            let now = Instant::now();
            for event in self.network.poll() {
                match event {
                    NetEvent::Packet(packet) => self.handle_packet(packet, now),
                    NetEvent::Error(e) => return Err(e.into()),
                }
            }

            let dt = f64::from(get_frame_time());
            self.input_manager
                .set_driving(self.connected && self.game_state.is_deployed());
            let actions = self.input_manager.update(dt);
            if actions.quit {
                break;
            }
            self.handle_actions(actions, now);
            self.resend(now);

            self.game_state.advance(dt);
            self.render();

            next_frame().await;
        }

        if self.connected {
            self.network.send(Packet::Disconnect);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_outbox_resends_until_acked() {
        let mut outbox = FireOutbox::new();
        let start = Instant::now();

        match outbox.fire(0.5, start) {
            Packet::Fire {
                fire_sequence,
                charge_power,
            } => {
                assert_eq!(fire_sequence, 1);
                assert_eq!(charge_power, 0.5);
            }
            other => panic!("unexpected packet {:?}", other),
        }

        assert!(outbox.due(start, FIRE_RESEND_INTERVAL).is_empty());
        let later = start + FIRE_RESEND_INTERVAL;
        assert_eq!(outbox.due(later, FIRE_RESEND_INTERVAL).len(), 1);
        // Resent just now, so not due again yet.
        assert!(outbox.due(later, FIRE_RESEND_INTERVAL).is_empty());

        assert!(outbox.ack(1));
        assert!(!outbox.ack(1));
        assert!(outbox.is_empty());
        assert!(outbox.due(later + FIRE_RESEND_INTERVAL, FIRE_RESEND_INTERVAL).is_empty());
    }

    #[test]
    fn test_fire_sequences_increase() {
        let mut outbox = FireOutbox::new();
        let now = Instant::now();
        outbox.fire(0.1, now);
        match outbox.fire(0.2, now) {
            Packet::Fire { fire_sequence, .. } => assert_eq!(fire_sequence, 2),
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_network_handle_delivers_datagrams() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = server.local_addr().unwrap();

        let mut handle = NetworkHandle::spawn(&addr.to_string(), 0).unwrap();
        handle.send(Packet::Connect {
            client_version: PROTOCOL_VERSION,
            resume_token: None,
        });

        let mut buffer = [0u8; 1024];
        let (len, client_addr) = server.recv_from(&mut buffer).unwrap();
        match deserialize::<Packet>(&buffer[..len]).unwrap() {
            Packet::Connect { client_version, .. } => assert_eq!(client_version, PROTOCOL_VERSION),
            other => panic!("unexpected packet {:?}", other),
        }

        let reply = serialize(&Packet::FireAck { fire_sequence: 7 }).unwrap();
        server.send_to(&reply, client_addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let events = handle.poll();
            if let Some(NetEvent::Packet(Packet::FireAck { fire_sequence })) = events.first() {
                assert_eq!(*fire_sequence, 7);
                break;
            }
            assert!(Instant::now() < deadline, "no reply delivered");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
