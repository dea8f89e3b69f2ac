//! Client session management and input buffering for the authority
//!
//! This module tracks every human player's session:
//! - Connection lifecycle (connect, detach, resume, expiry)
//! - Validated, bounded input buffers drained a few samples per tick
//! - Per-client reliable event outboxes
//!
//! A client that goes silent or disconnects is only *detached*: its tank stays
//! in the world for the reconnect grace period and the session can be resumed
//! with the token handed out in the welcome message.

use crate::config::{MAX_BUFFERED_INPUTS, MAX_INPUTS_PER_TICK};
use crate::reliable::ReliableOutbox;
use log::{debug, info};
use shared::{EntityId, GameEvent, InputError, InputSample};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session state of one human player
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Current network address, `None` while detached
    pub addr: Option<SocketAddr>,
    /// Tank controlled by this client
    pub entity_id: Option<EntityId>,
    /// Secret used to resume the session after a disconnect
    pub session_token: u64,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// When the client was detached, if it is
    pub detached_at: Option<Instant>,
    /// Highest input sequence accepted into the buffer
    pub last_received_input: u32,
    /// Highest input sequence applied to the simulation
    pub last_processed_input: u32,
    /// Validated inputs waiting to be applied, oldest first
    pub pending_inputs: VecDeque<InputSample>,
    /// Highest fire request sequence seen, for duplicate suppression
    pub last_fire_sequence: u32,
    /// Reliable events not yet acknowledged
    pub outbox: ReliableOutbox,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, session_token: u64) -> Self {
        Self {
            id,
            addr: Some(addr),
            entity_id: None,
            session_token,
            last_seen: Instant::now(),
            detached_at: None,
            last_received_input: 0,
            last_processed_input: 0,
            pending_inputs: VecDeque::new(),
            last_fire_sequence: 0,
            outbox: ReliableOutbox::new(),
        }
    }

    /// Validates and buffers one input sample
    ///
    /// Samples must arrive with strictly increasing sequence numbers; late or
    /// duplicated packets are rejected rather than reordered, since the
    /// client has already moved past them.
    pub fn add_input(&mut self, input: InputSample) -> Result<(), InputError> {
        input.validate(self.last_received_input)?;
        if self.pending_inputs.len() >= MAX_BUFFERED_INPUTS {
            return Err(InputError::BufferFull);
        }
        self.last_seen = Instant::now();
        self.last_received_input = input.sequence;
        self.pending_inputs.push_back(input);
        Ok(())
    }

    /// Removes up to `max` of the oldest buffered inputs and marks them processed
    pub fn take_inputs(&mut self, max: usize) -> Vec<InputSample> {
        let count = self.pending_inputs.len().min(max);
        let taken: Vec<InputSample> = self.pending_inputs.drain(..count).collect();
        if let Some(last) = taken.last() {
            self.last_processed_input = self.last_processed_input.max(last.sequence);
        }
        taken
    }

    /// Accepts a fire request sequence once; retransmissions return false
    pub fn accept_fire(&mut self, fire_sequence: u32) -> bool {
        if fire_sequence <= self.last_fire_sequence {
            return false;
        }
        self.last_fire_sequence = fire_sequence;
        true
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn is_attached(&self) -> bool {
        self.addr.is_some()
    }
}

/// One attached client as seen by the snapshot broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observer {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub entity_id: Option<EntityId>,
    pub last_processed_input: u32,
}

/// Manages all client sessions
///
/// Enforces the capacity limit, maps datagram source addresses to sessions and
/// owns the reconnect grace bookkeeping. The server's main loop is the only
/// owner, so no locking is involved.
pub struct ClientManager {
    /// Sessions indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Source address of every attached session
    by_addr: HashMap<SocketAddr, u32>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent sessions, detached ones included
    max_clients: usize,
    timeout: Duration,
    grace: Duration,
}

impl ClientManager {
    /// Creates a manager with a 5 second timeout and 10 second grace period
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeouts(max_clients, Duration::from_secs(5), Duration::from_secs(10))
    }

    pub fn with_timeouts(max_clients: usize, timeout: Duration, grace: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            by_addr: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
            grace,
        }
    }

    /// Attempts to add a new session
    ///
    /// Returns Some(client_id) if successful, None if the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr, session_token: u64) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id, Client::new(client_id, addr, session_token));
        self.by_addr.insert(addr, client_id);

        Some(client_id)
    }

    pub fn attach_entity(&mut self, client_id: u32, entity_id: EntityId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.entity_id = Some(entity_id);
        }
    }

    /// Reattaches the session holding `session_token` to `addr`
    ///
    /// Works both for detached sessions and for attached ones whose address
    /// changed (for example after a NAT rebinding).
    pub fn resume(&mut self, session_token: u64, addr: SocketAddr) -> Option<u32> {
        let client = self
            .clients
            .values_mut()
            .find(|client| client.session_token == session_token)?;

        if let Some(old) = client.addr.replace(addr) {
            self.by_addr.remove(&old);
        }
        client.detached_at = None;
        client.last_seen = Instant::now();
        let client_id = client.id;
        self.by_addr.insert(addr, client_id);

        info!("Client {} resumed session from {}", client_id, addr);
        Some(client_id)
    }

    /// Detaches a session, starting its grace period
    ///
    /// Returns false if the client is unknown or already detached.
    pub fn detach(&mut self, client_id: u32, now: Instant) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) if client.is_attached() => {
                if let Some(addr) = client.addr.take() {
                    self.by_addr.remove(&addr);
                }
                client.detached_at = Some(now);
                client.pending_inputs.clear();
                info!("Client {} detached, grace period started", client_id);
                true
            }
            _ => false,
        }
    }

    /// Removes a session outright, returning it for teardown
    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        if let Some(addr) = client.addr {
            self.by_addr.remove(&addr);
        }
        info!("Client {} removed", client.id);
        Some(client)
    }

    /// Finds the attached session sending from `addr`
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.by_addr.get(&addr).copied()
    }

    pub fn client(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn client_mut(&mut self, client_id: u32) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Records activity from a client without any payload
    pub fn touch(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_seen = Instant::now();
        }
    }

    /// Validates and buffers an input for a specific client
    pub fn add_input(&mut self, client_id: u32, input: InputSample) -> Result<(), InputError> {
        match self.clients.get_mut(&client_id) {
            Some(client) => client.add_input(input),
            None => Err(InputError::UnknownSender),
        }
    }

    /// Takes this tick's inputs from every attached client
    ///
    /// At most [`MAX_INPUTS_PER_TICK`] samples per client are taken, so a burst
    /// of queued inputs is spread over several ticks. The result is ordered by
    /// client ID, then sequence, which keeps processing deterministic.
    pub fn drain_inputs(&mut self) -> Vec<(u32, EntityId, InputSample)> {
        let mut ids: Vec<u32> = self.clients.keys().copied().collect();
        ids.sort_unstable();

        let mut drained = Vec::new();
        for client_id in ids {
            if let Some(client) = self.clients.get_mut(&client_id) {
                let Some(entity_id) = client.entity_id else {
                    continue;
                };
                for input in client.take_inputs(MAX_INPUTS_PER_TICK) {
                    drained.push((client_id, entity_id, input));
                }
            }
        }
        drained
    }

    /// Detaches attached clients that have been silent past the timeout
    ///
    /// Returns the IDs detached by this call.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.timeout;
        let mut timed_out: Vec<u32> = self
            .clients
            .values()
            .filter(|client| client.is_attached() && client.is_timed_out(timeout, now))
            .map(|client| client.id)
            .collect();
        timed_out.sort_unstable();

        for client_id in &timed_out {
            debug!("Client {} timed out", client_id);
            self.detach(*client_id, now);
        }
        timed_out
    }

    /// Removes sessions whose grace period ran out, returning them for teardown
    pub fn expire_detached(&mut self, now: Instant) -> Vec<Client> {
        let grace = self.grace;
        let mut expired: Vec<u32> = self
            .clients
            .values()
            .filter(|client| {
                client
                    .detached_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= grace)
            })
            .map(|client| client.id)
            .collect();
        expired.sort_unstable();

        expired
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    /// Fills `out` with every attached client, ordered by ID
    pub fn observers(&self, out: &mut Vec<Observer>) {
        out.clear();
        out.extend(self.clients.values().filter_map(|client| {
            client.addr.map(|addr| Observer {
                client_id: client.id,
                addr,
                entity_id: client.entity_id,
                last_processed_input: client.last_processed_input,
            })
        }));
        out.sort_unstable_by_key(|observer| observer.client_id);
    }

    /// Queues a reliable event for every session, detached ones included
    pub fn push_event_all(&mut self, event: &GameEvent) {
        for client in self.clients.values_mut() {
            client.outbox.push(event.clone());
        }
    }

    pub fn push_event(&mut self, client_id: u32, event: GameEvent) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.outbox.push(event);
        }
    }

    pub fn ack_events(&mut self, client_id: u32, event_ids: &[u64]) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.outbox.ack(event_ids);
        }
    }

    /// Reliable events due for (re)transmission to attached clients
    pub fn due_events(
        &mut self,
        now: Instant,
        resend_interval: Duration,
    ) -> Vec<(SocketAddr, u64, GameEvent)> {
        let mut due = Vec::new();
        for client in self.clients.values_mut() {
            let Some(addr) = client.addr else {
                continue;
            };
            for (event_id, event) in client.outbox.due(now, resend_interval) {
                due.push((addr, event_id, event));
            }
        }
        due
    }

    /// Reliable events across all sessions that keep going unacknowledged
    pub fn stalled_events(&self) -> usize {
        self.clients.values().map(|client| client.outbox.stalled()).sum()
    }

    /// Total sessions, detached ones included
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn attached_count(&self) -> usize {
        self.by_addr.len()
    }
}
