use serde::{Deserialize, Serialize};
use std::fmt;

pub mod motion;
pub mod sphere;
pub mod terrain;

pub use motion::{integrate, MotionState, MotionTuning};
pub use sphere::{SpherePoint, SPHERE_RADIUS};
pub use terrain::{GridTerrain, TerrainOracle};

pub const PROTOCOL_VERSION: u32 = 1;
pub const TANK_HALF_LENGTH: f64 = 6.0;
pub const TANK_HALF_WIDTH: f64 = 4.0;
pub const TANK_MAX_HP: i32 = 100;
/// Longest frame a client may claim for a single input sample.
pub const MAX_INPUT_DT: f32 = 0.25;
/// Largest forward jump in input sequence numbers accepted at once.
pub const MAX_SEQUENCE_JUMP: u32 = 1024;
pub const MAX_CHAT_LEN: usize = 200;
pub const FACTION_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u16);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Faction {
    Red,
    Green,
    Blue,
}

impl Faction {
    pub const ALL: [Faction; FACTION_COUNT] = [Faction::Red, Faction::Green, Faction::Blue];

    pub fn index(self) -> usize {
        match self {
            Faction::Red => 0,
            Faction::Green => 1,
            Faction::Blue => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Human,
    Automated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Deployed,
    Dead,
    AwaitingDeployment,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionalKeys {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
}

/// One frame of client input. `dt` is the exact frame length the client
/// predicted with; the authority integrates the same value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputSample {
    pub sequence: u32,
    pub keys: DirectionalKeys,
    pub turret_angle: f32,
    pub dt: f32,
}

impl InputSample {
    /// Checks a sample received after `last_sequence`.
    pub fn validate(&self, last_sequence: u32) -> Result<(), InputError> {
        if !self.turret_angle.is_finite() || !self.dt.is_finite() {
            return Err(InputError::NonFinite);
        }
        if self.dt <= 0.0 || self.dt > MAX_INPUT_DT {
            return Err(InputError::DtOutOfRange(self.dt));
        }
        if self.sequence <= last_sequence {
            return Err(InputError::StaleSequence {
                sequence: self.sequence,
                last: last_sequence,
            });
        }
        if self.sequence - last_sequence > MAX_SEQUENCE_JUMP {
            return Err(InputError::SequenceJump {
                sequence: self.sequence,
                last: last_sequence,
            });
        }
        Ok(())
    }

    pub fn dt_seconds(&self) -> f64 {
        f64::from(self.dt)
    }
}

/// Reasons a client message is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    NonFinite,
    DtOutOfRange(f32),
    StaleSequence { sequence: u32, last: u32 },
    SequenceJump { sequence: u32, last: u32 },
    OutOfRange(&'static str),
    /// The sender's input buffer is full.
    BufferFull,
    /// The sender is not a known client.
    UnknownSender,
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::NonFinite => write!(f, "non-finite value"),
            InputError::DtOutOfRange(dt) => write!(f, "frame time {dt} out of range"),
            InputError::StaleSequence { sequence, last } => {
                write!(f, "sequence {sequence} not after {last}")
            }
            InputError::SequenceJump { sequence, last } => {
                write!(f, "sequence {sequence} jumps too far past {last}")
            }
            InputError::OutOfRange(field) => write!(f, "{field} out of range"),
            InputError::BufferFull => write!(f, "input buffer full"),
            InputError::UnknownSender => write!(f, "unknown sender"),
        }
    }
}

impl std::error::Error for InputError {}

/// Checks a client-chosen point on the sphere.
pub fn validate_point(theta: f64, phi: f64) -> Result<SpherePoint, InputError> {
    if !theta.is_finite() || !phi.is_finite() {
        return Err(InputError::NonFinite);
    }
    if !(0.0..=std::f64::consts::PI).contains(&phi) {
        return Err(InputError::OutOfRange("phi"));
    }
    Ok(SpherePoint::new(theta, phi))
}

/// Checks a fire request's charge, clamping it into `[0, 1]`.
pub fn validate_charge(charge_power: f32) -> Result<f32, InputError> {
    if !charge_power.is_finite() {
        return Err(InputError::NonFinite);
    }
    Ok(charge_power.clamp(0.0, 1.0))
}

/// Compact per-entity state carried in every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub kind: EntityKind,
    pub faction: Faction,
    pub motion: MotionState,
    pub turret_angle: f32,
    pub hp: i32,
    pub max_hp: i32,
    pub lifecycle: Lifecycle,
    pub commander: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectileState {
    pub id: u32,
    pub owner: EntityId,
    pub faction: Faction,
    pub position: SpherePoint,
    pub heading: f64,
}

/// One tick of authoritative state, filtered for a single observer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u32,
    /// Highest input sequence of the recipient the authority has applied.
    pub last_processed_input: u32,
    pub rotation_phase: f64,
    pub entities: Vec<EntityState>,
    pub projectiles: Vec<ProjectileState>,
}

/// Rare events delivered reliably and applied idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    EntityJoined {
        entity_id: EntityId,
        kind: EntityKind,
        faction: Faction,
    },
    EntityLeft {
        entity_id: EntityId,
    },
    EntityKilled {
        victim: EntityId,
        killer: Option<EntityId>,
    },
    OwnershipChanged {
        region: RegionId,
        previous: Option<Faction>,
        owner: Faction,
    },
    Chat {
        from: EntityId,
        text: String,
    },
    TerritorySync {
        owners: Vec<(RegionId, Faction)>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        resume_token: Option<u64>,
    },
    Input(InputSample),
    Fire {
        fire_sequence: u32,
        charge_power: f32,
    },
    PreviewDeploy {
        theta: f64,
        phi: f64,
    },
    Deploy {
        theta: f64,
        phi: f64,
    },
    Ack {
        event_ids: Vec<u64>,
    },
    Chat {
        text: String,
    },
    Disconnect,

    Welcome {
        client_id: u32,
        entity_id: EntityId,
        faction: Faction,
        session_token: u64,
        world_seed: u64,
        tick_rate: u32,
        resumed: bool,
    },
    Snapshot(Snapshot),
    Reliable {
        event_id: u64,
        event: GameEvent,
    },
    FireAck {
        fire_sequence: u32,
    },
    Rejected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sequence: u32, dt: f32) -> InputSample {
        InputSample {
            sequence,
            keys: DirectionalKeys::default(),
            turret_angle: 0.5,
            dt,
        }
    }

    #[test]
    fn test_input_validation_accepts_next_sequence() {
        assert!(sample(5, 0.05).validate(4).is_ok());
        assert!(sample(5, 0.05).validate(0).is_ok());
    }

    #[test]
    fn test_input_validation_rejects_non_finite() {
        let mut input = sample(1, 0.05);
        input.turret_angle = f32::NAN;
        assert_eq!(input.validate(0), Err(InputError::NonFinite));

        let input = sample(1, f32::INFINITY);
        assert_eq!(input.validate(0), Err(InputError::NonFinite));
    }

    #[test]
    fn test_input_validation_rejects_bad_dt() {
        assert!(matches!(
            sample(1, 0.0).validate(0),
            Err(InputError::DtOutOfRange(_))
        ));
        assert!(matches!(
            sample(1, 1.0).validate(0),
            Err(InputError::DtOutOfRange(_))
        ));
    }

    #[test]
    fn test_input_validation_rejects_stale_and_jumping_sequences() {
        assert!(matches!(
            sample(3, 0.05).validate(3),
            Err(InputError::StaleSequence { .. })
        ));
        assert!(matches!(
            sample(MAX_SEQUENCE_JUMP + 10, 0.05).validate(1),
            Err(InputError::SequenceJump { .. })
        ));
    }

    #[test]
    fn test_validate_charge_clamps() {
        assert_eq!(validate_charge(2.0), Ok(1.0));
        assert_eq!(validate_charge(-1.0), Ok(0.0));
        assert_eq!(validate_charge(f32::NAN), Err(InputError::NonFinite));
    }

    #[test]
    fn test_validate_point() {
        assert!(validate_point(f64::NAN, 1.0).is_err());
        assert!(validate_point(1.0, 4.0).is_err());
        let p = validate_point(-0.5, 1.0).unwrap();
        assert!(p.theta > 0.0);
    }

    #[test]
    fn test_packet_serialization_input() {
        let packet = Packet::Input(InputSample {
            sequence: 123,
            keys: DirectionalKeys {
                forward: true,
                left: true,
                ..DirectionalKeys::default()
            },
            turret_angle: 1.25,
            dt: 0.05,
        });

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Input(input) => {
                assert_eq!(input.sequence, 123);
                assert!(input.keys.forward);
                assert!(input.keys.left);
                assert!(!input.keys.back);
                assert_eq!(input.dt, 0.05);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_snapshot() {
        let entity = EntityState {
            id: EntityId(7),
            kind: EntityKind::Automated,
            faction: Faction::Blue,
            motion: MotionState::at(SpherePoint::new(1.0, 1.0), 0.25),
            turret_angle: 0.0,
            hp: 80,
            max_hp: TANK_MAX_HP,
            lifecycle: Lifecycle::Deployed,
            commander: false,
        };
        let packet = Packet::Snapshot(Snapshot {
            tick: 42,
            last_processed_input: 10,
            rotation_phase: 0.5,
            entities: vec![entity],
            projectiles: vec![],
        });

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Snapshot(snapshot) => {
                assert_eq!(snapshot.tick, 42);
                assert_eq!(snapshot.last_processed_input, 10);
                assert_eq!(snapshot.entities, vec![entity]);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_faction_indices_are_distinct() {
        let indices: Vec<usize> = Faction::ALL.iter().map(|f| f.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
