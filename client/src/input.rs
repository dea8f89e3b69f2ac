//! Client input management with sequencing and change detection

use macroquad::prelude::*;
use shared::sphere::wrap_signed;
use shared::{DirectionalKeys, InputSample, MAX_CHAT_LEN, MAX_INPUT_DT};

/// Radians per second the turret turns while Q or E is held.
pub const TURRET_RATE: f64 = 2.5;
/// Seconds of holding fire to reach full charge.
pub const FULL_CHARGE_SECS: f64 = 1.2;

/// Raw key and mouse state for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameKeys {
    pub movement: DirectionalKeys,
    pub turret_left: bool,
    pub turret_right: bool,
    pub fire: bool,
    pub key_1: bool,
    pub key_2: bool,
    pub key_r: bool,
    pub key_t: bool,
    pub enter: bool,
    pub escape: bool,
    pub backspace: bool,
    pub typed: Vec<char>,
    pub mouse: (f32, f32),
    pub clicked: bool,
}

impl FrameKeys {
    /// Samples macroquad's key state (supports both WASD and arrow keys).
    pub fn sample() -> Self {
        let mut typed = Vec::new();
        while let Some(c) = get_char_pressed() {
            typed.push(c);
        }

        Self {
            movement: DirectionalKeys {
                forward: is_key_down(KeyCode::W) || is_key_down(KeyCode::Up),
                back: is_key_down(KeyCode::S) || is_key_down(KeyCode::Down),
                left: is_key_down(KeyCode::A) || is_key_down(KeyCode::Left),
                right: is_key_down(KeyCode::D) || is_key_down(KeyCode::Right),
            },
            turret_left: is_key_down(KeyCode::Q),
            turret_right: is_key_down(KeyCode::E),
            fire: is_key_down(KeyCode::Space),
            key_1: is_key_down(KeyCode::Key1),
            key_2: is_key_down(KeyCode::Key2),
            key_r: is_key_down(KeyCode::R),
            key_t: is_key_down(KeyCode::T),
            enter: is_key_pressed(KeyCode::Enter),
            escape: is_key_pressed(KeyCode::Escape),
            backspace: is_key_pressed(KeyCode::Backspace),
            typed,
            mouse: mouse_position(),
            clicked: is_mouse_button_pressed(MouseButton::Left),
        }
    }
}

/// Edge-triggered control keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Toggles {
    pub prediction: bool,
    pub interpolation: bool,
    pub reconnect: bool,
}

/// What the player asked for this frame.
#[derive(Debug, Clone, Default)]
pub struct FrameActions {
    pub toggles: Toggles,
    /// Movement sample to predict and send, produced once per send interval.
    pub sample: Option<InputSample>,
    /// Charge of a shot released this frame.
    pub fire: Option<f32>,
    pub chat: Option<String>,
    pub click: Option<(f32, f32)>,
    pub mouse: (f32, f32),
    /// Escape pressed outside the chat box.
    pub quit: bool,
}

/// Manages user input collection and transformation into networked game inputs
pub struct InputManager {
    next_sequence: u32,
    send_interval: f64,
    since_send: f64,
    turret_angle: f64,
    charge: Option<f64>,
    chat: Option<String>,
    driving: bool,

    // Previous frame key states for edge detection
    prev_key_1: bool,
    prev_key_2: bool,
    prev_key_r: bool,
    prev_key_t: bool,
}

impl InputManager {
    /// Samples are produced at most `send_rate` times per second.
    pub fn new(send_rate: u32) -> Self {
        Self {
            next_sequence: 1,
            send_interval: 1.0 / f64::from(send_rate.max(1)),
            since_send: 0.0,
            turret_angle: 0.0,
            charge: None,
            chat: None,
            driving: true,
            prev_key_1: false,
            prev_key_2: false,
            prev_key_r: false,
            prev_key_t: false,
        }
    }

    /// Starts numbering samples from 1 again for a fresh session.
    pub fn restart(&mut self, send_rate: u32) {
        self.next_sequence = 1;
        self.send_interval = 1.0 / f64::from(send_rate.max(1));
        self.since_send = 0.0;
        self.charge = None;
    }

    /// Movement samples are only produced while driving, so the sequence does
    /// not run ahead while the tank is dead or undeployed.
    pub fn set_driving(&mut self, driving: bool) {
        if !driving {
            self.since_send = 0.0;
        }
        self.driving = driving;
    }

    /// Samples macroquad and processes one frame.
    pub fn update(&mut self, dt: f64) -> FrameActions {
        let keys = FrameKeys::sample();
        self.process(&keys, dt)
    }

    pub fn process(&mut self, keys: &FrameKeys, dt: f64) -> FrameActions {
        let mut actions = FrameActions {
            mouse: keys.mouse,
            click: keys.clicked.then_some(keys.mouse),
            ..FrameActions::default()
        };

        // Detect key press events (current && !previous)
        let typing = self.chat.is_some();
        if !typing {
            actions.toggles = Toggles {
                prediction: keys.key_1 && !self.prev_key_1,
                interpolation: keys.key_2 && !self.prev_key_2,
                reconnect: keys.key_r && !self.prev_key_r,
            };
            if keys.key_t && !self.prev_key_t {
                self.chat = Some(String::new());
            }
            actions.quit = keys.escape;
        } else {
            actions.chat = self.edit_chat(keys);
        }

        self.prev_key_1 = keys.key_1;
        self.prev_key_2 = keys.key_2;
        self.prev_key_r = keys.key_r;
        self.prev_key_t = keys.key_t;

        let (movement, turret, fire) = if typing {
            (DirectionalKeys::default(), 0.0, false)
        } else {
            let turn = f64::from(keys.turret_right as u8) - f64::from(keys.turret_left as u8);
            (keys.movement, turn, keys.fire)
        };

        self.turret_angle = wrap_signed(self.turret_angle + turret * TURRET_RATE * dt);
        actions.fire = self.track_charge(fire, dt);

        if !self.driving {
            return actions;
        }
        self.since_send += dt;
        if self.since_send >= self.send_interval {
            let frame = self.since_send.min(f64::from(MAX_INPUT_DT));
            self.since_send = 0.0;
            actions.sample = Some(InputSample {
                sequence: self.next_sequence,
                keys: movement,
                turret_angle: self.turret_angle as f32,
                dt: frame as f32,
            });
            self.next_sequence += 1;
        }

        actions
    }

    fn track_charge(&mut self, held: bool, dt: f64) -> Option<f32> {
        match (held, self.charge) {
            (true, Some(charge)) => {
                self.charge = Some((charge + dt / FULL_CHARGE_SECS).min(1.0));
                None
            }
            (true, None) => {
                self.charge = Some(0.0);
                None
            }
            (false, Some(charge)) => {
                self.charge = None;
                Some(charge as f32)
            }
            (false, None) => None,
        }
    }

    fn edit_chat(&mut self, keys: &FrameKeys) -> Option<String> {
        if keys.escape {
            self.chat = None;
            return None;
        }
        if keys.enter {
            let line = self.chat.take()?;
            let line = line.trim().to_string();
            return (!line.is_empty()).then_some(line);
        }

        let text = self.chat.as_mut()?;
        if keys.backspace {
            text.pop();
        }
        for c in &keys.typed {
            if !c.is_control() && text.chars().count() < MAX_CHAT_LEN {
                text.push(*c);
            }
        }
        None
    }

    /// Charge of the shot being held, if any.
    pub fn charge(&self) -> Option<f32> {
        self.charge.map(|charge| charge as f32)
    }

    pub fn turret_angle(&self) -> f64 {
        self.turret_angle
    }

    /// The chat line being typed, if the chat box is open.
    pub fn chat_draft(&self) -> Option<&str> {
        self.chat.as_deref()
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_input_manager_creation() {
        let input_manager = InputManager::new(20);
        assert_eq!(input_manager.next_sequence, 1);
        assert!(input_manager.charge().is_none());
        assert!(input_manager.chat_draft().is_none());
    }

    #[test]
    fn test_samples_are_rate_limited_and_sequenced() {
        let mut input = InputManager::new(20);
        let keys = FrameKeys::default();

        assert!(input.process(&keys, 0.02).sample.is_none());
        assert!(input.process(&keys, 0.02).sample.is_none());
        let first = input.process(&keys, 0.02).sample.unwrap();
        assert_eq!(first.sequence, 1);
        assert_approx_eq!(first.dt, 0.06, 1e-6);

        let second = input.process(&keys, 0.05).sample.unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn test_no_samples_while_not_driving() {
        let mut input = InputManager::new(20);
        input.set_driving(false);
        assert!(input.process(&FrameKeys::default(), 1.0).sample.is_none());

        input.set_driving(true);
        let sample = input.process(&FrameKeys::default(), 0.05).sample.unwrap();
        assert_eq!(sample.sequence, 1);
    }

    #[test]
    fn test_long_frames_are_clamped() {
        let mut input = InputManager::new(20);
        let sample = input.process(&FrameKeys::default(), 2.0).sample.unwrap();
        assert_eq!(sample.dt, MAX_INPUT_DT);
    }

    #[test]
    fn test_fire_releases_charge() {
        let mut input = InputManager::new(20);
        let held = FrameKeys {
            fire: true,
            ..FrameKeys::default()
        };

        assert!(input.process(&held, 0.1).fire.is_none());
        for _ in 0..3 {
            assert!(input.process(&held, 0.2).fire.is_none());
        }
        let charge = input.process(&FrameKeys::default(), 0.01).fire.unwrap();
        assert_approx_eq!(charge, 0.5, 1e-5);
        assert!(input.charge().is_none());
    }

    #[test]
    fn test_toggles_are_edge_triggered() {
        let mut input = InputManager::new(20);
        let pressed = FrameKeys {
            key_1: true,
            ..FrameKeys::default()
        };

        assert!(input.process(&pressed, 0.01).toggles.prediction);
        assert!(!input.process(&pressed, 0.01).toggles.prediction);
        input.process(&FrameKeys::default(), 0.01);
        assert!(input.process(&pressed, 0.01).toggles.prediction);
    }

    #[test]
    fn test_chat_typing_blocks_movement() {
        let mut input = InputManager::new(20);
        input.process(
            &FrameKeys {
                key_t: true,
                ..FrameKeys::default()
            },
            0.01,
        );
        assert_eq!(input.chat_draft(), Some(""));

        let typing = FrameKeys {
            movement: DirectionalKeys {
                forward: true,
                ..DirectionalKeys::default()
            },
            typed: vec!['h', 'i'],
            ..FrameKeys::default()
        };
        let actions = input.process(&typing, 0.05);
        assert!(!actions.sample.unwrap().keys.forward);
        assert_eq!(input.chat_draft(), Some("hi"));

        let sent = input.process(
            &FrameKeys {
                enter: true,
                ..FrameKeys::default()
            },
            0.01,
        );
        assert_eq!(sent.chat.as_deref(), Some("hi"));
        assert!(input.chat_draft().is_none());
    }

    #[test]
    fn test_turret_turns_and_wraps() {
        let mut input = InputManager::new(20);
        let turning = FrameKeys {
            turret_right: true,
            ..FrameKeys::default()
        };
        input.process(&turning, 0.4);
        assert_approx_eq!(input.turret_angle(), 1.0, 1e-9);
        input.process(&turning, 1.0);
        assert!(input.turret_angle() < 0.0);
    }
}
