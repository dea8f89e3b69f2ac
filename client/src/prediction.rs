//! Client-side prediction and server reconciliation for the local tank.
//!
//! Every input sample the player produces is integrated locally right away and
//! kept in a sequence-ordered buffer. When a snapshot confirms that the server
//! applied a given sequence, everything up to it is dropped, the local state is
//! reset to the authoritative one, and the remaining samples are replayed with
//! the exact `dt` each was recorded with.

use log::debug;
use shared::motion::{integrate, MotionState, MotionTuning};
use shared::sphere::{clamp_phi, tangent_distance, wrap_signed, wrap_theta};
use shared::terrain::TerrainOracle;
use shared::InputSample;
use std::collections::VecDeque;

/// Divergence in world units above which a correction is shown immediately.
pub const SNAP_THRESHOLD: f64 = 6.0;
/// Share of the remaining visual correction removed each tick.
pub const CORRECTION_BLEND: f64 = 0.4;
/// Unconfirmed samples kept before the oldest are dropped.
pub const MAX_PENDING_INPUTS: usize = 256;

/// Outcome of applying one authoritative state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Samples the server has confirmed and that were removed.
    pub discarded: usize,
    /// Samples replayed on top of the authoritative state.
    pub replayed: usize,
    /// Distance between the old prediction and the replayed one.
    pub divergence: f64,
    pub snapped: bool,
}

/// Visual offset between what is drawn and the latest prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Correction {
    theta: f64,
    phi: f64,
    heading: f64,
}

impl Correction {
    fn between(shown: &MotionState, predicted: &MotionState) -> Self {
        Self {
            theta: wrap_signed(shown.theta - predicted.theta),
            phi: shown.phi - predicted.phi,
            heading: wrap_signed(shown.heading - predicted.heading),
        }
    }

    fn scale(&mut self, factor: f64) {
        self.theta *= factor;
        self.phi *= factor;
        self.heading *= factor;
    }

    fn apply(&self, state: &MotionState) -> MotionState {
        MotionState {
            theta: wrap_theta(state.theta + self.theta),
            phi: clamp_phi(state.phi + self.phi),
            heading: wrap_theta(state.heading + self.heading),
            speed: state.speed,
        }
    }
}

pub struct PredictionReconciler {
    pending: VecDeque<InputSample>,
    predicted: Option<MotionState>,
    correction: Correction,
    last_sequence: u32,
    tuning: MotionTuning,
}

impl PredictionReconciler {
    pub fn new(tuning: MotionTuning) -> Self {
        Self {
            pending: VecDeque::new(),
            predicted: None,
            correction: Correction::default(),
            last_sequence: 0,
            tuning,
        }
    }

    /// Starts predicting from `state`, forgetting every buffered sample.
    ///
    /// Used when the tank (re)deploys and there is no earlier prediction to
    /// reconcile against.
    pub fn reset(&mut self, state: MotionState) {
        self.pending.clear();
        self.predicted = Some(state);
        self.correction = Correction::default();
    }

    /// Stops predicting, e.g. while the tank is dead.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.predicted = None;
        self.correction = Correction::default();
    }

    /// Buffers a freshly produced sample and predicts forward with its `dt`.
    ///
    /// Samples that do not advance the sequence are ignored and `None` is
    /// returned; so is a sample recorded before anything is being predicted.
    pub fn record<T: TerrainOracle + ?Sized>(
        &mut self,
        sample: InputSample,
        terrain: &T,
    ) -> Option<MotionState> {
        if sample.sequence <= self.last_sequence {
            return None;
        }
        self.last_sequence = sample.sequence;

        let state = self.predicted?;
        if self.pending.len() >= MAX_PENDING_INPUTS {
            self.pending.pop_front();
        }
        self.pending.push_back(sample);

        let next = integrate(state, &sample.keys, sample.dt_seconds(), terrain, &self.tuning).state;
        self.predicted = Some(next);
        Some(next)
    }

    /// Applies the authoritative state for the local tank.
    pub fn reconcile<T: TerrainOracle + ?Sized>(
        &mut self,
        authoritative: MotionState,
        last_processed: u32,
        terrain: &T,
    ) -> Reconciliation {
        let before = self.pending.len();
        while self
            .pending
            .front()
            .is_some_and(|sample| sample.sequence <= last_processed)
        {
            self.pending.pop_front();
        }
        let discarded = before - self.pending.len();

        let mut state = authoritative;
        for sample in &self.pending {
            state = integrate(state, &sample.keys, sample.dt_seconds(), terrain, &self.tuning).state;
        }

        let previous = self.predicted.replace(state);
        let Some(previous) = previous else {
            self.correction = Correction::default();
            return Reconciliation {
                discarded,
                replayed: self.pending.len(),
                divergence: 0.0,
                snapped: true,
            };
        };

        let divergence = tangent_distance(&previous.position(), &state.position());
        let shown = self.correction.apply(&previous);
        let snapped = divergence >= SNAP_THRESHOLD
            || tangent_distance(&shown.position(), &state.position()) >= SNAP_THRESHOLD;

        if snapped {
            debug!("Prediction off by {:.2}, snapping", divergence);
            self.correction = Correction::default();
        } else {
            self.correction = Correction::between(&shown, &state);
        }

        Reconciliation {
            discarded,
            replayed: self.pending.len(),
            divergence,
            snapped,
        }
    }

    /// Removes part of the outstanding visual correction. Called once per tick.
    pub fn decay_correction(&mut self) {
        self.correction.scale(1.0 - CORRECTION_BLEND);
    }

    /// Where the local tank should be drawn.
    pub fn display_motion(&self) -> Option<MotionState> {
        self.predicted.map(|state| self.correction.apply(&state))
    }

    pub fn predicted(&self) -> Option<MotionState> {
        self.predicted
    }

    pub fn pending_sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.iter().map(|sample| sample.sequence)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }
}

impl Default for PredictionReconciler {
    fn default() -> Self {
        Self::new(MotionTuning::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::sphere::SpherePoint;
    use shared::terrain::GridTerrain;
    use shared::DirectionalKeys;
    use std::f64::consts::{PI, TAU};

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

    fn start() -> MotionState {
        MotionState::at(SpherePoint::new(1.0, PI / 2.0), PI / 2.0)
    }

    #[test]
    fn test_confirmed_prefix_is_discarded_and_rest_replayed() {
        let terrain = GridTerrain::open(120, 60);
        let tuning = MotionTuning::default();
        let mut reconciler = PredictionReconciler::new(tuning);
        reconciler.reset(start());

        for sequence in 10..=15 {
            reconciler.record(forward(sequence), &terrain);
        }
        let predicted = reconciler.predicted().unwrap();

        // The server applied 10..=12 from the same start.
        let mut server = start();
        for sequence in 10..=12 {
            let sample = forward(sequence);
            server = integrate(server, &sample.keys, sample.dt_seconds(), &terrain, &tuning).state;
        }

        let result = reconciler.reconcile(server, 12, &terrain);
        assert_eq!(result.discarded, 3);
        assert_eq!(result.replayed, 3);
        assert!(!result.snapped);
        assert_eq!(reconciler.pending_sequences().collect::<Vec<_>>(), vec![13, 14, 15]);

        let replayed = reconciler.predicted().unwrap();
        assert_approx_eq!(replayed.theta, predicted.theta, 1e-12);
        assert_approx_eq!(replayed.phi, predicted.phi, 1e-12);
        assert_approx_eq!(replayed.speed, predicted.speed, 1e-12);
    }

    #[test]
    fn test_large_divergence_snaps() {
        let terrain = GridTerrain::open(120, 60);
        let mut reconciler = PredictionReconciler::default();
        reconciler.reset(start());
        reconciler.record(forward(1), &terrain);

        let far = MotionState::at(SpherePoint::new(2.0, 1.0), 0.0);
        let result = reconciler.reconcile(far, 1, &terrain);

        assert!(result.snapped);
        assert!(result.divergence > SNAP_THRESHOLD);
        assert_eq!(reconciler.display_motion(), Some(far));
    }

    #[test]
    fn test_small_divergence_blends_over_ticks() {
        let terrain = GridTerrain::open(120, 60);
        let mut reconciler = PredictionReconciler::default();
        reconciler.reset(start());

        let nudged = MotionState {
            theta: start().theta + 2.0 / shared::SPHERE_RADIUS,
            ..start()
        };
        let result = reconciler.reconcile(nudged, 0, &terrain);
        assert!(!result.snapped);
        assert_approx_eq!(result.divergence, 2.0, 1e-6);

        // Still drawn where it was.
        let shown = reconciler.display_motion().unwrap();
        assert_approx_eq!(shown.theta, start().theta, 1e-12);

        reconciler.decay_correction();
        let shown = reconciler.display_motion().unwrap();
        let moved = (shown.theta - start().theta) / (nudged.theta - start().theta);
        assert_approx_eq!(moved, CORRECTION_BLEND, 1e-9);

        for _ in 0..40 {
            reconciler.decay_correction();
        }
        let shown = reconciler.display_motion().unwrap();
        assert_approx_eq!(shown.theta, nudged.theta, 1e-9);
    }

    #[test]
    fn test_divergence_wraps_across_seam() {
        let terrain = GridTerrain::open(120, 60);
        let mut reconciler = PredictionReconciler::default();
        reconciler.reset(MotionState::at(SpherePoint::new(TAU - 0.001, PI / 2.0), 0.0));

        let across = MotionState::at(SpherePoint::new(0.001, PI / 2.0), 0.0);
        let result = reconciler.reconcile(across, 0, &terrain);

        assert!(!result.snapped);
        assert_approx_eq!(result.divergence, 0.002 * shared::SPHERE_RADIUS, 1e-6);
    }

    #[test]
    fn test_stale_samples_are_ignored() {
        let terrain = GridTerrain::open(120, 60);
        let mut reconciler = PredictionReconciler::default();
        reconciler.reset(start());

        assert!(reconciler.record(forward(5), &terrain).is_some());
        assert!(reconciler.record(forward(5), &terrain).is_none());
        assert!(reconciler.record(forward(3), &terrain).is_none());
        assert_eq!(reconciler.pending_len(), 1);
        assert_eq!(reconciler.last_sequence(), 5);
    }

    #[test]
    fn test_nothing_predicted_before_reset() {
        let terrain = GridTerrain::open(120, 60);
        let mut reconciler = PredictionReconciler::default();

        assert!(reconciler.record(forward(1), &terrain).is_none());
        assert_eq!(reconciler.pending_len(), 0);
        assert!(reconciler.display_motion().is_none());

        let result = reconciler.reconcile(start(), 1, &terrain);
        assert!(result.snapped);
        assert_eq!(reconciler.display_motion(), Some(start()));
    }
}
