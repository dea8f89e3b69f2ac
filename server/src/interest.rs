//! Per-observer snapshot filtering.
//!
//! An observer sees every human-controlled tank, and automated tanks or
//! projectiles inside a cone around its reference point. The cone is wider
//! for tanks it already sees than for new ones, so a tank hovering at the
//! boundary does not pop in and out of snapshots.

use shared::sphere::{dot, SpherePoint};
use shared::{EntityId, EntityKind, EntityState, Lifecycle, ProjectileState};
use std::collections::{HashMap, HashSet};

/// Everything visible this tick, flattened once and shared by all observers.
#[derive(Debug, Default)]
pub struct WorldView {
    pub entities: Vec<EntityState>,
    entity_units: Vec<[f64; 3]>,
    pub projectiles: Vec<ProjectileState>,
    projectile_units: Vec<[f64; 3]>,
}

impl WorldView {
    pub fn clear(&mut self) {
        self.entities.clear();
        self.entity_units.clear();
        self.projectiles.clear();
        self.projectile_units.clear();
    }

    pub fn push_entity(&mut self, state: EntityState) {
        self.entity_units.push(state.motion.position().unit_vector());
        self.entities.push(state);
    }

    pub fn push_projectile(&mut self, state: ProjectileState) {
        self.projectile_units.push(state.position.unit_vector());
        self.projectiles.push(state);
    }
}

/// Scratch buffers and hysteresis set for one observer.
#[derive(Debug, Default)]
pub struct ObserverInterest {
    included: HashSet<EntityId>,
    next_included: HashSet<EntityId>,
    pub entities: Vec<EntityState>,
    pub projectiles: Vec<ProjectileState>,
}

impl ObserverInterest {
    pub fn includes(&self, entity: EntityId) -> bool {
        self.included.contains(&entity)
    }
}

#[derive(Debug)]
pub struct InterestManager {
    cos_enter: f64,
    cos_leave: f64,
    observers: HashMap<u32, ObserverInterest>,
}

impl InterestManager {
    /// Half-angles in degrees. `leave_deg` is raised to `enter_deg` if smaller.
    pub fn new(enter_deg: f64, leave_deg: f64) -> Self {
        let leave_deg = leave_deg.max(enter_deg);
        Self {
            cos_enter: enter_deg.to_radians().cos(),
            cos_leave: leave_deg.to_radians().cos(),
            observers: HashMap::new(),
        }
    }

    pub fn observer(&self, observer_id: u32) -> Option<&ObserverInterest> {
        self.observers.get(&observer_id)
    }

    pub fn forget(&mut self, observer_id: u32) {
        self.observers.remove(&observer_id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Refills the observer's scratch lists from `view`.
    ///
    /// With no reference point (an undeployed observer with no preview) only
    /// human tanks are included.
    pub fn rebuild(
        &mut self,
        observer_id: u32,
        reference: Option<SpherePoint>,
        view: &WorldView,
    ) -> &mut ObserverInterest {
        let (cos_enter, cos_leave) = (self.cos_enter, self.cos_leave);
        let interest = self.observers.entry(observer_id).or_default();
        let reference = reference.map(|point| point.unit_vector());

        interest.entities.clear();
        interest.projectiles.clear();
        interest.next_included.clear();

        for (state, unit) in view.entities.iter().zip(&view.entity_units) {
            let visible = match state.kind {
                EntityKind::Human => true,
                EntityKind::Automated if state.lifecycle != Lifecycle::Deployed => false,
                EntityKind::Automated => match &reference {
                    Some(reference) => {
                        let threshold = if interest.included.contains(&state.id) {
                            cos_leave
                        } else {
                            cos_enter
                        };
                        dot(reference, unit) >= threshold
                    }
                    None => false,
                },
            };

            if visible {
                interest.next_included.insert(state.id);
                interest.entities.push(*state);
            }
        }

        if let Some(reference) = &reference {
            for (state, unit) in view.projectiles.iter().zip(&view.projectile_units) {
                if dot(reference, unit) >= cos_leave {
                    interest.projectiles.push(*state);
                }
            }
        }

        std::mem::swap(&mut interest.included, &mut interest.next_included);
        interest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Faction, MotionState};
    use std::f64::consts::FRAC_PI_2;

    fn entity(id: u32, kind: EntityKind, theta_deg: f64) -> EntityState {
        EntityState {
            id: EntityId(id),
            kind,
            faction: Faction::Red,
            motion: MotionState::at(SpherePoint::new(theta_deg.to_radians(), FRAC_PI_2), 0.0),
            turret_angle: 0.0,
            hp: 100,
            max_hp: 100,
            lifecycle: Lifecycle::Deployed,
            commander: false,
        }
    }

    fn view_with(bot_deg: f64) -> WorldView {
        let mut view = WorldView::default();
        view.push_entity(entity(1, EntityKind::Human, 170.0));
        view.push_entity(entity(2, EntityKind::Automated, bot_deg));
        view
    }

    fn reference() -> Option<SpherePoint> {
        Some(SpherePoint::new(0.0, FRAC_PI_2))
    }

    #[test]
    fn test_humans_always_visible() {
        let mut manager = InterestManager::new(35.0, 45.0);
        let interest = manager.rebuild(7, None, &view_with(10.0));
        assert_eq!(interest.entities.len(), 1);
        assert_eq!(interest.entities[0].id, EntityId(1));
    }

    #[test]
    fn test_hysteresis_between_enter_and_leave() {
        let mut manager = InterestManager::new(35.0, 45.0);

        // 40 degrees away: outside the enter cone
        assert!(!manager.rebuild(7, reference(), &view_with(40.0)).includes(EntityId(2)));
        // moves to 30 degrees: enters
        assert!(manager.rebuild(7, reference(), &view_with(30.0)).includes(EntityId(2)));
        // back to 40 degrees: still inside the leave cone
        assert!(manager.rebuild(7, reference(), &view_with(40.0)).includes(EntityId(2)));
        // 50 degrees: dropped
        assert!(!manager.rebuild(7, reference(), &view_with(50.0)).includes(EntityId(2)));
        // 40 degrees again: has to re-enter through the narrow cone
        assert!(!manager.rebuild(7, reference(), &view_with(40.0)).includes(EntityId(2)));
    }

    #[test]
    fn test_dead_bots_are_hidden() {
        let mut manager = InterestManager::new(35.0, 45.0);
        let mut view = WorldView::default();
        let mut bot = entity(3, EntityKind::Automated, 1.0);
        bot.lifecycle = Lifecycle::Dead;
        view.push_entity(bot);

        assert!(manager.rebuild(1, reference(), &view).entities.is_empty());
    }

    #[test]
    fn test_projectiles_use_leave_cone() {
        let mut manager = InterestManager::new(35.0, 45.0);
        let mut view = WorldView::default();
        for (id, deg) in [(1, 40.0_f64), (2, 60.0)] {
            view.push_projectile(ProjectileState {
                id,
                owner: EntityId(5),
                faction: Faction::Blue,
                position: SpherePoint::new(deg.to_radians(), FRAC_PI_2),
                heading: 0.0,
            });
        }

        let interest = manager.rebuild(1, reference(), &view);
        assert_eq!(interest.projectiles.len(), 1);
        assert_eq!(interest.projectiles[0].id, 1);
    }

    #[test]
    fn test_forget_observer() {
        let mut manager = InterestManager::new(35.0, 45.0);
        manager.rebuild(1, reference(), &view_with(10.0));
        assert_eq!(manager.observer_count(), 1);
        manager.forget(1);
        assert!(manager.observer(1).is_none());
    }
}
