//! Territory capture.
//!
//! Each region holds a capture quantity ("tics") per faction. Their total never
//! exceeds the region's capacity, which is proportional to its tile count.
//! Tanks inside a region add tics for their faction: first from the free pool,
//! then taken from rivals in proportion to what they hold. Ownership is only
//! decided once the region is full. The faction with the strictly largest
//! share wins. A tie keeps the current owner, and an empty region never
//! decays.

use log::{debug, info};
use shared::terrain::GridTerrain;
use shared::{EntityId, Faction, RegionId, FACTION_COUNT};
use std::collections::{BTreeMap, HashMap};

const FULL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTuning {
    /// Tics added per second by one tank.
    pub rate_per_tank: f64,
    pub capacity_per_tile: f64,
    /// Consecutive ticks a tank must report a new region before it counts there.
    pub membership_confirm_ticks: u32,
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            rate_per_tank: 1.0,
            capacity_per_tile: 1.0,
            membership_confirm_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OwnershipChange {
    pub region: RegionId,
    pub previous: Option<Faction>,
    pub owner: Faction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerritoryRegion {
    pub id: RegionId,
    pub tile_count: u32,
    pub capacity: f64,
    pub tics: [f64; FACTION_COUNT],
    pub owner: Option<Faction>,
}

impl TerritoryRegion {
    pub fn new(id: RegionId, tile_count: u32, capacity_per_tile: f64) -> Self {
        Self {
            id,
            tile_count,
            capacity: f64::from(tile_count) * capacity_per_tile,
            tics: [0.0; FACTION_COUNT],
            owner: None,
        }
    }

    pub fn total(&self) -> f64 {
        self.tics.iter().sum()
    }

    pub fn is_full(&self) -> bool {
        self.total() >= self.capacity - FULL_EPSILON
    }

    /// Adds `gain` tics for `faction`, drawing on the free pool before rivals.
    pub fn apply_gain(&mut self, faction: Faction, gain: f64) {
        if gain <= 0.0 {
            return;
        }
        let index = faction.index();

        let free = (self.capacity - self.total()).max(0.0);
        let from_pool = gain.min(free);
        self.tics[index] += from_pool;

        let remaining = gain - from_pool;
        if remaining <= 0.0 {
            return;
        }

        let rival_total: f64 = (0..FACTION_COUNT)
            .filter(|i| *i != index)
            .map(|i| self.tics[i])
            .sum();
        if rival_total <= 0.0 {
            return;
        }

        let taken = remaining.min(rival_total);
        for rival in (0..FACTION_COUNT).filter(|i| *i != index) {
            let share = self.tics[rival] / rival_total;
            self.tics[rival] = (self.tics[rival] - taken * share).max(0.0);
        }
        self.tics[index] += taken;
    }

    /// Scales tics back down if rounding pushed the total over capacity.
    pub fn rescale(&mut self) {
        let total = self.total();
        if total > self.capacity && total > 0.0 {
            let factor = self.capacity / total;
            for tics in self.tics.iter_mut() {
                *tics *= factor;
            }
        }
    }

    /// Settles ownership for a full region.
    pub fn evaluate_owner(&mut self) -> Option<OwnershipChange> {
        if !self.is_full() {
            return None;
        }

        let mut leader: Option<(usize, f64)> = None;
        let mut tied = false;
        for (index, tics) in self.tics.iter().enumerate() {
            match leader {
                Some((_, best)) if *tics > best => {
                    leader = Some((index, *tics));
                    tied = false;
                }
                Some((_, best)) if *tics == best => tied = true,
                Some(_) => {}
                None => leader = Some((index, *tics)),
            }
        }

        let (index, _) = leader?;
        if tied {
            return None;
        }
        let winner = Faction::ALL[index];
        if self.owner == Some(winner) {
            return None;
        }

        let previous = self.owner.replace(winner);
        Some(OwnershipChange {
            region: self.id,
            previous,
            owner: winner,
        })
    }
}

/// Hysteresis state for one tank's region membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Membership {
    faction: Faction,
    counted: Option<RegionId>,
    candidate: Option<RegionId>,
    streak: u32,
}

/// Counted region of every living tank, after hysteresis.
#[derive(Debug, Clone, Default)]
pub struct MembershipTable(HashMap<EntityId, Membership>);

impl MembershipTable {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureEngine {
    regions: BTreeMap<RegionId, TerritoryRegion>,
    membership: MembershipTable,
    tuning: CaptureTuning,
}

impl CaptureEngine {
    pub fn new(tile_counts: &BTreeMap<RegionId, u32>, tuning: CaptureTuning) -> Self {
        let regions = tile_counts
            .iter()
            .map(|(id, count)| (*id, TerritoryRegion::new(*id, *count, tuning.capacity_per_tile)))
            .collect();
        Self {
            regions,
            membership: MembershipTable::default(),
            tuning,
        }
    }

    pub fn from_terrain(terrain: &GridTerrain, tuning: CaptureTuning) -> Self {
        Self::new(&terrain.region_tile_counts(), tuning)
    }

    pub fn region(&self, id: RegionId) -> Option<&TerritoryRegion> {
        self.regions.get(&id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut TerritoryRegion> {
        self.regions.get_mut(&id)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The region a tank currently counts toward, after hysteresis.
    pub fn counted_region(&self, entity: EntityId) -> Option<RegionId> {
        self.membership.0.get(&entity).and_then(|m| m.counted)
    }

    /// Drops a tank that left the world so it stops counting right away.
    pub fn forget(&mut self, entity: EntityId) -> bool {
        self.membership.0.remove(&entity).is_some()
    }

    /// Feeds this tick's geometric region of every living tank.
    pub fn update_membership<I>(&mut self, occupants: I)
    where
        I: IntoIterator<Item = (EntityId, Faction, Option<RegionId>)>,
    {
        self.membership = self.next_membership(occupants);
    }

    /// Membership after this tick's sightings, leaving the engine untouched.
    ///
    /// A tank seen for the first time counts immediately. After that, a change
    /// of region only takes effect once it has been reported for
    /// `membership_confirm_ticks` consecutive ticks, so a tank straddling a
    /// border does not flicker between regions. Tanks missing from
    /// `occupants` (dead or gone) are forgotten.
    pub fn next_membership<I>(&self, occupants: I) -> MembershipTable
    where
        I: IntoIterator<Item = (EntityId, Faction, Option<RegionId>)>,
    {
        let confirm = self.tuning.membership_confirm_ticks.max(1);
        let mut next = HashMap::with_capacity(self.membership.len());

        for (entity, faction, region) in occupants {
            let entry = match self.membership.0.get(&entity) {
                None => Membership {
                    faction,
                    counted: region,
                    candidate: region,
                    streak: confirm,
                },
                Some(previous) => {
                    let mut m = *previous;
                    m.faction = faction;
                    if region == m.counted {
                        m.candidate = region;
                        m.streak = confirm;
                    } else if region == m.candidate {
                        m.streak += 1;
                        if m.streak >= confirm {
                            m.counted = region;
                        }
                    } else {
                        m.candidate = region;
                        m.streak = 1;
                        if confirm <= 1 {
                            m.counted = region;
                        }
                    }
                    m
                }
            };
            next.insert(entity, entry);
        }

        MembershipTable(next)
    }

    /// Advances capture progress by `dt` seconds.
    pub fn update(&mut self, dt: f64) -> Vec<OwnershipChange> {
        let staged = self.stage(&self.membership, dt);
        self.commit(staged)
    }

    /// Occupied regions as they will be after `dt` seconds under
    /// `membership`. Unoccupied regions never change, so they are left out.
    pub fn stage(&self, membership: &MembershipTable, dt: f64) -> Vec<TerritoryRegion> {
        let mut occupancy: BTreeMap<RegionId, [u32; FACTION_COUNT]> = BTreeMap::new();
        for m in membership.0.values() {
            if let Some(region) = m.counted {
                occupancy.entry(region).or_default()[m.faction.index()] += 1;
            }
        }

        let mut staged = Vec::with_capacity(occupancy.len());
        for (region_id, counts) in occupancy {
            let Some(current) = self.regions.get(&region_id) else {
                continue;
            };
            let mut region = current.clone();
            for faction in Faction::ALL {
                let present = counts[faction.index()];
                if present > 0 {
                    region.apply_gain(faction, f64::from(present) * self.tuning.rate_per_tank * dt);
                }
            }
            region.rescale();
            staged.push(region);
        }
        staged
    }

    /// Writes staged regions back and settles their ownership.
    pub fn commit(&mut self, staged: Vec<TerritoryRegion>) -> Vec<OwnershipChange> {
        let mut changes = Vec::new();
        for mut region in staged {
            if let Some(change) = region.evaluate_owner() {
                info!(
                    "Region {} captured by {:?} (was {:?})",
                    change.region, change.owner, change.previous
                );
                changes.push(change);
            }
            self.regions.insert(region.id, region);
        }
        changes
    }

    /// Installs a membership table built by [`CaptureEngine::next_membership`].
    pub fn set_membership(&mut self, membership: MembershipTable) {
        self.membership = membership;
    }

    /// Clears all progress and ownership of one region.
    pub fn reset_region(&mut self, id: RegionId) -> bool {
        match self.regions.get_mut(&id) {
            Some(region) => {
                region.tics = [0.0; FACTION_COUNT];
                region.owner = None;
                debug!("Region {} reset", id);
                true
            }
            None => false,
        }
    }

    /// Every owned region, in id order.
    pub fn owners(&self) -> Vec<(RegionId, Faction)> {
        self.regions
            .values()
            .filter_map(|region| region.owner.map(|owner| (region.id, owner)))
            .collect()
    }

    /// Number of regions each faction owns.
    pub fn owned_counts(&self) -> [usize; FACTION_COUNT] {
        let mut counts = [0; FACTION_COUNT];
        for region in self.regions.values() {
            if let Some(owner) = region.owner {
                counts[owner.index()] += 1;
            }
        }
        counts
    }
}
