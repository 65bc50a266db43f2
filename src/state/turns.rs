//! Initiative order and the turn state machine.
//!
//! # State Diagram
//!
//! ```text
//! ┌──────┐   start    ┌──────────────────────────┐
//! │ Idle │───────────▶│ Active { active set, end │
//! └──────┘            │ marks, round }           │
//!    ▲                └────────────┬─────────────┘
//!    │ stop / nobody left          │ end_turn (last member of the set)
//!    │                             │ advance / retarget
//!    └─────────────────────────────┘ (moves to the next group; wrapping
//!                                     past the end starts a new round)
//! ```
//!
//! The order itself is derived from the roster every time it is needed:
//! initiative descending, then dexterity descending, then id ascending.
//! Combatants with the same initiative on the same side (friendly or
//! hostile) share one turn, and summons or mounts always join the turn of
//! the combatant they are tied to. Ties across sides never merge.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::combatant::{Combatant, CombatantId};

/// Sort key for one combatant in the initiative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub initiative: i32,
    pub dexterity: i32,
    pub id: CombatantId,
}

impl OrderKey {
    pub fn of(c: &Combatant) -> Self {
        Self {
            initiative: c.initiative,
            dexterity: c.dexterity,
            id: c.id,
        }
    }
}

impl Ord for OrderKey {
    /// Earlier in the round compares as smaller.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .initiative
            .cmp(&self.initiative)
            .then_with(|| other.dexterity.cmp(&self.dexterity))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Combatants that act together as one entry in the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnGroup {
    /// Key of the earliest member; identifies the group's slot in the round.
    pub head: OrderKey,
    /// Members in tie-break order.
    pub members: Vec<CombatantId>,
}

/// Follow `shares_turn_with` links up to the combatant that owns the turn.
fn turn_leader(roster: &BTreeMap<CombatantId, Combatant>, id: CombatantId) -> CombatantId {
    let mut current = id;
    // Bounded walk; a cycle in the links falls back to the last id seen.
    for _ in 0..roster.len() {
        match roster.get(&current).and_then(|c| c.shares_turn_with) {
            Some(next) if next != current && roster.contains_key(&next) => current = next,
            _ => break,
        }
    }
    current
}

/// Build the initiative order as a list of turn groups.
pub fn turn_groups(roster: &BTreeMap<CombatantId, Combatant>) -> Vec<TurnGroup> {
    let mut leaders: Vec<&Combatant> = roster
        .values()
        .filter(|c| turn_leader(roster, c.id) == c.id)
        .collect();
    leaders.sort_by_key(|c| OrderKey::of(c));

    let mut groups: Vec<(TurnGroup, i32, bool)> = Vec::new();
    let mut slot_of_leader: BTreeMap<CombatantId, usize> = BTreeMap::new();
    for leader in leaders {
        let friendly = leader.side.is_friendly();
        let existing = groups
            .iter()
            .position(|(_, init, side)| *init == leader.initiative && *side == friendly);
        let slot = match existing {
            Some(slot) => {
                groups[slot].0.members.push(leader.id);
                slot
            }
            None => {
                groups.push((
                    TurnGroup {
                        head: OrderKey::of(leader),
                        members: vec![leader.id],
                    },
                    leader.initiative,
                    friendly,
                ));
                groups.len() - 1
            }
        };
        slot_of_leader.insert(leader.id, slot);
    }

    for c in roster.values() {
        let leader = turn_leader(roster, c.id);
        if leader == c.id {
            continue;
        }
        if let Some(&slot) = slot_of_leader.get(&leader) {
            groups[slot].0.members.push(c.id);
        }
    }

    groups
        .into_iter()
        .map(|(mut group, _, _)| {
            group.members.sort_by_key(|id| OrderKey::of(&roster[id]));
            group
        })
        .collect()
}

/// Turn machine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("combat is not running")]
    NotActive,

    #[error("combat is already running")]
    AlreadyActive,

    #[error("nobody is able to take a turn")]
    NoCombatants,

    #[error("it is not {0}'s turn")]
    NotInActiveSet(CombatantId),

    #[error("{0} has already ended their turn")]
    AlreadyEnded(CombatantId),
}

/// A new active set took over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnChange {
    pub active: Vec<CombatantId>,
    pub round: u32,
    pub new_round: bool,
}

/// Result of one member ending its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndTurn {
    /// Other members of the shared turn still have to finish.
    Waiting { remaining: Vec<CombatantId> },
    /// The whole set finished; the next group is up (or combat went idle).
    Advanced(Option<TurnChange>),
}

/// Turn/initiative state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnTracker {
    running: bool,
    round: u32,
    current: Option<OrderKey>,
    active: Vec<CombatantId>,
    ended: BTreeSet<CombatantId>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Current active set (empty when idle).
    pub fn active(&self) -> &[CombatantId] {
        &self.active
    }

    pub fn is_active(&self, id: CombatantId) -> bool {
        self.active.contains(&id)
    }

    pub fn has_ended(&self, id: CombatantId) -> bool {
        self.ended.contains(&id)
    }

    /// Begin combat at round 1 with the first group in the order.
    pub fn start(
        &mut self,
        roster: &BTreeMap<CombatantId, Combatant>,
    ) -> Result<TurnChange, TurnError> {
        if self.running {
            return Err(TurnError::AlreadyActive);
        }
        self.running = true;
        self.round = 0;
        self.current = None;
        self.advance(roster)?.ok_or(TurnError::NoCombatants)
    }

    /// Leave combat.
    pub fn stop(&mut self) {
        *self = Self::default();
    }

    /// Move to the next group that has someone able to act.
    ///
    /// Returns `None` (and goes idle) if nobody can act.
    pub fn advance(
        &mut self,
        roster: &BTreeMap<CombatantId, Combatant>,
    ) -> Result<Option<TurnChange>, TurnError> {
        if !self.running {
            return Err(TurnError::NotActive);
        }

        let groups: Vec<(OrderKey, Vec<CombatantId>)> = turn_groups(roster)
            .into_iter()
            .map(|g| {
                let eligible = g
                    .members
                    .into_iter()
                    .filter(|id| !roster[id].skips_turn())
                    .collect::<Vec<_>>();
                (g.head, eligible)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();

        // The group that holds any member of the finishing set is the current
        // slot, even if its head has since left. Fall back to the stored key
        // only when the whole set is gone.
        let slot = groups
            .iter()
            .position(|(_, members)| members.iter().any(|id| self.active.contains(id)));
        let next = match (slot, self.current) {
            (Some(i), _) => groups.get(i + 1),
            (None, Some(cur)) => groups.iter().find(|(head, _)| *head > cur),
            (None, None) => None,
        };
        let (next, new_round) = match next {
            Some(g) => (Some(g), false),
            None => (groups.first(), true),
        };

        let Some((head, members)) = next else {
            self.stop();
            return Ok(None);
        };

        if new_round {
            self.round += 1;
        }
        self.current = Some(*head);
        self.active = members.clone();
        self.ended.clear();

        Ok(Some(TurnChange {
            active: self.active.clone(),
            round: self.round,
            new_round,
        }))
    }

    /// Mark one member of the active set as done.
    pub fn end_turn(
        &mut self,
        roster: &BTreeMap<CombatantId, Combatant>,
        id: CombatantId,
    ) -> Result<EndTurn, TurnError> {
        if !self.running {
            return Err(TurnError::NotActive);
        }
        if !self.active.contains(&id) {
            return Err(TurnError::NotInActiveSet(id));
        }
        if !self.ended.insert(id) {
            return Err(TurnError::AlreadyEnded(id));
        }

        let remaining = self.remaining();
        if remaining.is_empty() {
            Ok(EndTurn::Advanced(self.advance(roster)?))
        } else {
            Ok(EndTurn::Waiting { remaining })
        }
    }

    /// Members of the active set that have not ended yet.
    pub fn remaining(&self) -> Vec<CombatantId> {
        self.active
            .iter()
            .copied()
            .filter(|id| !self.ended.contains(id))
            .collect()
    }

    /// Add a combatant to the current active set (a summon arriving mid-turn).
    pub fn join_active(&mut self, id: CombatantId) {
        if self.running && !self.active.contains(&id) {
            self.active.push(id);
        }
    }

    /// Drop ids that no longer exist or can no longer act. If that empties or
    /// finishes the active set, move on so the pointer never dangles.
    pub fn retarget(
        &mut self,
        roster: &BTreeMap<CombatantId, Combatant>,
    ) -> Option<TurnChange> {
        if !self.running {
            return None;
        }
        let valid = |id: &CombatantId| roster.get(id).is_some_and(|c| !c.skips_turn());
        self.active.retain(valid);
        self.ended.retain(valid);

        if self.active.is_empty() || self.remaining().is_empty() {
            return self.advance(roster).ok().flatten();
        }
        None
    }
}
