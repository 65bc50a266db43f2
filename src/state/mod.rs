//! Authoritative combat state.
//!
//! This module provides the core state types:
//!
//! - `grid` - Map geometry, obstacles and terrain
//! - `combatant` - Combatants, resources and condition stacks
//! - `aoe` - Area effects
//! - `turns` - Initiative order and the turn machine
//! - `session` - Live sessions and claims
//! - `account` - Persistent accounts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CombatState                             │
//! │                                                                  │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │  GridGeometry  │  │   combatants   │  │    TurnTracker     │  │
//! │  │  (versioned)   │  │ id → Combatant │  │ round, active set, │  │
//! │  │                │  │                │  │ end marks          │  │
//! │  └────────────────┘  └────────────────┘  └────────────────────┘  │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │      aoes      │  │   battle log   │  │  rng (ChaCha8)     │  │
//! │  │ id → AreaEffect│  │ (drained/tick) │  │                    │  │
//! │  └────────────────┘  └────────────────┘  └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `CombatState` is owned by the simulation thread. Everything else sees it
//! only through snapshots.

pub mod account;
pub mod aoe;
pub mod combatant;
pub mod grid;
pub mod session;
pub mod turns;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use account::{Account, AccountStore, AccountStoreError};
pub use aoe::{AoeId, AreaEffect, ConditionSpec, SaveAutomation, Shape, Trigger};
pub use combatant::{Combatant, CombatantId, CombatantSpec, Conditions, Resources, Side};
pub use grid::{GridGeometry, Position};
pub use session::{ConnId, Registry, RegistryError};
pub use turns::{EndTurn, TurnChange, TurnError, TurnGroup, TurnTracker};

/// One line of the battle log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub round: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CombatantId>,
}

/// Starting grid and roster loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Encounter {
    #[serde(default)]
    pub grid: Option<GridGeometry>,
    #[serde(default)]
    pub combatants: Vec<CombatantSpec>,
}

impl Encounter {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read encounter {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse encounter {}", path.display()))
    }
}

/// What a hit did to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DamageOutcome {
    /// Hit points actually lost (after temporary HP).
    pub lost: i32,
    /// Dropped to 0 and stays in combat unconscious.
    pub downed: bool,
    /// Dropped to 0 and was taken off the board.
    pub removed: bool,
}

/// The single-owner combat state.
#[derive(Debug)]
pub struct CombatState {
    grid: GridGeometry,
    grid_version: u64,
    combatants: BTreeMap<CombatantId, Combatant>,
    aoes: BTreeMap<AoeId, AreaEffect>,
    turns: TurnTracker,
    next_combatant_id: CombatantId,
    next_aoe_id: AoeId,
    log: Vec<LogEntry>,
    /// Ids removed since the last `take_removed`.
    removed: Vec<CombatantId>,
    rng: ChaCha8Rng,
}

impl CombatState {
    pub fn new(grid: GridGeometry, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            grid,
            grid_version: 1,
            combatants: BTreeMap::new(),
            aoes: BTreeMap::new(),
            turns: TurnTracker::new(),
            next_combatant_id: 1,
            next_aoe_id: 1,
            log: Vec::new(),
            removed: Vec::new(),
            rng,
        }
    }

    /// Build the state from an encounter file's contents. Combatants placed
    /// on unusable cells are skipped with a warning.
    pub fn from_encounter(encounter: Encounter, seed: Option<u64>) -> Self {
        let grid = encounter
            .grid
            .unwrap_or_else(|| GridGeometry::new(grid::DEFAULT_GRID_COLS, grid::DEFAULT_GRID_ROWS));
        let mut state = Self::new(grid, seed);
        for spec in encounter.combatants {
            if state.is_free_cell(spec.position) {
                state.add_combatant(spec);
            } else {
                warn!(name = %spec.name, position = %spec.position, "skipping combatant on unusable cell");
            }
        }
        state
    }

    // ---- grid ----

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    pub fn grid_version(&self) -> u64 {
        self.grid_version
    }

    /// Replace the geometry and bump the grid version.
    pub fn set_grid(&mut self, grid: GridGeometry) {
        self.grid = grid;
        self.grid_version += 1;
        info!(version = self.grid_version, "grid changed");
    }

    /// In bounds, walkable and not occupied.
    pub fn is_free_cell(&self, pos: Position) -> bool {
        self.grid.is_walkable(pos) && self.occupant(pos).is_none()
    }

    pub fn occupant(&self, pos: Position) -> Option<CombatantId> {
        self.combatants
            .values()
            .find(|c| c.position == pos)
            .map(|c| c.id)
    }

    pub fn positions(&self) -> BTreeMap<CombatantId, Position> {
        self.combatants
            .values()
            .map(|c| (c.id, c.position))
            .collect()
    }

    /// Cells a combatant may not path through: those held by the other side.
    pub fn hostile_cells(&self, mover: CombatantId) -> BTreeSet<Position> {
        let Some(side) = self.combatants.get(&mover).map(|c| c.side) else {
            return BTreeSet::new();
        };
        self.combatants
            .values()
            .filter(|c| c.id != mover && !c.side.same_allegiance(&side))
            .map(|c| c.position)
            .collect()
    }

    // ---- combatants ----

    pub fn combatants(&self) -> impl Iterator<Item = &Combatant> {
        self.combatants.values()
    }

    pub fn roster(&self) -> &BTreeMap<CombatantId, Combatant> {
        &self.combatants
    }

    pub fn combatant(&self, id: CombatantId) -> Option<&Combatant> {
        self.combatants.get(&id)
    }

    pub fn combatant_mut(&mut self, id: CombatantId) -> Option<&mut Combatant> {
        self.combatants.get_mut(&id)
    }

    pub fn contains(&self, id: CombatantId) -> bool {
        self.combatants.contains_key(&id)
    }

    pub fn add_combatant(&mut self, spec: CombatantSpec) -> CombatantId {
        let id = self.next_combatant_id;
        self.next_combatant_id += 1;
        let combatant = Combatant::from_spec(id, spec);
        info!(combatant = id, name = %combatant.name, side = combatant.side.as_str(), "combatant added");
        self.combatants.insert(id, combatant);
        id
    }

    /// Add a creature that shares `summoner`'s turn.
    pub fn add_summon(&mut self, summoner: CombatantId, mut spec: CombatantSpec) -> Option<CombatantId> {
        let leader = self.combatants.get(&summoner)?;
        spec.side = match leader.side {
            Side::Enemy => Side::Enemy,
            _ => Side::Ally,
        };
        spec.initiative = leader.initiative;
        spec.dexterity = leader.dexterity;

        let id = self.add_combatant(spec);
        if let Some(c) = self.combatants.get_mut(&id) {
            c.summoned = true;
            c.shares_turn_with = Some(summoner);
        }
        if self.turns.is_active(summoner) {
            self.turns.join_active(id);
        }
        Some(id)
    }

    /// Summons tied to a combatant, directly or through other summons.
    pub fn summons_of(&self, id: CombatantId) -> Vec<CombatantId> {
        let mut found = Vec::new();
        let mut frontier = vec![id];
        while let Some(leader) = frontier.pop() {
            for c in self.combatants.values() {
                if c.summoned && c.shares_turn_with == Some(leader) && !found.contains(&c.id) {
                    found.push(c.id);
                    frontier.push(c.id);
                }
            }
        }
        found
    }

    /// Whether `controller` controls `id` through a summon or mount link.
    pub fn controls(&self, controller: CombatantId, id: CombatantId) -> bool {
        let mut current = id;
        for _ in 0..self.combatants.len() {
            match self.combatants.get(&current).and_then(|c| c.shares_turn_with) {
                Some(next) if next == controller => return true,
                Some(next) if next != current => current = next,
                _ => return false,
            }
        }
        false
    }

    /// Remove a combatant, its summons, and any ownership of area effects.
    /// The turn pointer is retargeted and a new active set, if any, begins
    /// its turn.
    pub fn remove_combatant(&mut self, id: CombatantId) -> Option<TurnChange> {
        let mut gone = vec![id];
        gone.extend(self.summons_of(id));

        for id in gone {
            let Some(c) = self.combatants.remove(&id) else {
                continue;
            };
            info!(combatant = id, name = %c.name, "combatant removed");
            for aoe in self.aoes.values_mut() {
                if aoe.owner == Some(id) {
                    aoe.owner = None;
                }
                aoe.occupants.retain(|o| *o != id);
            }
            for other in self.combatants.values_mut() {
                if other.shares_turn_with == Some(id) {
                    other.shares_turn_with = None;
                }
            }
            self.removed.push(id);
        }

        let change = self.retarget();
        if let Some(change) = &change {
            self.begin_turns(change);
        }
        change
    }

    /// Ids removed since the last call.
    pub fn take_removed(&mut self) -> Vec<CombatantId> {
        std::mem::take(&mut self.removed)
    }

    /// Apply damage with the 0 HP rules: player characters fall unconscious,
    /// everything else leaves the board.
    pub fn apply_damage(&mut self, id: CombatantId, amount: i32) -> DamageOutcome {
        let Some(c) = self.combatants.get_mut(&id) else {
            return DamageOutcome::default();
        };
        let was_down = c.is_down();
        let lost = c.take_damage(amount);
        let mut outcome = DamageOutcome {
            lost,
            ..DamageOutcome::default()
        };
        if c.is_down() && !was_down {
            if c.removed_at_zero() {
                outcome.removed = true;
                let name = c.name.clone();
                self.push_log(format!("{name} is slain"), Some(id));
                self.remove_combatant(id);
            } else {
                outcome.downed = true;
                c.conditions.add("unconscious", None, None);
            }
        }
        outcome
    }

    /// Set hit points directly, applying the same 0 HP rules.
    pub fn set_hit_points(&mut self, id: CombatantId, hp: i32) -> DamageOutcome {
        let Some(c) = self.combatants.get_mut(&id) else {
            return DamageOutcome::default();
        };
        let hp = hp.clamp(0, c.resources.max_hp);
        if hp > 0 {
            let current = c.resources.hp;
            if hp >= current {
                c.heal(hp - current);
            } else {
                c.resources.hp = hp;
            }
            return DamageOutcome::default();
        }
        c.resources.temp_hp = 0;
        let amount = c.resources.hp;
        self.apply_damage(id, amount)
    }

    // ---- area effects ----

    pub fn aoes(&self) -> impl Iterator<Item = &AreaEffect> {
        self.aoes.values()
    }

    pub fn aoe(&self, id: AoeId) -> Option<&AreaEffect> {
        self.aoes.get(&id)
    }

    pub fn aoe_mut(&mut self, id: AoeId) -> Option<&mut AreaEffect> {
        self.aoes.get_mut(&id)
    }

    pub fn aoe_ids(&self) -> Vec<AoeId> {
        self.aoes.keys().copied().collect()
    }

    /// Store a new area effect; its id is assigned here.
    pub fn add_aoe(&mut self, mut effect: AreaEffect) -> AoeId {
        let id = self.next_aoe_id;
        self.next_aoe_id += 1;
        effect.id = id;
        self.aoes.insert(id, effect);
        id
    }

    pub fn remove_aoe(&mut self, id: AoeId) -> Option<AreaEffect> {
        self.aoes.remove(&id)
    }

    // ---- turns ----

    pub fn turns(&self) -> &TurnTracker {
        &self.turns
    }

    pub fn round(&self) -> u32 {
        self.turns.round()
    }

    pub fn start_combat(&mut self) -> Result<TurnChange, TurnError> {
        let change = self.turns.start(&self.combatants)?;
        info!(round = change.round, active = ?change.active, "combat started");
        self.push_log("Combat begins".to_string(), None);
        self.begin_turns(&change);
        Ok(change)
    }

    pub fn end_combat(&mut self) -> Result<(), TurnError> {
        if !self.turns.is_running() {
            return Err(TurnError::NotActive);
        }
        self.turns.stop();
        self.aoes.retain(|_, a| a.remaining_rounds.is_none());
        info!("combat ended");
        self.push_log("Combat ends".to_string(), None);
        Ok(())
    }

    /// Move straight to the next group.
    pub fn advance(&mut self) -> Result<Option<TurnChange>, TurnError> {
        let change = self.turns.advance(&self.combatants)?;
        if let Some(change) = &change {
            self.begin_turns(change);
        }
        Ok(change)
    }

    /// Mark one member of the active set done. Its timed conditions count
    /// down here.
    pub fn end_turn(&mut self, id: CombatantId) -> Result<EndTurn, TurnError> {
        let result = self.turns.end_turn(&self.combatants, id)?;
        if let Some(c) = self.combatants.get_mut(&id) {
            for name in c.conditions.tick() {
                let text = format!("{} is no longer {name}", c.name);
                self.log.push(LogEntry {
                    at: Utc::now(),
                    round: self.turns.round(),
                    text,
                    target: Some(id),
                });
            }
        }
        if let EndTurn::Advanced(Some(change)) = &result {
            self.begin_turns(change);
        }
        Ok(result)
    }

    /// Repair the turn pointer after the roster changed.
    pub fn retarget(&mut self) -> Option<TurnChange> {
        let change = self.turns.retarget(&self.combatants);
        if let Some(change) = &change {
            warn!(active = ?change.active, "active set retargeted");
        }
        change
    }

    /// Apply everything that happens when a new active set takes over.
    pub fn begin_turns(&mut self, change: &TurnChange) {
        if change.new_round {
            self.push_log(format!("Round {} begins", change.round), None);
            for aoe in self.aoes.values_mut().filter(|a| a.owner.is_none()) {
                if let Some(r) = aoe.remaining_rounds.as_mut() {
                    *r = r.saturating_sub(1);
                }
            }
        }

        for id in &change.active {
            let Some(c) = self.combatants.get_mut(id) else {
                continue;
            };
            c.resources.start_turn();
            c.conditions.remove("dodging");
            let name = c.name.clone();

            for aoe in self.aoes.values_mut().filter(|a| a.owner == Some(*id)) {
                aoe.moved_ft = 0;
                if let Some(r) = aoe.remaining_rounds.as_mut() {
                    *r = r.saturating_sub(1);
                }
            }
            self.push_log(format!("{name}'s turn"), Some(*id));
        }

        let expired: Vec<AoeId> = self
            .aoes
            .values()
            .filter(|a| a.remaining_rounds == Some(0))
            .map(|a| a.id)
            .collect();
        for id in expired {
            if let Some(aoe) = self.aoes.remove(&id) {
                self.push_log(format!("{} ends", aoe.name), None);
            }
        }
        info!(round = change.round, active = ?change.active, "turn started");
    }

    // ---- log and dice ----

    pub fn push_log(&mut self, text: String, target: Option<CombatantId>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            round: self.turns.round(),
            text,
            target,
        });
    }

    /// Entries written since the last call.
    pub fn drain_log(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.log)
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}
