//! Combatants: identity, side, resources, position and conditions.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::grid::Position;

/// Stable combatant identifier.
pub type CombatantId = u32;

/// Base walking speed in feet.
pub const DEFAULT_SPEED_FT: u32 = 30;

/// Which side of the table a combatant fights for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    PlayerCharacter,
    Ally,
    Enemy,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerCharacter => "player_character",
            Self::Ally => "ally",
            Self::Enemy => "enemy",
        }
    }

    /// Player characters and allies fight together.
    pub fn is_friendly(&self) -> bool {
        !matches!(self, Self::Enemy)
    }

    pub fn same_allegiance(&self, other: &Side) -> bool {
        self.is_friendly() == other.is_friendly()
    }
}

/// A pool of spell slots at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPool {
    pub current: u32,
    pub max: u32,
}

/// Per-turn and per-encounter resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub hp: i32,
    pub max_hp: i32,
    pub temp_hp: i32,
    pub movement_total: u32,
    pub movement_remaining: u32,
    pub actions: u32,
    pub bonus_actions: u32,
    pub reactions: u32,
    /// Attacks left from the current Attack action.
    pub attacks_remaining: u32,
    pub attacks_per_action: u32,
    /// Spell slots keyed by spell level.
    pub spell_slots: BTreeMap<u8, SlotPool>,
    /// Named limited-use pools ("ki", "sorcery_points", ...).
    pub pools: BTreeMap<String, u32>,
}

impl Resources {
    pub fn new(max_hp: i32, speed: u32) -> Self {
        Self {
            hp: max_hp,
            max_hp,
            temp_hp: 0,
            movement_total: speed,
            movement_remaining: speed,
            actions: 1,
            bonus_actions: 1,
            reactions: 1,
            attacks_remaining: 0,
            attacks_per_action: 1,
            spell_slots: BTreeMap::new(),
            pools: BTreeMap::new(),
        }
    }

    /// Restore what a creature gets back at the start of its turn.
    pub fn start_turn(&mut self) {
        self.movement_remaining = self.movement_total;
        self.actions = 1;
        self.bonus_actions = 1;
        self.reactions = 1;
        self.attacks_remaining = 0;
    }
}

/// One stack of a condition. `None` lasts until removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionStack {
    pub remaining_rounds: Option<u32>,
    pub source: Option<CombatantId>,
}

/// Named conditions, each holding independently timed stacks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(BTreeMap<String, Vec<ConditionStack>>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, remaining_rounds: Option<u32>, source: Option<CombatantId>) {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(ConditionStack {
                remaining_rounds,
                source,
            });
    }

    /// Remove every stack of a condition. Returns true if any were present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn stacks(&self, name: &str) -> usize {
        self.0
            .get(&name.to_ascii_lowercase())
            .map_or(0, |s| s.len())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Count down timed stacks by one round and drop the expired ones.
    /// Returns the names of conditions that disappeared entirely.
    pub fn tick(&mut self) -> Vec<String> {
        for stacks in self.0.values_mut() {
            for stack in stacks.iter_mut() {
                if let Some(r) = stack.remaining_rounds.as_mut() {
                    *r = r.saturating_sub(1);
                }
            }
            stacks.retain(|s| s.remaining_rounds != Some(0));
        }

        let expired: Vec<String> = self
            .0
            .iter()
            .filter(|(_, s)| s.is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        for name in &expired {
            self.0.remove(name);
        }
        expired
    }
}

/// What the desk (or an encounter file) supplies to add a combatant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatantSpec {
    pub name: String,
    #[serde(default)]
    pub side: Side,
    pub max_hp: i32,
    #[serde(default)]
    pub armor_class: i32,
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default)]
    pub initiative: i32,
    #[serde(default)]
    pub dexterity: i32,
    #[serde(default)]
    pub attack_bonus: i32,
    #[serde(default = "default_attacks")]
    pub attacks_per_action: u32,
    /// Save modifiers keyed by ability ("dex", "con", ...).
    #[serde(default)]
    pub saves: BTreeMap<String, i32>,
    /// Slot count per spell level.
    #[serde(default, deserialize_with = "slot_levels")]
    pub spell_slots: BTreeMap<u8, u32>,
    #[serde(default)]
    pub pools: BTreeMap<String, u32>,
    pub position: Position,
}

/// JSON object keys are strings, and buffered (tagged) messages do not
/// convert them back to integers: `{"1": 4, "2": 2}`.
fn slot_levels<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<u8, u32>, D::Error> {
    BTreeMap::<String, u32>::deserialize(d)?
        .into_iter()
        .map(|(level, count)| {
            level
                .trim()
                .parse::<u8>()
                .map(|level| (level, count))
                .map_err(|_| D::Error::custom(format!("bad spell level {level:?}")))
        })
        .collect()
}

fn default_speed() -> u32 {
    DEFAULT_SPEED_FT
}

fn default_attacks() -> u32 {
    1
}

impl CombatantSpec {
    pub fn new(name: &str, side: Side, max_hp: i32, position: Position) -> Self {
        Self {
            name: name.to_string(),
            side,
            max_hp,
            armor_class: 10,
            speed: DEFAULT_SPEED_FT,
            initiative: 0,
            dexterity: 10,
            attack_bonus: 0,
            attacks_per_action: 1,
            saves: BTreeMap::new(),
            spell_slots: BTreeMap::new(),
            pools: BTreeMap::new(),
            position,
        }
    }

    pub fn with_initiative(mut self, initiative: i32, dexterity: i32) -> Self {
        self.initiative = initiative;
        self.dexterity = dexterity;
        self
    }

    pub fn with_armor_class(mut self, armor_class: i32) -> Self {
        self.armor_class = armor_class;
        self
    }
}

/// A participant in the encounter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combatant {
    pub id: CombatantId,
    pub name: String,
    pub side: Side,
    pub initiative: i32,
    /// Secondary initiative tie-break.
    pub dexterity: i32,
    pub armor_class: i32,
    pub attack_bonus: i32,
    pub saves: BTreeMap<String, i32>,
    pub resources: Resources,
    pub position: Position,
    pub conditions: Conditions,
    /// Whose turn this combatant always shares (summons, mounts).
    pub shares_turn_with: Option<CombatantId>,
    /// Created by a summon action and removed on dismissal.
    pub summoned: bool,
}

impl Combatant {
    pub fn from_spec(id: CombatantId, spec: CombatantSpec) -> Self {
        let mut resources = Resources::new(spec.max_hp, spec.speed);
        resources.attacks_per_action = spec.attacks_per_action.max(1);
        resources.spell_slots = spec
            .spell_slots
            .into_iter()
            .map(|(level, max)| (level, SlotPool { current: max, max }))
            .collect();
        resources.pools = spec.pools;

        Self {
            id,
            name: spec.name,
            side: spec.side,
            initiative: spec.initiative,
            dexterity: spec.dexterity,
            armor_class: spec.armor_class,
            attack_bonus: spec.attack_bonus,
            saves: spec.saves,
            resources,
            position: spec.position,
            conditions: Conditions::new(),
            shares_turn_with: None,
            summoned: false,
        }
    }

    pub fn save_bonus(&self, ability: &str) -> i32 {
        self.saves
            .get(&ability.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn is_down(&self) -> bool {
        self.resources.hp <= 0
    }

    /// Combatants that the turn order passes over.
    pub fn skips_turn(&self) -> bool {
        self.conditions.has("dead")
    }

    /// Apply damage, temp HP first. Returns HP actually lost.
    pub fn take_damage(&mut self, amount: i32) -> i32 {
        let amount = amount.max(0);
        let absorbed = amount.min(self.resources.temp_hp);
        self.resources.temp_hp -= absorbed;
        let before = self.resources.hp;
        self.resources.hp = (self.resources.hp - (amount - absorbed)).max(0);
        before - self.resources.hp
    }

    /// Heal up to max HP. Returns HP actually restored.
    pub fn heal(&mut self, amount: i32) -> i32 {
        let before = self.resources.hp;
        self.resources.hp = (self.resources.hp + amount.max(0)).min(self.resources.max_hp);
        if self.resources.hp > 0 {
            self.conditions.remove("unconscious");
        }
        self.resources.hp - before
    }

    /// Whether dropping to 0 HP takes this combatant off the board.
    pub fn removed_at_zero(&self) -> bool {
        self.summoned || self.side != Side::PlayerCharacter
    }
}
