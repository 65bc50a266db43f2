//! Area effects: positioned shapes with optional duration, movement budget
//! and automated save resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::combatant::CombatantId;
use super::grid::Position;
use crate::dice::DiceExpr;

/// Area effect identifier.
pub type AoeId = u32;

/// Effect footprint. Sizes are in feet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    /// Radius measured from the centre of the origin cell.
    Circle { radius_ft: u32 },
    /// Square centred on the origin cell.
    Square { size_ft: u32 },
    /// Line from the origin cell towards `toward`.
    Line {
        length_ft: u32,
        width_ft: u32,
        toward: Position,
    },
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Circle { .. } => "circle",
            Self::Square { .. } => "square",
            Self::Line { .. } => "line",
        }
    }

    /// Whether the centre of `cell` lies inside the shape at `origin`.
    pub fn contains(&self, origin: Position, cell: Position, feet_per_square: u32) -> bool {
        let fps = feet_per_square.max(1) as f64;
        let dx = (cell.x - origin.x) as f64;
        let dy = (cell.y - origin.y) as f64;
        match self {
            Self::Circle { radius_ft } => {
                let r = *radius_ft as f64 / fps;
                dx * dx + dy * dy <= r * r
            }
            Self::Square { size_ft } => {
                let squares = (*size_ft as f64 / fps).max(1.0);
                let half = squares / 2.0;
                dx.abs() < half && dy.abs() < half
            }
            Self::Line {
                length_ft,
                width_ft,
                toward,
            } => {
                let vx = (toward.x - origin.x) as f64;
                let vy = (toward.y - origin.y) as f64;
                let norm = (vx * vx + vy * vy).sqrt();
                if norm == 0.0 {
                    return cell == origin;
                }
                let (ux, uy) = (vx / norm, vy / norm);
                let along = dx * ux + dy * uy;
                let across = (dx * uy - dy * ux).abs();
                let length = *length_ft as f64 / fps;
                let half_width = (*width_ft as f64 / fps).max(1.0) / 2.0;
                (0.0..=length).contains(&along) && across <= half_width
            }
        }
    }
}

/// When an effect resolves against combatants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Resolves once when cast.
    #[default]
    Once,
    /// Resolves for a combatant when it comes inside the effect.
    OnEnter,
    /// Resolves for a combatant when it leaves the effect.
    OnExit,
    /// Resolves for every combatant inside at the end of its turn.
    TurnEnd,
}

/// Condition applied on a failed save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub name: String,
    #[serde(default)]
    pub rounds: Option<u32>,
}

/// Save-for-damage automation attached to an effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveAutomation {
    /// Ability used for the save ("dex", "con", ...).
    pub ability: String,
    pub dc: i32,
    #[serde(default)]
    pub damage: Option<DiceExpr>,
    #[serde(default)]
    pub damage_type: Option<String>,
    #[serde(default = "default_half")]
    pub half_on_success: bool,
    #[serde(default)]
    pub condition: Option<ConditionSpec>,
}

fn default_half() -> bool {
    true
}

/// A positioned, possibly timed area effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaEffect {
    pub id: AoeId,
    pub name: String,
    pub shape: Shape,
    pub origin: Position,
    pub remaining_rounds: Option<u32>,
    /// Feet the effect may be moved per owner turn.
    pub move_budget_ft: Option<u32>,
    pub moved_ft: u32,
    pub trigger: Trigger,
    pub owner: Option<CombatantId>,
    pub automation: Option<SaveAutomation>,
    /// Combatants inside as of the last resolution, for enter/exit triggers.
    #[serde(skip)]
    pub occupants: Vec<CombatantId>,
}

impl AreaEffect {
    pub fn contains(&self, cell: Position, feet_per_square: u32) -> bool {
        self.shape.contains(self.origin, cell, feet_per_square)
    }

    /// Ids of combatants whose cell is inside the effect, in id order.
    pub fn targets(
        &self,
        positions: &BTreeMap<CombatantId, Position>,
        feet_per_square: u32,
    ) -> Vec<CombatantId> {
        positions
            .iter()
            .filter(|(_, p)| self.contains(**p, feet_per_square))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Feet of movement left this turn, if the effect can move at all.
    pub fn movement_left(&self) -> Option<u32> {
        self.move_budget_ft
            .map(|budget| budget.saturating_sub(self.moved_ft))
    }

    pub fn is_persistent(&self) -> bool {
        self.trigger != Trigger::Once || self.remaining_rounds.is_some()
    }
}
