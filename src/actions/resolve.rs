//! Effect resolution: saving throws against area effects and the trigger
//! bookkeeping for persistent effects.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dice::DiceExpr;
use crate::state::{AoeId, CombatState, CombatantId, SaveAutomation, Trigger};

/// What one target got from a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    pub target: CombatantId,
    pub total: i32,
    pub success: bool,
    pub damage: i32,
    pub condition: Option<String>,
}

/// Resolve a save-for-effect against each target.
///
/// Damage is rolled once for everyone unless `damage_roll` supplies it.
/// A target's save total comes from `save_rolls` when present, otherwise
/// d20 plus its save bonus. Failing takes full damage and the condition;
/// succeeding takes half (or nothing) and no condition. Every target gets
/// exactly one battle log entry.
pub fn resolve_save(
    state: &mut CombatState,
    source: &str,
    automation: &SaveAutomation,
    targets: &[CombatantId],
    save_rolls: &BTreeMap<CombatantId, i32>,
    damage_roll: Option<i32>,
) -> Vec<SaveResult> {
    let rolled = match (damage_roll, automation.damage) {
        (Some(d), _) => Some(d.max(0)),
        (None, Some(expr)) => Some(expr.roll(state.rng()).max(0)),
        (None, None) => None,
    };
    let ability = automation.ability.to_ascii_uppercase();

    let mut results = Vec::with_capacity(targets.len());
    for &target in targets {
        let Some(c) = state.combatant(target) else {
            continue;
        };
        let name = c.name.clone();
        let bonus = c.save_bonus(&automation.ability);

        let total = match save_rolls.get(&target) {
            Some(total) => *total,
            None => DiceExpr::d20().roll(state.rng()) + bonus,
        };
        let success = total >= automation.dc;

        let damage = match rolled {
            Some(full) if !success => full,
            Some(full) if automation.half_on_success => full / 2,
            _ => 0,
        };
        let condition = match &automation.condition {
            Some(spec) if !success => Some(spec.clone()),
            _ => None,
        };

        let mut text = format!(
            "{name} {} {ability} save vs {source} ({total} vs DC {})",
            if success { "succeeds on" } else { "fails" },
            automation.dc
        );
        if rolled.is_some() {
            let kind = automation
                .damage_type
                .as_deref()
                .map(|t| format!(" {t}"))
                .unwrap_or_default();
            text.push_str(&format!(": takes {damage}{kind} damage"));
        }

        if let Some(spec) = &condition {
            if let Some(c) = state.combatant_mut(target) {
                c.conditions.add(&spec.name, spec.rounds, None);
            }
            text.push_str(&format!(", is {}", spec.name.to_ascii_lowercase()));
        }
        let outcome = state.apply_damage(target, damage);
        if outcome.downed {
            text.push_str(", falls unconscious");
        }
        state.push_log(text, Some(target));

        results.push(SaveResult {
            target,
            total,
            success,
            damage,
            condition: condition.map(|c| c.name),
        });
    }
    debug!(source, targets = results.len(), "save resolved");
    results
}

/// Apply `turn_end` effects to a combatant finishing its turn inside them.
pub fn turn_end_effects(state: &mut CombatState, id: CombatantId) -> Vec<SaveResult> {
    let mut results = Vec::new();
    for aoe_id in effects_on(state, id) {
        if !state.contains(id) {
            break;
        }
        let Some(effect) = state.aoe(aoe_id) else {
            continue;
        };
        if effect.trigger != Trigger::TurnEnd {
            continue;
        }
        let Some(automation) = effect.automation.clone() else {
            continue;
        };
        let name = effect.name.clone();
        results.extend(resolve_save(
            state,
            &name,
            &automation,
            &[id],
            &BTreeMap::new(),
            None,
        ));
    }
    results
}

/// Recompute who stands in each persistent effect and fire `on_enter` /
/// `on_exit` for the difference.
pub fn refresh_occupancy(state: &mut CombatState) -> Vec<SaveResult> {
    let mut results = Vec::new();
    for aoe_id in state.aoe_ids() {
        let positions = state.positions();
        let fps = state.grid().feet_per_square;
        let Some(effect) = state.aoe_mut(aoe_id) else {
            continue;
        };

        let now: Vec<CombatantId> = effect.targets(&positions, fps);
        let before: BTreeSet<CombatantId> = effect.occupants.iter().copied().collect();
        let after: BTreeSet<CombatantId> = now.iter().copied().collect();
        effect.occupants = now;

        let fired: Vec<CombatantId> = match effect.trigger {
            Trigger::OnEnter => after.difference(&before).copied().collect(),
            Trigger::OnExit => before
                .difference(&after)
                .copied()
                .filter(|id| positions.contains_key(id))
                .collect(),
            Trigger::Once | Trigger::TurnEnd => Vec::new(),
        };
        if fired.is_empty() {
            continue;
        }
        let Some(automation) = effect.automation.clone() else {
            continue;
        };
        let name = effect.name.clone();
        results.extend(resolve_save(
            state,
            &name,
            &automation,
            &fired,
            &BTreeMap::new(),
            None,
        ));
    }
    results
}

/// Ids of effects that currently contain a combatant.
pub fn effects_on(state: &CombatState, id: CombatantId) -> Vec<AoeId> {
    let Some(c) = state.combatant(id) else {
        return Vec::new();
    };
    let fps = state.grid().feet_per_square;
    state
        .aoes()
        .filter(|a| a.contains(c.position, fps))
        .map(|a| a.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        AreaEffect, CombatantSpec, ConditionSpec, GridGeometry, Position, Shape, Side,
    };
    use pretty_assertions::assert_eq;

    fn poison_cloud() -> SaveAutomation {
        SaveAutomation {
            ability: "con".to_string(),
            dc: 14,
            damage: Some(DiceExpr::new(0, 0, 10)),
            damage_type: Some("poison".to_string()),
            half_on_success: true,
            condition: Some(ConditionSpec {
                name: "poisoned".to_string(),
                rounds: Some(1),
            }),
        }
    }

    fn setup() -> CombatState {
        let mut state = CombatState::new(GridGeometry::new(10, 10), Some(11));
        state.add_combatant(CombatantSpec::new("Bram", Side::Enemy, 30, Position::new(2, 2)));
        state.add_combatant(CombatantSpec::new("Cato", Side::Enemy, 30, Position::new(3, 2)));
        state
    }

    fn effect(trigger: Trigger, origin: Position) -> AreaEffect {
        AreaEffect {
            id: 0,
            name: "Cloud".to_string(),
            shape: Shape::Circle { radius_ft: 5 },
            origin,
            remaining_rounds: Some(10),
            move_budget_ft: None,
            moved_ft: 0,
            trigger,
            owner: None,
            automation: Some(poison_cloud()),
            occupants: Vec::new(),
        }
    }

    #[test]
    fn test_save_fail_and_pass() {
        let mut state = setup();
        let rolls = BTreeMap::from([(1, 5), (2, 18)]);
        let results = resolve_save(&mut state, "Cloud", &poison_cloud(), &[1, 2], &rolls, Some(12));

        assert_eq!(
            results,
            vec![
                SaveResult {
                    target: 1,
                    total: 5,
                    success: false,
                    damage: 12,
                    condition: Some("poisoned".to_string()),
                },
                SaveResult {
                    target: 2,
                    total: 18,
                    success: true,
                    damage: 6,
                    condition: None,
                },
            ]
        );
        assert_eq!(state.combatant(1).unwrap().resources.hp, 18);
        assert!(state.combatant(1).unwrap().conditions.has("poisoned"));
        assert!(!state.combatant(2).unwrap().conditions.has("poisoned"));
        assert_eq!(state.drain_log().len(), 2);
    }

    #[test]
    fn test_no_half_damage() {
        let mut state = setup();
        let mut automation = poison_cloud();
        automation.half_on_success = false;
        let rolls = BTreeMap::from([(1, 20)]);
        let results = resolve_save(&mut state, "Bolt", &automation, &[1], &rolls, None);
        assert_eq!(results[0].damage, 0);
    }

    #[test]
    fn test_on_enter_fires_once_per_entry() {
        let mut state = setup();
        state.add_aoe(effect(Trigger::OnEnter, Position::new(6, 6)));
        assert!(refresh_occupancy(&mut state).is_empty());

        state.combatant_mut(1).unwrap().position = Position::new(6, 6);
        let fired = refresh_occupancy(&mut state);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].target, 1);

        assert!(refresh_occupancy(&mut state).is_empty());
    }

    #[test]
    fn test_on_exit_fires_when_leaving() {
        let mut state = setup();
        state.add_aoe(effect(Trigger::OnExit, Position::new(2, 2)));
        refresh_occupancy(&mut state);

        state.combatant_mut(1).unwrap().position = Position::new(8, 8);
        let fired = refresh_occupancy(&mut state);
        assert_eq!(fired.iter().map(|r| r.target).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_turn_end_applies_inside_only() {
        let mut state = setup();
        state.add_aoe(effect(Trigger::TurnEnd, Position::new(2, 2)));
        assert_eq!(effects_on(&state, 1), vec![1]);

        assert_eq!(turn_end_effects(&mut state, 1).len(), 1);
        state.combatant_mut(2).unwrap().position = Position::new(9, 9);
        assert!(turn_end_effects(&mut state, 2).is_empty());
    }
}
