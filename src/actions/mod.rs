//! Action dispatch pipeline.
//!
//! Every command, whether it came from a client or from the desk, runs
//! through [`dispatch`]. Validation happens in a fixed order:
//!
//! 1. the origin must control the acting combatant (desk skips this)
//! 2. turn-gated commands need the actor in the active set (desk skips this)
//! 3. the resource the command spends must be available
//! 4. only then is anything mutated
//!
//! A command that fails any step leaves the state untouched.

pub mod resolve;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dice::DiceExpr;
use crate::error::ActionError;
use crate::movement::{movement_cost, MoveError};
use crate::state::{
    AoeId, AreaEffect, CombatState, CombatantId, CombatantSpec, ConnId, EndTurn, GridGeometry,
    Position, SaveAutomation, Shape, Trigger,
};

/// Melee reach used when an attack names no range.
pub const DEFAULT_REACH_FT: u32 = 5;

/// Which per-turn resource a command spends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCost {
    #[default]
    Action,
    BonusAction,
    Reaction,
    Free,
}

impl ActionCost {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::BonusAction => "bonus action",
            Self::Reaction => "reaction",
            Self::Free => "free",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub combatant: CombatantId,
    pub to: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackRequest {
    pub attacker: CombatantId,
    pub target: CombatantId,
    /// Natural d20 the player rolled; rolled here when absent.
    #[serde(default)]
    pub d20: Option<i32>,
    #[serde(default)]
    pub damage: Option<DiceExpr>,
    /// Damage total the player rolled; overrides `damage`.
    #[serde(default)]
    pub damage_roll: Option<i32>,
    #[serde(default)]
    pub damage_type: Option<String>,
    #[serde(default)]
    pub range_ft: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastAoe {
    pub caster: CombatantId,
    pub name: String,
    pub shape: Shape,
    pub origin: Position,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub duration_rounds: Option<u32>,
    #[serde(default)]
    pub move_budget_ft: Option<u32>,
    #[serde(default)]
    pub range_ft: Option<u32>,
    #[serde(default)]
    pub slot_level: Option<u8>,
    #[serde(default)]
    pub cost: ActionCost,
    #[serde(default)]
    pub automation: Option<SaveAutomation>,
    /// Save totals supplied by players.
    #[serde(default)]
    pub save_rolls: Vec<SaveRoll>,
    #[serde(default)]
    pub damage_roll: Option<i32>,
}

/// A save total a player rolled for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRoll {
    pub target: CombatantId,
    pub total: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoeMove {
    pub aoe: AoeId,
    pub to: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoeRemove {
    pub aoe: AoeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseAction {
    pub combatant: CombatantId,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseReaction {
    pub combatant: CombatantId,
    pub reaction: String,
    #[serde(default)]
    pub target: Option<CombatantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsePool {
    pub combatant: CombatantId,
    pub pool: String,
    #[serde(default = "default_amount")]
    pub amount: u32,
}

fn default_amount() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summon {
    pub summoner: CombatantId,
    pub creature: CombatantSpec,
    #[serde(default)]
    pub cost: ActionCost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatantRef {
    pub combatant: CombatantId,
}

/// Everything the pipeline can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Move(MoveRequest),
    Attack(AttackRequest),
    CastAoe(CastAoe),
    AoeMove(AoeMove),
    AoeRemove(AoeRemove),
    UseAction(UseAction),
    UseBonusAction(UseAction),
    UseReaction(UseReaction),
    UsePool(UsePool),
    Summon(Summon),
    Dismiss(CombatantRef),
    EndTurn(CombatantRef),

    // Desk only.
    StartCombat,
    EndCombat,
    NextTurn,
    AddCombatant(CombatantSpec),
    RemoveCombatant(CombatantId),
    SetHitPoints {
        combatant: CombatantId,
        hp: i32,
    },
    AddCondition {
        combatant: CombatantId,
        name: String,
        rounds: Option<u32>,
    },
    RemoveCondition {
        combatant: CombatantId,
        name: String,
    },
    SetGrid(GridGeometry),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Move(_) => "move",
            Self::Attack(_) => "attack_request",
            Self::CastAoe(_) => "cast_aoe",
            Self::AoeMove(_) => "aoe_move",
            Self::AoeRemove(_) => "aoe_remove",
            Self::UseAction(_) => "use_action",
            Self::UseBonusAction(_) => "use_bonus_action",
            Self::UseReaction(_) => "use_reaction",
            Self::UsePool(_) => "use_pool",
            Self::Summon(_) => "summon",
            Self::Dismiss(_) => "dismiss",
            Self::EndTurn(_) => "end_turn",
            Self::StartCombat => "start_combat",
            Self::EndCombat => "end_combat",
            Self::NextTurn => "next_turn",
            Self::AddCombatant(_) => "add_combatant",
            Self::RemoveCombatant(_) => "remove_combatant",
            Self::SetHitPoints { .. } => "set_hit_points",
            Self::AddCondition { .. } => "add_condition",
            Self::RemoveCondition { .. } => "remove_condition",
            Self::SetGrid(_) => "set_grid",
        }
    }

    pub fn is_desk_only(&self) -> bool {
        matches!(
            self,
            Self::StartCombat
                | Self::EndCombat
                | Self::NextTurn
                | Self::AddCombatant(_)
                | Self::RemoveCombatant(_)
                | Self::SetHitPoints { .. }
                | Self::AddCondition { .. }
                | Self::RemoveCondition { .. }
                | Self::SetGrid(_)
        )
    }
}

/// Who sent a command. The claim set is read from the registry when the
/// command is dequeued, not when it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Session {
        conn: ConnId,
        signed_in: bool,
        claimed: BTreeSet<CombatantId>,
    },
    Desk,
}

impl Origin {
    pub fn is_desk(&self) -> bool {
        matches!(self, Self::Desk)
    }

    /// Step 1: the origin controls `actor`, directly or through a summoner.
    pub fn authorize(&self, state: &CombatState, actor: CombatantId) -> Result<(), ActionError> {
        if !state.contains(actor) {
            return Err(ActionError::UnknownCombatant(actor));
        }
        match self {
            Self::Desk => Ok(()),
            Self::Session {
                signed_in: false, ..
            } => Err(ActionError::NotSignedIn),
            Self::Session { claimed, .. } => {
                if claimed.contains(&actor) || claimed.iter().any(|c| state.controls(*c, actor)) {
                    Ok(())
                } else {
                    Err(ActionError::NotYourCombatant(actor))
                }
            }
        }
    }
}

/// Result of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Short confirmation for the sender.
    pub message: String,
    /// Combatant created by a summon, to be handed to the caster's session.
    pub summoned: Option<CombatantId>,
}

impl Outcome {
    fn says(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            summoned: None,
        }
    }
}

/// Validate and apply one command.
pub fn dispatch(
    state: &mut CombatState,
    origin: &Origin,
    command: Command,
) -> Result<Outcome, ActionError> {
    if command.is_desk_only() && !origin.is_desk() {
        return Err(ActionError::DeskOnly);
    }

    let name = command.name();
    let outcome = match command {
        Command::Move(req) => do_move(state, origin, req),
        Command::Attack(req) => attack(state, origin, req),
        Command::CastAoe(req) => cast_aoe(state, origin, req),
        Command::AoeMove(req) => move_aoe(state, origin, req),
        Command::AoeRemove(req) => remove_aoe(state, origin, req),
        Command::UseAction(req) => use_action(state, origin, req, ActionCost::Action),
        Command::UseBonusAction(req) => use_action(state, origin, req, ActionCost::BonusAction),
        Command::UseReaction(req) => use_reaction(state, origin, req),
        Command::UsePool(req) => use_pool(state, origin, req),
        Command::Summon(req) => summon(state, origin, req),
        Command::Dismiss(req) => dismiss(state, origin, req.combatant),
        Command::EndTurn(req) => end_turn(state, origin, req.combatant),
        Command::StartCombat => {
            let change = state.start_combat()?;
            Ok(Outcome::says(format!("combat started, round {}", change.round)))
        }
        Command::EndCombat => {
            state.end_combat()?;
            Ok(Outcome::says("combat ended"))
        }
        Command::NextTurn => next_turn(state),
        Command::AddCombatant(spec) => add_combatant(state, spec),
        Command::RemoveCombatant(id) => {
            let c = state.combatant(id).ok_or(ActionError::UnknownCombatant(id))?;
            let text = format!("{} leaves the fight", c.name);
            state.remove_combatant(id);
            state.push_log(text.clone(), Some(id));
            Ok(Outcome::says(text))
        }
        Command::SetHitPoints { combatant, hp } => {
            if !state.contains(combatant) {
                return Err(ActionError::UnknownCombatant(combatant));
            }
            state.set_hit_points(combatant, hp);
            Ok(Outcome::says(format!("hit points set to {}", hp.max(0))))
        }
        Command::AddCondition {
            combatant,
            name,
            rounds,
        } => {
            let c = state
                .combatant_mut(combatant)
                .ok_or(ActionError::UnknownCombatant(combatant))?;
            c.conditions.add(&name, rounds, None);
            let text = format!("{} is {}", c.name, name.to_ascii_lowercase());
            state.push_log(text.clone(), Some(combatant));
            Ok(Outcome::says(text))
        }
        Command::RemoveCondition { combatant, name } => {
            let c = state
                .combatant_mut(combatant)
                .ok_or(ActionError::UnknownCombatant(combatant))?;
            if !c.conditions.remove(&name) {
                return Err(ActionError::invalid(format!("{} is not {name}", c.name)));
            }
            let text = format!("{} is no longer {}", c.name, name.to_ascii_lowercase());
            state.push_log(text.clone(), Some(combatant));
            Ok(Outcome::says(text))
        }
        Command::SetGrid(grid) => set_grid(state, grid),
    }?;

    resolve::refresh_occupancy(state);
    state.retarget();
    debug!(command = name, "command applied");
    Ok(outcome)
}

/// Step 2: the actor must be part of the active set and not done yet.
fn require_turn(
    state: &CombatState,
    origin: &Origin,
    actor: CombatantId,
) -> Result<(), ActionError> {
    if origin.is_desk() {
        return Ok(());
    }
    let turns = state.turns();
    if !turns.is_running() {
        return Err(ActionError::NoCombat);
    }
    if !turns.is_active(actor) {
        return Err(ActionError::NotYourTurn(actor));
    }
    if turns.has_ended(actor) {
        return Err(ActionError::TurnAlreadyEnded(actor));
    }
    Ok(())
}

/// Step 3 for per-turn resources. Outside combat nothing is charged.
fn require_cost(state: &CombatState, actor: CombatantId, cost: ActionCost) -> Result<(), ActionError> {
    if !state.turns().is_running() {
        return Ok(());
    }
    let r = &state
        .combatant(actor)
        .ok_or(ActionError::UnknownCombatant(actor))?
        .resources;
    let left = match cost {
        ActionCost::Action => r.actions,
        ActionCost::BonusAction => r.bonus_actions,
        ActionCost::Reaction => r.reactions,
        ActionCost::Free => return Ok(()),
    };
    if left == 0 {
        return Err(ActionError::NoResource(cost.as_str()));
    }
    Ok(())
}

fn charge(state: &mut CombatState, actor: CombatantId, cost: ActionCost) {
    if !state.turns().is_running() {
        return;
    }
    if let Some(c) = state.combatant_mut(actor) {
        let r = &mut c.resources;
        let counter = match cost {
            ActionCost::Action => &mut r.actions,
            ActionCost::BonusAction => &mut r.bonus_actions,
            ActionCost::Reaction => &mut r.reactions,
            ActionCost::Free => return,
        };
        *counter = counter.saturating_sub(1);
    }
}

fn do_move(state: &mut CombatState, origin: &Origin, req: MoveRequest) -> Result<Outcome, ActionError> {
    let MoveRequest { combatant, to } = req;
    origin.authorize(state, combatant)?;
    let in_combat = state.turns().is_running();
    if in_combat {
        require_turn(state, origin, combatant)?;
    }

    let c = state
        .combatant(combatant)
        .ok_or(ActionError::UnknownCombatant(combatant))?;
    let from = c.position;
    let remaining = c.resources.movement_remaining;
    if from == to {
        return Err(ActionError::invalid("already there"));
    }
    if let Some(other) = state.occupant(to) {
        if other != combatant {
            return Err(ActionError::Occupied(to));
        }
    }

    // The desk places tokens freely; players walk and pay outside combat
    // only with an unlimited budget.
    let charged = in_combat && !origin.is_desk();
    let cost = if origin.is_desk() {
        if !state.grid().is_walkable(to) {
            return Err(MoveError::Blocked(to).into());
        }
        0
    } else {
        let budget = if charged { remaining } else { u32::MAX };
        let blocked = state.hostile_cells(combatant);
        movement_cost(state.grid(), &blocked, from, to, budget).map_err(|e| match e {
            MoveError::OverBudget { cost, budget } => ActionError::NotEnoughMovement {
                cost,
                remaining: budget,
            },
            other => other.into(),
        })?
    };

    let Some(c) = state.combatant_mut(combatant) else {
        return Err(ActionError::UnknownCombatant(combatant));
    };
    c.position = to;
    if charged {
        c.resources.movement_remaining -= cost;
    }
    let text = format!("{} moves to {to} ({cost} ft)", c.name);
    state.push_log(text.clone(), Some(combatant));
    Ok(Outcome::says(text))
}

fn attack(state: &mut CombatState, origin: &Origin, req: AttackRequest) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.attacker)?;
    require_turn(state, origin, req.attacker)?;

    let attacker = state
        .combatant(req.attacker)
        .ok_or(ActionError::UnknownCombatant(req.attacker))?;
    let target = state
        .combatant(req.target)
        .ok_or(ActionError::UnknownCombatant(req.target))?;
    if req.attacker == req.target {
        return Err(ActionError::invalid("cannot attack yourself"));
    }

    let range = req.range_ft.unwrap_or(DEFAULT_REACH_FT);
    let distance = attacker
        .position
        .distance_feet(&target.position, state.grid().feet_per_square);
    if distance > range {
        return Err(ActionError::OutOfRange { distance, range });
    }

    let in_combat = state.turns().is_running();
    if in_combat && attacker.resources.attacks_remaining == 0 && attacker.resources.actions == 0 {
        return Err(ActionError::NoResource("action"));
    }
    if let Some(d20) = req.d20 {
        if !(1..=20).contains(&d20) {
            return Err(ActionError::invalid("a d20 roll must be between 1 and 20"));
        }
    }
    if req.damage.is_none() && req.damage_roll.is_none() {
        return Err(ActionError::invalid("attack needs damage dice or a damage roll"));
    }

    let attacker_name = attacker.name.clone();
    let target_name = target.name.clone();
    let attack_bonus = attacker.attack_bonus;
    let armor_class = target.armor_class;

    if in_combat {
        if let Some(c) = state.combatant_mut(req.attacker) {
            let r = &mut c.resources;
            if r.attacks_remaining == 0 {
                r.actions -= 1;
                r.attacks_remaining = r.attacks_per_action;
            }
            r.attacks_remaining -= 1;
        }
    }

    let d20 = match req.d20 {
        Some(d20) => d20,
        None => DiceExpr::d20().roll(state.rng()),
    };
    let total = d20 + attack_bonus;
    let critical = d20 == 20;
    let hit = d20 != 1 && (critical || total >= armor_class);

    if !hit {
        let text = format!("{attacker_name} misses {target_name} ({total} vs AC {armor_class})");
        state.push_log(text.clone(), Some(req.target));
        return Ok(Outcome::says(text));
    }

    let damage = match (req.damage_roll, req.damage) {
        (Some(rolled), _) => rolled.max(0),
        (None, Some(expr)) if critical => expr.roll_critical(state.rng()).max(0),
        (None, Some(expr)) => expr.roll(state.rng()).max(0),
        (None, None) => 0,
    };
    let outcome = state.apply_damage(req.target, damage);
    let kind = req
        .damage_type
        .map(|t| format!(" {t}"))
        .unwrap_or_default();
    let mut text = format!(
        "{attacker_name} {} {target_name} ({total} vs AC {armor_class}) for {damage}{kind} damage",
        if critical { "critically hits" } else { "hits" }
    );
    if outcome.downed {
        text.push_str(&format!(", {target_name} falls unconscious"));
    }
    state.push_log(text.clone(), Some(req.target));
    Ok(Outcome::says(text))
}

fn cast_aoe(state: &mut CombatState, origin: &Origin, req: CastAoe) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.caster)?;
    if req.cost != ActionCost::Reaction {
        require_turn(state, origin, req.caster)?;
    }

    let caster = state
        .combatant(req.caster)
        .ok_or(ActionError::UnknownCombatant(req.caster))?;
    if !state.grid().in_bounds(req.origin) {
        return Err(MoveError::OutOfBounds(req.origin).into());
    }
    if let Some(range) = req.range_ft {
        let distance = caster
            .position
            .distance_feet(&req.origin, state.grid().feet_per_square);
        if distance > range {
            return Err(ActionError::OutOfRange { distance, range });
        }
    }
    require_cost(state, req.caster, req.cost)?;
    if let Some(level) = req.slot_level {
        let left = caster.resources.spell_slots.get(&level).map_or(0, |s| s.current);
        if left == 0 {
            return Err(ActionError::NoSpellSlot(level));
        }
    }
    if req.duration_rounds == Some(0) {
        return Err(ActionError::invalid("duration must be at least one round"));
    }
    let caster_name = caster.name.clone();

    charge(state, req.caster, req.cost);
    if let Some(level) = req.slot_level {
        if let Some(slot) = state
            .combatant_mut(req.caster)
            .and_then(|c| c.resources.spell_slots.get_mut(&level))
        {
            slot.current -= 1;
        }
    }

    let mut effect = AreaEffect {
        id: 0,
        name: req.name.clone(),
        shape: req.shape,
        origin: req.origin,
        remaining_rounds: req.duration_rounds,
        move_budget_ft: req.move_budget_ft,
        moved_ft: 0,
        trigger: req.trigger,
        owner: Some(req.caster),
        automation: req.automation.clone(),
        occupants: Vec::new(),
    };
    let targets = effect.targets(&state.positions(), state.grid().feet_per_square);
    effect.occupants = targets.clone();
    state.push_log(format!("{caster_name} casts {}", req.name), None);

    // Whoever stands inside at placement is affected now, whatever the
    // trigger. Seeded occupants keep `on_enter` from firing on them again.
    if let Some(automation) = &req.automation {
        let rolls: BTreeMap<CombatantId, i32> =
            req.save_rolls.iter().map(|r| (r.target, r.total)).collect();
        resolve::resolve_save(
            state,
            &req.name,
            automation,
            &targets,
            &rolls,
            req.damage_roll,
        );
    }

    let mut message = format!("{} affects {} target(s)", req.name, targets.len());
    if effect.is_persistent() {
        let id = state.add_aoe(effect);
        message.push_str(&format!(", effect {id} placed"));
    }
    Ok(Outcome::says(message))
}

fn move_aoe(state: &mut CombatState, origin: &Origin, req: AoeMove) -> Result<Outcome, ActionError> {
    let effect = state.aoe(req.aoe).ok_or(ActionError::UnknownEffect(req.aoe))?;
    let owner = effect.owner;
    let from = effect.origin;
    let left = effect.movement_left();
    let name = effect.name.clone();

    if !state.grid().in_bounds(req.to) {
        return Err(MoveError::OutOfBounds(req.to).into());
    }
    let distance = from.distance_feet(&req.to, state.grid().feet_per_square);
    if !origin.is_desk() {
        let owner = owner.ok_or(ActionError::DeskOnly)?;
        origin.authorize(state, owner)?;
        require_turn(state, origin, owner)?;
        let left = left.ok_or_else(|| ActionError::invalid(format!("{name} cannot be moved")))?;
        if distance > left {
            return Err(ActionError::EffectBudget {
                needed: distance,
                left,
            });
        }
    }

    if let Some(effect) = state.aoe_mut(req.aoe) {
        effect.origin = req.to;
        if !origin.is_desk() {
            effect.moved_ft += distance;
        }
    }
    let text = format!("{name} moves to {} ({distance} ft)", req.to);
    state.push_log(text.clone(), None);
    Ok(Outcome::says(text))
}

fn remove_aoe(state: &mut CombatState, origin: &Origin, req: AoeRemove) -> Result<Outcome, ActionError> {
    let effect = state.aoe(req.aoe).ok_or(ActionError::UnknownEffect(req.aoe))?;
    if !origin.is_desk() {
        let owner = effect.owner.ok_or(ActionError::DeskOnly)?;
        origin.authorize(state, owner)?;
    }
    let name = effect.name.clone();
    state.remove_aoe(req.aoe);
    let text = format!("{name} ends");
    state.push_log(text.clone(), None);
    Ok(Outcome::says(text))
}

fn use_action(
    state: &mut CombatState,
    origin: &Origin,
    req: UseAction,
    cost: ActionCost,
) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.combatant)?;
    require_turn(state, origin, req.combatant)?;
    require_cost(state, req.combatant, cost)?;
    let action = req.action.trim().to_ascii_lowercase();
    if action.is_empty() {
        return Err(ActionError::invalid("name the action"));
    }

    charge(state, req.combatant, cost);
    let Some(c) = state.combatant_mut(req.combatant) else {
        return Err(ActionError::UnknownCombatant(req.combatant));
    };
    match action.as_str() {
        "dash" => c.resources.movement_remaining += c.resources.movement_total,
        "dodge" => c.conditions.add("dodging", None, Some(req.combatant)),
        "disengage" => c.conditions.add("disengaged", Some(1), Some(req.combatant)),
        _ => {}
    }
    let text = format!("{} uses {} ({})", c.name, action, cost.as_str());
    state.push_log(text.clone(), Some(req.combatant));
    Ok(Outcome::says(text))
}

fn use_reaction(state: &mut CombatState, origin: &Origin, req: UseReaction) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.combatant)?;
    if let Some(target) = req.target {
        if !state.contains(target) {
            return Err(ActionError::UnknownCombatant(target));
        }
    }
    require_cost(state, req.combatant, ActionCost::Reaction)?;

    charge(state, req.combatant, ActionCost::Reaction);
    let name = state
        .combatant(req.combatant)
        .map(|c| c.name.clone())
        .unwrap_or_default();
    let text = match req.target.and_then(|t| state.combatant(t)) {
        Some(t) => format!("{name} reacts with {} against {}", req.reaction, t.name),
        None => format!("{name} reacts with {}", req.reaction),
    };
    state.push_log(text.clone(), Some(req.combatant));
    Ok(Outcome::says(text))
}

fn use_pool(state: &mut CombatState, origin: &Origin, req: UsePool) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.combatant)?;
    if req.amount == 0 {
        return Err(ActionError::invalid("amount must be positive"));
    }
    let Some(c) = state.combatant_mut(req.combatant) else {
        return Err(ActionError::UnknownCombatant(req.combatant));
    };
    let left = c.resources.pools.get(&req.pool).copied().unwrap_or(0);
    if left < req.amount {
        return Err(ActionError::PoolExhausted {
            pool: req.pool,
            needed: req.amount,
            left,
        });
    }
    c.resources.pools.insert(req.pool.clone(), left - req.amount);
    let text = format!("{} spends {} {}", c.name, req.amount, req.pool);
    state.push_log(text.clone(), Some(req.combatant));
    Ok(Outcome::says(text))
}

fn summon(state: &mut CombatState, origin: &Origin, req: Summon) -> Result<Outcome, ActionError> {
    origin.authorize(state, req.summoner)?;
    if req.cost != ActionCost::Reaction {
        require_turn(state, origin, req.summoner)?;
    }
    require_cost(state, req.summoner, req.cost)?;
    let at = req.creature.position;
    if !state.grid().is_walkable(at) {
        return Err(MoveError::Blocked(at).into());
    }
    if state.occupant(at).is_some() {
        return Err(ActionError::Occupied(at));
    }
    if req.creature.max_hp <= 0 {
        return Err(ActionError::invalid("a summoned creature needs hit points"));
    }

    charge(state, req.summoner, req.cost);
    let creature_name = req.creature.name.clone();
    let id = state
        .add_summon(req.summoner, req.creature)
        .ok_or(ActionError::UnknownCombatant(req.summoner))?;
    let summoner_name = state
        .combatant(req.summoner)
        .map(|c| c.name.clone())
        .unwrap_or_default();
    let text = format!("{summoner_name} summons {creature_name}");
    state.push_log(text.clone(), Some(id));
    Ok(Outcome {
        message: text,
        summoned: Some(id),
    })
}

fn dismiss(state: &mut CombatState, origin: &Origin, id: CombatantId) -> Result<Outcome, ActionError> {
    origin.authorize(state, id)?;
    let c = state.combatant(id).ok_or(ActionError::UnknownCombatant(id))?;
    if !c.summoned {
        return Err(ActionError::invalid(format!("{} was not summoned", c.name)));
    }
    let text = format!("{} is dismissed", c.name);
    state.remove_combatant(id);
    state.push_log(text.clone(), Some(id));
    Ok(Outcome::says(text))
}

fn end_turn(state: &mut CombatState, origin: &Origin, id: CombatantId) -> Result<Outcome, ActionError> {
    origin.authorize(state, id)?;
    let turns = state.turns();
    if !turns.is_running() {
        return Err(ActionError::NoCombat);
    }
    if !turns.is_active(id) {
        return Err(ActionError::NotYourTurn(id));
    }
    if turns.has_ended(id) {
        return Err(ActionError::TurnAlreadyEnded(id));
    }

    match finish_turn(state, id)? {
        EndTurn::Waiting { remaining } => Ok(Outcome::says(format!(
            "turn ended, waiting on {} other(s)",
            remaining.len()
        ))),
        EndTurn::Advanced(_) => Ok(Outcome::says("turn ended")),
    }
}

/// Run end-of-turn effects for one member, then mark it done.
fn finish_turn(state: &mut CombatState, id: CombatantId) -> Result<EndTurn, ActionError> {
    resolve::turn_end_effects(state, id);
    if !state.contains(id) {
        // Removal already moved the pointer on.
        return Ok(EndTurn::Advanced(None));
    }
    Ok(state.end_turn(id)?)
}

fn next_turn(state: &mut CombatState) -> Result<Outcome, ActionError> {
    if !state.turns().is_running() {
        return Err(ActionError::NoCombat);
    }
    let round = state.round();
    let ending = state.turns().remaining();
    for id in ending {
        let turns = state.turns();
        if turns.is_active(id) && !turns.has_ended(id) {
            finish_turn(state, id)?;
        }
    }
    if state.round() == round && state.turns().remaining().is_empty() {
        state.advance()?;
    }
    let active = state.turns().active().to_vec();
    Ok(Outcome::says(format!(
        "round {}, active {:?}",
        state.round(),
        active
    )))
}

fn add_combatant(state: &mut CombatState, spec: CombatantSpec) -> Result<Outcome, ActionError> {
    if spec.name.trim().is_empty() {
        return Err(ActionError::invalid("a combatant needs a name"));
    }
    if spec.max_hp <= 0 {
        return Err(ActionError::invalid("a combatant needs hit points"));
    }
    if !state.grid().is_walkable(spec.position) {
        return Err(MoveError::Blocked(spec.position).into());
    }
    if state.occupant(spec.position).is_some() {
        return Err(ActionError::Occupied(spec.position));
    }
    let name = spec.name.clone();
    let id = state.add_combatant(spec);
    let text = format!("{name} joins the fight");
    state.push_log(text.clone(), Some(id));
    Ok(Outcome::says(text))
}

fn set_grid(state: &mut CombatState, grid: GridGeometry) -> Result<Outcome, ActionError> {
    if grid.cols <= 0 || grid.rows <= 0 {
        return Err(ActionError::invalid("grid needs positive dimensions"));
    }
    if let Some(c) = state.combatants().find(|c| !grid.is_walkable(c.position)) {
        return Err(ActionError::invalid(format!(
            "{} would be off the map or inside an obstacle",
            c.name
        )));
    }
    state.set_grid(grid);
    Ok(Outcome::says(format!("grid version {}", state.grid_version())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Side, TurnError};
    use pretty_assertions::assert_eq;

    /// Aria (PC, init 15) at (0,0), Goblin (enemy, init 10) at (1,0).
    fn setup() -> CombatState {
        let mut state = CombatState::new(GridGeometry::new(10, 10), Some(7));
        state.add_combatant(
            CombatantSpec::new("Aria", Side::PlayerCharacter, 20, Position::new(0, 0))
                .with_initiative(15, 12),
        );
        state.add_combatant(
            CombatantSpec::new("Goblin", Side::Enemy, 7, Position::new(1, 0))
                .with_initiative(10, 14)
                .with_armor_class(13),
        );
        state
    }

    fn session(claimed: &[CombatantId]) -> Origin {
        Origin::Session {
            conn: 1,
            signed_in: true,
            claimed: claimed.iter().copied().collect(),
        }
    }

    fn started() -> CombatState {
        let mut state = setup();
        dispatch(&mut state, &Origin::Desk, Command::StartCombat).unwrap();
        state
    }

    fn mv(combatant: CombatantId, x: i32, y: i32) -> Command {
        Command::Move(MoveRequest {
            combatant,
            to: Position::new(x, y),
        })
    }

    #[test]
    fn test_claim_is_checked_first() {
        let mut state = started();
        let err = dispatch(&mut state, &session(&[2]), mv(1, 0, 1)).unwrap_err();
        assert_eq!(err, ActionError::NotYourCombatant(1));

        let anonymous = Origin::Session {
            conn: 1,
            signed_in: false,
            claimed: BTreeSet::new(),
        };
        let err = dispatch(&mut state, &anonymous, mv(1, 0, 1)).unwrap_err();
        assert_eq!(err, ActionError::NotSignedIn);
    }

    #[test]
    fn test_move_charges_movement() {
        let mut state = started();
        dispatch(&mut state, &session(&[1]), mv(1, 1, 1)).unwrap();

        let aria = state.combatant(1).unwrap();
        assert_eq!(aria.position, Position::new(1, 1));
        assert_eq!(aria.resources.movement_remaining, 25);
    }

    #[test]
    fn test_move_rejected_out_of_turn_changes_nothing() {
        let mut state = started();
        let before = state.combatant(2).unwrap().clone();

        let err = dispatch(&mut state, &session(&[2]), mv(2, 2, 0)).unwrap_err();
        assert_eq!(err, ActionError::NotYourTurn(2));
        assert_eq!(state.combatant(2).unwrap(), &before);
    }

    #[test]
    fn test_move_over_budget() {
        let mut state = started();
        let err = dispatch(&mut state, &session(&[1]), mv(1, 0, 7)).unwrap_err();
        assert_eq!(
            err,
            ActionError::NotEnoughMovement {
                cost: 35,
                remaining: 30
            }
        );
        assert_eq!(state.combatant(1).unwrap().position, Position::new(0, 0));
    }

    #[test]
    fn test_move_into_occupied_cell() {
        let mut state = started();
        let err = dispatch(&mut state, &session(&[1]), mv(1, 1, 0)).unwrap_err();
        assert_eq!(err, ActionError::Occupied(Position::new(1, 0)));
    }

    #[test]
    fn test_dash_adds_movement() {
        let mut state = started();
        let dash = Command::UseAction(UseAction {
            combatant: 1,
            action: "Dash".to_string(),
        });
        dispatch(&mut state, &session(&[1]), dash.clone()).unwrap();
        assert_eq!(state.combatant(1).unwrap().resources.movement_remaining, 60);
        assert_eq!(
            dispatch(&mut state, &session(&[1]), dash).unwrap_err(),
            ActionError::NoResource("action")
        );
    }

    #[test]
    fn test_attack_hits_and_uses_action() {
        let mut state = started();
        let req = AttackRequest {
            attacker: 1,
            target: 2,
            d20: Some(15),
            damage: None,
            damage_roll: Some(4),
            damage_type: Some("slashing".to_string()),
            range_ft: None,
        };
        dispatch(&mut state, &session(&[1]), Command::Attack(req.clone())).unwrap();
        assert_eq!(state.combatant(2).unwrap().resources.hp, 3);
        assert_eq!(state.combatant(1).unwrap().resources.actions, 0);

        let err = dispatch(&mut state, &session(&[1]), Command::Attack(req)).unwrap_err();
        assert_eq!(err, ActionError::NoResource("action"));
    }

    #[test]
    fn test_attack_miss_and_range() {
        let mut state = started();
        let miss = AttackRequest {
            attacker: 1,
            target: 2,
            d20: Some(1),
            damage: Some(DiceExpr::new(1, 8, 0)),
            damage_roll: None,
            damage_type: None,
            range_ft: None,
        };
        dispatch(&mut state, &session(&[1]), Command::Attack(miss)).unwrap();
        assert_eq!(state.combatant(2).unwrap().resources.hp, 7);

        state.combatant_mut(2).unwrap().position = Position::new(5, 0);
        let far = AttackRequest {
            attacker: 1,
            target: 2,
            d20: Some(10),
            damage: Some(DiceExpr::new(1, 8, 0)),
            damage_roll: None,
            damage_type: None,
            range_ft: None,
        };
        let err = dispatch(&mut state, &session(&[1]), Command::Attack(far)).unwrap_err();
        assert_eq!(
            err,
            ActionError::OutOfRange {
                distance: 25,
                range: 5
            }
        );
    }

    #[test]
    fn test_killing_blow_removes_enemy() {
        let mut state = started();
        let req = AttackRequest {
            attacker: 1,
            target: 2,
            d20: Some(20),
            damage: None,
            damage_roll: Some(30),
            damage_type: None,
            range_ft: None,
        };
        dispatch(&mut state, &session(&[1]), Command::Attack(req)).unwrap();
        assert!(!state.contains(2));
        assert_eq!(state.take_removed(), vec![2]);
    }

    fn cloud(trigger: Trigger, at: Position, move_budget_ft: Option<u32>) -> CastAoe {
        CastAoe {
            caster: 1,
            name: "Cloud".to_string(),
            shape: Shape::Circle { radius_ft: 5 },
            origin: at,
            trigger,
            duration_rounds: Some(3),
            move_budget_ft,
            range_ft: None,
            slot_level: None,
            cost: ActionCost::Free,
            automation: None,
            save_rolls: Vec::new(),
            damage_roll: None,
        }
    }

    /// Always failed, flat 4 damage.
    fn sting() -> SaveAutomation {
        SaveAutomation {
            ability: "con".to_string(),
            dc: 30,
            damage: Some(DiceExpr::new(0, 0, 4)),
            damage_type: None,
            half_on_success: false,
            condition: None,
        }
    }

    fn aoe_id(state: &CombatState) -> AoeId {
        state.aoes().next().map(|a| a.id).unwrap()
    }

    fn aoe_move(aoe: AoeId, x: i32, y: i32) -> Command {
        Command::AoeMove(AoeMove {
            aoe,
            to: Position::new(x, y),
        })
    }

    #[test]
    fn test_persistent_cast_hits_targets_inside() {
        for trigger in [Trigger::TurnEnd, Trigger::OnEnter] {
            let mut state = started();
            let mut req = cloud(trigger, Position::new(2, 0), None);
            req.automation = Some(sting());
            dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();

            // Goblin at (1,0) is inside, Aria at (0,0) is not.
            assert_eq!(state.combatant(2).unwrap().resources.hp, 3, "{trigger:?}");
            assert_eq!(state.combatant(1).unwrap().resources.hp, 20, "{trigger:?}");
            assert_eq!(state.aoes().count(), 1);
        }
    }

    #[test]
    fn test_aoe_move_spends_budget() {
        let mut state = started();
        let req = cloud(Trigger::TurnEnd, Position::new(5, 5), Some(10));
        dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();
        let id = aoe_id(&state);

        dispatch(&mut state, &session(&[1]), aoe_move(id, 6, 5)).unwrap();
        assert_eq!(state.aoe(id).unwrap().moved_ft, 5);

        let err = dispatch(&mut state, &session(&[1]), aoe_move(id, 8, 5)).unwrap_err();
        assert_eq!(err, ActionError::EffectBudget { needed: 10, left: 5 });
        assert_eq!(state.aoe(id).unwrap().origin, Position::new(6, 5));

        // The desk is not bound by the budget.
        dispatch(&mut state, &Origin::Desk, aoe_move(id, 9, 9)).unwrap();
        assert_eq!(state.aoe(id).unwrap().origin, Position::new(9, 9));
        assert_eq!(state.aoe(id).unwrap().moved_ft, 5);
    }

    #[test]
    fn test_aoe_move_requires_owner() {
        let mut state = started();
        let req = cloud(Trigger::TurnEnd, Position::new(5, 5), Some(10));
        dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();
        let id = aoe_id(&state);

        let err = dispatch(&mut state, &session(&[2]), aoe_move(id, 6, 5)).unwrap_err();
        assert_eq!(err, ActionError::NotYourCombatant(1));
        let err = dispatch(&mut state, &session(&[1]), aoe_move(99, 6, 5)).unwrap_err();
        assert_eq!(err, ActionError::UnknownEffect(99));
    }

    #[test]
    fn test_aoe_budget_resets_on_owner_turn() {
        let mut state = started();
        let req = cloud(Trigger::TurnEnd, Position::new(5, 5), Some(10));
        dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();
        let id = aoe_id(&state);
        dispatch(&mut state, &session(&[1]), aoe_move(id, 7, 5)).unwrap();
        assert_eq!(state.aoe(id).unwrap().movement_left(), Some(0));

        let end = |id| Command::EndTurn(CombatantRef { combatant: id });
        dispatch(&mut state, &session(&[1]), end(1)).unwrap();
        dispatch(&mut state, &session(&[2]), end(2)).unwrap();
        assert_eq!(state.turns().active(), &[1]);

        assert_eq!(state.aoe(id).unwrap().movement_left(), Some(10));
        dispatch(&mut state, &session(&[1]), aoe_move(id, 9, 5)).unwrap();
    }

    #[test]
    fn test_on_enter_fires_after_aoe_move() {
        let mut state = started();
        let mut req = cloud(Trigger::OnEnter, Position::new(5, 5), Some(30));
        req.automation = Some(sting());
        dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();
        assert_eq!(state.combatant(2).unwrap().resources.hp, 7);

        let id = aoe_id(&state);
        dispatch(&mut state, &session(&[1]), aoe_move(id, 2, 0)).unwrap();
        assert_eq!(state.combatant(2).unwrap().resources.hp, 3);
        assert_eq!(state.aoe(id).unwrap().occupants, vec![2]);
    }

    #[test]
    fn test_remove_aoe() {
        let mut state = started();
        let req = cloud(Trigger::TurnEnd, Position::new(5, 5), None);
        dispatch(&mut state, &session(&[1]), Command::CastAoe(req)).unwrap();
        let id = aoe_id(&state);
        let remove = |aoe| Command::AoeRemove(AoeRemove { aoe });

        let err = dispatch(&mut state, &session(&[2]), remove(id)).unwrap_err();
        assert_eq!(err, ActionError::NotYourCombatant(1));
        assert_eq!(state.aoes().count(), 1);

        let outcome = dispatch(&mut state, &session(&[1]), remove(id)).unwrap();
        assert_eq!(outcome.message, "Cloud ends");
        assert_eq!(state.aoes().count(), 0);
        assert_eq!(
            dispatch(&mut state, &session(&[1]), remove(id)).unwrap_err(),
            ActionError::UnknownEffect(id)
        );
    }

    #[test]
    fn test_end_turn_advances() {
        let mut state = started();
        let end = |id| Command::EndTurn(CombatantRef { combatant: id });

        assert_eq!(
            dispatch(&mut state, &session(&[2]), end(2)).unwrap_err(),
            ActionError::NotYourTurn(2)
        );
        dispatch(&mut state, &session(&[1]), end(1)).unwrap();
        assert_eq!(state.turns().active(), &[2]);
    }

    #[test]
    fn test_reaction_ignores_turn() {
        let mut state = started();
        let react = Command::UseReaction(UseReaction {
            combatant: 2,
            reaction: "opportunity attack".to_string(),
            target: Some(1),
        });
        dispatch(&mut state, &session(&[2]), react.clone()).unwrap();
        assert_eq!(state.combatant(2).unwrap().resources.reactions, 0);
        assert_eq!(
            dispatch(&mut state, &session(&[2]), react).unwrap_err(),
            ActionError::NoResource("reaction")
        );
    }

    #[test]
    fn test_desk_only_commands() {
        let mut state = setup();
        assert_eq!(
            dispatch(&mut state, &session(&[1]), Command::StartCombat).unwrap_err(),
            ActionError::DeskOnly
        );
        assert_eq!(
            dispatch(&mut state, &Origin::Desk, Command::EndCombat).unwrap_err(),
            ActionError::Turn(TurnError::NotActive)
        );
    }

    #[test]
    fn test_summon_and_dismiss() {
        let mut state = started();
        let req = Summon {
            summoner: 1,
            creature: CombatantSpec::new("Wolf", Side::PlayerCharacter, 11, Position::new(0, 1)),
            cost: ActionCost::Action,
        };
        let outcome = dispatch(&mut state, &session(&[1]), Command::Summon(req)).unwrap();
        let wolf = outcome.summoned.unwrap();
        assert!(state.turns().is_active(wolf));

        // The summoner controls the wolf without claiming it.
        dispatch(&mut state, &session(&[1]), mv(wolf, 0, 2)).unwrap();
        dispatch(
            &mut state,
            &session(&[1]),
            Command::Dismiss(CombatantRef { combatant: wolf }),
        )
        .unwrap();
        assert!(!state.contains(wolf));

        let err = dispatch(
            &mut state,
            &session(&[1]),
            Command::Dismiss(CombatantRef { combatant: 1 }),
        )
        .unwrap_err();
        assert_eq!(err, ActionError::invalid("Aria was not summoned"));
    }

    #[test]
    fn test_use_pool() {
        let mut state = started();
        state
            .combatant_mut(1)
            .unwrap()
            .resources
            .pools
            .insert("ki".to_string(), 2);
        let spend = |amount| {
            Command::UsePool(UsePool {
                combatant: 1,
                pool: "ki".to_string(),
                amount,
            })
        };
        dispatch(&mut state, &session(&[1]), spend(2)).unwrap();
        assert_eq!(
            dispatch(&mut state, &session(&[1]), spend(1)).unwrap_err(),
            ActionError::PoolExhausted {
                pool: "ki".to_string(),
                needed: 1,
                left: 0
            }
        );
    }

    #[test]
    fn test_next_turn_from_desk() {
        let mut state = started();
        dispatch(&mut state, &Origin::Desk, Command::NextTurn).unwrap();
        assert_eq!(state.turns().active(), &[2]);
        dispatch(&mut state, &Origin::Desk, Command::NextTurn).unwrap();
        assert_eq!(state.turns().active(), &[1]);
        assert_eq!(state.round(), 2);
    }

    #[test]
    fn test_set_grid_rejects_stranding() {
        let mut state = setup();
        let err = dispatch(
            &mut state,
            &Origin::Desk,
            Command::SetGrid(GridGeometry::new(1, 1)),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ActionError::invalid("Goblin would be off the map or inside an obstacle")
        );
        assert_eq!(state.grid_version(), 1);
    }
}
