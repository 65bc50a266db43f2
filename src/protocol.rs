//! Wire protocol.
//!
//! Every frame is one JSON object tagged with `type`. Inbound frames are
//! parsed into [`ClientMessage`] at the connection boundary; a frame that
//! does not parse never reaches the simulation.

use serde::{Deserialize, Serialize};

use crate::actions::{
    AoeMove, AoeRemove, AttackRequest, CastAoe, CombatantRef, MoveRequest, Summon, UseAction,
    UsePool, UseReaction,
};
use crate::state::{CombatantId, ConnId, GridGeometry, LogEntry};
use crate::sync::Snapshot;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        username: Option<String>,
        /// Stable per-device id the client keeps across reconnects.
        #[serde(default)]
        client_id: Option<String>,
        /// Claim the client remembers holding.
        #[serde(default)]
        remembered_claim: Option<CombatantId>,
    },
    Claim {
        combatant: CombatantId,
        #[serde(default)]
        force: bool,
    },
    Unclaim {
        combatant: CombatantId,
    },
    UnclaimAck {
        combatant: CombatantId,
    },
    Move(MoveRequest),
    AttackRequest(AttackRequest),
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
    GridAck {
        version: u64,
    },
    SavePreset {
        preset: serde_json::Value,
    },
    LoadPreset,
    Ping {
        #[serde(default)]
        nonce: Option<u64>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Claim { .. } => "claim",
            Self::Unclaim { .. } => "unclaim",
            Self::UnclaimAck { .. } => "unclaim_ack",
            Self::Move(_) => "move",
            Self::AttackRequest(_) => "attack_request",
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
            Self::GridAck { .. } => "grid_ack",
            Self::SavePreset { .. } => "save_preset",
            Self::LoadPreset => "load_preset",
            Self::Ping { .. } => "ping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    Error,
}

/// Server → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    /// Full snapshot, including the claimable list.
    State(&'a Snapshot),
    /// Versioned geometry; the client answers with `grid_ack`.
    GridUpdate {
        version: u64,
        grid: &'a GridGeometry,
    },
    Toast {
        level: ToastLevel,
        message: String,
    },
    /// The server gave this connection a combatant.
    ForceClaim {
        combatant: CombatantId,
    },
    /// The connection lost a combatant; answer with `unclaim_ack`.
    ForceUnclaim {
        combatant: CombatantId,
        #[serde(skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    BattleLog {
        entries: &'a [LogEntry],
    },
    Preset {
        preset: &'a serde_json::Value,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },
}

impl ServerMessage<'_> {
    pub fn info(message: impl Into<String>) -> ServerMessage<'static> {
        ServerMessage::Toast {
            level: ToastLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> ServerMessage<'static> {
        ServerMessage::Toast {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Where an outgoing frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Conn(ConnId),
}

/// An encoded frame on its way to the network side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: Target,
    pub text: String,
}

impl Outgoing {
    pub fn all(msg: &ServerMessage<'_>) -> Self {
        Self {
            target: Target::All,
            text: msg.encode(),
        }
    }

    pub fn to(conn: ConnId, msg: &ServerMessage<'_>) -> Self {
        Self {
            target: Target::Conn(conn),
            text: msg.encode(),
        }
    }

    /// Decode the frame back into JSON, for tests and diagnostics.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.text).unwrap_or_default()
    }

    pub fn kind(&self) -> String {
        self.json()["type"].as_str().unwrap_or_default().to_string()
    }

    pub fn is_for(&self, conn: ConnId) -> bool {
        match self.target {
            Target::All => true,
            Target::Conn(c) => c == conn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Position, Shape};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_hello() {
        let msg = ClientMessage::parse(
            r#"{"type": "hello", "username": "aria", "client_id": "phone-1", "remembered_claim": 3}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello {
                username: Some("aria".to_string()),
                client_id: Some("phone-1".to_string()),
                remembered_claim: Some(3),
            }
        );
    }

    #[test]
    fn test_parse_move_and_cast() {
        let msg = ClientMessage::parse(r#"{"type": "move", "combatant": 1, "to": {"x": 2, "y": 3}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Move(MoveRequest {
                combatant: 1,
                to: Position::new(2, 3)
            })
        );

        let msg = ClientMessage::parse(
            r#"{"type": "cast_aoe", "caster": 1, "name": "Fireball",
                "shape": {"kind": "circle", "radius_ft": 20}, "origin": {"x": 5, "y": 5},
                "slot_level": 3,
                "automation": {"ability": "dex", "dc": 15, "damage": "8d6", "damage_type": "fire"},
                "save_rolls": [{"target": 2, "total": 9}]}"#,
        )
        .unwrap();
        let ClientMessage::CastAoe(cast) = msg else {
            panic!("expected cast_aoe");
        };
        assert_eq!(cast.shape, Shape::Circle { radius_ft: 20 });
        assert_eq!(cast.slot_level, Some(3));
        assert!(cast.automation.unwrap().half_on_success);
        assert_eq!(cast.save_rolls[0].total, 9);
    }

    #[test]
    fn test_parse_summon_with_slots() {
        let msg = ClientMessage::parse(
            r#"{"type": "summon", "summoner": 1,
                "creature": {"name": "Imp", "max_hp": 10, "position": {"x": 0, "y": 1},
                             "spell_slots": {"1": 2}}}"#,
        )
        .unwrap();
        let ClientMessage::Summon(summon) = msg else {
            panic!("expected summon");
        };
        assert_eq!(summon.creature.spell_slots.get(&1), Some(&2));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::parse(r#"{"type": "teleport"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_encode_toast() {
        let out = Outgoing::to(4, &ServerMessage::error("it is not your turn"));
        assert_eq!(out.target, Target::Conn(4));
        assert_eq!(
            out.json(),
            serde_json::json!({"type": "toast", "level": "error", "message": "it is not your turn"})
        );
        assert_eq!(out.kind(), "toast");
    }
}
