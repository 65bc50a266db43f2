//! Errors returned by the action pipeline.
//!
//! The `Display` text of every variant is what the originating client is
//! shown in a `toast`.

use thiserror::Error;

use crate::movement::MoveError;
use crate::state::{AoeId, CombatantId, Position, RegistryError, TurnError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    // Authentication
    #[error("sign in first")]
    NotSignedIn,

    // Ownership
    #[error("you do not control that character")]
    NotYourCombatant(CombatantId),

    #[error("only the game master can do that")]
    DeskOnly,

    // Turn
    #[error("combat has not started")]
    NoCombat,

    #[error("it is not your turn")]
    NotYourTurn(CombatantId),

    #[error("you have already ended your turn")]
    TurnAlreadyEnded(CombatantId),

    // Resources
    #[error("no {0} left this turn")]
    NoResource(&'static str),

    #[error("not enough movement: need {cost} ft, {remaining} ft left")]
    NotEnoughMovement { cost: u32, remaining: u32 },

    #[error("no level {0} spell slots left")]
    NoSpellSlot(u8),

    #[error("not enough {pool}: need {needed}, have {left}")]
    PoolExhausted {
        pool: String,
        needed: u32,
        left: u32,
    },

    #[error("that effect cannot move any further this turn")]
    EffectBudget { needed: u32, left: u32 },

    // Targets
    #[error("no such character {0}")]
    UnknownCombatant(CombatantId),

    #[error("no such effect {0}")]
    UnknownEffect(AoeId),

    #[error(transparent)]
    Unreachable(#[from] MoveError),

    #[error("{0} is occupied")]
    Occupied(Position),

    #[error("target is out of range ({distance} ft, range {range} ft)")]
    OutOfRange { distance: u32, range: u32 },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Turn(#[from] TurnError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ActionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Short machine-readable category for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotSignedIn => "authentication",
            Self::NotYourCombatant(_) | Self::DeskOnly => "ownership",
            Self::Registry(RegistryError::OwnedBy { .. }) => "ownership",
            Self::Registry(RegistryError::MissingUsername | RegistryError::InvalidUsername(_)) => {
                "authentication"
            }
            Self::Registry(_) => "registry",
            Self::NoCombat | Self::NotYourTurn(_) | Self::TurnAlreadyEnded(_) | Self::Turn(_) => {
                "turn"
            }
            Self::NoResource(_)
            | Self::NotEnoughMovement { .. }
            | Self::NoSpellSlot(_)
            | Self::PoolExhausted { .. }
            | Self::EffectBudget { .. } => "resource",
            Self::UnknownCombatant(_)
            | Self::UnknownEffect(_)
            | Self::Unreachable(_)
            | Self::Occupied(_)
            | Self::OutOfRange { .. }
            | Self::Invalid(_) => "target",
        }
    }
}
