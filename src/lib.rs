//! TableSync
//!
//! A session server for turn-based tabletop combat. Players connect over
//! WebSocket, claim their characters, and act on a shared square grid while
//! the game master drives the encounter from a local desk.
//!
//! # Overview
//!
//! - **Sessions and claims** - Named accounts, exclusive control of
//!   characters, automatic reclaim on reconnect, forced takeovers.
//!
//! - **Turns** - Initiative order with grouped turns: same-side ties act
//!   together, and the group advances once every member has ended.
//!
//! - **Actions** - Movement with pathfinding, attacks, area effects with
//!   saving-throw automation, resources, reactions and summons. Every
//!   command is validated against ownership, turn, and cost before it
//!   changes anything.
//!
//! - **Synchronization** - Full snapshots broadcast only when something
//!   changed, plus a versioned grid channel that is resent until each
//!   client acknowledges it.
//!
//! # Design Principles
//!
//! 1. **One writer** - All combat state lives on the simulation thread.
//!    Network tasks only parse and forward.
//!
//! 2. **Typed at the edge** - Frames become [`protocol::ClientMessage`] or
//!    are rejected before they reach the engine.
//!
//! 3. **Explicit outcomes** - Every command produces a toast for its sender,
//!    accepted or not.
//!
//! # Example
//!
//! ```rust
//! use std::time::{Duration, Instant};
//!
//! use tablesync::engine::{Engine, Inbound};
//! use tablesync::protocol::ClientMessage;
//! use tablesync::state::{
//!     AccountStore, CombatState, CombatantSpec, GridGeometry, Position, Registry, Side,
//! };
//!
//! let mut state = CombatState::new(GridGeometry::new(10, 10), Some(7));
//! let aria = state.add_combatant(CombatantSpec::new(
//!     "Aria",
//!     Side::PlayerCharacter,
//!     24,
//!     Position::new(0, 0),
//! ));
//!
//! let registry = Registry::new(AccountStore::in_memory());
//! let mut engine = Engine::new(state, registry, Duration::from_millis(1500));
//! let now = Instant::now();
//!
//! engine.handle(Inbound::Connected { conn: 1, peer: None }, now);
//! engine.handle(
//!     Inbound::Message {
//!         conn: 1,
//!         msg: ClientMessage::Hello {
//!             username: Some("aria".to_string()),
//!             client_id: None,
//!             remembered_claim: None,
//!         },
//!     },
//!     now,
//! );
//! engine.handle(
//!     Inbound::Message {
//!         conn: 1,
//!         msg: ClientMessage::Claim { combatant: aria, force: false },
//!     },
//!     now,
//! );
//!
//! assert_eq!(engine.registry().owner_of(aria), Some("aria"));
//! ```

pub mod actions;
pub mod bridge;
pub mod config;
pub mod dice;
pub mod engine;
pub mod error;
pub mod movement;
pub mod protocol;
pub mod state;
pub mod sync;

#[cfg(test)]
mod tests;
