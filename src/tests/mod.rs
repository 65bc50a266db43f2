//! End-to-end scenarios driven through the engine, the way the bridge
//! drives it, without sockets or threads.


use std::time::{Duration, Instant};

use crate::actions::Command;
use crate::engine::{Engine, Inbound};
use crate::protocol::{ClientMessage, Outgoing};
use crate::state::{AccountStore, CombatState, CombatantId, ConnId, Registry};

pub(crate) struct Table {
    pub engine: Engine,
    pub now: Instant,
}

impl Table {
    pub fn new(state: CombatState) -> Self {
        Self::with_resend(state, Duration::from_millis(1500))
    }

    pub fn with_resend(state: CombatState, resend: Duration) -> Self {
        Self {
            engine: Engine::new(state, Registry::new(AccountStore::in_memory()), resend),
            now: Instant::now(),
        }
    }

    pub fn connect(&mut self, conn: ConnId) -> Vec<Outgoing> {
        self.engine
            .handle(Inbound::Connected { conn, peer: None }, self.now)
    }

    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Outgoing> {
        self.engine.handle(Inbound::Disconnected { conn }, self.now)
    }

    pub fn send(&mut self, conn: ConnId, msg: ClientMessage) -> Vec<Outgoing> {
        self.engine.handle(Inbound::Message { conn, msg }, self.now)
    }

    pub fn desk(&mut self, command: Command) -> Vec<Outgoing> {
        self.engine.handle(Inbound::Desk(command), self.now)
    }

    pub fn tick(&mut self) -> Vec<Outgoing> {
        self.engine.tick(self.now)
    }

    /// Connect, sign in, and claim in one go.
    pub fn seat(&mut self, conn: ConnId, username: &str, combatant: CombatantId) {
        self.connect(conn);
        self.send(conn, hello(username, None, None));
        self.send(
            conn,
            ClientMessage::Claim {
                combatant,
                force: false,
            },
        );
    }
}

pub(crate) fn hello(
    username: &str,
    client_id: Option<&str>,
    remembered_claim: Option<CombatantId>,
) -> ClientMessage {
    ClientMessage::Hello {
        username: Some(username.to_string()),
        client_id: client_id.map(str::to_string),
        remembered_claim,
    }
}

/// Frames of one `type`.
pub(crate) fn of_kind<'a>(out: &'a [Outgoing], kind: &str) -> Vec<&'a Outgoing> {
    out.iter().filter(|o| o.kind() == kind).collect()
}

/// `(level, message)` of every toast addressed to `conn`.
pub(crate) fn toasts(out: &[Outgoing], conn: ConnId) -> Vec<(String, String)> {
    of_kind(out, "toast")
        .into_iter()
        .filter(|o| o.is_for(conn))
        .map(|o| {
            let json = o.json();
            (
                json["level"].as_str().unwrap_or_default().to_string(),
                json["message"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// A combatant's entry in a `state` frame.
pub(crate) fn combatant_json(state: &Outgoing, id: CombatantId) -> serde_json::Value {
    state.json()["combatants"]
        .as_array()
        .and_then(|list| list.iter().find(|c| c["id"] == id).cloned())
        .unwrap_or_default()
}
