//! The simulation driver.
//!
//! `Engine` owns the combat state, the claim registry and the synchronizer.
//! It is strictly single-threaded: the bridge feeds it [`Inbound`] events in
//! arrival order and calls [`Engine::tick`] on a fixed interval, shipping
//! whatever [`Outgoing`] frames come back to the network side. Tests drive it
//! the same way without any threads.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::actions::{dispatch, Command, Origin};
use crate::error::ActionError;
use crate::protocol::{ClientMessage, Outgoing, ServerMessage};
use crate::state::{CombatState, CombatantId, ConnId, Registry, Side};
use crate::sync::{Snapshot, Synchronizer};

/// Events crossing from the network side into the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connected {
        conn: ConnId,
        peer: Option<SocketAddr>,
    },
    Message {
        conn: ConnId,
        msg: ClientMessage,
    },
    /// A command from the local control surface.
    Desk(Command),
    Disconnected {
        conn: ConnId,
    },
}

pub struct Engine {
    state: CombatState,
    registry: Registry,
    sync: Synchronizer,
    /// How often an unacknowledged `force_unclaim` is repeated.
    loss_resend: Duration,
}

impl Engine {
    pub fn new(state: CombatState, registry: Registry, resend_interval: Duration) -> Self {
        Self {
            state,
            registry,
            sync: Synchronizer::new(resend_interval),
            loss_resend: resend_interval,
        }
    }

    pub fn state(&self) -> &CombatState {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::build(&self.state, &self.registry)
    }

    /// Apply one inbound event. Replies meant only for the sender come back
    /// immediately; broadcasts wait for the next tick.
    pub fn handle(&mut self, inbound: Inbound, now: Instant) -> Vec<Outgoing> {
        match inbound {
            Inbound::Connected { conn, peer } => {
                self.registry.connect(conn);
                info!(
                    conn,
                    peer = ?peer,
                    sessions = self.registry.session_count(),
                    "client connected"
                );
                let snapshot = self.snapshot();
                self.sync.join(conn, &self.state, &snapshot, now)
            }
            Inbound::Disconnected { conn } => {
                let (connected_for, idle) = self
                    .registry
                    .session(conn)
                    .map(|s| (s.connected_at.elapsed(), s.idle_time()))
                    .unwrap_or_default();
                let released = self.registry.disconnect(conn);
                self.sync.leave(conn);
                info!(
                    conn,
                    released = ?released,
                    connected_s = connected_for.as_secs(),
                    idle_s = idle.as_secs(),
                    "client disconnected"
                );
                Vec::new()
            }
            Inbound::Message { conn, msg } => {
                let Some(session) = self.registry.session_mut(conn) else {
                    warn!(conn, kind = msg.kind(), "message from unknown connection");
                    return Vec::new();
                };
                session.touch();
                self.on_message(conn, msg)
            }
            Inbound::Desk(command) => self.run_desk(command),
        }
    }

    /// Assemble what changed since the last tick.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = self.reconcile();
        out.extend(self.sync.grid_frames(&self.state, now));

        if let Some(state) = self.sync.maybe_broadcast(self.snapshot()) {
            out.push(state);
        }

        let entries = self.state.drain_log();
        if !entries.is_empty() {
            out.push(Outgoing::all(&ServerMessage::BattleLog { entries: &entries }));
        }

        for loss in self.registry.due_loss_notices(self.loss_resend) {
            debug!(conn = loss.conn, combatant = loss.combatant, "repeating force_unclaim");
            out.push(Outgoing::to(
                loss.conn,
                &ServerMessage::ForceUnclaim {
                    combatant: loss.combatant,
                    by: self.registry.owner_of(loss.combatant).map(str::to_string),
                },
            ));
        }
        out
    }

    fn on_message(&mut self, conn: ConnId, msg: ClientMessage) -> Vec<Outgoing> {
        match msg {
            ClientMessage::Hello {
                username,
                client_id,
                remembered_claim,
            } => self.hello(conn, username, client_id, remembered_claim),
            ClientMessage::Claim { combatant, force } => self.claim(conn, combatant, force),
            ClientMessage::Unclaim { combatant } => match self.registry.unclaim(conn, combatant) {
                Ok(()) => {
                    info!(conn, combatant, "claim released");
                    vec![Outgoing::to(conn, &ServerMessage::info("released"))]
                }
                Err(e) => vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))],
            },
            ClientMessage::UnclaimAck { combatant } => {
                self.registry.acknowledge_loss(conn, combatant);
                Vec::new()
            }
            ClientMessage::GridAck { version } => {
                if !self.sync.acknowledge(conn, version) {
                    debug!(conn, version, "stale grid ack");
                }
                Vec::new()
            }
            ClientMessage::SavePreset { preset } => {
                match self.registry.save_preferences(conn, preset) {
                    Ok(()) => vec![Outgoing::to(conn, &ServerMessage::info("preset saved"))],
                    Err(e) => vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))],
                }
            }
            ClientMessage::LoadPreset => match self.registry.preferences(conn) {
                Ok(preset) => vec![Outgoing::to(conn, &ServerMessage::Preset { preset: &preset })],
                Err(e) => vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))],
            },
            ClientMessage::Ping { nonce } => {
                vec![Outgoing::to(conn, &ServerMessage::Pong { nonce })]
            }
            ClientMessage::Move(req) => self.run(conn, Command::Move(req)),
            ClientMessage::AttackRequest(req) => self.run(conn, Command::Attack(req)),
            ClientMessage::CastAoe(req) => self.run(conn, Command::CastAoe(req)),
            ClientMessage::AoeMove(req) => self.run(conn, Command::AoeMove(req)),
            ClientMessage::AoeRemove(req) => self.run(conn, Command::AoeRemove(req)),
            ClientMessage::UseAction(req) => self.run(conn, Command::UseAction(req)),
            ClientMessage::UseBonusAction(req) => self.run(conn, Command::UseBonusAction(req)),
            ClientMessage::UseReaction(req) => self.run(conn, Command::UseReaction(req)),
            ClientMessage::UsePool(req) => self.run(conn, Command::UsePool(req)),
            ClientMessage::Summon(req) => self.run(conn, Command::Summon(req)),
            ClientMessage::Dismiss(req) => self.run(conn, Command::Dismiss(req)),
            ClientMessage::EndTurn(req) => self.run(conn, Command::EndTurn(req)),
        }
    }

    fn hello(
        &mut self,
        conn: ConnId,
        username: Option<String>,
        client_id: Option<String>,
        remembered_claim: Option<CombatantId>,
    ) -> Vec<Outgoing> {
        let state = &self.state;
        let result = self.registry.hello(
            conn,
            username.as_deref(),
            client_id.as_deref(),
            remembered_claim,
            |id| state.contains(id),
        );
        let hello = match result {
            Ok(hello) => hello,
            Err(e) => {
                warn!(conn, err = %e, "hello rejected");
                return vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))];
            }
        };

        info!(
            conn,
            username = %hello.username,
            created = hello.account_created,
            reattached = ?hello.reattached,
            released = ?hello.released,
            "signed in"
        );
        let mut out = vec![Outgoing::to(
            conn,
            &ServerMessage::info(format!("signed in as {}", hello.username)),
        )];
        if let Some(combatant) = hello.reattached {
            out.push(Outgoing::to(conn, &ServerMessage::ForceClaim { combatant }));
        }
        if let Some(lost) = hello.dispossessed {
            out.push(Outgoing::to(
                lost.conn,
                &ServerMessage::ForceUnclaim {
                    combatant: lost.combatant,
                    by: Some(hello.username.clone()),
                },
            ));
        }
        out.push(Outgoing::to(conn, &ServerMessage::State(&self.snapshot())));
        out
    }

    fn claim(&mut self, conn: ConnId, combatant: CombatantId, force: bool) -> Vec<Outgoing> {
        let refusal = match self.state.combatant(combatant) {
            None => Some(ActionError::UnknownCombatant(combatant)),
            Some(c) if c.side == Side::Enemy => Some(ActionError::DeskOnly),
            Some(_) => None,
        };
        if let Some(e) = refusal {
            return vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))];
        }

        match self.registry.claim(conn, combatant, force) {
            Ok(outcome) => {
                info!(conn, combatant, force, changed = outcome.changed, "claimed");
                let mut out = Vec::new();
                if let Some(lost) = outcome.dispossessed {
                    out.push(Outgoing::to(
                        lost.conn,
                        &ServerMessage::ForceUnclaim {
                            combatant,
                            by: self.registry.username(conn).map(str::to_string),
                        },
                    ));
                }
                let name = self
                    .state
                    .combatant(combatant)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                out.push(Outgoing::to(
                    conn,
                    &ServerMessage::info(format!("you control {name}")),
                ));
                out
            }
            Err(e) => {
                warn!(conn, combatant, err = %e, "claim rejected");
                vec![Outgoing::to(conn, &ServerMessage::error(e.to_string()))]
            }
        }
    }

    fn run(&mut self, conn: ConnId, command: Command) -> Vec<Outgoing> {
        let origin = Origin::Session {
            conn,
            signed_in: self.registry.username(conn).is_some(),
            claimed: self.registry.claimed_by(conn),
        };
        let name = command.name();
        let result = dispatch(&mut self.state, &origin, command);
        let mut out = self.reconcile();

        match result {
            Ok(outcome) => {
                debug!(conn, command = name, "accepted");
                if let Some(id) = outcome.summoned {
                    if self.registry.claim(conn, id, false).is_ok() {
                        out.push(Outgoing::to(conn, &ServerMessage::ForceClaim { combatant: id }));
                    }
                }
                out.push(Outgoing::to(conn, &ServerMessage::info(outcome.message)));
            }
            Err(e) => {
                warn!(conn, command = name, kind = e.kind(), err = %e, "rejected");
                out.push(Outgoing::to(conn, &ServerMessage::error(e.to_string())));
            }
        }
        out
    }

    fn run_desk(&mut self, command: Command) -> Vec<Outgoing> {
        let name = command.name();
        match dispatch(&mut self.state, &Origin::Desk, command) {
            Ok(outcome) => info!(command = name, result = %outcome.message, "desk command"),
            Err(e) => warn!(command = name, err = %e, "desk command rejected"),
        }
        self.reconcile()
    }

    /// Drop claims on combatants that left the encounter.
    fn reconcile(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for id in self.state.take_removed() {
            if let Some(holder) = self.registry.forget_combatant(id) {
                out.push(Outgoing::to(
                    holder,
                    &ServerMessage::ForceUnclaim {
                        combatant: id,
                        by: None,
                    },
                ));
            }
        }
        out
    }
}
