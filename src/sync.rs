//! State synchronizer.
//!
//! Every tick the simulation builds a [`Snapshot`] and hands it to the
//! [`Synchronizer`], which only emits a `state` frame when the snapshot
//! differs from the one last broadcast. Grid geometry travels separately on
//! a versioned channel: every connection is resent the current geometry on
//! a fixed interval until it acknowledges that version.
//!
//! # Join ordering
//!
//! ```text
//! connect ──▶ grid_update(v) ──▶ state(current) ──▶ incremental broadcasts
//!                  ▲
//!                  └── resent every interval until grid_ack(v)
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::protocol::{Outgoing, ServerMessage, Target};
use crate::state::turns::turn_groups;
use crate::state::{AreaEffect, CombatState, Combatant, CombatantId, ConnId, Registry, Side};

/// Grid dimensions as shown in the snapshot. Obstacles and terrain travel
/// on the grid channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridSummary {
    pub version: u64,
    pub cols: i32,
    pub rows: i32,
    pub feet_per_square: u32,
}

/// A combatant as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CombatantView {
    #[serde(flatten)]
    pub combatant: Combatant,
    /// Username currently controlling the combatant.
    pub owner: Option<String>,
    pub turn_ended: bool,
}

/// Everything a client can see, at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub grid: GridSummary,
    pub in_combat: bool,
    pub round: u32,
    pub active: Vec<CombatantId>,
    /// Initiative order as turn groups.
    pub turn_order: Vec<Vec<CombatantId>>,
    pub combatants: Vec<CombatantView>,
    pub aoes: Vec<AreaEffect>,
    /// Player characters and allies nobody is controlling right now.
    pub claimable: Vec<CombatantId>,
}

impl Snapshot {
    pub fn build(state: &CombatState, registry: &Registry) -> Self {
        let grid = state.grid();
        let turns = state.turns();

        let combatants = state
            .combatants()
            .map(|c| CombatantView {
                combatant: c.clone(),
                owner: registry.owner_of(c.id).map(str::to_string),
                turn_ended: turns.has_ended(c.id),
            })
            .collect();

        let claimable = state
            .combatants()
            .filter(|c| c.side != Side::Enemy && !c.summoned)
            .filter(|c| registry.holder_of(c.id).is_none())
            .map(|c| c.id)
            .collect();

        Self {
            grid: GridSummary {
                version: state.grid_version(),
                cols: grid.cols,
                rows: grid.rows,
                feet_per_square: grid.feet_per_square,
            },
            in_combat: turns.is_running(),
            round: turns.round(),
            active: turns.active().to_vec(),
            turn_order: turn_groups(state.roster())
                .into_iter()
                .map(|g| g.members)
                .collect(),
            combatants,
            aoes: state.aoes().cloned().collect(),
            claimable,
        }
    }

    pub fn combatant(&self, id: CombatantId) -> Option<&CombatantView> {
        self.combatants.iter().find(|c| c.combatant.id == id)
    }
}

#[derive(Debug, Clone, Copy)]
struct GridPeer {
    acked: u64,
    last_sent: Instant,
}

/// Decides what to broadcast and when.
#[derive(Debug)]
pub struct Synchronizer {
    resend_interval: Duration,
    last: Option<Snapshot>,
    grid_version: u64,
    grid_frame: String,
    peers: HashMap<ConnId, GridPeer>,
}

impl Synchronizer {
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            resend_interval,
            last: None,
            grid_version: 0,
            grid_frame: String::new(),
            peers: HashMap::new(),
        }
    }

    pub fn grid_version(&self) -> u64 {
        self.grid_version
    }

    /// Whether `conn` has acknowledged the current grid.
    pub fn is_grid_acked(&self, conn: ConnId) -> bool {
        self.peers
            .get(&conn)
            .is_some_and(|p| p.acked >= self.grid_version)
    }

    /// Re-encode the grid if its version moved. Returns the broadcast for
    /// every known connection when it did.
    fn refresh_grid(&mut self, state: &CombatState, now: Instant) -> Option<Outgoing> {
        if state.grid_version() == self.grid_version && !self.grid_frame.is_empty() {
            return None;
        }
        self.grid_version = state.grid_version();
        self.grid_frame = ServerMessage::GridUpdate {
            version: self.grid_version,
            grid: state.grid(),
        }
        .encode();
        info!(version = self.grid_version, peers = self.peers.len(), "grid version published");

        if self.peers.is_empty() {
            return None;
        }
        for peer in self.peers.values_mut() {
            peer.last_sent = now;
        }
        Some(Outgoing {
            target: Target::All,
            text: self.grid_frame.clone(),
        })
    }

    /// Frames for a new connection: the grid first, then the full snapshot.
    pub fn join(
        &mut self,
        conn: ConnId,
        state: &CombatState,
        snapshot: &Snapshot,
        now: Instant,
    ) -> Vec<Outgoing> {
        let mut out = Vec::new();
        out.extend(self.refresh_grid(state, now));
        self.peers.insert(
            conn,
            GridPeer {
                acked: 0,
                last_sent: now,
            },
        );
        out.push(Outgoing {
            target: Target::Conn(conn),
            text: self.grid_frame.clone(),
        });
        out.push(Outgoing::to(conn, &ServerMessage::State(snapshot)));
        out
    }

    pub fn leave(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
    }

    /// Record a `grid_ack`. Stale versions are ignored.
    pub fn acknowledge(&mut self, conn: ConnId, version: u64) -> bool {
        let current = self.grid_version;
        match self.peers.get_mut(&conn) {
            Some(peer) if version == current => {
                peer.acked = version;
                debug!(conn, version, "grid acknowledged");
                true
            }
            _ => false,
        }
    }

    /// Grid frames due this tick: a broadcast when the version moved, and
    /// resends to connections that have not acknowledged in time.
    pub fn grid_frames(&mut self, state: &CombatState, now: Instant) -> Vec<Outgoing> {
        if let Some(broadcast) = self.refresh_grid(state, now) {
            return vec![broadcast];
        }

        let mut out = Vec::new();
        for (conn, peer) in self.peers.iter_mut() {
            if peer.acked >= self.grid_version {
                continue;
            }
            if now.duration_since(peer.last_sent) >= self.resend_interval {
                peer.last_sent = now;
                debug!(conn = *conn, version = self.grid_version, "resending grid");
                out.push(Outgoing {
                    target: Target::Conn(*conn),
                    text: self.grid_frame.clone(),
                });
            }
        }
        out
    }

    /// Broadcast `snapshot` unless it equals the last one sent.
    pub fn maybe_broadcast(&mut self, snapshot: Snapshot) -> Option<Outgoing> {
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        let out = Outgoing::all(&ServerMessage::State(&snapshot));
        self.last = Some(snapshot);
        Some(out)
    }
}
