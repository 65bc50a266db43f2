//! Live sessions and the claim registry.
//!
//! A session is one live connection. Claims bind a combatant to exactly one
//! session at a time; the owning account is recorded in the `AccountStore` so
//! that a reconnecting client can pick its combatant back up.
//!
//! # Indexes
//!
//! ```text
//! sessions:   conn id   → Session (username, claimed ids, unacked losses)
//! claims:     combatant → conn id          (exclusive)
//! remembered: client id → (username, combatant)   last claim per device
//! accounts:   username  → Account (owned ids, preferences)
//! ```
//!
//! Reconnect precedence: a live claim already held by the session wins, then
//! the server-side remembered claim for the client id, then the claim the
//! client says it remembers, then nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use super::account::{normalize_username, AccountStore};
use super::combatant::CombatantId;

/// Connection identifier assigned by the network side.
pub type ConnId = u64;

/// Registry errors. The message is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a username is required")]
    MissingUsername,

    #[error("invalid username {0:?}")]
    InvalidUsername(String),

    #[error("sign in before claiming a character")]
    NotSignedIn,

    #[error("unknown connection {0}")]
    UnknownSession(ConnId),

    #[error("no such character {0}")]
    UnknownCombatant(CombatantId),

    #[error("character is controlled by {owner}")]
    OwnedBy {
        combatant: CombatantId,
        owner: String,
    },

    #[error("you do not control character {0}")]
    NotClaimed(CombatantId),
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn: ConnId,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub claimed: BTreeSet<CombatantId>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    /// Claims taken from this session that it has not acknowledged yet.
    pub unacked_losses: BTreeMap<CombatantId, Instant>,
}

impl Session {
    pub fn new(conn: ConnId) -> Self {
        let now = Instant::now();
        Self {
            conn,
            client_id: None,
            username: None,
            claimed: BTreeSet::new(),
            connected_at: now,
            last_activity: now,
            unacked_losses: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// A claim taken away from a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispossessed {
    pub conn: ConnId,
    pub combatant: CombatantId,
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub combatant: CombatantId,
    /// False when the session already held the claim.
    pub changed: bool,
    pub dispossessed: Option<Dispossessed>,
}

/// Result of a `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HelloOutcome {
    pub username: String,
    pub account_created: bool,
    pub reattached: Option<CombatantId>,
    pub dispossessed: Option<Dispossessed>,
    /// Live claims dropped because the connection changed accounts.
    pub released: Vec<CombatantId>,
}

/// Last claim seen for a client id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RememberedClaim {
    username: String,
    combatant: CombatantId,
}

/// Session and claim registry.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<ConnId, Session>,
    claims: HashMap<CombatantId, ConnId>,
    remembered: HashMap<String, RememberedClaim>,
    accounts: AccountStore,
}

impl Registry {
    pub fn new(accounts: AccountStore) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Track a new connection.
    pub fn connect(&mut self, conn: ConnId) {
        self.sessions.insert(conn, Session::new(conn));
    }

    pub fn session(&self, conn: ConnId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    pub fn session_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn)
    }

    pub fn username(&self, conn: ConnId) -> Option<&str> {
        self.sessions.get(&conn)?.username.as_deref()
    }

    /// Combatants the connection currently controls.
    pub fn claimed_by(&self, conn: ConnId) -> BTreeSet<CombatantId> {
        self.sessions
            .get(&conn)
            .map(|s| s.claimed.clone())
            .unwrap_or_default()
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create the account on first use.
    pub fn ensure_account(&mut self, username: &str) -> bool {
        let created = self.accounts.ensure(username);
        if created {
            self.persist();
        }
        created
    }

    /// Username of whoever controls a combatant: the live holder first, then
    /// the account that owns it.
    pub fn owner_of(&self, combatant: CombatantId) -> Option<&str> {
        self.claims
            .get(&combatant)
            .and_then(|conn| self.username(*conn))
            .or_else(|| self.accounts.owner_of(combatant))
    }

    /// Live connection holding a combatant.
    pub fn holder_of(&self, combatant: CombatantId) -> Option<ConnId> {
        self.claims.get(&combatant).copied()
    }

    /// Owner name per combatant, for the snapshot.
    pub fn ownership(&self, combatants: impl Iterator<Item = CombatantId>) -> BTreeMap<CombatantId, String> {
        combatants
            .filter_map(|id| self.owner_of(id).map(|o| (id, o.to_string())))
            .collect()
    }

    /// Sign a connection in and re-attach its last claim when that is safe.
    ///
    /// `exists` says whether a combatant is still in the encounter.
    pub fn hello(
        &mut self,
        conn: ConnId,
        username: Option<&str>,
        client_id: Option<&str>,
        remembered_claim: Option<CombatantId>,
        exists: impl Fn(CombatantId) -> bool,
    ) -> Result<HelloOutcome, RegistryError> {
        let raw = username.ok_or(RegistryError::MissingUsername)?;
        let username =
            normalize_username(raw).ok_or_else(|| RegistryError::InvalidUsername(raw.to_string()))?;
        let client_id = client_id.map(str::trim).filter(|c| !c.is_empty());

        let session = self
            .sessions
            .get_mut(&conn)
            .ok_or(RegistryError::UnknownSession(conn))?;
        // Signing in as someone else leaves the previous account's
        // characters behind.
        let mut released = Vec::new();
        if session.username.as_ref().is_some_and(|prev| *prev != username) {
            released = std::mem::take(&mut session.claimed).into_iter().collect();
            session.unacked_losses.clear();
        }
        session.username = Some(username.clone());
        session.client_id = client_id.map(str::to_string);
        session.touch();
        let live = session.claimed.iter().next().copied();
        for combatant in &released {
            self.claims.remove(combatant);
        }

        let account_created = self.ensure_account(&username);
        let mut outcome = HelloOutcome {
            username: username.clone(),
            account_created,
            released,
            ..HelloOutcome::default()
        };

        if live.is_some() {
            return Ok(outcome);
        }

        let server_side = client_id
            .and_then(|c| self.remembered.get(c))
            .filter(|r| r.username == username)
            .map(|r| r.combatant);
        let candidate = server_side.or(remembered_claim);

        if let Some(combatant) = candidate {
            if exists(combatant) && self.may_reattach(combatant, &username) {
                let claim = self.claim(conn, combatant, false)?;
                outcome.reattached = Some(combatant);
                outcome.dispossessed = claim.dispossessed;
            }
        }

        Ok(outcome)
    }

    fn may_reattach(&self, combatant: CombatantId, username: &str) -> bool {
        match self.owner_of(combatant) {
            None => true,
            Some(owner) => owner == username,
        }
    }

    /// Claim a combatant for a connection.
    ///
    /// Fails if another account controls it unless `force` is set. A forced
    /// steal (or the same account claiming from a second device) takes the
    /// claim away from the previous session, which must acknowledge the loss.
    pub fn claim(
        &mut self,
        conn: ConnId,
        combatant: CombatantId,
        force: bool,
    ) -> Result<ClaimOutcome, RegistryError> {
        let session = self
            .sessions
            .get(&conn)
            .ok_or(RegistryError::UnknownSession(conn))?;
        let username = session.username.clone().ok_or(RegistryError::NotSignedIn)?;
        let client_id = session.client_id.clone();

        if let Some(owner) = self.owner_of(combatant) {
            if owner != username && !force {
                return Err(RegistryError::OwnedBy {
                    combatant,
                    owner: owner.to_string(),
                });
            }
        }

        let holder = self.claims.get(&combatant).copied();
        if holder == Some(conn) {
            return Ok(ClaimOutcome {
                combatant,
                changed: false,
                dispossessed: None,
            });
        }

        let dispossessed = holder.map(|prev| {
            if let Some(prev_session) = self.sessions.get_mut(&prev) {
                prev_session.claimed.remove(&combatant);
                prev_session.unacked_losses.insert(combatant, Instant::now());
            }
            Dispossessed {
                conn: prev,
                combatant,
            }
        });

        self.claims.insert(combatant, conn);
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.claimed.insert(combatant);
            session.unacked_losses.remove(&combatant);
        }
        if let Some(client_id) = client_id {
            self.remembered.insert(
                client_id,
                RememberedClaim {
                    username: username.clone(),
                    combatant,
                },
            );
        }
        self.accounts.set_owner(combatant, &username);
        self.persist();

        Ok(ClaimOutcome {
            combatant,
            changed: true,
            dispossessed,
        })
    }

    /// Release a combatant entirely: live claim, account ownership and any
    /// remembered claim pointing at it. Returns the connection that held it.
    pub fn release(&mut self, combatant: CombatantId) -> Option<ConnId> {
        let holder = self.claims.remove(&combatant);
        if let Some(conn) = holder {
            if let Some(session) = self.sessions.get_mut(&conn) {
                session.claimed.remove(&combatant);
            }
        }
        self.remembered.retain(|_, r| r.combatant != combatant);
        if self.accounts.clear_owner(combatant) {
            self.persist();
        }
        holder
    }

    /// Release a combatant on behalf of the connection that holds it.
    pub fn unclaim(&mut self, conn: ConnId, combatant: CombatantId) -> Result<(), RegistryError> {
        if self.claims.get(&combatant) != Some(&conn) {
            return Err(RegistryError::NotClaimed(combatant));
        }
        self.release(combatant);
        Ok(())
    }

    /// Record that a connection saw its claim being taken.
    pub fn acknowledge_loss(&mut self, conn: ConnId, combatant: CombatantId) -> bool {
        self.sessions
            .get_mut(&conn)
            .is_some_and(|s| s.unacked_losses.remove(&combatant).is_some())
    }

    /// Losses that were not acknowledged within `interval`; their timers are
    /// restarted.
    pub fn due_loss_notices(&mut self, interval: Duration) -> Vec<Dispossessed> {
        let now = Instant::now();
        let mut due = Vec::new();
        for session in self.sessions.values_mut() {
            for (combatant, sent) in session.unacked_losses.iter_mut() {
                if now.duration_since(*sent) >= interval {
                    *sent = now;
                    due.push(Dispossessed {
                        conn: session.conn,
                        combatant: *combatant,
                    });
                }
            }
        }
        due
    }

    /// Forget a connection. Live claims are released but account ownership
    /// and the remembered claim stay so the client can come back.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<CombatantId> {
        let Some(session) = self.sessions.remove(&conn) else {
            return Vec::new();
        };
        for combatant in &session.claimed {
            self.claims.remove(combatant);
        }
        session.claimed.into_iter().collect()
    }

    /// A combatant left the encounter: drop every trace of its claims.
    pub fn forget_combatant(&mut self, combatant: CombatantId) -> Option<ConnId> {
        let holder = self.release(combatant);
        for session in self.sessions.values_mut() {
            session.unacked_losses.remove(&combatant);
        }
        holder
    }

    pub fn save_preferences(
        &mut self,
        conn: ConnId,
        preferences: serde_json::Value,
    ) -> Result<(), RegistryError> {
        let username = self
            .username(conn)
            .ok_or(RegistryError::NotSignedIn)?
            .to_string();
        self.accounts.set_preferences(&username, preferences);
        self.persist();
        Ok(())
    }

    pub fn preferences(&self, conn: ConnId) -> Result<serde_json::Value, RegistryError> {
        let username = self.username(conn).ok_or(RegistryError::NotSignedIn)?;
        Ok(self
            .accounts
            .get(username)
            .map(|a| a.preferences.clone())
            .unwrap_or_default())
    }

    fn persist(&self) {
        if let Err(e) = self.accounts.save() {
            warn!(err = %e, "failed to save accounts");
        }
    }
}
