//! Persistent accounts.
//!
//! An account outlives any connection. It remembers which combatants the
//! username owns and the client's saved UI preferences, and it is what a
//! reconnecting session is re-attached to. The store is a single JSON file
//! rewritten atomically (write to a temp file, then rename) on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::combatant::CombatantId;

/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 32;

/// Persistent record for one username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub owned: BTreeSet<CombatantId>,
    #[serde(default)]
    pub preferences: serde_json::Value,
}

impl Account {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            created_at: Utc::now(),
            owned: BTreeSet::new(),
            preferences: serde_json::Value::Null,
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
}

#[derive(Debug, Error)]
pub enum AccountStoreError {
    #[error("failed to access accounts file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse accounts file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode accounts: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trim and check a username. Returns the canonical form.
pub fn normalize_username(raw: &str) -> Option<String> {
    let name = raw.trim();
    let ok = !name.is_empty()
        && name.chars().count() <= MAX_USERNAME_LEN
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'));
    ok.then(|| name.to_string())
}

/// Username → account map, optionally backed by a file.
#[derive(Debug, Default)]
pub struct AccountStore {
    path: Option<PathBuf>,
    accounts: BTreeMap<String, Account>,
}

impl AccountStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn load(path: PathBuf) -> Result<Self, AccountStoreError> {
        let accounts = match std::fs::read_to_string(&path) {
            Ok(s) => {
                let file: AccountsFile =
                    serde_json::from_str(&s).map_err(|source| AccountStoreError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                file.accounts
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(AccountStoreError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            accounts,
        })
    }

    /// Get the account, creating it on first use. Returns true if created.
    pub fn ensure(&mut self, username: &str) -> bool {
        if self.accounts.contains_key(username) {
            return false;
        }
        self.accounts
            .insert(username.to_string(), Account::new(username));
        true
    }

    pub fn get(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    /// Which account permanently owns a combatant.
    pub fn owner_of(&self, combatant: CombatantId) -> Option<&str> {
        self.accounts
            .values()
            .find(|a| a.owned.contains(&combatant))
            .map(|a| a.username.as_str())
    }

    /// Give a combatant to `username`, taking it from any other account.
    pub fn set_owner(&mut self, combatant: CombatantId, username: &str) {
        for account in self.accounts.values_mut() {
            if account.username != username {
                account.owned.remove(&combatant);
            }
        }
        self.ensure(username);
        if let Some(account) = self.accounts.get_mut(username) {
            account.owned.insert(combatant);
        }
    }

    /// Drop ownership of a combatant from every account.
    pub fn clear_owner(&mut self, combatant: CombatantId) -> bool {
        let mut changed = false;
        for account in self.accounts.values_mut() {
            changed |= account.owned.remove(&combatant);
        }
        changed
    }

    pub fn set_preferences(&mut self, username: &str, preferences: serde_json::Value) {
        self.ensure(username);
        if let Some(account) = self.accounts.get_mut(username) {
            account.preferences = preferences;
        }
    }

    pub fn count(&self) -> usize {
        self.accounts.len()
    }

    /// Write the store atomically. In-memory stores do nothing.
    pub fn save(&self) -> Result<(), AccountStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| AccountStoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = AccountsFile {
            version: 1,
            accounts: self.accounts.clone(),
        };
        let s = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, s).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}
