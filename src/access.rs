use crate::{
    error::{MarketError, Result},
    Address,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Producer,
    Consumer,
    Oracle,
    Admin,
    Pauser,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Producer, Role::Consumer, Role::Oracle, Role::Admin, Role::Pauser];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Oracle => "oracle",
            Role::Admin => "admin",
            Role::Pauser => "pauser",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| MarketError::InputValidation(format!("Unknown role: {}", s)))
    }
}

/// Answers `(role, address) -> bool`.
pub trait RolePolicy {
    fn has_role(&self, role: Role, account: &Address) -> bool;

    fn require(&self, role: Role, account: &Address) -> Result<()> {
        if self.has_role(role, account) {
            Ok(())
        } else {
            Err(MarketError::Unauthorized(format!("{} lacks the {} role", account, role)))
        }
    }
}

/// Role membership plus the global pause flag.
///
/// Oracle capability is plain set membership: every listed address is trusted
/// on its own, there is no threshold.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    members: HashMap<Role, HashSet<Address>>,
    paused: bool,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(mut self, role: Role, accounts: impl IntoIterator<Item = Address>) -> Self {
        for account in accounts {
            self.grant(role, account);
        }
        self
    }

    /// Returns false if the account already held the role.
    pub fn grant(&mut self, role: Role, account: Address) -> bool {
        self.members.entry(role).or_default().insert(account)
    }

    /// Returns false if the account did not hold the role.
    pub fn revoke(&mut self, role: Role, account: &Address) -> bool {
        self.members
            .get_mut(&role)
            .map(|set| set.remove(account))
            .unwrap_or(false)
    }

    pub fn members(&self, role: Role) -> Vec<Address> {
        let mut accounts: Vec<Address> = self
            .members
            .get(&role)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        accounts.sort();
        accounts
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn ensure_not_paused(&self) -> Result<()> {
        if self.paused {
            return Err(MarketError::Paused);
        }
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }
}

impl RolePolicy for AccessControl {
    fn has_role(&self, role: Role, account: &Address) -> bool {
        self.members
            .get(&role)
            .map(|set| set.contains(account))
            .unwrap_or(false)
    }
}
