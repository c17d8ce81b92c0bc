use crate::{
    acl::AclRule,
    ops::Op,
    set::SetKind,
};
use ahash::AHashMap as HashMap;
use std::{collections::BTreeSet, fmt};

/// Describes what the target packet-filtering backend can express.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dataplane {
    /// Set members may be negated, so `ipBlock` exceptions pass through as-is.
    #[default]
    Linux,

    /// Only literal CIDRs are supported; exceptions are expanded into
    /// disjoint blocks.
    Windows,
}

/// An in-memory model of backend state.
///
/// Applying an operation that a real backend would reject (creating a set
/// twice, deleting a set that is still in use, installing a rule that refers
/// to a missing set) fails without modifying the state.
#[derive(Debug, Default)]
pub struct State {
    sets: HashMap<String, Set>,
    rules: Vec<AclRule>,
    bootstrapped: bool,
}

#[derive(Debug)]
struct Set {
    kind: SetKind,
    members: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("set {0} already exists")]
    SetExists(String),

    #[error("set {0} does not exist")]
    MissingSet(String),

    #[error("set {0} has the wrong kind for this operation")]
    WrongKind(String),

    #[error("set {0} is still in use")]
    SetInUse(String),

    #[error("{member} is already a member of {set}")]
    DuplicateMember { set: String, member: String },

    #[error("{member} is not a member of {set}")]
    MissingMember { set: String, member: String },

    #[error("rule is already installed: {0}")]
    DuplicateRule(String),

    #[error("rule is not installed: {0}")]
    MissingRule(String),

    #[error("shared infrastructure is not bootstrapped")]
    NotBootstrapped,

    #[error("shared infrastructure is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("shared infrastructure still has {0} rules installed")]
    RulesInstalled(usize),
}

// === impl Dataplane ===

impl Dataplane {
    pub fn supports_negated_members(&self) -> bool {
        matches!(self, Self::Linux)
    }
}

impl std::str::FromStr for Dataplane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("linux") {
            return Ok(Self::Linux);
        }
        if s.eq_ignore_ascii_case("windows") {
            return Ok(Self::Windows);
        }
        Err(format!("unknown dataplane: {s}"))
    }
}

impl fmt::Display for Dataplane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
        }
    }
}

// === impl State ===

impl State {
    pub fn apply(&mut self, op: &Op) -> Result<(), StateError> {
        match op {
            Op::CreateSet { name, kind } => {
                if kind.is_list() {
                    return Err(StateError::WrongKind(name.clone()));
                }
                self.create(name, *kind, BTreeSet::new())
            }

            Op::CreateListSet {
                name,
                kind,
                members,
            } => {
                if !kind.is_list() {
                    return Err(StateError::WrongKind(name.clone()));
                }
                if let Some(missing) = members.iter().find(|m| !self.sets.contains_key(*m)) {
                    return Err(StateError::MissingSet(missing.clone()));
                }
                self.create(name, *kind, members.iter().cloned().collect())
            }

            Op::DeleteSet { name } => self.delete(name, false),
            Op::DeleteListSet { name } => self.delete(name, true),

            Op::AddMember { set, member } => self.add(set, member, false),
            Op::RemoveMember { set, member } => self.remove(set, member, false),

            Op::AddToList { list, member } => {
                if !self.sets.contains_key(member) {
                    return Err(StateError::MissingSet(member.clone()));
                }
                self.add(list, member, true)
            }
            Op::RemoveFromList { list, member } => self.remove(list, member, true),

            Op::InstallRule(rule) => {
                if !self.bootstrapped {
                    return Err(StateError::NotBootstrapped);
                }
                if let Some(missing) = rule.set_names().find(|n| !self.sets.contains_key(*n)) {
                    return Err(StateError::MissingSet(missing.to_string()));
                }
                if self.rules.contains(rule) {
                    return Err(StateError::DuplicateRule(rule.to_string()));
                }
                self.rules.push(rule.clone());
                Ok(())
            }

            Op::RemoveRule(rule) => {
                let idx = self
                    .rules
                    .iter()
                    .position(|r| r == rule)
                    .ok_or_else(|| StateError::MissingRule(rule.to_string()))?;
                self.rules.remove(idx);
                Ok(())
            }

            Op::BootstrapSharedInfra => {
                if self.bootstrapped {
                    return Err(StateError::AlreadyBootstrapped);
                }
                self.bootstrapped = true;
                Ok(())
            }

            Op::TeardownSharedInfra => {
                if !self.bootstrapped {
                    return Err(StateError::NotBootstrapped);
                }
                if !self.rules.is_empty() {
                    return Err(StateError::RulesInstalled(self.rules.len()));
                }
                self.bootstrapped = false;
                Ok(())
            }
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn rules(&self) -> &[AclRule] {
        &self.rules
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn members(&self, set: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(set).map(|s| &s.members)
    }

    pub fn kind(&self, set: &str) -> Option<SetKind> {
        self.sets.get(set).map(|s| s.kind)
    }

    fn create(
        &mut self,
        name: &str,
        kind: SetKind,
        members: BTreeSet<String>,
    ) -> Result<(), StateError> {
        if self.sets.contains_key(name) {
            return Err(StateError::SetExists(name.to_string()));
        }
        self.sets.insert(name.to_string(), Set { kind, members });
        Ok(())
    }

    fn delete(&mut self, name: &str, list: bool) -> Result<(), StateError> {
        match self.sets.get(name) {
            None => return Err(StateError::MissingSet(name.to_string())),
            Some(set) if set.kind.is_list() != list => {
                return Err(StateError::WrongKind(name.to_string()))
            }
            Some(_) => {}
        }

        let listed = self
            .sets
            .values()
            .any(|s| s.kind.is_list() && s.members.contains(name));
        let ruled = self.rules.iter().any(|r| r.set_names().any(|n| n == name));
        if listed || ruled {
            return Err(StateError::SetInUse(name.to_string()));
        }

        self.sets.remove(name);
        Ok(())
    }

    fn add(&mut self, set: &str, member: &str, list: bool) -> Result<(), StateError> {
        let s = self
            .sets
            .get_mut(set)
            .ok_or_else(|| StateError::MissingSet(set.to_string()))?;
        if s.kind.is_list() != list {
            return Err(StateError::WrongKind(set.to_string()));
        }
        if !s.members.insert(member.to_string()) {
            return Err(StateError::DuplicateMember {
                set: set.to_string(),
                member: member.to_string(),
            });
        }
        Ok(())
    }

    fn remove(&mut self, set: &str, member: &str, list: bool) -> Result<(), StateError> {
        let s = self
            .sets
            .get_mut(set)
            .ok_or_else(|| StateError::MissingSet(set.to_string()))?;
        if s.kind.is_list() != list {
            return Err(StateError::WrongKind(set.to_string()));
        }
        if !s.members.remove(member) {
            return Err(StateError::MissingMember {
                set: set.to_string(),
                member: member.to_string(),
            });
        }
        Ok(())
    }
}
