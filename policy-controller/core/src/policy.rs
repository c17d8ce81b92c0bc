use crate::{
    acl::{AclRule, Direction},
    set::MembershipSet,
};
use std::collections::BTreeMap;

/// The backend-neutral form of a single network policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledPolicy {
    pub name: String,
    pub namespace: String,

    /// A stable digest of the resolved target selector.
    ///
    /// Policies in the same namespace with the same digest select the same
    /// pods and are enforced together.
    pub pod_selector_hash: String,

    /// Every set the rules refer to, keyed by name.
    pub sets: BTreeMap<String, MembershipSet>,

    /// Rules in evaluation order. For each direction the policy applies to,
    /// all allow rules precede that direction's single drop rule.
    pub rules: Vec<AclRule>,
}

impl CompiledPolicy {
    pub fn has_default_deny(&self, direction: Direction) -> bool {
        self.rules
            .iter()
            .any(|r| r.direction == direction && r.is_drop())
    }
}
