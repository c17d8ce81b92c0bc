use crate::{acl::AclRule, set::SetKind};
use std::fmt;

/// A single backend mutation.
///
/// The reconciler emits operations in an order that is always valid to apply
/// sequentially: sets exist before anything refers to them, and are deleted
/// only after nothing refers to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    CreateSet {
        name: String,
        kind: SetKind,
    },
    DeleteSet {
        name: String,
    },
    AddMember {
        set: String,
        member: String,
    },
    RemoveMember {
        set: String,
        member: String,
    },

    CreateListSet {
        name: String,
        kind: SetKind,
        members: Vec<String>,
    },
    DeleteListSet {
        name: String,
    },
    AddToList {
        list: String,
        member: String,
    },
    RemoveFromList {
        list: String,
        member: String,
    },

    InstallRule(AclRule),
    RemoveRule(AclRule),

    BootstrapSharedInfra,
    TeardownSharedInfra,
}

impl Op {
    /// A short, stable name for the kind of operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSet { .. } => "create_set",
            Self::DeleteSet { .. } => "delete_set",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::CreateListSet { .. } => "create_list_set",
            Self::DeleteListSet { .. } => "delete_list_set",
            Self::AddToList { .. } => "add_to_list",
            Self::RemoveFromList { .. } => "remove_from_list",
            Self::InstallRule(_) => "install_rule",
            Self::RemoveRule(_) => "remove_rule",
            Self::BootstrapSharedInfra => "bootstrap",
            Self::TeardownSharedInfra => "teardown",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateSet { name, kind } => write!(f, "create {kind} set {name}"),
            Self::DeleteSet { name } => write!(f, "delete set {name}"),
            Self::AddMember { set, member } => write!(f, "add {member} to {set}"),
            Self::RemoveMember { set, member } => write!(f, "remove {member} from {set}"),
            Self::CreateListSet {
                name,
                kind,
                members,
            } => write!(f, "create {kind} list {name} [{}]", members.join(",")),
            Self::DeleteListSet { name } => write!(f, "delete list {name}"),
            Self::AddToList { list, member } => write!(f, "add set {member} to {list}"),
            Self::RemoveFromList { list, member } => write!(f, "remove set {member} from {list}"),
            Self::InstallRule(rule) => write!(f, "install {}: {rule}", rule.policy),
            Self::RemoveRule(rule) => write!(f, "remove {}: {rule}", rule.policy),
            Self::BootstrapSharedInfra => f.write_str("bootstrap shared infrastructure"),
            Self::TeardownSharedInfra => f.write_str("tear down shared infrastructure"),
        }
    }
}
