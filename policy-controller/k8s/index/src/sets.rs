use ahash::AHashMap as HashMap;
use netpol_controller_core::{MembershipSet, Op, SetKind};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Tracks every set known to the backend, with its members and the objects
/// holding it.
///
/// Holders are processed policies (by key), the lists that contain a set
/// and the index itself.
/// A set is deleted once nothing holds it and, for sets populated from
/// cluster events, it has no members left.
///
/// Members of event-driven sets are counted per contributor, so pods that
/// share an address keep it in their sets until the last of them leaves.
#[derive(Debug, Default)]
pub(crate) struct SetIndex {
    by_name: HashMap<String, Entry>,
}

/// A single member contributed to a set by a pod or namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Membership {
    pub set: String,
    pub kind: SetKind,
    pub member: String,
}

pub(crate) type Memberships = BTreeSet<Membership>;

/// Holds the sets that live as long as the index itself.
pub(crate) const INDEX_HOLDER: &str = "index";

#[derive(Debug)]
struct Entry {
    kind: SetKind,

    /// Members, with the number of objects contributing each.
    members: BTreeMap<String, usize>,
    holders: BTreeSet<String>,
}

// === impl Membership ===

impl Membership {
    pub(crate) fn new(set: String, kind: SetKind, member: &str) -> Self {
        Self {
            set,
            kind,
            member: member.to_string(),
        }
    }
}

// === impl SetIndex ===

impl SetIndex {
    pub(crate) fn len(&self) -> usize {
        self.by_name.len()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Takes a hold on `set` for `holder`, creating the set first if needed.
    ///
    /// The members of an existing CIDR set are replaced by those of `set`,
    /// since an updated policy may reuse the set's name.
    pub(crate) fn hold(&mut self, set: &MembershipSet, holder: &str, ops: &mut Vec<Op>) {
        match self.by_name.get_mut(&set.name) {
            None => self.create(set, ops),
            Some(entry) if entry.kind == SetKind::CidrBlock => {
                let desired = set.members.iter().cloned().collect::<BTreeSet<_>>();
                for member in desired.iter().filter(|m| !entry.members.contains_key(*m)) {
                    ops.push(Op::AddMember {
                        set: set.name.clone(),
                        member: member.clone(),
                    });
                }
                for member in entry.members.keys().filter(|m| !desired.contains(*m)) {
                    ops.push(Op::RemoveMember {
                        set: set.name.clone(),
                        member: member.clone(),
                    });
                }
                entry.members = desired.into_iter().map(|m| (m, 1)).collect();
            }
            Some(_) => {}
        }
        if let Some(entry) = self.by_name.get_mut(&set.name) {
            entry.holders.insert(holder.to_string());
        }
    }

    /// Drops `holder`'s hold on a set, deleting the set if it is unused.
    pub(crate) fn release(&mut self, name: &str, holder: &str, ops: &mut Vec<Op>) {
        if let Some(entry) = self.by_name.get_mut(name) {
            entry.holders.remove(holder);
        }
        self.collect(name, ops);
    }

    /// Adds a member to an event-driven set, creating the set if needed.
    ///
    /// Only the first contribution of a member reaches the backend. List
    /// members are set names; the member set is created if it does not yet
    /// exist and is held by the list.
    pub(crate) fn add_member(&mut self, set: &str, kind: SetKind, member: &str, ops: &mut Vec<Op>) {
        if !self.by_name.contains_key(set) {
            self.create(&MembershipSet::dynamic(set, kind), ops);
        }

        let Some(entry) = self.by_name.get_mut(set) else {
            return;
        };
        if let Some(count) = entry.members.get_mut(member) {
            *count += 1;
            trace!(%set, %member, contributors = *count, "Member already present");
            return;
        }

        if let Some(member_kind) = kind.member_kind() {
            self.hold(&MembershipSet::dynamic(member, member_kind), set, ops);
            ops.push(Op::AddToList {
                list: set.to_string(),
                member: member.to_string(),
            });
        } else {
            ops.push(Op::AddMember {
                set: set.to_string(),
                member: member.to_string(),
            });
        }
        if let Some(entry) = self.by_name.get_mut(set) {
            entry.members.insert(member.to_string(), 1);
        }
    }

    /// Withdraws one contribution of a member, removing it from the backend
    /// once no contributions remain and deleting the set if it is left empty
    /// and unheld.
    pub(crate) fn remove_member(&mut self, set: &str, member: &str, ops: &mut Vec<Op>) {
        let Some(entry) = self.by_name.get_mut(set) else {
            return;
        };
        let remaining = match entry.members.get_mut(member) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }
        entry.members.remove(member);

        if entry.kind.is_list() {
            ops.push(Op::RemoveFromList {
                list: set.to_string(),
                member: member.to_string(),
            });
            self.release(member, set, ops);
        } else {
            ops.push(Op::RemoveMember {
                set: set.to_string(),
                member: member.to_string(),
            });
        }
        self.collect(set, ops);
    }

    /// Moves an object's memberships from `current` to `desired`.
    ///
    /// New memberships are added before stale ones are removed so that a set
    /// the object stays in is never emptied along the way.
    pub(crate) fn update_memberships(
        &mut self,
        current: &Memberships,
        desired: &Memberships,
        ops: &mut Vec<Op>,
    ) {
        for m in desired.difference(current) {
            self.add_member(&m.set, m.kind, &m.member, ops);
        }
        for m in current.difference(desired) {
            self.remove_member(&m.set, &m.member, ops);
        }
    }

    fn create(&mut self, set: &MembershipSet, ops: &mut Vec<Op>) {
        trace!(set = %set.name, kind = %set.kind, "Creating set");
        if set.kind.is_list() {
            // Lists may only refer to sets that already exist.
            if let Some(member_kind) = set.kind.member_kind() {
                for member in &set.members {
                    self.hold(&MembershipSet::dynamic(member, member_kind), &set.name, ops);
                }
            }
            ops.push(Op::CreateListSet {
                name: set.name.clone(),
                kind: set.kind,
                members: set.members.clone(),
            });
        } else {
            ops.push(Op::CreateSet {
                name: set.name.clone(),
                kind: set.kind,
            });
            for member in &set.members {
                ops.push(Op::AddMember {
                    set: set.name.clone(),
                    member: member.clone(),
                });
            }
        }

        self.by_name.insert(
            set.name.clone(),
            Entry {
                kind: set.kind,
                members: set.members.iter().map(|m| (m.clone(), 1)).collect(),
                holders: BTreeSet::new(),
            },
        );
    }

    fn collect(&mut self, name: &str, ops: &mut Vec<Op>) {
        let unused = match self.by_name.get(name) {
            Some(entry) => {
                entry.holders.is_empty() && (entry.kind.is_compiled() || entry.members.is_empty())
            }
            None => false,
        };
        if !unused {
            return;
        }

        let Some(entry) = self.by_name.remove(name) else {
            return;
        };
        trace!(set = %name, kind = %entry.kind, "Deleting set");
        if entry.kind.is_list() {
            ops.push(Op::DeleteListSet {
                name: name.to_string(),
            });
            for member in entry.members.keys() {
                self.release(member, name, ops);
            }
        } else {
            ops.push(Op::DeleteSet {
                name: name.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_sets_outlive_their_members() {
        let mut sets = SetIndex::default();
        let mut ops = vec![];

        sets.add_member("podlabel-app", SetKind::PodLabel, "10.0.0.1", &mut ops);
        sets.hold(
            &MembershipSet::dynamic("podlabel-app", SetKind::PodLabel),
            "default/abc",
            &mut ops,
        );
        sets.remove_member("podlabel-app", "10.0.0.1", &mut ops);
        assert!(sets.contains("podlabel-app"));

        sets.release("podlabel-app", "default/abc", &mut ops);
        assert!(!sets.contains("podlabel-app"));
        assert_eq!(
            ops,
            vec![
                Op::CreateSet {
                    name: "podlabel-app".to_string(),
                    kind: SetKind::PodLabel,
                },
                Op::AddMember {
                    set: "podlabel-app".to_string(),
                    member: "10.0.0.1".to_string(),
                },
                Op::RemoveMember {
                    set: "podlabel-app".to_string(),
                    member: "10.0.0.1".to_string(),
                },
                Op::DeleteSet {
                    name: "podlabel-app".to_string(),
                },
            ]
        );
    }

    #[test]
    fn members_are_counted_per_contributor() {
        let mut sets = SetIndex::default();
        let mut ops = vec![];

        sets.add_member("ns-default", SetKind::Namespace, "10.0.0.1", &mut ops);
        sets.add_member("ns-default", SetKind::Namespace, "10.0.0.1", &mut ops);
        assert_eq!(ops.len(), 2);

        ops.clear();
        sets.remove_member("ns-default", "10.0.0.1", &mut ops);
        assert!(ops.is_empty());
        assert!(sets.contains("ns-default"));

        sets.remove_member("ns-default", "10.0.0.1", &mut ops);
        assert_eq!(
            ops,
            vec![
                Op::RemoveMember {
                    set: "ns-default".to_string(),
                    member: "10.0.0.1".to_string(),
                },
                Op::DeleteSet {
                    name: "ns-default".to_string(),
                },
            ]
        );

        // Unknown members are ignored.
        ops.clear();
        sets.remove_member("ns-default", "10.0.0.1", &mut ops);
        assert!(ops.is_empty());
    }

    #[test]
    fn compiled_lists_hold_their_members() {
        let mut sets = SetIndex::default();
        let mut ops = vec![];

        let nested = MembershipSet::with_members(
            "nestedlabel-app:a:b",
            SetKind::NestedPodLabel,
            vec!["podlabel-app:a".to_string(), "podlabel-app:b".to_string()],
        );
        sets.hold(&nested, "default/abc", &mut ops);
        assert!(sets.contains("podlabel-app:a"));
        assert!(sets.contains("podlabel-app:b"));
        assert_eq!(sets.len(), 3);

        ops.clear();
        sets.release("nestedlabel-app:a:b", "default/abc", &mut ops);
        assert_eq!(sets.len(), 0);
        assert_eq!(
            ops,
            vec![
                Op::DeleteListSet {
                    name: "nestedlabel-app:a:b".to_string(),
                },
                Op::DeleteSet {
                    name: "podlabel-app:a".to_string(),
                },
                Op::DeleteSet {
                    name: "podlabel-app:b".to_string(),
                },
            ]
        );
    }

    #[test]
    fn namespace_lists() {
        let mut sets = SetIndex::default();
        let mut ops = vec![];

        sets.add_member("all-namespaces", SetKind::NamespaceLabel, "ns-a", &mut ops);
        assert_eq!(
            ops,
            vec![
                Op::CreateListSet {
                    name: "all-namespaces".to_string(),
                    kind: SetKind::NamespaceLabel,
                    members: vec![],
                },
                Op::CreateSet {
                    name: "ns-a".to_string(),
                    kind: SetKind::Namespace,
                },
                Op::AddToList {
                    list: "all-namespaces".to_string(),
                    member: "ns-a".to_string(),
                },
            ]
        );

        ops.clear();
        sets.remove_member("all-namespaces", "ns-a", &mut ops);
        assert_eq!(
            ops,
            vec![
                Op::RemoveFromList {
                    list: "all-namespaces".to_string(),
                    member: "ns-a".to_string(),
                },
                Op::DeleteSet {
                    name: "ns-a".to_string(),
                },
                Op::DeleteListSet {
                    name: "all-namespaces".to_string(),
                },
            ]
        );
    }
}
