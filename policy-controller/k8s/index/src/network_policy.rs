//! Merges compiled network policies by pod selector and reconciles the
//! backend's rules and sets with the merged result.
//!
//! Policies in a namespace whose pod selectors resolve to the same hash are
//! enforced as a single processed policy. Whenever a contributor changes, the
//! processed policy is recompiled from all of its remaining contributors and
//! the difference from the previous result is emitted as backend operations.

use crate::{compile, index::Index, ClusterInfo, CompileError};
use netpol_controller_core::{AclRule, CompiledPolicy, Direction, MembershipSet, Op, SetKind};
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// A network policy as last applied, with the hash of its pod selector.
#[derive(Debug)]
pub(crate) struct RawPolicy {
    pub policy: k8s::NetworkPolicy,
    pub hash: String,
}

/// The merged rules and sets of every policy in a namespace that selects the
/// same pods.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ProcessedPolicy {
    /// Names of the contributing policies, in merge order.
    pub contributors: Vec<String>,

    /// Sets keyed by kind and name, which is the order they may be created
    /// in.
    pub sets: BTreeMap<(SetKind, String), MembershipSet>,

    pub rules: Vec<AclRule>,
}

// === impl ProcessedPolicy ===

impl ProcessedPolicy {
    /// Merges compiled policies. Allow rules keep their order of appearance;
    /// each direction's drop rules follow all allow rules, and a drop that
    /// matches the same traffic as an earlier one is omitted.
    fn merge(compiled: Vec<CompiledPolicy>) -> Option<Self> {
        if compiled.is_empty() {
            return None;
        }

        let mut merged = Self::default();
        let mut drops = Vec::<AclRule>::new();
        for policy in compiled {
            merged.contributors.push(policy.name);
            for (name, set) in policy.sets {
                merged.sets.entry((set.kind, name)).or_insert(set);
            }
            for rule in policy.rules {
                if rule.is_drop() {
                    if !drops.iter().any(|d| d.same_match(&rule)) {
                        drops.push(rule);
                    }
                } else if !merged.rules.contains(&rule) {
                    merged.rules.push(rule);
                }
            }
        }
        merged.rules.extend(drops);
        Some(merged)
    }

    pub fn has_default_deny(&self, direction: Direction) -> bool {
        self.rules
            .iter()
            .any(|r| r.direction == direction && r.is_drop())
    }
}

// === impl Index ===

impl Index {
    /// Adds or replaces a network policy.
    ///
    /// Re-applying a policy with an unchanged spec emits nothing. A policy
    /// whose pod selector cannot be resolved is rejected and any previously
    /// applied version stays in effect.
    #[instrument(
        skip(self, policy),
        fields(
            ns = ?policy.metadata.namespace,
            name = ?policy.metadata.name,
        )
    )]
    pub fn add_policy(&mut self, policy: k8s::NetworkPolicy) -> Result<Vec<Op>, CompileError> {
        let namespace = policy.namespace().ok_or(CompileError::MissingNamespace)?;
        let name = policy.name_unchecked();

        let unchanged = self
            .namespaces
            .by_ns
            .get(&namespace)
            .and_then(|ns| ns.policies.get(&name))
            .is_some_and(|raw| raw.policy.spec == policy.spec);
        if unchanged {
            debug!("Policy is unchanged");
            return Ok(vec![]);
        }

        let hash = compile(&policy, &self.cluster_info)?.pod_selector_hash;

        let mut ops = vec![];
        let old = self
            .namespaces
            .get_or_default(&namespace)
            .policies
            .insert(name, RawPolicy { policy, hash: hash.clone() });
        self.recompute(&namespace, &hash, &mut ops);
        if let Some(old) = old.filter(|old| old.hash != hash) {
            debug!(old = %old.hash, new = %hash, "Pod selector changed");
            self.recompute(&namespace, &old.hash, &mut ops);
        }
        self.finish(&mut ops);
        Ok(ops)
    }

    /// Removes a network policy, leaving only the rules of other policies
    /// that select the same pods.
    #[instrument(skip(self))]
    pub fn remove_policy(&mut self, namespace: &str, name: &str) -> Vec<Op> {
        let mut ops = vec![];
        self.remove_raw(namespace, name, &mut ops);
        self.finish(&mut ops);
        ops
    }

    /// Replaces `old` with `new`, or only removes `old` when `new` is being
    /// deleted.
    ///
    /// If `new` is rejected, `old` stays removed.
    pub fn update_policy(&mut self, old: &k8s::NetworkPolicy, new: k8s::NetworkPolicy) -> Vec<Op> {
        let mut ops = vec![];
        if let Some(namespace) = old.namespace() {
            self.remove_raw(&namespace, &old.name_unchecked(), &mut ops);
        }
        if new.metadata.deletion_timestamp.is_none() {
            match self.add_policy(new) {
                Ok(added) => ops.extend(added),
                Err(error) => error!(%error, "Illegal NetworkPolicy"),
            }
        }
        self.finish(&mut ops);
        ops
    }

    /// Applies a policy as observed from the API server.
    pub fn apply_policy(&mut self, policy: k8s::NetworkPolicy) -> Result<Vec<Op>, CompileError> {
        if policy.metadata.deletion_timestamp.is_some() {
            let namespace = policy.namespace().ok_or(CompileError::MissingNamespace)?;
            return Ok(self.remove_policy(&namespace, &policy.name_unchecked()));
        }
        self.add_policy(policy)
    }

    /// Indicates whether no namespace has a processed policy, so that
    /// infrastructure shared by all policies may be removed.
    pub fn can_tear_down_shared_infra(&self) -> bool {
        self.namespaces
            .iter()
            .all(|(_, ns)| ns.processed.is_empty())
    }

    /// Replaces the cluster configuration and recompiles every policy
    /// against it.
    pub fn set_cluster_info(&mut self, cluster_info: ClusterInfo) -> Vec<Op> {
        info!(
            combined_selectors_and = cluster_info.combined_selectors_and,
            dataplane = %cluster_info.dataplane,
            "Updating cluster info"
        );
        self.cluster_info = Arc::new(cluster_info);

        let mut hashes = self
            .namespaces
            .iter()
            .flat_map(|(ns, index)| {
                index
                    .policies
                    .values()
                    .map(move |raw| (ns.clone(), raw.hash.clone()))
            })
            .collect::<Vec<_>>();
        hashes.sort();
        hashes.dedup();

        let mut ops = vec![];
        for (ns, hash) in hashes {
            self.recompute(&ns, &hash, &mut ops);
        }
        self.finish(&mut ops);
        ops
    }

    fn remove_raw(&mut self, namespace: &str, name: &str, ops: &mut Vec<Op>) {
        let Some(raw) = self
            .namespaces
            .by_ns
            .get_mut(namespace)
            .and_then(|ns| ns.policies.remove(name))
        else {
            debug!(%namespace, %name, "Unknown policy");
            return;
        };
        self.recompute(namespace, &raw.hash, ops);
        self.namespaces.gc(namespace);
    }

    /// Recompiles the processed policy for a pod selector hash from all of
    /// its contributors and emits the operations that move the backend from
    /// the previous result to the new one.
    ///
    /// If any contributor fails to compile, nothing changes.
    fn recompute(&mut self, namespace: &str, hash: &str, ops: &mut Vec<Op>) {
        let compiled = match self.compile_contributors(namespace, hash) {
            Ok(compiled) => compiled,
            Err(error) => {
                error!(%namespace, %hash, %error, "Failed to recompile policies");
                return;
            }
        };
        let desired = ProcessedPolicy::merge(compiled);
        let current = self
            .namespaces
            .get_or_default(namespace)
            .processed
            .remove(hash)
            .unwrap_or_default();

        match desired.as_ref() {
            Some(processed) => debug!(
                %namespace,
                %hash,
                contributors = ?processed.contributors,
                rules = processed.rules.len(),
                "Merged policies"
            ),
            None => debug!(%namespace, %hash, "No policies remain"),
        }

        let empty = ProcessedPolicy::default();
        let target = desired.as_ref().unwrap_or(&empty);
        if *target != current {
            self.sets_and_rules(namespace, hash, &current, target, ops);
        }

        match desired {
            Some(processed) => {
                self.namespaces
                    .get_or_default(namespace)
                    .processed
                    .insert(hash.to_string(), processed);
            }
            None => self.namespaces.gc(namespace),
        }
    }

    fn compile_contributors(
        &self,
        namespace: &str,
        hash: &str,
    ) -> Result<Vec<CompiledPolicy>, CompileError> {
        let Some(ns) = self.namespaces.by_ns.get(namespace) else {
            return Ok(vec![]);
        };
        let mut raws = ns
            .policies
            .iter()
            .filter(|(_, raw)| raw.hash == hash)
            .collect::<Vec<_>>();
        raws.sort_by(|(a, _), (b, _)| a.cmp(b));
        raws.into_iter()
            .map(|(_, raw)| compile(&raw.policy, &self.cluster_info))
            .collect()
    }

    /// Holds new sets, updates rules, then releases sets that are no longer
    /// referenced, so that rules never refer to a missing set.
    fn sets_and_rules(
        &mut self,
        namespace: &str,
        hash: &str,
        current: &ProcessedPolicy,
        desired: &ProcessedPolicy,
        ops: &mut Vec<Op>,
    ) {
        let holder = format!("{namespace}/{hash}");
        for set in desired.sets.values() {
            self.sets.hold(set, &holder, ops);
        }

        self.sync_rules(&current.rules, &desired.rules, ops);

        for (key, set) in current.sets.iter().rev() {
            if !desired.sets.contains_key(key) {
                self.sets.release(&set.name, &holder, ops);
            }
        }
    }

    /// Removes stale rules and installs new ones.
    ///
    /// When allow rules are added to a direction, its drop rules are
    /// reinstalled after them so that they remain last.
    fn sync_rules(&mut self, current: &[AclRule], desired: &[AclRule], ops: &mut Vec<Op>) {
        let reordered = |direction: Direction| {
            desired
                .iter()
                .any(|r| r.direction == direction && !r.is_drop() && !current.contains(r))
        };
        let (ingress, egress) = (reordered(Direction::Ingress), reordered(Direction::Egress));
        let kept = |rule: &AclRule| {
            let moved = rule.is_drop()
                && match rule.direction {
                    Direction::Ingress => ingress,
                    Direction::Egress => egress,
                };
            current.contains(rule) && desired.contains(rule) && !moved
        };

        for rule in current.iter().filter(|r| !kept(r)) {
            ops.push(Op::RemoveRule(rule.clone()));
        }

        let mut installs = desired.iter().filter(|r| !kept(r)).peekable();
        if installs.peek().is_some() && !self.bootstrapped {
            info!("Bootstrapping shared infrastructure");
            ops.push(Op::BootstrapSharedInfra);
            self.bootstrapped = true;
        }
        for rule in installs {
            ops.push(Op::InstallRule(rule.clone()));
        }
    }

    /// Tears down shared infrastructure once no policy remains.
    pub(crate) fn finish(&mut self, ops: &mut Vec<Op>) {
        if self.bootstrapped && self.can_tear_down_shared_infra() {
            info!("Tearing down shared infrastructure");
            ops.push(Op::TeardownSharedInfra);
            self.bootstrapped = false;
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        let ns = policy.namespace();
        let name = policy.name_unchecked();
        match self.apply_policy(policy) {
            Ok(ops) => self.publish(ops),
            Err(error) => error!(?ns, %name, %error, "Illegal NetworkPolicy"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let ops = self.remove_policy(&namespace, &name);
        self.publish(ops);
    }

    // Since apply only reindexes a single policy at a time, there's no need
    // to handle resets specially.
}
