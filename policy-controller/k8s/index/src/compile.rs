//! Compiles `NetworkPolicy` resources into backend-neutral rules and sets.
//!
//! For each direction a policy applies to, every rule compiles to zero or more
//! allow rules, followed by a single drop rule scoped to the policy's target
//! pods. A rule that fails to compile is skipped, which can only narrow what
//! the policy allows.

use crate::ClusterInfo;
use netpol_controller_core::{
    set::{self, ALL_NAMESPACES},
    AclRule, Action, CompiledPolicy, Direction, InvalidProtocol, IpBlock, IpBlockError,
    MembershipSet, PortRange, Protocol, SetKind, SetReference,
};
use netpol_controller_k8s_api::{
    self as k8s,
    labels::{self, Selection, SelectorError},
    ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};


#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("NetworkPolicy must have a namespace")]
    MissingNamespace,

    #[error("invalid pod selector: {0}")]
    PodSelector(#[source] SelectorError),

    #[error("invalid peer selector: {0}")]
    PeerSelector(#[source] SelectorError),

    #[error(transparent)]
    IpBlock(#[from] IpBlockError),

    #[error(transparent)]
    Protocol(#[from] InvalidProtocol),

    #[error("invalid port: {0:?}")]
    Port(String),

    #[error("invalid port range: {start}-{end}")]
    PortRange { start: i32, end: i32 },
}

/// The rules of one direction, borrowed from either an ingress or an egress
/// rule.
struct RuleSpec<'a> {
    peers: Option<&'a [k8s::NetworkPolicyPeer]>,
    ports: &'a [k8s::NetworkPolicyPort],
}

#[derive(Clone, Debug)]
struct PortMatch {
    protocol: Protocol,
    target: PortTarget,
}

#[derive(Clone, Debug)]
enum PortTarget {
    Any,
    Range(PortRange),
    Named(String),
}

#[derive(Copy, Clone, Debug)]
enum Scope<'a> {
    /// Pods, optionally restricted to a namespace.
    Pods(Option<&'a str>),
    Namespaces,
}

struct Compiler<'a> {
    cluster: &'a ClusterInfo,
    name: &'a str,
    namespace: &'a str,
    id: String,
    target: Vec<SetReference>,
    sets: BTreeMap<String, MembershipSet>,
    rules: Vec<AclRule>,
}

/// The output of a single rule, kept only if the whole rule compiles.
#[derive(Debug, Default)]
struct RuleOutput {
    rules: Vec<AclRule>,
    sets: BTreeMap<String, MembershipSet>,
    allow_external: bool,
}

/// Compiles a policy.
///
/// Fails only when the policy's target cannot be determined. Errors in
/// individual rules are logged and the offending rule is omitted.
pub fn compile(
    policy: &k8s::NetworkPolicy,
    cluster: &ClusterInfo,
) -> Result<CompiledPolicy, CompileError> {
    let namespace = policy.namespace().ok_or(CompileError::MissingNamespace)?;
    let name = policy.name_unchecked();
    let spec = policy.spec.clone().unwrap_or_default();

    let pod_selector: Option<k8s::LabelSelector> = spec.pod_selector.into();
    let target = labels::resolve_optional(pod_selector.as_ref()).map_err(CompileError::PodSelector)?;

    let mut sets = BTreeMap::new();
    let target_refs = selection_refs(&target, Scope::Pods(Some(&namespace)), &mut sets);
    let mut compiler = Compiler {
        cluster,
        name: &name,
        namespace: &namespace,
        id: format!("{namespace}/{name}"),
        target: target_refs,
        sets,
        rules: vec![],
    };

    let types = spec.policy_types.as_deref();

    let ingress = spec.ingress.as_deref().unwrap_or_default();
    if applies(types, Direction::Ingress, !ingress.is_empty()) {
        let rules = ingress
            .iter()
            .map(|r| RuleSpec {
                peers: r.from.as_deref(),
                ports: r.ports.as_deref().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        compiler.direction(Direction::Ingress, &rules);
    }

    let egress = spec.egress.as_deref().unwrap_or_default();
    if applies(types, Direction::Egress, !egress.is_empty()) {
        let rules = egress
            .iter()
            .map(|r| RuleSpec {
                peers: r.to.as_deref(),
                ports: r.ports.as_deref().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        compiler.direction(Direction::Egress, &rules);
    }

    let Compiler { sets, rules, .. } = compiler;
    debug!(%namespace, %name, rules = rules.len(), sets = sets.len(), "Compiled");
    Ok(CompiledPolicy {
        pod_selector_hash: target.hash(),
        name,
        namespace,
        sets,
        rules,
    })
}

/// A direction applies when the policy declares it, or has rules for it.
/// Policies that declare no types are ingress policies.
fn applies(types: Option<&[String]>, direction: Direction, has_rules: bool) -> bool {
    if has_rules {
        return true;
    }
    let declared = match direction {
        Direction::Ingress => "Ingress",
        Direction::Egress => "Egress",
    };
    match types {
        Some(types) => types.iter().any(|t| t == declared),
        None => direction == Direction::Ingress,
    }
}

// === impl Compiler ===

impl Compiler<'_> {
    fn direction(&mut self, direction: Direction, rules: &[RuleSpec<'_>]) {
        let mut allow_external = false;
        for (idx, rule) in rules.iter().enumerate() {
            match self.rule(direction, idx, rule) {
                Ok(out) => {
                    allow_external |= out.allow_external;
                    for (name, set) in out.sets {
                        self.sets.entry(name).or_insert(set);
                    }
                    for r in out.rules {
                        self.push(r);
                    }
                }
                Err(error) => {
                    warn!(policy = %self.id, %direction, rule = idx, %error, "Skipping rule");
                }
            }
        }

        if allow_external {
            let rule = self.acl(direction, Action::Allow, vec![], None);
            self.push(rule);
        }

        let drop = self.acl(direction, Action::Drop, vec![], None);
        self.push(drop);
    }

    fn push(&mut self, rule: AclRule) {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
    }

    fn rule(
        &self,
        direction: Direction,
        idx: usize,
        rule: &RuleSpec<'_>,
    ) -> Result<RuleOutput, CompileError> {
        let ports = rule
            .ports
            .iter()
            .map(parse_port)
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = RuleOutput::default();

        let peers = match rule.peers {
            // A rule without peers or ports admits every pod in the cluster.
            None if ports.is_empty() => {
                out.sets.insert(
                    ALL_NAMESPACES.to_string(),
                    MembershipSet::dynamic(ALL_NAMESPACES, SetKind::NamespaceLabel),
                );
                let all = vec![SetReference::include(ALL_NAMESPACES)];
                out.rules
                    .push(self.acl(direction, Action::Allow, all, None));
                return Ok(out);
            }
            // An explicitly empty peer list admits any address, in or out of
            // the cluster.
            Some([]) if ports.is_empty() => {
                out.allow_external = true;
                return Ok(out);
            }
            None | Some([]) => {
                self.emit(direction, vec![], &ports, &mut out);
                return Ok(out);
            }
            Some(peers) => peers,
        };

        // All ipBlock peers of a rule share a single set.
        let cidr_set = set::cidr_set(self.name, self.namespace, idx, direction);
        let mut cidr_members: Option<Vec<String>> = None;

        for peer in peers {
            let refs = if let Some(block) = peer.ip_block.as_ref() {
                let block =
                    IpBlock::parse(&block.cidr, block.except.as_deref().unwrap_or_default())?;
                let members = block.members(self.cluster.dataplane)?;
                let first = cidr_members.is_none();
                let existing = cidr_members.get_or_insert_with(Vec::new);
                for m in members {
                    if !existing.contains(&m) {
                        existing.push(m);
                    }
                }
                if !first {
                    continue;
                }
                vec![SetReference::include(cidr_set.clone())]
            } else {
                match self.peer_refs(direction, peer, &mut out.sets)? {
                    Some(refs) => refs,
                    None => continue,
                }
            };
            self.emit(direction, refs, &ports, &mut out);
        }

        if let Some(members) = cidr_members {
            out.sets.insert(
                cidr_set.clone(),
                MembershipSet::with_members(cidr_set, SetKind::CidrBlock, members),
            );
        }

        Ok(out)
    }

    fn peer_refs(
        &self,
        direction: Direction,
        peer: &k8s::NetworkPolicyPeer,
        sets: &mut BTreeMap<String, MembershipSet>,
    ) -> Result<Option<Vec<SetReference>>, CompileError> {
        match (peer.namespace_selector.as_ref(), peer.pod_selector.as_ref()) {
            (None, None) => {
                warn!(policy = %self.id, %direction, "Skipping peer without a selector");
                Ok(None)
            }

            (None, Some(pods)) => {
                let sel = labels::resolve(pods).map_err(CompileError::PeerSelector)?;
                Ok(Some(selection_refs(
                    &sel,
                    Scope::Pods(Some(self.namespace)),
                    sets,
                )))
            }

            (Some(namespaces), None) => {
                let sel = labels::resolve(namespaces).map_err(CompileError::PeerSelector)?;
                Ok(Some(selection_refs(&sel, Scope::Namespaces, sets)))
            }

            (Some(namespaces), Some(pods)) => {
                if !self.cluster.combined_selectors_and {
                    warn!(
                        policy = %self.id,
                        %direction,
                        "Skipping peer with combined namespace and pod selectors"
                    );
                    return Ok(None);
                }
                let namespaces = labels::resolve(namespaces).map_err(CompileError::PeerSelector)?;
                let pods = labels::resolve(pods).map_err(CompileError::PeerSelector)?;
                let mut refs = selection_refs(&namespaces, Scope::Namespaces, sets);
                refs.extend(selection_refs(&pods, Scope::Pods(None), sets));
                Ok(Some(refs))
            }
        }
    }

    /// Adds an allow rule for `peers`, one per port when ports are declared.
    fn emit(
        &self,
        direction: Direction,
        peers: Vec<SetReference>,
        ports: &[PortMatch],
        out: &mut RuleOutput,
    ) {
        if ports.is_empty() {
            out.rules
                .push(self.acl(direction, Action::Allow, peers, None));
            return;
        }

        for port in ports {
            if let PortTarget::Named(name) = &port.target {
                let set = set::named_port_set(name);
                out.sets
                    .entry(set.clone())
                    .or_insert_with(|| MembershipSet::dynamic(set, SetKind::NamedPort));
            }
            out.rules
                .push(self.acl(direction, Action::Allow, peers.clone(), Some(port)));
        }
    }

    /// Builds a rule between the policy's target pods and `peers`.
    fn acl(
        &self,
        direction: Direction,
        action: Action,
        peers: Vec<SetReference>,
        port: Option<&PortMatch>,
    ) -> AclRule {
        let (src, mut dst) = match direction {
            Direction::Ingress => (peers, self.target.clone()),
            Direction::Egress => (self.target.clone(), peers),
        };

        let mut rule = AclRule::new(self.id.clone(), direction, action);
        if let Some(port) = port {
            rule.protocol = Some(port.protocol);
            match &port.target {
                PortTarget::Any => {}
                PortTarget::Range(range) => rule.ports = Some(*range),
                PortTarget::Named(name) => {
                    dst.push(SetReference::include(set::named_port_set(name)));
                }
            }
        }
        rule.src = src;
        rule.dst = dst;
        rule
    }
}

/// Maps a resolved selector to set references, recording the sets it needs.
fn selection_refs(
    sel: &Selection,
    scope: Scope<'_>,
    sets: &mut BTreeMap<String, MembershipSet>,
) -> Vec<SetReference> {
    let mut refs = Vec::new();
    let mut add = |set: MembershipSet| {
        if !sets.contains_key(&set.name) {
            sets.insert(set.name.clone(), set);
        }
    };

    match scope {
        Scope::Pods(Some(ns)) => {
            let name = set::namespace_set(ns);
            add(MembershipSet::dynamic(&name, SetKind::Namespace));
            refs.push(SetReference::include(name));
        }
        Scope::Pods(None) => {}
        Scope::Namespaces => {
            // Without a positive term, negated terms alone would also match
            // addresses outside the cluster.
            let positive =
                sel.terms.iter().any(|t| !t.negated) || sel.multi.iter().any(|m| !m.negated);
            if !positive {
                add(MembershipSet::dynamic(ALL_NAMESPACES, SetKind::NamespaceLabel));
                refs.push(SetReference::include(ALL_NAMESPACES));
            }
        }
    }

    let (kind, nested_kind, name_of, nested_name_of): (
        SetKind,
        SetKind,
        fn(&str) -> String,
        fn(&str, &[String]) -> String,
    ) = match scope {
        Scope::Pods(_) => (
            SetKind::PodLabel,
            SetKind::NestedPodLabel,
            set::pod_label_set,
            set::nested_pod_label_set,
        ),
        Scope::Namespaces => (
            SetKind::NamespaceLabel,
            SetKind::NestedNamespaceLabel,
            set::namespace_label_set,
            set::nested_namespace_label_set,
        ),
    };

    for term in &sel.terms {
        let name = name_of(&term.label());
        add(MembershipSet::dynamic(&name, kind));
        refs.push(SetReference {
            name,
            included: !term.negated,
        });
    }

    for term in &sel.multi {
        let members = term
            .values
            .iter()
            .map(|v| name_of(&set::label(&term.key, v)))
            .collect::<Vec<_>>();
        for member in &members {
            add(MembershipSet::dynamic(member, kind));
        }
        let name = nested_name_of(&term.key, &term.values);
        add(MembershipSet::with_members(&name, nested_kind, members));
        refs.push(SetReference {
            name,
            included: !term.negated,
        });
    }

    refs
}

fn parse_port(port: &k8s::NetworkPolicyPort) -> Result<PortMatch, CompileError> {
    let protocol = port.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>()?;
    let target = match port.port.as_ref() {
        None => PortTarget::Any,
        Some(k8s::IntOrString::Int(n)) => PortTarget::Range(port_range(*n, port.end_port)?),
        Some(k8s::IntOrString::String(s)) => match s.parse::<i32>() {
            Ok(n) => PortTarget::Range(port_range(n, port.end_port)?),
            Err(_) if !s.is_empty() => PortTarget::Named(s.clone()),
            Err(_) => return Err(CompileError::Port(s.clone())),
        },
    };
    Ok(PortMatch { protocol, target })
}

fn port_range(start: i32, end: Option<i32>) -> Result<PortRange, CompileError> {
    let end = end.unwrap_or(start);
    let valid = |p: i32| u16::try_from(p).ok().filter(|p| *p != 0);
    match (valid(start), valid(end)) {
        (Some(s), Some(e)) if s <= e => Ok(PortRange { start: s, end: e }),
        _ => Err(CompileError::PortRange { start, end }),
    }
}
