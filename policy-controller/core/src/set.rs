use crate::acl::Direction;
use std::fmt;

/// The set that holds every namespace set in the cluster.
pub const ALL_NAMESPACES: &str = "all-namespaces";

/// Identifies how a membership set is populated.
///
/// Variants are ordered so that every set sorts after the sets it may contain.
/// Creating sets in ascending order (and deleting them in descending order)
/// never leaves a list referring to a missing set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetKind {
    /// Pod IPs of every running pod in a namespace.
    Namespace,

    /// Pod IPs of pods that carry a label (or label value).
    PodLabel,

    /// `ip,protocol:port` entries for pods exposing a named container port.
    NamedPort,

    /// Literal CIDR members derived from an `ipBlock` peer.
    CidrBlock,

    /// Namespace sets of namespaces that carry a label (or label value).
    NamespaceLabel,

    /// A list of pod label sets for a multi-valued selector term.
    NestedPodLabel,

    /// A list of namespace label sets for a multi-valued selector term.
    NestedNamespaceLabel,
}

/// A named collection of addresses (hash sets) or of other sets (list sets).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MembershipSet {
    pub name: String,
    pub kind: SetKind,

    /// Members fixed at compile time.
    ///
    /// Empty for sets whose population is driven by pod and namespace
    /// events.
    pub members: Vec<String>,
}

/// A rule's use of a set, either as a required match or as an exclusion.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetReference {
    pub name: String,
    pub included: bool,
}

pub fn namespace_set(namespace: &str) -> String {
    format!("ns-{namespace}")
}

/// `label` is a canonical `key` or `key:value` string.
pub fn pod_label_set(label: &str) -> String {
    format!("podlabel-{label}")
}

/// `label` is a canonical `key` or `key:value` string.
pub fn namespace_label_set(label: &str) -> String {
    format!("nslabel-{label}")
}

pub fn nested_pod_label_set(key: &str, values: &[String]) -> String {
    format!("nestedlabel-{key}:{}", values.join(":"))
}

pub fn nested_namespace_label_set(key: &str, values: &[String]) -> String {
    format!("nestednslabel-{key}:{}", values.join(":"))
}

pub fn named_port_set(port_name: &str) -> String {
    format!("namedport:{port_name}")
}

/// Names the set holding the `ipBlock` peers of one rule of a policy.
pub fn cidr_set(policy: &str, namespace: &str, rule: usize, direction: Direction) -> String {
    format!("{policy}-in-ns-{namespace}-{rule}{}", direction.suffix())
}

/// Joins a pod label key and value into the canonical `key:value` form.
pub fn label(key: &str, value: &str) -> String {
    format!("{key}:{value}")
}

// === impl SetKind ===

impl SetKind {
    /// Indicates whether sets of this kind hold other sets rather than
    /// addresses.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            Self::NamespaceLabel | Self::NestedPodLabel | Self::NestedNamespaceLabel
        )
    }

    /// The kind of set held by lists of this kind.
    pub fn member_kind(&self) -> Option<SetKind> {
        match self {
            Self::NamespaceLabel => Some(Self::Namespace),
            Self::NestedPodLabel => Some(Self::PodLabel),
            Self::NestedNamespaceLabel => Some(Self::NamespaceLabel),
            _ => None,
        }
    }

    /// Indicates whether a set's members are defined by the policy that
    /// references it, rather than by pod and namespace events.
    pub fn is_compiled(&self) -> bool {
        matches!(
            self,
            Self::CidrBlock | Self::NestedPodLabel | Self::NestedNamespaceLabel
        )
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => f.write_str("namespace"),
            Self::PodLabel => f.write_str("pod-label"),
            Self::NamedPort => f.write_str("named-port"),
            Self::CidrBlock => f.write_str("cidr-block"),
            Self::NamespaceLabel => f.write_str("namespace-label"),
            Self::NestedPodLabel => f.write_str("nested-pod-label"),
            Self::NestedNamespaceLabel => f.write_str("nested-namespace-label"),
        }
    }
}

// === impl MembershipSet ===

impl MembershipSet {
    /// A set whose members are maintained from cluster events.
    pub fn dynamic(name: impl Into<String>, kind: SetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            members: vec![],
        }
    }

    pub fn with_members(name: impl Into<String>, kind: SetKind, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            members,
        }
    }
}

// === impl SetReference ===

impl SetReference {
    pub fn include(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            included: true,
        }
    }

    pub fn exclude(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            included: false,
        }
    }
}

impl fmt::Display for SetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.included {
            write!(f, "!")?;
        }
        f.write_str(&self.name)
    }
}
