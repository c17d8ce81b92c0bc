use crate::set::SetReference;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Allow,
    Drop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

/// An inclusive destination port range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// A single match/action entry in a compiled policy.
///
/// A packet matches when its source is in every included `src` set and in no
/// excluded `src` set, and likewise for `dst`. An empty side is unrestricted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AclRule {
    /// The `namespace/name` of the policy that produced this rule.
    pub policy: String,
    pub direction: Direction,
    pub action: Action,
    pub src: Vec<SetReference>,
    pub dst: Vec<SetReference>,
    pub protocol: Option<Protocol>,
    pub ports: Option<PortRange>,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported protocol: {0}")]
pub struct InvalidProtocol(String);

// === impl Direction ===

impl Direction {
    /// The suffix used when naming per-direction sets.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Ingress => "IN",
            Self::Egress => "OUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::Egress => f.write_str("egress"),
        }
    }
}

// === impl Protocol ===

impl std::str::FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            return Ok(Self::Tcp);
        }
        if s.eq_ignore_ascii_case("udp") {
            return Ok(Self::Udp);
        }
        if s.eq_ignore_ascii_case("sctp") {
            return Ok(Self::Sctp);
        }
        Err(InvalidProtocol(s.to_string()))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::Sctp => f.write_str("SCTP"),
        }
    }
}

// === impl PortRange ===

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            return fmt::Display::fmt(&self.start, f);
        }
        write!(f, "{}-{}", self.start, self.end)
    }
}

// === impl AclRule ===

impl AclRule {
    /// An unrestricted rule for `policy`, to be narrowed by the caller.
    pub fn new(policy: impl Into<String>, direction: Direction, action: Action) -> Self {
        Self {
            policy: policy.into(),
            direction,
            action,
            src: vec![],
            dst: vec![],
            protocol: None,
            ports: None,
        }
    }

    pub fn is_drop(&self) -> bool {
        self.action == Action::Drop
    }

    /// The set names this rule depends on.
    pub fn set_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.src
            .iter()
            .chain(self.dst.iter())
            .map(|r| r.name.as_str())
    }

    /// Compares rules while ignoring which policy produced them.
    pub fn same_match(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.action == other.action
            && self.src == other.src
            && self.dst == other.dst
            && self.protocol == other.protocol
            && self.ports == other.ports
    }
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            Action::Allow => "allow",
            Action::Drop => "drop",
        };
        write!(f, "{} {action} src=[", self.direction)?;
        write_refs(f, &self.src)?;
        write!(f, "] dst=[")?;
        write_refs(f, &self.dst)?;
        write!(f, "]")?;
        if let Some(proto) = self.protocol {
            write!(f, " proto={proto}")?;
        }
        if let Some(ports) = self.ports {
            write!(f, " ports={ports}")?;
        }
        Ok(())
    }
}

fn write_refs(f: &mut fmt::Formatter<'_>, refs: &[SetReference]) -> fmt::Result {
    for (i, r) in refs.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        fmt::Display::fmt(r, f)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_protocol() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("SCTP".parse::<Protocol>().unwrap(), Protocol::Sctp);
        assert!("ICMP".parse::<Protocol>().is_err());
    }

    #[test]
    fn display_rule() {
        let mut rule = AclRule::new("default/web", Direction::Ingress, Action::Allow);
        rule.src = vec![SetReference::include("all-namespaces")];
        rule.dst = vec![
            SetReference::include("ns-default"),
            SetReference::exclude("podlabel-tier"),
        ];
        rule.protocol = Some(Protocol::Tcp);
        rule.ports = Some(PortRange { start: 80, end: 90 });
        assert_eq!(
            rule.to_string(),
            "ingress allow src=[all-namespaces] dst=[ns-default,!podlabel-tier] proto=TCP ports=80-90"
        );

        let mut rule = AclRule::new("default/web", Direction::Egress, Action::Allow);
        rule.dst = vec![SetReference::exclude("nslabel-env:prod")];
        rule.protocol = Some(Protocol::Udp);
        rule.ports = Some(PortRange { start: 53, end: 53 });
        assert_eq!(
            rule.to_string(),
            "egress allow src=[] dst=[!nslabel-env:prod] proto=UDP ports=53"
        );
    }
}
