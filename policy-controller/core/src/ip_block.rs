use crate::{cidr, dataplane::Dataplane};
use ipnet::IpNet;
use std::net::IpAddr;

/// Marks a set member whose addresses are excluded from the set.
pub const NOMATCH: &str = " nomatch";

/// A network peer, with sub-networks carved out of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IpBlock {
    /// A network to match against.
    pub net: IpNet,

    /// Networks to exclude from the match.
    pub except: Vec<IpNet>,
}

#[derive(Debug, thiserror::Error)]
pub enum IpBlockError {
    #[error("not a valid CIDR or IP address: {0}")]
    Invalid(String),

    #[error("{0} has exceptions that cannot be expressed as IPv4 ranges")]
    Ipv6Exceptions(IpNet),
}

// === impl IpBlock ===

impl IpBlock {
    /// Parses a block and its exceptions, accepting bare addresses as
    /// single-host networks.
    pub fn parse(net: &str, except: &[String]) -> Result<Self, IpBlockError> {
        let net = parse_net(net)?;
        let except = except
            .iter()
            .map(|e| parse_net(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { net, except })
    }

    /// Exceptions that actually remove addresses from the block.
    fn overlapping_excepts(&self) -> impl Iterator<Item = &IpNet> + '_ {
        self.except
            .iter()
            .filter(move |e| self.net.contains(*e) || e.contains(&self.net))
    }

    /// Renders the block as set members for a dataplane.
    ///
    /// Dataplanes that support negated members get the network followed by
    /// its exceptions flagged with [`NOMATCH`]. Others get the disjoint CIDRs
    /// covering only the permitted addresses.
    pub fn members(&self, dataplane: Dataplane) -> Result<Vec<String>, IpBlockError> {
        if self.overlapping_excepts().any(|e| e.contains(&self.net)) {
            return Ok(vec![]);
        }

        if dataplane.supports_negated_members() {
            let mut members = vec![self.net.trunc().to_string()];
            members.extend(
                self.overlapping_excepts()
                    .map(|e| format!("{}{NOMATCH}", e.trunc())),
            );
            return Ok(members);
        }

        let base = match self.net {
            IpNet::V4(net) => net,
            IpNet::V6(net) => {
                if self.overlapping_excepts().next().is_some() {
                    return Err(IpBlockError::Ipv6Exceptions(self.net));
                }
                return Ok(vec![net.trunc().to_string()]);
            }
        };
        let excepts = self
            .overlapping_excepts()
            .filter_map(|e| match e {
                IpNet::V4(e) => Some(*e),
                IpNet::V6(_) => None,
            })
            .collect::<Vec<_>>();
        Ok(cidr::blocks(base, &excepts)
            .into_iter()
            .map(|n| n.to_string())
            .collect())
    }
}

impl From<IpAddr> for IpBlock {
    fn from(net: IpAddr) -> Self {
        IpNet::from(net).into()
    }
}

impl From<IpNet> for IpBlock {
    fn from(net: IpNet) -> Self {
        Self {
            net,
            except: vec![],
        }
    }
}

fn parse_net(s: &str) -> Result<IpNet, IpBlockError> {
    if let Ok(net) = s.parse() {
        return Ok(net);
    }
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Ok(addr.into());
    }
    Err(IpBlockError::Invalid(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(net: &str, except: &[&str]) -> IpBlock {
        let except = except.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        IpBlock::parse(net, &except).unwrap()
    }

    #[test]
    fn parses_addresses() {
        let b = block("10.1.2.3", &[]);
        assert_eq!(b.net, "10.1.2.3/32".parse::<IpNet>().unwrap());
        assert!(IpBlock::parse("10.1.2", &[]).is_err());
        assert!(IpBlock::parse("10.0.0.0/8", &["bogus".to_string()]).is_err());
    }

    #[test]
    fn negated_members() {
        let b = block("10.0.0.0/16", &["10.0.1.0/24", "192.168.0.0/24"]);
        assert_eq!(
            b.members(Dataplane::Linux).unwrap(),
            vec!["10.0.0.0/16".to_string(), "10.0.1.0/24 nomatch".to_string()]
        );
    }

    #[test]
    fn canonical_members() {
        let b = block("10.0.0.0/24", &["10.0.0.0/25"]);
        assert_eq!(
            b.members(Dataplane::Windows).unwrap(),
            vec!["10.0.0.128/25".to_string()]
        );
    }

    #[test]
    fn except_covering_block() {
        let b = block("10.0.0.0/24", &["10.0.0.0/8"]);
        assert!(b.members(Dataplane::Linux).unwrap().is_empty());
        assert!(b.members(Dataplane::Windows).unwrap().is_empty());
    }

    #[test]
    fn ipv6() {
        let b = block("fd00::/64", &[]);
        assert_eq!(
            b.members(Dataplane::Windows).unwrap(),
            vec!["fd00::/64".to_string()]
        );

        let b = block("fd00::/64", &["fd00::/80"]);
        assert!(b.members(Dataplane::Windows).is_err());
        assert_eq!(
            b.members(Dataplane::Linux).unwrap(),
            vec!["fd00::/64".to_string(), "fd00::/80 nomatch".to_string()]
        );
    }
}
