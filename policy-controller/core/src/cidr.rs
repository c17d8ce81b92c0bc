//! Range arithmetic over IPv4 address space.
//!
//! Some dataplanes cannot express "this block except these sub-blocks". For
//! those, an `ipBlock` is rewritten as the minimal list of disjoint CIDRs that
//! cover exactly the permitted addresses.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// An inclusive range of IPv4 addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Range {
    pub start: u32,
    pub end: u32,
}

// === impl Ipv4Range ===

impl Ipv4Range {
    pub fn contains(&self, addr: u32) -> bool {
        self.start <= addr && addr <= self.end
    }
}

impl From<Ipv4Net> for Ipv4Range {
    fn from(net: Ipv4Net) -> Self {
        Self {
            start: u32::from(net.network()),
            end: u32::from(net.broadcast()),
        }
    }
}

/// Removes every `except` block from `base`, returning the remaining ranges in
/// ascending order.
///
/// Exceptions that do not overlap `base` are ignored. Host bits in any of the
/// inputs are masked off.
pub fn subtract(base: Ipv4Net, excepts: &[Ipv4Net]) -> Vec<Ipv4Range> {
    let base = Ipv4Range::from(base);
    let mut ranges = vec![base];

    for except in excepts.iter().copied().map(Ipv4Range::from) {
        if except.end < base.start || except.start > base.end {
            continue;
        }

        let mut remaining = Vec::with_capacity(ranges.len() + 1);
        for r in ranges {
            if except.end < r.start || except.start > r.end {
                remaining.push(r);
                continue;
            }
            if except.start > r.start {
                remaining.push(Ipv4Range {
                    start: r.start,
                    end: except.start - 1,
                });
            }
            if except.end < r.end {
                remaining.push(Ipv4Range {
                    start: except.end + 1,
                    end: r.end,
                });
            }
        }
        ranges = remaining;
    }

    ranges
}

/// Expresses each range as the fewest CIDR blocks that exactly cover it.
///
/// At each step the largest block aligned on the current start address that
/// stays within the range is emitted.
pub fn canonicalize(ranges: &[Ipv4Range]) -> Vec<Ipv4Net> {
    let mut nets = Vec::new();
    for range in ranges {
        let end = u64::from(range.end);
        let mut start = u64::from(range.start);
        while start <= end {
            let mut bits = (start as u32).trailing_zeros().min(32);
            while start + (1u64 << bits) - 1 > end {
                bits -= 1;
            }
            let addr = Ipv4Addr::from(start as u32);
            let net = Ipv4Net::new(addr, (32 - bits) as u8).expect("prefix length must be valid");
            nets.push(net);
            start += 1u64 << bits;
        }
    }
    nets
}

/// Rewrites `base` minus `excepts` as a list of disjoint CIDR blocks.
pub fn blocks(base: Ipv4Net, excepts: &[Ipv4Net]) -> Vec<Ipv4Net> {
    canonicalize(&subtract(base, excepts))
}
