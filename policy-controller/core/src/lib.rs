#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod acl;
pub mod cidr;
pub mod dataplane;
mod ip_block;
pub mod ops;
mod policy;
pub mod set;

pub use self::{
    acl::{AclRule, Action, Direction, InvalidProtocol, PortRange, Protocol},
    dataplane::Dataplane,
    ip_block::{IpBlock, IpBlockError},
    ops::Op,
    policy::CompiledPolicy,
    set::{MembershipSet, SetKind, SetReference},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Pods carrying this label key never contribute it to membership sets.
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
