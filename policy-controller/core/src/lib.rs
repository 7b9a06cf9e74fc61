#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ipset;
pub mod iptables;
mod memory;

pub use self::{
    ipset::{Member, SetKind, SetName, SetStore},
    iptables::{Chain, PortRange, Protocol, RuleSpec, RuleStore},
    memory::Memory,
};
pub use ipnet::IpNet;

/// A node's packet filter: named address sets plus the rules that reference them.
pub trait Kernel: SetStore + RuleStore {}

impl<K: SetStore + RuleStore> Kernel for K {}
