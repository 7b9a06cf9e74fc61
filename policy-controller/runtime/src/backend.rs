use crate::{
    core::{Chain, Member, Memory, RuleSpec, RuleStore, SetKind, SetName, SetStore},
    Commands,
};
use anyhow::Result;
use tracing::info;

/// The packet filter driven by the index.
#[derive(Debug)]
pub enum Backend {
    /// Programs the host's `ipset`/`iptables` state.
    Commands(Commands),

    /// Logs each operation and applies it to an in-memory model, leaving the host untouched.
    DryRun(Memory),
}

// === impl Backend ===

impl SetStore for Backend {
    fn create(&self, name: &SetName, kind: SetKind) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.create(name, kind),
            Self::DryRun(mem) => {
                info!(%name, %kind, "ipset create");
                mem.create(name, kind)
            }
        }
    }

    fn destroy(&self, name: &SetName) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.destroy(name),
            Self::DryRun(mem) => {
                info!(%name, "ipset destroy");
                mem.destroy(name)
            }
        }
    }

    fn add(&self, name: &SetName, member: &Member) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.add(name, member),
            Self::DryRun(mem) => {
                info!(%name, %member, "ipset add");
                mem.add(name, member)
            }
        }
    }

    fn remove(&self, name: &SetName, member: &Member) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.remove(name, member),
            Self::DryRun(mem) => {
                info!(%name, %member, "ipset del");
                mem.remove(name, member)
            }
        }
    }

    fn flush(&self, name: &SetName) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.flush(name),
            Self::DryRun(mem) => {
                info!(%name, "ipset flush");
                mem.flush(name)
            }
        }
    }
}

impl RuleStore for Backend {
    fn ensure_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.ensure_rule(chain, rule),
            Self::DryRun(mem) => {
                info!(%chain, %rule, "iptables append");
                mem.ensure_rule(chain, rule)
            }
        }
    }

    fn delete_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        match self {
            Self::Commands(cmds) => cmds.delete_rule(chain, rule),
            Self::DryRun(mem) => {
                info!(%chain, %rule, "iptables delete");
                mem.delete_rule(chain, rule)
            }
        }
    }
}
