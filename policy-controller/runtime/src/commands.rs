use crate::core::{Chain, IpNet, Member, RuleSpec, RuleStore, SetKind, SetName, SetStore};
use anyhow::{bail, Context, Result};
use std::{
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, info, trace};

/// The host chain that the controller's entry chain is hooked into.
const HOOK: &str = "FORWARD";

/// Seconds to wait for the xtables lock before giving up.
const XTABLES_WAIT_SECS: &str = "5";

/// Applies set and rule changes by invoking the `ipset` and `iptables` binaries.
///
/// Set creation tolerates sets left behind by a previous run, which are flushed and reused by
/// name. Rules are checked before they are appended, so ensuring a rule twice is harmless.
#[derive(Clone, Debug)]
pub struct Commands {
    ipset: PathBuf,
    iptables: PathBuf,
}

// === impl Commands ===

impl Commands {
    pub fn new(ipset: impl Into<PathBuf>, iptables: impl Into<PathBuf>) -> Self {
        Self {
            ipset: ipset.into(),
            iptables: iptables.into(),
        }
    }

    /// Creates the controller's chains and hooks the entry chain into `FORWARD`.
    ///
    /// Rules left in the controller's chains by a previous run are flushed and its sets are
    /// destroyed; the index reinstalls everything it needs as the watches resync.
    pub fn init_chains(&self, pod_networks: &[IpNet]) -> Result<()> {
        let chains = std::iter::once(Chain::MAIN).chain(Chain::ALL.iter().map(Chain::as_str));
        for chain in chains {
            if !self.iptables_check(&["-n", "-L", chain])? {
                self.iptables(&["-N", chain])?;
            }
            self.iptables(&["-F", chain])?;
        }
        self.remove_stale_sets()?;

        for rule in entry_rules(pod_networks) {
            let args = std::iter::once("-A")
                .chain(std::iter::once(Chain::MAIN))
                .chain(rule.iter().map(String::as_str))
                .collect::<Vec<_>>();
            self.iptables(&args)?;
        }

        if !self.iptables_check(&["-C", HOOK, "-j", Chain::MAIN])? {
            self.iptables(&["-I", HOOK, "1", "-j", Chain::MAIN])?;
        }

        info!(chain = %Chain::MAIN, networks = ?pod_networks, "Initialized chains");
        Ok(())
    }

    /// Destroys the sets of a previous run.
    ///
    /// No rule may reference them, so this runs once the chains are flushed. Every set is flushed
    /// before any is destroyed so that no list set still holds a member being destroyed.
    fn remove_stale_sets(&self) -> Result<()> {
        let listed = output(&self.ipset, &["list", "-n"])?;
        let stale = stale_sets(&listed);
        for set in &stale {
            self.ipset(&["flush", set])?;
        }
        for set in &stale {
            self.ipset(&["destroy", set])?;
        }
        if !stale.is_empty() {
            info!(sets = stale.len(), "Removed stale sets");
        }
        Ok(())
    }

    fn ipset(&self, args: &[&str]) -> Result<()> {
        run(&self.ipset, args)
    }

    fn iptables(&self, args: &[&str]) -> Result<()> {
        run(&self.iptables, &with_wait(args))
    }

    fn iptables_check(&self, args: &[&str]) -> Result<bool> {
        succeeds(&self.iptables, &with_wait(args))
    }
}

impl SetStore for Commands {
    fn create(&self, name: &SetName, kind: SetKind) -> Result<()> {
        self.ipset(&["create", name.as_str(), kind.as_str(), "-exist"])?;
        self.ipset(&["flush", name.as_str()])
    }

    fn destroy(&self, name: &SetName) -> Result<()> {
        self.ipset(&["destroy", name.as_str()])
    }

    fn add(&self, name: &SetName, member: &Member) -> Result<()> {
        let member = member.to_string();
        self.ipset(&["add", name.as_str(), &member, "-exist"])
    }

    fn remove(&self, name: &SetName, member: &Member) -> Result<()> {
        let member = member.to_string();
        self.ipset(&["del", name.as_str(), &member, "-exist"])
    }

    fn flush(&self, name: &SetName) -> Result<()> {
        self.ipset(&["flush", name.as_str()])
    }
}

impl RuleStore for Commands {
    fn ensure_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        let spec = rule.args();
        if self.iptables_check(&rule_args("-C", chain, &spec))? {
            trace!(%chain, %rule, "Rule already present");
            return Ok(());
        }
        self.iptables(&rule_args("-A", chain, &spec))
    }

    fn delete_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        self.iptables(&rule_args("-D", chain, &rule.args()))
    }
}

/// The rules of the entry chain, in order.
///
/// Return traffic is accepted first, then the default-allow and ingress chains get a chance to
/// accept new connections. Anything else destined to a pod network is dropped.
fn entry_rules(pod_networks: &[IpNet]) -> Vec<Vec<String>> {
    let mut rules = vec![
        vec![
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "RELATED,ESTABLISHED".to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
        vec!["-j".to_string(), Chain::Default.to_string()],
        vec!["-j".to_string(), Chain::Ingress.to_string()],
    ];
    rules.extend(pod_networks.iter().map(|net| {
        vec![
            "-d".to_string(),
            net.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }));
    rules
}

/// Names of the controller's sets in `ipset list -n` output.
fn stale_sets(listed: &str) -> Vec<&str> {
    listed
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(SetName::PREFIX))
        .collect()
}

fn rule_args<'a>(op: &'a str, chain: Chain, spec: &'a [String]) -> Vec<&'a str> {
    [op, chain.as_str()]
        .into_iter()
        .chain(spec.iter().map(String::as_str))
        .collect()
}

/// Waits a bounded time for the xtables lock rather than failing when another process holds it.
fn with_wait<'a>(args: &[&'a str]) -> Vec<&'a str> {
    ["-w", XTABLES_WAIT_SECS]
        .into_iter()
        .chain(args.iter().copied())
        .collect()
}

fn run(program: &Path, args: &[&str]) -> Result<()> {
    output(program, args).map(|_| ())
}

/// Runs a command, returning its stdout.
fn output(program: &Path, args: &[&str]) -> Result<String> {
    debug!(program = %program.display(), args = %args.join(" "), "Running");
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to execute {}", program.display()))?;
    if !output.status.success() {
        bail!(
            "{} {} failed ({}): {}",
            program.display(),
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a command whose exit status is the answer to a question, e.g. `iptables -C`.
fn succeeds(program: &Path, args: &[&str]) -> Result<bool> {
    trace!(program = %program.display(), args = %args.join(" "), "Checking");
    let status = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to execute {}", program.display()))?
        .status;
    Ok(status.success())
}
