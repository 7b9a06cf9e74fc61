use crate::SetName;
use anyhow::{bail, Error, Result};
use std::fmt;

/// The chains managed by the controller.
///
/// Both are reached from [`Chain::MAIN`], which the runtime hooks into the host's forwarding path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    /// Accepts traffic to pods that no policy isolates.
    Default,

    /// Accepts traffic admitted by NetworkPolicy ingress rules.
    Ingress,
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
    start: u16,
    end: u16,
}

/// An ACCEPT rule matching traffic to a destination set from one or more source sets.
///
/// A packet's source must be in *every* source set; an empty list matches any source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSpec {
    pub protocol: Option<Protocol>,
    pub sources: Vec<SetName>,
    pub destination: SetName,
    pub ports: Option<PortRange>,
}

/// Manages rules in the controller's chains.
pub trait RuleStore {
    /// Installs the rule unless an identical rule is already present.
    fn ensure_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()>;

    fn delete_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()>;
}

// === impl Chain ===

impl Chain {
    pub const MAIN: &'static str = "NPC";

    pub const ALL: [Chain; 2] = [Chain::Default, Chain::Ingress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "NPC-DEFAULT",
            Self::Ingress => "NPC-INGRESS",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            bail!("unsupported protocol: {s}")
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            bail!("port must not be zero");
        }
        if end < start {
            bail!("port range {start}-{end} is inverted");
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

// === impl RuleSpec ===

impl RuleSpec {
    /// Accepts all traffic destined to the given set.
    pub fn allow_to(destination: SetName) -> Self {
        Self {
            protocol: None,
            sources: vec![],
            destination,
            ports: None,
        }
    }

    /// Iterates over every set this rule references.
    pub fn sets(&self) -> impl Iterator<Item = &SetName> {
        self.sources.iter().chain(Some(&self.destination))
    }

    /// Renders the rule as iptables match arguments, including the jump target.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(proto) = self.protocol {
            args.extend(["-p".to_string(), proto.to_string()]);
        }
        for src in &self.sources {
            args.extend(match_set(src, "src"));
        }
        args.extend(match_set(&self.destination, "dst"));
        if let Some(ports) = self.ports {
            args.extend(["--dport".to_string(), ports.to_string()]);
        }
        args.extend(["-j".to_string(), "ACCEPT".to_string()]);
        args
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

fn match_set(set: &SetName, dir: &str) -> [String; 5] {
    [
        "-m".to_string(),
        "set".to_string(),
        "--match-set".to_string(),
        set.to_string(),
        dir.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_rule_args() {
        let dst = SetName::pod_selector("pods/ns-0/app=web");
        let src = SetName::namespace_selector("namespaces/env=prod");
        let rule = RuleSpec {
            protocol: Some(Protocol::Tcp),
            sources: vec![src.clone()],
            destination: dst.clone(),
            ports: Some(PortRange::new(8080, 8090).unwrap()),
        };
        assert_eq!(
            rule.to_string(),
            format!(
                "-p tcp -m set --match-set {src} src -m set --match-set {dst} dst \
                 --dport 8080:8090 -j ACCEPT"
            )
        );

        assert_eq!(
            RuleSpec::allow_to(dst.clone()).to_string(),
            format!("-m set --match-set {dst} dst -j ACCEPT")
        );
    }

    #[test]
    fn parses_protocols() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("SCTP".parse::<Protocol>().unwrap(), Protocol::Sctp);
        assert!("ICMP".parse::<Protocol>().is_err());
    }

    #[test]
    fn rejects_invalid_port_ranges() {
        assert!(PortRange::new(0, 10).is_err());
        assert!(PortRange::new(90, 80).is_err());
        assert_eq!(PortRange::single(53).to_string(), "53");
    }
}
