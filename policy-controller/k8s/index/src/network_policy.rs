use crate::SelectorKey;
use ahash::AHashSet as HashSet;
use anyhow::{Context, Result};
use netpol_controller_core::{PortRange, Protocol, RuleSpec};
use netpol_controller_k8s_api::{self as k8s, IntOrString, LabelSelector, Selector};
use tracing::warn;

/// The ingress-relevant portion of a `NetworkPolicy`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct NetworkPolicy {
    /// Selects the pods this policy isolates. `None` when the policy does not apply to ingress.
    pub(crate) target: Option<Selector>,

    pub(crate) ingress: Vec<IngressRule>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IngressRule {
    /// Permitted sources. `None` admits any source.
    peers: Option<Vec<Peer>>,

    /// Permitted destination ports. `None` admits all traffic.
    ports: Option<Vec<PortMatch>>,
}

#[derive(Clone, Debug, PartialEq)]
enum Peer {
    /// Pods in the policy's namespace.
    Pods(Selector),

    /// All pods in the selected namespaces.
    Namespaces(Selector),

    /// Selected pods in the selected namespaces.
    PodsInNamespaces {
        pods: Selector,
        namespaces: Selector,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct PortMatch {
    protocol: Protocol,
    ports: Option<PortRange>,
}

/// The kernel objects a policy requires.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Compiled {
    pub(crate) selectors: HashSet<SelectorKey>,
    pub(crate) rules: HashSet<RuleSpec>,
}

// === impl NetworkPolicy ===

impl NetworkPolicy {
    pub(crate) fn from_resource(np: &k8s::NetworkPolicy) -> Result<Self> {
        let name = np.metadata.name.as_deref().unwrap_or_default();
        let Some(spec) = np.spec.as_ref() else {
            return Ok(Self {
                target: None,
                ingress: vec![],
            });
        };

        if !affects_ingress(spec.policy_types.as_deref()) {
            return Ok(Self {
                target: None,
                ingress: vec![],
            });
        }

        let target: Option<LabelSelector> = spec.pod_selector.clone().into();
        let target = target
            .map(Selector::try_from)
            .transpose()
            .context("invalid podSelector")?
            .unwrap_or_default();

        let ingress = spec
            .ingress
            .iter()
            .flatten()
            .enumerate()
            .map(|(i, rule)| {
                IngressRule::from_resource(name, rule)
                    .with_context(|| format!("invalid ingress rule {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            target: Some(target),
            ingress,
        })
    }

    /// Compiles the policy's ingress rules into the selectors and rules it needs in `ns`.
    pub(crate) fn compile(&self, ns: &str) -> Compiled {
        let mut compiled = Compiled::default();
        let Some(target) = self.target.as_ref() else {
            return compiled;
        };

        let dst = SelectorKey::pods(ns, target.clone());
        for rule in &self.ingress {
            let sources = match rule.peers {
                None => vec![vec![]],
                Some(ref peers) => peers.iter().map(|p| p.keys(ns)).collect(),
            };
            let ports = match rule.ports {
                None => vec![None],
                Some(ref ports) => ports.iter().copied().map(Some).collect(),
            };

            for src in &sources {
                for port in &ports {
                    compiled.rules.insert(RuleSpec {
                        protocol: port.map(|p| p.protocol),
                        sources: src.iter().map(SelectorKey::set_name).collect(),
                        destination: dst.set_name(),
                        ports: port.and_then(|p| p.ports),
                    });
                    compiled.selectors.extend(src.iter().cloned());
                    compiled.selectors.insert(dst.clone());
                }
            }
        }

        compiled
    }

    /// Indicates whether the policy isolates pods with the given labels.
    #[cfg(test)]
    pub(crate) fn targets(&self, labels: &k8s::Labels) -> bool {
        self.target
            .as_ref()
            .map(|t| t.matches(labels))
            .unwrap_or(false)
    }
}

/// A policy applies to ingress unless it declares policy types that exclude it.
fn affects_ingress(types: Option<&[String]>) -> bool {
    match types {
        None => true,
        Some(types) => types.iter().any(|t| t == "Ingress"),
    }
}

// === impl IngressRule ===

impl IngressRule {
    fn from_resource(policy: &str, rule: &k8s::NetworkPolicyIngressRule) -> Result<Self> {
        let peers = match rule.from.as_deref() {
            None | Some([]) => None,
            Some(peers) => {
                let mut parsed = Vec::with_capacity(peers.len());
                for peer in peers {
                    if let Some(peer) = Peer::from_resource(policy, peer)? {
                        parsed.push(peer);
                    }
                }
                Some(parsed)
            }
        };

        let ports = match rule.ports.as_deref() {
            None | Some([]) => None,
            Some(ports) => Some(
                ports
                    .iter()
                    .filter_map(|p| PortMatch::from_resource(policy, p))
                    .collect(),
            ),
        };

        Ok(Self { peers, ports })
    }
}

// === impl Peer ===

impl Peer {
    fn from_resource(policy: &str, peer: &k8s::NetworkPolicyPeer) -> Result<Option<Self>> {
        let pods = peer
            .pod_selector
            .as_ref()
            .map(Selector::try_from)
            .transpose()
            .context("invalid podSelector")?;
        let namespaces = peer
            .namespace_selector
            .as_ref()
            .map(Selector::try_from)
            .transpose()
            .context("invalid namespaceSelector")?;

        let peer = match (pods, namespaces) {
            (Some(pods), None) => Self::Pods(pods),
            (None, Some(namespaces)) => Self::Namespaces(namespaces),
            (Some(pods), Some(namespaces)) => Self::PodsInNamespaces { pods, namespaces },
            (None, None) => {
                warn!(%policy, "Skipping unsupported ingress peer");
                return Ok(None);
            }
        };
        Ok(Some(peer))
    }

    /// The selectors a source must be in, all of them.
    fn keys(&self, ns: &str) -> Vec<SelectorKey> {
        match self {
            Self::Pods(pods) => vec![SelectorKey::pods(ns, pods.clone())],
            Self::Namespaces(namespaces) => vec![SelectorKey::namespaces(namespaces.clone())],
            Self::PodsInNamespaces { pods, namespaces } => vec![
                SelectorKey::namespaces(namespaces.clone()),
                SelectorKey::cluster_pods(pods.clone()),
            ],
        }
    }
}

// === impl PortMatch ===

impl PortMatch {
    fn from_resource(policy: &str, port: &k8s::NetworkPolicyPort) -> Option<Self> {
        let protocol = match port.protocol.as_deref() {
            None => Protocol::Tcp,
            Some(p) => match p.parse() {
                Ok(p) => p,
                Err(error) => {
                    warn!(%policy, %error, "Skipping port");
                    return None;
                }
            },
        };

        let start = match port.port {
            None => return Some(Self { protocol, ports: None }),
            Some(IntOrString::Int(port)) => port,
            Some(IntOrString::String(ref name)) => {
                warn!(%policy, port = %name, "Skipping named port");
                return None;
            }
        };

        match to_range(start, port.end_port) {
            Ok(ports) => Some(Self {
                protocol,
                ports: Some(ports),
            }),
            Err(error) => {
                warn!(%policy, %error, "Skipping port");
                None
            }
        }
    }
}

fn to_range(start: i32, end: Option<i32>) -> Result<PortRange> {
    let start = u16::try_from(start).with_context(|| format!("invalid port {start}"))?;
    let end = match end {
        Some(end) => u16::try_from(end).with_context(|| format!("invalid end port {end}"))?,
        None => start,
    };
    PortRange::new(start, end)
}
