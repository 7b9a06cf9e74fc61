use crate::{
    addresses::AddressTable,
    network_policy::{Compiled, NetworkPolicy},
    pod::Pod,
    rules::RuleTable,
    selector::{Scope, SelectorRegistry},
    SelectorKey,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context as _, Result};
use netpol_controller_core::{Chain, Kernel, Member, RuleSpec, SetKind, SetName};
use netpol_controller_k8s_api::{Labels, Selector};
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, trace, warn};

/// Holds the state of a single namespace: its pods, its policies, and the kernel objects they
/// require.
#[derive(Debug)]
pub(crate) struct NamespaceState {
    name: String,

    /// The labels of the `Namespace` object, if it has been observed.
    labels: Option<Labels>,

    pods: HashMap<String, Pod>,

    policies: HashMap<String, PolicyState>,

    rules: RuleTable,

    /// Set once the namespace's all-pods set, default-allow set, and default rule exist.
    provisioned: bool,
}

/// The kernel objects held on behalf of a single policy.
#[derive(Debug, Default)]
struct PolicyState {
    target: Option<Selector>,
    selectors: HashSet<SelectorKey>,
    rules: HashSet<RuleSpec>,
}

/// Cluster-wide state made available while a namespace is being updated.
///
/// The namespace being updated is not in `namespaces`.
pub(crate) struct Context<'a, K> {
    pub(crate) selectors: &'a mut SelectorRegistry,
    pub(crate) addresses: &'a mut AddressTable,
    pub(crate) namespaces: &'a HashMap<String, NamespaceState>,
    pub(crate) kernel: &'a K,
}

type Membership = BTreeSet<(SetName, IpAddr)>;

// === impl NamespaceState ===

impl NamespaceState {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: None,
            pods: HashMap::default(),
            policies: HashMap::default(),
            rules: RuleTable::default(),
            provisioned: false,
        }
    }

    /// A namespace is empty when nothing in the cluster refers to it.
    pub(crate) fn is_empty(&self) -> bool {
        self.pods.is_empty() && self.policies.is_empty() && self.labels.is_none()
    }

    pub(crate) fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    #[cfg(test)]
    pub(crate) fn contains_pod(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    #[cfg(test)]
    pub(crate) fn contains_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Creates the namespace's kernel objects if they do not yet exist.
    fn provision<K: Kernel>(&mut self, cx: &mut Context<'_, K>) -> Result<()> {
        if self.provisioned {
            return Ok(());
        }

        let all_pods = SetName::all_pods(&self.name);
        let default_allow = SetName::default_allow(&self.name);
        cx.kernel
            .create(&all_pods, SetKind::HashIp)
            .context("failed to create all-pods set")?;
        if let Err(error) = cx.kernel.create(&default_allow, SetKind::HashIp) {
            discard(&[&all_pods], cx.kernel);
            return Err(error.context("failed to create default-allow set"));
        }
        if let Err(error) = cx
            .kernel
            .ensure_rule(Chain::Default, &RuleSpec::allow_to(default_allow.clone()))
        {
            discard(&[&default_allow, &all_pods], cx.kernel);
            return Err(error.context("failed to install default-allow rule"));
        }
        self.provisioned = true;
        debug!(ns = %self.name, %all_pods, "Provisioned namespace");

        let member = Member::Set(all_pods);
        for set in self.namespace_memberships(cx.selectors) {
            cx.kernel.add(&set, &member)?;
        }
        Ok(())
    }

    /// Tears down every kernel object held by this namespace.
    pub(crate) fn destroy<K: Kernel>(&mut self, cx: &mut Context<'_, K>) -> Result<()> {
        let policies = self.policies.keys().cloned().collect::<Vec<_>>();
        for name in policies {
            self.delete_policy(&name, cx)?;
        }

        let pods = self.pods.keys().cloned().collect::<Vec<_>>();
        for name in pods {
            self.delete_pod(&name, cx)?;
        }

        self.delete_namespace(cx)?;

        if !self.provisioned {
            return Ok(());
        }
        let all_pods = SetName::all_pods(&self.name);
        let default_allow = SetName::default_allow(&self.name);
        cx.kernel
            .delete_rule(Chain::Default, &RuleSpec::allow_to(default_allow.clone()))
            .context("failed to delete default-allow rule")?;
        cx.kernel
            .destroy(&default_allow)
            .context("failed to destroy default-allow set")?;
        cx.kernel
            .destroy(&all_pods)
            .context("failed to destroy all-pods set")?;
        self.provisioned = false;
        debug!(ns = %self.name, "Destroyed namespace");
        Ok(())
    }

    // === Namespace ===

    pub(crate) fn apply_namespace<K: Kernel>(
        &mut self,
        labels: Labels,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        self.provision(cx)?;
        if self.labels.as_ref() == Some(&labels) {
            trace!(ns = %self.name, "No changes");
            return Ok(());
        }

        let before = self.namespace_memberships(cx.selectors);
        self.labels = Some(labels);
        let after = self.namespace_memberships(cx.selectors);
        self.sync_namespace_memberships(&before, &after, cx)
    }

    /// Forgets the `Namespace` object. The namespace's pods and policies are unaffected.
    pub(crate) fn delete_namespace<K: Kernel>(&mut self, cx: &mut Context<'_, K>) -> Result<()> {
        let before = self.namespace_memberships(cx.selectors);
        self.labels = None;
        self.sync_namespace_memberships(&before, &BTreeSet::new(), cx)
    }

    /// Returns the namespace-selector sets that should contain this namespace's all-pods set.
    fn namespace_memberships(&self, selectors: &SelectorRegistry) -> BTreeSet<SetName> {
        match self.selectable_labels() {
            Some(labels) => selectors.namespace_sets(labels).cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Namespaces are selectable once they have been observed and their all-pods set exists.
    fn selectable_labels(&self) -> Option<&Labels> {
        self.labels.as_ref().filter(|_| self.provisioned)
    }

    fn sync_namespace_memberships<K: Kernel>(
        &self,
        before: &BTreeSet<SetName>,
        after: &BTreeSet<SetName>,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        let member = Member::Set(SetName::all_pods(&self.name));
        for set in before.difference(after) {
            cx.kernel
                .remove(set, &member)
                .with_context(|| format!("failed to leave namespace selector set {set}"))?;
        }
        for set in after.difference(before) {
            cx.kernel
                .add(set, &member)
                .with_context(|| format!("failed to join namespace selector set {set}"))?;
        }
        Ok(())
    }

    // === Pods ===

    pub(crate) fn apply_pod<K: Kernel>(
        &mut self,
        name: &str,
        pod: Pod,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        self.provision(cx)?;
        let before = match self.pods.get(name) {
            Some(p) if *p == pod => {
                trace!(ns = %self.name, %name, "No changes");
                return Ok(());
            }
            Some(p) => self.pod_members(p, cx.selectors),
            None => Membership::new(),
        };
        let after = self.pod_members(&pod, cx.selectors);
        sync_members(&before, &after, cx)?;
        trace!(ns = %self.name, %name, ip = ?pod.ip, sets = after.len(), "Applied pod");
        self.pods.insert(name.to_string(), pod);
        Ok(())
    }

    pub(crate) fn delete_pod<K: Kernel>(
        &mut self,
        name: &str,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        let Some(pod) = self.pods.get(name) else {
            trace!(ns = %self.name, %name, "Pod not found");
            return Ok(());
        };
        let before = self.pod_members(pod, cx.selectors);
        sync_members(&before, &Membership::new(), cx)?;
        trace!(ns = %self.name, %name, "Deleted pod");
        self.pods.remove(name);
        Ok(())
    }

    /// Computes every set a pod's address belongs in.
    fn pod_members(&self, pod: &Pod, selectors: &SelectorRegistry) -> Membership {
        let Some(ip) = pod.ip else {
            return Membership::new();
        };

        let mut members = Membership::new();
        members.insert((SetName::all_pods(&self.name), ip));
        if !self.is_targeted(&pod.labels) {
            members.insert((SetName::default_allow(&self.name), ip));
        }
        for set in selectors.pod_sets(&self.name, &pod.labels) {
            members.insert((set.clone(), ip));
        }
        members
    }

    // === Policies ===

    pub(crate) fn apply_policy<K: Kernel>(
        &mut self,
        name: &str,
        policy: NetworkPolicy,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        self.provision(cx)?;
        let compiled = policy.compile(&self.name);
        self.reconcile_policy(name, policy.target, compiled, cx)?;
        trace!(ns = %self.name, %name, rules = self.rules.len(), "Applied policy");
        Ok(())
    }

    pub(crate) fn delete_policy<K: Kernel>(
        &mut self,
        name: &str,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        if !self.policies.contains_key(name) {
            trace!(ns = %self.name, %name, "Policy not found");
            return Ok(());
        }
        self.reconcile_policy(name, None, Compiled::default(), cx)?;
        self.policies.remove(name);
        trace!(ns = %self.name, %name, "Deleted policy");
        Ok(())
    }

    /// Moves a policy's kernel objects to a new target and compilation.
    ///
    /// New selectors and rules are put in place before the policy retargets, and old ones are
    /// removed only afterwards, so objects shared by both versions are never recreated. The
    /// policy's record reflects each step as it completes, so a failed update may be retried.
    fn reconcile_policy<K: Kernel>(
        &mut self,
        name: &str,
        target: Option<Selector>,
        compiled: Compiled,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        let mut held = self.policies.remove(name).unwrap_or_default();
        if held.target == target
            && held.selectors == compiled.selectors
            && held.rules == compiled.rules
        {
            trace!(ns = %self.name, %name, "No changes");
            self.policies.insert(name.to_string(), held);
            return Ok(());
        }

        let res = self.acquire_policy(&mut held, &compiled, cx);
        self.policies.insert(name.to_string(), held);
        res?;

        let before = self.default_allowed();
        if let Some(held) = self.policies.get_mut(name) {
            held.target = target;
        }
        self.sync_default_allowed(&before, cx)?;

        let Self {
            policies, rules, ..
        } = self;
        let Some(held) = policies.get_mut(name) else {
            return Ok(());
        };
        let stale_rules = held
            .rules
            .difference(&compiled.rules)
            .cloned()
            .collect::<Vec<_>>();
        for rule in stale_rules {
            rules.release(&rule, cx.kernel)?;
            held.rules.remove(&rule);
        }
        let stale_selectors = held
            .selectors
            .difference(&compiled.selectors)
            .cloned()
            .collect::<Vec<_>>();
        for key in stale_selectors {
            cx.selectors.release(&key, cx.kernel)?;
            if cx.selectors.refs(&key).is_none() {
                cx.addresses.forget(&key.set_name());
            }
            held.selectors.remove(&key);
        }
        Ok(())
    }

    /// Acquires the selectors and installs the rules a compiled policy needs but does not yet hold.
    fn acquire_policy<K: Kernel>(
        &mut self,
        held: &mut PolicyState,
        compiled: &Compiled,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        let keys = compiled
            .selectors
            .difference(&held.selectors)
            .cloned()
            .collect::<Vec<_>>();
        for key in keys {
            self.acquire(&key, cx)?;
            held.selectors.insert(key);
        }

        let rules = compiled
            .rules
            .difference(&held.rules)
            .cloned()
            .collect::<Vec<_>>();
        for rule in rules {
            self.rules.ensure(&rule, cx.kernel)?;
            held.rules.insert(rule);
        }
        Ok(())
    }

    /// Acquires a selector, populating its set from every namespace if it is new.
    fn acquire<K: Kernel>(&self, key: &SelectorKey, cx: &mut Context<'_, K>) -> Result<SetName> {
        let Context {
            selectors,
            addresses,
            namespaces,
            kernel,
        } = cx;
        let kernel = *kernel;
        let all = std::iter::once(self).chain(namespaces.values());
        let res = selectors.acquire(key, kernel, |key, set| {
            populate(key, set, all, addresses, kernel)
        });
        if res.is_err() {
            // The set was torn down, along with whatever population added to it.
            addresses.forget(&key.set_name());
        }
        res
    }

    fn is_targeted(&self, labels: &Labels) -> bool {
        self.policies.values().any(|p| {
            p.target
                .as_ref()
                .map(|t| SelectorRegistry::matches(t, labels))
                .unwrap_or(false)
        })
    }

    /// Returns the scheduled pods that no ingress policy isolates, with their addresses.
    ///
    /// Pods are listed individually since each holds its own reference to its address.
    fn default_allowed(&self) -> BTreeSet<(String, IpAddr)> {
        self.pods
            .iter()
            .filter(|(_, p)| !self.is_targeted(&p.labels))
            .filter_map(|(name, p)| Some((name.clone(), p.ip?)))
            .collect()
    }

    fn sync_default_allowed<K: Kernel>(
        &self,
        before: &BTreeSet<(String, IpAddr)>,
        cx: &mut Context<'_, K>,
    ) -> Result<()> {
        let after = self.default_allowed();
        let set = SetName::default_allow(&self.name);
        for (_, ip) in before.difference(&after) {
            cx.addresses.remove(&set, *ip, cx.kernel)?;
        }
        for (_, ip) in after.difference(before) {
            cx.addresses.add(&set, *ip, cx.kernel)?;
        }
        Ok(())
    }
}

/// Destroys sets created by a provisioning attempt that failed part way.
fn discard<K: Kernel>(sets: &[&SetName], kernel: &K) {
    for set in sets {
        if let Err(error) = kernel.destroy(set) {
            warn!(%set, %error, "Failed to destroy set");
        }
    }
}

/// Adds the addresses and namespaces a new selector set should hold.
fn populate<'n, K: Kernel>(
    key: &SelectorKey,
    set: &SetName,
    namespaces: impl Iterator<Item = &'n NamespaceState>,
    addresses: &mut AddressTable,
    kernel: &K,
) -> Result<()> {
    for ns in namespaces {
        match key.scope() {
            Scope::Pods { .. } => {
                if !key.selects_pods_in(&ns.name) {
                    continue;
                }
                for pod in ns.pods.values() {
                    if let Some(ip) = pod.ip {
                        if SelectorRegistry::matches(key.selector(), &pod.labels) {
                            addresses.add(set, ip, kernel)?;
                        }
                    }
                }
            }
            Scope::Namespaces => {
                if let Some(labels) = ns.selectable_labels() {
                    if SelectorRegistry::matches(key.selector(), labels) {
                        kernel.add(set, &Member::Set(SetName::all_pods(&ns.name)))?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Releases a pod's stale set memberships before taking new ones.
fn sync_members<K: Kernel>(
    before: &Membership,
    after: &Membership,
    cx: &mut Context<'_, K>,
) -> Result<()> {
    for (set, ip) in before.difference(after) {
        cx.addresses.remove(set, *ip, cx.kernel)?;
    }
    for (set, ip) in after.difference(before) {
        cx.addresses.add(set, *ip, cx.kernel)?;
    }
    Ok(())
}
