use crate::{
    addresses::AddressTable,
    namespace::{Context, NamespaceState},
    network_policy::NetworkPolicy,
    pod::Pod,
    selector::SelectorRegistry,
    SelectorKey,
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Context as _, Result};
use netpol_controller_core::Kernel;
use netpol_controller_k8s_api::{self as k8s, Labels, Resource};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, instrument, trace};

pub type SharedIndex<K> = Arc<RwLock<Index<K>>>;

/// Holds all enforcement state and applies cluster events to the kernel.
///
/// Every update takes `&mut self`, so updates are serialized by the lock guarding a
/// [`SharedIndex`].
#[derive(Debug)]
pub struct Index<K> {
    namespaces: HashMap<String, NamespaceState>,
    selectors: SelectorRegistry,
    addresses: AddressTable,
    kernel: K,
}

/// A cloneable handle that applies each update under the shared index's write lock.
#[derive(Debug)]
pub struct Controller<K> {
    index: SharedIndex<K>,
}

// === impl Index ===

impl<K: Kernel> Index<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            namespaces: HashMap::default(),
            selectors: SelectorRegistry::default(),
            addresses: AddressTable::default(),
            kernel,
        }
    }

    pub fn shared(kernel: K) -> SharedIndex<K> {
        Arc::new(RwLock::new(Self::new(kernel)))
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn contains_namespace(&self, ns: &str) -> bool {
        self.namespaces.contains_key(ns)
    }

    /// Returns the names of all tracked namespaces, sorted.
    pub fn namespace_names(&self) -> Vec<String> {
        let mut names = self.namespaces.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Returns the number of references held on a selector's set, if it exists.
    pub fn selector_refs(&self, key: &SelectorKey) -> Option<usize> {
        self.selectors.refs(key)
    }

    #[cfg(test)]
    pub(crate) fn address_refs(
        &self,
        set: &netpol_controller_core::SetName,
        ip: std::net::IpAddr,
    ) -> Option<usize> {
        self.addresses.refs(set, ip)
    }

    /// Indicates that no selector sets or pod addresses are held.
    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.selectors.is_empty() && self.addresses.is_empty()
    }

    // === Namespaces ===

    #[instrument(skip(self, ns), fields(name = ?ns.metadata.name))]
    pub fn add_namespace(&mut self, ns: &k8s::Namespace) -> Result<()> {
        let name = cluster_name("namespace", ns)?;
        let labels = Labels::from(ns.metadata.labels.clone());
        self.with_ns(&name, |state, cx| state.apply_namespace(labels, cx))
            .with_context(|| format!("failed to apply namespace {name}"))
    }

    pub fn update_namespace(&mut self, old: &k8s::Namespace, new: &k8s::Namespace) -> Result<()> {
        let old_name = cluster_name("namespace", old)?;
        let new_name = cluster_name("namespace", new)?;
        if old_name != new_name {
            bail!("namespace {old_name} cannot be renamed to {new_name}");
        }
        self.add_namespace(new)
    }

    pub fn delete_namespace(&mut self, ns: &k8s::Namespace) -> Result<()> {
        let name = cluster_name("namespace", ns)?;
        self.remove_namespace(&name)
    }

    #[instrument(skip(self))]
    pub fn remove_namespace(&mut self, name: &str) -> Result<()> {
        if !self.contains_namespace(name) {
            trace!("Namespace not found");
            return Ok(());
        }
        self.with_ns(name, |state, cx| state.delete_namespace(cx))
            .with_context(|| format!("failed to delete namespace {name}"))
    }

    // === Pods ===

    #[instrument(
        skip(self, pod),
        fields(ns = ?pod.metadata.namespace, name = ?pod.metadata.name)
    )]
    pub fn add_pod(&mut self, pod: &k8s::Pod) -> Result<()> {
        let (ns, name) = namespaced_name("pod", pod)?;
        let state = Pod::from_resource(pod);
        self.with_ns(&ns, |ns_state, cx| ns_state.apply_pod(&name, state, cx))
            .with_context(|| format!("failed to apply pod {ns}/{name}"))
    }

    pub fn update_pod(&mut self, old: &k8s::Pod, new: &k8s::Pod) -> Result<()> {
        same_object("pod", old, new)?;
        self.add_pod(new)
    }

    pub fn delete_pod(&mut self, pod: &k8s::Pod) -> Result<()> {
        let (ns, name) = namespaced_name("pod", pod)?;
        self.remove_pod(&ns, &name)
    }

    #[instrument(skip(self))]
    pub fn remove_pod(&mut self, ns: &str, name: &str) -> Result<()> {
        if !self.contains_namespace(ns) {
            trace!("Namespace not found");
            return Ok(());
        }
        self.with_ns(ns, |state, cx| state.delete_pod(name, cx))
            .with_context(|| format!("failed to delete pod {ns}/{name}"))
    }

    // === NetworkPolicies ===

    #[instrument(
        skip(self, np),
        fields(ns = ?np.metadata.namespace, name = ?np.metadata.name)
    )]
    pub fn add_network_policy(&mut self, np: &k8s::NetworkPolicy) -> Result<()> {
        let (ns, name) = namespaced_name("networkpolicy", np)?;
        let policy = NetworkPolicy::from_resource(np)
            .with_context(|| format!("invalid networkpolicy {ns}/{name}"))?;
        self.with_ns(&ns, |state, cx| state.apply_policy(&name, policy, cx))
            .with_context(|| format!("failed to apply networkpolicy {ns}/{name}"))
    }

    pub fn update_network_policy(
        &mut self,
        old: &k8s::NetworkPolicy,
        new: &k8s::NetworkPolicy,
    ) -> Result<()> {
        same_object("networkpolicy", old, new)?;
        self.add_network_policy(new)
    }

    pub fn delete_network_policy(&mut self, np: &k8s::NetworkPolicy) -> Result<()> {
        let (ns, name) = namespaced_name("networkpolicy", np)?;
        self.remove_network_policy(&ns, &name)
    }

    #[instrument(skip(self))]
    pub fn remove_network_policy(&mut self, ns: &str, name: &str) -> Result<()> {
        if !self.contains_namespace(ns) {
            trace!("Namespace not found");
            return Ok(());
        }
        self.with_ns(ns, |state, cx| state.delete_policy(name, cx))
            .with_context(|| format!("failed to delete networkpolicy {ns}/{name}"))
    }

    /// Applies an update to a namespace, creating the namespace's state if necessary and tearing
    /// it down if the update leaves it empty.
    ///
    /// If the update fails, the namespace's state is retained so that the kernel objects it
    /// references may still be released by later updates.
    fn with_ns<F>(&mut self, ns: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NamespaceState, &mut Context<'_, K>) -> Result<()>,
    {
        let mut state = self.namespaces.remove(ns).unwrap_or_else(|| {
            trace!(%ns, "Creating namespace state");
            NamespaceState::new(ns)
        });

        let mut cx = Context {
            selectors: &mut self.selectors,
            addresses: &mut self.addresses,
            namespaces: &self.namespaces,
            kernel: &self.kernel,
        };
        let res = f(&mut state, &mut cx).and_then(|()| {
            if !state.is_empty() {
                return Ok(false);
            }
            state.destroy(&mut cx)?;
            Ok(true)
        });

        match res {
            Ok(false) => {
                self.namespaces.insert(ns.to_string(), state);
                Ok(())
            }
            Ok(true) => {
                debug!(%ns, "Removed empty namespace");
                Ok(())
            }
            Err(error) => {
                if !state.is_empty() || state.is_provisioned() {
                    self.namespaces.insert(ns.to_string(), state);
                }
                Err(error)
            }
        }
    }
}

fn cluster_name<T: Resource>(kind: &str, obj: &T) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| anyhow!("{kind} has no name"))
}

fn namespaced_name<T: Resource>(kind: &str, obj: &T) -> Result<(String, String)> {
    let name = cluster_name(kind, obj)?;
    let ns = obj
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| anyhow!("{kind} {name} has no namespace"))?;
    Ok((ns, name))
}

/// Ensures that an update refers to a single object.
fn same_object<T: Resource>(kind: &str, old: &T, new: &T) -> Result<()> {
    let (old_ns, old_name) = namespaced_name(kind, old)?;
    let (new_ns, new_name) = namespaced_name(kind, new)?;
    if old_ns != new_ns || old_name != new_name {
        bail!("{kind} {old_ns}/{old_name} cannot be moved to {new_ns}/{new_name}");
    }
    Ok(())
}

impl<K: Kernel> kubert::index::IndexNamespacedResource<k8s::Pod> for Index<K> {
    fn apply(&mut self, pod: k8s::Pod) {
        if let Err(error) = self.add_pod(&pod) {
            error!(?error, "Failed to apply pod");
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        if let Err(error) = self.remove_pod(&ns, &name) {
            error!(?error, "Failed to delete pod");
        }
    }

    // Since apply only reindexes a single pod at a time, there's no need to handle resets
    // specially.
}

impl<K: Kernel> kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index<K> {
    fn apply(&mut self, np: k8s::NetworkPolicy) {
        if let Err(error) = self.add_network_policy(&np) {
            error!(?error, "Failed to apply networkpolicy");
        }
    }

    fn delete(&mut self, ns: String, name: String) {
        if let Err(error) = self.remove_network_policy(&ns, &name) {
            error!(?error, "Failed to delete networkpolicy");
        }
    }
}

impl<K: Kernel> kubert::index::IndexClusterResource<k8s::Namespace> for Index<K> {
    fn apply(&mut self, ns: k8s::Namespace) {
        if let Err(error) = self.add_namespace(&ns) {
            error!(?error, "Failed to apply namespace");
        }
    }

    fn delete(&mut self, name: String) {
        if let Err(error) = self.remove_namespace(&name) {
            error!(?error, "Failed to delete namespace");
        }
    }
}

// === impl Controller ===

impl<K: Kernel> Controller<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            index: Index::shared(kernel),
        }
    }

    /// Returns the shared index, e.g. to drive it from a watch.
    pub fn index(&self) -> SharedIndex<K> {
        self.index.clone()
    }

    pub fn add_namespace(&self, ns: &k8s::Namespace) -> Result<()> {
        self.index.write().add_namespace(ns)
    }

    pub fn update_namespace(&self, old: &k8s::Namespace, new: &k8s::Namespace) -> Result<()> {
        self.index.write().update_namespace(old, new)
    }

    pub fn delete_namespace(&self, ns: &k8s::Namespace) -> Result<()> {
        self.index.write().delete_namespace(ns)
    }

    pub fn add_pod(&self, pod: &k8s::Pod) -> Result<()> {
        self.index.write().add_pod(pod)
    }

    pub fn update_pod(&self, old: &k8s::Pod, new: &k8s::Pod) -> Result<()> {
        self.index.write().update_pod(old, new)
    }

    pub fn delete_pod(&self, pod: &k8s::Pod) -> Result<()> {
        self.index.write().delete_pod(pod)
    }

    pub fn add_network_policy(&self, np: &k8s::NetworkPolicy) -> Result<()> {
        self.index.write().add_network_policy(np)
    }

    pub fn update_network_policy(
        &self,
        old: &k8s::NetworkPolicy,
        new: &k8s::NetworkPolicy,
    ) -> Result<()> {
        self.index.write().update_network_policy(old, new)
    }

    pub fn delete_network_policy(&self, np: &k8s::NetworkPolicy) -> Result<()> {
        self.index.write().delete_network_policy(np)
    }
}

impl<K> Clone for Controller<K> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
        }
    }
}
