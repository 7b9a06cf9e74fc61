use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use netpol_controller_core::{SetKind, SetName, SetStore};
use netpol_controller_k8s_api::{Labels, Selector};
use std::fmt;
use tracing::{debug, trace, warn};

/// Describes what a selector is evaluated against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Pods in a single namespace or, when unset, in every namespace.
    Pods { namespace: Option<String> },

    /// Namespaces.
    Namespaces,
}

/// Identifies a shared selector set: a normalized selector qualified by its scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SelectorKey {
    scope: Scope,
    selector: Selector,
}

/// Interns selectors into shared, reference-counted kernel sets.
///
/// Entries are keyed by the canonical string of a [`SelectorKey`], so every consumer of an
/// equivalent selector shares one kernel set.
#[derive(Debug, Default)]
pub(crate) struct SelectorRegistry {
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    key: SelectorKey,
    set: SetName,
    refs: usize,
}

// === impl SelectorKey ===

impl SelectorKey {
    /// Selects pods in the given namespace.
    pub fn pods(namespace: impl Into<String>, selector: Selector) -> Self {
        Self {
            scope: Scope::Pods {
                namespace: Some(namespace.into()),
            },
            selector,
        }
    }

    /// Selects pods in every namespace.
    pub fn cluster_pods(selector: Selector) -> Self {
        Self {
            scope: Scope::Pods { namespace: None },
            selector,
        }
    }

    pub fn namespaces(selector: Selector) -> Self {
        Self {
            scope: Scope::Namespaces,
            selector,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// The name of the kernel set backing this selector.
    pub fn set_name(&self) -> SetName {
        let canonical = self.to_string();
        match self.scope {
            Scope::Pods { .. } => SetName::pod_selector(&canonical),
            Scope::Namespaces => SetName::namespace_selector(&canonical),
        }
    }

    pub fn set_kind(&self) -> SetKind {
        match self.scope {
            Scope::Pods { .. } => SetKind::HashIp,
            Scope::Namespaces => SetKind::ListSet,
        }
    }

    /// Indicates whether pods in the given namespace are evaluated by this selector.
    pub(crate) fn selects_pods_in(&self, ns: &str) -> bool {
        match self.scope {
            Scope::Pods {
                namespace: Some(ref n),
            } => n == ns,
            Scope::Pods { namespace: None } => true,
            Scope::Namespaces => false,
        }
    }
}

impl fmt::Display for SelectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Pods {
                namespace: Some(ref ns),
            } => write!(f, "pods/{}/{}", ns, self.selector),
            Scope::Pods { namespace: None } => write!(f, "pods/*/{}", self.selector),
            Scope::Namespaces => write!(f, "namespaces/{}", self.selector),
        }
    }
}

// === impl SelectorRegistry ===

impl SelectorRegistry {
    /// Acquires a reference to the selector's set, creating the set if it does not yet exist.
    ///
    /// When the set is created, `populate` is invoked with it before this method returns so that
    /// the set reflects every pod and namespace that already exists. If population fails, the
    /// set is torn down again and no reference is held.
    pub(crate) fn acquire<F>(
        &mut self,
        key: &SelectorKey,
        sets: &impl SetStore,
        populate: F,
    ) -> Result<SetName>
    where
        F: FnOnce(&SelectorKey, &SetName) -> Result<()>,
    {
        let canonical = key.to_string();
        if let Some(entry) = self.entries.get_mut(&canonical) {
            entry.refs += 1;
            trace!(selector = %canonical, refs = entry.refs, "Acquired selector");
            return Ok(entry.set.clone());
        }

        let set = key.set_name();
        sets.create(&set, key.set_kind())
            .with_context(|| format!("failed to create set {set} for selector {canonical}"))?;
        if let Err(error) = populate(key, &set) {
            if let Err(error) = sets.destroy(&set) {
                warn!(%set, %error, "Failed to destroy unpopulated selector set");
            }
            return Err(error.context(format!("failed to populate selector {canonical}")));
        }

        debug!(selector = %canonical, %set, "Created selector set");
        self.entries.insert(
            canonical,
            Entry {
                key: key.clone(),
                set: set.clone(),
                refs: 1,
            },
        );
        Ok(set)
    }

    /// Releases a reference to the selector's set, destroying the set with the last reference.
    pub(crate) fn release(&mut self, key: &SelectorKey, sets: &impl SetStore) -> Result<()> {
        let canonical = key.to_string();
        let Some(entry) = self.entries.get_mut(&canonical) else {
            bail!("selector {canonical} is not registered");
        };

        if entry.refs > 1 {
            entry.refs -= 1;
            trace!(selector = %canonical, refs = entry.refs, "Released selector");
            return Ok(());
        }

        sets.flush(&entry.set)
            .and_then(|()| sets.destroy(&entry.set))
            .with_context(|| {
                format!("failed to destroy set {} for selector {canonical}", entry.set)
            })?;
        debug!(selector = %canonical, set = %entry.set, "Destroyed selector set");
        self.entries.remove(&canonical);
        Ok(())
    }

    /// Returns the number of live references to a selector.
    pub(crate) fn refs(&self, key: &SelectorKey) -> Option<usize> {
        self.entries.get(&key.to_string()).map(|e| e.refs)
    }

    /// Evaluates a selector against an arbitrary label set.
    pub(crate) fn matches(selector: &Selector, labels: &Labels) -> bool {
        selector.matches(labels)
    }

    /// Iterates over the sets of pod selectors that select a pod with the given labels in the
    /// given namespace.
    pub(crate) fn pod_sets<'a>(
        &'a self,
        ns: &'a str,
        labels: &'a Labels,
    ) -> impl Iterator<Item = &'a SetName> + 'a {
        self.entries.values().filter_map(move |e| {
            (e.key.selects_pods_in(ns) && Self::matches(&e.key.selector, labels)).then_some(&e.set)
        })
    }

    /// Iterates over the sets of namespace selectors that select a namespace with the given
    /// labels.
    pub(crate) fn namespace_sets<'a>(
        &'a self,
        labels: &'a Labels,
    ) -> impl Iterator<Item = &'a SetName> + 'a {
        self.entries.values().filter_map(move |e| {
            (e.key.scope == Scope::Namespaces && Self::matches(&e.key.selector, labels))
                .then_some(&e.set)
        })
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_controller_core::Memory;

    fn web() -> Selector {
        Some(("app", "web")).into_iter().collect()
    }

    #[test]
    fn keys_are_scoped() {
        let a = SelectorKey::pods("ns-0", web());
        let b = SelectorKey::pods("ns-1", web());
        let c = SelectorKey::cluster_pods(web());
        let d = SelectorKey::namespaces(web());
        assert_eq!(a.to_string(), "pods/ns-0/app=web");
        assert_eq!(c.to_string(), "pods/*/app=web");
        assert_eq!(d.to_string(), "namespaces/app=web");

        let names = [&a, &b, &c, &d].map(|k| k.set_name());
        for (i, x) in names.iter().enumerate() {
            for y in names.iter().skip(i + 1) {
                assert_ne!(x, y);
            }
        }

        assert!(a.selects_pods_in("ns-0"));
        assert!(!a.selects_pods_in("ns-1"));
        assert!(c.selects_pods_in("ns-1"));
        assert!(!d.selects_pods_in("ns-0"));
    }

    #[test]
    fn reference_counts_track_acquisitions() {
        let kernel = Memory::default();
        let mut registry = SelectorRegistry::default();
        let key = SelectorKey::pods("ns-0", web());

        let mut populated = 0;
        let set = registry
            .acquire(&key, &kernel, |_, _| {
                populated += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(populated, 1);
        assert!(kernel.contains_set(&set));

        let again = registry
            .acquire(&key, &kernel, |_, _| panic!("must not repopulate"))
            .unwrap();
        assert_eq!(set, again);
        assert_eq!(registry.refs(&key), Some(2));

        registry.release(&key, &kernel).unwrap();
        assert_eq!(registry.refs(&key), Some(1));
        assert!(kernel.contains_set(&set));

        registry.release(&key, &kernel).unwrap();
        assert_eq!(registry.refs(&key), None);
        assert!(!kernel.contains_set(&set));
        assert!(registry.is_empty());

        registry
            .release(&key, &kernel)
            .expect_err("unknown selectors cannot be released");
    }

    #[test]
    fn failed_population_holds_no_reference() {
        let kernel = Memory::default();
        let mut registry = SelectorRegistry::default();
        let key = SelectorKey::namespaces(web());

        registry
            .acquire(&key, &kernel, |_, _| anyhow::bail!("boom"))
            .expect_err("population fails");
        assert_eq!(registry.refs(&key), None);
        assert!(!kernel.contains_set(&key.set_name()));
    }

    #[test]
    fn iterates_matching_sets() {
        let kernel = Memory::default();
        let mut registry = SelectorRegistry::default();
        let local = SelectorKey::pods("ns-0", web());
        let cluster = SelectorKey::cluster_pods(Selector::default());
        let other = SelectorKey::pods("ns-1", Selector::default());
        let nss = SelectorKey::namespaces(Some(("env", "prod")).into_iter().collect());
        for key in [&local, &cluster, &other, &nss] {
            registry.acquire(key, &kernel, |_, _| Ok(())).unwrap();
        }

        let web_labels = Labels::from_iter(Some(("app", "web")));
        let mut sets = registry.pod_sets("ns-0", &web_labels).cloned().collect::<Vec<_>>();
        sets.sort();
        let mut expected = vec![local.set_name(), cluster.set_name()];
        expected.sort();
        assert_eq!(sets, expected);

        let prod = Labels::from_iter(Some(("env", "prod")));
        assert_eq!(
            registry.namespace_sets(&prod).cloned().collect::<Vec<_>>(),
            vec![nss.set_name()]
        );
        assert_eq!(registry.namespace_sets(&Labels::default()).count(), 0);
    }
}
