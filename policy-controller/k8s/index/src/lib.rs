//! NetworkPolicy Controller index
//!
//! The index translates cluster state into packet-filter configuration. It watches the following
//! resources:
//!
//! - Each `Namespace` carries labels that `namespaceSelector` peers select over.
//! - Each `Pod` contributes its IP to its namespace's all-pods set and to every pod-selector set
//!   whose selector matches its labels.
//! - Each `NetworkPolicy` isolates the pods its `podSelector` targets and admits traffic from its
//!   ingress peers.
//!
//! ```text
//! [ Namespace ] <- [ NetworkPolicy ] -> [ Pod ]
//! ```
//!
//! Selectors are shared: every policy that uses an equivalent selector references the same kernel
//! set, which is created (and populated) on first use and destroyed when the last policy releases
//! it. Pods that no ingress policy targets are placed in their namespace's default-allow set.
//!
//! All state is scoped within a per-namespace record that exists only while the namespace has
//! pods, policies, or an observed `Namespace` object.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod addresses;
mod index;
mod namespace;
mod network_policy;
mod pod;
mod rules;
mod selector;


pub use self::{
    index::{Controller, Index, SharedIndex},
    selector::{Scope, SelectorKey},
};
