use anyhow::Result;
use sha2::{Digest, Sha256};
use std::{fmt, net::IpAddr};

/// The name of a kernel set.
///
/// Names are derived from a stable input (a namespace name or a canonical selector) so that the
/// same logical set always maps to the same kernel object, across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetName(String);

/// The type of a kernel set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Holds IP addresses.
    HashIp,

    /// Holds other sets.
    ListSet,
}

/// An entry in a kernel set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {
    Ip(IpAddr),
    Set(SetName),
}

/// Manages named kernel sets.
pub trait SetStore {
    fn create(&self, name: &SetName, kind: SetKind) -> Result<()>;

    fn destroy(&self, name: &SetName) -> Result<()>;

    fn add(&self, name: &SetName, member: &Member) -> Result<()>;

    fn remove(&self, name: &SetName, member: &Member) -> Result<()>;

    fn flush(&self, name: &SetName) -> Result<()>;
}

// === impl SetName ===

impl SetName {
    pub const PREFIX: &'static str = "npc-";

    /// ipset names are limited to 31 bytes, so only a prefix of the digest is used.
    const DIGEST_CHARS: usize = 24;

    /// Holds the address of every scheduled pod in a namespace.
    pub fn all_pods(namespace: &str) -> Self {
        Self::derive('a', namespace)
    }

    /// Holds the address of every scheduled pod in a namespace that no policy isolates.
    pub fn default_allow(namespace: &str) -> Self {
        Self::derive('d', namespace)
    }

    /// Holds the addresses of pods selected by a pod selector.
    pub fn pod_selector(key: &str) -> Self {
        Self::derive('p', key)
    }

    /// Holds the all-pods sets of namespaces selected by a namespace selector.
    pub fn namespace_selector(key: &str) -> Self {
        Self::derive('n', key)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derive(tag: char, input: &str) -> Self {
        let mut digest = hex::encode(Sha256::digest(input.as_bytes()));
        digest.truncate(Self::DIGEST_CHARS);
        Self(format!("{}{}-{}", Self::PREFIX, tag, digest))
    }
}

impl AsRef<str> for SetName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl SetKind ===

impl SetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashIp => "hash:ip",
            Self::ListSet => "list:set",
        }
    }

    /// Indicates whether the member may be stored in a set of this kind.
    pub fn accepts(&self, member: &Member) -> bool {
        matches!(
            (self, member),
            (Self::HashIp, Member::Ip(_)) | (Self::ListSet, Member::Set(_))
        )
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Member ===

impl From<IpAddr> for Member {
    fn from(ip: IpAddr) -> Self {
        Self::Ip(ip)
    }
}

impl From<SetName> for Member {
    fn from(set: SetName) -> Self {
        Self::Set(set)
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => ip.fmt(f),
            Self::Set(set) => set.fmt(f),
        }
    }
}
