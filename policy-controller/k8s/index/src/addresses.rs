use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use netpol_controller_core::{Member, SetName, SetStore};
use std::net::IpAddr;
use tracing::trace;

/// Reference counts the pod addresses held in kernel sets.
///
/// Pod IPs are reused, and a new pod may be observed before the pod that previously held its
/// address is deleted. Each pod that places an address in a set holds a reference; the address is
/// added with the first reference and removed with the last.
#[derive(Debug, Default)]
pub(crate) struct AddressTable {
    refs: HashMap<(SetName, IpAddr), usize>,
}

impl AddressTable {
    pub(crate) fn add(&mut self, set: &SetName, ip: IpAddr, sets: &impl SetStore) -> Result<()> {
        let key = (set.clone(), ip);
        if let Some(refs) = self.refs.get_mut(&key) {
            *refs += 1;
            trace!(%set, %ip, refs, "Address already in set");
            return Ok(());
        }

        sets.add(set, &Member::Ip(ip))
            .with_context(|| format!("failed to add {ip} to {set}"))?;
        self.refs.insert(key, 1);
        Ok(())
    }

    pub(crate) fn remove(&mut self, set: &SetName, ip: IpAddr, sets: &impl SetStore) -> Result<()> {
        let key = (set.clone(), ip);
        let Some(refs) = self.refs.get_mut(&key) else {
            bail!("{ip} is not held in {set}");
        };
        if *refs > 1 {
            *refs -= 1;
            trace!(%set, %ip, refs, "Address still in use");
            return Ok(());
        }

        sets.remove(set, &Member::Ip(ip))
            .with_context(|| format!("failed to remove {ip} from {set}"))?;
        self.refs.remove(&key);
        Ok(())
    }

    /// Drops every reference into a set that has been destroyed.
    pub(crate) fn forget(&mut self, set: &SetName) {
        self.refs.retain(|(s, _), _| s != set);
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, set: &SetName, ip: IpAddr) -> Option<usize> {
        self.refs.get(&(set.clone(), ip)).copied()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}
