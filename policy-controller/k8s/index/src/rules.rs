use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use netpol_controller_core::{Chain, RuleSpec, RuleStore};
use tracing::trace;

/// Reference counts the ingress rules installed on behalf of a namespace's policies.
///
/// Distinct policies (or distinct ingress rules of one policy) may compile to identical rule
/// specs. Each spec is installed once and removed when its last user releases it.
#[derive(Debug, Default)]
pub(crate) struct RuleTable {
    rules: HashMap<RuleSpec, usize>,
}

impl RuleTable {
    pub(crate) fn ensure(&mut self, rule: &RuleSpec, kernel: &impl RuleStore) -> Result<()> {
        if let Some(refs) = self.rules.get_mut(rule) {
            *refs += 1;
            trace!(%rule, refs, "Rule already installed");
            return Ok(());
        }

        kernel
            .ensure_rule(Chain::Ingress, rule)
            .with_context(|| format!("failed to install rule {rule}"))?;
        trace!(%rule, "Installed rule");
        self.rules.insert(rule.clone(), 1);
        Ok(())
    }

    pub(crate) fn release(&mut self, rule: &RuleSpec, kernel: &impl RuleStore) -> Result<()> {
        let Some(refs) = self.rules.get_mut(rule) else {
            bail!("rule {rule} is not installed");
        };
        if *refs > 1 {
            *refs -= 1;
            return Ok(());
        }

        kernel
            .delete_rule(Chain::Ingress, rule)
            .with_context(|| format!("failed to delete rule {rule}"))?;
        trace!(%rule, "Deleted rule");
        self.rules.remove(rule);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_controller_core::{Memory, SetKind, SetName, SetStore};

    #[test]
    fn installs_identical_rules_once() {
        let kernel = Memory::default();
        let dst = SetName::pod_selector("pods/ns-0/app=web");
        kernel.create(&dst, SetKind::HashIp).unwrap();
        let rule = RuleSpec::allow_to(dst);

        let mut table = RuleTable::default();
        table.ensure(&rule, &kernel).unwrap();
        table.ensure(&rule, &kernel).unwrap();
        assert_eq!(kernel.rules(Chain::Ingress), vec![rule.clone()]);
        assert_eq!(table.len(), 1);

        table.release(&rule, &kernel).unwrap();
        assert_eq!(kernel.rules(Chain::Ingress), vec![rule.clone()]);
        table.release(&rule, &kernel).unwrap();
        assert!(kernel.rules(Chain::Ingress).is_empty());
        assert_eq!(table.len(), 0);

        table.release(&rule, &kernel).expect_err("rule was released");
    }
}
