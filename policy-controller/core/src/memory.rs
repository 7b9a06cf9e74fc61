use crate::{Chain, Member, RuleSpec, RuleStore, SetKind, SetName, SetStore};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// An in-memory kernel.
///
/// Enforces the constraints the real packet filter imposes: sets must exist before they are
/// populated or referenced, and a set may not be destroyed while a rule or another set refers to
/// it. It is stricter than the real thing in one respect: adding a member that is already present
/// (or removing one that is absent) is an error, so that redundant kernel operations are visible.
#[derive(Debug, Default)]
pub struct Memory {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    sets: BTreeMap<SetName, Set>,
    rules: BTreeMap<Chain, Vec<RuleSpec>>,
}

#[derive(Debug)]
struct Set {
    kind: SetKind,
    members: BTreeSet<Member>,
}

// === impl Memory ===

impl Memory {
    /// Returns the members of every set.
    pub fn sets(&self) -> BTreeMap<SetName, BTreeSet<Member>> {
        self.state
            .lock()
            .sets
            .iter()
            .map(|(name, set)| (name.clone(), set.members.clone()))
            .collect()
    }

    /// Returns the members of a set, if it exists.
    pub fn members(&self, name: &SetName) -> Option<BTreeSet<Member>> {
        self.state
            .lock()
            .sets
            .get(name)
            .map(|set| set.members.clone())
    }

    pub fn kind(&self, name: &SetName) -> Option<SetKind> {
        self.state.lock().sets.get(name).map(|set| set.kind)
    }

    pub fn contains_set(&self, name: &SetName) -> bool {
        self.state.lock().sets.contains_key(name)
    }

    /// Returns the rules in a chain, in installation order.
    pub fn rules(&self, chain: Chain) -> Vec<RuleSpec> {
        self.state
            .lock()
            .rules
            .get(&chain)
            .cloned()
            .unwrap_or_default()
    }
}

impl SetStore for Memory {
    fn create(&self, name: &SetName, kind: SetKind) -> Result<()> {
        let mut state = self.state.lock();
        if state.sets.contains_key(name) {
            bail!("set {name} already exists");
        }
        state.sets.insert(
            name.clone(),
            Set {
                kind,
                members: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn destroy(&self, name: &SetName) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sets.contains_key(name) {
            bail!("set {name} does not exist");
        }
        if state
            .rules
            .values()
            .flatten()
            .any(|rule| rule.sets().any(|s| s == name))
        {
            bail!("set {name} is referenced by a rule");
        }
        let member = Member::Set(name.clone());
        if state.sets.values().any(|s| s.members.contains(&member)) {
            bail!("set {name} is a member of another set");
        }
        state.sets.remove(name);
        Ok(())
    }

    fn add(&self, name: &SetName, member: &Member) -> Result<()> {
        let mut state = self.state.lock();
        if let Member::Set(inner) = member {
            if !state.sets.contains_key(inner) {
                bail!("member set {inner} does not exist");
            }
        }
        let Some(set) = state.sets.get_mut(name) else {
            bail!("set {name} does not exist");
        };
        if !set.kind.accepts(member) {
            bail!("set {name} of type {} cannot hold {member}", set.kind);
        }
        if !set.members.insert(member.clone()) {
            bail!("{member} is already in set {name}");
        }
        Ok(())
    }

    fn remove(&self, name: &SetName, member: &Member) -> Result<()> {
        let mut state = self.state.lock();
        let Some(set) = state.sets.get_mut(name) else {
            bail!("set {name} does not exist");
        };
        if !set.members.remove(member) {
            bail!("{member} is not in set {name}");
        }
        Ok(())
    }

    fn flush(&self, name: &SetName) -> Result<()> {
        let mut state = self.state.lock();
        let Some(set) = state.sets.get_mut(name) else {
            bail!("set {name} does not exist");
        };
        set.members.clear();
        Ok(())
    }
}

impl RuleStore for Memory {
    fn ensure_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(missing) = rule.sets().find(|s| !state.sets.contains_key(*s)) {
            bail!("rule references missing set {missing}");
        }
        let rules = state.rules.entry(chain).or_default();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn delete_rule(&self, chain: Chain, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock();
        let rules = state.rules.entry(chain).or_default();
        match rules.iter().position(|r| r == rule) {
            Some(idx) => {
                rules.remove(idx);
                Ok(())
            }
            None => bail!("rule not found in {chain}: {rule}"),
        }
    }
}
