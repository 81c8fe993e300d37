//! Packet-filter primitives
//!
//! [`PacketFilter`] is the seam between the controller and the kernel.
//! [`IptablesFilter`] drives the system `iptables`/`ip6tables` binary;
//! [`MemoryFilter`] keeps rule tables in process with the same refusal
//! semantics (missing chain, chain still referenced, chain not empty), which
//! makes ordering mistakes visible in tests and dry runs.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::rule::{RuleSpec, Table, Target};
use crate::error::RuleInstallError;

/// Rule and chain manipulation primitives
pub trait PacketFilter: Send + Sync {
    /// Whether `chain` exists in `table`
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, RuleInstallError>;

    /// Create a user chain. Fails if it already exists.
    fn new_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError>;

    /// Whether an identical rule is present in `chain`
    fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<bool, RuleInstallError>;

    /// Append `rule` unless an identical one is already present
    fn append_unique(&self, table: Table, chain: &str, rule: &RuleSpec)
        -> Result<(), RuleInstallError>;

    /// Delete one occurrence of `rule`. Fails if absent.
    fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), RuleInstallError>;

    /// Remove every rule from `chain`
    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError>;

    /// Delete an empty, unreferenced user chain
    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError>;
}

/// Filter backed by the system iptables binary
pub struct IptablesFilter {
    ipt: iptables::IPTables,
}

impl IptablesFilter {
    /// Locate `iptables` (or `ip6tables` when `ipv6` is set)
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError::Unavailable` if the binary cannot be used.
    pub fn new(ipv6: bool) -> Result<Self, RuleInstallError> {
        let ipt = iptables::new(ipv6).map_err(|e| RuleInstallError::Unavailable(e.to_string()))?;
        debug!("Using {} for packet filtering", ipt.cmd);
        Ok(Self { ipt })
    }
}

impl std::fmt::Debug for IptablesFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IptablesFilter")
            .field("cmd", &self.ipt.cmd)
            .finish()
    }
}

// The iptables crate returns Box<dyn Error> (not Send); flatten it right away
macro_rules! ipt_call {
    ($op:literal, $table:expr, $chain:expr, $call:expr) => {
        $call.map_err(|e| RuleInstallError::backend($op, $table.as_str(), $chain, e.to_string()))
    };
}

impl PacketFilter for IptablesFilter {
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, RuleInstallError> {
        ipt_call!(
            "chain_exists",
            table,
            chain,
            self.ipt.chain_exists(table.as_str(), chain)
        )
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        trace!("{} -t {} -N {}", self.ipt.cmd, table, chain);
        ipt_call!("new_chain", table, chain, self.ipt.new_chain(table.as_str(), chain))
    }

    fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<bool, RuleInstallError> {
        ipt_call!(
            "exists",
            table,
            chain,
            self.ipt.exists(table.as_str(), chain, &rule.render())
        )
    }

    fn append_unique(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> Result<(), RuleInstallError> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        trace!("{} -t {} -A {} {}", self.ipt.cmd, table, chain, rule);
        ipt_call!(
            "append",
            table,
            chain,
            self.ipt.append(table.as_str(), chain, &rule.render())
        )
    }

    fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), RuleInstallError> {
        trace!("{} -t {} -D {} {}", self.ipt.cmd, table, chain, rule);
        ipt_call!(
            "delete",
            table,
            chain,
            self.ipt.delete(table.as_str(), chain, &rule.render())
        )
    }

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        trace!("{} -t {} -F {}", self.ipt.cmd, table, chain);
        ipt_call!(
            "flush_chain",
            table,
            chain,
            self.ipt.flush_chain(table.as_str(), chain)
        )
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        trace!("{} -t {} -X {}", self.ipt.cmd, table, chain);
        ipt_call!(
            "delete_chain",
            table,
            chain,
            self.ipt.delete_chain(table.as_str(), chain)
        )
    }
}

const BUILTIN_CHAINS: &[(Table, &str)] = &[
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "INPUT"),
    (Table::Nat, "OUTPUT"),
    (Table::Nat, "POSTROUTING"),
    (Table::Mangle, "PREROUTING"),
    (Table::Mangle, "INPUT"),
    (Table::Mangle, "FORWARD"),
    (Table::Mangle, "OUTPUT"),
    (Table::Mangle, "POSTROUTING"),
];

/// Whether `chain` is one of the kernel's built-in chains for `table`
#[must_use]
pub fn is_builtin(table: Table, chain: &str) -> bool {
    BUILTIN_CHAINS.iter().any(|(t, c)| *t == table && *c == chain)
}

/// Point-in-time copy of a [`MemoryFilter`]'s rule tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSnapshot {
    chains: BTreeMap<(Table, String), Vec<RuleSpec>>,
}

impl FilterSnapshot {
    /// Rules of one chain, in order (empty for unknown chains)
    #[must_use]
    pub fn rules(&self, table: Table, chain: &str) -> &[RuleSpec] {
        self.chains
            .get(&(table, chain.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    /// Whether the chain exists
    #[must_use]
    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.chains.contains_key(&(table, chain.to_string()))
    }

    /// Total number of rules across all chains
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    /// User-defined chains currently present
    #[must_use]
    pub fn user_chains(&self) -> Vec<(Table, String)> {
        self.chains
            .keys()
            .filter(|(t, c)| !is_builtin(*t, c))
            .cloned()
            .collect()
    }
}

/// In-process packet filter
#[derive(Debug)]
pub struct MemoryFilter {
    state: Mutex<FilterSnapshot>,
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFilter {
    /// Empty filter holding only the built-in chains
    #[must_use]
    pub fn new() -> Self {
        let chains = BUILTIN_CHAINS
            .iter()
            .map(|(t, c)| ((*t, (*c).to_string()), Vec::new()))
            .collect();
        Self {
            state: Mutex::new(FilterSnapshot { chains }),
        }
    }

    /// Copy of the current tables
    #[must_use]
    pub fn snapshot(&self) -> FilterSnapshot {
        self.state.lock().clone()
    }

    fn missing(table: Table, chain: &str) -> RuleInstallError {
        RuleInstallError::MissingChain {
            table: table.as_str().to_string(),
            chain: chain.to_string(),
        }
    }
}

impl PacketFilter for MemoryFilter {
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, RuleInstallError> {
        Ok(self.state.lock().has_chain(table, chain))
    }

    fn new_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        let key = (table, chain.to_string());
        if state.chains.contains_key(&key) {
            return Err(RuleInstallError::backend(
                "new_chain",
                table.as_str(),
                chain,
                "Chain already exists",
            ));
        }
        state.chains.insert(key, Vec::new());
        Ok(())
    }

    fn exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<bool, RuleInstallError> {
        let state = self.state.lock();
        let rules = state
            .chains
            .get(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?;
        Ok(rules.contains(rule))
    }

    fn append_unique(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        if let Target::Jump(target) = &rule.target {
            if !state.has_chain(table, target) {
                return Err(Self::missing(table, target));
            }
        }

        let rules = state
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?;
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn delete(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        let rules = state
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?;
        let pos = rules.iter().position(|r| r == rule).ok_or_else(|| {
            RuleInstallError::backend("delete", table.as_str(), chain, "Bad rule (does a matching rule exist in that chain?)")
        })?;
        rules.remove(pos);
        Ok(())
    }

    fn flush_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        state
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?
            .clear();
        Ok(())
    }

    fn delete_chain(&self, table: Table, chain: &str) -> Result<(), RuleInstallError> {
        let mut state = self.state.lock();
        let fail = |reason: &str| RuleInstallError::backend("delete_chain", table.as_str(), chain, reason);

        if is_builtin(table, chain) {
            return Err(fail("Cannot delete built-in chain"));
        }

        let key = (table, chain.to_string());
        match state.chains.get(&key) {
            None => return Err(Self::missing(table, chain)),
            Some(rules) if !rules.is_empty() => return Err(fail("Directory not empty")),
            Some(_) => {}
        }

        let referenced = state
            .chains
            .iter()
            .filter(|((t, _), _)| *t == table)
            .flat_map(|(_, rules)| rules.iter())
            .any(|r| matches!(&r.target, Target::Jump(c) if c == chain));
        if referenced {
            return Err(fail("Too many links"));
        }

        state.chains.remove(&key);
        Ok(())
    }
}
