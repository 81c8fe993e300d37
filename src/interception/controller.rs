//! Traffic-interception controller
//!
//! Installs and removes the mesh rule set through a [`PacketFilter`].
//! Every operation is idempotent. Required order:
//!
//! ```text
//! install: baseline (chains, then jumps) -> outbound capture -> inbound capture
//! remove:  inbound capture -> outbound capture -> baseline (jumps, then chains)
//! ```

use tracing::{debug, info};

use super::filter::PacketFilter;
use super::rule::{InterceptionRuleSet, PlannedRule, Table};
use crate::error::RuleInstallError;

/// Installs the mesh rule set into one packet filter
#[derive(Debug)]
pub struct InterceptionController<F> {
    filter: F,
    rules: InterceptionRuleSet,
}

impl<F: PacketFilter> InterceptionController<F> {
    /// Create a controller for `rules` over `filter`
    pub const fn new(filter: F, rules: InterceptionRuleSet) -> Self {
        Self { filter, rules }
    }

    /// Underlying filter
    pub const fn filter(&self) -> &F {
        &self.filter
    }

    /// Rule set this controller manages
    pub const fn rules(&self) -> &InterceptionRuleSet {
        &self.rules
    }

    /// Create the mesh chains and the jumps into them.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError` if a primitive fails. Whatever was
    /// installed before the failure stays; calling again is safe.
    pub fn install_baseline(&self) -> Result<(), RuleInstallError> {
        for chain in self.rules.chains() {
            if !self.filter.chain_exists(chain.table, &chain.name)? {
                self.filter.new_chain(chain.table, &chain.name)?;
                debug!("Created chain {}/{}", chain.table, chain.name);
            }
        }

        self.append_all(&self.rules.baseline_jumps())?;
        info!("Baseline interception rules installed");
        Ok(())
    }

    /// Install the outbound capture rules.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError::MissingChain` if the baseline is not
    /// installed, or a backend error.
    pub fn install_outbound_capture(&self) -> Result<(), RuleInstallError> {
        let rules = self.rules.outbound_capture();
        self.require_chains(&rules)?;
        self.append_all(&rules)?;
        info!(
            "Outbound capture installed: {} -> port {} (uid {} excluded)",
            self.rules.pod_cidr, self.rules.outbound_port, self.rules.proxy_uid
        );
        Ok(())
    }

    /// Install the inbound capture rules.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError::MissingChain` if the baseline is not
    /// installed, or a backend error.
    pub fn install_inbound_capture(&self) -> Result<(), RuleInstallError> {
        let rules = self.rules.inbound_capture();
        self.require_chains(&rules)?;
        self.append_all(&rules)?;
        info!(
            "Inbound capture installed: {} -> port {} (connmark {:#x} excluded)",
            self.rules.pod_cidr, self.rules.inbound_port, self.rules.conntrack_mark
        );
        Ok(())
    }

    /// Install baseline, outbound capture and inbound capture, in that order.
    ///
    /// # Errors
    ///
    /// Returns the first `RuleInstallError` encountered.
    pub fn install_all(&self) -> Result<(), RuleInstallError> {
        self.install_baseline()?;
        self.install_outbound_capture()?;
        self.install_inbound_capture()
    }

    /// Remove the outbound capture rules. Absent rules are skipped.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError` if a primitive fails.
    pub fn remove_outbound_capture(&self) -> Result<(), RuleInstallError> {
        self.delete_present(&self.rules.outbound_capture())?;
        info!("Outbound capture removed");
        Ok(())
    }

    /// Remove the inbound capture rules. Absent rules are skipped.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError` if a primitive fails.
    pub fn remove_inbound_capture(&self) -> Result<(), RuleInstallError> {
        self.delete_present(&self.rules.inbound_capture())?;
        info!("Inbound capture removed");
        Ok(())
    }

    /// Remove the jumps, then flush and delete the mesh chains.
    ///
    /// # Errors
    ///
    /// Returns `RuleInstallError` if a primitive fails.
    pub fn remove_baseline(&self) -> Result<(), RuleInstallError> {
        self.delete_present(&self.rules.baseline_jumps())?;

        for chain in self.rules.chains() {
            if self.filter.chain_exists(chain.table, &chain.name)? {
                self.filter.flush_chain(chain.table, &chain.name)?;
                self.filter.delete_chain(chain.table, &chain.name)?;
                debug!("Deleted chain {}/{}", chain.table, chain.name);
            }
        }

        info!("Baseline interception rules removed");
        Ok(())
    }

    /// Remove everything, in reverse installation order.
    ///
    /// # Errors
    ///
    /// Returns the first `RuleInstallError` encountered.
    pub fn remove_all(&self) -> Result<(), RuleInstallError> {
        self.remove_inbound_capture()?;
        self.remove_outbound_capture()?;
        self.remove_baseline()
    }

    fn require_chains(&self, rules: &[PlannedRule]) -> Result<(), RuleInstallError> {
        for rule in rules {
            if !self.filter.chain_exists(rule.table, &rule.chain)? {
                return Err(missing_chain(rule.table, &rule.chain));
            }
        }
        Ok(())
    }

    fn append_all(&self, rules: &[PlannedRule]) -> Result<(), RuleInstallError> {
        for rule in rules {
            self.filter.append_unique(rule.table, &rule.chain, &rule.spec)?;
        }
        Ok(())
    }

    fn delete_present(&self, rules: &[PlannedRule]) -> Result<(), RuleInstallError> {
        for rule in rules {
            if !self.filter.chain_exists(rule.table, &rule.chain)? {
                continue;
            }
            while self.filter.exists(rule.table, &rule.chain, &rule.spec)? {
                self.filter.delete(rule.table, &rule.chain, &rule.spec)?;
            }
        }
        Ok(())
    }
}

fn missing_chain(table: Table, chain: &str) -> RuleInstallError {
    RuleInstallError::MissingChain {
        table: table.as_str().to_string(),
        chain: chain.to_string(),
    }
}
