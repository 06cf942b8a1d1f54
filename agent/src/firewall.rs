//! Deny-by-default outbound policy with a tag-prefixed rule set. The
//! controller owns every rule whose name starts with `<tag>_` and never
//! touches anything else in the OS firewall.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use common::config::FirewallConfig;
use common::error::ProctorError;
use common::platform::{FirewallRule, Platform};

pub struct FirewallController {
    platform: Arc<dyn Platform>,
    cfg: FirewallConfig,
    tag: String,
    installed: Mutex<BTreeSet<String>>,
    allowed: Mutex<BTreeSet<Ipv4Addr>>,
}

impl FirewallController {
    pub fn new(platform: Arc<dyn Platform>, tag: impl Into<String>, cfg: FirewallConfig) -> Self {
        Self {
            platform,
            cfg,
            tag: tag.into(),
            installed: Mutex::new(BTreeSet::new()),
            allowed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn rule_prefix(&self) -> String {
        format!("{}_", self.tag)
    }

    fn marker_rule(&self) -> String {
        format!("{}_BlockHTTPS", self.tag)
    }

    fn named(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.tag)
    }

    fn ip_rule_name(&self, ip: Ipv4Addr, port_label: &str) -> String {
        let sanitized = ip.to_string().replace('.', "_");
        format!("{}_CF_{sanitized}_{port_label}", self.tag)
    }

    fn lock_installed(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        match self.installed.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn lock_allowed(&self) -> std::sync::MutexGuard<'_, BTreeSet<Ipv4Addr>> {
        match self.allowed.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn install(&self, rule: FirewallRule) -> Result<(), ProctorError> {
        let name = rule.name.clone();
        self.platform.firewall_add_rule(&rule)?;
        self.lock_installed().insert(name);
        Ok(())
    }

    /// Installs the lockdown rule set and flips the default outbound policy
    /// to block. Stale tagged rules from a prior crash are deleted first so
    /// the operation is idempotent.
    #[allow(clippy::missing_errors_doc)]
    pub fn enable_lockdown(&self) -> Result<(), ProctorError> {
        let stale = self.delete_tagged_rules();
        if stale > 0 {
            tracing::warn!(stale, "removed stale tagged firewall rules");
        }

        self.platform.firewall_set_outbound_block(true)?;

        let loopback: Vec<Ipv4Addr> = vec![Ipv4Addr::LOCALHOST];
        self.install(FirewallRule::allow(self.named("AllowLoopback")).remote(loopback))?;
        self.install(FirewallRule::allow(self.named("AllowDnsUdp")).udp(53))?;
        self.install(FirewallRule::allow(self.named("AllowDnsTcp")).tcp(53))?;
        self.install(
            FirewallRule::allow(self.named("AllowServiceHost"))
                .program(self.cfg.service_host_program.clone()),
        )?;

        let connectivity: Vec<Ipv4Addr> = self
            .cfg
            .connectivity_ips
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if !connectivity.is_empty() {
            self.install(
                FirewallRule::allow(self.named("AllowConnectivity")).remote(connectivity),
            )?;
        }

        // Shadowed by the per-IP allows that update_allowed_ips installs.
        self.install(FirewallRule::block(self.named("BlockHTTP")).tcp(80))?;
        self.install(FirewallRule::block(self.named("BlockHTTPS")).tcp(443))?;

        tracing::info!(rules = self.lock_installed().len(), "lockdown rules installed");
        Ok(())
    }

    /// Diff-based reconcile: rules for IPs leaving the set are removed,
    /// rules for new IPs are added, overlapping IPs are left untouched so
    /// connectivity never gaps.
    #[allow(clippy::missing_errors_doc)]
    pub fn update_allowed_ips(&self, new_set: &BTreeSet<Ipv4Addr>) -> Result<(), ProctorError> {
        let old_set = self.lock_allowed().clone();

        for ip in old_set.difference(new_set) {
            for label in ["HTTP", "HTTPS"] {
                let name = self.ip_rule_name(*ip, label);
                self.platform.firewall_delete_rule(&name)?;
                self.lock_installed().remove(&name);
            }
            self.lock_allowed().remove(ip);
        }

        for ip in new_set.difference(&old_set) {
            self.install(
                FirewallRule::allow(self.ip_rule_name(*ip, "HTTP"))
                    .tcp(80)
                    .remote(vec![*ip]),
            )?;
            self.install(
                FirewallRule::allow(self.ip_rule_name(*ip, "HTTPS"))
                    .tcp(443)
                    .remote(vec![*ip]),
            )?;
            self.lock_allowed().insert(*ip);
        }

        Ok(())
    }

    /// Deletes every tagged rule and restores the default outbound policy.
    /// Never fails hard: each problem is logged and collected.
    pub fn disable_lockdown(&self) -> Vec<ProctorError> {
        let mut errors = Vec::new();

        let deleted = self.delete_tagged_rules();
        tracing::info!(deleted, "tagged firewall rules removed");

        if let Err(e) = self.platform.firewall_set_outbound_block(false) {
            tracing::warn!(error = %e, "restoring outbound policy failed");
            errors.push(e);
        }

        self.lock_installed().clear();
        self.lock_allowed().clear();
        errors
    }

    pub fn is_lockdown_active(&self) -> bool {
        self.platform
            .firewall_rule_exists(&self.marker_rule())
            .unwrap_or(false)
    }

    pub fn installed_rule_count(&self) -> usize {
        self.lock_installed().len()
    }

    pub fn allowed_ip_count(&self) -> usize {
        self.lock_allowed().len()
    }

    /// Removes every rule carrying the tag prefix, both tracked and stale
    /// ones found in the OS firewall. Returns how many were deleted.
    fn delete_tagged_rules(&self) -> u32 {
        let prefix = self.rule_prefix();
        let mut names: BTreeSet<String> = self.lock_installed().clone();
        match self.platform.firewall_rule_names(&prefix) {
            Ok(found) => names.extend(found),
            Err(e) => tracing::warn!(error = %e, "enumerating tagged rules failed"),
        }

        let mut deleted: u32 = 0;
        for name in names {
            match self.platform.firewall_delete_rule(&name) {
                Ok(true) => deleted = deleted.saturating_add(1),
                Ok(false) => {}
                Err(e) => tracing::warn!(rule = %name, error = %e, "deleting rule failed"),
            }
        }
        deleted
    }
}
