//! Keeps the firewall's per-IP allow rules converged with the current DNS
//! answers for the configured domains. The set here includes the exam
//! provider's names plus the CDN/edge names they depend on, so it is
//! configured separately from the DNS filter's allow-domains.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use common::config::AllowlistConfig;
use common::error::ProctorError;
use common::platform::Platform;

use crate::firewall::FirewallController;
use crate::worker::{WorkerHandle, spawn_periodic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { added: usize, removed: usize },
    Unchanged,
    EmptyKeptCurrent,
}

pub struct AllowlistRefresher {
    platform: Arc<dyn Platform>,
    firewall: Arc<FirewallController>,
    domains: Vec<String>,
    interval: Duration,
    current: ArcSwap<BTreeSet<Ipv4Addr>>,
}

impl AllowlistRefresher {
    pub fn new(
        platform: Arc<dyn Platform>,
        firewall: Arc<FirewallController>,
        cfg: &AllowlistConfig,
    ) -> Self {
        Self {
            platform,
            firewall,
            domains: cfg.domains.clone(),
            interval: Duration::from_secs(cfg.refresh_interval_sec),
            current: ArcSwap::from_pointee(BTreeSet::new()),
        }
    }

    pub fn current(&self) -> Arc<BTreeSet<Ipv4Addr>> {
        self.current.load_full()
    }

    /// One refresh pass. An empty resolution result is treated as a
    /// transient network failure: the existing set is kept and the next
    /// tick retries.
    #[allow(clippy::missing_errors_doc)]
    pub fn refresh_once(&self) -> Result<RefreshOutcome, ProctorError> {
        let mut next: BTreeSet<Ipv4Addr> = BTreeSet::new();
        for domain in &self.domains {
            match self.platform.resolve_ipv4(domain) {
                Ok(ips) => next.extend(ips),
                Err(e) => {
                    tracing::warn!(domain = %domain, error = %e, "resolution failed");
                }
            }
        }

        if next.is_empty() {
            tracing::warn!("allowlist refresh returned no addresses, keeping current set");
            return Ok(RefreshOutcome::EmptyKeptCurrent);
        }

        let current = self.current.load();
        if **current == next {
            return Ok(RefreshOutcome::Unchanged);
        }

        let added = next.difference(&current).count();
        let removed = current.difference(&next).count();
        self.firewall.update_allowed_ips(&next)?;
        self.current.store(Arc::new(next));
        tracing::info!(added, removed, "allowed IP set updated");
        Ok(RefreshOutcome::Updated { added, removed })
    }

    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let refresher = Arc::clone(self);
        spawn_periodic("allowlist", self.interval, move || {
            if let Err(e) = refresher.refresh_once() {
                tracing::warn!(error = %e, "allowlist refresh failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use common::config::FirewallConfig;
    use common::platform::fake::FakePlatform;

    fn setup(domains: &[&str]) -> (Arc<FakePlatform>, Arc<AllowlistRefresher>) {
        let fake = Arc::new(FakePlatform::new());
        let platform: Arc<dyn Platform> = Arc::clone(&fake) as Arc<dyn Platform>;
        let firewall = Arc::new(FirewallController::new(
            Arc::clone(&platform),
            "Proctor",
            FirewallConfig::default(),
        ));
        let cfg = AllowlistConfig {
            domains: domains.iter().map(|d| (*d).to_string()).collect(),
            refresh_interval_sec: 180,
        };
        let refresher = Arc::new(AllowlistRefresher::new(platform, firewall, &cfg));
        (fake, refresher)
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    #[test]
    fn refresh_unions_answers_across_domains() -> Result<(), ProctorError> {
        let (fake, refresher) = setup(&["codeforces.com", "www.codeforces.com"]);
        fake.set_dns_answer("codeforces.com", vec![ip("1.1.1.1")]);
        fake.set_dns_answer("www.codeforces.com", vec![ip("1.1.1.1"), ip("2.2.2.2")]);

        let outcome = refresher.refresh_once()?;
        assert_eq!(
            outcome,
            RefreshOutcome::Updated {
                added: 2,
                removed: 0
            }
        );
        assert!(fake.has_rule("Proctor_CF_1_1_1_1_HTTPS"));
        assert!(fake.has_rule("Proctor_CF_2_2_2_2_HTTP"));
        assert_eq!(refresher.current().len(), 2);
        Ok(())
    }

    #[test]
    fn unchanged_result_is_a_no_op() -> Result<(), ProctorError> {
        let (fake, refresher) = setup(&["codeforces.com"]);
        fake.set_dns_answer("codeforces.com", vec![ip("1.1.1.1")]);

        refresher.refresh_once()?;
        let before = fake.rule_names_snapshot();
        assert_eq!(refresher.refresh_once()?, RefreshOutcome::Unchanged);
        assert_eq!(before, fake.rule_names_snapshot());
        Ok(())
    }

    #[test]
    fn empty_resolution_keeps_current_set() -> Result<(), ProctorError> {
        let (fake, refresher) = setup(&["codeforces.com"]);
        fake.set_dns_answer("codeforces.com", vec![ip("1.1.1.1")]);
        refresher.refresh_once()?;

        fake.clear_dns_answers();
        assert_eq!(refresher.refresh_once()?, RefreshOutcome::EmptyKeptCurrent);
        assert!(fake.has_rule("Proctor_CF_1_1_1_1_HTTP"));
        assert_eq!(refresher.current().len(), 1);
        Ok(())
    }

    #[test]
    fn churn_drops_departed_ips() -> Result<(), ProctorError> {
        let (fake, refresher) = setup(&["codeforces.com"]);
        fake.set_dns_answer("codeforces.com", vec![ip("1.1.1.1"), ip("2.2.2.2")]);
        refresher.refresh_once()?;

        fake.set_dns_answer("codeforces.com", vec![ip("2.2.2.2"), ip("3.3.3.3")]);
        let outcome = refresher.refresh_once()?;
        assert_eq!(
            outcome,
            RefreshOutcome::Updated {
                added: 1,
                removed: 1
            }
        );
        assert!(!fake.has_rule("Proctor_CF_1_1_1_1_HTTP"));
        assert!(fake.has_rule("Proctor_CF_3_3_3_3_HTTPS"));
        Ok(())
    }
}
