//! Scans for consumer VPN footholds on a fixed cadence: matching network
//! interfaces are disabled, known services stopped, known processes
//! terminated. Default routes through tap/tun devices are observed and
//! logged only.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::config::VpnConfig;
use common::platform::{KillOutcome, Platform, ServiceStatus};

use crate::watchdog::normalize_name;
use crate::worker::{WorkerHandle, spawn_periodic};

const SERVICE_STOP_WAIT: Duration = Duration::from_secs(10);
const PROCESS_KILL_WAIT: Duration = Duration::from_secs(1);

pub struct VpnSentry {
    platform: Arc<dyn Platform>,
    interface_keywords: Vec<String>,
    service_names: Vec<String>,
    process_names: BTreeSet<String>,
    interval: Duration,
    actions: AtomicU64,
}

impl VpnSentry {
    pub fn new(platform: Arc<dyn Platform>, cfg: &VpnConfig) -> Self {
        Self {
            platform,
            interface_keywords: cfg
                .interface_keywords
                .iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
            service_names: cfg.service_names.clone(),
            process_names: cfg.process_names.iter().map(|n| normalize_name(n)).collect(),
            interval: Duration::from_millis(cfg.interval_ms),
            actions: AtomicU64::new(0),
        }
    }

    pub fn action_count(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }

    fn matches_interface(&self, description: &str) -> bool {
        let desc = description.to_ascii_lowercase();
        self.interface_keywords.iter().any(|k| desc.contains(k))
    }

    /// One scan pass over all four vectors; every action is best-effort.
    pub fn sweep_once(&self) -> u64 {
        let mut actions: u64 = 0;

        match self.platform.network_interfaces() {
            Ok(interfaces) => {
                for iface in interfaces {
                    if !iface.up || !self.matches_interface(&iface.description) {
                        continue;
                    }
                    match self.platform.disable_interface(&iface.name) {
                        Ok(()) => {
                            actions = actions.saturating_add(1);
                            tracing::info!(
                                interface = %iface.name,
                                description = %iface.description,
                                "disabled VPN interface"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(interface = %iface.name, error = %e, "disable failed");
                        }
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "interface enumeration failed"),
        }

        for service in &self.service_names {
            match self.platform.service_status(service) {
                Ok(ServiceStatus::Running | ServiceStatus::Transitioning) => {
                    match self.platform.stop_service(service, SERVICE_STOP_WAIT) {
                        Ok(_) => {
                            actions = actions.saturating_add(1);
                            tracing::info!(service = %service, "stopped VPN service");
                        }
                        Err(e) => {
                            tracing::warn!(service = %service, error = %e, "service stop failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(service = %service, error = %e, "status query failed"),
            }
        }

        match self.platform.processes() {
            Ok(processes) => {
                for proc_ in processes {
                    if !self.process_names.contains(&normalize_name(&proc_.name)) {
                        continue;
                    }
                    match self.platform.kill_process_tree(proc_.pid, PROCESS_KILL_WAIT) {
                        Ok(KillOutcome::Killed) => {
                            actions = actions.saturating_add(1);
                            tracing::info!(pid = proc_.pid, name = %proc_.name, "killed VPN process");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(pid = proc_.pid, error = %e, "kill failed"),
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "process enumeration failed"),
        }

        match self.platform.default_routes() {
            Ok(routes) => {
                for route in routes {
                    if self.matches_interface(&route.interface) {
                        tracing::warn!(
                            gateway = %route.gateway,
                            interface = %route.interface,
                            "default route through tunnel device"
                        );
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "route enumeration failed"),
        }

        self.actions.fetch_add(actions, Ordering::Relaxed);
        actions
    }

    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let sentry = Arc::clone(self);
        spawn_periodic("vpn-sentry", self.interval, move || {
            sentry.sweep_once();
        })
    }
}
