//! Top-level state machine. Owns every subsystem, drives the strict enter
//! sequence and the best-effort exit sequence, and performs idempotent
//! cleanup after a crash. All transitions happen on the serialized IPC
//! dispatch path.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::config::ProctorConfig;
use common::error::ProctorError;
use common::platform::{AdapterDns, Platform};
use common::protocol::{Command, LockdownState, Reply};
use common::telemetry::unix_timestamp_now;

use crate::allowlist::AllowlistRefresher;
use crate::dns_filter::{self, DnsFilterHandle};
use crate::firewall::FirewallController;
use crate::vpn::VpnSentry;
use crate::watchdog::ProcessWatchdog;
use crate::worker::WorkerHandle;

struct LockdownRuntime {
    dns_filter: Option<DnsFilterHandle>,
    cache_service_stopped: bool,
    original_dns: Vec<(String, AdapterDns)>,
    allowlist: Option<Arc<AllowlistRefresher>>,
    allowlist_worker: Option<WorkerHandle>,
    watchdog: Option<Arc<ProcessWatchdog>>,
    watchdog_worker: Option<WorkerHandle>,
    sentry: Option<Arc<VpnSentry>>,
    sentry_worker: Option<WorkerHandle>,
}

impl LockdownRuntime {
    fn empty() -> Self {
        Self {
            dns_filter: None,
            cache_service_stopped: false,
            original_dns: Vec::new(),
            allowlist: None,
            allowlist_worker: None,
            watchdog: None,
            watchdog_worker: None,
            sentry: None,
            sentry_worker: None,
        }
    }
}

pub struct Coordinator {
    cfg: ProctorConfig,
    platform: Arc<dyn Platform>,
    firewall: Arc<FirewallController>,
    state: Mutex<LockdownState>,
    runtime: tokio::sync::Mutex<Option<LockdownRuntime>>,
}

impl Coordinator {
    pub fn new(cfg: ProctorConfig, platform: Arc<dyn Platform>) -> Self {
        let firewall = Arc::new(FirewallController::new(
            Arc::clone(&platform),
            cfg.agent.tag.clone(),
            cfg.firewall.clone(),
        ));
        Self {
            cfg,
            platform,
            firewall,
            state: Mutex::new(LockdownState::Inactive),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn firewall(&self) -> &Arc<FirewallController> {
        &self.firewall
    }

    pub fn state(&self) -> LockdownState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: LockdownState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(from = guard.as_str(), to = next.as_str(), "state transition");
        *guard = next;
    }

    fn service_stop_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.agent.service_stop_wait_sec)
    }

    fn service_start_wait(&self) -> Duration {
        Duration::from_secs(self.cfg.agent.service_start_wait_sec)
    }

    /// Serialized command dispatch; the IPC loop is the only caller.
    pub async fn dispatch(&self, command: Command) -> Reply {
        match command {
            Command::Enter => match self.enter().await {
                Ok(()) => Reply::Ok,
                Err(e) => {
                    tracing::error!(error = %e, "ENTER failed");
                    Reply::Error
                }
            },
            Command::Exit => match self.exit().await {
                Ok(()) => Reply::Ok,
                Err(e) => {
                    tracing::error!(error = %e, "EXIT failed");
                    Reply::Error
                }
            },
            Command::Status => {
                self.log_status().await;
                Reply::Ok
            }
            Command::Refresh => match self.refresh().await {
                Ok(()) => Reply::Ok,
                Err(e) => {
                    tracing::error!(error = %e, "REFRESH failed");
                    Reply::Error
                }
            },
        }
    }

    async fn enter(&self) -> Result<(), ProctorError> {
        match self.state() {
            LockdownState::Inactive => {}
            // A second ENTER while already locked down is a no-op.
            LockdownState::Active => return Ok(()),
            state => {
                return Err(ProctorError::StateError {
                    message: format!("ENTER 在 {} 状态下被拒绝", state.as_str()),
                });
            }
        }

        self.set_state(LockdownState::Entering);
        let mut rt = LockdownRuntime::empty();
        match self.enter_sequence(&mut rt).await {
            Ok(()) => {
                *self.runtime.lock().await = Some(rt);
                self.set_state(LockdownState::Active);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "enter sequence failed, rolling back");
                for err in self.exit_sequence(&mut rt).await {
                    tracing::warn!(error = %err, "rollback step failed");
                }
                self.set_state(LockdownState::Inactive);
                Err(e)
            }
        }
    }

    async fn exit(&self) -> Result<(), ProctorError> {
        match self.state() {
            LockdownState::Active => {}
            // EXIT without a preceding ENTER already satisfies the
            // restored-state contract.
            LockdownState::Inactive => return Ok(()),
            state => {
                return Err(ProctorError::StateError {
                    message: format!("EXIT 在 {} 状态下被拒绝", state.as_str()),
                });
            }
        }

        self.set_state(LockdownState::Exiting);
        let mut rt = self
            .runtime
            .lock()
            .await
            .take()
            .unwrap_or_else(LockdownRuntime::empty);
        let errors = self.exit_sequence(&mut rt).await;
        self.set_state(LockdownState::Inactive);
        for err in &errors {
            tracing::warn!(error = %err, "exit step failed");
        }
        // The reply is OK as long as the state machine reached Inactive;
        // partial failures live in the logs.
        Ok(())
    }

    async fn enter_sequence(&self, rt: &mut LockdownRuntime) -> Result<(), ProctorError> {
        tracing::info!("enter 1/6: starting DNS filter");
        let filter =
            dns_filter::start(&self.cfg.dns, &self.platform, self.service_stop_wait()).await?;
        rt.cache_service_stopped = filter.stopped_cache_service();
        rt.dns_filter = Some(filter);

        tracing::info!("enter 2/6: pinning adapter DNS to loopback");
        let loopback = AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]);
        for adapter in self.platform.active_adapters()? {
            let original = self.platform.adapter_dns(&adapter)?;
            self.platform.set_adapter_dns(&adapter, &loopback)?;
            tracing::info!(adapter = %adapter, original = ?original, "adapter DNS overridden");
            rt.original_dns.push((adapter, original));
        }

        tracing::info!("enter 3/6: flushing DNS cache");
        self.platform.flush_dns_cache()?;

        tracing::info!("enter 4/6: enabling firewall lockdown");
        self.firewall.enable_lockdown()?;

        tracing::info!("enter 5/6: synchronous allowlist refresh");
        let refresher = Arc::new(AllowlistRefresher::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.firewall),
            &self.cfg.allowlist,
        ));
        refresher.refresh_once()?;
        rt.allowlist_worker = Some(refresher.spawn());
        rt.allowlist = Some(refresher);

        tracing::info!("enter 6/6: starting watchdog and VPN sentry");
        let watchdog = Arc::new(ProcessWatchdog::new(
            Arc::clone(&self.platform),
            &self.cfg.watchdog,
            self.cfg.agent.reserved_process_prefix.clone(),
        ));
        rt.watchdog_worker = Some(watchdog.spawn());
        rt.watchdog = Some(watchdog);

        let sentry = Arc::new(VpnSentry::new(Arc::clone(&self.platform), &self.cfg.vpn));
        rt.sentry_worker = Some(sentry.spawn());
        rt.sentry = Some(sentry);

        Ok(())
    }

    /// Reverse of the enter sequence. Every step is best-effort; errors are
    /// collected and the teardown continues.
    async fn exit_sequence(&self, rt: &mut LockdownRuntime) -> Vec<ProctorError> {
        let mut errors = Vec::new();

        if let Some(worker) = rt.sentry_worker.take() {
            worker.stop().await;
        }
        rt.sentry.take();
        if let Some(worker) = rt.watchdog_worker.take() {
            worker.stop().await;
        }
        rt.watchdog.take();
        if let Some(worker) = rt.allowlist_worker.take() {
            worker.stop().await;
        }
        rt.allowlist.take();

        errors.extend(self.firewall.disable_lockdown());

        for (adapter, original) in rt.original_dns.drain(..) {
            if let Err(e) = self.platform.set_adapter_dns(&adapter, &original) {
                tracing::warn!(adapter = %adapter, error = %e, "DNS restore failed");
                errors.push(e);
            }
        }

        if let Err(e) = self.platform.flush_dns_cache() {
            errors.push(e);
        }

        if let Some(filter) = rt.dns_filter.take() {
            filter.stop().await;
        }
        if rt.cache_service_stopped {
            if let Err(e) = self
                .platform
                .start_service(&self.cfg.dns.cache_service, self.service_start_wait())
            {
                errors.push(e);
            }
            rt.cache_service_stopped = false;
        }

        errors
    }

    async fn refresh(&self) -> Result<(), ProctorError> {
        if self.state() != LockdownState::Active {
            return Ok(());
        }
        let runtime = self.runtime.lock().await;
        let Some(refresher) = runtime.as_ref().and_then(|rt| rt.allowlist.as_ref()) else {
            return Ok(());
        };
        let outcome = refresher.refresh_once()?;
        tracing::info!(outcome = ?outcome, "manual refresh");
        Ok(())
    }

    async fn log_status(&self) {
        let runtime = self.runtime.lock().await;
        let allowed_ips = runtime
            .as_ref()
            .and_then(|rt| rt.allowlist.as_ref())
            .map_or(0, |r| r.current().len());
        let watchdog_kills = runtime
            .as_ref()
            .and_then(|rt| rt.watchdog.as_ref())
            .map_or(0, |w| w.kill_count());
        let vpn_actions = runtime
            .as_ref()
            .and_then(|rt| rt.sentry.as_ref())
            .map_or(0, |s| s.action_count());
        tracing::info!(
            timestamp = unix_timestamp_now(),
            state = self.state().as_str(),
            allowed_ips,
            installed_rules = self.firewall.installed_rule_count(),
            watchdog_kills,
            vpn_actions,
            lockdown_marker = self.firewall.is_lockdown_active(),
            "status"
        );
    }

    /// Crash recovery on startup: when the canonical marker rule is still
    /// present, tear the previous lockdown down — rules, outbound policy,
    /// adapter DNS back to DHCP, cache flush, DNS-cache service restart.
    /// Returns whether a stale lockdown was found.
    pub fn startup_cleanup(&self) -> bool {
        if !self.firewall.is_lockdown_active() {
            return false;
        }
        tracing::warn!("stale lockdown found at startup, cleaning up");

        for err in self.firewall.disable_lockdown() {
            tracing::warn!(error = %err, "stale rule cleanup failed");
        }

        match self.platform.active_adapters() {
            Ok(adapters) => {
                for adapter in adapters {
                    if let Err(e) = self.platform.set_adapter_dns(&adapter, &AdapterDns::Dhcp) {
                        tracing::warn!(adapter = %adapter, error = %e, "DHCP restore failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "adapter enumeration failed"),
        }

        if let Err(e) = self.platform.flush_dns_cache() {
            tracing::warn!(error = %e, "DNS cache flush failed");
        }
        if let Err(e) = self
            .platform
            .start_service(&self.cfg.dns.cache_service, self.service_start_wait())
        {
            tracing::debug!(error = %e, "DNS-cache service start failed");
        }
        true
    }

    /// Graceful tear-down on service stop: leave lockdown if it is active.
    pub async fn shutdown(&self) {
        if self.state() == LockdownState::Active {
            tracing::info!("service stopping while active, running exit sequence");
            let _reply = self.dispatch(Command::Exit).await;
        }
    }
}
