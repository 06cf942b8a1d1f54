//! Enforces the process whitelist while lockdown is active. The agent
//! itself, anything sharing its reserved name prefix, and whitelisted base
//! names are never touched; everything else is terminated with its
//! descendants.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::config::WatchdogConfig;
use common::platform::{KillOutcome, Platform};

use crate::worker::{WorkerHandle, spawn_periodic};

pub struct ProcessWatchdog {
    platform: Arc<dyn Platform>,
    whitelist: BTreeSet<String>,
    reserved_prefix: String,
    interval: Duration,
    kill_wait: Duration,
    self_pid: u32,
    kills: AtomicU64,
}

/// Lowercased base name with any `.exe` suffix removed, so whitelist
/// entries match however the enumerator reports the name.
pub fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map_or(lower.clone(), ToString::to_string)
}

impl ProcessWatchdog {
    pub fn new(
        platform: Arc<dyn Platform>,
        cfg: &WatchdogConfig,
        reserved_prefix: impl Into<String>,
    ) -> Self {
        Self::with_self_pid(platform, cfg, reserved_prefix, std::process::id())
    }

    pub fn with_self_pid(
        platform: Arc<dyn Platform>,
        cfg: &WatchdogConfig,
        reserved_prefix: impl Into<String>,
        self_pid: u32,
    ) -> Self {
        Self {
            platform,
            whitelist: cfg.whitelist.iter().map(|n| normalize_name(n)).collect(),
            reserved_prefix: normalize_name(&reserved_prefix.into()),
            interval: Duration::from_millis(cfg.interval_ms),
            kill_wait: Duration::from_millis(cfg.kill_wait_ms),
            self_pid,
            kills: AtomicU64::new(0),
        }
    }

    pub fn kill_count(&self) -> u64 {
        self.kills.load(Ordering::Relaxed)
    }

    fn is_protected(&self, pid: u32, name: &str) -> bool {
        if pid == self.self_pid {
            return true;
        }
        let normalized = normalize_name(name);
        normalized.starts_with(&self.reserved_prefix) || self.whitelist.contains(&normalized)
    }

    /// One enumeration pass; returns the number of processes terminated.
    pub fn sweep_once(&self) -> u64 {
        let processes = match self.platform.processes() {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "process enumeration failed");
                return 0;
            }
        };

        let mut killed_this_pass: u64 = 0;
        for proc_ in processes {
            if self.is_protected(proc_.pid, &proc_.name) {
                continue;
            }
            match self.platform.kill_process_tree(proc_.pid, self.kill_wait) {
                Ok(KillOutcome::Killed) => {
                    killed_this_pass = killed_this_pass.saturating_add(1);
                    self.kills.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(pid = proc_.pid, name = %proc_.name, "terminated process");
                }
                Ok(KillOutcome::AccessDenied) => {
                    tracing::debug!(pid = proc_.pid, name = %proc_.name, "kill denied");
                }
                Ok(KillOutcome::NotFound) => {}
                Err(e) => {
                    tracing::debug!(pid = proc_.pid, error = %e, "kill failed");
                }
            }
        }
        killed_this_pass
    }

    pub fn spawn(self: &Arc<Self>) -> WorkerHandle {
        let watchdog = Arc::clone(self);
        spawn_periodic("watchdog", self.interval, move || {
            watchdog.sweep_once();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use common::platform::fake::FakePlatform;

    fn watchdog_with(
        fake: &Arc<FakePlatform>,
        whitelist: &[&str],
        self_pid: u32,
    ) -> ProcessWatchdog {
        let cfg = WatchdogConfig {
            whitelist: whitelist.iter().map(|s| (*s).to_string()).collect(),
            ..WatchdogConfig::default()
        };
        ProcessWatchdog::with_self_pid(
            Arc::clone(fake) as Arc<dyn Platform>,
            &cfg,
            "proctor",
            self_pid,
        )
    }

    #[test]
    fn kills_only_non_whitelisted_processes() {
        let fake = Arc::new(FakePlatform::new());
        fake.push_process(10, 1, "explorer.exe");
        fake.push_process(20, 1, "cheat-tool.exe");
        fake.push_process(30, 1, "Discord.exe");

        let wd = watchdog_with(&fake, &["explorer"], 9999);
        assert_eq!(wd.sweep_once(), 2);
        let killed = fake.killed_pids();
        assert!(killed.contains(&20));
        assert!(killed.contains(&30));
        assert!(!killed.contains(&10));
    }

    #[test]
    fn never_kills_self_or_reserved_prefix() {
        let fake = Arc::new(FakePlatform::new());
        fake.push_process(42, 1, "whatever.exe");
        fake.push_process(50, 1, "ProctorAgent.exe");
        fake.push_process(51, 1, "proctor-launcher.exe");

        let wd = watchdog_with(&fake, &["explorer"], 42);
        wd.sweep_once();
        assert!(fake.killed_pids().is_empty());
    }

    #[test]
    fn whitelist_matching_ignores_case_and_exe_suffix() {
        let fake = Arc::new(FakePlatform::new());
        fake.push_process(10, 1, "EXPLORER.EXE");
        fake.push_process(11, 1, "MsEdge.exe");

        let wd = watchdog_with(&fake, &["explorer", "msedge"], 9999);
        assert_eq!(wd.sweep_once(), 0);
        assert!(fake.killed_pids().is_empty());
    }

    #[test]
    fn access_denied_is_skipped_and_counted_nowhere() {
        let fake = Arc::new(FakePlatform::new());
        fake.push_process(4, 0, "SecureSystem.exe");
        fake.protect_pid(4);

        let wd = watchdog_with(&fake, &["explorer"], 9999);
        assert_eq!(wd.sweep_once(), 0);
        assert_eq!(wd.kill_count(), 0);
    }

    #[test]
    fn normalization_handles_suffix_and_case() {
        assert_eq!(normalize_name("Explorer.EXE"), "explorer");
        assert_eq!(normalize_name("svchost"), "svchost");
        assert_eq!(normalize_name("  Chrome.exe "), "chrome");
    }
}
