//! In-memory [`Platform`] used by unit and integration tests. State lives
//! behind one mutex; builder-style setters seed it and inspection methods
//! read it back out.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ErrorCode, ProctorError};
use crate::platform::{
    AdapterDns, BiosInfo, ComputerSystemInfo, FirewallRule, InterfaceRecord, KillOutcome,
    Platform, ProcessRecord, RouteRecord, ServiceStatus,
};

#[derive(Default)]
struct FakeState {
    rules: BTreeMap<String, FirewallRule>,
    outbound_blocked: bool,
    adapters: BTreeMap<String, AdapterDns>,
    flush_count: u32,
    services: BTreeMap<String, ServiceStatus>,
    stopped_services: Vec<String>,
    started_services: Vec<String>,
    processes: Vec<ProcessRecord>,
    killed: Vec<u32>,
    access_denied_pids: BTreeSet<u32>,
    interfaces: Vec<InterfaceRecord>,
    disabled_interfaces: Vec<String>,
    routes: Vec<RouteRecord>,
    dns_answers: BTreeMap<String, Vec<Ipv4Addr>>,
    bios: Option<BiosInfo>,
    computer: Option<ComputerSystemInfo>,
    macs: Vec<String>,
    cpu: String,
    registry_keys: BTreeSet<String>,
    fail_ops: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fail_injected(&self, op: &str) -> bool {
        self.lock().fail_ops.remove(op)
    }

    fn injected_error(op: &str) -> ProctorError {
        ProctorError::firewall(format!("injected failure: {op}"))
    }

    // ---- seeding -------------------------------------------------------

    /// Arms a one-shot failure for the named trait method.
    pub fn fail_once(&self, op: &str) {
        self.lock().fail_ops.insert(op.to_string());
    }

    pub fn set_adapter(&self, name: &str, dns: AdapterDns) {
        self.lock().adapters.insert(name.to_string(), dns);
    }

    pub fn set_service(&self, name: &str, status: ServiceStatus) {
        self.lock().services.insert(name.to_string(), status);
    }

    pub fn push_process(&self, pid: u32, ppid: u32, name: &str) {
        self.lock().processes.push(ProcessRecord {
            pid,
            ppid,
            name: name.to_string(),
            exe: format!("C:\\fake\\{name}"),
        });
    }

    pub fn protect_pid(&self, pid: u32) {
        self.lock().access_denied_pids.insert(pid);
    }

    pub fn push_interface(&self, name: &str, description: &str, up: bool) {
        self.lock().interfaces.push(InterfaceRecord {
            name: name.to_string(),
            description: description.to_string(),
            up,
        });
    }

    pub fn push_route(&self, destination: &str, gateway: &str, interface: &str) {
        self.lock().routes.push(RouteRecord {
            destination: destination.to_string(),
            gateway: gateway.to_string(),
            interface: interface.to_string(),
        });
    }

    pub fn set_dns_answer(&self, host: &str, ips: Vec<Ipv4Addr>) {
        self.lock()
            .dns_answers
            .insert(host.to_ascii_lowercase(), ips);
    }

    pub fn clear_dns_answers(&self) {
        self.lock().dns_answers.clear();
    }

    pub fn set_bios(&self, manufacturer: &str, version: &str) {
        self.lock().bios = Some(BiosInfo {
            manufacturer: manufacturer.to_string(),
            version: version.to_string(),
        });
    }

    pub fn set_computer_system(&self, manufacturer: &str, model: &str, hypervisor: bool) {
        self.lock().computer = Some(ComputerSystemInfo {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            hypervisor_present: hypervisor,
        });
    }

    pub fn set_macs(&self, macs: Vec<String>) {
        self.lock().macs = macs;
    }

    pub fn set_cpu_brand(&self, brand: &str) {
        self.lock().cpu = brand.to_string();
    }

    pub fn add_registry_key(&self, path: &str) {
        self.lock().registry_keys.insert(path.to_string());
    }

    // ---- inspection ----------------------------------------------------

    pub fn rule_names_snapshot(&self) -> Vec<String> {
        self.lock().rules.keys().cloned().collect()
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.lock().rules.contains_key(name)
    }

    pub fn outbound_blocked(&self) -> bool {
        self.lock().outbound_blocked
    }

    pub fn adapter_dns_of(&self, name: &str) -> Option<AdapterDns> {
        self.lock().adapters.get(name).cloned()
    }

    pub fn flush_count(&self) -> u32 {
        self.lock().flush_count
    }

    pub fn stopped_services(&self) -> Vec<String> {
        self.lock().stopped_services.clone()
    }

    pub fn started_services(&self) -> Vec<String> {
        self.lock().started_services.clone()
    }

    pub fn killed_pids(&self) -> Vec<u32> {
        self.lock().killed.clone()
    }

    pub fn disabled_interfaces(&self) -> Vec<String> {
        self.lock().disabled_interfaces.clone()
    }
}

impl Platform for FakePlatform {
    fn firewall_add_rule(&self, rule: &FirewallRule) -> Result<(), ProctorError> {
        if self.fail_injected("firewall_add_rule") {
            return Err(Self::injected_error("firewall_add_rule"));
        }
        self.lock().rules.insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    fn firewall_delete_rule(&self, name: &str) -> Result<bool, ProctorError> {
        if self.fail_injected("firewall_delete_rule") {
            return Err(Self::injected_error("firewall_delete_rule"));
        }
        Ok(self.lock().rules.remove(name).is_some())
    }

    fn firewall_rule_names(&self, prefix: &str) -> Result<Vec<String>, ProctorError> {
        Ok(self
            .lock()
            .rules
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn firewall_rule_exists(&self, name: &str) -> Result<bool, ProctorError> {
        Ok(self.lock().rules.contains_key(name))
    }

    fn firewall_set_outbound_block(&self, block: bool) -> Result<(), ProctorError> {
        if self.fail_injected("firewall_set_outbound_block") {
            return Err(Self::injected_error("firewall_set_outbound_block"));
        }
        self.lock().outbound_blocked = block;
        Ok(())
    }

    fn active_adapters(&self) -> Result<Vec<String>, ProctorError> {
        Ok(self.lock().adapters.keys().cloned().collect())
    }

    fn adapter_dns(&self, adapter: &str) -> Result<AdapterDns, ProctorError> {
        self.lock()
            .adapters
            .get(adapter)
            .cloned()
            .ok_or_else(|| ProctorError::network(format!("unknown adapter {adapter}")))
    }

    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<(), ProctorError> {
        if self.fail_injected("set_adapter_dns") {
            return Err(Self::injected_error("set_adapter_dns"));
        }
        self.lock()
            .adapters
            .insert(adapter.to_string(), dns.clone());
        Ok(())
    }

    fn flush_dns_cache(&self) -> Result<(), ProctorError> {
        self.lock().flush_count += 1;
        Ok(())
    }

    fn service_status(&self, name: &str) -> Result<ServiceStatus, ProctorError> {
        Ok(self
            .lock()
            .services
            .get(name)
            .copied()
            .unwrap_or(ServiceStatus::NotFound))
    }

    fn stop_service(&self, name: &str, _wait: Duration) -> Result<bool, ProctorError> {
        if self.fail_injected("stop_service") {
            return Err(Self::injected_error("stop_service"));
        }
        let mut state = self.lock();
        let was_running = matches!(
            state.services.get(name),
            Some(ServiceStatus::Running | ServiceStatus::Transitioning)
        );
        state
            .services
            .insert(name.to_string(), ServiceStatus::Stopped);
        state.stopped_services.push(name.to_string());
        Ok(was_running)
    }

    fn start_service(&self, name: &str, _wait: Duration) -> Result<(), ProctorError> {
        if self.fail_injected("start_service") {
            return Err(Self::injected_error("start_service"));
        }
        let mut state = self.lock();
        state
            .services
            .insert(name.to_string(), ServiceStatus::Running);
        state.started_services.push(name.to_string());
        Ok(())
    }

    fn processes(&self) -> Result<Vec<ProcessRecord>, ProctorError> {
        Ok(self.lock().processes.clone())
    }

    fn kill_process_tree(&self, pid: u32, _wait: Duration) -> Result<KillOutcome, ProctorError> {
        let mut state = self.lock();
        if state.access_denied_pids.contains(&pid) {
            return Ok(KillOutcome::AccessDenied);
        }
        if !state.processes.iter().any(|p| p.pid == pid) {
            return Ok(KillOutcome::NotFound);
        }

        let mut doomed: BTreeSet<u32> = BTreeSet::new();
        doomed.insert(pid);
        loop {
            let before = doomed.len();
            for p in &state.processes {
                if doomed.contains(&p.ppid) {
                    doomed.insert(p.pid);
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        state.processes.retain(|p| !doomed.contains(&p.pid));
        state.killed.extend(doomed.iter().copied());
        Ok(KillOutcome::Killed)
    }

    fn network_interfaces(&self) -> Result<Vec<InterfaceRecord>, ProctorError> {
        Ok(self.lock().interfaces.clone())
    }

    fn disable_interface(&self, name: &str) -> Result<(), ProctorError> {
        if self.fail_injected("disable_interface") {
            return Err(Self::injected_error("disable_interface"));
        }
        let mut state = self.lock();
        for iface in &mut state.interfaces {
            if iface.name == name {
                iface.up = false;
            }
        }
        state.disabled_interfaces.push(name.to_string());
        Ok(())
    }

    fn default_routes(&self) -> Result<Vec<RouteRecord>, ProctorError> {
        Ok(self.lock().routes.clone())
    }

    fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, ProctorError> {
        self.lock()
            .dns_answers
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ProctorError::DnsError {
                message: format!("no answer for {host}"),
                code: Some(ErrorCode::Dns202),
            })
    }

    fn bios_info(&self) -> Option<BiosInfo> {
        self.lock().bios.clone()
    }

    fn computer_system(&self) -> Option<ComputerSystemInfo> {
        self.lock().computer.clone()
    }

    fn mac_addresses(&self) -> Vec<String> {
        self.lock().macs.clone()
    }

    fn cpu_brand(&self) -> String {
        self.lock().cpu.clone()
    }

    fn registry_key_exists(&self, hklm_path: &str) -> bool {
        self.lock().registry_keys.contains(hklm_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_deleted_by_exact_name_only() -> Result<(), ProctorError> {
        let fake = FakePlatform::new();
        fake.firewall_add_rule(&FirewallRule::allow("Proctor_A"))?;
        fake.firewall_add_rule(&FirewallRule::allow("Proctor_B"))?;
        assert!(fake.firewall_delete_rule("Proctor_A")?);
        assert!(!fake.firewall_delete_rule("Proctor_A")?);
        assert_eq!(fake.rule_names_snapshot(), vec!["Proctor_B".to_string()]);
        Ok(())
    }

    #[test]
    fn prefix_listing_ignores_foreign_rules() -> Result<(), ProctorError> {
        let fake = FakePlatform::new();
        fake.firewall_add_rule(&FirewallRule::allow("Proctor_A"))?;
        fake.firewall_add_rule(&FirewallRule::allow("CoreNet-DNS-Out"))?;
        assert_eq!(
            fake.firewall_rule_names("Proctor_")?,
            vec!["Proctor_A".to_string()]
        );
        Ok(())
    }

    #[test]
    fn kill_tree_takes_descendants() -> Result<(), ProctorError> {
        let fake = FakePlatform::new();
        fake.push_process(100, 1, "parent.exe");
        fake.push_process(101, 100, "child.exe");
        fake.push_process(102, 101, "grandchild.exe");
        fake.push_process(200, 1, "bystander.exe");

        assert_eq!(
            fake.kill_process_tree(100, Duration::from_secs(1))?,
            KillOutcome::Killed
        );
        let remaining = fake.processes()?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, 200);
        Ok(())
    }

    #[test]
    fn injected_failures_fire_once() {
        let fake = FakePlatform::new();
        fake.fail_once("firewall_set_outbound_block");
        assert!(fake.firewall_set_outbound_block(true).is_err());
        assert!(fake.firewall_set_outbound_block(true).is_ok());
        assert!(fake.outbound_blocked());
    }

    #[test]
    fn stop_service_reports_prior_state() -> Result<(), ProctorError> {
        let fake = FakePlatform::new();
        fake.set_service("Dnscache", ServiceStatus::Running);
        assert!(fake.stop_service("Dnscache", Duration::from_secs(10))?);
        assert!(!fake.stop_service("Dnscache", Duration::from_secs(10))?);
        assert_eq!(fake.stopped_services().len(), 2);
        Ok(())
    }
}
