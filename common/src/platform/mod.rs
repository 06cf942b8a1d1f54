//! Abstraction boundary over OS facilities. Every subprocess invocation and
//! system query the agent performs goes through [`Platform`], so the whole
//! engine can run against the in-memory [`fake::FakePlatform`] in tests.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::ProctorError;

pub mod fake;
pub mod windows;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProtocol {
    Any,
    Tcp,
    Udp,
}

/// One outbound firewall rule as the agent models it. `remote_ips` empty
/// means "any remote address".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub action: RuleAction,
    pub protocol: RuleProtocol,
    pub remote_ips: Vec<Ipv4Addr>,
    pub remote_port: Option<u16>,
    pub program: Option<String>,
}

impl FirewallRule {
    pub fn allow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: RuleAction::Allow,
            protocol: RuleProtocol::Any,
            remote_ips: Vec::new(),
            remote_port: None,
            program: None,
        }
    }

    pub fn block(name: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Block,
            ..Self::allow(name)
        }
    }

    pub fn tcp(mut self, port: u16) -> Self {
        self.protocol = RuleProtocol::Tcp;
        self.remote_port = Some(port);
        self
    }

    pub fn udp(mut self, port: u16) -> Self {
        self.protocol = RuleProtocol::Udp;
        self.remote_port = Some(port);
        self
    }

    pub fn remote(mut self, ips: Vec<Ipv4Addr>) -> Self {
        self.remote_ips = ips;
        self
    }

    pub fn program(mut self, path: impl Into<String>) -> Self {
        self.program = Some(path.into());
        self
    }
}

/// Per-adapter DNS configuration; `Dhcp` is the sentinel for "no static
/// servers captured".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterDns {
    Dhcp,
    Static(Vec<Ipv4Addr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotFound,
    Transitioning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub exe: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    AccessDenied,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub name: String,
    pub description: String,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub destination: String,
    pub gateway: String,
    pub interface: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BiosInfo {
    pub manufacturer: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputerSystemInfo {
    pub manufacturer: String,
    pub model: String,
    pub hypervisor_present: bool,
}

#[allow(clippy::missing_errors_doc)]
pub trait Platform: Send + Sync {
    // Firewall rule CRUD and default outbound policy.
    fn firewall_add_rule(&self, rule: &FirewallRule) -> Result<(), ProctorError>;
    fn firewall_delete_rule(&self, name: &str) -> Result<bool, ProctorError>;
    fn firewall_rule_names(&self, prefix: &str) -> Result<Vec<String>, ProctorError>;
    fn firewall_rule_exists(&self, name: &str) -> Result<bool, ProctorError>;
    fn firewall_set_outbound_block(&self, block: bool) -> Result<(), ProctorError>;

    // Network-adapter DNS configuration.
    fn active_adapters(&self) -> Result<Vec<String>, ProctorError>;
    fn adapter_dns(&self, adapter: &str) -> Result<AdapterDns, ProctorError>;
    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<(), ProctorError>;
    fn flush_dns_cache(&self) -> Result<(), ProctorError>;

    // Service lifecycle. `stop_service` reports whether the service was
    // actually running before the call.
    fn service_status(&self, name: &str) -> Result<ServiceStatus, ProctorError>;
    fn stop_service(&self, name: &str, wait: Duration) -> Result<bool, ProctorError>;
    fn start_service(&self, name: &str, wait: Duration) -> Result<(), ProctorError>;

    // Process enumeration and termination.
    fn processes(&self) -> Result<Vec<ProcessRecord>, ProctorError>;
    fn kill_process_tree(&self, pid: u32, wait: Duration) -> Result<KillOutcome, ProctorError>;

    // Interfaces and routing.
    fn network_interfaces(&self) -> Result<Vec<InterfaceRecord>, ProctorError>;
    fn disable_interface(&self, name: &str) -> Result<(), ProctorError>;
    fn default_routes(&self) -> Result<Vec<RouteRecord>, ProctorError>;

    // Name resolution through the OS resolver.
    fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, ProctorError>;

    // System-info probes used by the VM detector.
    fn bios_info(&self) -> Option<BiosInfo>;
    fn computer_system(&self) -> Option<ComputerSystemInfo>;
    fn mac_addresses(&self) -> Vec<String>;
    fn cpu_brand(&self) -> String;
    fn registry_key_exists(&self, hklm_path: &str) -> bool;
}
