use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProctorError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProctorConfig {
    pub agent: AgentConfig,
    pub dns: DnsFilterConfig,
    pub firewall: FirewallConfig,
    pub allowlist: AllowlistConfig,
    pub watchdog: WatchdogConfig,
    pub vpn: VpnConfig,
    pub vm: VmConfig,
}

impl ProctorConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        self.agent.validate()?;
        self.dns.validate()?;
        self.firewall.validate()?;
        self.allowlist.validate()?;
        self.watchdog.validate()?;
        self.vpn.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Reserved name prefix: IPC endpoints are `<tag>` / `<tag>_Response`
    /// and every firewall rule name starts with `<tag>_`.
    pub tag: String,
    /// Base-name prefix of agent-owned processes the watchdog must never
    /// terminate.
    pub reserved_process_prefix: String,
    pub ipc_retry_backoff_ms: u64,
    pub service_stop_wait_sec: u64,
    pub service_start_wait_sec: u64,
    /// Unix hosts only: directory holding the command/response sockets.
    pub socket_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tag: "Proctor".to_string(),
            reserved_process_prefix: "proctor".to_string(),
            ipc_retry_backoff_ms: 500,
            service_stop_wait_sec: 10,
            service_start_wait_sec: 15,
            socket_dir: None,
        }
    }
}

impl AgentConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        if self.tag.is_empty() || !self.tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProctorError::ConfigError {
                message: "agent.tag 必须为非空 ASCII 字母数字".to_string(),
            });
        }
        if self.reserved_process_prefix.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "agent.reserved_process_prefix 不能为空".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsFilterConfig {
    pub bind_addr: String,
    pub upstream: String,
    pub forward_timeout_ms: u64,
    /// Names (and their sub-domains) the filter forwards; everything else
    /// gets NXDOMAIN.
    pub allow_domains: Vec<String>,
    /// Host service that normally holds UDP/53 and is stopped on
    /// contention.
    pub cache_service: String,
}

impl Default for DnsFilterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:53".to_string(),
            upstream: "8.8.8.8:53".to_string(),
            forward_timeout_ms: 5_000,
            allow_domains: vec![
                "codeforces.com".to_string(),
                "msftconnecttest.com".to_string(),
                "msftncsi.com".to_string(),
            ],
            cache_service: "Dnscache".to_string(),
        }
    }
}

impl DnsFilterConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ProctorError::ConfigError {
                message: format!("dns.bind_addr 不是合法地址: {}", self.bind_addr),
            });
        }
        if self.upstream.parse::<SocketAddr>().is_err() {
            return Err(ProctorError::ConfigError {
                message: format!("dns.upstream 不是合法地址: {}", self.upstream),
            });
        }
        if self.forward_timeout_ms == 0 {
            return Err(ProctorError::ConfigError {
                message: "dns.forward_timeout_ms 不能为 0".to_string(),
            });
        }
        if self.allow_domains.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "dns.allow_domains 不能为空".to_string(),
            });
        }
        if self.cache_service.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "dns.cache_service 不能为空".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirewallConfig {
    /// OS connectivity-check endpoints kept reachable while outbound is
    /// deny-by-default.
    pub connectivity_ips: Vec<String>,
    /// Service-host binary whose own traffic stays permitted.
    pub service_host_program: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            connectivity_ips: vec!["13.107.4.52".to_string()],
            service_host_program: "C:\\Windows\\System32\\svchost.exe".to_string(),
        }
    }
}

impl FirewallConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        for ip in &self.connectivity_ips {
            if ip.parse::<Ipv4Addr>().is_err() {
                return Err(ProctorError::ConfigError {
                    message: format!("firewall.connectivity_ips 含非法 IPv4: {ip}"),
                });
            }
        }
        if self.service_host_program.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "firewall.service_host_program 不能为空".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllowlistConfig {
    /// Domains resolved on each refresh tick. Includes the exam provider's
    /// names and the CDN/edge names they depend on, so it is not
    /// necessarily equal to `dns.allow_domains`.
    pub domains: Vec<String>,
    pub refresh_interval_sec: u64,
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            domains: vec![
                "codeforces.com".to_string(),
                "www.codeforces.com".to_string(),
            ],
            refresh_interval_sec: 180,
        }
    }
}

impl AllowlistConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        if self.domains.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "allowlist.domains 不能为空".to_string(),
            });
        }
        if self.refresh_interval_sec == 0 {
            return Err(ProctorError::ConfigError {
                message: "allowlist.refresh_interval_sec 不能为 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
    pub kill_wait_ms: u64,
    /// Exact, case-insensitive executable base names that survive lockdown.
    /// `.exe` suffixes are ignored during comparison.
    pub whitelist: Vec<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            kill_wait_ms: 1_000,
            whitelist: default_process_whitelist(),
        }
    }
}

impl WatchdogConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        if self.interval_ms == 0 {
            return Err(ProctorError::ConfigError {
                message: "watchdog.interval_ms 不能为 0".to_string(),
            });
        }
        if self.whitelist.is_empty() {
            return Err(ProctorError::ConfigError {
                message: "watchdog.whitelist 不能为空".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VpnConfig {
    pub interval_ms: u64,
    /// Interface-description substrings, matched case-insensitively.
    pub interface_keywords: Vec<String>,
    pub service_names: Vec<String>,
    pub process_names: Vec<String>,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            interface_keywords: vec![
                "tap".to_string(),
                "tun".to_string(),
                "vpn".to_string(),
                "wireguard".to_string(),
                "openvpn".to_string(),
                "nordvpn".to_string(),
                "expressvpn".to_string(),
                "proton".to_string(),
                "surfshark".to_string(),
                "windscribe".to_string(),
                "cyberghost".to_string(),
                "hamachi".to_string(),
                "zerotier".to_string(),
                "tailscale".to_string(),
            ],
            service_names: vec![
                "OpenVPNService".to_string(),
                "OpenVPNServiceInteractive".to_string(),
                "WireGuardManager".to_string(),
                "nordvpn-service".to_string(),
                "ExpressVPNService".to_string(),
                "ProtonVPN Service".to_string(),
                "Surfshark Service".to_string(),
                "WindscribeService".to_string(),
                "Hamachi2Svc".to_string(),
                "ZeroTierOneService".to_string(),
                "Tailscale".to_string(),
            ],
            process_names: vec![
                "openvpn".to_string(),
                "openvpn-gui".to_string(),
                "wireguard".to_string(),
                "nordvpn".to_string(),
                "expressvpn".to_string(),
                "protonvpn".to_string(),
                "surfshark".to_string(),
                "windscribe".to_string(),
                "cyberghost".to_string(),
                "hamachi-2".to_string(),
                "zerotier-one".to_string(),
                "tailscaled".to_string(),
                "tailscale-ipn".to_string(),
            ],
        }
    }
}

impl VpnConfig {
    #[allow(clippy::missing_errors_doc)]
    pub fn validate(&self) -> Result<(), ProctorError> {
        if self.interval_ms == 0 {
            return Err(ProctorError::ConfigError {
                message: "vpn.interval_ms 不能为 0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmConfig {
    pub bios_markers: Vec<String>,
    pub system_markers: Vec<String>,
    pub process_names: Vec<String>,
    pub registry_keys: Vec<String>,
    pub mac_oui_prefixes: Vec<String>,
    pub cpu_markers: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            bios_markers: vec![
                "vmware".to_string(),
                "virtualbox".to_string(),
                "vbox".to_string(),
                "qemu".to_string(),
                "seabios".to_string(),
                "bochs".to_string(),
                "xen".to_string(),
                "parallels".to_string(),
            ],
            system_markers: vec![
                "vmware".to_string(),
                "virtualbox".to_string(),
                "virtual machine".to_string(),
                "qemu".to_string(),
                "kvm".to_string(),
                "parallels".to_string(),
                "innotek".to_string(),
            ],
            process_names: vec![
                "vmtoolsd".to_string(),
                "vm3dservice".to_string(),
                "vmwaretray".to_string(),
                "vboxservice".to_string(),
                "vboxtray".to_string(),
                "qemu-ga".to_string(),
                "prl_tools".to_string(),
            ],
            registry_keys: vec![
                "HARDWARE\\ACPI\\DSDT\\VBOX__".to_string(),
                "SOFTWARE\\VMware, Inc.\\VMware Tools".to_string(),
                "SOFTWARE\\Oracle\\VirtualBox Guest Additions".to_string(),
                "SYSTEM\\ControlSet001\\Services\\VBoxGuest".to_string(),
            ],
            mac_oui_prefixes: vec![
                "00:05:69".to_string(),
                "00:0C:29".to_string(),
                "00:1C:14".to_string(),
                "00:50:56".to_string(),
                "08:00:27".to_string(),
                "00:15:5D".to_string(),
                "00:16:3E".to_string(),
                "52:54:00".to_string(),
            ],
            cpu_markers: vec![
                "kvm".to_string(),
                "qemu".to_string(),
                "virtual".to_string(),
            ],
        }
    }
}

fn default_process_whitelist() -> Vec<String> {
    [
        // Kernel, session and security processes.
        "system",
        "idle",
        "registry",
        "memory compression",
        "smss",
        "csrss",
        "wininit",
        "winlogon",
        "services",
        "lsass",
        "svchost",
        "fontdrvhost",
        "dwm",
        "sihost",
        "ctfmon",
        "conhost",
        "dllhost",
        "taskhostw",
        "runtimebroker",
        "wmiprvse",
        // Shell and task manager.
        "explorer",
        "taskmgr",
        "searchhost",
        "startmenuexperiencehost",
        "shellexperiencehost",
        "textinputhost",
        // Printing and audio.
        "spoolsv",
        "audiodg",
        // Defender and security center.
        "msmpeng",
        "nissrv",
        "securityhealthservice",
        "securityhealthsystray",
        // Update services.
        "wuauclt",
        "usoclient",
        "mousocoreworker",
        "tiworker",
        "trustedinstaller",
        // Vendor audio/graphics agents.
        "nvcontainer",
        "nvdisplay.container",
        "rtkauduservice64",
        "igfxem",
        // Browsers allowed to open the exam URL.
        "msedge",
        "chrome",
        "firefox",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

#[allow(clippy::missing_errors_doc)]
pub fn load_yaml_file(path: &Path) -> Result<ProctorConfig, ProctorError> {
    let text = std::fs::read_to_string(path).map_err(ProctorError::IoError)?;
    serde_yaml::from_str::<ProctorConfig>(&text).map_err(|e| ProctorError::ConfigError {
        message: format!("解析配置 YAML 失败: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ProctorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agent.tag, "Proctor");
        assert_eq!(cfg.allowlist.refresh_interval_sec, 180);
        assert_eq!(cfg.watchdog.interval_ms, 2_000);
    }

    #[test]
    fn whitelist_covers_shell_and_browsers() {
        let cfg = WatchdogConfig::default();
        for name in ["explorer", "taskmgr", "msedge", "chrome"] {
            assert!(cfg.whitelist.iter().any(|w| w == name), "missing {name}");
        }
    }

    #[test]
    fn zero_refresh_interval_is_rejected() {
        let cfg = AllowlistConfig {
            refresh_interval_sec: 0,
            ..AllowlistConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_upstream_addr_is_rejected() {
        let cfg = DnsFilterConfig {
            upstream: "not-an-addr".to_string(),
            ..DnsFilterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_alphanumeric_tag_is_rejected() {
        let cfg = AgentConfig {
            tag: "Proctor_".to_string(),
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_connectivity_ip_is_rejected() {
        let cfg = FirewallConfig {
            connectivity_ips: vec!["13.107.4".to_string()],
            ..FirewallConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
