use std::net::Ipv4Addr;
#[cfg(windows)]
use std::process::Command;
use std::time::Duration;
#[cfg(windows)]
use std::time::Instant;

use sysinfo::System;

use crate::error::{ErrorCode, ProctorError};
use crate::platform::{
    AdapterDns, BiosInfo, ComputerSystemInfo, FirewallRule, InterfaceRecord, KillOutcome,
    Platform, ProcessRecord, RouteRecord, RuleAction, RuleProtocol, ServiceStatus,
};

#[cfg(windows)]
use serde::Deserialize;
#[cfg(windows)]
use wmi::{COMLibrary, WMIConnection};

#[cfg(windows)]
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(250);
#[cfg(windows)]
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// Production adapter: shells out to `netsh`, `sc`, `ipconfig` and
/// `taskkill`, and queries WMI, winreg and sysinfo. Non-Windows builds get
/// inert stubs so the logic crates compile and test anywhere.
#[derive(Debug, Default)]
pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
fn windows_system32_exe_path(relative: &str) -> std::path::PathBuf {
    let sysroot = std::env::var_os("SystemRoot")
        .or_else(|| std::env::var_os("windir"))
        .unwrap_or_else(|| "C:\\Windows".into());
    std::path::PathBuf::from(sysroot)
        .join("System32")
        .join(relative)
}

#[cfg(windows)]
fn run_tool(exe: &str, args: &[String]) -> Result<std::process::Output, ProctorError> {
    Command::new(windows_system32_exe_path(exe))
        .args(args)
        .output()
        .map_err(|e| ProctorError::service(format!("{exe} 启动失败: {e}")))
}

#[cfg(windows)]
fn output_text(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(out.stdout.as_slice()).to_string();
    if !out.stderr.is_empty() {
        text.push('\n');
        text.push_str(String::from_utf8_lossy(out.stderr.as_slice()).as_ref());
    }
    text
}

#[cfg(windows)]
fn netsh(args: &[String]) -> Result<String, ProctorError> {
    let out = run_tool("netsh.exe", args)?;
    let text = output_text(&out);
    if out.status.success() {
        return Ok(text);
    }
    Err(ProctorError::firewall(format!(
        "netsh {} 失败: {}",
        args.join(" "),
        text.trim()
    )))
}

pub fn rule_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "add".to_string(),
        "rule".to_string(),
        format!("name={}", rule.name),
        "dir=out".to_string(),
        match rule.action {
            RuleAction::Allow => "action=allow".to_string(),
            RuleAction::Block => "action=block".to_string(),
        },
    ];
    match rule.protocol {
        RuleProtocol::Any => {}
        RuleProtocol::Tcp => args.push("protocol=TCP".to_string()),
        RuleProtocol::Udp => args.push("protocol=UDP".to_string()),
    }
    if let Some(port) = rule.remote_port {
        args.push(format!("remoteport={port}"));
    }
    if !rule.remote_ips.is_empty() {
        let ips: Vec<String> = rule.remote_ips.iter().map(Ipv4Addr::to_string).collect();
        args.push(format!("remoteip={}", ips.join(",")));
    }
    if let Some(program) = rule.program.as_deref() {
        args.push(format!("program={program}"));
    }
    args.push("enable=yes".to_string());
    args
}

pub fn parse_rule_names(show_output: &str, prefix: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in show_output.lines() {
        let Some(rest) = line.trim().strip_prefix("Rule Name:") else {
            continue;
        };
        let name = rest.trim();
        if !name.is_empty() && name.starts_with(prefix) {
            out.push(name.to_string());
        }
    }
    out
}

pub fn parse_interface_table(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            continue;
        }
        if cols[0].eq_ignore_ascii_case("Enabled") && cols[1].eq_ignore_ascii_case("Connected") {
            out.push(cols[3..].join(" "));
        }
    }
    out
}

pub fn parse_dnsservers_output(output: &str) -> AdapterDns {
    if output
        .lines()
        .any(|l| l.contains("through DHCP") || l.contains("DHCP:"))
    {
        return AdapterDns::Dhcp;
    }
    let mut servers = Vec::new();
    for line in output.lines() {
        for token in line.split_whitespace() {
            if let Ok(ip) = token.parse::<Ipv4Addr>() {
                servers.push(ip);
            }
        }
    }
    if servers.is_empty() {
        AdapterDns::Dhcp
    } else {
        AdapterDns::Static(servers)
    }
}

pub fn parse_sc_query_state(output: &str) -> ServiceStatus {
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("STATE") {
            continue;
        }
        let Some((_, rest)) = trimmed.split_once(':') else {
            continue;
        };
        let state_word = rest.split_whitespace().last().unwrap_or_default();
        if state_word.eq_ignore_ascii_case("RUNNING") {
            return ServiceStatus::Running;
        }
        if state_word.eq_ignore_ascii_case("STOPPED") {
            return ServiceStatus::Stopped;
        }
        return ServiceStatus::Transitioning;
    }
    ServiceStatus::NotFound
}

#[cfg(windows)]
#[derive(Deserialize)]
struct WmiBios {
    #[serde(rename = "Manufacturer")]
    manufacturer: Option<String>,
    #[serde(rename = "SMBIOSBIOSVersion")]
    smbios_version: Option<String>,
}

#[cfg(windows)]
#[derive(Deserialize)]
struct WmiComputerSystem {
    #[serde(rename = "Manufacturer")]
    manufacturer: Option<String>,
    #[serde(rename = "Model")]
    model: Option<String>,
    #[serde(rename = "HypervisorPresent")]
    hypervisor_present: Option<bool>,
}

#[cfg(windows)]
#[derive(Deserialize)]
struct WmiAdapter {
    #[serde(rename = "InterfaceIndex")]
    interface_index: Option<u32>,
    #[serde(rename = "NetConnectionID")]
    net_connection_id: Option<String>,
    #[serde(rename = "Description")]
    description: Option<String>,
    #[serde(rename = "NetEnabled")]
    net_enabled: Option<bool>,
}

#[cfg(windows)]
#[derive(Deserialize)]
struct WmiRoute {
    #[serde(rename = "Destination")]
    destination: Option<String>,
    #[serde(rename = "NextHop")]
    next_hop: Option<String>,
    #[serde(rename = "InterfaceIndex")]
    interface_index: Option<i32>,
}

#[cfg(windows)]
fn wmi_connection() -> Result<WMIConnection, ProctorError> {
    let com = COMLibrary::new()
        .map_err(|e| ProctorError::network(format!("初始化 COM 失败: {e}")))?;
    WMIConnection::new(com).map_err(|e| ProctorError::network(format!("连接 WMI 失败: {e}")))
}

impl Platform for WindowsPlatform {
    fn firewall_add_rule(&self, rule: &FirewallRule) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            netsh(&rule_args(rule)).map(|_| ())
        }
        #[cfg(not(windows))]
        {
            let _ = rule;
            Err(unsupported())
        }
    }

    fn firewall_delete_rule(&self, name: &str) -> Result<bool, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = [
                "advfirewall",
                "firewall",
                "delete",
                "rule",
                &format!("name={name}"),
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
            let out = run_tool("netsh.exe", &args)?;
            if out.status.success() {
                return Ok(true);
            }
            let text = output_text(&out);
            if text.contains("No rules match") {
                return Ok(false);
            }
            Err(ProctorError::FirewallError {
                message: format!("删除防火墙规则 {name} 失败: {}", text.trim()),
                code: Some(ErrorCode::Fw302),
            })
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(unsupported())
        }
    }

    fn firewall_rule_names(&self, prefix: &str) -> Result<Vec<String>, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = ["advfirewall", "firewall", "show", "rule", "name=all"]
                .iter()
                .map(|s| (*s).to_string())
                .collect();
            let out = run_tool("netsh.exe", &args)?;
            let text = output_text(&out);
            if !out.status.success() && !text.contains("No rules match") {
                return Err(ProctorError::firewall(format!(
                    "枚举防火墙规则失败: {}",
                    text.trim()
                )));
            }
            Ok(parse_rule_names(&text, prefix))
        }
        #[cfg(not(windows))]
        {
            let _ = prefix;
            Err(unsupported())
        }
    }

    fn firewall_rule_exists(&self, name: &str) -> Result<bool, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = [
                "advfirewall",
                "firewall",
                "show",
                "rule",
                &format!("name={name}"),
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
            let out = run_tool("netsh.exe", &args)?;
            Ok(out.status.success())
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(unsupported())
        }
    }

    fn firewall_set_outbound_block(&self, block: bool) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            let policy = if block {
                "blockinbound,blockoutbound"
            } else {
                "blockinbound,allowoutbound"
            };
            let args: Vec<String> = ["advfirewall", "set", "allprofiles", "firewallpolicy", policy]
                .iter()
                .map(|s| (*s).to_string())
                .collect();
            netsh(&args).map(|_| ())
        }
        #[cfg(not(windows))]
        {
            let _ = block;
            Err(unsupported())
        }
    }

    fn active_adapters(&self) -> Result<Vec<String>, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = ["interface", "show", "interface"]
                .iter()
                .map(|s| (*s).to_string())
                .collect();
            let text = netsh(&args)?;
            Ok(parse_interface_table(&text))
        }
        #[cfg(not(windows))]
        {
            Err(unsupported())
        }
    }

    fn adapter_dns(&self, adapter: &str) -> Result<AdapterDns, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = [
                "interface",
                "ipv4",
                "show",
                "dnsservers",
                &format!("name={adapter}"),
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
            let text = netsh(&args)?;
            Ok(parse_dnsservers_output(&text))
        }
        #[cfg(not(windows))]
        {
            let _ = adapter;
            Err(unsupported())
        }
    }

    fn set_adapter_dns(&self, adapter: &str, dns: &AdapterDns) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            match dns {
                AdapterDns::Dhcp => {
                    let args: Vec<String> = [
                        "interface",
                        "ipv4",
                        "set",
                        "dnsservers",
                        &format!("name={adapter}"),
                        "source=dhcp",
                    ]
                    .iter()
                    .map(|s| (*s).to_string())
                    .collect();
                    netsh(&args).map(|_| ())
                }
                AdapterDns::Static(servers) => {
                    let Some(first) = servers.first() else {
                        return self.set_adapter_dns(adapter, &AdapterDns::Dhcp);
                    };
                    let args = vec![
                        "interface".to_string(),
                        "ipv4".to_string(),
                        "set".to_string(),
                        "dnsservers".to_string(),
                        format!("name={adapter}"),
                        "source=static".to_string(),
                        format!("address={first}"),
                        "register=primary".to_string(),
                        "validate=no".to_string(),
                    ];
                    netsh(&args)?;
                    for (i, server) in servers.iter().enumerate().skip(1) {
                        let args = vec![
                            "interface".to_string(),
                            "ipv4".to_string(),
                            "add".to_string(),
                            "dnsservers".to_string(),
                            format!("name={adapter}"),
                            format!("address={server}"),
                            format!("index={}", i + 1),
                            "validate=no".to_string(),
                        ];
                        netsh(&args)?;
                    }
                    Ok(())
                }
            }
        }
        #[cfg(not(windows))]
        {
            let _ = (adapter, dns);
            Err(unsupported())
        }
    }

    fn flush_dns_cache(&self) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            let out = run_tool("ipconfig.exe", &["/flushdns".to_string()])?;
            if out.status.success() {
                return Ok(());
            }
            Err(ProctorError::network(format!(
                "ipconfig /flushdns 失败: {}",
                output_text(&out).trim()
            )))
        }
        #[cfg(not(windows))]
        {
            Err(unsupported())
        }
    }

    fn service_status(&self, name: &str) -> Result<ServiceStatus, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = vec!["query".to_string(), name.to_string()];
            let out = run_tool("sc.exe", &args)?;
            if out.status.code() == Some(SC_SERVICE_DOES_NOT_EXIST) {
                return Ok(ServiceStatus::NotFound);
            }
            Ok(parse_sc_query_state(&output_text(&out)))
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(unsupported())
        }
    }

    fn stop_service(&self, name: &str, wait: Duration) -> Result<bool, ProctorError> {
        #[cfg(windows)]
        {
            match self.service_status(name)? {
                ServiceStatus::Running | ServiceStatus::Transitioning => {}
                ServiceStatus::Stopped | ServiceStatus::NotFound => return Ok(false),
            }
            let args: Vec<String> = vec!["stop".to_string(), name.to_string()];
            let _ = run_tool("sc.exe", &args)?;
            let deadline = Instant::now() + wait;
            loop {
                if self.service_status(name)? == ServiceStatus::Stopped {
                    return Ok(true);
                }
                if Instant::now() > deadline {
                    return Err(ProctorError::service(format!(
                        "服务 {name} 在 {}s 内未停止",
                        wait.as_secs()
                    )));
                }
                std::thread::sleep(SERVICE_POLL_INTERVAL);
            }
        }
        #[cfg(not(windows))]
        {
            let _ = (name, wait);
            Err(unsupported())
        }
    }

    fn start_service(&self, name: &str, wait: Duration) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            if self.service_status(name)? == ServiceStatus::Running {
                return Ok(());
            }
            let args: Vec<String> = vec!["start".to_string(), name.to_string()];
            let _ = run_tool("sc.exe", &args)?;
            let deadline = Instant::now() + wait;
            loop {
                if self.service_status(name)? == ServiceStatus::Running {
                    return Ok(());
                }
                if Instant::now() > deadline {
                    return Err(ProctorError::service(format!(
                        "服务 {name} 在 {}s 内未启动",
                        wait.as_secs()
                    )));
                }
                std::thread::sleep(SERVICE_POLL_INTERVAL);
            }
        }
        #[cfg(not(windows))]
        {
            let _ = (name, wait);
            Err(unsupported())
        }
    }

    fn processes(&self) -> Result<Vec<ProcessRecord>, ProctorError> {
        let mut sys = System::new_all();
        sys.refresh_all();
        let mut out = Vec::new();
        for (pid, proc_) in sys.processes() {
            out.push(ProcessRecord {
                pid: pid.as_u32(),
                ppid: proc_.parent().map_or(0, sysinfo::Pid::as_u32),
                name: proc_.name().to_string(),
                exe: proc_
                    .exe()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    fn kill_process_tree(&self, pid: u32, wait: Duration) -> Result<KillOutcome, ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = vec![
                "/PID".to_string(),
                pid.to_string(),
                "/T".to_string(),
                "/F".to_string(),
            ];
            let out = run_tool("taskkill.exe", &args)?;
            if !out.status.success() {
                let text = output_text(&out);
                if text.contains("Access is denied") {
                    return Ok(KillOutcome::AccessDenied);
                }
                if text.contains("not found") {
                    return Ok(KillOutcome::NotFound);
                }
                return Err(ProctorError::process(format!(
                    "taskkill PID {pid} 失败: {}",
                    text.trim()
                )));
            }
            let deadline = Instant::now() + wait;
            loop {
                let mut sys = System::new();
                sys.refresh_processes();
                if sys.process(sysinfo::Pid::from_u32(pid)).is_none() {
                    return Ok(KillOutcome::Killed);
                }
                if Instant::now() > deadline {
                    return Ok(KillOutcome::Killed);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        #[cfg(not(windows))]
        {
            let _ = wait;
            let mut sys = System::new();
            sys.refresh_processes();
            let Some(proc_) = sys.process(sysinfo::Pid::from_u32(pid)) else {
                return Ok(KillOutcome::NotFound);
            };
            if proc_.kill() {
                Ok(KillOutcome::Killed)
            } else {
                Ok(KillOutcome::AccessDenied)
            }
        }
    }

    fn network_interfaces(&self) -> Result<Vec<InterfaceRecord>, ProctorError> {
        #[cfg(windows)]
        {
            let con = wmi_connection()?;
            let rows: Vec<WmiAdapter> = con
                .raw_query(
                    "SELECT InterfaceIndex, NetConnectionID, Description, NetEnabled \
                     FROM Win32_NetworkAdapter",
                )
                .map_err(|e| ProctorError::network(format!("查询 Win32_NetworkAdapter 失败: {e}")))?;
            Ok(rows
                .into_iter()
                .filter_map(|row| {
                    let name = row.net_connection_id?;
                    Some(InterfaceRecord {
                        name,
                        description: row.description.unwrap_or_default(),
                        up: row.net_enabled.unwrap_or(false),
                    })
                })
                .collect())
        }
        #[cfg(not(windows))]
        {
            Err(unsupported())
        }
    }

    fn disable_interface(&self, name: &str) -> Result<(), ProctorError> {
        #[cfg(windows)]
        {
            let args: Vec<String> = [
                "interface",
                "set",
                "interface",
                &format!("name={name}"),
                "admin=disabled",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
            netsh(&args).map(|_| ())
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(unsupported())
        }
    }

    fn default_routes(&self) -> Result<Vec<RouteRecord>, ProctorError> {
        #[cfg(windows)]
        {
            let con = wmi_connection()?;
            let routes: Vec<WmiRoute> = con
                .raw_query(
                    "SELECT Destination, NextHop, InterfaceIndex \
                     FROM Win32_IP4RouteTable WHERE Destination='0.0.0.0'",
                )
                .map_err(|e| ProctorError::network(format!("查询 Win32_IP4RouteTable 失败: {e}")))?;
            let adapters: Vec<WmiAdapter> = con
                .raw_query("SELECT InterfaceIndex, Description FROM Win32_NetworkAdapter")
                .unwrap_or_default();

            Ok(routes
                .into_iter()
                .map(|route| {
                    let description = route
                        .interface_index
                        .and_then(|idx| {
                            let idx = u32::try_from(idx).ok()?;
                            adapters
                                .iter()
                                .find(|a| a.interface_index == Some(idx))
                                .and_then(|a| a.description.clone())
                        })
                        .unwrap_or_default();
                    RouteRecord {
                        destination: route.destination.unwrap_or_default(),
                        gateway: route.next_hop.unwrap_or_default(),
                        interface: description,
                    }
                })
                .collect())
        }
        #[cfg(not(windows))]
        {
            Err(unsupported())
        }
    }

    fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, ProctorError> {
        use std::net::ToSocketAddrs;

        let addrs = format!("{host}:80")
            .to_socket_addrs()
            .map_err(|e| ProctorError::DnsError {
                message: format!("解析 {host} 失败: {e}"),
                code: Some(ErrorCode::Dns202),
            })?;
        let mut out: Vec<Ipv4Addr> = Vec::new();
        for addr in addrs {
            if let std::net::IpAddr::V4(v4) = addr.ip() {
                if !out.contains(&v4) {
                    out.push(v4);
                }
            }
        }
        Ok(out)
    }

    fn bios_info(&self) -> Option<BiosInfo> {
        #[cfg(windows)]
        {
            let con = wmi_connection().ok()?;
            let rows: Vec<WmiBios> = con
                .raw_query("SELECT Manufacturer, SMBIOSBIOSVersion FROM Win32_BIOS")
                .ok()?;
            let row = rows.into_iter().next()?;
            Some(BiosInfo {
                manufacturer: row.manufacturer.unwrap_or_default(),
                version: row.smbios_version.unwrap_or_default(),
            })
        }
        #[cfg(not(windows))]
        {
            None
        }
    }

    fn computer_system(&self) -> Option<ComputerSystemInfo> {
        #[cfg(windows)]
        {
            let con = wmi_connection().ok()?;
            let rows: Vec<WmiComputerSystem> = con
                .raw_query("SELECT Manufacturer, Model, HypervisorPresent FROM Win32_ComputerSystem")
                .ok()?;
            let row = rows.into_iter().next()?;
            Some(ComputerSystemInfo {
                manufacturer: row.manufacturer.unwrap_or_default(),
                model: row.model.unwrap_or_default(),
                hypervisor_present: row.hypervisor_present.unwrap_or(false),
            })
        }
        #[cfg(not(windows))]
        {
            None
        }
    }

    fn mac_addresses(&self) -> Vec<String> {
        let networks = sysinfo::Networks::new_with_refreshed_list();
        networks
            .iter()
            .map(|(_, data)| data.mac_address().to_string())
            .collect()
    }

    fn cpu_brand(&self) -> String {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_default()
    }

    fn registry_key_exists(&self, hklm_path: &str) -> bool {
        #[cfg(windows)]
        {
            use winreg::RegKey;
            use winreg::enums::HKEY_LOCAL_MACHINE;

            RegKey::predef(HKEY_LOCAL_MACHINE)
                .open_subkey(hklm_path)
                .is_ok()
        }
        #[cfg(not(windows))]
        {
            let _ = hklm_path;
            false
        }
    }
}

#[cfg(not(windows))]
fn unsupported() -> ProctorError {
    ProctorError::ServiceError {
        message: "该平台不支持此操作".to_string(),
        code: None,
    }
}

/// Builds the SECURITY_ATTRIBUTES for the IPC endpoints: full control for
/// SYSTEM and Administrators, read/write for Authenticated Users.
#[cfg(windows)]
pub mod pipe_security {
    use windows_sys::Win32::Foundation::LocalFree;
    use windows_sys::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;

    use crate::error::{ErrorCode, ProctorError};

    const PIPE_SDDL: &str = "D:(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;AU)";

    pub struct PipeSecurity {
        descriptor: *mut core::ffi::c_void,
        attributes: SECURITY_ATTRIBUTES,
    }

    // The descriptor is owned memory freed on drop; nothing aliases it.
    unsafe impl Send for PipeSecurity {}

    impl PipeSecurity {
        #[allow(clippy::missing_errors_doc)]
        pub fn authenticated_users() -> Result<Self, ProctorError> {
            let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(std::iter::once(0)).collect();
            let mut descriptor: *mut core::ffi::c_void = std::ptr::null_mut();
            let ok = unsafe {
                ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    sddl.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    std::ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(ProctorError::IpcError {
                    message: "构造管道安全描述符失败".to_string(),
                    code: Some(ErrorCode::Ipc101),
                });
            }
            Ok(Self {
                descriptor,
                attributes: SECURITY_ATTRIBUTES {
                    nLength: u32::try_from(std::mem::size_of::<SECURITY_ATTRIBUTES>())
                        .unwrap_or(0),
                    lpSecurityDescriptor: descriptor,
                    bInheritHandle: 0,
                },
            })
        }

        pub fn as_mut_ptr(&mut self) -> *mut core::ffi::c_void {
            std::ptr::addr_of_mut!(self.attributes).cast()
        }
    }

    impl Drop for PipeSecurity {
        fn drop(&mut self) {
            if !self.descriptor.is_null() {
                unsafe {
                    LocalFree(self.descriptor);
                }
            }
        }
    }
}
