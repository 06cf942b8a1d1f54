//! One-shot virtualization probe. Pure observation: combines BIOS and
//! computer-system strings, the hypervisor marker, VM-tool processes,
//! vendor registry keys, MAC OUI prefixes and the CPU brand into a
//! boolean verdict plus the matched indicators.

use std::sync::Arc;

use common::config::VmConfig;
use common::platform::Platform;

use crate::watchdog::normalize_name;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmReport {
    pub is_vm: bool,
    pub indicators: Vec<String>,
}

pub struct VmDetector {
    cfg: VmConfig,
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let lower = haystack.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(&n.to_ascii_lowercase()))
}

impl VmDetector {
    pub fn new(cfg: VmConfig) -> Self {
        Self { cfg }
    }

    pub fn probe(&self, platform: &Arc<dyn Platform>) -> VmReport {
        let mut indicators = Vec::new();

        if let Some(bios) = platform.bios_info() {
            if contains_any(&bios.manufacturer, &self.cfg.bios_markers)
                || contains_any(&bios.version, &self.cfg.bios_markers)
            {
                indicators.push(format!("bios:{}", bios.manufacturer));
            }
        }

        if let Some(system) = platform.computer_system() {
            if contains_any(&system.manufacturer, &self.cfg.system_markers)
                || contains_any(&system.model, &self.cfg.system_markers)
            {
                indicators.push(format!("system:{} {}", system.manufacturer, system.model));
            }
            if system.hypervisor_present {
                indicators.push("hypervisor-present".to_string());
            }
        }

        if let Ok(processes) = platform.processes() {
            for proc_ in processes {
                let normalized = normalize_name(&proc_.name);
                if self
                    .cfg
                    .process_names
                    .iter()
                    .any(|n| normalize_name(n) == normalized)
                {
                    indicators.push(format!("process:{}", proc_.name));
                }
            }
        }

        for key in &self.cfg.registry_keys {
            if platform.registry_key_exists(key) {
                indicators.push(format!("registry:{key}"));
            }
        }

        for mac in platform.mac_addresses() {
            let upper = mac.to_ascii_uppercase();
            if self
                .cfg
                .mac_oui_prefixes
                .iter()
                .any(|p| upper.starts_with(&p.to_ascii_uppercase()))
            {
                indicators.push(format!("mac:{mac}"));
            }
        }

        let cpu = platform.cpu_brand();
        if !cpu.is_empty() && contains_any(&cpu, &self.cfg.cpu_markers) {
            indicators.push(format!("cpu:{cpu}"));
        }

        VmReport {
            is_vm: !indicators.is_empty(),
            indicators,
        }
    }
}
