//! Service registry configuration (component G, spec §4.G/§6).
//!
//! TOML, parsed with `serde`: a `[defaults]` table, an optional
//! `[web_monitor]` table (out of scope per spec §1 but kept so a config
//! naming it still round-trips), and one `[service.<name>]` table per
//! hosted service.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RegistryError;
use crate::supervisor::SupervisorConfig;

fn default_min_procs() -> usize {
    1
}

fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_scale_up_threshold() -> f64 {
    0.3
}

fn default_scale_up_window_secs() -> u64 {
    20
}

fn default_scale_down_window_secs() -> u64 {
    240
}

fn default_wait_until_completed() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    pub log_dir: Option<String>,
    pub min_proc_num: Option<usize>,
    pub max_proc_num: Option<usize>,
    pub wait_until_completed: Option<bool>,
}

/// Out of scope per spec §1 ("a web monitoring UI"); kept so a config
/// naming this table still parses rather than erroring.
#[derive(Debug, Clone, Deserialize)]
pub struct WebMonitorConfig {
    pub bind: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Repurposed from the original's "import this module and
    /// instantiate this class" -- names a statically-registered
    /// `ServiceFactory` the embedding binary provides (see
    /// `registry::ServiceFactory`).
    pub import_from: String,
    pub port: u16,

    #[serde(default)]
    pub tcp_bind: Option<String>,
    #[serde(default)]
    pub tcp_compression: Option<String>,
    #[serde(default)]
    pub tcp_allow_insecure_serialisation: bool,

    #[serde(default = "default_min_procs")]
    pub min_proc_num: usize,
    #[serde(default = "default_max_procs")]
    pub max_proc_num: usize,
    #[serde(default)]
    pub max_proc_mem_bytes: Option<u64>,

    #[serde(default = "default_scale_up_threshold")]
    pub new_proc_cpu_pc: f64,
    #[serde(default = "default_scale_up_window_secs")]
    pub new_proc_avg_over_secs: u64,
    #[serde(default = "default_scale_down_window_secs")]
    pub kill_proc_avg_over_secs: u64,

    #[serde(default = "default_wait_until_completed")]
    pub wait_until_completed: bool,
}

impl ServiceConfig {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            min_procs: self.min_proc_num,
            max_procs: self.max_proc_num,
            max_mem_bytes: self.max_proc_mem_bytes,
            scale_up_threshold: self.new_proc_cpu_pc,
            scale_up_window: Duration::from_secs(self.new_proc_avg_over_secs),
            scale_down_window: Duration::from_secs(self.kill_proc_avg_over_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub web_monitor: Option<WebMonitorConfig>,
    #[serde(rename = "service", default)]
    pub services: HashMap<String, ServiceConfig>,
}

impl RegistryConfig {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_service_table() {
        let toml = r#"
            [service.echo]
            import_from = "echo_service"
            port = 5555
        "#;
        let config: RegistryConfig = toml::from_str(toml).unwrap();
        let service = &config.services["echo"];
        assert_eq!(service.port, 5555);
        assert_eq!(service.min_proc_num, 1);
        assert!(service.wait_until_completed);
    }

    #[test]
    fn parses_full_service_table_with_web_monitor() {
        let toml = r#"
            [defaults]
            log_dir = "/var/log/shmrpc"

            [web_monitor]
            bind = "127.0.0.1:9000"
            enabled = true

            [service.echo]
            import_from = "echo_service"
            port = 5555
            min_proc_num = 2
            max_proc_num = 8
            new_proc_cpu_pc = 0.5
            max_proc_mem_bytes = 1073741824
        "#;
        let config: RegistryConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.log_dir.as_deref(), Some("/var/log/shmrpc"));
        assert!(config.web_monitor.unwrap().enabled);
        let service = &config.services["echo"];
        assert_eq!(service.min_proc_num, 2);
        assert_eq!(service.max_proc_num, 8);
        assert_eq!(service.max_proc_mem_bytes, Some(1_073_741_824));

        let supervisor_config = service.supervisor_config();
        assert_eq!(supervisor_config.min_procs, 2);
        assert_eq!(supervisor_config.scale_up_threshold, 0.5);
    }
}
