//! Cluster configuration, resolved once at startup
//!
//! Values come from the process environment (optionally seeded from a `.env`
//! file) and are then frozen into a `ClusterConfig` that the rest of the
//! pipeline borrows.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// VM sizing passed straight through to the hypervisor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resources {
    pub cpus: u32,
    pub memory: String,
    pub disk: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Control-plane count; always 1
    pub servers: u32,
    /// Worker count
    pub agents: u32,
    /// RKE2 release channel (`INSTALL_RKE2_CHANNEL`)
    pub channel: String,
    /// Pinned RKE2 version; `None` installs the channel's latest
    pub version: Option<String>,
    pub server_resources: Resources,
    pub agent_resources: Resources,
    /// Where the standalone kubeconfig is written
    pub output_dir: PathBuf,
    /// Make the merged context the active one even if another is already set
    pub set_current_context: bool,
    /// Merge the fetched credentials into `kubeconfig_target`
    pub merge_kubeconfig: bool,
    /// The long-lived kubeconfig the new context is merged into
    pub kubeconfig_target: PathBuf,
    /// Hypervisor-enforced timeout for a single VM launch
    pub launch_timeout: Duration,
    /// Image passed to `multipass launch`; `None` uses the hypervisor default
    pub image: Option<String>,
}

pub const DEFAULT_CHANNEL: &str = "stable";
pub const DEFAULT_AGENTS: u32 = 2;
pub const DEFAULT_OUTPUT_DIR: &str = "./rke2-cluster";
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 600;

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory: "4G".to_string(),
            disk: "20G".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Build from the process environment, loading `.env` from the working
    /// directory first if one exists
    pub fn from_env() -> Result<(Self, Vec<String>)> {
        if Path::new(".env").exists() {
            dotenv::from_path(".env").context("Failed to load .env file")?;
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::from_lookup(|key| std::env::var(key).ok(), Path::new(&home))
    }

    /// Build from an arbitrary variable lookup. Returns the config plus any
    /// warnings about values that were overridden.
    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<(Self, Vec<String>)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut warnings = Vec::new();

        let requested_servers: u32 = parse_number(&get, "SERVERS", 1)?;
        if requested_servers != 1 {
            warnings.push(format!(
                "SERVERS={} is not supported; only a single control-plane node is created",
                requested_servers
            ));
        }

        let server_resources = Resources {
            cpus: parse_number(&get, "SERVER_CPUS", Resources::default().cpus)?,
            memory: get("SERVER_MEMORY").unwrap_or_else(|| Resources::default().memory),
            disk: get("SERVER_DISK").unwrap_or_else(|| Resources::default().disk),
        };
        let agent_resources = Resources {
            cpus: parse_number(&get, "AGENT_CPUS", Resources::default().cpus)?,
            memory: get("AGENT_MEMORY").unwrap_or_else(|| Resources::default().memory),
            disk: get("AGENT_DISK").unwrap_or_else(|| Resources::default().disk),
        };

        let kubeconfig_target = get("KUBECONFIG_TARGET")
            .map(|p| expand_home(&p, home))
            .unwrap_or_else(|| home.join(".kube").join("config"));

        let config = Self {
            servers: 1,
            agents: parse_number(&get, "AGENTS", DEFAULT_AGENTS)?,
            channel: get("RKE2_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            version: get("RKE2_VERSION"),
            server_resources,
            agent_resources,
            output_dir: PathBuf::from(get("OUTPUT_DIR").unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string())),
            set_current_context: parse_bool(&get, "SET_CURRENT_CONTEXT", false)?,
            merge_kubeconfig: parse_bool(&get, "MERGE_KUBECONFIG", true)?,
            kubeconfig_target,
            launch_timeout: Duration::from_secs(parse_number(
                &get,
                "LAUNCH_TIMEOUT",
                DEFAULT_LAUNCH_TIMEOUT_SECS,
            )?),
            image: get("VM_IMAGE"),
        };

        Ok((config, warnings))
    }

    /// Path of the standalone kubeconfig fetched from the control plane
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.output_dir.join("kubeconfig.yaml")
    }

    /// Directory that holds the per-context CA, client certificate and key
    pub fn credentials_root(&self) -> PathBuf {
        self.kubeconfig_target
            .parent()
            .map(|p| p.join("rke2"))
            .unwrap_or_else(|| PathBuf::from(".kube/rke2"))
    }
}

fn parse_number<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{} must be true or false, got '{}'", key, v),
        },
    }
}

fn expand_home(path: &str, home: &Path) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn build(vars: &[(&str, &str)]) -> Result<(ClusterConfig, Vec<String>)> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClusterConfig::from_lookup(|k| map.get(k).cloned(), Path::new("/home/op"))
    }

    #[test]
    fn test_defaults() {
        let (config, warnings) = build(&[]).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.servers, 1);
        assert_eq!(config.agents, 2);
        assert_eq!(config.channel, "stable");
        assert_eq!(config.version, None);
        assert_eq!(config.server_resources, Resources::default());
        assert!(!config.set_current_context);
        assert!(config.merge_kubeconfig);
        assert_eq!(config.kubeconfig_target, PathBuf::from("/home/op/.kube/config"));
        assert_eq!(config.credentials_root(), PathBuf::from("/home/op/.kube/rke2"));
        assert_eq!(config.launch_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_multiple_servers_forced_to_one() {
        let (config, warnings) = build(&[("SERVERS", "3")]).unwrap();
        assert_eq!(config.servers, 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("SERVERS=3"));
    }

    #[test]
    fn test_overrides() {
        let (config, _) = build(&[
            ("AGENTS", "0"),
            ("RKE2_CHANNEL", "latest"),
            ("RKE2_VERSION", "v1.30.4+rke2r1"),
            ("AGENT_CPUS", "4"),
            ("AGENT_MEMORY", "8G"),
            ("OUTPUT_DIR", "/tmp/out"),
            ("SET_CURRENT_CONTEXT", "yes"),
            ("KUBECONFIG_TARGET", "~/alt/config"),
        ])
        .unwrap();
        assert_eq!(config.agents, 0);
        assert_eq!(config.channel, "latest");
        assert_eq!(config.version.as_deref(), Some("v1.30.4+rke2r1"));
        assert_eq!(config.agent_resources.cpus, 4);
        assert_eq!(config.agent_resources.memory, "8G");
        assert_eq!(config.kubeconfig_path(), PathBuf::from("/tmp/out/kubeconfig.yaml"));
        assert!(config.set_current_context);
        assert_eq!(config.kubeconfig_target, PathBuf::from("/home/op/alt/config"));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = build(&[("AGENTS", "two")]).unwrap_err();
        assert!(err.to_string().contains("AGENTS"));

        let err = build(&[("SET_CURRENT_CONTEXT", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("SET_CURRENT_CONTEXT"));
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let (config, _) = build(&[("RKE2_VERSION", "  "), ("AGENTS", "")]).unwrap();
        assert_eq!(config.version, None);
        assert_eq!(config.agents, DEFAULT_AGENTS);
    }
}
