//! Configuration: optional TOML user config for logging/runtime defaults, and
//! the JSON servers file describing the backends the hub manages.
//!
//! Server entries may reference secrets as `${KEY}` placeholders in env
//! values and URLs. Resolution happens against the process environment at
//! load time; an entry whose keys are missing is reported unavailable rather
//! than failing the whole file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use std::time::Duration;

use crate::error::HubError;
use crate::lifecycle::{LaunchSpec, ServerDefinition, SpawnSpec};
use crate::transport::TransportKind;

#[derive(Debug, Default, Deserialize)]
pub struct UserConfig {
    pub logging: Option<LoggingCfg>,
    pub hub: Option<HubCfg>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingCfg {
    pub to_file: Option<bool>,
    pub dir: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HubCfg {
    pub servers_file: Option<String>,
    pub call_timeout_secs: Option<u64>,
    pub start_all: Option<bool>,
}

pub fn load_user_config(hub_home: &Path) -> anyhow::Result<Option<UserConfig>> {
    let path = hub_home.join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)?;
    let cfg: UserConfig = toml::from_str(&s)?;
    Ok(Some(cfg))
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

/// The servers file: `{"servers": {"<name>": {...}, ...}}`.
#[derive(Debug, Default, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

/// One raw (unresolved) server entry. Which fields are required depends on
/// the transport; validation happens in [`resolve_entry`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub docker_image: Option<String>,
    /// Base URL for network transports.
    pub url: Option<String>,
    pub health_path: Option<String>,
    /// Readiness-poll window in seconds, overriding the hub default.
    pub health_check_timeout: Option<u64>,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}

pub fn load_servers_file(path: &Path) -> anyhow::Result<ServersFile> {
    let s = std::fs::read_to_string(path)?;
    let parsed: Value = serde_json::from_str(&s)?;
    let file: ServersFile = serde_json::from_value(parsed)?;
    Ok(file)
}

/// Every `${KEY}` referenced by an entry, across env values, args, and URL.
pub fn required_env_keys(entry: &ServerEntry) -> Vec<String> {
    let mut keys = Vec::new();
    for value in entry.env_vars.values() {
        keys.extend(placeholder_keys(value));
    }
    for arg in &entry.args {
        keys.extend(placeholder_keys(arg));
    }
    if let Some(url) = &entry.url {
        keys.extend(placeholder_keys(url));
    }
    keys.sort();
    keys.dedup();
    keys
}

/// Keys an entry needs that `lookup` cannot provide. Empty means available.
pub fn missing_env_keys(
    entry: &ServerEntry,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Vec<String> {
    required_env_keys(entry)
        .into_iter()
        .filter(|k| lookup(k).is_none())
        .collect()
}

/// Resolve a raw entry into a runnable definition, substituting every
/// placeholder. Missing keys and transport/field mismatches are
/// configuration errors.
pub fn resolve_entry(
    name: &str,
    entry: &ServerEntry,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ServerDefinition, HubError> {
    let spawn_spec = |command: &str| -> Result<SpawnSpec, HubError> {
        let mut env = HashMap::with_capacity(entry.env_vars.len());
        for (k, v) in &entry.env_vars {
            env.insert(k.clone(), substitute(name, v, lookup)?);
        }
        let mut args = Vec::with_capacity(entry.args.len());
        for arg in &entry.args {
            args.push(substitute(name, arg, lookup)?);
        }
        Ok(SpawnSpec {
            command: command.to_string(),
            args,
            env,
            container_image: entry.docker_image.clone(),
        })
    };

    let launch = match entry.transport {
        TransportKind::Stdio => {
            let command = entry.command.as_deref().ok_or_else(|| {
                HubError::Configuration(format!("{name}: stdio entry needs a command"))
            })?;
            LaunchSpec::Process(spawn_spec(command)?)
        }
        TransportKind::Http | TransportKind::Sse => {
            let url = entry.url.as_deref().ok_or_else(|| {
                HubError::Configuration(format!("{name}: {} entry needs a url", entry.transport))
            })?;
            LaunchSpec::Endpoint {
                base_url: substitute(name, url, lookup)?,
                health_path: entry.health_path.clone(),
                health_timeout: entry.health_check_timeout.map(Duration::from_secs),
                spawn: entry
                    .command
                    .as_deref()
                    .map(&spawn_spec)
                    .transpose()?,
            }
        }
    };
    Ok(ServerDefinition {
        name: name.to_string(),
        transport: entry.transport,
        launch,
    })
}

fn placeholder_keys(s: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        if !after[..end].is_empty() {
            keys.push(after[..end].to_string());
        }
        rest = &after[end + 1..];
    }
    keys
}

fn substitute(
    name: &str,
    s: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, HubError> {
    let mut out = s.to_string();
    for key in placeholder_keys(s) {
        let value = lookup(&key).ok_or_else(|| {
            HubError::Configuration(format!("{name}: environment key {key} is not set"))
        })?;
        out = out.replace(&format!("${{{key}}}"), &value);
    }
    Ok(out)
}
