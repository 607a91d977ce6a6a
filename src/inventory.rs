use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PASSWORD: &str = "";

/// Group name given to legacy hosts listed before any `[group]` header.
pub const UNGROUPED: &str = "ungrouped";

/// Variables are an open mapping from name to scalar.
pub type Vars = BTreeMap<String, VarValue>;

/// An inventory variable.
///
/// YAML decides the variant: `22` is `Int`, `"22"` is `Str`, `true` is `Bool`,
/// `~` is `Null`. Lists and maps land in `Other`. Any variant loads; only
/// the keys the resolver reads are checked, and only when they are read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
    Other(serde_yaml::Value),
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Bool(b) => write!(f, "{b}"),
            VarValue::Int(i) => write!(f, "{i}"),
            VarValue::Float(x) => write!(f, "{x}"),
            VarValue::Str(s) => write!(f, "\"{s}\""),
            VarValue::Null => f.write_str("null"),
            VarValue::Other(v) => match serde_yaml::to_string(v) {
                Ok(text) => f.write_str(text.trim_end()),
                Err(_) => write!(f, "{v:?}"),
            },
        }
    }
}

/// Top-level inventory document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inventory {
    pub all: InventoryRoot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct InventoryRoot {
    /// Global defaults.
    #[serde(default)]
    pub vars: Vars,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GroupSpec {
    /// Group-level overrides.
    #[serde(default)]
    pub vars: Vars,

    /// Host address -> host entry. A bare `host:` line deserializes to `None`.
    #[serde(default)]
    pub hosts: BTreeMap<String, Option<HostSpec>>,
}

/// Host-level overrides. Keys may sit directly under the host or inside a
/// nested `vars` map; when both name the same key, the nested map wins.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostSpec {
    #[serde(default)]
    pub vars: Vars,

    #[serde(flatten)]
    pub inline: Vars,
}

/// One fully resolved host ready for dispatch.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    pub group: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Target {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// Hand-written so credentials never end up in logs.
impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("group", &self.group)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InventoryError {
    #[error("host '{host}' (group '{group}'): port must be an integer in 1..=65535, got {value}")]
    InvalidPort {
        group: String,
        host: String,
        value: String,
    },

    #[error("host '{host}' (group '{group}'): '{key}' must be a string, got {value}")]
    InvalidString {
        group: String,
        host: String,
        key: String,
        value: String,
    },
}

impl Inventory {
    /// Load an inventory from disk.
    ///
    /// `.yaml`/`.yml` files are always parsed as the layered YAML document.
    /// Anything else whose first meaningful line is a `[group]` header is read
    /// as a legacy hosts file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read inventory file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let inventory = if !is_yaml && looks_like_hosts_file(&text) {
            Self::from_hosts_str(&text)
        } else {
            Self::from_yaml_str(&text)
                .with_context(|| format!("parse inventory yaml: {}", path.display()))?
        };

        debug!(
            groups = inventory.all.groups.len(),
            hosts = inventory.host_count(),
            "loaded inventory"
        );
        Ok(inventory)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| anyhow!("YAML parse error: {e}"))
    }

    /// Parse the flat hosts format:
    ///
    /// ```text
    /// [web]
    /// 10.0.0.1:22:root:secret
    /// ```
    pub fn from_hosts_str(text: &str) -> Self {
        let mut root = InventoryRoot::default();
        let mut current = UNGROUPED.to_string();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                root.groups.entry(current.clone()).or_default();
                continue;
            }

            let parts: Vec<&str> = line.split(':').collect();
            let [address, port, user, password] = parts.as_slice() else {
                warn!(
                    line = lineno + 1,
                    "skipping hosts line: expected address:port:user:password"
                );
                continue;
            };

            let port = port.trim();
            let port = match port.parse::<i64>() {
                Ok(p) => VarValue::Int(p),
                Err(_) => VarValue::Str(port.to_string()),
            };

            let mut vars = Vars::new();
            vars.insert("port".to_string(), port);
            vars.insert("user".to_string(), VarValue::Str(user.to_string()));
            vars.insert("password".to_string(), VarValue::Str(password.to_string()));

            root.groups.entry(current.clone()).or_default().hosts.insert(
                address.trim().to_string(),
                Some(HostSpec {
                    vars,
                    inline: Vars::new(),
                }),
            );
        }

        Inventory { all: root }
    }

    pub fn host_count(&self) -> usize {
        self.all.groups.values().map(|g| g.hosts.len()).sum()
    }
}

fn looks_like_hosts_file(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.starts_with('[') && l.ends_with(']'))
        .unwrap_or(false)
}

/// Per-host lookup chain: host (nested `vars`, then inline) > group > global.
struct Layers<'a> {
    group: &'a str,
    host: &'a str,
    chain: [&'a Vars; 4],
}

impl<'a> Layers<'a> {
    fn get(&self, key: &str) -> Option<&'a VarValue> {
        self.chain.iter().copied().find_map(|vars| vars.get(key))
    }

    fn port(&self) -> Result<u16, InventoryError> {
        match self.get("port") {
            None => Ok(DEFAULT_PORT),
            Some(VarValue::Int(p)) => u16::try_from(*p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| self.invalid_port(&VarValue::Int(*p))),
            Some(other) => Err(self.invalid_port(other)),
        }
    }

    fn string(&self, key: &str, default: &str) -> Result<String, InventoryError> {
        match self.get(key) {
            None => Ok(default.to_string()),
            Some(VarValue::Str(s)) => Ok(s.clone()),
            // Numeric passwords are common and YAML reads them as integers.
            Some(VarValue::Int(i)) => Ok(i.to_string()),
            Some(other) => Err(InventoryError::InvalidString {
                group: self.group.to_string(),
                host: self.host.to_string(),
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    fn invalid_port(&self, value: &VarValue) -> InventoryError {
        InventoryError::InvalidPort {
            group: self.group.to_string(),
            host: self.host.to_string(),
            value: value.to_string(),
        }
    }
}

/// Flatten the inventory into targets, one per (group, host) pair.
///
/// Every host is resolved before the filter runs, so a bad variable on a host
/// that would be filtered out still fails the load. An empty filter keeps
/// everything; otherwise a host survives if the filter is a substring of its
/// address or names its group exactly.
pub fn resolve(
    inventory: &Inventory,
    filter: Option<&str>,
) -> Result<Vec<Target>, InventoryError> {
    let empty = Vars::new();
    let global = &inventory.all.vars;

    let mut targets = Vec::with_capacity(inventory.host_count());
    for (group_name, group) in &inventory.all.groups {
        for (address, host) in &group.hosts {
            let (nested, inline) = host
                .as_ref()
                .map(|h| (&h.vars, &h.inline))
                .unwrap_or((&empty, &empty));

            let layers = Layers {
                group: group_name,
                host: address,
                chain: [nested, inline, &group.vars, global],
            };

            targets.push(Target {
                group: group_name.clone(),
                address: address.clone(),
                port: layers.port()?,
                user: layers.string("user", DEFAULT_USER)?,
                password: layers.string("password", DEFAULT_PASSWORD)?,
            });
        }
    }

    let filter = filter.map(str::trim).filter(|f| !f.is_empty());
    if let Some(f) = filter {
        targets.retain(|t| matches_filter(t, f));
        debug!(filter = f, remaining = targets.len(), "applied host filter");
    }

    Ok(targets)
}

/// Substring on the address, exact match on the group name.
pub fn matches_filter(target: &Target, filter: &str) -> bool {
    target.address.contains(filter) || target.group == filter
}
