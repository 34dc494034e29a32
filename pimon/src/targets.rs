//! Known hosts and the selected index: load/save a small JSON file.
//! Stored under XDG config dir: $XDG_CONFIG_HOME/pimon/targets.json (fallback ~/.config/pimon/targets.json)

use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::PathBuf};
use url::Url;

use crate::error::{Error, Result};

/// One monitored host. Base URLs are derived from it once per engine start / connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Accepts `host`, `host:port`, `[v6]:port` or a full `http://` / `ws://` URL (path ignored).
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::malformed("empty host"));
        }
        let url = if s.contains("://") {
            Url::parse(s)?
        } else {
            Url::parse(&format!("http://{s}"))?
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::malformed(format!("no host in '{s}'")))?;
        let port = url.port().unwrap_or(default_port);
        Ok(Self::new(host, port))
    }

    pub fn http_base(&self) -> Result<Url> {
        Ok(Url::parse(&format!("http://{self}/"))?)
    }

    pub fn terminal_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("ws://{self}/terminal/ws"))?)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TargetsFile {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub selected: usize,
    #[serde(default)]
    pub version: u32,
}

impl TargetsFile {
    /// Selected entry, or the first one when the stored index is out of range.
    pub fn selected_entry(&self) -> Option<&str> {
        self.targets
            .get(self.selected)
            .or_else(|| self.targets.first())
            .map(String::as_str)
    }

    /// Append `address` unless already known; returns its index.
    pub fn add(&mut self, address: &str) -> usize {
        let address = address.trim();
        if let Some(i) = self.targets.iter().position(|t| t == address) {
            return i;
        }
        self.targets.push(address.to_string());
        self.targets.len() - 1
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index < self.targets.len() {
            self.selected = index;
            true
        } else {
            false
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("pimon")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pimon")
    }
}

pub fn targets_path() -> PathBuf {
    config_dir().join("targets.json")
}

pub fn load_targets() -> TargetsFile {
    let path = targets_path();
    match fs::read_to_string(&path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_default(),
        Err(_) => TargetsFile::default(),
    }
}

pub fn save_targets(t: &TargetsFile) -> Result<()> {
    let path = targets_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(t)?;
    fs::write(path, data)?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveTarget {
    /// Address given on the command line; the caller adds and selects it. (address)
    Direct(String),
    /// Loaded from the store (index, address)
    Selected(usize, String),
    /// Requested index is not in the store
    OutOfRange(usize),
    /// Nothing given and the store is empty
    None,
}

pub struct TargetRequest {
    pub address: Option<String>,
    pub index: Option<usize>,
}

impl TargetRequest {
    pub fn resolve(self, tf: &TargetsFile) -> ResolveTarget {
        if let Some(address) = self.address {
            return ResolveTarget::Direct(address);
        }
        if let Some(i) = self.index {
            return match tf.targets.get(i) {
                Some(a) => ResolveTarget::Selected(i, a.clone()),
                None => ResolveTarget::OutOfRange(i),
            };
        }
        match tf.selected_entry() {
            Some(a) => {
                let i = tf.targets.iter().position(|t| t == a).unwrap_or(0);
                ResolveTarget::Selected(i, a.to_string())
            }
            None => ResolveTarget::None,
        }
    }
}
