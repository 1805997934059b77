//! Server configuration assembled at startup and on reload.
//!
//! The running server never mutates a [`Config`]. The binary builds one
//! through [`ConfigBuilder`] (CLI flags, `PHOEBE_DATA_DIR`, and the optional
//! `config/phoebe.toml` inside the wiki directory), wraps it in an `Arc`,
//! and swaps the whole value on reload. Extensions receive the builder
//! during initialization, never the finished value.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use smol_str::SmolStr;

use crate::error::ServerError;

/// Default Gemini/Titan port.
pub const DEFAULT_PORT: u16 = 1965;

/// Default shared-secret write token.
pub const DEFAULT_TOKEN: &str = "hello";

/// Default Titan upload size cap in bytes.
pub const DEFAULT_PAGE_SIZE_LIMIT: u64 = 10_000;

/// Top-level store entries a space name may not shadow.
pub const RESERVED_NAMES: &[&str] = &[
    "page",
    "keep",
    "file",
    "meta",
    "index",
    "changes.log",
    "config",
];

/// A named wiki namespace under one host. The empty name is the root space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceConfig {
    pub host: SmolStr,
    pub name: SmolStr,
    pub tokens: Vec<SmolStr>,
}

/// A served hostname and its certificate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub name: SmolStr,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Immutable server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub hosts: Vec<HostConfig>,
    pub ports: Vec<u16>,
    pub wiki_dir: PathBuf,
    pub spaces: Vec<SpaceConfig>,
    pub tokens: Vec<SmolStr>,
    pub main_page: Option<SmolStr>,
    pub extra_pages: Vec<SmolStr>,
    pub mime_types: Vec<SmolStr>,
    pub page_size_limit: u64,
    pub enabled_extensions: Vec<SmolStr>,
    /// Raw `config/phoebe.toml` document for extension initializers.
    pub file: Option<toml::Value>,
}

impl Config {
    /// The host used for URLs when a request carries no better choice.
    #[must_use]
    pub fn default_host(&self) -> &SmolStr {
        &self.hosts[0].name
    }

    /// The port advertised in canonical URLs.
    #[must_use]
    pub fn primary_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or(DEFAULT_PORT)
    }

    #[must_use]
    pub fn is_known_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h.name == host)
    }

    /// Declared spaces of `host`, root space first.
    pub fn spaces_for_host<'a>(
        &'a self,
        host: &'a str,
    ) -> impl Iterator<Item = &'a SpaceConfig> + 'a {
        self.spaces.iter().filter(move |s| s.host == host)
    }

    #[must_use]
    pub fn space(&self, host: &str, name: &str) -> Option<&SpaceConfig> {
        self.spaces
            .iter()
            .find(|s| s.host == host && s.name == name)
    }

    /// Effective token set for a space: global tokens plus space tokens.
    pub fn tokens_for_space<'a>(
        &'a self,
        space: &'a SpaceConfig,
    ) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.tokens.iter().chain(space.tokens.iter())
    }

    /// Whether `mime` is in the upload allow-list.
    ///
    /// A configured bare major type (`image`) matches every subtype of that
    /// type; a configured literal (`image/jpeg`) matches exactly.
    #[must_use]
    pub fn mime_allowed(&self, mime: &str) -> bool {
        let major = mime.split('/').next().unwrap_or(mime);
        self.mime_types
            .iter()
            .any(|allowed| allowed == mime || allowed == major)
    }
}

/// Mutable configuration under construction; handed to extension
/// initializers before the immutable [`Config`] is frozen.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    hosts: Vec<SmolStr>,
    ports: Vec<u16>,
    cert_files: Vec<PathBuf>,
    key_files: Vec<PathBuf>,
    wiki_dir: Option<PathBuf>,
    space_specs: Vec<SmolStr>,
    tokens: Vec<SmolStr>,
    main_page: Option<SmolStr>,
    extra_pages: Vec<SmolStr>,
    mime_types: Vec<SmolStr>,
    page_size_limit: Option<u64>,
    enabled_extensions: Vec<SmolStr>,
    file: Option<toml::Value>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self, host: impl Into<SmolStr>) -> &mut Self {
        self.hosts.push(host.into());
        self
    }

    pub fn add_port(&mut self, port: u16) -> &mut Self {
        self.ports.push(port);
        self
    }

    pub fn add_cert_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.cert_files.push(path.into());
        self
    }

    pub fn add_key_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.key_files.push(path.into());
        self
    }

    pub fn wiki_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.wiki_dir = Some(dir.into());
        self
    }

    /// The wiki directory set so far, if any.
    #[must_use]
    pub fn wiki_dir_path(&self) -> Option<&Path> {
        self.wiki_dir.as_deref()
    }

    /// Add a space declaration, either `space` or `host/space`.
    pub fn add_space_spec(&mut self, spec: impl Into<SmolStr>) -> &mut Self {
        self.space_specs.push(spec.into());
        self
    }

    pub fn add_token(&mut self, token: impl Into<SmolStr>) -> &mut Self {
        self.tokens.push(token.into());
        self
    }

    pub fn main_page(&mut self, name: impl Into<SmolStr>) -> &mut Self {
        self.main_page = Some(name.into());
        self
    }

    pub fn add_extra_page(&mut self, name: impl Into<SmolStr>) -> &mut Self {
        self.extra_pages.push(name.into());
        self
    }

    pub fn add_mime_type(&mut self, mime: impl Into<SmolStr>) -> &mut Self {
        self.mime_types.push(mime.into());
        self
    }

    pub fn page_size_limit(&mut self, limit: u64) -> &mut Self {
        self.page_size_limit = Some(limit);
        self
    }

    pub fn enable_extension(&mut self, name: impl Into<SmolStr>) -> &mut Self {
        self.enabled_extensions.push(name.into());
        self
    }

    /// Names of the extensions enabled so far.
    #[must_use]
    pub fn enabled_extensions(&self) -> &[SmolStr] {
        &self.enabled_extensions
    }

    /// The parsed `config/phoebe.toml`, when one was loaded.
    #[must_use]
    pub fn file(&self) -> Option<&toml::Value> {
        self.file.as_ref()
    }

    /// Replace the configuration document (used by tests and initializers).
    pub fn set_file(&mut self, value: toml::Value) -> &mut Self {
        self.file = Some(value);
        self
    }

    /// Read `config/phoebe.toml` below the wiki directory, if present, and
    /// fold its space tokens and extension list into the builder.
    pub fn load_config_file(&mut self) -> Result<(), ServerError> {
        let Some(dir) = self.wiki_dir.clone() else {
            return Ok(());
        };
        let path = dir.join("config").join("phoebe.toml");
        if !path.is_file() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&path).map_err(|err| {
            ServerError::InvalidConfig(SmolStr::new(format!("{}: {err}", path.display())))
        })?;
        let value: toml::Value = toml::from_str(&text).map_err(|err| {
            ServerError::InvalidConfig(SmolStr::new(format!("{}: {err}", path.display())))
        })?;
        let parsed: FileToml = FileToml::deserialize(value.clone()).map_err(|err| {
            ServerError::InvalidConfig(SmolStr::new(format!("{}: {err}", path.display())))
        })?;
        if let Some(extensions) = parsed.extensions {
            for name in extensions.enabled.unwrap_or_default() {
                self.enabled_extensions.push(SmolStr::new(name));
            }
        }
        self.file = Some(value);
        Ok(())
    }

    /// Freeze the builder into a validated [`Config`].
    pub fn build(&self) -> Result<Config, ServerError> {
        let wiki_dir = self
            .wiki_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./wiki"));
        let hosts = if self.hosts.is_empty() {
            vec![SmolStr::new("localhost")]
        } else {
            self.hosts.clone()
        };
        let ports = if self.ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            self.ports.clone()
        };

        if self.cert_files.len() != self.key_files.len() {
            return Err(ServerError::InvalidConfig(
                "every --cert_file needs a matching --key_file".into(),
            ));
        }
        let default_cert = self
            .cert_files
            .first()
            .cloned()
            .unwrap_or_else(|| wiki_dir.join("cert.pem"));
        let default_key = self
            .key_files
            .first()
            .cloned()
            .unwrap_or_else(|| wiki_dir.join("key.pem"));
        let hosts: Vec<HostConfig> = hosts
            .iter()
            .enumerate()
            .map(|(i, name)| HostConfig {
                name: name.clone(),
                cert_file: self
                    .cert_files
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| default_cert.clone()),
                key_file: self
                    .key_files
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| default_key.clone()),
            })
            .collect();

        let space_tokens = self.file_space_tokens()?;

        // Root space exists for every host, always first in declaration order.
        let mut spaces: Vec<SpaceConfig> = hosts
            .iter()
            .map(|h| SpaceConfig {
                host: h.name.clone(),
                name: SmolStr::default(),
                tokens: Vec::new(),
            })
            .collect();
        for spec in &self.space_specs {
            let (host, name) = match spec.split_once('/') {
                Some((host, name)) => (SmolStr::new(host), SmolStr::new(name)),
                None => (hosts[0].name.clone(), spec.clone()),
            };
            if name.is_empty() {
                return Err(ServerError::InvalidConfig(
                    SmolStr::new(format!("empty space name in '{spec}'")),
                ));
            }
            if name.contains('/') || RESERVED_NAMES.contains(&name.as_str()) {
                return Err(ServerError::InvalidConfig(
                    SmolStr::new(format!("reserved or invalid space name '{name}'")),
                ));
            }
            if !hosts.iter().any(|h| h.name == host) {
                return Err(ServerError::InvalidConfig(
                    SmolStr::new(format!("space '{spec}' names unknown host '{host}'")),
                ));
            }
            if spaces.iter().any(|s| s.host == host && s.name == name) {
                continue;
            }
            let tokens = space_tokens.get(name.as_str()).cloned().unwrap_or_default();
            spaces.push(SpaceConfig { host, name, tokens });
        }

        let tokens = if self.tokens.is_empty() {
            vec![SmolStr::new(DEFAULT_TOKEN)]
        } else {
            self.tokens.clone()
        };

        Ok(Config {
            hosts,
            ports,
            wiki_dir,
            spaces,
            tokens,
            main_page: self.main_page.clone(),
            extra_pages: self.extra_pages.clone(),
            mime_types: self.mime_types.clone(),
            page_size_limit: self.page_size_limit.unwrap_or(DEFAULT_PAGE_SIZE_LIMIT),
            enabled_extensions: self.enabled_extensions.clone(),
            file: self.file.clone(),
        })
    }

    fn file_space_tokens(&self) -> Result<IndexMap<String, Vec<SmolStr>>, ServerError> {
        let mut map = IndexMap::new();
        let Some(value) = &self.file else {
            return Ok(map);
        };
        let parsed: FileToml = FileToml::deserialize(value.clone())
            .map_err(|err| ServerError::InvalidConfig(SmolStr::new(err.to_string())))?;
        for (name, section) in parsed.space.unwrap_or_default() {
            let tokens = section
                .tokens
                .unwrap_or_default()
                .into_iter()
                .map(SmolStr::new)
                .collect();
            map.insert(name, tokens);
        }
        Ok(map)
    }
}

#[derive(Debug, Deserialize)]
struct FileToml {
    extensions: Option<ExtensionsSection>,
    space: Option<IndexMap<String, SpaceSection>>,
}

#[derive(Debug, Deserialize)]
struct ExtensionsSection {
    enabled: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SpaceSection {
    tokens: Option<Vec<String>>,
}
