//! Typed extension hooks and the built-in extension registry.
//!
//! Extensions are compile-time built-ins, enabled by name in
//! `config/phoebe.toml`. Each one registers into the narrow seams the
//! dispatcher consults: request handlers (first claim wins, in registration
//! order), main-menu contributors, footer contributors, and
//! client-certificate fingerprint authorizers.

#![allow(missing_docs)]

use smol_str::SmolStr;

use crate::config::ConfigBuilder;
use crate::error::ServerError;
use crate::request::Request;
use crate::server::Response;

/// An extra main-menu entry.
#[derive(Debug, Clone)]
pub struct MenuItem {
    /// Path relative to the space root, e.g. `/do/something`.
    pub url: String,
    pub label: String,
}

/// Claims whole requests ahead of built-in routing.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &Request) -> Option<Response>;
}

/// Contributes entries to the main menu.
pub trait MenuContributor: Send + Sync {
    fn items(&self, space: &str) -> Vec<MenuItem>;
}

/// Contributes gemtext to page footers.
pub trait FooterContributor: Send + Sync {
    fn footer(&self, request: &Request) -> Option<String>;
}

/// Accepts client-certificate fingerprints for write authorization.
pub trait FingerprintAuthorizer: Send + Sync {
    fn authorize(&self, space: &str, fingerprint: &str) -> bool;
}

/// Runs during startup and reload, before the configuration is frozen.
pub trait Initializer: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(
        &self,
        builder: &mut ConfigBuilder,
        registry: &mut Registry,
    ) -> Result<(), ServerError>;
}

/// Everything the enabled extensions registered.
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Box<dyn RequestHandler>>,
    menu: Vec<Box<dyn MenuContributor>>,
    footers: Vec<Box<dyn FooterContributor>>,
    authorizers: Vec<Box<dyn FingerprintAuthorizer>>,
    stylesheet: Option<String>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.len())
            .field("menu", &self.menu.len())
            .field("footers", &self.footers.len())
            .field("authorizers", &self.authorizers.len())
            .field("stylesheet", &self.stylesheet.is_some())
            .finish()
    }
}

impl Registry {
    pub fn add_handler(&mut self, handler: Box<dyn RequestHandler>) {
        self.handlers.push(handler);
    }

    pub fn add_menu_contributor(&mut self, contributor: Box<dyn MenuContributor>) {
        self.menu.push(contributor);
    }

    pub fn add_footer_contributor(&mut self, contributor: Box<dyn FooterContributor>) {
        self.footers.push(contributor);
    }

    pub fn add_authorizer(&mut self, authorizer: Box<dyn FingerprintAuthorizer>) {
        self.authorizers.push(authorizer);
    }

    pub fn set_stylesheet(&mut self, css: String) {
        self.stylesheet = Some(css);
    }

    /// Offer the request to every handler in registration order.
    #[must_use]
    pub fn handle(&self, request: &Request) -> Option<Response> {
        self.handlers.iter().find_map(|h| h.handle(request))
    }

    #[must_use]
    pub fn menu_items(&self, space: &str) -> Vec<MenuItem> {
        self.menu.iter().flat_map(|c| c.items(space)).collect()
    }

    #[must_use]
    pub fn footers(&self, request: &Request) -> Vec<String> {
        self.footers.iter().filter_map(|c| c.footer(request)).collect()
    }

    #[must_use]
    pub fn authorize_fingerprint(&self, space: &str, fingerprint: &str) -> bool {
        self.authorizers
            .iter()
            .any(|a| a.authorize(space, fingerprint))
    }

    /// Whether the TLS handshake should request a client certificate.
    #[must_use]
    pub fn wants_client_certs(&self) -> bool {
        !self.authorizers.is_empty()
    }

    /// Replacement for the default stylesheet, when an extension set one.
    #[must_use]
    pub fn stylesheet(&self) -> Option<&str> {
        self.stylesheet.as_deref()
    }
}

/// Run the initializers of every enabled built-in extension.
pub fn initialize(builder: &mut ConfigBuilder) -> Result<Registry, ServerError> {
    let mut registry = Registry::default();
    let enabled: Vec<SmolStr> = builder.enabled_extensions().to_vec();
    for initializer in builtins() {
        if enabled.iter().any(|name| name == initializer.name()) {
            initializer.init(builder, &mut registry)?;
        }
    }
    Ok(registry)
}

fn builtins() -> Vec<Box<dyn Initializer>> {
    vec![Box::new(CertWhitelist), Box::new(CustomStylesheet)]
}

// ---------------------------------------------------------------------------
// cert-whitelist: authorize writes by client-certificate fingerprint
// ---------------------------------------------------------------------------

struct CertWhitelist;

struct WhitelistAuthorizer {
    fingerprints: Vec<SmolStr>,
}

impl FingerprintAuthorizer for WhitelistAuthorizer {
    fn authorize(&self, _space: &str, fingerprint: &str) -> bool {
        self.fingerprints.iter().any(|f| f == fingerprint)
    }
}

impl Initializer for CertWhitelist {
    fn name(&self) -> &'static str {
        "cert-whitelist"
    }

    fn init(
        &self,
        builder: &mut ConfigBuilder,
        registry: &mut Registry,
    ) -> Result<(), ServerError> {
        let fingerprints = builder
            .file()
            .and_then(|file| file.get("cert-whitelist"))
            .and_then(|section| section.get("fingerprints"))
            .and_then(|value| value.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(SmolStr::new)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if fingerprints.is_empty() {
            return Err(ServerError::InvalidConfig(
                "cert-whitelist enabled without fingerprints".into(),
            ));
        }
        registry.add_authorizer(Box::new(WhitelistAuthorizer { fingerprints }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// custom-css: replace the built-in stylesheet from config/default.css
// ---------------------------------------------------------------------------

struct CustomStylesheet;

impl Initializer for CustomStylesheet {
    fn name(&self) -> &'static str {
        "custom-css"
    }

    fn init(
        &self,
        builder: &mut ConfigBuilder,
        registry: &mut Registry,
    ) -> Result<(), ServerError> {
        let Some(dir) = builder.wiki_dir_path() else {
            return Ok(());
        };
        let path = dir.join("config").join("default.css");
        let css = std::fs::read_to_string(&path).map_err(|err| {
            ServerError::InvalidConfig(SmolStr::new(format!("{}: {err}", path.display())))
        })?;
        registry.set_stylesheet(css);
        Ok(())
    }
}
