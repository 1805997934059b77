//! Request-line classification and target resolution.
//!
//! One CRLF-terminated line decides the protocol: a `gemini://` URL, a
//! `titan://` URL with upload parameters, or an HTTP request line. Host and
//! space resolution is shared by all three surfaces; percent decoding is
//! applied exactly once per path segment.

#![allow(missing_docs)]

use smol_str::SmolStr;
use tracing::trace;
use url::Url;

use crate::config::Config;
use crate::error::ServerError;

/// Protocol spoken on this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Gemini,
    Titan(TitanParams),
    Http { method: SmolStr },
}

/// Upload parameters carried in a Titan request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitanParams {
    pub mime: SmolStr,
    pub size: u64,
    pub token: SmolStr,
}

/// A parsed and resolved request, ready for dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    pub host: SmolStr,
    pub port: u16,
    pub space: SmolStr,
    /// Percent-decoded path segments below the space.
    pub segments: Vec<String>,
    /// Percent-decoded query string, when present.
    pub query: Option<String>,
    /// SHA-256 fingerprint of the client certificate, when one was sent.
    pub fingerprint: Option<String>,
    /// Contributor code derived from the client address.
    pub code: SmolStr,
}

impl Request {
    /// Decoded path below the space, with a leading slash.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// `/space` or the empty string for the root space.
    #[must_use]
    pub fn space_prefix(&self) -> String {
        if self.space.is_empty() {
            String::new()
        } else {
            format!("/{}", self.space)
        }
    }

    /// Canonical `gemini://` base of this request's space.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!(
            "gemini://{}:{}{}",
            self.host,
            self.port,
            self.space_prefix()
        )
    }
}

/// First-stage classification of a raw request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestLine {
    Gemini,
    Titan,
    Http { method: SmolStr, target: String },
    Invalid,
}

/// Decide which protocol a request line speaks.
#[must_use]
pub fn classify(line: &str) -> RequestLine {
    if line.starts_with("gemini://") {
        return RequestLine::Gemini;
    }
    if line.starts_with("titan://") {
        return RequestLine::Titan;
    }
    let mut parts = line.split(' ');
    if let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    {
        if (version == "HTTP/1.0" || version == "HTTP/1.1")
            && !method.is_empty()
            && !target.is_empty()
            && method.chars().all(|c| c.is_ascii_uppercase())
        {
            return RequestLine::Http {
                method: SmolStr::new(method),
                target: target.to_string(),
            };
        }
    }
    RequestLine::Invalid
}

/// Parse a `gemini://` request line into a resolved [`Request`].
pub fn parse_gemini(line: &str, config: &Config) -> Result<Request, ServerError> {
    let url = parse_url(line)?;
    let (host, port) = resolve_authority(&url, config)?;
    let (space, segments) = resolve_space(config, &host, url.path())?;
    let query = decode_query(url.query())?;
    trace!(%host, %space, ?segments, "gemini request resolved");
    Ok(Request {
        kind: RequestKind::Gemini,
        host,
        port,
        space,
        segments,
        query,
        fingerprint: None,
        code: SmolStr::default(),
    })
}

/// Parse a `titan://` request line, separating the `;key=value` parameters
/// from the final path segment.
pub fn parse_titan(line: &str, config: &Config) -> Result<Request, ServerError> {
    let url = parse_url(line)?;
    let (host, port) = resolve_authority(&url, config)?;
    let (path, params) = split_titan_params(url.path())?;
    let (space, segments) = resolve_space(config, &host, &path)?;
    trace!(%host, %space, ?segments, size = params.size, mime = %params.mime, "titan request resolved");
    Ok(Request {
        kind: RequestKind::Titan(params),
        host,
        port,
        space,
        segments,
        query: decode_query(url.query())?,
        fingerprint: None,
        code: SmolStr::default(),
    })
}

/// Resolve an HTTP request target against the `Host` header.
pub fn resolve_http(
    method: &SmolStr,
    target: &str,
    host_header: Option<&str>,
    config: &Config,
) -> Result<Request, ServerError> {
    let host = match host_header {
        Some(value) => {
            let name = value.split(':').next().unwrap_or(value).trim();
            if !config.is_known_host(name) {
                return Err(ServerError::UnknownHost(SmolStr::new(name)));
            }
            SmolStr::new(name)
        }
        None => config.default_host().clone(),
    };
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let (space, segments) = resolve_space(config, &host, path)?;
    Ok(Request {
        kind: RequestKind::Http {
            method: method.clone(),
        },
        host,
        port: config.primary_port(),
        space,
        segments,
        query: decode_query(query)?,
        fingerprint: None,
        code: SmolStr::default(),
    })
}

fn parse_url(line: &str) -> Result<Url, ServerError> {
    Url::parse(line.trim_end())
        .map_err(|err| ServerError::MalformedRequest(SmolStr::new(format!("bad URL: {err}"))))
}

fn resolve_authority(url: &Url, config: &Config) -> Result<(SmolStr, u16), ServerError> {
    let host = url
        .host_str()
        .ok_or_else(|| ServerError::MalformedRequest("URL without host".into()))?;
    if !config.is_known_host(host) {
        return Err(ServerError::UnknownHost(SmolStr::new(host)));
    }
    Ok((
        SmolStr::new(host),
        url.port().unwrap_or(crate::config::DEFAULT_PORT),
    ))
}

/// Match the path against `/(<space>)?(/.*)?` for the declared spaces of
/// `host` and return the space plus decoded remaining segments.
fn resolve_space(
    config: &Config,
    host: &str,
    path: &str,
) -> Result<(SmolStr, Vec<String>), ServerError> {
    let mut segments = decode_segments(path)?;
    let space = match segments.first() {
        Some(first) => config
            .spaces_for_host(host)
            .find(|s| !s.name.is_empty() && s.name == first.as_str())
            .map(|s| s.name.clone()),
        None => None,
    };
    let space = match space {
        Some(space) => {
            segments.remove(0);
            space
        }
        None => SmolStr::default(),
    };
    Ok((space, segments))
}

fn decode_segments(path: &str) -> Result<Vec<String>, ServerError> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .map_err(|_| ServerError::MalformedRequest("path is not valid UTF-8".into()))
        })
        .collect()
}

fn decode_query(query: Option<&str>) -> Result<Option<String>, ServerError> {
    query
        .map(|q| {
            urlencoding::decode(q)
                .map(|s| s.into_owned())
                .map_err(|_| ServerError::MalformedRequest("query is not valid UTF-8".into()))
        })
        .transpose()
}

/// Strip `;mime=`, `;size=`, `;token=` from the end of a Titan path.
///
/// The parameters ride on the final segment in any order; `size` is
/// mandatory, `mime` defaults to `text/plain`, `token` to the empty string.
fn split_titan_params(path: &str) -> Result<(String, TitanParams), ServerError> {
    let (prefix, last) = match path.rfind('/') {
        Some(at) => (&path[..=at], &path[at + 1..]),
        None => ("", path),
    };
    let mut parts = last.split(';');
    let name = parts.next().unwrap_or_default();
    let mut mime = SmolStr::new("text/plain");
    let mut size: Option<u64> = None;
    let mut token = SmolStr::default();
    for part in parts {
        let Some((key, value)) = part.split_once('=') else {
            return Err(ServerError::MalformedRequest(SmolStr::new(format!(
                "bad parameter '{part}'"
            ))));
        };
        let value = urlencoding::decode(value)
            .map_err(|_| ServerError::MalformedRequest("parameter is not valid UTF-8".into()))?;
        match key {
            "mime" => mime = SmolStr::new(value.as_ref()),
            "size" => {
                size = Some(value.parse().map_err(|_| {
                    ServerError::MalformedRequest(SmolStr::new(format!("bad size '{value}'")))
                })?);
            }
            "token" => token = SmolStr::new(value.as_ref()),
            _ => {
                return Err(ServerError::MalformedRequest(SmolStr::new(format!(
                    "unknown parameter '{key}'"
                ))));
            }
        }
    }
    let size = size.ok_or_else(|| ServerError::MalformedRequest("missing size parameter".into()))?;
    Ok((
        format!("{prefix}{name}"),
        TitanParams { mime, size, token },
    ))
}
