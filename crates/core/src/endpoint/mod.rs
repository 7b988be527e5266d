//! Connection target parsing.
//!
//! A target is an ordered list of endpoints joined with `;`. Each endpoint is
//! a host name, an IPv4 address or a (possibly bracketed) IPv6 address,
//! optionally followed by `:port`. Endpoints without a port receive the
//! configured default; endpoints with one keep it.

use std::fmt;

use crate::{MocapError, Result};

/// Port the stream server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 801;

/// Separator between endpoints in the combined target string.
pub const ENDPOINT_SEPARATOR: char = ';';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a single endpoint. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MocapError::InvalidEndpoint(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| MocapError::InvalidEndpoint(raw.to_string()))?;
            if host.is_empty() {
                return Err(MocapError::InvalidEndpoint(raw.to_string()));
            }
            let port = match tail {
                "" => None,
                tail => match tail.strip_prefix(':') {
                    Some(port) => Some(parse_port(raw, port)?),
                    None => return Err(MocapError::InvalidEndpoint(raw.to_string())),
                },
            };
            return Ok(Self::new(host, port));
        }

        match raw.matches(':').count() {
            0 => Ok(Self::new(raw, None)),
            1 => {
                let (host, port) = raw
                    .split_once(':')
                    .ok_or_else(|| MocapError::InvalidEndpoint(raw.to_string()))?;
                if host.is_empty() {
                    return Err(MocapError::InvalidEndpoint(raw.to_string()));
                }
                Ok(Self::new(host, Some(parse_port(raw, port)?)))
            }
            // Bare IPv6 literal; a port would need brackets.
            _ => Ok(Self::new(raw, None)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Fills in `port` when the endpoint does not carry one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.port.get_or_insert(port);
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ipv6 = self.host.contains(':');
        match (self.port, ipv6) {
            (Some(port), true) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), false) => write!(f, "{}:{}", self.host, port),
            (None, true) => write!(f, "[{}]", self.host),
            (None, false) => f.write_str(&self.host),
        }
    }
}

fn parse_port(raw: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| MocapError::InvalidEndpoint(raw.to_string()))
}

/// Parses every endpoint in `targets`. Each entry may itself be a
/// `;`-joined list; empty segments are skipped.
pub fn parse_targets<S: AsRef<str>>(targets: &[S]) -> Result<Vec<Endpoint>> {
    let endpoints = targets
        .iter()
        .flat_map(|target| target.as_ref().split(ENDPOINT_SEPARATOR))
        .filter(|part| !part.trim().is_empty())
        .map(Endpoint::parse)
        .collect::<Result<Vec<_>>>()?;

    if endpoints.is_empty() {
        return Err(MocapError::InvalidInput(
            "at least one connection target is required",
        ));
    }
    Ok(endpoints)
}

/// Builds the combined target string handed to a single connect call.
pub fn combine_targets<S: AsRef<str>>(targets: &[S], default_port: u16) -> Result<String> {
    let combined = parse_targets(targets)?
        .into_iter()
        .map(|endpoint| endpoint.with_default_port(default_port).to_string())
        .collect::<Vec<_>>()
        .join(&ENDPOINT_SEPARATOR.to_string());
    Ok(combined)
}
