//! Compiled mappings and first-match route lookup.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, trace};

use super::upstream::UpstreamTemplate;
use crate::config::{MappingConfig, VcsKind};

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// A validated mapping from a request-path prefix to an upstream VCS host.
#[derive(Debug)]
pub struct Mapping {
    prefix: String,
    host: String,
    request_host: Option<String>,
    repo: Regex,
    kind: VcsKind,
    template: UpstreamTemplate,
}

impl Mapping {
    /// Compile a [`MappingConfig`], rejecting invalid route patterns and
    /// templates.
    pub fn new(config: &MappingConfig) -> Result<Self> {
        anyhow::ensure!(
            config.prefix.starts_with('/'),
            "mapping prefix must start with '/': {:?}",
            config.prefix
        );
        let prefix = if config.prefix.ends_with('/') {
            config.prefix.clone()
        } else {
            format!("{}/", config.prefix)
        };

        let repo = Regex::new(&config.repo)
            .with_context(|| format!("bad repo route regexp: {:?}", config.repo))?;
        let groups = repo.captures_len() - 1;
        anyhow::ensure!(
            groups > 0,
            "repo route {:?} must contain at least one capture group",
            config.repo
        );

        let template = UpstreamTemplate::parse(&config.scheme, groups)
            .with_context(|| format!("bad scheme template for mapping {prefix}"))?;

        Ok(Self {
            prefix,
            host: config.host.clone(),
            request_host: config
                .request_host
                .as_ref()
                .map(|h| h.to_ascii_lowercase()),
            repo,
            kind: config.vcs,
            template,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn kind(&self) -> VcsKind {
        self.kind
    }

    pub(crate) fn template(&self) -> &UpstreamTemplate {
        &self.template
    }

    /// Match a request against this mapping.
    ///
    /// `request_host` is the `Host` header of the inbound request, if any.
    fn match_request(&self, request_host: Option<&str>, path: &str) -> Option<RouteMatch<'_>> {
        if let Some(expected) = &self.request_host {
            let actual = request_host.map(strip_port)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return None;
            }
        }

        if !path.starts_with(self.prefix.as_str()) {
            return None;
        }
        // Keep the leading slash so patterns can anchor on `^/`.
        let remainder = &path[self.prefix.len() - 1..];

        let caps = self.repo.captures(remainder)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 {
            trace!(prefix = %self.prefix, %remainder, "route pattern matched past the start; ignoring");
            return None;
        }

        let captures = caps
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();

        Some(RouteMatch {
            mapping: self,
            captures,
            subpath: remainder[whole.end()..].to_string(),
        })
    }
}

/// Strip an optional `:port` suffix from a `Host` header value.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

// ---------------------------------------------------------------------------
// RouteMatch
// ---------------------------------------------------------------------------

/// Result of a successful route lookup.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub mapping: &'a Mapping,
    /// Capture groups; index 0 is the whole match, unmatched groups are empty.
    pub captures: Vec<String>,
    /// Path after the matched repository portion, e.g. `/info/refs`.
    pub subpath: String,
}

impl RouteMatch<'_> {
    /// Reject captures that could smuggle path traversal into the upstream
    /// URL.
    pub fn check_captures(&self) -> std::result::Result<(), String> {
        for capture in self.captures.iter().skip(1) {
            if capture.contains('\0')
                || capture.contains('\\')
                || capture.split('/').any(|seg| seg == "..")
            {
                return Err(format!("invalid repository path component: {capture:?}"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Ordered list of mappings; the first one that matches wins.
#[derive(Debug)]
pub struct RouteTable {
    mappings: Vec<Mapping>,
}

impl RouteTable {
    pub fn new(configs: &[MappingConfig]) -> Result<Self> {
        let mappings = configs
            .iter()
            .map(Mapping::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mappings })
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Find the first mapping, in declaration order, that matches.
    pub fn match_request(&self, request_host: Option<&str>, path: &str) -> Option<RouteMatch<'_>> {
        let found = self
            .mappings
            .iter()
            .find_map(|m| m.match_request(request_host, path));
        if found.is_none() {
            debug!(%path, "no mapping matched");
        }
        found
    }
}
