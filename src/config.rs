use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// VCS kind
// ---------------------------------------------------------------------------

/// Which version-control backend serves a mapping.
///
/// The set is closed: every variant has a clone, fetch and serve
/// implementation in [`crate::vcs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    /// Git, served over the smart HTTP protocol.
    Git,
    /// Mercurial, served through hgweb.
    Hg,
}

impl VcsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Hg => "hg",
        }
    }
}

impl std::fmt::Display for VcsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "hg" | "mercurial" => Ok(Self::Hg),
            other => anyhow::bail!("unrecognized VCS type: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
    /// Per-upstream overrides keyed by the resolved upstream URL.
    #[serde(default)]
    pub repo_overrides: HashMap<String, RepoOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            vcs: VcsConfig::default(),
            mappings: Vec::new(),
            repo_overrides: HashMap::new(),
        }
    }
}

impl Config {
    /// Parse [`Config::listen`], accepting the short `:8080` form.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let listen = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.listen))
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one directory per mirror.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/tmp/vcsserver")
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum age (seconds) of a mirror before a background refresh is
    /// scheduled.  `0` refreshes on every request.
    #[serde(default = "default_freshness_threshold")]
    pub freshness_threshold: u64,
    /// Upper bound (seconds) on a cold clone.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,
    /// Upper bound (seconds) on a warm refresh.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Semaphore limit for concurrent clones against upstreams.
    #[serde(default = "default_max_concurrent_clones")]
    pub max_concurrent_clones: usize,
    /// Semaphore limit for concurrent fetches against upstreams.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_threshold: default_freshness_threshold(),
            clone_timeout: default_clone_timeout(),
            fetch_timeout: default_fetch_timeout(),
            max_concurrent_clones: default_max_concurrent_clones(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

impl SyncConfig {
    pub fn freshness_threshold(&self) -> Duration {
        Duration::from_secs(self.freshness_threshold)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

fn default_freshness_threshold() -> u64 {
    600
}

fn default_clone_timeout() -> u64 {
    1800
}

fn default_fetch_timeout() -> u64 {
    600
}

fn default_max_concurrent_clones() -> usize {
    4
}

fn default_max_concurrent_fetches() -> usize {
    8
}

// ---------------------------------------------------------------------------
// VCS tooling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct VcsConfig {
    /// Path or name of the `git` executable.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    /// Path or name of the `hg` executable.
    #[serde(default = "default_hg_binary")]
    pub hg_binary: String,
    /// Python interpreter that can `import mercurial`, used to run hgweb.
    #[serde(default = "default_hg_python")]
    pub hg_python: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            git_binary: default_git_binary(),
            hg_binary: default_hg_binary(),
            hg_python: default_hg_python(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_hg_binary() -> String {
    "hg".to_string()
}

fn default_hg_python() -> String {
    "python3".to_string()
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// Raw mapping as written in the config file or on the command line.
///
/// Compiled into a [`crate::routing::mapping::Mapping`] at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappingConfig {
    /// Request-path prefix, e.g. `/github.com/`.
    pub prefix: String,
    /// Upstream host identifier, e.g. `github.com`.
    pub host: String,
    /// Only serve requests whose `Host` header matches, when set.
    #[serde(default)]
    pub request_host: Option<String>,
    /// Regular expression with capture groups applied to the path after the
    /// prefix.
    pub repo: String,
    pub vcs: VcsKind,
    /// Bare scheme name (`git`, `https`) or a URL template.
    pub scheme: String,
}

/// Parse the launcher form `prefix,host,repo-route,vcs,scheme`.
///
/// The route regex is the middle field, so commas inside it (e.g. `{1,3}`)
/// are preserved.
pub fn parse_mapping_arg(arg: &str) -> Result<MappingConfig> {
    let mut head = arg.splitn(3, ',');
    let prefix = head.next().unwrap_or_default();
    let host = head.next();
    let rest = head.next();

    let (host, rest) = match (host, rest) {
        (Some(host), Some(rest)) => (host, rest),
        _ => anyhow::bail!(
            "mapping must have 5 comma-separated fields (prefix,host,repo-route,vcs,scheme), got {:?}",
            arg
        ),
    };

    let mut tail = rest.rsplitn(3, ',');
    let scheme = tail.next();
    let vcs = tail.next();
    let repo = tail.next();

    let (repo, vcs, scheme) = match (repo, vcs, scheme) {
        (Some(repo), Some(vcs), Some(scheme)) => (repo, vcs, scheme),
        _ => anyhow::bail!(
            "mapping must have 5 comma-separated fields (prefix,host,repo-route,vcs,scheme), got {:?}",
            arg
        ),
    };

    Ok(MappingConfig {
        prefix: prefix.to_string(),
        host: host.to_string(),
        request_host: None,
        repo: repo.to_string(),
        vcs: vcs.parse()?,
        scheme: scheme.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Per-repo overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoOverride {
    /// Override freshness threshold (seconds) for this upstream.
    pub freshness_threshold: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`.
///
/// Validation is left to [`validate_config`] so that command-line mappings
/// can be merged in first.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
///
/// Route patterns are compiled later by [`crate::routing::RouteTable::new`].
pub fn validate_config(config: &Config) -> Result<()> {
    config.listen_addr()?;
    anyhow::ensure!(
        !config.mappings.is_empty(),
        "at least one mapping is required"
    );
    anyhow::ensure!(
        config.sync.clone_timeout > 0 && config.sync.fetch_timeout > 0,
        "clone_timeout and fetch_timeout must be greater than zero"
    );
    anyhow::ensure!(
        config.sync.max_concurrent_clones > 0 && config.sync.max_concurrent_fetches > 0,
        "max_concurrent_clones and max_concurrent_fetches must be greater than zero"
    );
    for mapping in &config.mappings {
        anyhow::ensure!(
            mapping.prefix.starts_with('/'),
            "mapping prefix must start with '/': {:?}",
            mapping.prefix
        );
        anyhow::ensure!(
            !mapping.host.is_empty(),
            "mapping host must not be empty (prefix {:?})",
            mapping.prefix
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mapping_arg_launcher_form() {
        let m = parse_mapping_arg("/github.com/,github.com,^/([^/]+)/([^/]+),git,git").unwrap();
        assert_eq!(m.prefix, "/github.com/");
        assert_eq!(m.host, "github.com");
        assert_eq!(m.repo, "^/([^/]+)/([^/]+)");
        assert_eq!(m.vcs, VcsKind::Git);
        assert_eq!(m.scheme, "git");
        assert!(m.request_host.is_none());
    }

    #[test]
    fn parse_mapping_arg_keeps_commas_in_regex() {
        let m = parse_mapping_arg("/hg/,hg.example.org,^/([a-z]{1,3})/(.+),hg,https").unwrap();
        assert_eq!(m.repo, "^/([a-z]{1,3})/(.+)");
        assert_eq!(m.vcs, VcsKind::Hg);
        assert_eq!(m.scheme, "https");
    }

    #[test]
    fn parse_mapping_arg_rejects_short_forms() {
        assert!(parse_mapping_arg("/github.com/,github.com,git,git").is_err());
        assert!(parse_mapping_arg("/github.com/").is_err());
    }

    #[test]
    fn parse_mapping_arg_rejects_unknown_vcs() {
        let err = parse_mapping_arg("/x/,x.org,^/(.+),svn,https").unwrap_err();
        assert!(err.to_string().contains("svn"));
    }

    #[test]
    fn yaml_defaults_apply() {
        let yaml = r#"
mappings:
  - prefix: /github.com/
    host: github.com
    repo: ^/([^/]+)/([^/]+)
    vcs: git
    scheme: https
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.storage.root, PathBuf::from("/tmp/vcsserver"));
        assert_eq!(config.sync.freshness_threshold, 600);
        assert_eq!(config.vcs.git_binary, "git");
        assert_eq!(config.mappings.len(), 1);
        validate_config(&config).unwrap();
    }

    #[test]
    fn yaml_overrides_parse() {
        let yaml = r#"
listen: "127.0.0.1:9000"
sync:
  freshness_threshold: 30
mappings:
  - prefix: /gh/
    host: github.com
    request_host: mirror.local
    repo: ^/(.+)
    vcs: git
    scheme: "https://{host}/{1}.git"
repo_overrides:
  "https://github.com/acme/widget.git":
    freshness_threshold: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sync.freshness_threshold(), Duration::from_secs(30));
        assert_eq!(
            config.mappings[0].request_host.as_deref(),
            Some("mirror.local")
        );
        assert_eq!(
            config.repo_overrides["https://github.com/acme/widget.git"].freshness_threshold,
            Some(5)
        );
    }

    #[test]
    fn validate_requires_a_mapping() {
        let err = validate_config(&Config::default()).unwrap_err();
        assert!(err.to_string().contains("at least one mapping"));
    }

    #[test]
    fn listen_addr_accepts_port_only() {
        let config = Config {
            listen: ":8080".into(),
            ..Config::default()
        };
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
    }
}
