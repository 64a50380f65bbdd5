//! When a ready mirror is due for a background refresh.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::record::MirrorKey;
use crate::config::Config;

/// Decides whether a mirror should be refreshed.
pub trait StalenessPolicy: Send + Sync {
    /// `last_synced_at` is `None` for a mirror this process has never
    /// synced (e.g. one adopted from disk).
    fn needs_refresh(
        &self,
        key: &MirrorKey,
        last_synced_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Refresh once the last successful sync is older than a maximum age, with
/// optional per-upstream ages.
#[derive(Debug, Clone)]
pub struct MaxAgePolicy {
    default_max_age: Duration,
    overrides: HashMap<String, Duration>,
}

impl MaxAgePolicy {
    pub fn new(default_max_age: Duration) -> Self {
        Self {
            default_max_age,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, upstream: impl Into<String>, max_age: Duration) -> Self {
        self.overrides.insert(upstream.into(), max_age);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        config
            .repo_overrides
            .iter()
            .filter_map(|(url, o)| Some((url, o.freshness_threshold?)))
            .fold(
                Self::new(config.sync.freshness_threshold()),
                |policy, (url, secs)| policy.with_override(url.clone(), Duration::from_secs(secs)),
            )
    }

    fn max_age(&self, key: &MirrorKey) -> Duration {
        self.overrides
            .get(&key.upstream)
            .copied()
            .unwrap_or(self.default_max_age)
    }
}

impl StalenessPolicy for MaxAgePolicy {
    fn needs_refresh(
        &self,
        key: &MirrorKey,
        last_synced_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(synced) = last_synced_at else {
            return true;
        };
        let age = now.signed_duration_since(synced);
        // A clock that went backwards counts as fresh.
        age.to_std().map(|age| age >= self.max_age(key)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepoOverride, VcsKind};

    fn key(url: &str) -> MirrorKey {
        MirrorKey::new(VcsKind::Git, url)
    }

    #[test]
    fn never_synced_is_stale() {
        let p = MaxAgePolicy::new(Duration::from_secs(600));
        assert!(p.needs_refresh(&key("git://a/b"), None, Utc::now()));
    }

    #[test]
    fn age_threshold() {
        let p = MaxAgePolicy::new(Duration::from_secs(600));
        let now = Utc::now();
        let k = key("git://a/b");
        assert!(!p.needs_refresh(&k, Some(now - chrono::Duration::seconds(599)), now));
        assert!(p.needs_refresh(&k, Some(now - chrono::Duration::seconds(600)), now));
        assert!(!p.needs_refresh(&k, Some(now + chrono::Duration::seconds(5)), now));
    }

    #[test]
    fn overrides_apply_per_upstream() {
        let mut config = Config::default();
        config.repo_overrides.insert(
            "git://a/hot".into(),
            RepoOverride {
                freshness_threshold: Some(10),
            },
        );
        let p = MaxAgePolicy::from_config(&config);
        let now = Utc::now();
        let synced = Some(now - chrono::Duration::seconds(30));
        assert!(p.needs_refresh(&key("git://a/hot"), synced, now));
        assert!(!p.needs_refresh(&key("git://a/cold"), synced, now));
    }
}
