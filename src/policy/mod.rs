//! Cache policy model.
//!
//! A policy is a four-level tree delivered by the sync server: root settings,
//! per-origin host nodes, per-path endpoint nodes, and per-method leaves.
//! Resolution for `(origin, path, method)` deep-merges the settings found at
//! each level top-down, child values taking precedence.

mod persist;
pub mod store;

pub use persist::{POLICY_DB_FILE, PersistError, PersistedPolicy, PolicyDb};
pub use store::{PolicyObserver, PolicyStore};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// When the engine proactively fetches an endpoint declared in the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchMode {
    Always,
    OnLoad,
    OnUpdate,
    #[default]
    Never,
}

/// One level's contribution to the merged settings. Every field is optional;
/// absent fields defer to the parent level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    /// Server-authoritative modification time, ms since epoch.
    pub last_modified: Option<u64>,
    /// Response freshness window in ms.
    pub ttl: Option<u64>,
    /// Request headers whose values participate in the cache key, in order.
    pub key_headers: Option<Vec<String>>,
    pub prefetch: Option<PrefetchMode>,
}

/// Fully merged settings for one `(origin, path, method)` triple.
///
/// A response is eligible for caching only when at least one of `ttl` or
/// `last_modified` is present; see [`CacheSettings::cacheable`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSettings {
    pub last_modified: Option<u64>,
    pub ttl: Option<u64>,
    pub key_headers: Vec<String>,
    pub prefetch: PrefetchMode,
}

impl CacheSettings {
    /// Whether a freshness decision can ever be established for this leaf.
    pub fn cacheable(&self) -> bool {
        self.last_modified.is_some() || self.ttl.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointPolicy {
    pub settings: Option<SettingsPatch>,
    /// Uppercased HTTP method -> leaf settings.
    pub methods: HashMap<String, SettingsPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostPolicy {
    pub settings: Option<SettingsPatch>,
    /// Normalized path (no leading or trailing slash) -> endpoint node.
    pub endpoints: HashMap<String, EndpointPolicy>,
}

/// The policy envelope as delivered over the wire.
///
/// `hosts` is mandatory: an envelope without it is structurally invalid and
/// rejected at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicy {
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
    pub hosts: HashMap<String, HostPolicy>,
    /// Lifetime of the persisted policy record in ms. Absent or zero means
    /// the policy is not persisted across restarts.
    #[serde(default, rename = "configTTL")]
    pub config_ttl: Option<u64>,
}

/// An `(origin, path, method)` triple declared somewhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchTarget {
    pub origin: String,
    pub path: String,
    pub method: String,
}

impl CachePolicy {
    /// Merged settings for a concrete request triple, or `None` when the
    /// origin or normalized path is not declared, or no level carries any
    /// settings.
    pub fn resolve(&self, origin: &str, path: &str, method: &str) -> Option<CacheSettings> {
        let host = self.hosts.get(origin)?;
        let endpoint = host.endpoints.get(&normalize_path(path))?;
        let leaf = endpoint.methods.get(&method.to_ascii_uppercase());

        merge_settings(&[
            self.settings.as_ref(),
            host.settings.as_ref(),
            endpoint.settings.as_ref(),
            leaf,
        ])
    }

    /// Every method triple declared anywhere in the tree.
    pub fn declared_targets(&self) -> Vec<PrefetchTarget> {
        let mut targets = Vec::new();
        for (origin, host) in &self.hosts {
            for (path, endpoint) in &host.endpoints {
                for method in endpoint.methods.keys() {
                    targets.push(PrefetchTarget {
                        origin: origin.clone(),
                        path: path.clone(),
                        method: method.clone(),
                    });
                }
            }
        }
        targets
    }
}

/// Outcome of a freshness test against merged settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// Decide whether an entry stored at `stored_at` is still servable.
///
/// `lastModified` is authoritative when present: the entry is fresh iff it
/// was stored at or after the server's modification time, with `ttl` (when
/// also present) bounding the entry's lifetime. Without `lastModified`, `ttl`
/// alone defines the window. Returns `None` when neither field is present and
/// no freshness can be established.
pub fn freshness(stored_at: u64, settings: &CacheSettings, now: u64) -> Option<Freshness> {
    let within_ttl = |ttl: u64| stored_at.saturating_add(ttl) > now;

    if let Some(last_modified) = settings.last_modified {
        let fresh =
            stored_at >= last_modified && settings.ttl.is_none_or(within_ttl);
        return Some(if fresh { Freshness::Fresh } else { Freshness::Stale });
    }

    settings.ttl.map(|ttl| {
        if within_ttl(ttl) {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    })
}

/// Strip a single leading and a single trailing slash.
///
/// Policy-tree endpoint keys and request pathnames share this normalization,
/// so `/users/` and `users` address the same node.
pub fn normalize_path(path: &str) -> String {
    let stripped = path.strip_prefix('/').unwrap_or(path);
    let stripped = stripped.strip_suffix('/').unwrap_or(stripped);
    stripped.to_string()
}

fn merge_settings(levels: &[Option<&SettingsPatch>; 4]) -> Option<CacheSettings> {
    let mut merged = CacheSettings::default();
    let mut applied = false;

    for patch in levels.iter().copied().flatten() {
        applied = true;
        if let Some(last_modified) = patch.last_modified {
            merged.last_modified = Some(last_modified);
        }
        if let Some(ttl) = patch.ttl {
            merged.ttl = Some(ttl);
        }
        if let Some(key_headers) = &patch.key_headers {
            merged.key_headers = key_headers.clone();
        }
        if let Some(prefetch) = patch.prefetch {
            merged.prefetch = prefetch;
        }
    }

    applied.then_some(merged)
}
