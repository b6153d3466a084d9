//! Configuration files read by the core.
//!
//! All config files are JSON, read-only, and tolerant: a missing or malformed
//! file yields defaults and never raises to callers.
//!
//! - `llm_config.json`: provider groups, provider endpoints, routing policy
//! - `permissions.json`: immutable path guard list
//! - `resident_output/approvals.json`: approval overrides (see governance)
//! - `skill_router_policy.json`: skill tier gating for dispatch plans

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Env var that forces `api_live_enabled = false` regardless of config.
/// Set by the test suites so no test ever makes a live provider call.
pub const TEST_GUARD_ENV: &str = "RESIDENT_TEST_GUARD";

// ============================================================================
// LLM routing configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Master switch for live provider calls. When false (or when the test
    /// guard env is set) the router synthesizes local fallback responses.
    pub api_live_enabled: bool,

    /// Named route groups, each an ordered list of provider names.
    pub provider_groups: BTreeMap<String, Vec<String>>,

    /// Provider definitions keyed by name.
    pub providers: BTreeMap<String, ProviderConfig>,

    pub routing_policy: RoutingPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Transport family. Only `api` and `zhipu` are supported.
    pub provider: String,
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub key_env: String,
    /// Inline key fallback when `key_env` is unset or empty.
    pub api_key: String,
    pub timeout_sec: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "api".to_string(),
            enabled: true,
            endpoint: String::new(),
            model: String::new(),
            key_env: String::new(),
            api_key: String::new(),
            timeout_sec: 20.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Custom per-task candidate prefixes. `*` is the wildcard fallback.
    #[serde(deserialize_with = "de_string_list_map")]
    pub task_preferences: BTreeMap<String, Vec<String>>,

    /// Per-task recommended skill packs for dispatch plans.
    #[serde(deserialize_with = "de_string_list_map")]
    pub task_skill_packs: BTreeMap<String, Vec<String>>,

    /// conservative | balanced | aggressive
    pub work_memory_strength: String,
}

impl LlmConfig {
    /// Load from a JSON file; missing or malformed input yields defaults.
    pub fn load(path: &Path) -> Self {
        read_json_or_default(path)
    }

    /// Effective live flag: config switch gated by the test-guard env.
    pub fn live_enabled(&self) -> bool {
        self.api_live_enabled && std::env::var_os(TEST_GUARD_ENV).is_none()
    }
}

// ============================================================================
// Permissions (immutable path guard)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PermissionsFile {
    immutable_paths: Vec<String>,
}

/// Protected paths: built-in self-protection defaults plus any extras from
/// `permissions.json` in the base directory.
pub fn load_immutable_paths(base_dir: &Path) -> Vec<String> {
    let mut paths = vec![
        base_dir.join("Cargo.toml").display().to_string(),
        base_dir.join("src").join("brain.rs").display().to_string(),
        base_dir.join("src").join("safety.rs").display().to_string(),
    ];
    let file: PermissionsFile = read_json_or_default(&base_dir.join("permissions.json"));
    paths.extend(file.immutable_paths.into_iter().filter(|p| !p.trim().is_empty()));
    paths
}

// ============================================================================
// Skill router policy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillRouterPolicy {
    pub enabled_tiers: EnabledTiers,
    pub max_active: usize,
    #[serde(deserialize_with = "de_string_list_map")]
    pub allowlist: BTreeMap<String, Vec<String>>,
    pub denylist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnabledTiers {
    pub core: bool,
    pub experimental: bool,
    pub high_risk: bool,
}

impl Default for EnabledTiers {
    fn default() -> Self {
        Self {
            core: true,
            experimental: false,
            high_risk: false,
        }
    }
}

impl Default for SkillRouterPolicy {
    fn default() -> Self {
        Self {
            enabled_tiers: EnabledTiers::default(),
            max_active: 24,
            allowlist: BTreeMap::new(),
            denylist: Vec::new(),
        }
    }
}

impl SkillRouterPolicy {
    pub fn load(base_dir: &Path) -> Self {
        let mut policy: SkillRouterPolicy =
            read_json_or_default(&base_dir.join("skill_router_policy.json"));
        policy.max_active = policy.max_active.clamp(6, 500);
        policy
    }

    /// Drop denylisted skills and cap the list at `max_active`.
    pub fn filter_skills(&self, skills: Vec<String>) -> Vec<String> {
        skills
            .into_iter()
            .filter(|s| !self.denylist.iter().any(|d| d.eq_ignore_ascii_case(s)))
            .take(self.max_active)
            .collect()
    }
}

// ============================================================================
// Shared loading helpers
// ============================================================================

fn read_json_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return T::default(),
    };
    // Tolerate a UTF-8 BOM, which Windows editors love to prepend.
    let raw = raw.trim_start_matches('\u{feff}');
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!("ignoring malformed config {}: {}", path.display(), err);
            T::default()
        }
    }
}

/// Substitute `${VAR}` tokens from the process environment. Unset variables
/// expand to the empty string.
pub fn expand_env_tokens(input: &str) -> String {
    static TOKEN: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    TOKEN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Accept either a JSON list of strings or a comma-separated string for every
/// map value; empty entries are dropped and duplicates removed.
fn de_string_list_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    let raw: BTreeMap<String, StringOrList> = BTreeMap::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw {
        let key = key.trim().to_string();
        if key.is_empty() {
            continue;
        }
        let items = match value {
            StringOrList::One(s) => s.split(',').map(|x| x.trim().to_string()).collect(),
            StringOrList::Many(list) => list.into_iter().map(|x| x.trim().to_string()).collect::<Vec<_>>(),
        };
        let mut dedup: Vec<String> = Vec::new();
        for item in items {
            if !item.is_empty() && !dedup.contains(&item) {
                dedup.push(item);
            }
        }
        out.insert(key, dedup);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_yields_defaults() {
        let cfg = LlmConfig::load(Path::new("/nonexistent/llm_config.json"));
        assert!(!cfg.api_live_enabled);
        assert!(cfg.provider_groups.is_empty());
    }

    #[test]
    fn test_malformed_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_config.json");
        std::fs::write(&path, "{not json").unwrap();
        let cfg = LlmConfig::load(&path);
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn test_task_preferences_accept_comma_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm_config.json");
        std::fs::write(
            &path,
            r#"{
                "api_live_enabled": true,
                "provider_groups": {"deep_chain": ["p1"]},
                "routing_policy": {
                    "task_preferences": {"coding": "coder_chain, deep_chain, coder_chain"}
                }
            }"#,
        )
        .unwrap();
        let cfg = LlmConfig::load(&path);
        assert_eq!(
            cfg.routing_policy.task_preferences.get("coding").unwrap(),
            &vec!["coder_chain".to_string(), "deep_chain".to_string()]
        );
    }

    #[test]
    fn test_immutable_paths_include_defaults_and_extras() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("permissions.json"),
            r#"{"immutable_paths": ["/etc/resident/keys", ""]}"#,
        )
        .unwrap();
        let paths = load_immutable_paths(dir.path());
        assert!(paths.iter().any(|p| p.ends_with("Cargo.toml")));
        assert!(paths.contains(&"/etc/resident/keys".to_string()));
        assert!(!paths.contains(&String::new()));
    }

    #[test]
    fn test_skill_policy_clamps_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("skill_router_policy.json"),
            r#"{"max_active": 2, "denylist": ["sora"]}"#,
        )
        .unwrap();
        let policy = SkillRouterPolicy::load(dir.path());
        assert_eq!(policy.max_active, 6);

        let filtered = policy.filter_skills(vec![
            "imagegen".to_string(),
            "sora".to_string(),
            "speech".to_string(),
        ]);
        assert_eq!(filtered, vec!["imagegen".to_string(), "speech".to_string()]);
    }

    #[test]
    fn test_expand_env_tokens() {
        std::env::set_var("RESIDENT_CFG_TEST_TOKEN", "xyz");
        assert_eq!(expand_env_tokens("key=${RESIDENT_CFG_TEST_TOKEN}"), "key=xyz");
        assert_eq!(expand_env_tokens("${RESIDENT_CFG_NO_SUCH_VAR}"), "");
    }
}
