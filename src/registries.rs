//! Registries configuration: aliases, unqualified-search registries, and
//! per-registry blocked/insecure flags, loaded from a `registries.conf`-style
//! TOML document.
//!
//! Mirrors [`crate::secrets::CredentialStore`]'s layered-file-loading shape,
//! but for the read-only registry routing policy rather than credentials.
use crate::errors::OciDistributionError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A single `[[registry]]` entry.
#[derive(Debug, Clone, serde::Deserialize)]
struct RegistryEntry {
    location: String,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    insecure: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RegistriesConfFile {
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default, rename = "unqualified-search-registries")]
    unqualified_search_registries: Vec<String>,
    #[serde(default, rename = "registry")]
    registries: Vec<RegistryEntry>,
}

/// A loaded, queryable `registries.conf`: aliases, the unqualified-search
/// list, and per-registry blocked/insecure flags.
///
/// The registry-object list is scanned linearly on every query; the first
/// entry whose `location` matches wins, matching the reference
/// implementation's behavior for registries.conf with duplicate entries.
#[derive(Debug, Clone, Default)]
pub struct RegistriesConfig {
    aliases: HashMap<String, String>,
    unqualified_search_registries: Vec<String>,
    registries: Vec<RegistryEntry>,
}

impl RegistriesConfig {
    /// An empty configuration: no aliases, no search registries, nothing blocked or insecure.
    pub fn empty() -> Self {
        RegistriesConfig::default()
    }

    /// Load from the first existing path in the conventional search order:
    /// the user config (`$HOME/.config/containers/registries.conf`), then the
    /// global one (`/etc/containers/registries.conf`). Returns an empty
    /// configuration if neither exists.
    pub fn load() -> Result<Self, OciDistributionError> {
        for path in default_search_paths() {
            if path.is_file() {
                return Self::load_from_path(&path);
            }
        }
        Ok(RegistriesConfig::empty())
    }

    /// Load from an explicit path.
    pub fn load_from_path(path: &Path) -> Result<Self, OciDistributionError> {
        debug!(path = %path.display(), "loading registries.conf");
        let text = std::fs::read_to_string(path)?;
        let parsed: RegistriesConfFile = toml::from_str(&text)?;
        Ok(RegistriesConfig {
            aliases: parsed.aliases,
            unqualified_search_registries: parsed.unqualified_search_registries,
            registries: parsed.registries,
        })
    }

    /// The full alias map, `short-name -> full/repository/path`.
    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    /// Whether `name` has an alias defined.
    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// The registries searched, in order, for an unqualified (no-registry)
    /// reference like `library/hello`.
    pub fn unqualified_search_registries(&self) -> &[String] {
        &self.unqualified_search_registries
    }

    /// Whether `location` is marked blocked by the first matching entry.
    pub fn is_blocked(&self, location: &str) -> bool {
        self.registries
            .iter()
            .find(|r| r.location == location)
            .map(|r| r.blocked)
            .unwrap_or(false)
    }

    /// Whether `location` is marked insecure (plain HTTP or skip-TLS-verify)
    /// by the first matching entry.
    pub fn is_insecure(&self, location: &str) -> bool {
        self.registries
            .iter()
            .find(|r| r.location == location)
            .map(|r| r.insecure)
            .unwrap_or(false)
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config/containers/registries.conf"));
    }
    paths.push(PathBuf::from("/etc/containers/registries.conf"));
    paths
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
unqualified-search-registries = ["docker.io", "quay.io"]

[aliases]
hello = "docker.io/library/hello"

[[registry]]
location = "insecure.example.com"
insecure = true

[[registry]]
location = "blocked.example.com"
blocked = true
"#;

    #[test]
    fn parses_aliases_and_search_registries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registries.conf");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = RegistriesConfig::load_from_path(&path).unwrap();
        assert!(config.has_alias("hello"));
        assert_eq!(
            config.aliases().get("hello").unwrap(),
            "docker.io/library/hello"
        );
        assert_eq!(
            config.unqualified_search_registries(),
            &["docker.io".to_string(), "quay.io".to_string()]
        );
    }

    #[test]
    fn flags_blocked_and_insecure_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registries.conf");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = RegistriesConfig::load_from_path(&path).unwrap();
        assert!(config.is_insecure("insecure.example.com"));
        assert!(!config.is_blocked("insecure.example.com"));
        assert!(config.is_blocked("blocked.example.com"));
        assert!(!config.is_insecure("blocked.example.com"));
        assert!(!config.is_blocked("untouched.example.com"));
    }

    #[test]
    fn missing_file_falls_back_to_empty() {
        let config = RegistriesConfig::empty();
        assert!(!config.has_alias("anything"));
        assert!(config.unqualified_search_registries().is_empty());
        assert!(!config.is_blocked("example.com"));
    }

    #[test]
    fn first_matching_entry_wins_on_duplicate_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registries.conf");
        std::fs::write(
            &path,
            r#"
[[registry]]
location = "dup.example.com"
blocked = true

[[registry]]
location = "dup.example.com"
blocked = false
"#,
        )
        .unwrap();
        let config = RegistriesConfig::load_from_path(&path).unwrap();
        assert!(config.is_blocked("dup.example.com"));
    }
}
