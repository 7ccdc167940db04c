// External value sources: the persisted install profile and request-scoped overrides.

use anyhow::{Context, Result};
use config::{Config, File, FileFormat, Source};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::Path;

/// Persisted profile: section -> key -> value, as read from `devel_install_profile.ini`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallProfile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl InstallProfile {
    /// Load an INI profile. A missing file is an empty profile; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(
            "[PHASE: configuration] [STEP: profile] load entered (path={:?}, exists={})",
            path,
            path.exists()
        );

        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()
            .with_context(|| format!("Failed to read install profile {:?}", path))?;

        let raw = cfg
            .collect()
            .with_context(|| format!("Failed to parse install profile {:?}", path))?;

        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (section, value) in raw {
            let table = match value.into_table() {
                Ok(t) => t,
                Err(_) => {
                    warn!(
                        "[PHASE: configuration] [STEP: profile] Ignoring key '{}' outside of any section",
                        section
                    );
                    continue;
                }
            };
            let entries = sections.entry(section.clone()).or_default();
            for (key, v) in table {
                match v.into_string() {
                    Ok(s) => {
                        entries.insert(key, s);
                    }
                    Err(e) => warn!(
                        "[PHASE: configuration] [STEP: profile] Ignoring non-scalar value [{}] {}: {}",
                        section, key, e
                    ),
                }
            }
        }

        debug!(
            "[PHASE: configuration] [STEP: profile] load exit (sections={})",
            sections.len()
        );
        Ok(Self { sections })
    }

    pub fn from_entries<I, S, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, K, V)>,
        S: Into<String>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (section, key, value) in entries {
            sections
                .entry(section.into())
                .or_default()
                .insert(key.into(), value.into());
        }
        Self { sections }
    }

    pub fn lookup(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.values().all(BTreeMap::is_empty)
    }
}

/// Request-scoped overrides (`--set key=value`). Present-but-empty is distinct from absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOverrides {
    values: BTreeMap<String, String>,
}

impl RequestOverrides {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse one `key=value` assignment. `key=` is a valid, empty assignment.
pub fn parse_assignment(raw: &str) -> std::result::Result<(String, String), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected KEY=VALUE, got '{}'", raw));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_profile_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let profile = InstallProfile::load(&dir.path().join("devel_install_profile.ini")).unwrap();
        assert!(profile.is_empty());
        assert_eq!(profile.lookup("core", "version"), None);
    }

    #[test]
    fn ini_profile_sections_are_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devel_install_profile.ini");
        std::fs::write(
            &path,
            "[core]\nversion = 1.4.2.0\ndb_name = shop\ndb_prefix =\n\n[fs]\ndirmod = 0775\nuid = www-data\n",
        )
        .unwrap();

        let profile = InstallProfile::load(&path).unwrap();
        assert_eq!(profile.lookup("core", "version"), Some("1.4.2.0"));
        assert_eq!(profile.lookup("core", "db_name"), Some("shop"));
        assert_eq!(profile.lookup("core", "db_prefix"), Some(""));
        assert_eq!(profile.lookup("fs", "dirmod"), Some("0775"));
        assert_eq!(profile.lookup("fs", "uid"), Some("www-data"));
        assert_eq!(profile.lookup("fs", "version"), None);
    }

    #[test]
    fn overrides_distinguish_empty_from_absent() {
        let overrides = RequestOverrides::from_pairs([("db_prefix", "")]);
        assert_eq!(overrides.lookup("db_prefix"), Some(""));
        assert_eq!(overrides.lookup("db_name"), None);
    }

    #[test]
    fn parse_assignment_accepts_empty_values_and_equals_in_value() {
        assert_eq!(
            parse_assignment("db_prefix=").unwrap(),
            ("db_prefix".to_string(), String::new())
        );
        assert_eq!(
            parse_assignment("db_pass=a=b").unwrap(),
            ("db_pass".to_string(), "a=b".to_string())
        );
        assert!(parse_assignment("version").is_err());
        assert!(parse_assignment("=1.5.1.0").is_err());
    }
}
