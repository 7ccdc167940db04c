// Tool configuration (where to fetch from, which external programs to run, timeouts).
//
// These are not install parameters: they describe the environment the installer runs in.
// Precedence, lowest first: built-in defaults, TOML file, `DEVEL_INSTALL_*` environment, CLI.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

pub const SETTINGS_FILE_NAME: &str = "devel-install.toml";
pub const ENV_PREFIX: &str = "DEVEL_INSTALL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_root: Option<PathBuf>,
    pub profile_file: PathBuf,
    pub assets_base_url: String,
    pub package_name: String,
    /// Top-level directory the archive unpacks into; defaults to `package_name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_root_dir: Option<String>,
    pub installer_entrypoint: String,
    /// Subtree of the install root whose existing ownership survives the ownership rewrite.
    /// Empty disables the protection.
    pub protected_subtree: String,
    pub site_host: String,
    pub fetch_program: String,
    pub fetch_args: Vec<String>,
    pub extract_program: String,
    pub extract_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
    pub fetch_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub installer_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            install_root: None,
            profile_file: PathBuf::from("devel_install_profile.ini"),
            assets_base_url: "http://www.magentocommerce.com/downloads/assets".to_string(),
            package_name: "magento".to_string(),
            archive_root_dir: None,
            installer_entrypoint: "install.php".to_string(),
            protected_subtree: "shell".to_string(),
            site_host: "localhost".to_string(),
            fetch_program: "wget".to_string(),
            fetch_args: vec!["-q".to_string()],
            extract_program: "tar".to_string(),
            extract_args: vec!["xzf".to_string()],
            archive_sha256: None,
            fetch_timeout_secs: 1800,
            extract_timeout_secs: 600,
            installer_timeout_secs: 1800,
            log_dir: None,
        }
    }
}

impl InstallerSettings {
    /// Load settings from `explicit_file` (required) or `<search_dir>/devel-install.toml`
    /// (optional), then the environment.
    pub fn load(explicit_file: Option<&Path>, search_dir: &Path) -> Result<Self> {
        Self::load_with_env(explicit_file, search_dir, None)
    }

    /// As [`InstallerSettings::load`], reading `DEVEL_INSTALL_*` from `env_vars` instead of the
    /// process environment when given.
    fn load_with_env(
        explicit_file: Option<&Path>,
        search_dir: &Path,
        env_vars: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let (path, required) = match explicit_file {
            Some(p) => (p.to_path_buf(), true),
            None => (search_dir.join(SETTINGS_FILE_NAME), false),
        };
        debug!(
            "[PHASE: configuration] [STEP: settings] load entered (path={:?}, required={})",
            path, required
        );

        let cfg = Config::builder()
            .add_source(
                File::from(path.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("fetch_args")
                    .with_list_parse_key("extract_args")
                    .source(env_vars),
            )
            .build()
            .with_context(|| format!("Failed to load settings from {:?}", path))?;

        let settings: InstallerSettings = cfg
            .try_deserialize()
            .with_context(|| format!("Invalid settings in {:?}", path))?;
        Ok(settings)
    }

    pub fn archive_root_dir(&self) -> &str {
        self.archive_root_dir
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.package_name)
    }

    pub fn protected_subtree(&self) -> Option<&str> {
        Some(self.protected_subtree.trim()).filter(|s| !s.is_empty())
    }

    /// Download URL template: `<base>/<version>/<package>-<version>.tar.gz`.
    pub fn download_url(&self, version: &str) -> String {
        format!(
            "{}/{}/{}-{}.tar.gz",
            self.assets_base_url.trim_end_matches('/'),
            version,
            self.package_name,
            version
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn installer_timeout(&self) -> Duration {
        Duration::from_secs(self.installer_timeout_secs)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render settings as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = InstallerSettings::load(None, dir.path()).unwrap();
        assert_eq!(settings.package_name, "magento");
        assert_eq!(settings.archive_root_dir(), "magento");
        assert_eq!(settings.protected_subtree(), Some("shell"));
        assert_eq!(settings.fetch_program, "wget");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(InstallerSettings::load(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            "package_name = \"openmage\"\narchive_root_dir = \"openmage-root\"\nprotected_subtree = \"\"\nfetch_args = [\"-nv\", \"--tries=2\"]\ninstaller_timeout_secs = 60\n",
        )
        .unwrap();

        let settings = InstallerSettings::load(None, dir.path()).unwrap();
        assert_eq!(settings.package_name, "openmage");
        assert_eq!(settings.archive_root_dir(), "openmage-root");
        assert_eq!(settings.protected_subtree(), None);
        assert_eq!(settings.fetch_args, ["-nv", "--tries=2"]);
        assert_eq!(settings.installer_timeout(), Duration::from_secs(60));
        assert_eq!(settings.extract_program, "tar");
    }

    #[test]
    fn environment_overrides_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE_NAME),
            "site_host = \"file.example\"\nfetch_args = [\"-q\"]\npackage_name = \"openmage\"\n",
        )
        .unwrap();
        let env: config::Map<String, String> = [
            ("DEVEL_INSTALL_SITE_HOST", "env.example"),
            ("DEVEL_INSTALL_FETCH_ARGS", "-nv --tries=2"),
            ("DEVEL_INSTALL_INSTALLER_TIMEOUT_SECS", "90"),
            ("OTHER_SITE_HOST", "ignored.example"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = InstallerSettings::load_with_env(None, dir.path(), Some(env)).unwrap();
        assert_eq!(settings.site_host, "env.example");
        assert_eq!(settings.fetch_args, ["-nv", "--tries=2"]);
        assert_eq!(settings.installer_timeout(), Duration::from_secs(90));
        // Keys the environment does not name keep the file's value.
        assert_eq!(settings.package_name, "openmage");
    }

    #[test]
    fn download_url_follows_template() {
        let settings = InstallerSettings {
            assets_base_url: "http://mirror.example/assets/".to_string(),
            ..InstallerSettings::default()
        };
        assert_eq!(
            settings.download_url("1.5.1.0"),
            "http://mirror.example/assets/1.5.1.0/magento-1.5.1.0.tar.gz"
        );
    }

    #[test]
    fn settings_render_as_toml() {
        let rendered = InstallerSettings::default().to_toml().unwrap();
        assert!(rendered.contains("package_name = \"magento\""));
        assert!(!rendered.contains("archive_sha256"));
    }
}
