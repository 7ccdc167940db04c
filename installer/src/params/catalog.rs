// The static parameter declarations for a Magento devel install.

use super::{ParamError, ParamType, ParameterSet, ParameterSpec, Section};

pub const FILESYSTEM_SET: &str = "filesystem";
pub const APPLICATION_SET: &str = "application";

pub const UID: &str = "uid";
pub const GID: &str = "gid";
pub const DIR_MODE: &str = "dirmod";
pub const FILE_MODE: &str = "filemod";
pub const INTERPRETER: &str = "php";
pub const VERSION: &str = "version";

/// Filesystem parameters (profile section `fs`).
pub fn filesystem_params() -> Result<ParameterSet, ParamError> {
    let fs = Section::Filesystem;
    ParameterSet::new(
        FILESYSTEM_SET,
        vec![
            ParameterSpec::new(fs, UID, ParamType::Text, "")
                .with_description("Owner (user name or numeric uid) applied to the install root"),
            ParameterSpec::new(fs, GID, ParamType::Text, "")
                .with_description("Group (group name or numeric gid) applied to the install root"),
            ParameterSpec::new(fs, DIR_MODE, ParamType::FileMode, "0755"),
            ParameterSpec::new(fs, FILE_MODE, ParamType::FileMode, "0644"),
            ParameterSpec::new(fs, INTERPRETER, ParamType::Path, "/usr/bin/php")
                .with_description("PHP interpreter used to run the installer"),
        ],
    )
}

/// Application parameters (profile section `core`), passed to the installer in this order.
///
/// `site_host` seeds the default base URLs.
pub fn application_params(site_host: &str) -> Result<ParameterSet, ParamError> {
    let core = Section::Core;
    let host = site_host.trim_end_matches('/');
    ParameterSet::new(
        APPLICATION_SET,
        vec![
            ParameterSpec::new(core, VERSION, ParamType::Version, "1.5.1.0")
                .with_description("Release to install, eg. 1.4.2.0 or 1.5.1.0"),
            ParameterSpec::yes_no(core, "license_agreement_accepted", "yes")?,
            ParameterSpec::new(core, "locale", ParamType::Locale, "en_US"),
            ParameterSpec::new(core, "timezone", ParamType::Timezone, "America/Los_Angeles"),
            ParameterSpec::new(core, "default_currency", ParamType::Currency, "USD"),
            ParameterSpec::new(core, "db_host", ParamType::Host, "127.0.0.1"),
            ParameterSpec::new(core, "db_name", ParamType::Text, ""),
            ParameterSpec::new(core, "db_user", ParamType::Text, ""),
            ParameterSpec::new(core, "db_pass", ParamType::Secret, ""),
            ParameterSpec::new(core, "db_prefix", ParamType::Text, ""),
            ParameterSpec::enumerated(core, "session_save", ParamType::Choice, "db", ["files", "db"])?,
            ParameterSpec::new(core, "admin_frontname", ParamType::Text, "admin"),
            ParameterSpec::new(core, "url", ParamType::Url, format!("http://{}/", host)),
            ParameterSpec::yes_no(core, "skip_url_validation", "no")?,
            ParameterSpec::yes_no(core, "use_rewrites", "yes")?,
            ParameterSpec::yes_no(core, "use_secure", "no")?,
            ParameterSpec::new(core, "secure_base_url", ParamType::Url, format!("https://{}/", host)),
            ParameterSpec::yes_no(core, "use_secure_admin", "no")?,
            ParameterSpec::yes_no(core, "enable_charts", "yes")?,
            ParameterSpec::new(core, "admin_lastname", ParamType::Text, ""),
            ParameterSpec::new(core, "admin_firstname", ParamType::Text, ""),
            ParameterSpec::new(core, "admin_email", ParamType::Email, ""),
            ParameterSpec::new(core, "admin_username", ParamType::Text, ""),
            ParameterSpec::new(core, "admin_password", ParamType::Secret, ""),
            ParameterSpec::new(core, "encryption_key", ParamType::Secret, ""),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_satisfy_set_invariants() {
        let fs = filesystem_params().unwrap();
        let app = application_params("localhost").unwrap();
        assert_eq!(fs.len(), 5);
        assert_eq!(app.len(), 25);
        for spec in fs.iter().chain(app.iter()) {
            assert_eq!(spec.validate(), Ok(()), "{}", spec.key());
            if let Some(allowed) = spec.allowed_values() {
                assert!(allowed.iter().any(|v| v == spec.default_value()));
            }
        }
    }

    #[test]
    fn sections_match_sets() {
        assert!(filesystem_params()
            .unwrap()
            .iter()
            .all(|s| s.section() == Section::Filesystem));
        assert!(application_params("localhost")
            .unwrap()
            .iter()
            .all(|s| s.section() == Section::Core));
    }

    #[test]
    fn site_host_seeds_base_urls() {
        let app = application_params("shop.example/").unwrap();
        assert_eq!(app.get("url").unwrap().default_value(), "http://shop.example/");
        assert_eq!(
            app.get("secure_base_url").unwrap().default_value(),
            "https://shop.example/"
        );
    }

    #[test]
    fn secrets_are_typed_as_secret() {
        let app = application_params("localhost").unwrap();
        assert_eq!(app.secret_keys(), ["db_pass", "admin_password", "encryption_key"]);
    }

    #[test]
    fn version_is_declared_first() {
        let app = application_params("localhost").unwrap();
        assert_eq!(app.iter().next().unwrap().key(), VERSION);
    }
}
