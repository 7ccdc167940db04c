// Install parameter declarations.
//
// A [`ParameterSpec`] declares one configurable value; a [`ParameterSet`] is the ordered,
// key-unique collection of specs for one concern (filesystem or application). Effective values
// are produced by [`resolver`] from request overrides, the persisted profile and the defaults.

pub mod catalog;
pub mod profile;
pub mod resolver;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Text,
    FileMode,
    Version,
    Locale,
    Timezone,
    Currency,
    Host,
    YesNo,
    Choice,
    Url,
    Path,
    Email,
    Secret,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Text => "text",
            ParamType::FileMode => "mode",
            ParamType::Version => "version",
            ParamType::Locale => "locale",
            ParamType::Timezone => "timezone",
            ParamType::Currency => "currency",
            ParamType::Host => "host",
            ParamType::YesNo => "yesorno",
            ParamType::Choice => "select",
            ParamType::Url => "url",
            ParamType::Path => "path",
            ParamType::Email => "email",
            ParamType::Secret => "secret",
        }
    }

    /// Enumerated types carry an allowed-values list.
    pub fn is_enumerated(&self) -> bool {
        matches!(self, ParamType::YesNo | ParamType::Choice)
    }
}

/// Configuration namespace; doubles as the section name in the persisted profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Core,
    Filesystem,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Core => "core",
            Section::Filesystem => "fs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("duplicate parameter key '{key}' in set '{set}'")]
    DuplicateKey { set: String, key: String },
    #[error("parameter '{key}' default '{default}' is not one of its allowed values [{allowed}]")]
    DefaultNotAllowed {
        key: String,
        default: String,
        allowed: String,
    },
    #[error("enumerated parameter '{key}' declares no allowed values")]
    MissingChoices { key: String },
    #[error("parameter '{key}' is not enumerated but declares allowed values")]
    UnexpectedChoices { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    key: String,
    param_type: ParamType,
    default_value: String,
    allowed_values: Option<Vec<String>>,
    section: Section,
    description: Option<String>,
}

impl ParameterSpec {
    /// Declare a free-form (non-enumerated) parameter.
    pub fn new(
        section: Section,
        key: impl Into<String>,
        param_type: ParamType,
        default_value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            param_type,
            default_value: default_value.into(),
            allowed_values: None,
            section,
            description: None,
        }
    }

    /// Declare an enumerated parameter. The default must be one of `allowed`.
    pub fn enumerated<I, S>(
        section: Section,
        key: impl Into<String>,
        param_type: ParamType,
        default_value: impl Into<String>,
        allowed: I,
    ) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = Self {
            key: key.into(),
            param_type,
            default_value: default_value.into(),
            allowed_values: Some(allowed.into_iter().map(Into::into).collect()),
            section,
            description: None,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Yes/no parameter with `allowed = [yes, no]`.
    pub fn yes_no(
        section: Section,
        key: impl Into<String>,
        default_value: impl Into<String>,
    ) -> Result<Self, ParamError> {
        Self::enumerated(section, key, ParamType::YesNo, default_value, ["yes", "no"])
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<(), ParamError> {
        match (&self.allowed_values, self.param_type.is_enumerated()) {
            (None, true) => Err(ParamError::MissingChoices {
                key: self.key.clone(),
            }),
            (Some(allowed), true) if allowed.is_empty() => Err(ParamError::MissingChoices {
                key: self.key.clone(),
            }),
            (Some(allowed), true) => {
                if allowed.iter().any(|v| *v == self.default_value) {
                    Ok(())
                } else {
                    Err(ParamError::DefaultNotAllowed {
                        key: self.key.clone(),
                        default: self.default_value.clone(),
                        allowed: allowed.join(", "),
                    })
                }
            }
            (Some(_), false) => Err(ParamError::UnexpectedChoices {
                key: self.key.clone(),
            }),
            (None, false) => Ok(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn param_type(&self) -> ParamType {
        self.param_type
    }

    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    pub fn allowed_values(&self) -> Option<&[String]> {
        self.allowed_values.as_deref()
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_secret(&self) -> bool {
        self.param_type == ParamType::Secret
    }

    /// Human label derived from the key: `admin_frontname` -> `Admin Frontname`.
    pub fn label(&self) -> String {
        self.key
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A `(key, effective value)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedParameter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    name: String,
    specs: Vec<ParameterSpec>,
}

impl ParameterSet {
    /// Build a set, enforcing key uniqueness and every spec's own invariants.
    pub fn new(name: impl Into<String>, specs: Vec<ParameterSpec>) -> Result<Self, ParamError> {
        let name = name.into();
        for (idx, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if specs[..idx].iter().any(|s| s.key == spec.key) {
                return Err(ParamError::DuplicateKey {
                    set: name,
                    key: spec.key.clone(),
                });
            }
        }
        Ok(Self { name, specs })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&ParameterSpec> {
        self.specs.iter().find(|s| s.key == key)
    }

    /// Specs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Keys of every secret-typed spec.
    pub fn secret_keys(&self) -> Vec<&str> {
        self.specs
            .iter()
            .filter(|s| s.is_secret())
            .map(|s| s.key())
            .collect()
    }
}
