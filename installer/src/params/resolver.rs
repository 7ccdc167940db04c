// Effective value resolution: request override > persisted profile > built-in default.
//
// Presence, not truthiness, decides precedence: an empty override or an empty profile entry
// still wins over everything below it.

use super::profile::{InstallProfile, RequestOverrides};
use super::{ParameterSet, ParameterSpec, ResolvedParameter};
use serde::Serialize;

/// Which source supplied an effective value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Override,
    Profile,
    Default,
}

impl ValueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueSource::Override => "override",
            ValueSource::Profile => "profile",
            ValueSource::Default => "default",
        }
    }
}

/// Resolve the effective value of `spec`. Never fails.
pub fn resolve(
    spec: &ParameterSpec,
    overrides: Option<&RequestOverrides>,
    profile: Option<&InstallProfile>,
) -> String {
    resolve_with_source(spec, overrides, profile).0
}

pub fn resolve_with_source(
    spec: &ParameterSpec,
    overrides: Option<&RequestOverrides>,
    profile: Option<&InstallProfile>,
) -> (String, ValueSource) {
    if let Some(v) = overrides.and_then(|o| o.lookup(spec.key())) {
        return (v.to_string(), ValueSource::Override);
    }

    if let Some(v) = profile.and_then(|p| p.lookup(spec.section().as_str(), spec.key())) {
        return (v.to_string(), ValueSource::Profile);
    }

    (spec.default_value().to_string(), ValueSource::Default)
}

/// Binds both external sources so callers can resolve by spec or by key.
#[derive(Debug, Clone, Copy)]
pub struct ParameterResolver<'a> {
    overrides: Option<&'a RequestOverrides>,
    profile: Option<&'a InstallProfile>,
}

impl<'a> ParameterResolver<'a> {
    pub fn new(overrides: Option<&'a RequestOverrides>, profile: Option<&'a InstallProfile>) -> Self {
        Self { overrides, profile }
    }

    pub fn resolve(&self, spec: &ParameterSpec) -> String {
        resolve(spec, self.overrides, self.profile)
    }

    pub fn resolve_with_source(&self, spec: &ParameterSpec) -> (String, ValueSource) {
        resolve_with_source(spec, self.overrides, self.profile)
    }

    /// Effective value of `key` in `set`; `None` if the set declares no such key.
    pub fn value_of(&self, set: &ParameterSet, key: &str) -> Option<String> {
        set.get(key).map(|spec| self.resolve(spec))
    }

    /// Every spec of `set`, resolved, in declaration order.
    pub fn resolve_all(&self, set: &ParameterSet) -> Vec<ResolvedParameter> {
        set.iter()
            .map(|spec| ResolvedParameter {
                key: spec.key().to_string(),
                value: self.resolve(spec),
            })
            .collect()
    }
}
