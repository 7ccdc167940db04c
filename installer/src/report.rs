// Operator-facing output: the install report and the parameter listing.

use crate::installation::error::InstallError;
use crate::installation::orchestrator::{InstallRun, RunStatus};
use crate::params::resolver::ParameterResolver;
use crate::params::ParameterSet;
use crate::utils::logging::mask_sensitive;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub run: InstallRun,
}

impl InstallReport {
    pub fn from_run(run: InstallRun, fatal: Option<&InstallError>) -> Self {
        Self {
            success: fatal.is_none() && run.status == RunStatus::Succeeded,
            finished_at: Utc::now(),
            error_kind: fatal.map(InstallError::kind),
            error: fatal.map(|e| e.to_string()),
            run,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize install report")
    }

    pub fn render_text(&self) -> String {
        let run = &self.run;
        let mut out = String::new();
        out.push_str(&format!("Run:              {}\n", run.run_id));
        out.push_str(&format!("Status:           {}\n", run.status.as_str()));
        if !run.download_url.is_empty() {
            out.push_str(&format!("Download URL:     {}\n", run.download_url));
        }
        if let Some(sha) = &run.archive_sha256 {
            out.push_str(&format!("Archive sha256:   {}\n", sha));
        }
        if let Some(stage) = run.failed_stage {
            out.push_str(&format!("Failed stage:     {}\n", stage));
        }
        if let Some(diag) = &run.diagnostic {
            out.push_str(&format!("Diagnostic:       {}\n", diag));
        }
        if !run.repair_failures.is_empty() {
            out.push_str(&format!(
                "Repair failures:  {} (see log for details)\n",
                run.repair_failures.len()
            ));
        }
        if let Some(code) = run.exit_code {
            out.push_str(&format!("Installer exit:   {}\n", code));
        }
        if let Some(secret) = &run.extracted_secret {
            out.push_str(&format!("Encryption key:   {}\n", secret));
        }
        if let Some(line) = &run.command_line {
            out.push_str("\nCommand:\n");
            out.push_str(line);
            out.push('\n');
        }
        if !run.captured_output.is_empty() {
            out.push_str("\nInstaller output:\n");
            out.push_str(&run.captured_output);
            out.push('\n');
        }
        out
    }
}

/// One row of the `params` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterRow {
    pub key: String,
    pub label: String,
    pub section: &'static str,
    pub param_type: &'static str,
    pub value: String,
    pub allowed: Option<Vec<String>>,
    pub source: &'static str,
}

pub fn parameter_rows(set: &ParameterSet, resolver: &ParameterResolver<'_>) -> Vec<ParameterRow> {
    set.iter()
        .map(|spec| {
            let (value, source) = resolver.resolve_with_source(spec);
            let value = if spec.is_secret() && !value.is_empty() {
                mask_sensitive(&value)
            } else {
                value
            };
            ParameterRow {
                key: spec.key().to_string(),
                label: spec.label(),
                section: spec.section().as_str(),
                param_type: spec.param_type().as_str(),
                value,
                allowed: spec.allowed_values().map(|a| a.to_vec()),
                source: source.as_str(),
            }
        })
        .collect()
}

pub fn render_parameter_table(title: &str, rows: &[ParameterRow]) -> String {
    let key_w = rows.iter().map(|r| r.key.len()).max().unwrap_or(0).max(3);
    let mut out = format!("[{}]\n", title);
    for r in rows {
        let mut line = format!(
            "  {:<key_w$}  {:<8}  {:<9}  {}",
            r.key,
            r.source,
            r.param_type,
            if r.value.is_empty() { "\"\"" } else { r.value.as_str() },
            key_w = key_w
        );
        if let Some(allowed) = &r.allowed {
            line.push_str(&format!("  ({})", allowed.join("|")));
        }
        line.push_str(&format!("  # {}", r.label));
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
