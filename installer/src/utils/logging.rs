// Logging utilities
// Structured logging with JSON and human-readable formats

use log::Level;
use serde_json::json;
use std::collections::HashMap;

/// Mask sensitive data in logs
pub fn mask_sensitive(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }

    let visible = 4;
    let start: String = chars[..visible].iter().collect();
    let end: String = chars[chars.len() - visible..].iter().collect();

    format!("{}...{}", start, end)
}

/// Mask a `--key value` style argument list for logging.
///
/// Values following a flag named in `secret_keys` are fully masked; everything else is kept.
pub fn mask_flag_values(args: &[String], secret_keys: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        if let Some(flag) = arg.strip_prefix("--") {
            mask_next = secret_keys.iter().any(|k| *k == flag);
        }
        out.push(arg.clone());
    }
    out
}

/// Parse phase and step from log message
/// Extracts [PHASE: ...] and [STEP: ...] patterns
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut phase = None;
    let mut step = None;
    let mut cleaned_message = message.to_string();

    // Extract [PHASE: ...]
    if let Some(start) = message.find("[PHASE:") {
        if let Some(end) = message[start..].find(']') {
            let phase_str = &message[start + 7..start + end].trim();
            phase = Some(phase_str.to_string());
            cleaned_message = format!("{} {}", &message[..start], &message[start + end + 1..])
                .trim()
                .to_string();
        }
    }

    // Extract [STEP: ...]
    if let Some(start) = cleaned_message.find("[STEP:") {
        if let Some(end) = cleaned_message[start..].find(']') {
            let step_str = &cleaned_message[start + 6..start + end].trim();
            step = Some(step_str.to_string());
            cleaned_message = format!(
                "{} {}",
                &cleaned_message[..start],
                &cleaned_message[start + end + 1..]
            )
            .trim()
            .to_string();
        }
    }

    (phase, step, cleaned_message)
}

/// Format log entry as JSON for structured logging
pub fn format_json_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
    details: Option<&HashMap<String, serde_json::Value>>,
) -> String {
    let mut log_entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": message,
    });

    if let Some(phase) = phase {
        log_entry["phase"] = json!(phase);
    }

    if let Some(step) = step {
        log_entry["step"] = json!(step);
    }

    if let Some(details) = details {
        log_entry["details"] = json!(details);
    }

    serde_json::to_string(&log_entry).unwrap_or_else(|_| "{}".to_string())
}

/// Format log entry as human-readable text
pub fn format_human_readable_log(
    timestamp: &str,
    level: Level,
    target: &str,
    message: &str,
    phase: Option<&str>,
    step: Option<&str>,
) -> String {
    let mut log_line = format!("[{}] [{}]", timestamp, level.as_str());

    if let Some(phase) = phase {
        log_line.push_str(&format!(" [PHASE: {}]", phase));
    }

    if let Some(step) = step {
        log_line.push_str(&format!(" [STEP: {}]", step));
    }

    log_line.push_str(&format!(" [{}] {}", target, message));
    log_line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_sensitive_short_values_fully_masked() {
        assert_eq!(mask_sensitive("abc"), "***");
        assert_eq!(mask_sensitive("12345678"), "***");
        assert_eq!(mask_sensitive(""), "***");
    }

    #[test]
    fn mask_sensitive_long_values_partially_masked() {
        let masked = mask_sensitive("abcdefghijklmnop");
        assert!(
            masked.contains("..."),
            "Long value should be partially masked: {}",
            masked
        );
        assert!(masked.starts_with("abcd"), "Start should be visible: {}", masked);
        assert!(masked.ends_with("mnop"), "End should be visible: {}", masked);
    }

    #[test]
    fn mask_sensitive_handles_multibyte_text() {
        let masked = mask_sensitive("ünïcödé-pässwörd");
        assert_eq!(masked, "ünïc...wörd");
    }

    #[test]
    fn mask_flag_values_hides_only_secret_flags() {
        let args: Vec<String> = ["-f", "install.php", "--", "--db_user", "magento", "--db_pass", "hunter2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let masked = mask_flag_values(&args, &["db_pass"]);
        assert_eq!(masked[4], "magento");
        assert_eq!(masked[6], "***");
        assert!(!masked.iter().any(|a| a == "hunter2"));
    }

    #[test]
    fn mask_flag_values_secret_flag_at_end_is_harmless() {
        let args = vec!["--db_pass".to_string()];
        assert_eq!(mask_flag_values(&args, &["db_pass"]), args);
    }

    #[test]
    fn parse_log_metadata_extracts_phase_and_step() {
        let (phase, step, msg) =
            parse_log_metadata("[PHASE: install] [STEP: fetch] fetch entered (url=x)");
        assert_eq!(phase.as_deref(), Some("install"));
        assert_eq!(step.as_deref(), Some("fetch"));
        assert_eq!(msg, "fetch entered (url=x)");
    }

    #[test]
    fn parse_log_metadata_without_markers_keeps_message() {
        let (phase, step, msg) = parse_log_metadata("plain message");
        assert!(phase.is_none());
        assert!(step.is_none());
        assert_eq!(msg, "plain message");
    }

    #[test]
    fn format_json_log_includes_phase_fields() {
        let line = format_json_log(
            "2011-05-01T00:00:00Z",
            Level::Info,
            "devel_install",
            "hello",
            Some("install"),
            Some("prepare"),
            None,
        );
        let v: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(v["level"], "INFO");
        assert_eq!(v["phase"], "install");
        assert_eq!(v["step"], "prepare");
        assert!(v.get("details").is_none());
    }

    #[test]
    fn format_human_readable_log_layout() {
        let line = format_human_readable_log(
            "2011-05-01 00:00:00.000",
            Level::Warn,
            "devel_install",
            "careful",
            Some("preflight"),
            None,
        );
        assert_eq!(
            line,
            "[2011-05-01 00:00:00.000] [WARN] [PHASE: preflight] [devel_install] careful"
        );
    }
}
