// Interpretation of the application installer's output.
//
// The only success signal is a line that is exactly `SUCCESS: <digits>`; the digits are the
// generated encryption key.

use regex::Regex;
use std::sync::OnceLock;

fn success_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^SUCCESS: ([0-9]+)$").unwrap_or_else(|e| panic!("invalid success pattern: {e}"))
    })
}

/// Returns the secret from the first line matching the success pattern.
pub fn parse_install_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        success_line()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Join captured stdout and stderr the way the run records them: stdout lines, then stderr
/// lines, one per line.
pub fn join_captured(stdout: &str, stderr: &str) -> String {
    stdout
        .lines()
        .chain(stderr.lines())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_success_line_yields_secret() {
        assert_eq!(parse_install_output("SUCCESS: 42\n"), Some("42".to_string()));
    }

    #[test]
    fn success_line_among_other_output() {
        let out = "Installing...\nDone with tables\nSUCCESS: 9f0017\n";
        // Non-digit tail is not a match.
        assert_eq!(parse_install_output(out), None);

        let out = "Installing...\r\nSUCCESS: 1234567890\r\n";
        assert_eq!(parse_install_output(out), Some("1234567890".to_string()));
    }

    #[test]
    fn near_misses_are_failures() {
        assert_eq!(parse_install_output("success: 42"), None);
        assert_eq!(parse_install_output("SUCCESS:42"), None);
        assert_eq!(parse_install_output("SUCCESS: "), None);
        assert_eq!(parse_install_output("Result SUCCESS: 42 written"), None);
        assert_eq!(parse_install_output(" SUCCESS: 42"), None);
        assert_eq!(parse_install_output("SUCCESS: 42 "), None);
        assert_eq!(parse_install_output(""), None);
        // Only ASCII digits form the key.
        assert_eq!(parse_install_output("SUCCESS: \u{0664}\u{0662}\n"), None);
        assert_eq!(parse_install_output("SUCCESS: \u{FF14}\u{FF12}"), None);
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(
            parse_install_output("SUCCESS: 1\nSUCCESS: 2"),
            Some("1".to_string())
        );
    }

    #[test]
    fn captured_output_is_stdout_then_stderr() {
        assert_eq!(join_captured("a\nb\n", "warn\n"), "a\nb\nwarn");
        assert_eq!(join_captured("", ""), "");
        assert_eq!(join_captured("only\n", ""), "only");
    }
}
