//! ANSI escape code handling utilities
//!
//! Dev servers (next, nest, gradle, docker compose) colour their output even
//! when piped, usually because `FORCE_COLOR` is set. Those sequences are
//! stripped before a line becomes a log entry.

use regex::Regex;
use std::sync::LazyLock;

/// Regex pattern for ANSI escape sequences.
///
/// Covers:
/// - CSI sequences: ESC [ ... letter (colors, cursor movement, erase line)
/// - OSC sequences: ESC ] ... BEL or ST (hyperlinks, window titles)
/// - Simple escapes: ESC letter
static ANSI_ESCAPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \x1b\[[0-9;?]*[A-Za-z]               # CSI sequences
        | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)  # OSC sequences
        | \x1b[A-Za-z]                       # Simple escapes
        ",
    )
    .expect("ANSI regex pattern is valid")
});

/// Strip all ANSI escape sequences from a string.
///
/// # Examples
///
/// ```
/// use devherd_core::strip_ansi_codes;
///
/// let input = "\x1b[32m✓\x1b[39m Ready in 1.2s";
/// assert_eq!(strip_ansi_codes(input), "✓ Ready in 1.2s");
/// ```
pub fn strip_ansi_codes(input: &str) -> String {
    ANSI_ESCAPE_PATTERN.replace_all(input, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_simple_color_codes() {
        let input = "\x1b[31mred text\x1b[0m";
        assert_eq!(strip_ansi_codes(input), "red text");
    }

    #[test]
    fn test_strip_256_color_codes() {
        let input = "\x1b[38;5;244m[Nest] 4120  - LOG\x1b[0m";
        assert_eq!(strip_ansi_codes(input), "[Nest] 4120  - LOG");
    }

    #[test]
    fn test_strip_erase_line_and_cursor() {
        let input = "\x1b[2K\x1b[1G> Task :app:compileDebugKotlin";
        assert_eq!(strip_ansi_codes(input), "> Task :app:compileDebugKotlin");
    }

    #[test]
    fn test_strip_osc_hyperlink() {
        let input = "\x1b]8;;http://localhost:3000\x07http://localhost:3000\x1b]8;;\x07";
        assert_eq!(strip_ansi_codes(input), "http://localhost:3000");
    }

    #[test]
    fn test_preserve_unicode() {
        let input = "▲ Next.js 15.1.0 ✓ Starting...";
        assert_eq!(strip_ansi_codes(input), input);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(strip_ansi_codes(""), "");
    }
}
