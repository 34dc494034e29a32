//! Strips terminal control sequences from streamed shell output.
//!
//! The remote shell runs on a pty, so its output carries prompt colouring,
//! window-title updates and bracketed-paste toggles that mean nothing in a
//! plain transcript. Matching is best-effort: an escape sequence cut in half
//! by a frame boundary is left as literal text.

use regex::Regex;
use std::sync::LazyLock;

/// OSC: ESC ] code ; text, terminated by BEL or ST (ESC \).
static OSC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\][0-9]{1,4};[^\x07\x1b]*?(?:\x07|\x1b\\)").expect("OSC regex is valid")
});

/// CSI: ESC [ parameter bytes, intermediate bytes, one final byte in @..~.
static CSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("CSI regex is valid")
});

/// SOS/PM/APC family: ESC _ text ST.
static APC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\x1b_.*?\x1b\\").expect("APC regex is valid"));

/// Remove OSC, CSI and APC sequences and stray BELs, after folding CRLF to LF.
///
/// ```
/// use pimon::sanitize::sanitize;
///
/// assert_eq!(sanitize("\u{1b}[31mHello\u{1b}[0m\n"), "Hello\n");
/// assert_eq!(sanitize(""), "");
/// ```
pub fn sanitize(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let s = input.replace("\r\n", "\n");
    let s = OSC_PATTERN.replace_all(&s, "");
    let s = CSI_PATTERN.replace_all(&s, "");
    let s = APC_PATTERN.replace_all(&s, "");
    s.replace('\u{7}', "")
}

/// [`sanitize`] for values that may be absent; `None` yields an empty string.
pub fn sanitize_opt(input: Option<&str>) -> String {
    input.map(sanitize).unwrap_or_default()
}
