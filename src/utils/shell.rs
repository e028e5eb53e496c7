//! Shell escaping and quoting utilities.
//!
//! Every value that originates from configuration or decrypted secrets and
//! ends up in a remote script passes through one of these functions.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // Characters that require quoting
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Escape a value for embedding between double quotes.
///
/// Inside `"..."` bash still interprets `\`, `"`, `$` and `` ` ``; each is
/// prefixed with a backslash so the shell hands the literal value through.
pub fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// First meaningful line of a script, skipping `set -e`, exports and
/// variable assignments. Used to name a script in logs and diagnostics.
pub fn summarize(script: &str) -> &str {
    let mut lines = script.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.clone().next().unwrap_or("");
    lines.find(|line| !is_setup_line(line)).unwrap_or(first)
}

fn is_setup_line(line: &str) -> bool {
    if line.starts_with("set -") || line.starts_with("export ") || line.starts_with("eval ") {
        return true;
    }
    line.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c == '_')
    })
}
