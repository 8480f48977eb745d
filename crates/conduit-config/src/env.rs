use std::sync::LazyLock;

use regex::Regex;

/// Matches `{{ env.VAR }}` and `{{ env.VAR | default("fallback") }}`
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{\s*([a-zA-Z0-9_.]+)\s*(?:\|\s*default\("([^"]*)"\))?\s*\}\}"#).expect("must be valid regex")
});

/// Failure while expanding placeholders in the raw config text
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpandError {
    /// Referenced variable is unset and no default was given
    #[error("environment variable not found: `{name}` (line {line})")]
    Missing { name: String, line: usize },

    /// Placeholder uses a scope other than `env.`
    #[error("only variables scoped with 'env.' are supported: `{key}` (line {line})")]
    UnsupportedScope { key: String, line: usize },
}

/// Expand `{{ env.VAR }}` placeholders in a raw TOML string
///
/// A `| default("…")` suffix supplies the value used when the variable is
/// unset. Lines whose first non-blank character is `#` pass through
/// unchanged so commented-out secrets never have to exist.
pub fn expand_env(input: &str) -> Result<String, ExpandError> {
    let mut output = String::with_capacity(input.len());

    for (i, line) in input.lines().enumerate() {
        if i > 0 {
            output.push('\n');
        }

        if line.trim_start().starts_with('#') {
            output.push_str(line);
            continue;
        }

        output.push_str(&expand_line(line, i + 1)?);
    }

    if input.ends_with('\n') {
        output.push('\n');
    }

    Ok(output)
}

fn expand_line(line: &str, line_no: usize) -> Result<String, ExpandError> {
    let mut result = String::with_capacity(line.len());
    let mut last_end = 0;

    for captures in PLACEHOLDER_RE.captures_iter(line) {
        let (Some(whole), Some(key)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let default_value = captures.get(2).map(|m| m.as_str());

        result.push_str(&line[last_end..whole.start()]);

        let Some(var_name) = key.as_str().strip_prefix("env.").filter(|rest| !rest.contains('.')) else {
            return Err(ExpandError::UnsupportedScope {
                key: key.as_str().to_owned(),
                line: line_no,
            });
        };

        match (std::env::var(var_name), default_value) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => {
                return Err(ExpandError::Missing {
                    name: var_name.to_owned(),
                    line: line_no,
                });
            }
        }

        last_end = whole.end();
    }

    result.push_str(&line[last_end..]);
    Ok(result)
}
