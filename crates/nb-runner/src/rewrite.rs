//! Rebasing of absolute-looking path literals onto a workspace root.
//!
//! A literal such as `"/data/train.csv"` inside cell source is rewritten to
//! `"<root>/data/train.csv"` when `<root>/data` exists. Literals starting with `//`
//! are never touched, and a literal is only matched when the same quote character
//! opens and closes it. Escaped quotes inside a literal are not understood.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::path::{Path, MAIN_SEPARATOR};

static PATH_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""/([^/"'][^"']*)"|'/([^/"'][^"']*)'"#).expect("path literal pattern")
});

fn usable_root(root: Option<&Path>) -> Option<&Path> {
    root.filter(|r| !r.as_os_str().is_empty())
}

/// Rewrites one literal body (including its leading `/`).
pub fn rewrite_literal(workspace_root: Option<&Path>, literal: &str) -> String {
    let Some(root) = usable_root(workspace_root) else {
        return literal.to_string();
    };
    let normalized = literal.trim_start_matches('/');
    let trailing = normalized.ends_with('/');
    let stripped = normalized.trim_end_matches('/');
    if stripped.is_empty() {
        return literal.to_string();
    }
    let first_segment = stripped.split('/').next().unwrap_or(stripped);
    if !root.join(first_segment).exists() {
        return literal.to_string();
    }
    let mut rebuilt = root.join(stripped).to_string_lossy().into_owned();
    if trailing && !rebuilt.ends_with(MAIN_SEPARATOR) {
        rebuilt.push(MAIN_SEPARATOR);
    }
    rebuilt
}

pub fn rewrite_source(source: &str, workspace_root: Option<&Path>) -> String {
    let Some(root) = usable_root(workspace_root) else {
        return source.to_string();
    };
    PATH_LITERAL
        .replace_all(source, |caps: &Captures| {
            let (quote, body) = match (caps.get(1), caps.get(2)) {
                (Some(m), _) => ('"', m.as_str()),
                (None, Some(m)) => ('\'', m.as_str()),
                (None, None) => return caps[0].to_string(),
            };
            let rewritten = rewrite_literal(Some(root), &format!("/{}", body));
            format!("{}{}{}", quote, rewritten, quote)
        })
        .into_owned()
}
