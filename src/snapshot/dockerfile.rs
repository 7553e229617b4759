//! Dockerfile parsing
//!
//! Turns a Dockerfile into the primitive [`BuildOp`] sequence the snapshot
//! factory replays. Supported instructions: FROM, RUN, COPY, ENV, WORKDIR,
//! USER, ARG (with `${name}` / `$name` substitution), plus comments and
//! backslash line continuations. RUN uses shell form (`/bin/sh -c`) unless
//! written in exec-array form.

use std::collections::HashMap;

use crate::snapshot::builder::BuildOp;
use crate::{Error, Result};

/// Parse `text`, substituting `build_args` into ARG-declared names.
pub fn parse_dockerfile(
    text: &str,
    build_args: &HashMap<String, String>,
) -> Result<Vec<BuildOp>> {
    let mut ops = Vec::new();
    let mut args: HashMap<String, String> = HashMap::new();

    for raw_line in logical_lines(text) {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (instruction, rest) = match line.split_once(char::is_whitespace) {
            Some((i, r)) => (i.to_ascii_uppercase(), r.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };
        let rest = substitute(rest, &args);

        match instruction.as_str() {
            "FROM" => {
                let image = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Error::InvalidConfig("FROM needs an image".into()))?;
                ops.push(BuildOp::From(image.to_string()));
            }
            "RUN" => {
                let argv = if rest.starts_with('[') {
                    parse_exec_array(&rest)?
                } else {
                    vec!["/bin/sh".into(), "-c".into(), rest.clone()]
                };
                ops.push(BuildOp::Run(argv));
            }
            "COPY" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() != 2 {
                    return Err(Error::InvalidConfig(format!(
                        "COPY takes exactly one source and one destination, got {:?}",
                        rest
                    )));
                }
                ops.push(BuildOp::Copy {
                    src: parts[0].to_string(),
                    dest: parts[1].to_string(),
                });
            }
            "ENV" => {
                let (key, value) = rest
                    .split_once('=')
                    .or_else(|| rest.split_once(char::is_whitespace))
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!("ENV needs key=value, got {:?}", rest))
                    })?;
                ops.push(BuildOp::Env {
                    key: key.trim().to_string(),
                    value: value.trim().trim_matches('"').to_string(),
                });
            }
            "WORKDIR" => ops.push(BuildOp::Workdir(rest.to_string())),
            "USER" => ops.push(BuildOp::User(rest.to_string())),
            "ARG" => {
                let (name, default) = match rest.split_once('=') {
                    Some((n, d)) => (n.trim().to_string(), Some(d.trim().to_string())),
                    None => (rest.trim().to_string(), None),
                };
                let value = build_args
                    .get(&name)
                    .cloned()
                    .or(default)
                    .unwrap_or_default();
                args.insert(name, value);
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported Dockerfile instruction {:?}",
                    other
                )));
            }
        }
    }

    if !ops.iter().any(|op| matches!(op, BuildOp::From(_))) {
        return Err(Error::InvalidConfig("Dockerfile has no FROM".into()));
    }
    Ok(ops)
}

/// Join backslash-continued lines.
fn logical_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(trimmed);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Replace `${name}` and `$name` with declared ARG values.
fn substitute(text: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if braced {
            if chars.peek() == Some(&'}') {
                chars.next();
            }
        }
        match args.get(&name) {
            Some(value) => out.push_str(value),
            None => {
                // Unknown variables pass through untouched.
                out.push('$');
                if braced {
                    out.push('{');
                }
                out.push_str(&name);
                if braced {
                    out.push('}');
                }
            }
        }
    }
    out
}

/// Parse a JSON-ish exec array: `["apk", "add", "gcc"]`.
fn parse_exec_array(text: &str) -> Result<Vec<String>> {
    serde_json::from_str::<Vec<String>>(text)
        .map_err(|e| Error::InvalidConfig(format!("bad exec array {:?}: {}", text, e)))
}
