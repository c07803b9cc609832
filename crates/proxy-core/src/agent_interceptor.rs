//! Recognizes embedded subagent system prompts, rewrites the requested
//! model to the agent's preferred one, and discovers on-disk agent
//! workspace paths referenced by the prompt so they can be validated
//! before anything downstream treats them as trustworthy.

use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// Recognized agent system-prompt markers and the model each one prefers.
/// A real deployment's registry would be configuration-driven; this fixed
/// table covers the built-in subagents the prompt text can embed.
const AGENT_MODEL_MAP: &[(&str, &str)] = &[
    ("You are a code review specialist", "claude-opus-4-20250514"),
    ("You are a documentation writer", "claude-3-5-haiku-20241022"),
    ("You are a test generation specialist", "claude-3-5-sonnet-20241022"),
];

fn agents_dir_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^\s\x22]+/\.claude/agents)").unwrap())
}

fn claude_md_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Contents of ([^\s\x22:]+/CLAUDE\.md)").unwrap())
}

/// Inspect `body["system"]` (or the first system-role message) for a known
/// agent marker; if found, rewrite `body["model"]` to that agent's
/// preferred model and return the matched marker.
pub fn rewrite_model_for_agent(body: &mut Value) -> Option<&'static str> {
    let system_text = extract_system_text(body)?;

    for (marker, model) in AGENT_MODEL_MAP {
        if system_text.contains(marker) {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String((*model).to_string()));
            }
            return Some(marker);
        }
    }
    None
}

fn extract_system_text(body: &Value) -> Option<String> {
    if let Some(system) = body.get("system") {
        if let Some(text) = system.as_str() {
            return Some(text.to_string());
        }
        if let Some(blocks) = system.as_array() {
            let joined: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !joined.is_empty() {
                return Some(joined);
            }
        }
    }

    body.get("messages")?
        .as_array()?
        .iter()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .and_then(|m| m.get("content").and_then(Value::as_str))
        .map(str::to_string)
}

/// Extract candidate on-disk agent workspace paths referenced by `prompt`.
pub fn discover_agent_paths(prompt: &str) -> Vec<String> {
    let mut found = Vec::new();
    for capture in agents_dir_pattern().captures_iter(prompt) {
        found.push(capture[1].to_string());
    }
    for capture in claude_md_pattern().captures_iter(prompt) {
        found.push(capture[1].to_string());
    }
    found
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathSecurityError {
    #[error("path contains a parent-directory segment")]
    ParentTraversal,
    #[error("malformed percent-encoding")]
    MalformedEncoding,
    #[error("path escapes the allowed base directories")]
    OutsideWhitelist,
}

/// Validate a discovered path against the security rules: bounded
/// percent-decoding, rejection of `..` in raw or decoded form, rejection of
/// malformed percent-encoding, and containment within `bases`. Symlinks are
/// not resolved here — the caller is expected to warn, not block, on them.
pub fn validate_agent_path(raw: &str, bases: &[PathBuf]) -> Result<PathBuf, PathSecurityError> {
    if contains_parent_segment(raw) {
        return Err(PathSecurityError::ParentTraversal);
    }

    let mut decoded = raw.to_string();
    for _ in 0..2 {
        let next = percent_decode(&decoded)?;
        if contains_parent_segment(&next) {
            return Err(PathSecurityError::ParentTraversal);
        }
        if next == decoded {
            break;
        }
        decoded = next;
    }

    let path = PathBuf::from(&decoded);
    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    };

    if bases.iter().any(|base| absolute.starts_with(base)) {
        if absolute.is_symlink() {
            warn!(path = %absolute.display(), "agent workspace path is a symlink");
        }
        Ok(absolute)
    } else {
        Err(PathSecurityError::OutsideWhitelist)
    }
}

fn contains_parent_segment(path: &str) -> bool {
    Path::new(path).components().any(|c| c == std::path::Component::ParentDir)
}

fn percent_decode(input: &str) -> Result<String, PathSecurityError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(PathSecurityError::MalformedEncoding);
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).map_err(|_| PathSecurityError::MalformedEncoding)?;
            let value = u8::from_str_radix(hex, 16).map_err(|_| PathSecurityError::MalformedEncoding)?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| PathSecurityError::MalformedEncoding)
}

/// Extract, discover, and validate agent workspace paths referenced by a
/// request body's system prompt in one pass. Invalid paths are logged and
/// dropped rather than surfaced as errors — a rejected path never blocks the
/// request itself.
pub fn discover_valid_agent_paths(body: &Value, bases: &[PathBuf]) -> Vec<PathBuf> {
    let Some(system_text) = extract_system_text(body) else {
        return Vec::new();
    };

    discover_agent_paths(&system_text)
        .into_iter()
        .filter_map(|raw| match validate_agent_path(&raw, bases) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(path = %raw, error = %err, "rejected agent workspace path");
                None
            }
        })
        .collect()
}

/// The standard whitelist of base directories an agent path may resolve
/// under: the user's home directory, the current working directory, and a
/// designated temp root.
pub fn default_bases(temp_root: &Path) -> Vec<PathBuf> {
    let mut bases = Vec::new();
    if let Some(home) = dirs_home() {
        bases.push(home);
    }
    if let Ok(cwd) = std::env::current_dir() {
        bases.push(cwd);
    }
    bases.push(temp_root.to_path_buf());
    bases
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
