//! Descriptor text parsing

use std::path::{Path, PathBuf};

use pmobj_core::Error;
use thiserror::Error as ThisError;

use super::{PartDesc, PartKind, PoolSetDescriptor, ReplicaDesc, POOLSET_SIGNATURE};

/// Syntax error in descriptor text
#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct DescriptorError {
    /// 1-based line number
    pub line: usize,
    /// What was wrong
    pub message: String,
}

impl From<DescriptorError> for Error {
    fn from(e: DescriptorError) -> Self {
        Error::DescriptorInvalid(e.to_string())
    }
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`, `T`,
/// optionally followed by `B` or `iB`)
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if digits_end == 0 {
        return None;
    }
    let value: u64 = text[..digits_end].parse().ok()?;
    let suffix = text[digits_end..].to_ascii_uppercase();
    let unit = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(&suffix);
    let shift = match unit {
        "" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return None,
    };
    value.checked_mul(1u64 << shift)
}

/// Render a size with the largest exact binary suffix
pub fn format_size(size: u64) -> String {
    for (shift, suffix) in [(40, "T"), (30, "G"), (20, "M"), (10, "K")] {
        let unit = 1u64 << shift;
        if size >= unit && size % unit == 0 {
            return format!("{}{}", size / unit, suffix);
        }
    }
    size.to_string()
}

pub(super) fn parse(text: &str) -> Result<PoolSetDescriptor, DescriptorError> {
    let mut desc = PoolSetDescriptor::default();
    let mut signature_seen = false;
    let mut current = ReplicaDesc::default();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let err = |message: String| DescriptorError {
            line: line_no,
            message,
        };
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if !signature_seen {
            if line != POOLSET_SIGNATURE {
                return Err(err(format!("expected {}", POOLSET_SIGNATURE)));
            }
            signature_seen = true;
            continue;
        }

        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("OPTION") => {
                if !current.parts.is_empty() || !desc.replicas.is_empty() {
                    return Err(err("OPTION must precede all parts".into()));
                }
                for option in tokens {
                    match option {
                        "SINGLEHDR" => desc.single_header = true,
                        other => return Err(err(format!("unknown option {}", other))),
                    }
                }
            }
            Some("REPLICA") => {
                if let Some(host) = tokens.next() {
                    return Err(err(format!("remote replica on {} is not supported", host)));
                }
                if current.parts.is_empty() {
                    return Err(err("REPLICA follows a replica without parts".into()));
                }
                desc.replicas.push(std::mem::take(&mut current));
            }
            Some(size_text) => {
                let size = parse_size(size_text)
                    .ok_or_else(|| err(format!("invalid size {:?}", size_text)))?;
                let path_text = tokens
                    .next()
                    .ok_or_else(|| err("part line needs a size and a path".into()))?;
                if tokens.next().is_some() {
                    return Err(err("unexpected text after part path".into()));
                }
                current.parts.push(classify(size, path_text));
            }
            None => {}
        }
    }

    if !signature_seen {
        return Err(DescriptorError {
            line: 0,
            message: "empty descriptor".into(),
        });
    }
    if current.parts.is_empty() {
        return Err(DescriptorError {
            line: text.lines().count(),
            message: "last replica has no parts".into(),
        });
    }
    desc.replicas.push(current);
    Ok(desc)
}

fn classify(size: u64, path_text: &str) -> PartDesc {
    let is_dir = path_text.ends_with('/') || Path::new(path_text).is_dir();
    let trimmed = if path_text.len() > 1 {
        path_text.trim_end_matches('/')
    } else {
        path_text
    };
    PartDesc {
        size,
        path: PathBuf::from(trimmed),
        kind: if is_dir {
            PartKind::Directory
        } else {
            PartKind::File
        },
    }
}
