//! Container image reference parsing
//!
//! Follows the Docker reference grammar closely enough that every reference a
//! container runtime accepts parses here, and that the registry host is
//! recognized the same way the runtime recognizes it. Resolving an omitted
//! registry is left to [`crate::policy::RegistryPolicy`].
//!
//! - `busybox:1.2` -> no registry, `busybox`, tag `1.2`
//! - `org/app` -> no registry, `org/app`, no tag
//! - `quay.io/org/app@sha256:...` -> `quay.io`, `org/app`, digest
//! - `localhost:5000/app:v1` -> `localhost:5000`, `app`, tag `v1`

use std::fmt;

use crate::error::{Error, Result};

/// Longest repository name (host included) a registry accepts
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// Longest tag a registry accepts
const TAG_LENGTH_MAX: usize = 128;

/// A parsed container image reference
///
/// Every component is kept exactly as written so that serializing it back
/// yields a string the runtime pulls identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (and port) when the reference names one
    pub registry: Option<String>,
    /// Repository path below the registry (e.g. `org/app`)
    pub repository: String,
    /// Tag, without the leading `:`
    pub tag: Option<String>,
    /// Digest, without the leading `@` (e.g. `sha256:...`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a raw image string
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::invalid_reference(raw, "empty reference"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(Error::invalid_reference(raw, "contains whitespace"));
        }

        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(raw, digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A ':' after the last '/' starts a tag; earlier ones belong to a port
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &name_and_tag[colon + 1..];
                validate_tag(raw, tag)?;
                (&name_and_tag[..colon], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(Error::invalid_reference(raw, "missing repository name"));
        }
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(Error::invalid_reference(
                raw,
                format!("name longer than {NAME_TOTAL_LENGTH_MAX} characters"),
            ));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => {
                validate_registry(raw, first)?;
                (Some(first.to_string()), rest)
            }
            _ => (None, name),
        };

        validate_repository(raw, repository)?;

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// The `:tag` / `@digest` suffix exactly as written (may be empty)
    pub fn suffix(&self) -> String {
        let mut suffix = String::new();
        if let Some(tag) = &self.tag {
            suffix.push(':');
            suffix.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            suffix.push('@');
            suffix.push_str(digest);
        }
        suffix
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}{}", self.repository, self.suffix())
    }
}

/// Whether the first path component of a name is a registry host
///
/// Same rule the Docker reference library applies: a host has a dot or a
/// port, is `localhost`, or has uppercase letters (which repositories can't).
pub fn looks_like_registry(component: &str) -> bool {
    component.contains('.')
        || component.contains(':')
        || component == "localhost"
        || component.chars().any(|c| c.is_ascii_uppercase())
}

fn validate_registry(raw: &str, host: &str) -> Result<()> {
    let (hostname, port) = match host.rsplit_once(':') {
        // Bracketed IPv6 without a port has colons inside the brackets only
        Some((h, p)) if !p.contains(']') => (h, Some(p)),
        _ => (host, None),
    };

    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid_reference(raw, format!("invalid registry port {port:?}")));
        }
    }

    let valid_host = if let Some(inner) = hostname.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .is_some_and(|ip| !ip.is_empty() && ip.chars().all(|c| c.is_ascii_hexdigit() || c == ':'))
    } else {
        !hostname.is_empty()
            && hostname
                .split('.')
                .all(|label| {
                    !label.is_empty()
                        && !label.starts_with('-')
                        && !label.ends_with('-')
                        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                })
    };

    if !valid_host {
        return Err(Error::invalid_reference(raw, format!("invalid registry host {hostname:?}")));
    }
    Ok(())
}

fn validate_repository(raw: &str, repository: &str) -> Result<()> {
    for component in repository.split('/') {
        if !is_path_component(component) {
            return Err(Error::invalid_reference(
                raw,
                format!("invalid repository component {component:?}"),
            ));
        }
    }
    Ok(())
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !is_lower_alnum(*first) || !is_lower_alnum(*last) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if is_lower_alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !is_lower_alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        if !matches!(separator, "." | "_" | "__") && !separator.bytes().all(|c| c == b'-') {
            return false;
        }
    }
    true
}

fn is_lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn validate_tag(raw: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == '_')
                && tag.len() <= TAG_LENGTH_MAX
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if !valid {
        return Err(Error::invalid_reference(raw, format!("invalid tag {tag:?}")));
    }
    Ok(())
}

fn validate_digest(raw: &str, digest: &str) -> Result<()> {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return Err(Error::invalid_reference(raw, "digest is missing an algorithm"));
    };

    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .split(['+', '.', '_', '-'])
            .all(|part| !part.is_empty() && part.bytes().all(is_lower_alnum));
    if !algorithm_ok {
        return Err(Error::invalid_reference(
            raw,
            format!("invalid digest algorithm {algorithm:?}"),
        ));
    }

    let hex_len = match algorithm {
        "sha256" => Some(64),
        "sha512" => Some(128),
        _ => None,
    };
    let encoded_ok = match hex_len {
        Some(len) => {
            encoded.len() == len
                && encoded
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => {
            encoded.len() >= 32
                && encoded
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
        }
    };
    if !encoded_ok {
        return Err(Error::invalid_reference(
            raw,
            format!("invalid {algorithm} digest encoding"),
        ));
    }
    Ok(())
}
