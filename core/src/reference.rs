//! Docker-style image reference parsing.
//!
//! Splits references like `quay.io/myorg/app:v2` into registry, repository,
//! tag, and digest, applying the usual implicit rules (`docker.io` registry,
//! `library/` namespace, `latest` tag).

use crate::error::{KilnError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port (e.g. "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/nginx", "myorg/app")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest, if any (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        // Digest comes after '@', always of the form algorithm:hex.
        let (rest, digest) = match reference.rsplit_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid(reference, "digest must be of the form algorithm:hex"));
                }
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag, except when the
        // whole name is host:port-shaped (all digits after the colon).
        let last_segment_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_segment_start..].rfind(':') {
            Some(i) => {
                let colon = last_segment_start + i;
                let candidate = &rest[colon + 1..];
                if last_segment_start == 0 && candidate.chars().all(|c| c.is_ascii_digit()) {
                    // bare "host:5000" with no path is not a tagged name
                    (rest, None)
                } else {
                    (&rest[..colon], Some(candidate.to_string()))
                }
            }
            None => (rest, None),
        };

        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host for an image reference string.
    pub fn registry_of(reference: &str) -> Result<String> {
        Ok(Self::parse(reference)?.registry)
    }
}

/// A leading component counts as a registry when it looks like a hostname:
/// it contains a dot or a port, or is exactly "localhost".
fn split_registry(name: &str, original: &str) -> Result<(String, String)> {
    if let Some((first, remainder)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if remainder.is_empty() {
                return Err(invalid(original, "empty repository"));
            }
            return Ok((first.to_string(), remainder.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn invalid(reference: &str, message: &str) -> KilnError {
    KilnError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_org_repo_with_tag() {
        let r = ImageReference::parse("myorg/app:v2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myorg/app");
        assert_eq!(r.tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("quay.io/myorg/app").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "myorg/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag.as_deref(), Some("dev"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse("quay.io/myorg/app@sha256:0a1b2c").unwrap();
        assert_eq!(r.digest.as_deref(), Some("sha256:0a1b2c"));
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_digest() {
        assert!(ImageReference::parse("nginx@notadigest").is_err());
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(ImageReference::registry_of("packs/run").unwrap(), "docker.io");
        assert_eq!(ImageReference::registry_of("quay.io/x").unwrap(), "quay.io");
    }

    #[test]
    fn test_display_round_trip() {
        let r = ImageReference::parse("quay.io/myorg/app:v2").unwrap();
        assert_eq!(r.to_string(), "quay.io/myorg/app:v2");
    }
}
