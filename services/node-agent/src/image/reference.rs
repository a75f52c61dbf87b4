//! Container image references.

use std::fmt;

use super::ExtractError;

/// Registry that serves Docker Hub images.
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// A parsed image reference: registry, repository and tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or `sha256:` digest.
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference.
    ///
    /// Examples:
    /// - `alpine:latest` -> (registry-1.docker.io, library/alpine, latest)
    /// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
    /// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
    pub fn parse(image: &str) -> Result<Self, ExtractError> {
        let image = image.trim();
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(ExtractError::InvalidReference(image.to_string()));
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (image, None),
        };

        // A colon after the last slash separates the tag; before it, a port.
        let (name, tag) = match name.rfind(':') {
            Some(i) if !name[i + 1..].contains('/') => (&name[..i], Some(&name[i + 1..])),
            _ => (name, None),
        };

        let reference = digest.or(tag).unwrap_or("latest").to_string();

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };

        let (registry, repository) = match registry.as_str() {
            "docker.io" | "index.docker.io" | DOCKER_HUB_REGISTRY => {
                let repository = if repository.contains('/') {
                    repository
                } else {
                    format!("library/{repository}")
                };
                (DOCKER_HUB_REGISTRY.to_string(), repository)
            }
            _ => (registry, repository),
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(ExtractError::InvalidReference(image.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.reference
        )
    }
}
