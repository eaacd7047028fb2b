use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::digest::OciDigest;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
}

/// Represents an OCI image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Optional hostname (registry)
    pub hostname: Option<String>,
    /// Repository name
    pub name: String,
    /// Tag, defaults to `latest` when neither tag nor digest is given
    pub tag: Option<String>,
    /// Pinned digest
    pub digest: Option<OciDigest>,
}

impl ImageReference {
    /// Registry host, with Docker Hub as the default.
    pub fn registry(&self) -> &str {
        self.hostname.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    /// Repository path as the registry API expects it.
    pub fn repository(&self) -> String {
        if self.registry() == DEFAULT_REGISTRY && !self.name.contains('/') {
            format!("library/{}", self.name)
        } else {
            self.name.clone()
        }
    }

    /// The tag or digest used in the manifest URL; the digest wins when both are set.
    pub fn identifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Fully qualified form, with registry and tag defaults filled in.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.registry(), self.repository());
        match (&self.tag, &self.digest) {
            (Some(tag), _) => {
                out.push(':');
                out.push_str(tag);
            }
            (None, None) => {
                out.push(':');
                out.push_str(DEFAULT_TAG);
            }
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(&digest.to_string());
        }
        out
    }
}

fn valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parse image reference in the format: [hostname/]name[:tag][@digest]
        let invalid = || ImageReferenceError::InvalidFormat(s.to_string());

        let (remainder, digest) = match s.split_once('@') {
            Some((remainder, digest)) => (
                remainder,
                Some(OciDigest::from_str(digest).map_err(|_| invalid())?),
            ),
            None => (s, None),
        };

        // The first component is a registry host if it looks like one
        let (hostname, path) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, remainder),
        };

        // A tag can only follow the last path component
        let last_slash = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match path[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&path[..split], Some(path[split + 1..].to_string()))
            }
            None => (path, None),
        };

        if !valid_repository(name) {
            return Err(invalid());
        }
        if let Some(tag) = &tag {
            if !valid_tag(tag) {
                return Err(invalid());
            }
        }

        Ok(ImageReference {
            hostname,
            name: name.to_string(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(hostname) = &self.hostname {
            write!(f, "{}/", hostname)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
