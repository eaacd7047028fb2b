use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;
use crate::media_type::MediaType;

/// Represents a descriptor for a content blob in an OCI registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content; absent or wrong on some registries
    #[serde(default)]
    pub media_type: MediaType,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: u64,
    /// Optional platform information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Optional annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: MediaType, digest: OciDigest, size: u64) -> Self {
        Self {
            media_type,
            digest,
            size,
            platform: None,
            annotations: None,
        }
    }

    /// Descriptor for `data` as it would be stored.
    pub fn for_content(media_type: MediaType, data: &[u8]) -> Self {
        Self::new(media_type, OciDigest::sha256(data), data.len() as u64)
    }
}

/// Represents platform information for a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub architecture: String,
    /// Optional variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// The platform of the running host, in OCI naming.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
            "powerpc64" => "ppc64",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::new(os, architecture)
    }

    /// Whether a manifest built for `candidate` satisfies this request.
    ///
    /// A requested variant must match exactly; an unset variant accepts any.
    pub fn satisfied_by(&self, candidate: &Platform) -> bool {
        if self.os != candidate.os || self.architecture != candidate.architecture {
            return false;
        }
        match &self.variant {
            Some(variant) => candidate.variant.as_deref() == Some(variant.as_str()),
            None => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => Ok(Platform {
                variant: Some(variant.to_string()),
                ..Platform::new(*os, *arch)
            }),
            _ => Err(format!("invalid platform '{}', expected os/arch[/variant]", s)),
        }
    }
}

/// Represents an OCI image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: i32,
    /// Media type of the manifest
    #[serde(default)]
    pub media_type: MediaType,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs
    pub layers: Vec<Descriptor>,
}

/// Represents an OCI image index or Docker manifest list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version of the index
    pub schema_version: i32,
    /// Media type of the index
    #[serde(default)]
    pub media_type: MediaType,
    /// Child manifests, in declared order
    pub manifests: Vec<Descriptor>,
}

/// Reads the `mediaType` a manifest body declares about itself, if any.
pub(crate) fn sniff_media_type(raw: &[u8]) -> Option<MediaType> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
        layers: Option<serde_json::Value>,
    }

    let probe: Probe = serde_json::from_slice(raw).ok()?;
    match probe.media_type {
        Some(media_type) => Some(MediaType::from(media_type)),
        None if probe.manifests.is_some() => Some(MediaType::OciImageIndex),
        None if probe.layers.is_some() => Some(MediaType::OciManifestSchema1),
        None => None,
    }
}
