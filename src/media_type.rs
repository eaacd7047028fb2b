use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Media types the engine knows how to dispatch on.
///
/// Values outside the recognized set are preserved verbatim in `Other` so
/// that descriptors round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    DockerManifestSchema1,
    DockerManifestSchema1Signed,
    DockerManifestSchema2,
    DockerManifestList,
    DockerConfigJson,
    DockerLayer,
    DockerForeignLayer,
    OciManifestSchema1,
    OciImageIndex,
    OciConfigJson,
    OciLayer,
    OciUncompressedLayer,
    Other(String),
}

/// How a media type is handled when it appears on a manifest descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Legacy,
    SingleArtifact,
    Collection,
    Unrecognized,
}

impl MediaType {
    pub const SINGLE_ARTIFACT: [MediaType; 2] =
        [MediaType::OciManifestSchema1, MediaType::DockerManifestSchema2];
    pub const COLLECTION: [MediaType; 2] = [MediaType::OciImageIndex, MediaType::DockerManifestList];
    pub const LEGACY: [MediaType; 2] = [
        MediaType::DockerManifestSchema1,
        MediaType::DockerManifestSchema1Signed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            MediaType::DockerManifestSchema1 => {
                "application/vnd.docker.distribution.manifest.v1+json"
            }
            MediaType::DockerManifestSchema1Signed => {
                "application/vnd.docker.distribution.manifest.v1+prettyjws"
            }
            MediaType::DockerManifestSchema2 => {
                "application/vnd.docker.distribution.manifest.v2+json"
            }
            MediaType::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json"
            }
            MediaType::DockerConfigJson => "application/vnd.docker.container.image.v1+json",
            MediaType::DockerLayer => "application/vnd.docker.image.rootfs.diff.tar.gzip",
            MediaType::DockerForeignLayer => {
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"
            }
            MediaType::OciManifestSchema1 => "application/vnd.oci.image.manifest.v1+json",
            MediaType::OciImageIndex => "application/vnd.oci.image.index.v1+json",
            MediaType::OciConfigJson => "application/vnd.oci.image.config.v1+json",
            MediaType::OciLayer => "application/vnd.oci.image.layer.v1.tar+gzip",
            MediaType::OciUncompressedLayer => "application/vnd.oci.image.layer.v1.tar",
            MediaType::Other(value) => value,
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaType::DockerManifestSchema1 | MediaType::DockerManifestSchema1Signed => {
                MediaKind::Legacy
            }
            MediaType::OciManifestSchema1 | MediaType::DockerManifestSchema2 => {
                MediaKind::SingleArtifact
            }
            MediaType::OciImageIndex | MediaType::DockerManifestList => MediaKind::Collection,
            _ => MediaKind::Unrecognized,
        }
    }

    /// The ordered Accept list sent with every manifest request.
    ///
    /// Schema 1 types are listed only so a registry that serves them is
    /// recognized and rejected instead of being mis-parsed.
    pub fn manifest_accept_list() -> Vec<MediaType> {
        MediaType::LEGACY
            .into_iter()
            .chain(MediaType::SINGLE_ARTIFACT)
            .chain(MediaType::COLLECTION)
            .collect()
    }
}

impl From<&str> for MediaType {
    fn from(value: &str) -> Self {
        // Content-Type headers may carry parameters such as a charset.
        let value = value.split(';').next().unwrap_or_default().trim();
        match value {
            "application/vnd.docker.distribution.manifest.v1+json" => {
                MediaType::DockerManifestSchema1
            }
            "application/vnd.docker.distribution.manifest.v1+prettyjws" => {
                MediaType::DockerManifestSchema1Signed
            }
            "application/vnd.docker.distribution.manifest.v2+json" => {
                MediaType::DockerManifestSchema2
            }
            "application/vnd.docker.distribution.manifest.list.v2+json" => {
                MediaType::DockerManifestList
            }
            "application/vnd.docker.container.image.v1+json" => MediaType::DockerConfigJson,
            "application/vnd.docker.image.rootfs.diff.tar.gzip" => MediaType::DockerLayer,
            "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip" => {
                MediaType::DockerForeignLayer
            }
            "application/vnd.oci.image.manifest.v1+json" => MediaType::OciManifestSchema1,
            "application/vnd.oci.image.index.v1+json" => MediaType::OciImageIndex,
            "application/vnd.oci.image.config.v1+json" => MediaType::OciConfigJson,
            "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::OciLayer,
            "application/vnd.oci.image.layer.v1.tar" => MediaType::OciUncompressedLayer,
            other => MediaType::Other(other.to_string()),
        }
    }
}

impl From<String> for MediaType {
    fn from(value: String) -> Self {
        MediaType::from(value.as_str())
    }
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::Other(String::new())
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Other(value) if value.is_empty() => write!(f, "<none>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MediaType::from(s))
    }
}
