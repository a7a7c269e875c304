//! Artifact bundle types and staging errors.

use std::path::PathBuf;

use thiserror::Error;

/// File name of the k3s binary inside a bundle.
pub const BINARY_NAME: &str = "k3s";

/// File name of the air-gap image tarball inside a bundle.
pub const IMAGES_NAME: &str = "k3s-airgap-images-amd64.tar.zst";

/// File name of the published checksum list inside a bundle.
pub const SUMS_NAME: &str = "sha256sum-amd64.txt";

/// File name of the install script inside a bundle.
pub const INSTALL_SCRIPT_NAME: &str = "install.sh";

/// Errors that can occur while staging or delivering artifacts.
#[derive(Error, Debug)]
pub enum StageError {
    /// HTTP download failed.
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Local file I/O failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checksum mismatch. The bundle must be re-staged and is never loaded.
    #[error("checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    /// The published checksum list has no entry for an artifact.
    #[error("no published checksum for {0}")]
    MissingChecksum(String),

    /// A required bundle file is absent.
    #[error("bundle is missing {0}")]
    MissingArtifact(PathBuf),

    /// Delivery to the node failed.
    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    /// A local bundle was required but the source is online-only.
    #[error("artifact source for {0} stages nothing locally")]
    NotLocal(String),
}

/// How artifacts reach the consuming node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// The destination node downloads directly.
    Online,
    /// Artifacts are staged locally and pushed to the node.
    Offline,
}

impl std::fmt::Display for StageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Paths of a verified local bundle.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    /// Directory holding the bundle.
    pub dir: PathBuf,
    /// The k3s binary.
    pub binary: PathBuf,
    /// The air-gap image tarball.
    pub images: PathBuf,
    /// The install script.
    pub install_script: PathBuf,
}

/// A staged artifact bundle.
///
/// Offline bundles carry verified local paths; online bundles only pin the
/// version the destination node must fetch.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    /// Requested installer version (e.g. `v1.30.2+k3s1`).
    pub version: String,
    /// Delivery mode.
    pub mode: StageMode,
    /// Verified local files, present iff `mode == Offline`.
    pub local: Option<LocalArtifacts>,
}

impl ArtifactBundle {
    /// An online bundle: nothing staged locally, version pinned.
    #[must_use]
    pub fn online(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            mode: StageMode::Online,
            local: None,
        }
    }

    /// An offline bundle over a verified directory.
    #[must_use]
    pub fn offline(version: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            version: version.into(),
            mode: StageMode::Offline,
            local: Some(LocalArtifacts {
                binary: dir.join(BINARY_NAME),
                images: dir.join(IMAGES_NAME),
                install_script: dir.join(INSTALL_SCRIPT_NAME),
                dir,
            }),
        }
    }

    /// The verified local artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::NotLocal`] for online bundles.
    pub fn local(&self) -> Result<&LocalArtifacts, StageError> {
        self.local
            .as_ref()
            .ok_or_else(|| StageError::NotLocal(self.version.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_bundle_has_no_local_paths() {
        let bundle = ArtifactBundle::online("v1.30.2+k3s1");
        assert_eq!(bundle.mode, StageMode::Online);
        assert!(bundle.local().is_err());
    }

    #[test]
    fn test_offline_bundle_paths() {
        let bundle = ArtifactBundle::offline("v1.30.2+k3s1", "/var/cache/forgelab/v1.30.2+k3s1");
        let local = bundle.local().unwrap();
        assert!(local.binary.ends_with(BINARY_NAME));
        assert!(local.images.ends_with(IMAGES_NAME));
        assert!(local.install_script.ends_with(INSTALL_SCRIPT_NAME));
    }
}
