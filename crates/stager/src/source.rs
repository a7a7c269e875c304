//! Artifact source implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, info};

use crate::bundle::{
    ArtifactBundle, StageError, StageMode, BINARY_NAME, IMAGES_NAME, INSTALL_SCRIPT_NAME,
    SUMS_NAME,
};
use crate::checksum::{parse_sums, verify_against};

/// Default release download base.
const DEFAULT_RELEASE_BASE: &str = "https://github.com/k3s-io/k3s/releases/download";

/// Default install script URL.
pub const DEFAULT_INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";

/// Download timeout; the image tarball is large.
const DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// One way of acquiring installer artifacts, chosen once by configuration.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// The pinned installer version.
    fn version(&self) -> &str;

    /// Whether nodes fetch directly or receive a pushed bundle.
    fn mode(&self) -> StageMode;

    /// Produce a staged bundle for the pinned version.
    ///
    /// Offline sources verify every artifact's checksum before returning;
    /// a bundle that fails verification is never returned.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] on download, I/O, or integrity failure.
    async fn stage(&self) -> Result<ArtifactBundle, StageError>;
}

/// Online source: the destination node downloads directly.
///
/// Nothing is staged locally; the node runs the vendor install script with
/// the version pinned, so both modes converge on the identical version.
pub struct NodeDirect {
    version: String,
    script_url: String,
}

impl NodeDirect {
    /// Create an online source for `version`.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            script_url: DEFAULT_INSTALL_SCRIPT_URL.to_string(),
        }
    }

    /// Override the install script URL (private mirror).
    #[must_use]
    pub fn with_script_url(mut self, url: impl Into<String>) -> Self {
        self.script_url = url.into();
        self
    }

    /// The install script URL nodes fetch.
    #[must_use]
    pub fn script_url(&self) -> &str {
        &self.script_url
    }
}

#[async_trait]
impl ArtifactSource for NodeDirect {
    fn version(&self) -> &str {
        &self.version
    }

    fn mode(&self) -> StageMode {
        StageMode::Online
    }

    async fn stage(&self) -> Result<ArtifactBundle, StageError> {
        debug!(version = %self.version, "online staging, fetch delegated to node");
        Ok(ArtifactBundle::online(&self.version))
    }
}

/// Offline source that downloads once on a connected staging host.
///
/// Artifacts land in a version-keyed cache directory; a later run with the
/// same version re-verifies the cached files and skips the download.
pub struct NetworkFetch {
    version: String,
    cache_dir: PathBuf,
    release_base: String,
    script_url: String,
    client: Client,
}

impl NetworkFetch {
    /// Create a fetching source caching under `cache_dir/<version>/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        version: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, StageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            version: version.into(),
            cache_dir: cache_dir.into(),
            release_base: DEFAULT_RELEASE_BASE.to_string(),
            script_url: DEFAULT_INSTALL_SCRIPT_URL.to_string(),
            client,
        })
    }

    /// Override the release download base (private registry mirror).
    #[must_use]
    pub fn with_release_base(mut self, base: impl Into<String>) -> Self {
        self.release_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the install script URL.
    #[must_use]
    pub fn with_script_url(mut self, url: impl Into<String>) -> Self {
        self.script_url = url.into();
        self
    }

    /// The version-keyed bundle directory.
    #[must_use]
    pub fn bundle_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.version)
    }

    fn release_url(&self, asset: &str) -> String {
        // '+' in the version tag must be escaped in the release path.
        let tag = self.version.replace('+', "%2B");
        format!("{}/{tag}/{asset}", self.release_base)
    }

    /// Download `url` to `dest` via a temp file.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), StageError> {
        info!(%url, dest = %dest.display(), "downloading");

        let response = self.client.get(url).send().await?.error_for_status()?;

        let tmp = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StageError::Io {
                path: tmp.clone(),
                source: e,
            })?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| StageError::Io {
                    path: tmp.clone(),
                    source: e,
                })?;
        }
        drop(file);

        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| StageError::Io {
                path: dest.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }

    /// Whether the cached bundle already verifies.
    fn cache_is_valid(&self, dir: &Path) -> bool {
        verify_bundle_dir(dir).is_ok()
    }
}

#[async_trait]
impl ArtifactSource for NetworkFetch {
    fn version(&self) -> &str {
        &self.version
    }

    fn mode(&self) -> StageMode {
        StageMode::Offline
    }

    async fn stage(&self) -> Result<ArtifactBundle, StageError> {
        let dir = self.bundle_dir();

        if self.cache_is_valid(&dir) {
            info!(version = %self.version, dir = %dir.display(), "bundle cache hit");
            return Ok(ArtifactBundle::offline(&self.version, dir));
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StageError::Io {
                path: dir.clone(),
                source: e,
            })?;

        self.download(&self.release_url(SUMS_NAME), &dir.join(SUMS_NAME))
            .await?;
        self.download(&self.release_url(BINARY_NAME), &dir.join(BINARY_NAME))
            .await?;
        self.download(&self.release_url(IMAGES_NAME), &dir.join(IMAGES_NAME))
            .await?;
        self.download(&self.script_url, &dir.join(INSTALL_SCRIPT_NAME))
            .await?;

        verify_bundle_dir(&dir)?;

        info!(version = %self.version, dir = %dir.display(), "bundle staged and verified");
        Ok(ArtifactBundle::offline(&self.version, dir))
    }
}

/// Offline source over an operator-transferred bundle directory.
///
/// For air-gapped sites: the bundle arrives out-of-band; this source only
/// verifies it and never fetches.
pub struct PreStaged {
    version: String,
    dir: PathBuf,
}

impl PreStaged {
    /// Create a verify-only source over `dir`.
    #[must_use]
    pub fn new(version: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactSource for PreStaged {
    fn version(&self) -> &str {
        &self.version
    }

    fn mode(&self) -> StageMode {
        StageMode::Offline
    }

    async fn stage(&self) -> Result<ArtifactBundle, StageError> {
        verify_bundle_dir(&self.dir)?;
        info!(version = %self.version, dir = %self.dir.display(), "pre-staged bundle verified");
        Ok(ArtifactBundle::offline(&self.version, self.dir.clone()))
    }
}

/// Verify that `dir` holds a complete bundle whose digests match the
/// published checksum list.
fn verify_bundle_dir(dir: &Path) -> Result<(), StageError> {
    let sums_path = dir.join(SUMS_NAME);
    for name in [SUMS_NAME, BINARY_NAME, IMAGES_NAME, INSTALL_SCRIPT_NAME] {
        let path = dir.join(name);
        if !path.exists() {
            return Err(StageError::MissingArtifact(path));
        }
    }

    let text = std::fs::read_to_string(&sums_path).map_err(|e| StageError::Io {
        path: sums_path,
        source: e,
    })?;
    let sums = parse_sums(&text);

    verify_against(&sums, BINARY_NAME, &dir.join(BINARY_NAME))?;
    verify_against(&sums, IMAGES_NAME, &dir.join(IMAGES_NAME))?;
    // The install script is not covered by the release checksum list; its
    // presence is all that can be asserted here.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Write;

    fn write_bundle(dir: &Path, binary: &[u8], images: &[u8], tamper: bool) {
        let sums = format!(
            "{}  {BINARY_NAME}\n{}  {IMAGES_NAME}\n",
            hex::encode(Sha256::digest(binary)),
            hex::encode(Sha256::digest(if tamper { b"other".as_slice() } else { images })),
        );
        std::fs::write(dir.join(SUMS_NAME), sums).unwrap();
        std::fs::write(dir.join(BINARY_NAME), binary).unwrap();
        std::fs::write(dir.join(IMAGES_NAME), images).unwrap();
        let mut script = std::fs::File::create(dir.join(INSTALL_SCRIPT_NAME)).unwrap();
        script.write_all(b"#!/bin/sh\n").unwrap();
    }

    #[tokio::test]
    async fn prestaged_verifies_good_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), b"binary", b"images", false);

        let source = PreStaged::new("v1.30.2+k3s1", dir.path());
        let bundle = source.stage().await.unwrap();
        assert_eq!(bundle.mode, StageMode::Offline);
        assert_eq!(bundle.version, "v1.30.2+k3s1");
        assert!(bundle.local().unwrap().binary.exists());
    }

    #[tokio::test]
    async fn prestaged_rejects_tampered_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), b"binary", b"images", true);

        let source = PreStaged::new("v1.30.2+k3s1", dir.path());
        let err = source.stage().await.unwrap_err();
        assert!(matches!(err, StageError::Integrity { .. }));
    }

    #[tokio::test]
    async fn prestaged_rejects_incomplete_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BINARY_NAME), b"binary").unwrap();

        let source = PreStaged::new("v1.30.2+k3s1", dir.path());
        let err = source.stage().await.unwrap_err();
        assert!(matches!(err, StageError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn node_direct_pins_version_only() {
        let source = NodeDirect::new("v1.30.2+k3s1");
        let bundle = source.stage().await.unwrap();
        assert_eq!(bundle.mode, StageMode::Online);
        assert_eq!(bundle.version, "v1.30.2+k3s1");
    }

    #[test]
    fn release_url_escapes_version_tag() {
        let dir = tempfile::tempdir().unwrap();
        let source = NetworkFetch::new("v1.30.2+k3s1", dir.path()).unwrap();
        assert_eq!(
            source.release_url("k3s"),
            "https://github.com/k3s-io/k3s/releases/download/v1.30.2%2Bk3s1/k3s"
        );
    }
}
