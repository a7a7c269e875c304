//! Bundle delivery to a node.
//!
//! Pushes a verified offline bundle over the remote executor and performs
//! the on-node import: the binary lands on the PATH and the image tarball
//! lands in the images directory the node's containerd imports on start.
//! Runs before any installer on the node.

use remote::{Executor, RemoteCommand};
use tracing::info;

use crate::bundle::{ArtifactBundle, StageError};

/// Where the k3s binary is installed on a node.
pub const NODE_BINARY_PATH: &str = "/usr/local/bin/k3s";

/// Images directory the node's local store imports from.
pub const NODE_IMAGES_DIR: &str = "/var/lib/rancher/k3s/agent/images";

/// Where the install script is staged on a node.
pub const NODE_INSTALL_SCRIPT: &str = "/tmp/k3s-install.sh";

const TMP_BINARY: &str = "/tmp/forgelab-k3s";
const TMP_IMAGES: &str = "/tmp/forgelab-airgap-images.tar.zst";

/// Push a verified offline bundle to the node and import it.
///
/// # Errors
///
/// Returns [`StageError::NotLocal`] for online bundles and a
/// [`StageError::Remote`] for transfer/import failures.
pub fn push(bundle: &ArtifactBundle, exec: &dyn Executor) -> Result<(), StageError> {
    let local = bundle.local()?;

    info!(
        host = exec.host(),
        version = %bundle.version,
        "pushing artifact bundle"
    );

    exec.copy(&local.binary, TMP_BINARY, 0o644)?;
    exec.copy(&local.images, TMP_IMAGES, 0o644)?;
    exec.copy(&local.install_script, NODE_INSTALL_SCRIPT, 0o755)?;

    // Import: binary onto the PATH, tarball into the image store directory.
    exec.execute_ok(
        &RemoteCommand::new("install")
            .args(["-m", "0755", TMP_BINARY, NODE_BINARY_PATH])
            .sudo(),
    )?;
    exec.execute_ok(&RemoteCommand::new("mkdir").args(["-p", NODE_IMAGES_DIR]).sudo())?;
    exec.execute_ok(
        &RemoteCommand::new("mv")
            .args([
                TMP_IMAGES,
                &format!("{NODE_IMAGES_DIR}/k3s-airgap-images-amd64.tar.zst"),
            ])
            .sudo(),
    )?;

    info!(host = exec.host(), "bundle imported");
    Ok(())
}
