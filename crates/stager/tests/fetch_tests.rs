//! Integration tests for the network-fetching source against a mock mirror.

use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stager::{ArtifactSource, NetworkFetch, StageMode};

const VERSION: &str = "v1.30.2+k3s1";

async fn mount_release(server: &MockServer, images: &[u8], expected_hits: u64) {
    let binary = b"fake-k3s-binary".as_slice();
    let sums = format!(
        "{}  k3s\n{}  k3s-airgap-images-amd64.tar.zst\n",
        hex::encode(Sha256::digest(binary)),
        hex::encode(Sha256::digest(images)),
    );

    let tag = "v1.30.2%2Bk3s1";
    for (asset, body) in [
        ("sha256sum-amd64.txt", sums.into_bytes()),
        ("k3s", binary.to_vec()),
        ("k3s-airgap-images-amd64.tar.zst", images.to_vec()),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/{tag}/{asset}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(expected_hits)
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/install.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\n"))
        .expect(expected_hits)
        .mount(server)
        .await;
}

#[tokio::test]
async fn fetch_downloads_verifies_and_caches_by_version() {
    let server = MockServer::start().await;
    mount_release(&server, b"fake-images", 1).await;

    let cache = tempfile::tempdir().unwrap();
    let source = NetworkFetch::new(VERSION, cache.path())
        .unwrap()
        .with_release_base(server.uri())
        .with_script_url(format!("{}/install.sh", server.uri()));

    let bundle = source.stage().await.unwrap();
    assert_eq!(bundle.mode, StageMode::Offline);
    assert_eq!(bundle.version, VERSION);

    let local = bundle.local().unwrap();
    assert!(local.dir.ends_with(VERSION));
    assert!(local.binary.exists());
    assert!(local.images.exists());
    assert!(local.install_script.exists());

    // Second stage with the same version must hit the cache, not the mirror;
    // the expect(1) on every mock enforces it.
    let again = source.stage().await.unwrap();
    assert_eq!(again.version, VERSION);
}

#[tokio::test]
async fn fetch_refuses_corrupted_download() {
    let server = MockServer::start().await;

    let sums = format!(
        "{}  k3s\n{}  k3s-airgap-images-amd64.tar.zst\n",
        hex::encode(Sha256::digest(b"genuine-binary")),
        hex::encode(Sha256::digest(b"genuine-images")),
    );

    let tag = "v1.30.2%2Bk3s1";
    for (asset, body) in [
        ("sha256sum-amd64.txt", sums.into_bytes()),
        ("k3s", b"genuine-binary".to_vec()),
        // Mirror serves a tarball that does not match the published digest.
        ("k3s-airgap-images-amd64.tar.zst", b"tampered".to_vec()),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/{tag}/{asset}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/install.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\n"))
        .mount(&server)
        .await;

    let cache = tempfile::tempdir().unwrap();
    let source = NetworkFetch::new(VERSION, cache.path())
        .unwrap()
        .with_release_base(server.uri())
        .with_script_url(format!("{}/install.sh", server.uri()));

    let err = source.stage().await.unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));
}
