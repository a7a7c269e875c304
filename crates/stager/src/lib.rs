//! Artifact staging for Forge Lab.
//!
//! Acquires and delivers the cluster installer artifacts (binary, air-gap
//! image tarball, install script) for both internet-connected and air-gapped
//! targets. Selection happens once, by configuration, behind the
//! [`ArtifactSource`] trait:
//!
//! - [`NodeDirect`] — online: the destination node fetches directly, pinned
//!   to the requested version.
//! - [`NetworkFetch`] — downloads once on a connected staging host into a
//!   version-keyed cache, verifies checksums, and serves the local bundle.
//! - [`PreStaged`] — an operator-transferred bundle directory for fully
//!   air-gapped sites; verified, never fetched.
//!
//! A bundle is never pushed or imported unless its checksums match.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bundle;
pub mod checksum;
pub mod push;
pub mod source;

pub use bundle::{ArtifactBundle, LocalArtifacts, StageError, StageMode};
pub use push::push;
pub use source::{ArtifactSource, NetworkFetch, NodeDirect, PreStaged};
