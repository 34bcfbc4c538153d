//! Firmups Keys - Device key lifecycle
//!
//! Every (device, key type) pair owns a *key ring*: at most one ACTIVE key,
//! at most one NEXT key, and any number of EXPIRED keys kept for audit.
//!
//! ## Rotation
//!
//! ```text
//! Unprovisioned --provision--> Active --begin_rotation--> Rotating
//!                                ^                           |
//!                                +------commit_rotation------+
//! ```
//!
//! Rings are immutable snapshots. Each transition returns a new ring with a
//! bumped revision, and the [`KeyLifecycleManager`] persists it through a
//! compare-and-swap on the [`KeyStore`], so a commit flips ACTIVE and NEXT in
//! one write and a reader never sees zero or two ACTIVE keys.
//!
//! The only way a ring ends up without an ACTIVE key after provisioning is a
//! TLS certificate that outlived its validity window (`Lapsed`).

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod manager;
pub mod memory;
pub mod ring;
pub mod store;

// Re-exports
pub use error::{KeyLifecycleError, Result};
pub use manager::{KeyLifecycleManager, RotationCommit};
pub use memory::InMemoryKeyStore;
pub use ring::{ExpiryOutcome, KeyRing, KeyRingState};
pub use store::{IssueError, IssuePolicy, KeyIssuer, KeyStore};
