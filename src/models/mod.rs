//! Domain models for the release registry.
//!
//! # Core Concepts
//!
//! ## Authoritative Records
//!
//! - [`Game`]: The release container. Points at its latest and live versions,
//!   carries the kill-switch and rollout percentage.
//! - [`Version`]: One build of a game, moved through [`VersionStatus`] by the
//!   release pipeline. Soft-deleted only.
//! - [`AuditEntry`]: Append-only record of accepted actions, expired after a
//!   retention window.
//!
//! ## Derived Projection
//!
//! - [`RegistrySnapshot`] / [`RegistryEntry`]: The consumer-facing catalog,
//!   rebuilt from games and versions and safe to discard at any time.

mod audit;
mod game;
mod registry;
mod version;

pub use audit::*;
pub use game::*;
pub use registry::*;
pub use version::*;
