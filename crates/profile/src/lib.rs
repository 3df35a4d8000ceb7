//! Profile ownership: the identity graph that groups aliases under a
//! canonical key, and the profile store with per-profile critical sections.

pub mod backend;
pub mod identity;
pub mod locks;
pub mod store;

pub use backend::{InMemoryBackend, ProfileBackend};
pub use identity::{IdentityGraph, Resolution, ResolveAttempt};
pub use locks::{LockSet, ProfileGuard, ProfileLocks};
pub use store::ProfileStore;
