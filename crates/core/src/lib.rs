//! Shared data model, error taxonomy, configuration and collaborator
//! interfaces for the customer profile platform.

pub mod clock;
pub mod config;
pub mod erasure;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{days_between, Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use erasure::{CancelFlag, ErasureParticipant};
pub use error::{CdpError, CdpResult};
pub use types::{Alias, Customer, IdentityNamespace, ProfileView, Segment};
