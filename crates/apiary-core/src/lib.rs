pub mod canon;
pub mod config;
pub mod decision;
pub mod error;
pub mod event;
pub mod hash;
pub mod kind;
pub mod policy;
pub mod types;

pub use error::{KernelError, Result};
pub use kind::{DecodedKind, EntityKind, EventKind};
pub use types::*;
