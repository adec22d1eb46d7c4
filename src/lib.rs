#![forbid(unsafe_code)]

pub mod bbs;
pub mod definition;
pub mod engine;
pub mod error;
pub mod message;
pub mod monitor;
pub mod state;
pub mod telemetry;
pub mod vars;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::definition::{Definition, EventType, Exercise, Station};
pub use crate::engine::{Engine, ManualTrigger};
pub use crate::state::{Event, State};
