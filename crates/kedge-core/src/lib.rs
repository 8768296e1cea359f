pub mod context;
pub mod engine;
pub mod error;
pub mod fixture;
pub mod io;
pub mod paths;
pub mod process;
pub(crate) mod provision;
pub mod readiness;
pub mod requirements;
pub mod secrets;

pub use error::{KedgeError, Result};
