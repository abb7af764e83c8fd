pub mod bridge;
pub mod classify;
pub mod config;
pub mod error;
pub mod feature;
pub mod gate;
pub mod io;
pub mod lock;
pub mod paths;
pub mod process;
pub mod registry;
pub mod runner;
pub mod session;
pub mod store;
pub mod types;

pub use error::{HarnessError, Result};
