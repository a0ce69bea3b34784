pub mod config;
pub mod error;
pub mod locations;
pub mod run;
pub mod tree;
pub mod watch;

pub use error::{Error, Result};
