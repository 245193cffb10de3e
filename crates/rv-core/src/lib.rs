#![deny(unreachable_pub)]

//! Leaf pieces shared by the `rv` CLI: typed errors, local configuration,
//! the static GPU table, walltime parsing, and the local JSON hint stores.

pub mod config;
pub mod error;
pub mod gpu;
pub mod sanitize;
pub mod stores;
pub mod timefmt;

pub use config::Config;
pub use error::RvError;
pub use gpu::{GpuSpec, GpuType};
