//! devherd library
//!
//! Entry points of the `devherd` binary. Supervision itself lives in
//! `devherd-app`; this crate adds the command-line surfaces.

pub mod commands;
pub mod headless;

// Re-export main entry points
pub use commands::{print_status, run_check};
pub use headless::runner::run_headless;
