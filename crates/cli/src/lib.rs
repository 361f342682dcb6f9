//! Command-line front end for the session manager runtime.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
