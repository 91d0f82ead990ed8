//! inbox-pilot: a human-in-the-loop task pipeline over a directory vault.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod shutdown;
pub mod status;
pub mod vault;
