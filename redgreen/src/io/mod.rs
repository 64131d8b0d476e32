//! Side-effecting helpers: state document, files, test processes, HTTP.

pub mod checkpoint;
pub mod config;
pub mod consult;
pub mod files;
pub mod normalizer;
pub mod process;
pub mod state_store;
