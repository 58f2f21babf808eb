//! Side-effecting parts of the engine: binary discovery, worker processes and
//! the configuration file.

pub mod config;
pub mod process;
pub mod resolver;
