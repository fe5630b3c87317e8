mod config;
mod daemon;
mod factory;
mod ino;
mod metadata;
mod node;

pub use config::*;
pub use daemon::*;
pub use factory::*;
pub use ino::ROOT_INO;
pub use node::*;

#[cfg(test)]
mod node_tests;
