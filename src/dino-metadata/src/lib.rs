mod client;
mod remote;
mod server;

pub use client::*;
pub use remote::*;
pub use server::*;
