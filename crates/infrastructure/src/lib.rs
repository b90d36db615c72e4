pub mod client;
pub mod memory;
pub mod models;
pub mod rest;

pub use client::*;
pub use memory::*;
pub use models::*;
pub use rest::*;
