#[macro_use]
extern crate tracing;

pub mod cache;
pub mod context;
pub mod dns;
pub mod reconcile;
pub mod registry;
pub mod resources;
