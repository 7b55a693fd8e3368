pub mod archive;
pub mod build_op;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fetch;
pub mod interrupt;
pub mod pipeline;
pub mod publish;
pub mod session;
pub mod stage;
pub mod store;
pub mod unpack;
pub mod verify;
pub mod workspace;

pub use error::{Error, Result};
