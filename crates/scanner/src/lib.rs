mod config;
mod executor;
mod recovery;
mod repository;
mod server;
mod types;

pub use config::*;
pub use executor::*;
pub use recovery::*;
pub use repository::*;
pub use server::*;
pub use types::*;
