mod buildpack;
mod buildx;
mod builder;
mod cache;
mod command;
mod digest;
mod k8s;
mod liveness;
mod registry;
mod runner;

pub use buildpack::*;
pub use buildx::*;
pub use builder::*;
pub use cache::*;
pub use command::*;
pub use digest::*;
pub use k8s::*;
pub use liveness::*;
pub use registry::*;
pub use runner::*;
