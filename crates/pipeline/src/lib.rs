mod adapters;
mod build;
mod config;
mod docker_daemon;
mod error;
mod pipeline;
mod setup;
mod storage;
mod system_env;
mod task_yaml;

pub use adapters::*;
pub use build::*;
pub use config::*;
pub use docker_daemon::*;
pub use error::*;
pub use pipeline::*;
pub use setup::*;
pub use storage::*;
pub use system_env::*;
pub use task_yaml::*;
