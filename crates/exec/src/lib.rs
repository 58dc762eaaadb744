mod artifacts;
mod command;
mod docker;
mod executors;
mod logger;
mod paths;
mod utils;

pub use artifacts::{collect_artifacts, copy_tree};
pub use command::{Command, Log, LogType, Receiver};
pub use docker::Docker;
pub use executors::{ContainerExecutor, ShellExecutor, StepExecutor};
pub use logger::*;
pub use paths::{PathTryToString, StepPaths};
pub use utils::{create_executable_file, shell_quote};
