mod conditions;
mod script_runner;
mod stage;
mod types;
mod utils;
mod variables;

pub use conditions::*;
pub use script_runner::*;
pub use stage::*;
pub use types::*;
pub use utils::*;
pub use variables::*;

pub use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, Error>;
