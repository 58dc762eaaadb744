mod condition;
mod envs;
mod error;
mod events;
mod plugin_artifact;
mod stage;
mod step;
mod variable;
mod workflow_request;

pub use condition::*;
pub use envs::*;
pub use error::*;
pub use events::*;
pub use plugin_artifact::*;
pub use stage::*;
pub use step::*;
pub use variable::*;
pub use workflow_request::*;
