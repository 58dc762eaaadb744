mod blob;
mod events;
mod git;
mod scanner;

pub use blob::*;
pub use events::*;
pub use git::*;
pub use scanner::*;
