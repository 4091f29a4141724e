pub mod broker;
pub mod task;

pub use broker::*;
pub use task::*;
