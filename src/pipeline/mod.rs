//! Pipeline module - stage orchestration and command templating.

mod stage;
mod template;

pub use stage::*;
pub use template::*;
