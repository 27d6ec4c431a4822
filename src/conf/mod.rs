//! The static daemon layout and the views of which daemons are currently present.

mod configuration;
mod view;

pub use configuration::*;
pub use view::*;
