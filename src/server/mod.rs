mod daemon;
mod reader;
pub mod settings;
mod writer;

pub use daemon::*;
pub use settings::*;
