pub mod config;
pub mod events;
pub mod prediction;
pub mod prompts;
pub mod runs;

pub use config::Settings;
pub use prediction::{Label, Prediction};
