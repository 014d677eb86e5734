mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_SELECTED_MODELS};
pub use selectors::{AnalyzerSelection, ModelSelector, FALLBACK_ANALYZER};
