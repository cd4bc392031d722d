pub mod baseline;
pub mod defs;

pub use baseline::BaselineInferenceModel;
pub use defs::*;
