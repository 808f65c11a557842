pub mod distribution;
pub mod errors;
pub mod job;
pub mod params;
pub mod settings;

pub use distribution::*;
pub use errors::*;
pub use job::*;
pub use params::*;
pub use settings::*;
