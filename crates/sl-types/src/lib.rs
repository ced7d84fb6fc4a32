pub mod config;
pub mod errors;
pub mod run;

pub use config::*;
pub use errors::*;
pub use run::*;
