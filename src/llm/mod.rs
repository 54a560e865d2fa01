pub mod backend;
#[cfg(feature = "http")]
pub mod client;
pub mod prompts;
pub mod resilient;
pub mod resolver;
pub mod types;
pub mod utils;

pub use backend::*;
#[cfg(feature = "http")]
pub use client::*;
pub use resilient::*;
pub use resolver::*;
pub use types::*;
