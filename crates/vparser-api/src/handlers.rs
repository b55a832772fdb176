//! Request handlers.

pub mod health;
pub mod requests;

pub use health::*;
pub use requests::*;
