mod conversation;
pub mod provider;

pub use conversation::*;
