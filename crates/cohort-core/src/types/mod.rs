//! Core types for Cohort

mod member;
mod message;
mod node;
mod weights;

pub use member::*;
pub use message::*;
pub use node::*;
pub use weights::*;
