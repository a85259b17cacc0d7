//! Core types for the Riptide engine.

mod ids;
mod kinds;

pub use ids::OpId;
pub use kinds::OpKind;
