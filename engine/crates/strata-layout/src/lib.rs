pub mod access;
pub mod descriptor;
pub mod error;
pub mod rules;

pub use access::{AccessStep, FieldAccess};
pub use descriptor::{FieldRange, FieldType, LayoutDescriptor, LayoutField, LayoutFieldDesc};
pub use error::LayoutError;
pub use rules::{LayoutRules, PrimitiveKind, round_up};
