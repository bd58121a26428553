//! Field reflection model: datatypes, values, and descriptor tables.

pub mod datatype;
pub mod descriptor;
pub mod value;

pub use datatype::{ElementKind, FieldType};
pub use descriptor::{
    resolve_dimension, resolve_dimensions, Dimension, FieldAccess, FieldAssignments,
    FieldDescriptor, FieldFlags, FieldGetter, FieldSetter, ResolvedField,
};
pub use value::{element_count, Elements, FieldValue};
