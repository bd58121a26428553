//! Field descriptor tables.
//!
//! Each device class publishes a table of [`FieldDescriptor`]s describing the
//! fields of its class struct, and each driver may append fields of its own.
//! A descriptor carries typed accessor functions instead of a byte offset, so
//! generic code (autosave, the loopback server, `record.field` lookups) can
//! read and write any field without per-driver code.
//!
//! Array dimensions may be literal or a [`Dimension::Varargs`] reference to
//! an integer field assigned earlier in the same record description. The
//! reference is resolved once, when the record is created.

use super::datatype::FieldType;
use super::value::FieldValue;
use crate::error::{MxError, MxResult};
use crate::record::RecordBody;

/// Reads the current value of a field from a locked record body.
pub type FieldGetter = fn(&mut RecordBody) -> MxResult<FieldValue>;

/// Writes a field on a locked record body. Setters may trigger device
/// operations (writing `start` starts an acquisition).
pub type FieldSetter = fn(&mut RecordBody, FieldValue) -> MxResult<()>;

/// One entry of a field's dimension list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    /// Size known when the driver is written.
    Fixed(usize),
    /// Size taken from the runtime value of the named field.
    Varargs(&'static str),
}

/// Visibility and access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(u32);

impl FieldFlags {
    /// No flags set.
    pub const NONE: FieldFlags = FieldFlags(0);
    /// Field is read from the record description (configuration).
    pub const IN_DESCRIPTION: FieldFlags = FieldFlags(0x1);
    /// Field is shown in one-line record summaries.
    pub const IN_SUMMARY: FieldFlags = FieldFlags(0x2);
    /// Field rejects writes from generic field access.
    pub const READ_ONLY: FieldFlags = FieldFlags(0x4);
    /// Field is skipped by autosave snapshots.
    pub const NO_AUTOSAVE: FieldFlags = FieldFlags(0x8);

    /// Both sets of flags.
    pub const fn union(self, other: FieldFlags) -> FieldFlags {
        FieldFlags(self.0 | other.0)
    }

    /// True when every flag in `other` is set.
    pub const fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FieldFlags {
    type Output = FieldFlags;

    fn bitor(self, rhs: FieldFlags) -> FieldFlags {
        self.union(rhs)
    }
}

/// How a field's value is reached.
#[derive(Clone, Copy)]
pub enum FieldAccess {
    /// Field of the class struct, reached through typed accessors.
    Class {
        /// Reads the field.
        get: FieldGetter,
        /// Writes the field; `None` for read-only fields.
        set: Option<FieldSetter>,
    },
    /// Field of the driver's private state; delegated to
    /// [`crate::record::RecordDriver::read_type_field`] and
    /// [`crate::record::RecordDriver::write_type_field`].
    Driver,
}

impl std::fmt::Debug for FieldAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldAccess::Class { set, .. } => f
                .debug_struct("Class")
                .field("writable", &set.is_some())
                .finish(),
            FieldAccess::Driver => write!(f, "Driver"),
        }
    }
}

/// Static metadata for one field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name, unique within a record.
    pub name: &'static str,
    /// Element type.
    pub datatype: FieldType,
    /// Declared dimensions; empty for scalars.
    pub dimensions: Vec<Dimension>,
    /// Visibility and access flags.
    pub flags: FieldFlags,
    /// How the value is read and written.
    pub access: FieldAccess,
    /// Value assigned when a record description omits this field.
    pub default: Option<FieldValue>,
}

impl FieldDescriptor {
    /// Read-only class field.
    pub fn class(name: &'static str, datatype: FieldType, get: FieldGetter) -> Self {
        Self {
            name,
            datatype,
            dimensions: Vec::new(),
            flags: FieldFlags::NONE,
            access: FieldAccess::Class { get, set: None },
            default: None,
        }
    }

    /// Field held in driver-private state.
    pub fn driver(name: &'static str, datatype: FieldType) -> Self {
        Self {
            name,
            datatype,
            dimensions: Vec::new(),
            flags: FieldFlags::NONE,
            access: FieldAccess::Driver,
            default: None,
        }
    }

    /// Make a class field writable.
    pub fn with_setter(mut self, set: FieldSetter) -> Self {
        if let FieldAccess::Class { get, .. } = self.access {
            self.access = FieldAccess::Class {
                get,
                set: Some(set),
            };
        }
        self
    }

    /// Declare the field as an array.
    pub fn with_dimensions(mut self, dimensions: &[Dimension]) -> Self {
        self.dimensions = dimensions.to_vec();
        self
    }

    /// Add flags to the ones already set.
    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    /// Accept the field in record descriptions.
    pub fn in_description(self) -> Self {
        self.with_flags(FieldFlags::IN_DESCRIPTION)
    }

    /// Description field that takes `value` when the description leaves it
    /// out. The default counts as assigned, so later varargs dimensions can
    /// refer to it.
    pub fn with_default(mut self, value: FieldValue) -> Self {
        self.default = Some(value);
        self.in_description()
    }

    /// Whether generic field access may write this field.
    pub fn is_writable(&self) -> bool {
        if self.flags.contains(FieldFlags::READ_ONLY) {
            return false;
        }
        match self.access {
            FieldAccess::Class { set, .. } => set.is_some(),
            FieldAccess::Driver => true,
        }
    }
}

/// Values assigned so far while a record description is being parsed.
///
/// Keeps insertion order: a varargs dimension may only refer to a field that
/// was assigned before it.
#[derive(Debug, Clone, Default)]
pub struct FieldAssignments {
    values: Vec<(&'static str, FieldValue)>,
}

impl FieldAssignments {
    /// Empty assignment list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign or reassign a field.
    pub fn assign(&mut self, name: &'static str, value: FieldValue) {
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
    }

    /// Value assigned to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Assigned value of a description field, or a `NotFound` error.
    pub fn require(&self, name: &str) -> MxResult<&FieldValue> {
        self.get(name).ok_or_else(|| {
            MxError::not_found(
                "create_record_structures",
                format!("description field '{}' was not assigned", name),
            )
        })
    }

    /// Assigned value as `f64`, or `default` when unassigned.
    pub fn f64_or(&self, name: &str, default: f64) -> MxResult<f64> {
        self.get(name).map_or(Ok(default), FieldValue::as_f64)
    }

    /// Assigned value as `usize`, or `default` when unassigned.
    pub fn usize_or(&self, name: &str, default: usize) -> MxResult<usize> {
        self.get(name).map_or(Ok(default), FieldValue::as_usize)
    }

    /// Assigned value as a string, or `default` when unassigned.
    pub fn string_or(&self, name: &str, default: &str) -> MxResult<String> {
        match self.get(name) {
            Some(value) => value.as_str().map(str::to_owned),
            None => Ok(default.to_owned()),
        }
    }

    /// Assignments in the order they were made.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.values.iter().map(|(n, v)| (*n, v))
    }
}

/// Resolve one dimension entry against the assignments made so far.
///
/// A varargs reference to a field that has not been assigned yet is an
/// `IllegalArgument` error.
pub fn resolve_dimension(dimension: &Dimension, assigned: &FieldAssignments) -> MxResult<usize> {
    match dimension {
        Dimension::Fixed(size) => Ok(*size),
        Dimension::Varargs(field) => {
            let value = assigned.get(field).ok_or_else(|| {
                MxError::illegal_argument(
                    "resolve_dimension",
                    format!(
                        "varargs dimension refers to field '{}' which has not been assigned yet",
                        field
                    ),
                )
            })?;
            value.as_usize().map_err(|err| {
                MxError::illegal_argument(
                    "resolve_dimension",
                    format!("field '{}' cannot size an array: {}", field, err.message),
                )
            })
        }
    }
}

/// Resolve a full dimension list.
pub fn resolve_dimensions(
    dimensions: &[Dimension],
    assigned: &FieldAssignments,
) -> MxResult<Vec<usize>> {
    dimensions
        .iter()
        .map(|d| resolve_dimension(d, assigned))
        .collect()
}

/// A descriptor together with the dimensions resolved at record creation.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    /// Static metadata.
    pub descriptor: FieldDescriptor,
    /// Concrete dimensions for this record.
    pub dims: Vec<usize>,
}

impl ResolvedField {
    /// Field name.
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Element type.
    pub fn datatype(&self) -> FieldType {
        self.descriptor.datatype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn varargs_before_assignment_is_illegal() {
        let assigned = FieldAssignments::new();
        let err = resolve_dimension(&Dimension::Varargs("maximum_num_channels"), &assigned)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn varargs_after_assignment_equals_value() {
        let mut assigned = FieldAssignments::new();
        assigned.assign("maximum_num_channels", FieldValue::long(2048));
        let size =
            resolve_dimension(&Dimension::Varargs("maximum_num_channels"), &assigned).unwrap();
        assert_eq!(size, 2048);
    }

    #[test]
    fn varargs_rejects_negative_sizes() {
        let mut assigned = FieldAssignments::new();
        assigned.assign("n", FieldValue::long(-3));
        let err = resolve_dimension(&Dimension::Varargs("n"), &assigned).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalArgument);
    }

    #[test]
    fn mixed_dimension_lists() {
        let mut assigned = FieldAssignments::new();
        assigned.assign("rows", FieldValue::uint(4));
        let dims = resolve_dimensions(
            &[Dimension::Varargs("rows"), Dimension::Fixed(2)],
            &assigned,
        )
        .unwrap();
        assert_eq!(dims, vec![4, 2]);
    }

    #[test]
    fn default_marks_the_field_as_a_description_field() {
        let descriptor = FieldDescriptor::driver("count", FieldType::ULong)
            .with_default(FieldValue::ulong(3));
        assert!(descriptor.flags.contains(FieldFlags::IN_DESCRIPTION));
        assert_eq!(descriptor.default, Some(FieldValue::ulong(3)));
    }

    #[test]
    fn flags_combine() {
        let flags = FieldFlags::IN_DESCRIPTION | FieldFlags::IN_SUMMARY;
        assert!(flags.contains(FieldFlags::IN_SUMMARY));
        assert!(!flags.contains(FieldFlags::READ_ONLY));
    }
}
