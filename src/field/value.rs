//! Typed field values.
//!
//! Every value is an N-dimensional array: a scalar has no dimensions and
//! exactly one element. The element count always equals the product of the
//! dimensions, and the storage class of [`Elements`] always matches the
//! [`FieldType`]'s [`ElementKind`].

use serde::{Deserialize, Serialize};

use super::datatype::{ElementKind, FieldType};
use crate::error::{MxError, MxResult};

/// Flat element storage, one variant per storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Elements {
    /// Storage for `char`.
    Char(Vec<i8>),
    /// Storage for `uchar`.
    UChar(Vec<u8>),
    /// Storage for `short`.
    Short(Vec<i16>),
    /// Storage for `ushort`.
    UShort(Vec<u16>),
    /// Storage for `int`.
    Int(Vec<i32>),
    /// Storage for `uint`.
    UInt(Vec<u32>),
    /// Storage for `long`.
    Long(Vec<i64>),
    /// Storage for `ulong` and `hex`.
    ULong(Vec<u64>),
    /// Storage for `float`.
    Float(Vec<f32>),
    /// Storage for `double`.
    Double(Vec<f64>),
    /// Storage for `bool`.
    Bool(Vec<bool>),
    /// Storage for `string` and `record`.
    String(Vec<String>),
}

/// Apply the same expression to whichever vector an [`Elements`] holds.
macro_rules! each_elements {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            Elements::Char($v) => $body,
            Elements::UChar($v) => $body,
            Elements::Short($v) => $body,
            Elements::UShort($v) => $body,
            Elements::Int($v) => $body,
            Elements::UInt($v) => $body,
            Elements::Long($v) => $body,
            Elements::ULong($v) => $body,
            Elements::Float($v) => $body,
            Elements::Double($v) => $body,
            Elements::Bool($v) => $body,
            Elements::String($v) => $body,
        }
    };
}

pub(crate) use each_elements;

impl Elements {
    /// `count` zero, false or empty elements of `kind`.
    pub fn zeroed(kind: ElementKind, count: usize) -> Self {
        match kind {
            ElementKind::Char => Elements::Char(vec![0; count]),
            ElementKind::UChar => Elements::UChar(vec![0; count]),
            ElementKind::Short => Elements::Short(vec![0; count]),
            ElementKind::UShort => Elements::UShort(vec![0; count]),
            ElementKind::Int => Elements::Int(vec![0; count]),
            ElementKind::UInt => Elements::UInt(vec![0; count]),
            ElementKind::Long => Elements::Long(vec![0; count]),
            ElementKind::ULong => Elements::ULong(vec![0; count]),
            ElementKind::Float => Elements::Float(vec![0.0; count]),
            ElementKind::Double => Elements::Double(vec![0.0; count]),
            ElementKind::Bool => Elements::Bool(vec![false; count]),
            ElementKind::String => Elements::String(vec![String::new(); count]),
        }
    }

    /// Storage class held.
    pub fn kind(&self) -> ElementKind {
        match self {
            Elements::Char(_) => ElementKind::Char,
            Elements::UChar(_) => ElementKind::UChar,
            Elements::Short(_) => ElementKind::Short,
            Elements::UShort(_) => ElementKind::UShort,
            Elements::Int(_) => ElementKind::Int,
            Elements::UInt(_) => ElementKind::UInt,
            Elements::Long(_) => ElementKind::Long,
            Elements::ULong(_) => ElementKind::ULong,
            Elements::Float(_) => ElementKind::Float,
            Elements::Double(_) => ElementKind::Double,
            Elements::Bool(_) => ElementKind::Bool,
            Elements::String(_) => ElementKind::String,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        each_elements!(self, v => v.len())
    }

    /// True when there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything after the first `count` elements.
    pub fn truncate(&mut self, count: usize) {
        each_elements!(self, v => v.truncate(count))
    }

    /// Grow with default elements or shrink to `count`.
    pub fn resize(&mut self, count: usize) {
        each_elements!(self, v => v.resize(count, Default::default()))
    }
}

/// Element count implied by a dimension list. Scalars (no dimensions) hold one.
pub fn element_count(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// For each row-major index of an array shaped `current`, whether it lies
/// inside the leading `wanted` block.
fn inside_mask(current: &[usize], wanted: &[usize]) -> Vec<bool> {
    (0..element_count(current))
        .map(|flat| {
            let mut rest = flat;
            current.iter().zip(wanted).rev().all(|(&have, &keep)| {
                let coordinate = rest % have;
                rest /= have;
                coordinate < keep
            })
        })
        .collect()
}

/// A typed, shaped field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    datatype: FieldType,
    dims: Vec<usize>,
    elements: Elements,
}

impl FieldValue {
    /// Build a value, checking storage class and element count.
    pub fn new(datatype: FieldType, dims: Vec<usize>, elements: Elements) -> MxResult<Self> {
        if datatype.element_kind() != elements.kind() {
            return Err(MxError::type_mismatch(
                "field_value",
                format!(
                    "{:?} elements cannot hold a {} value",
                    elements.kind(),
                    datatype
                ),
            ));
        }
        let expected = element_count(&dims);
        if elements.len() != expected {
            return Err(MxError::illegal_argument(
                "field_value",
                format!(
                    "{} elements supplied for dimensions {:?} ({} expected)",
                    elements.len(),
                    dims,
                    expected
                ),
            ));
        }
        Ok(Self {
            datatype,
            dims,
            elements,
        })
    }

    /// Zero-filled value of the given shape.
    pub fn zeroed(datatype: FieldType, dims: Vec<usize>) -> Self {
        let elements = Elements::zeroed(datatype.element_kind(), element_count(&dims));
        Self {
            datatype,
            dims,
            elements,
        }
    }

    /// One-dimensional array of the given elements.
    pub fn array(datatype: FieldType, elements: Elements) -> MxResult<Self> {
        let dims = vec![elements.len()];
        Self::new(datatype, dims, elements)
    }

    fn scalar_unchecked(datatype: FieldType, elements: Elements) -> Self {
        Self {
            datatype,
            dims: Vec::new(),
            elements,
        }
    }

    /// Scalar string.
    pub fn string(value: impl Into<String>) -> Self {
        Self::scalar_unchecked(FieldType::String, Elements::String(vec![value.into()]))
    }

    /// Scalar reference to the record `name`.
    pub fn record_ref(name: impl Into<String>) -> Self {
        Self::scalar_unchecked(FieldType::RecordRef, Elements::String(vec![name.into()]))
    }

    /// Scalar `bool`.
    pub fn bool(value: bool) -> Self {
        Self::scalar_unchecked(FieldType::Bool, Elements::Bool(vec![value]))
    }

    /// Scalar `int`.
    pub fn int(value: i32) -> Self {
        Self::scalar_unchecked(FieldType::Int, Elements::Int(vec![value]))
    }

    /// Scalar `uint`.
    pub fn uint(value: u32) -> Self {
        Self::scalar_unchecked(FieldType::UInt, Elements::UInt(vec![value]))
    }

    /// Scalar `long`.
    pub fn long(value: i64) -> Self {
        Self::scalar_unchecked(FieldType::Long, Elements::Long(vec![value]))
    }

    /// Scalar `ulong`.
    pub fn ulong(value: u64) -> Self {
        Self::scalar_unchecked(FieldType::ULong, Elements::ULong(vec![value]))
    }

    /// Scalar `hex`.
    pub fn hex(value: u64) -> Self {
        Self::scalar_unchecked(FieldType::Hex, Elements::ULong(vec![value]))
    }

    /// Scalar `float`.
    pub fn float(value: f32) -> Self {
        Self::scalar_unchecked(FieldType::Float, Elements::Float(vec![value]))
    }

    /// Scalar `double`.
    pub fn double(value: f64) -> Self {
        Self::scalar_unchecked(FieldType::Double, Elements::Double(vec![value]))
    }

    /// One-dimensional `uint` array.
    pub fn uint_array(values: Vec<u32>) -> Self {
        Self {
            datatype: FieldType::UInt,
            dims: vec![values.len()],
            elements: Elements::UInt(values),
        }
    }

    /// One-dimensional `long` array.
    pub fn long_array(values: Vec<i64>) -> Self {
        Self {
            datatype: FieldType::Long,
            dims: vec![values.len()],
            elements: Elements::Long(values),
        }
    }

    /// One-dimensional `ulong` array.
    pub fn ulong_array(values: Vec<u64>) -> Self {
        Self {
            datatype: FieldType::ULong,
            dims: vec![values.len()],
            elements: Elements::ULong(values),
        }
    }

    /// One-dimensional `double` array.
    pub fn double_array(values: Vec<f64>) -> Self {
        Self {
            datatype: FieldType::Double,
            dims: vec![values.len()],
            elements: Elements::Double(values),
        }
    }

    /// Declared type.
    pub fn datatype(&self) -> FieldType {
        self.datatype
    }

    /// Dimensions; empty for a scalar.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Flat elements in row-major order.
    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    /// Take the flat elements.
    pub fn into_elements(self) -> Elements {
        self.elements
    }

    /// Number of elements, the product of the dimensions.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// True for a scalar.
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Cut the value down to the leading `dims[i]` entries along each axis.
    ///
    /// Elements are copied row by row, so shrinking an inner axis keeps the
    /// matching column of every row. `dims` must have the value's rank and no
    /// axis may grow.
    pub fn truncated(self, dims: &[usize]) -> MxResult<Self> {
        const OP: &str = "field_value_truncate";
        let Self {
            datatype,
            dims: current,
            mut elements,
        } = self;
        if dims.len() != current.len() {
            return Err(MxError::illegal_argument(
                OP,
                format!(
                    "cannot view a {}-dimensional value as {:?}",
                    current.len(),
                    dims
                ),
            ));
        }
        if dims.iter().zip(&current).any(|(wanted, have)| wanted > have) {
            return Err(MxError::would_exceed_limit(
                OP,
                format!("requested {:?} but the value is only {:?}", dims, current),
            ));
        }
        if dims != current.as_slice() {
            let keep = inside_mask(&current, dims);
            let mut position = 0;
            each_elements!(&mut elements, v => v.retain(|_| {
                let inside = keep[position];
                position += 1;
                inside
            }));
        }
        Ok(Self {
            datatype,
            dims: dims.to_vec(),
            elements,
        })
    }

    fn require_single(&self, operation: &'static str) -> MxResult<()> {
        if self.elements.len() == 1 {
            Ok(())
        } else {
            Err(MxError::type_mismatch(
                operation,
                format!(
                    "expected a single {} value, found {} elements",
                    self.datatype,
                    self.elements.len()
                ),
            ))
        }
    }

    /// Numeric scalar as `f64`. Booleans read as 0.0/1.0.
    pub fn as_f64(&self) -> MxResult<f64> {
        self.require_single("as_f64")?;
        let value = match &self.elements {
            Elements::Char(v) => v.first().map(|x| *x as f64),
            Elements::UChar(v) => v.first().map(|x| *x as f64),
            Elements::Short(v) => v.first().map(|x| *x as f64),
            Elements::UShort(v) => v.first().map(|x| *x as f64),
            Elements::Int(v) => v.first().map(|x| *x as f64),
            Elements::UInt(v) => v.first().map(|x| *x as f64),
            Elements::Long(v) => v.first().map(|x| *x as f64),
            Elements::ULong(v) => v.first().map(|x| *x as f64),
            Elements::Float(v) => v.first().map(|x| *x as f64),
            Elements::Double(v) => v.first().copied(),
            Elements::Bool(v) => v.first().map(|x| if *x { 1.0 } else { 0.0 }),
            Elements::String(_) => None,
        };
        value.ok_or_else(|| {
            MxError::type_mismatch("as_f64", format!("{} value is not numeric", self.datatype))
        })
    }

    /// Integer scalar as `i64`. Floating-point values are rejected.
    pub fn as_i64(&self) -> MxResult<i64> {
        self.require_single("as_i64")?;
        let value = match &self.elements {
            Elements::Char(v) => v.first().map(|x| *x as i64),
            Elements::UChar(v) => v.first().map(|x| *x as i64),
            Elements::Short(v) => v.first().map(|x| *x as i64),
            Elements::UShort(v) => v.first().map(|x| *x as i64),
            Elements::Int(v) => v.first().map(|x| *x as i64),
            Elements::UInt(v) => v.first().map(|x| *x as i64),
            Elements::Long(v) => v.first().copied(),
            Elements::ULong(v) => v.first().and_then(|x| i64::try_from(*x).ok()),
            Elements::Bool(v) => v.first().map(|x| *x as i64),
            Elements::Float(_) | Elements::Double(_) | Elements::String(_) => None,
        };
        value.ok_or_else(|| {
            MxError::type_mismatch(
                "as_i64",
                format!("{} value is not representable as an integer", self.datatype),
            )
        })
    }

    /// Non-negative integer scalar as `u64`.
    pub fn as_u64(&self) -> MxResult<u64> {
        if let Elements::ULong(v) = &self.elements {
            self.require_single("as_u64")?;
            if let Some(x) = v.first() {
                return Ok(*x);
            }
        }
        let signed = self.as_i64()?;
        u64::try_from(signed).map_err(|_| {
            MxError::illegal_argument("as_u64", format!("negative value {} where unsigned expected", signed))
        })
    }

    /// Non-negative integer value as `usize`.
    pub fn as_usize(&self) -> MxResult<usize> {
        let value = self.as_u64()?;
        usize::try_from(value)
            .map_err(|_| MxError::illegal_argument("as_usize", format!("{} is too large", value)))
    }

    /// Boolean, or an integer compared against zero.
    pub fn as_bool(&self) -> MxResult<bool> {
        if let Elements::Bool(v) = &self.elements {
            self.require_single("as_bool")?;
            if let Some(x) = v.first() {
                return Ok(*x);
            }
        }
        Ok(self.as_i64()? != 0)
    }

    /// The string of a scalar `string` or `record` value.
    pub fn as_str(&self) -> MxResult<&str> {
        match &self.elements {
            Elements::String(v) if v.len() == 1 => Ok(v[0].as_str()),
            _ => Err(MxError::type_mismatch(
                "as_str",
                format!("{} value is not a single string", self.datatype),
            )),
        }
    }

    /// Elements of a `uint` value.
    pub fn as_u32_slice(&self) -> MxResult<&[u32]> {
        match &self.elements {
            Elements::UInt(v) => Ok(v),
            _ => Err(self.slice_mismatch("as_u32_slice", FieldType::UInt)),
        }
    }

    /// Elements of a `long` value.
    pub fn as_i64_slice(&self) -> MxResult<&[i64]> {
        match &self.elements {
            Elements::Long(v) => Ok(v),
            _ => Err(self.slice_mismatch("as_i64_slice", FieldType::Long)),
        }
    }

    /// Elements of a `ulong` or `hex` value.
    pub fn as_u64_slice(&self) -> MxResult<&[u64]> {
        match &self.elements {
            Elements::ULong(v) => Ok(v),
            _ => Err(self.slice_mismatch("as_u64_slice", FieldType::ULong)),
        }
    }

    /// Elements of a `double` value.
    pub fn as_f64_slice(&self) -> MxResult<&[f64]> {
        match &self.elements {
            Elements::Double(v) => Ok(v),
            _ => Err(self.slice_mismatch("as_f64_slice", FieldType::Double)),
        }
    }

    fn slice_mismatch(&self, operation: &'static str, wanted: FieldType) -> MxError {
        MxError::type_mismatch(
            operation,
            format!("{} array requested from a {} value", wanted, self.datatype),
        )
    }

    /// Parse a configuration value for a field of the given type and shape.
    ///
    /// Nested TOML arrays are flattened in row-major order. Short arrays are
    /// padded with zero elements; long arrays are rejected.
    pub fn from_toml(datatype: FieldType, dims: &[usize], value: &toml::Value) -> MxResult<Self> {
        let mut items = Vec::new();
        flatten_toml(value, &mut items);

        let expected = element_count(dims);
        if items.len() > expected {
            return Err(MxError::illegal_argument(
                "field_from_config",
                format!(
                    "{} values given for a {} field with room for {}",
                    items.len(),
                    datatype,
                    expected
                ),
            ));
        }

        let mut elements = Elements::zeroed(datatype.element_kind(), 0);
        for item in items {
            push_toml(&mut elements, item).map_err(|reason| {
                MxError::illegal_argument(
                    "field_from_config",
                    format!("cannot parse {} as {}: {}", item, datatype, reason),
                )
            })?;
        }
        elements.resize(expected);

        Self::new(datatype, dims.to_vec(), elements)
    }
}

fn flatten_toml<'a>(value: &'a toml::Value, out: &mut Vec<&'a toml::Value>) {
    match value {
        toml::Value::Array(items) => {
            for item in items {
                flatten_toml(item, out);
            }
        }
        other => out.push(other),
    }
}

fn toml_integer(item: &toml::Value) -> Result<i64, String> {
    match item {
        toml::Value::Integer(i) => Ok(*i),
        toml::Value::Boolean(b) => Ok(*b as i64),
        toml::Value::String(s) => {
            let trimmed = s.trim();
            if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).map_err(|e| e.to_string())
            } else {
                trimmed.parse::<i64>().map_err(|e| e.to_string())
            }
        }
        other => Err(format!("expected an integer, found {}", other.type_str())),
    }
}

fn toml_float(item: &toml::Value) -> Result<f64, String> {
    match item {
        toml::Value::Float(f) => Ok(*f),
        toml::Value::Integer(i) => Ok(*i as f64),
        toml::Value::String(s) => s.trim().parse::<f64>().map_err(|e| e.to_string()),
        other => Err(format!("expected a number, found {}", other.type_str())),
    }
}

fn narrow<T: TryFrom<i64>>(value: i64) -> Result<T, String> {
    T::try_from(value).map_err(|_| format!("{} is out of range", value))
}

fn push_toml(elements: &mut Elements, item: &toml::Value) -> Result<(), String> {
    match elements {
        Elements::Char(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::UChar(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::Short(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::UShort(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::Int(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::UInt(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::Long(v) => v.push(toml_integer(item)?),
        Elements::ULong(v) => v.push(narrow(toml_integer(item)?)?),
        Elements::Float(v) => v.push(toml_float(item)? as f32),
        Elements::Double(v) => v.push(toml_float(item)?),
        Elements::Bool(v) => v.push(toml_integer(item)? != 0),
        Elements::String(v) => match item {
            toml::Value::String(s) => v.push(s.clone()),
            other => v.push(other.to_string()),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_storage_and_count() {
        let wrong_kind = FieldValue::new(FieldType::Double, vec![], Elements::Long(vec![1]));
        assert_eq!(
            wrong_kind.unwrap_err().kind,
            crate::error::ErrorKind::TypeMismatch
        );

        let wrong_count = FieldValue::new(FieldType::Long, vec![3], Elements::Long(vec![1, 2]));
        assert_eq!(
            wrong_count.unwrap_err().kind,
            crate::error::ErrorKind::IllegalArgument
        );

        let two_d = FieldValue::new(FieldType::Long, vec![2, 3], Elements::Long(vec![0; 6]));
        assert!(two_d.is_ok());
    }

    #[test]
    fn scalar_accessors() {
        assert_eq!(FieldValue::double(2.5).as_f64().unwrap(), 2.5);
        assert_eq!(FieldValue::uint(7).as_i64().unwrap(), 7);
        assert!(FieldValue::double(2.5).as_i64().is_err());
        assert!(FieldValue::long(-1).as_u64().is_err());
        assert!(FieldValue::long(1).as_bool().unwrap());
        assert_eq!(FieldValue::string("abc").as_str().unwrap(), "abc");
        assert_eq!(FieldValue::hex(0xff).as_u64().unwrap(), 255);
    }

    #[test]
    fn truncation_keeps_prefix() {
        let value = FieldValue::uint_array(vec![1, 2, 3, 4]);
        let prefix = value.clone().truncated(&[2]).unwrap();
        assert_eq!(prefix.as_u32_slice().unwrap(), &[1, 2]);
        assert_eq!(prefix.dims(), &[2]);
        assert!(value.truncated(&[5]).is_err());
    }

    #[test]
    fn truncating_an_inner_axis_copies_row_by_row() {
        let rois = FieldValue::new(
            FieldType::UInt,
            vec![3, 2],
            Elements::UInt(vec![10, 19, 20, 29, 30, 39]),
        )
        .unwrap();

        let lower = rois.clone().truncated(&[3, 1]).unwrap();
        assert_eq!(lower.as_u32_slice().unwrap(), &[10, 20, 30]);
        assert_eq!(lower.dims(), &[3, 1]);

        let first_two = rois.clone().truncated(&[2, 2]).unwrap();
        assert_eq!(first_two.as_u32_slice().unwrap(), &[10, 19, 20, 29]);

        let flat = rois.truncated(&[6]).unwrap_err();
        assert_eq!(flat.kind, crate::error::ErrorKind::IllegalArgument);
    }

    #[test]
    fn toml_arrays_are_padded_and_flattened() {
        let raw: toml::Value = toml::from_str::<toml::Table>("v = [[1, 2], [3]]")
            .unwrap()
            .remove("v")
            .unwrap();
        let value = FieldValue::from_toml(FieldType::UInt, &[5], &raw).unwrap();
        assert_eq!(value.as_u32_slice().unwrap(), &[1, 2, 3, 0, 0]);

        let too_many = FieldValue::from_toml(FieldType::UInt, &[2], &raw);
        assert!(too_many.is_err());
    }

    #[test]
    fn toml_hex_strings() {
        let value =
            FieldValue::from_toml(FieldType::Hex, &[], &toml::Value::String("0x1F".into())).unwrap();
        assert_eq!(value.as_u64().unwrap(), 31);
        assert_eq!(value.datatype(), FieldType::Hex);
    }

    #[test]
    fn toml_out_of_range_is_rejected() {
        let err = FieldValue::from_toml(FieldType::UChar, &[], &toml::Value::Integer(300));
        assert!(err.is_err());
    }
}
