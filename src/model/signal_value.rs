//! Typed signal value buffers.
//!
//! A signal carries a fixed-length vector of one element type. Scalars are
//! vectors of length one.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{DataType, Value};

/// Inline capacity before a value spills to the heap.
const INLINE: usize = 4;

/// Tagged union over the supported element types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalValue {
    Int32(SmallVec<[i32; INLINE]>),
    Float32(SmallVec<[f32; INLINE]>),
    Float64(SmallVec<[f64; INLINE]>),
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Element types a signal can carry. Implemented for `i32`, `f32` and `f64`.
pub trait Sample: Copy + Send + Sync + sealed::Sealed + 'static {
    const TYPE: DataType;

    fn pack(values: &[Self]) -> SignalValue;

    /// Borrow the elements when `value` has this element type.
    fn unpack(value: &SignalValue) -> Option<&[Self]>;
}

impl Sample for i32 {
    const TYPE: DataType = DataType::Int32;
    fn pack(values: &[Self]) -> SignalValue { SignalValue::Int32(SmallVec::from_slice(values)) }
    fn unpack(value: &SignalValue) -> Option<&[Self]> {
        match value {
            SignalValue::Int32(v) => Some(v),
            _ => None,
        }
    }
}

impl Sample for f32 {
    const TYPE: DataType = DataType::Float32;
    fn pack(values: &[Self]) -> SignalValue { SignalValue::Float32(SmallVec::from_slice(values)) }
    fn unpack(value: &SignalValue) -> Option<&[Self]> {
        match value {
            SignalValue::Float32(v) => Some(v),
            _ => None,
        }
    }
}

impl Sample for f64 {
    const TYPE: DataType = DataType::Float64;
    fn pack(values: &[Self]) -> SignalValue { SignalValue::Float64(SmallVec::from_slice(values)) }
    fn unpack(value: &SignalValue) -> Option<&[Self]> {
        match value {
            SignalValue::Float64(v) => Some(v),
            _ => None,
        }
    }
}

impl SignalValue {
    pub fn data_type(&self) -> DataType {
        match self {
            SignalValue::Int32(_) => DataType::Int32,
            SignalValue::Float32(_) => DataType::Float32,
            SignalValue::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SignalValue::Int32(v) => v.len(),
            SignalValue::Float32(v) => v.len(),
            SignalValue::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_scalar(&self) -> bool { self.len() == 1 }

    /// Typed view; `None` if the element type differs.
    pub fn as_slice<T: Sample>(&self) -> Option<&[T]> {
        T::unpack(self)
    }

    pub fn has_nan(&self) -> bool {
        match self {
            SignalValue::Int32(_) => false,
            SignalValue::Float32(v) => v.iter().any(|x| x.is_nan()),
            SignalValue::Float64(v) => v.iter().any(|x| x.is_nan()),
        }
    }

    /// Widen every element to f64 for expression evaluation.
    pub fn to_f64s(&self) -> Vec<f64> {
        match self {
            SignalValue::Int32(v) => v.iter().map(|&x| x as f64).collect(),
            SignalValue::Float32(v) => v.iter().map(|&x| x as f64).collect(),
            SignalValue::Float64(v) => v.to_vec(),
        }
    }

    /// Narrow f64 elements into `ty`. Integer conversion truncates toward zero.
    pub fn from_f64s(ty: DataType, values: &[f64]) -> Self {
        match ty {
            DataType::Int32 => SignalValue::Int32(values.iter().map(|&x| x as i32).collect()),
            DataType::Float32 => SignalValue::Float32(values.iter().map(|&x| x as f32).collect()),
            DataType::Float64 => SignalValue::Float64(values.iter().copied().collect()),
        }
    }

    /// Convert to `ty` and fit to `len` elements, zero-padding or truncating.
    pub fn coerce(&self, ty: DataType, len: usize) -> Self {
        let mut wide = self.to_f64s();
        wide.resize(len, 0.0);
        Self::from_f64s(ty, &wide)
    }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl<T: Sample> From<T> for SignalValue {
    fn from(v: T) -> Self { T::pack(&[v]) }
}

impl<T: Sample> From<Vec<T>> for SignalValue {
    fn from(v: Vec<T>) -> Self { T::pack(&v) }
}

impl<T: Sample> From<&[T]> for SignalValue {
    fn from(v: &[T]) -> Self { T::pack(v) }
}

impl<T: Sample, const N: usize> From<[T; N]> for SignalValue {
    fn from(v: [T; N]) -> Self { T::pack(&v) }
}

impl From<&SignalValue> for Value {
    /// Scalars become `Int`/`Float`; vectors become `List`.
    fn from(v: &SignalValue) -> Self {
        let mut items: Vec<Value> = match v {
            SignalValue::Int32(v) => v.iter().map(|&x| Value::Int(x as i64)).collect(),
            SignalValue::Float32(v) => v.iter().map(|&x| Value::Float(x as f64)).collect(),
            SignalValue::Float64(v) => v.iter().map(|&x| Value::Float(x)).collect(),
        };
        if items.len() == 1 {
            items.remove(0)
        } else {
            Value::List(items)
        }
    }
}

impl From<SignalValue> for Value {
    fn from(v: SignalValue) -> Self { Value::from(&v) }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_from() {
        let v = SignalValue::from(3);
        assert_eq!(v.data_type(), DataType::Int32);
        assert!(v.is_scalar());
        assert_eq!(v.as_slice::<i32>(), Some(&[3][..]));
        assert_eq!(v.as_slice::<f32>(), None);
    }

    #[test]
    fn test_coerce_pads_and_truncates() {
        let v = SignalValue::from([1.9f64, -2.7, 5.0]);
        assert_eq!(v.coerce(DataType::Int32, 2), SignalValue::from(vec![1, -2]));
        assert_eq!(
            SignalValue::from(7).coerce(DataType::Float32, 3),
            SignalValue::from([7.0f32, 0.0, 0.0])
        );
    }

    #[test]
    fn test_nan_detection() {
        assert!(SignalValue::from(f32::NAN).has_nan());
        assert!(!SignalValue::from(vec![1.0f64, 2.0]).has_nan());
        assert!(!SignalValue::from(0).has_nan());
    }

    #[test]
    fn test_into_property_value() {
        assert_eq!(Value::from(SignalValue::from(4)), Value::Int(4));
        assert_eq!(
            Value::from(SignalValue::from([1.5f64, 2.5])),
            Value::List(vec![Value::Float(1.5), Value::Float(2.5)])
        );
    }
}
