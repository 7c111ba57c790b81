use std::{
    fmt::{self, Debug, Display},
    iter::Sum,
};

use ndarray::LinalgScalar;
use num_traits::{Float, FromPrimitive, NumAssign};

/// The element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Returns the size in bytes of one element.
    pub fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };

        f.write_str(s)
    }
}

/// The contents of one tile, stored contiguously with the last axis fastest.
#[derive(Debug, Clone, PartialEq)]
pub enum TileData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TileData {
    /// Creates a zero filled tile.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TileData::F32(vec![0.; len]),
            DType::F64 => TileData::F64(vec![0.; len]),
            DType::I32 => TileData::I32(vec![0; len]),
            DType::I64 => TileData::I64(vec![0; len]),
            DType::Bool => TileData::Bool(vec![false; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TileData::F32(_) => DType::F32,
            TileData::F64(_) => DType::F64,
            TileData::I32(_) => DType::I32,
            TileData::I64(_) => DType::I64,
            TileData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TileData::F32(v) => v.len(),
            TileData::F64(v) => v.len(),
            TileData::I32(v) => v.len(),
            TileData::I64(v) => v.len(),
            TileData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An element type that can be stored in a tile.
pub trait Element: Copy + Default + Debug + PartialEq + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(data: &TileData) -> Option<&[Self]>;

    fn slice_mut(data: &mut TileData) -> Option<&mut [Self]>;

    fn wrap(values: Vec<Self>) -> TileData;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn slice(data: &TileData) -> Option<&[Self]> {
                match data {
                    TileData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut TileData) -> Option<&mut [Self]> {
                match data {
                    TileData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TileData {
                TileData::$variant(values)
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(i32, I32);
impl_element!(i64, I64);
impl_element!(bool, Bool);

/// A floating point element, the only kind numeric kernels operate on.
pub trait FloatElement: Element + Float + FromPrimitive + NumAssign + LinalgScalar + Sum {
    /// Converts a host scalar, every `f64` maps to some value of `Self`.
    fn of(x: f64) -> Self {
        Self::from_f64(x).unwrap_or_else(Self::nan)
    }
}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

/// Runs `$body` with `$t` bound to the float type matching `$dtype`.
///
/// Evaluates to `UnsupportedDType` for non float types.
macro_rules! float_dispatch {
    ($op:expr, $dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::tensor::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::tensor::DType::F64 => {
                type $t = f64;
                $body
            }
            dtype => Err($crate::error::TileErr::UnsupportedDType { op: $op, dtype }),
        }
    };
}

/// Runs `$body` with `$t` bound to the element type matching `$dtype`.
macro_rules! any_dispatch {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::tensor::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::tensor::DType::F64 => {
                type $t = f64;
                $body
            }
            $crate::tensor::DType::I32 => {
                type $t = i32;
                $body
            }
            $crate::tensor::DType::I64 => {
                type $t = i64;
                $body
            }
            $crate::tensor::DType::Bool => {
                type $t = bool;
                $body
            }
        }
    };
}

pub(crate) use {any_dispatch, float_dispatch};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_accessors_match_the_variant() {
        let mut data = TileData::zeros(DType::I64, 3);

        assert!(f32::slice(&data).is_none());
        i64::slice_mut(&mut data).unwrap()[1] = 9;
        assert_eq!(i64::slice(&data).unwrap(), [0, 9, 0]);
        assert_eq!(data.dtype(), DType::I64);
    }

    #[test]
    fn sizes() {
        assert_eq!(DType::F64.size(), 8);
        assert_eq!(DType::Bool.size(), 1);
        assert!(!DType::I32.is_float());
    }
}
