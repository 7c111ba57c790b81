use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use runtime::{BufferKey, RuntimeErr};

use crate::tensor::DType;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, TileErr>;

/// The crate's error type.
#[derive(Debug)]
pub enum TileErr {
    /// A tile shape with a zero extent, or with a different amount of axes than the shape.
    InvalidTiling {
        shape: Vec<usize>,
        tile: Vec<usize>,
    },
    InvalidAxis {
        axis: usize,
        ndim: usize,
    },
    InvalidDistribution(String),
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    DTypeMismatch {
        expected: DType,
        got: DType,
    },
    UnsupportedDType {
        op: &'static str,
        dtype: DType,
    },
    /// An operation was given the same buffer as source and destination.
    Aliasing(&'static str),
    IdentifierCollision(BufferKey),
    /// The tensor with this tag was already unregistered, or is still referenced by a pending task.
    UseAfterRelease(u64),
    MissingGradient(u64),
    InvalidConfig(String),
    Runtime(RuntimeErr),
    Io(io::Error),
    Json(serde_json::Error),
}

impl TileErr {
    pub(crate) fn shape(what: &'static str, expected: &[usize], got: &[usize]) -> Self {
        TileErr::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

impl Display for TileErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileErr::InvalidTiling { shape, tile } => {
                write!(f, "invalid tiling {tile:?} for shape {shape:?}")
            }
            TileErr::InvalidAxis { axis, ndim } => {
                write!(f, "axis {axis} is out of range for a {ndim}-dimensional tensor")
            }
            TileErr::InvalidDistribution(msg) => write!(f, "invalid distribution: {msg}"),
            TileErr::ShapeMismatch {
                what,
                expected,
                got,
            } => write!(f, "shape mismatch in {what}, expected {expected:?} and got {got:?}"),
            TileErr::DTypeMismatch { expected, got } => {
                write!(f, "element type mismatch, expected {expected} and got {got}")
            }
            TileErr::UnsupportedDType { op, dtype } => {
                write!(f, "{op} doesn't support {dtype} tensors")
            }
            TileErr::Aliasing(op) => write!(f, "{op} was given the same buffer twice"),
            TileErr::IdentifierCollision(key) => {
                write!(f, "buffer identifier {key} is already in use")
            }
            TileErr::UseAfterRelease(tag) => {
                write!(f, "tensor {tag} was released or is still in use by pending tasks")
            }
            TileErr::MissingGradient(tag) => write!(f, "tensor {tag} has no gradient"),
            TileErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            TileErr::Runtime(e) => write!(f, "runtime error: {e}"),
            TileErr::Io(e) => write!(f, "io error: {e}"),
            TileErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for TileErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TileErr::Runtime(e) => Some(e),
            TileErr::Io(e) => Some(e),
            TileErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RuntimeErr> for TileErr {
    fn from(e: RuntimeErr) -> Self {
        match e {
            RuntimeErr::Collision(key) => TileErr::IdentifierCollision(key),
            RuntimeErr::UnknownBuffer(key) | RuntimeErr::Pending { key, .. } => {
                TileErr::UseAfterRelease(key.tag)
            }
            e => TileErr::Runtime(e),
        }
    }
}

impl From<io::Error> for TileErr {
    fn from(e: io::Error) -> Self {
        TileErr::Io(e)
    }
}

impl From<serde_json::Error> for TileErr {
    fn from(e: serde_json::Error) -> Self {
        TileErr::Json(e)
    }
}
