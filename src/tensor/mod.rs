//! Distributed tensors and their gradient pairs.

mod distributed;
pub mod distribution;
mod dtype;
mod moments;

pub(crate) use distributed::TileRef;
pub use distributed::DistributedTensor;
pub(crate) use dtype::{any_dispatch, float_dispatch};
pub use dtype::{DType, Element, FloatElement, TileData};
pub use moments::TensorMoments;
