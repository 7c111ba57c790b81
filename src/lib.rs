pub mod config;
pub mod error;
pub mod kernel;
pub mod layer;
pub mod layout;
pub mod loss;
pub mod model;
pub mod ops;
pub mod optim;
pub mod pipeline;
pub mod tag;
pub mod tensor;

pub use error::{Result, TileErr};
pub use layout::TileLayout;
pub use model::Model;
pub use pipeline::{Pipeline, PipelineState, PipelineStats};
pub use tag::TagAllocator;
pub use tensor::{DType, DistributedTensor, TensorMoments};
