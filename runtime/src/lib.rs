mod config;
mod error;
mod runtime;
mod task;

pub use config::{RuntimeConfig, WorkerClass};
pub use error::{KernelFault, Result, RuntimeErr};
pub use runtime::{MemoryUsage, Runtime, RuntimeStats};
pub use task::{BufferKey, Kernel, Task, TaskHandle};
