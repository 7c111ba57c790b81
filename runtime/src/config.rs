use std::{
    fmt::{self, Display},
    num::NonZeroUsize,
};

/// The class of worker a task may be confined to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerClass {
    Cpu,
    Cuda,
}

impl Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerClass::Cpu => f.write_str("cpu"),
            WorkerClass::Cuda => f.write_str("cuda"),
        }
    }
}

/// Immutable configuration of a `Runtime`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    nodes: NonZeroUsize,
    workers: Option<NonZeroUsize>,
}

impl RuntimeConfig {
    /// Creates a new runtime configuration.
    ///
    /// # Arguments
    /// * `nodes` - The amount of compute nodes tiles can be distributed across.
    /// * `workers` - The amount of cpu worker threads, `None` lets the pool decide.
    ///
    /// # Returns
    /// A new `RuntimeConfig` instance.
    pub fn new(nodes: NonZeroUsize, workers: Option<NonZeroUsize>) -> Self {
        Self { nodes, workers }
    }

    /// A single node runtime with a default sized pool.
    pub fn single_node() -> Self {
        Self::new(NonZeroUsize::MIN, None)
    }

    /// Returns the amount of nodes.
    pub fn nodes(&self) -> usize {
        self.nodes.get()
    }

    /// Returns the requested amount of workers, if any.
    pub fn workers(&self) -> Option<usize> {
        self.workers.map(NonZeroUsize::get)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::single_node()
    }
}
