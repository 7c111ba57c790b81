use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::{BufferKey, WorkerClass};

/// The runtime module's result type.
pub type Result<T> = std::result::Result<T, RuntimeErr>;

/// A failure raised by a kernel while it was executing inside a task.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelFault(String);

impl KernelFault {
    /// Creates a new `KernelFault`.
    ///
    /// # Arguments
    /// * `msg` - A description of what went wrong.
    ///
    /// # Returns
    /// A new `KernelFault` instance.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the fault's description.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for KernelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for KernelFault {}

/// The task runtime's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeErr {
    /// A buffer key was registered twice.
    Collision(BufferKey),
    /// A buffer key is not (or no longer) registered.
    UnknownBuffer(BufferKey),
    /// A buffer can't be released because submitted tasks still reference it.
    Pending { key: BufferKey, refs: usize },
    /// A node id outside of the configured node range.
    InvalidNode { node: usize, nodes: usize },
    /// There are no workers of the requested class.
    NoWorkers(WorkerClass),
    /// A kernel failed; reported at the next barrier.
    KernelFault { task: &'static str, fault: KernelFault },
    /// The worker pool could not be created.
    Pool(String),
}

impl Display for RuntimeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErr::Collision(key) => write!(f, "buffer {key} is already registered"),
            RuntimeErr::UnknownBuffer(key) => write!(f, "buffer {key} is not registered"),
            RuntimeErr::Pending { key, refs } => write!(
                f,
                "buffer {key} is still referenced by {refs} outstanding task(s)"
            ),
            RuntimeErr::InvalidNode { node, nodes } => {
                write!(f, "node {node} is out of range, the runtime has {nodes} node(s)")
            }
            RuntimeErr::NoWorkers(class) => write!(f, "there are no {class} workers"),
            RuntimeErr::KernelFault { task, fault } => {
                write!(f, "kernel fault in task {task}: {fault}")
            }
            RuntimeErr::Pool(msg) => write!(f, "failed to build the worker pool: {msg}"),
        }
    }
}

impl Error for RuntimeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeErr::KernelFault { fault, .. } => Some(fault),
            _ => None,
        }
    }
}
