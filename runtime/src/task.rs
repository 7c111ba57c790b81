use std::{
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{Condvar, Mutex};

use crate::error::{KernelFault, Result, RuntimeErr};

/// Identifies one registered buffer: a tile of a tagged tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey {
    pub tag: u64,
    pub tile: usize,
}

impl BufferKey {
    pub fn new(tag: u64, tile: usize) -> Self {
        Self { tag, tile }
    }
}

impl Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.tile)
    }
}

/// The body of a task.
pub type Kernel = Box<dyn FnOnce() -> std::result::Result<(), KernelFault> + Send + 'static>;

/// A unit of work to be submitted into the runtime.
///
/// The runtime orders tasks only through the buffers declared in `reads` and `writes`.
pub struct Task {
    pub(crate) name: &'static str,
    pub(crate) node: usize,
    pub(crate) reads: Vec<BufferKey>,
    pub(crate) writes: Vec<BufferKey>,
    pub(crate) kernel: Kernel,
}

impl Task {
    /// Creates a new `Task`.
    ///
    /// # Arguments
    /// * `name` - A static name used for logging and fault reports.
    /// * `node` - The node executing the task, usually the owner of the written buffer.
    /// * `kernel` - The work itself.
    ///
    /// # Returns
    /// A new `Task` with empty read and write sets.
    pub fn new<F>(name: &'static str, node: usize, kernel: F) -> Self
    where
        F: FnOnce() -> std::result::Result<(), KernelFault> + Send + 'static,
    {
        Self {
            name,
            node,
            reads: Vec::new(),
            writes: Vec::new(),
            kernel: Box::new(kernel),
        }
    }

    /// Adds a buffer to the read set.
    pub fn read(mut self, key: BufferKey) -> Self {
        self.reads.push(key);
        self
    }

    /// Adds several buffers to the read set.
    pub fn reads<I: IntoIterator<Item = BufferKey>>(mut self, keys: I) -> Self {
        self.reads.extend(keys);
        self
    }

    /// Adds a buffer to the write set.
    pub fn write(mut self, key: BufferKey) -> Self {
        self.writes.push(key);
        self
    }

    /// Adds several buffers to the write set.
    pub fn writes<I: IntoIterator<Item = BufferKey>>(mut self, keys: I) -> Self {
        self.writes.extend(keys);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Pending,
    Done,
    Skipped,
    Failed(KernelFault),
}

pub(crate) struct NodeState {
    pub(crate) outcome: Outcome,
    pub(crate) successors: Vec<Arc<TaskNode>>,
    pub(crate) kernel: Option<Kernel>,
}

/// A submitted task inside the dependency graph.
pub(crate) struct TaskNode {
    pub(crate) id: u64,
    pub(crate) name: &'static str,
    pub(crate) node: usize,
    pub(crate) keys: Vec<BufferKey>,
    pub(crate) remaining: AtomicUsize,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) finished: Condvar,
}

impl TaskNode {
    pub(crate) fn new(id: u64, task: Task) -> Self {
        let Task {
            name,
            node,
            reads,
            writes,
            kernel,
        } = task;

        let mut keys = reads;
        keys.extend(writes);
        keys.sort_unstable();
        keys.dedup();

        Self {
            id,
            name,
            node,
            keys,
            // One extra count guards against scheduling while dependencies are still being added.
            remaining: AtomicUsize::new(1),
            state: Mutex::new(NodeState {
                outcome: Outcome::Pending,
                successors: Vec::new(),
                kernel: Some(kernel),
            }),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        !matches!(self.state.lock().outcome, Outcome::Pending)
    }

    /// Registers `succ` to run after `self`.
    ///
    /// # Returns
    /// `false` if `self` has already finished, so there is nothing to wait for.
    pub(crate) fn add_successor(&self, succ: &Arc<TaskNode>) -> bool {
        let mut state = self.state.lock();

        if !matches!(state.outcome, Outcome::Pending) {
            return false;
        }

        succ.remaining.fetch_add(1, Ordering::AcqRel);
        state.successors.push(Arc::clone(succ));
        true
    }

    /// Decrements the dependency counter.
    ///
    /// # Returns
    /// `true` when the task became ready.
    pub(crate) fn release(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// A handle to a submitted task that allows blocking until it finishes.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) node: Arc<TaskNode>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.node.id
    }

    pub fn is_finished(&self) -> bool {
        self.node.is_finished()
    }

    /// Blocks the calling thread until the task finishes.
    ///
    /// # Returns
    /// An error if the kernel failed or was skipped because the runtime is poisoned.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.node.state.lock();

        while matches!(state.outcome, Outcome::Pending) {
            self.node.finished.wait(&mut state);
        }

        match &state.outcome {
            Outcome::Done => Ok(()),
            Outcome::Failed(fault) => Err(RuntimeErr::KernelFault {
                task: self.node.name,
                fault: fault.clone(),
            }),
            Outcome::Skipped => Err(RuntimeErr::KernelFault {
                task: self.node.name,
                fault: KernelFault::new("skipped after an earlier kernel fault"),
            }),
            Outcome::Pending => unreachable!(),
        }
    }
}
