use std::{
    any::Any,
    collections::HashMap,
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    config::{RuntimeConfig, WorkerClass},
    error::{KernelFault, Result, RuntimeErr},
    task::{BufferKey, Outcome, Task, TaskHandle, TaskNode},
};

/// Counters describing what the runtime has done so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStats {
    pub submitted: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Reads of a buffer owned by a node other than the one executing the task.
    pub transfers: u64,
    pub unused_hints: u64,
    pub tasks_per_node: Vec<u64>,
}

/// Memory accounting of a single node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocated: usize,
    /// Bytes of buffers hinted as unused since their last write.
    pub reclaimable: usize,
}

struct BufferState {
    node: usize,
    bytes: usize,
    last_writer: Option<Arc<TaskNode>>,
    readers: Vec<Arc<TaskNode>>,
    refs: usize,
    unused: bool,
}

struct Table {
    buffers: HashMap<BufferKey, BufferState>,
    allocated: Vec<usize>,
}

struct Inner {
    config: RuntimeConfig,
    pool: ThreadPool,
    table: Mutex<Table>,
    next_id: AtomicU64,
    pending: Mutex<usize>,
    idle: Condvar,
    faults: Mutex<Vec<RuntimeErr>>,
    poisoned: AtomicBool,
    restricted: Mutex<Option<WorkerClass>>,
    stats: Mutex<RuntimeStats>,
}

/// A dependency tracking task runtime backed by a thread pool.
///
/// Buffers are registered under a `BufferKey` and tasks declare which of them they read and
/// write. A task starts only after the last writer of every buffer it touches has finished and,
/// for written buffers, after every reader submitted since that write. Independent tasks run in
/// no particular order.
///
/// Cloning a `Runtime` yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.inner.config.nodes())
            .field("workers", &self.inner.pool.current_num_threads())
            .finish()
    }
}

impl Runtime {
    /// Creates a new `Runtime`.
    ///
    /// # Arguments
    /// * `config` - The runtime configuration.
    ///
    /// # Returns
    /// A new `Runtime` or an error if the worker pool couldn't be built.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("tile-worker-{i}"));

        if let Some(workers) = config.workers() {
            builder = builder.num_threads(workers);
        }

        let pool = builder
            .build()
            .map_err(|e| RuntimeErr::Pool(e.to_string()))?;

        let nodes = config.nodes();
        let inner = Inner {
            config,
            pool,
            table: Mutex::new(Table {
                buffers: HashMap::new(),
                allocated: vec![0; nodes],
            }),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            faults: Mutex::new(Vec::new()),
            poisoned: AtomicBool::new(false),
            restricted: Mutex::new(None),
            stats: Mutex::new(RuntimeStats {
                tasks_per_node: vec![0; nodes],
                ..Default::default()
            }),
        };

        debug!(nodes = nodes; "runtime started");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Returns the amount of nodes buffers can live on.
    pub fn nodes(&self) -> usize {
        self.inner.config.nodes()
    }

    /// Registers buffers, allocating their memory on the owning nodes.
    ///
    /// Either every buffer is registered or none is.
    ///
    /// # Arguments
    /// * `buffers` - Tuples of (key, owning node, size in bytes).
    ///
    /// # Returns
    /// `Collision` if any key is already registered (or repeated), `InvalidNode` if a node is
    /// out of range.
    pub fn register<I>(&self, buffers: I) -> Result<()>
    where
        I: IntoIterator<Item = (BufferKey, usize, usize)>,
    {
        let buffers: Vec<_> = buffers.into_iter().collect();
        let nodes = self.nodes();
        let mut table = self.inner.table.lock();

        for (i, &(key, node, _)) in buffers.iter().enumerate() {
            if node >= nodes {
                return Err(RuntimeErr::InvalidNode { node, nodes });
            }

            if table.buffers.contains_key(&key) || buffers[..i].iter().any(|(k, ..)| *k == key) {
                warn!("identifier collision on buffer {key}");
                return Err(RuntimeErr::Collision(key));
            }
        }

        for (key, node, bytes) in buffers {
            table.allocated[node] += bytes;
            table.buffers.insert(
                key,
                BufferState {
                    node,
                    bytes,
                    last_writer: None,
                    readers: Vec::new(),
                    refs: 0,
                    unused: false,
                },
            );
        }

        Ok(())
    }

    /// Releases buffers and returns their memory to the owning nodes.
    ///
    /// Either every buffer is released or none is.
    ///
    /// # Arguments
    /// * `keys` - The buffers to release.
    ///
    /// # Returns
    /// `UnknownBuffer` if a key isn't registered, `Pending` if a submitted task that hasn't
    /// finished still references it.
    pub fn unregister(&self, keys: &[BufferKey]) -> Result<()> {
        let mut table = self.inner.table.lock();

        for key in keys {
            let Some(state) = table.buffers.get(key) else {
                return Err(RuntimeErr::UnknownBuffer(*key));
            };

            if state.refs > 0 {
                return Err(RuntimeErr::Pending {
                    key: *key,
                    refs: state.refs,
                });
            }
        }

        for key in keys {
            if let Some(state) = table.buffers.remove(key) {
                table.allocated[state.node] -= state.bytes;
            }
        }

        Ok(())
    }

    pub fn is_registered(&self, key: BufferKey) -> bool {
        self.inner.table.lock().buffers.contains_key(&key)
    }

    /// Returns the node owning a registered buffer.
    pub fn owner(&self, key: BufferKey) -> Option<usize> {
        self.inner.table.lock().buffers.get(&key).map(|s| s.node)
    }

    /// Hints that the current contents of the buffers won't be read again before the next write.
    ///
    /// Unknown keys are ignored, this never blocks.
    pub fn wont_use(&self, keys: &[BufferKey]) {
        let mut hinted = 0;

        {
            let mut table = self.inner.table.lock();
            for key in keys {
                if let Some(state) = table.buffers.get_mut(key) {
                    state.unused = true;
                    hinted += 1;
                }
            }
        }

        self.inner.stats.lock().unused_hints += hinted;
    }

    /// Returns the memory accounting of `node`.
    pub fn memory(&self, node: usize) -> MemoryUsage {
        let table = self.inner.table.lock();
        let allocated = table.allocated.get(node).copied().unwrap_or_default();
        let reclaimable = table
            .buffers
            .values()
            .filter(|s| s.node == node && s.unused)
            .map(|s| s.bytes)
            .sum();

        MemoryUsage {
            allocated,
            reclaimable,
        }
    }

    /// Confines execution to a class of workers.
    ///
    /// # Returns
    /// `NoWorkers` if the runtime has no workers of that class, only cpu workers exist.
    pub fn restrict(&self, class: WorkerClass) -> Result<()> {
        if class != WorkerClass::Cpu {
            return Err(RuntimeErr::NoWorkers(class));
        }

        *self.inner.restricted.lock() = Some(class);
        Ok(())
    }

    /// Lifts a restriction set by `restrict`.
    pub fn restore_where(&self) {
        self.inner.restricted.lock().take();
    }

    pub fn restricted(&self) -> Option<WorkerClass> {
        *self.inner.restricted.lock()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.inner.stats.lock().clone()
    }

    /// Submits a task, returning without waiting for it.
    ///
    /// # Arguments
    /// * `task` - The task with its read and write sets.
    ///
    /// # Returns
    /// A handle to the submitted task, `UnknownBuffer` if it references an unregistered buffer or
    /// `InvalidNode` if its node is out of range.
    pub fn submit(&self, task: Task) -> Result<TaskHandle> {
        let nodes = self.nodes();
        if task.node >= nodes {
            return Err(RuntimeErr::InvalidNode {
                node: task.node,
                nodes,
            });
        }

        let mut writes = task.writes.clone();
        writes.sort_unstable();
        writes.dedup();

        let mut reads = task.reads.clone();
        reads.sort_unstable();
        reads.dedup();
        reads.retain(|key| writes.binary_search(key).is_err());

        let exec_node = task.node;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(TaskNode::new(id, task));
        let mut transfers = 0;

        {
            let mut table = self.inner.table.lock();

            if let Some(key) = node.keys.iter().find(|k| !table.buffers.contains_key(k)) {
                return Err(RuntimeErr::UnknownBuffer(*key));
            }

            let mut deps = Vec::new();

            for key in &reads {
                let Some(state) = table.buffers.get_mut(key) else {
                    continue;
                };

                if let Some(writer) = &state.last_writer {
                    deps.push(Arc::clone(writer));
                }

                state.readers.retain(|r| !r.is_finished());
                state.readers.push(Arc::clone(&node));
                state.refs += 1;

                if state.node != exec_node {
                    transfers += 1;
                }
            }

            for key in &writes {
                let Some(state) = table.buffers.get_mut(key) else {
                    continue;
                };

                if let Some(writer) = state.last_writer.replace(Arc::clone(&node)) {
                    deps.push(writer);
                }

                deps.append(&mut state.readers);
                state.refs += 1;
                state.unused = false;
            }

            for dep in &deps {
                dep.add_successor(&node);
            }

            *self.inner.pending.lock() += 1;
        }

        {
            let mut stats = self.inner.stats.lock();
            stats.submitted += 1;
            stats.transfers += transfers;
        }

        let handle = TaskHandle {
            node: Arc::clone(&node),
        };

        if node.release() {
            schedule(&self.inner, node);
        }

        Ok(handle)
    }

    /// Blocks until every submitted task has finished.
    ///
    /// Must not be called from inside a kernel.
    ///
    /// # Returns
    /// The first kernel fault recorded since the previous barrier. Reporting it lifts the
    /// poisoning, so later tasks execute again.
    pub fn wait_for_all(&self) -> Result<()> {
        {
            let mut pending = self.inner.pending.lock();
            while *pending > 0 {
                self.inner.idle.wait(&mut pending);
            }
        }

        let mut faults = self.inner.faults.lock();
        if faults.is_empty() {
            return Ok(());
        }

        let first = faults.remove(0);
        faults.clear();
        self.inner.poisoned.store(false, Ordering::Release);
        Err(first)
    }

    /// Returns whether a kernel failed since the last barrier.
    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }
}

fn schedule(inner: &Arc<Inner>, node: Arc<TaskNode>) {
    let rt = Arc::clone(inner);
    inner.pool.spawn(move || execute(&rt, node));
}

fn execute(inner: &Arc<Inner>, node: Arc<TaskNode>) {
    let kernel = node.state.lock().kernel.take();

    let outcome = match kernel {
        Some(kernel) if !inner.poisoned.load(Ordering::Acquire) => {
            match panic::catch_unwind(AssertUnwindSafe(kernel)) {
                Ok(Ok(())) => Outcome::Done,
                Ok(Err(fault)) => Outcome::Failed(fault),
                Err(payload) => Outcome::Failed(KernelFault::new(panic_message(payload))),
            }
        }
        _ => Outcome::Skipped,
    };

    if let Outcome::Failed(fault) = &outcome {
        warn!("task {} ({}) failed: {fault}", node.name, node.id);
        inner.poisoned.store(true, Ordering::Release);
        inner.faults.lock().push(RuntimeErr::KernelFault {
            task: node.name,
            fault: fault.clone(),
        });
    }

    {
        let mut table = inner.table.lock();
        for key in &node.keys {
            if let Some(state) = table.buffers.get_mut(key) {
                state.refs -= 1;
            }
        }
    }

    {
        let mut stats = inner.stats.lock();
        match outcome {
            Outcome::Done => stats.executed += 1,
            Outcome::Skipped => stats.skipped += 1,
            _ => stats.failed += 1,
        }
        stats.tasks_per_node[node.node] += 1;
    }

    let successors = {
        let mut state = node.state.lock();
        state.outcome = outcome;
        mem::take(&mut state.successors)
    };
    node.finished.notify_all();

    for succ in successors {
        if succ.release() {
            schedule(inner, succ);
        }
    }

    let mut pending = inner.pending.lock();
    *pending -= 1;
    if *pending == 0 {
        inner.idle.notify_all();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("kernel panicked: {msg}");
    }

    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("kernel panicked: {msg}");
    }

    "kernel panicked".to_string()
}
