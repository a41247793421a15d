//! Task graph and dispatchers.
//!
//! A [`TaskManager`] owns a fixed arena of named nodes. Nodes are registered once and
//! reused every tick; only their edges are rebuilt. Each tick:
//!
//! 1. `reset_dependencies()` clears edges and reference counts.
//! 2. `submit()` marks the nodes taking part. A submitted node holds one reference
//!    until `start_simulation()` releases it.
//! 3. `start_after()` / `set_following()` / `add_reference()` add references.
//! 4. `start_simulation()` drops the initial hold; any node whose count reaches zero is
//!    handed to the [`CpuDispatcher`].
//!
//! When a node finishes it releases one reference on every dependent and on its
//! following node. A node that returns [`TaskStatus::RunAgain`] is dispatched again
//! without releasing anything, which is how substep loops chain onto themselves.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes jobs. The task manager only requires that a job eventually runs.
pub trait CpuDispatcher: Send + Sync {
    fn dispatch(&self, job: Job);

    fn worker_count(&self) -> usize;
}

/// Fixed pool of worker threads fed through a channel.
pub struct ThreadPoolDispatcher {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolDispatcher {
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("engine-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .with_context(|| format!("spawn worker {i}"))?;
            handles.push(handle);
        }
        debug!(workers, "Thread pool dispatcher started");
        Ok(Self {
            sender: Some(sender),
            workers: handles,
        })
    }
}

impl CpuDispatcher for ThreadPoolDispatcher {
    fn dispatch(&self, job: Job) {
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                warn!("Dispatch after worker shutdown, job dropped");
            }
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop.
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last handle can be released from inside a job.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

/// Runs jobs on whichever thread dispatches first, in FIFO order.
///
/// Jobs dispatched from inside a running job are queued behind it, so a whole task
/// graph runs to completion inside `start_simulation()` with a reproducible order.
#[derive(Default)]
pub struct InlineDispatcher {
    queue: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
}

impl InlineDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuDispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) {
        self.queue.lock().push_back(job);
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(job) => job(),
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn worker_count(&self) -> usize {
        1
    }
}

/// Index of a node in its manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a node wants after its body ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Complete,
    /// Dispatch this node again; dependents stay blocked.
    RunAgain,
}

/// Body of a node.
pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>) -> TaskStatus + Send + Sync>;

struct Node {
    name: String,
    work: TaskFn,
    dependents: Vec<TaskId>,
    following: Option<TaskId>,
    refs: u32,
    submitted: bool,
    completed: bool,
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Node>,
    running: bool,
    outstanding: usize,
}

impl Graph {
    /// Drops one reference. Returns true if the node just became runnable.
    fn release(&mut self, id: TaskId) -> bool {
        let running = self.running;
        let node = &mut self.nodes[id.0];
        debug_assert!(node.refs > 0, "task '{}' released below zero", node.name);
        node.refs = node.refs.saturating_sub(1);
        node.refs == 0 && node.submitted && running
    }
}

struct Shared {
    graph: Mutex<Graph>,
    idle: Condvar,
    dispatcher: Arc<dyn CpuDispatcher>,
}

impl Shared {
    fn dispatch(self: &Arc<Self>, id: TaskId) {
        let shared = Arc::clone(self);
        self.dispatcher.dispatch(Box::new(move || shared.run_node(id)));
    }

    fn dispatch_all(self: &Arc<Self>, ready: Vec<TaskId>) {
        for id in ready {
            self.dispatch(id);
        }
    }

    fn run_node(self: &Arc<Self>, id: TaskId) {
        let (name, work) = {
            let graph = self.graph.lock();
            let node = &graph.nodes[id.0];
            (node.name.clone(), Arc::clone(&node.work))
        };
        trace!(task = %name, "Task start");

        let ctx = TaskContext { shared: self, id };
        let status = match catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
            Ok(status) => status,
            Err(_) => {
                error!(task = %name, "Task panicked, treating as complete");
                TaskStatus::Complete
            }
        };

        match status {
            TaskStatus::RunAgain => self.dispatch(id),
            TaskStatus::Complete => self.complete(id),
        }
    }

    fn complete(self: &Arc<Self>, id: TaskId) {
        let ready = {
            let mut graph = self.graph.lock();
            let node = &mut graph.nodes[id.0];
            node.completed = true;
            let mut released = node.dependents.clone();
            released.extend(node.following);
            graph.outstanding = graph.outstanding.saturating_sub(1);
            if graph.outstanding == 0 {
                self.idle.notify_all();
            }
            released
                .into_iter()
                .filter(|&dep| graph.release(dep))
                .collect::<Vec<_>>()
        };
        self.dispatch_all(ready);
    }

    fn remove_reference(self: &Arc<Self>, id: TaskId) {
        let ready = self.graph.lock().release(id);
        if ready {
            self.dispatch(id);
        }
    }
}

/// Handle passed to a running node.
pub struct TaskContext<'a> {
    shared: &'a Arc<Shared>,
    id: TaskId,
}

impl TaskContext<'_> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn add_reference(&self, id: TaskId) {
        self.shared.graph.lock().nodes[id.0].refs += 1;
    }

    /// Drops a reference, dispatching the node if it becomes runnable.
    pub fn remove_reference(&self, id: TaskId) {
        self.shared.remove_reference(id);
    }
}

/// Arena of named nodes plus the per-tick dependency state.
pub struct TaskManager {
    shared: Arc<Shared>,
}

impl TaskManager {
    pub fn new(dispatcher: Arc<dyn CpuDispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(Graph::default()),
                idle: Condvar::new(),
                dispatcher,
            }),
        }
    }

    /// Adds a node to the arena. Nodes live as long as the manager.
    pub fn register<F>(&self, name: &str, work: F) -> TaskId
    where
        F: Fn(&TaskContext<'_>) -> TaskStatus + Send + Sync + 'static,
    {
        let mut graph = self.shared.graph.lock();
        let id = TaskId(graph.nodes.len());
        graph.nodes.push(Node {
            name: name.to_string(),
            work: Arc::new(work),
            dependents: Vec::new(),
            following: None,
            refs: 0,
            submitted: false,
            completed: false,
        });
        id
    }

    pub fn find(&self, name: &str) -> Option<TaskId> {
        self.shared
            .graph
            .lock()
            .nodes
            .iter()
            .position(|n| n.name == name)
            .map(TaskId)
    }

    pub fn name(&self, id: TaskId) -> String {
        self.shared.graph.lock().nodes[id.0].name.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.dispatcher.worker_count()
    }

    /// Clears every edge and reference count.
    pub fn reset_dependencies(&self) {
        let mut graph = self.shared.graph.lock();
        debug_assert_eq!(graph.outstanding, 0, "reset while tasks are outstanding");
        graph.running = false;
        graph.outstanding = 0;
        for node in &mut graph.nodes {
            node.dependents.clear();
            node.following = None;
            node.refs = 0;
            node.submitted = false;
            node.completed = false;
        }
    }

    /// Takes part in the next run. Holds one reference until `start_simulation`.
    pub fn submit(&self, id: TaskId) {
        let mut graph = self.shared.graph.lock();
        let node = &mut graph.nodes[id.0];
        if node.submitted {
            return;
        }
        node.submitted = true;
        node.refs += 1;
        graph.outstanding += 1;
    }

    /// `task` may not start before `pred` completes.
    pub fn start_after(&self, task: TaskId, pred: TaskId) {
        let mut graph = self.shared.graph.lock();
        debug_assert!(graph.nodes[task.0].submitted && graph.nodes[pred.0].submitted);
        graph.nodes[pred.0].dependents.push(task);
        graph.nodes[task.0].refs += 1;
    }

    /// Chains `following` to run after `task` completes.
    pub fn set_following(&self, task: TaskId, following: Option<TaskId>) {
        let mut graph = self.shared.graph.lock();
        if let Some(prev) = graph.nodes[task.0].following.take() {
            graph.nodes[prev.0].refs = graph.nodes[prev.0].refs.saturating_sub(1);
        }
        if let Some(next) = following {
            debug_assert!(graph.nodes[next.0].submitted);
            graph.nodes[next.0].refs += 1;
        }
        graph.nodes[task.0].following = following;
    }

    /// Extra hold that something else must drop with `remove_reference`.
    pub fn add_reference(&self, id: TaskId) {
        self.shared.graph.lock().nodes[id.0].refs += 1;
    }

    pub fn remove_reference(&self, id: TaskId) {
        self.shared.remove_reference(id);
    }

    /// Releases the submit hold on every submitted node and dispatches the roots.
    pub fn start_simulation(&self) {
        let ready = {
            let mut graph = self.shared.graph.lock();
            graph.running = true;
            let submitted: Vec<TaskId> = graph
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.submitted)
                .map(|(i, _)| TaskId(i))
                .collect();
            submitted
                .into_iter()
                .filter(|&id| graph.release(id))
                .collect::<Vec<_>>()
        };
        self.shared.dispatch_all(ready);
    }

    /// Ends the run. Logs if submitted nodes never completed.
    pub fn stop_simulation(&self) {
        let mut graph = self.shared.graph.lock();
        if graph.outstanding > 0 {
            let pending: Vec<&str> = graph
                .nodes
                .iter()
                .filter(|n| n.submitted && !n.completed)
                .map(|n| n.name.as_str())
                .collect();
            warn!(?pending, "Stopping task graph with unfinished tasks");
        }
        graph.running = false;
    }

    /// Blocks until every submitted node has completed, including the bookkeeping that
    /// runs after a node's body returns.
    pub fn wait_idle(&self) {
        let mut graph = self.shared.graph.lock();
        while graph.outstanding > 0 {
            self.shared.idle.wait(&mut graph);
        }
    }

    /// Submitted nodes that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.shared.graph.lock().outstanding
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.shared.graph.lock().nodes[id.0].completed
    }
}
