//! A task-dependency graph executed on the rayon thread pool.
//!
//! Tasks are added in program order together with the keys of the data they read and
//! write. Edges follow the usual data-flow rules of `depend(in/out)` task systems:
//!
//! - a read depends on the last writer of the key;
//! - a write depends on the last writer and on every reader since that writer.
//!
//! So any execution that respects the edges sees exactly the same data as running the
//! tasks one after the other in insertion order. [`TaskGraph::run`] executes the graph on
//! the current rayon pool: every task whose predecessors have completed is spawned, and
//! completing a task releases its successors. No task ever blocks waiting for another.
//!
//! There is no cancellation. When a task fails, the first error is kept, the bodies of
//! the tasks that have not started yet are skipped, and the error is returned once the
//! graph has drained.

use crate::error::BlrError;
use parking_lot::Mutex;
use rayon::Scope;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Tasks of type `T` connected by data dependencies on keys of type `K`.
#[derive(Debug)]
pub struct TaskGraph<K, T> {
    tasks: Vec<T>,
    successors: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    last_writer: HashMap<K, usize>,
    readers: HashMap<K, Vec<usize>>,
}

impl<K: Hash + Eq + Clone, T> Default for TaskGraph<K, T> {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            successors: Vec::new(),
            indegree: Vec::new(),
            last_writer: HashMap::new(),
            readers: HashMap::new(),
        }
    }
}

/// Shared state of one execution.
struct Execution<'a, F> {
    body: &'a F,
    pending: Vec<AtomicUsize>,
    aborted: AtomicBool,
    failure: Mutex<Option<BlrError>>,
}

impl<K: Hash + Eq + Clone, T> TaskGraph<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of dependency edges.
    pub fn edges(&self) -> usize {
        self.indegree.iter().sum()
    }

    /// Adds a task reading `reads` and writing `writes`. Keys in `writes` are implicitly
    /// read as well.
    ///
    /// # Returns
    /// The index of the task.
    pub fn add(&mut self, task: T, reads: &[K], writes: &[K]) -> usize {
        let id = self.tasks.len();
        self.tasks.push(task);
        self.successors.push(Vec::new());
        self.indegree.push(0);

        let mut deps = Vec::new();
        for key in reads {
            if let Some(&w) = self.last_writer.get(key) {
                deps.push(w);
            }
            self.readers.entry(key.clone()).or_default().push(id);
        }
        for key in writes {
            if let Some(&w) = self.last_writer.get(key) {
                deps.push(w);
            }
            if let Some(readers) = self.readers.remove(key) {
                deps.extend(readers.into_iter().filter(|&r| r != id));
            }
            self.last_writer.insert(key.clone(), id);
        }

        deps.sort_unstable();
        deps.dedup();
        for d in deps {
            self.successors[d].push(id);
            self.indegree[id] += 1;
        }
        id
    }

    /// Runs `body` on every task, in parallel where the edges allow it.
    ///
    /// Must be called from within the rayon pool that should execute the tasks (for
    /// example inside [`rayon::ThreadPool::install`]).
    pub fn run<F>(&self, body: F) -> Result<(), BlrError>
    where
        F: Fn(&T) -> Result<(), BlrError> + Sync,
        T: Sync,
        K: Sync,
    {
        let exec = Execution {
            body: &body,
            pending: self.indegree.iter().map(|&d| AtomicUsize::new(d)).collect(),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
        };
        rayon::scope(|scope| {
            for (id, &d) in self.indegree.iter().enumerate() {
                if d == 0 {
                    let exec = &exec;
                    scope.spawn(move |s| self.execute(s, id, exec));
                }
            }
        });
        match exec.failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn execute<'s, F>(&'s self, scope: &Scope<'s>, id: usize, exec: &'s Execution<'s, F>)
    where
        F: Fn(&T) -> Result<(), BlrError> + Sync,
        T: Sync,
        K: Sync,
    {
        if !exec.aborted.load(Ordering::Acquire) {
            if let Err(err) = (exec.body)(&self.tasks[id]) {
                exec.aborted.store(true, Ordering::Release);
                let mut slot = exec.failure.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
        for &succ in &self.successors[id] {
            if exec.pending[succ].fetch_sub(1, Ordering::AcqRel) == 1 {
                scope.spawn(move |s| self.execute(s, succ, exec));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlrErrorKind;

    #[test]
    fn test_edges_follow_read_write_rules() {
        let mut g: TaskGraph<&str, usize> = TaskGraph::new();
        let w0 = g.add(0, &[], &["a"]);
        let r1 = g.add(1, &["a"], &["b"]);
        let r2 = g.add(2, &["a"], &["c"]);
        let w3 = g.add(3, &["b", "c"], &["a"]);
        assert_eq!(g.successors[w0], vec![r1, r2, w3]);
        // The write of "a" waits for both readers and the previous writer.
        assert_eq!(g.indegree[w3], 3);
        assert_eq!(g.edges(), 5);
    }

    #[test]
    fn test_run_respects_dependencies() -> Result<(), BlrError> {
        let mut g: TaskGraph<usize, (usize, usize)> = TaskGraph::new();
        // A chain of read-modify-write tasks on four keys, interleaved.
        for step in 0..20 {
            for key in 0..4 {
                g.add((key, step), &[], &[key]);
            }
        }
        let log = Mutex::new(Vec::new());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .map_err(|e| BlrErrorKind::ThreadPool(e.to_string()))?;
        pool.install(|| {
            g.run(|&(key, step)| {
                log.lock().push((key, step));
                Ok(())
            })
        })?;
        let log = log.into_inner();
        assert_eq!(log.len(), 80);
        for key in 0..4 {
            let steps: Vec<usize> = log.iter().filter(|e| e.0 == key).map(|e| e.1).collect();
            assert_eq!(steps, (0..20).collect::<Vec<_>>());
        }
        Ok(())
    }

    #[test]
    fn test_failure_skips_dependents() {
        let mut g: TaskGraph<u8, u32> = TaskGraph::new();
        g.add(0, &[], &[1]);
        g.add(1, &[1], &[2]);
        g.add(2, &[2], &[3]);
        let ran = Mutex::new(Vec::new());
        let result = g.run(|&t| {
            ran.lock().push(t);
            if t == 1 {
                Err(BlrErrorKind::SingularPivot { row: 4 }.into())
            } else {
                Ok(())
            }
        });
        assert_eq!(
            result.unwrap_err().kind(),
            &BlrErrorKind::SingularPivot { row: 4 }
        );
        assert_eq!(ran.into_inner(), vec![0, 1]);
    }

    #[test]
    fn test_empty_graph_runs() {
        let g: TaskGraph<u8, ()> = TaskGraph::new();
        assert!(g.is_empty());
        assert!(g.run(|_| Ok(())).is_ok());
    }
}
