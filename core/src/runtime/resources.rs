//! State shared by every worker session of one simulated cluster.
//!
//! Two things outlive a single worker's graph:
//!
//! - variables placed on the parameter-server job, addressed by name, and
//! - FIFO queues addressed by their shared name, used for cross-worker barriers.
//!
//! Queues are `crossbeam` bounded channels. A dequeue that waits longer than the configured
//! timeout fails instead of hanging the step.

use crate::error::{Error, Result};
use crate::graph::Variable;
use crate::tensor::Tensor;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Job name whose variables live in the shared store.
pub const PS_JOB: &str = "ps";

const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

type Queue = (Sender<bool>, Receiver<bool>);

#[derive(Debug)]
pub struct ClusterResources {
    variables: Mutex<HashMap<String, Tensor<f32>>>,
    queues: Mutex<HashMap<String, Queue>>,
    queue_timeout: Duration,
}

impl Default for ClusterResources {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| Error::Runtime(format!("{what} lock poisoned")))
}

impl ClusterResources {
    pub fn new() -> Self {
        Self {
            variables: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        }
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Variables on the parameter-server job are shared between workers.
    pub fn is_shared(var: &Variable) -> bool {
        var.device.job.as_deref() == Some(PS_JOB)
    }

    /// Stores `value` unless another worker already initialized `name`.
    pub fn init_variable(&self, name: &str, value: &Tensor<f32>) -> Result<()> {
        lock(&self.variables, "variable store")?
            .entry(name.to_string())
            .or_insert_with(|| value.clone());
        Ok(())
    }

    pub fn read_variable(&self, name: &str) -> Result<Tensor<f32>> {
        lock(&self.variables, "variable store")?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("shared variable {name} is not initialized")))
    }

    pub fn assign_variable(&self, name: &str, value: Tensor<f32>) -> Result<()> {
        lock(&self.variables, "variable store")?.insert(name.to_string(), value);
        Ok(())
    }

    /// Runs `f` on the stored value while holding the store lock.
    pub fn update_variable<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tensor<f32>) -> Result<()>,
    {
        let mut store = lock(&self.variables, "variable store")?;
        let value = store
            .get_mut(name)
            .ok_or_else(|| Error::Runtime(format!("shared variable {name} is not initialized")))?;
        f(value)
    }

    fn queue(&self, shared_name: &str, capacity: usize) -> Result<Queue> {
        let mut queues = lock(&self.queues, "queue table")?;
        let q = queues
            .entry(shared_name.to_string())
            .or_insert_with(|| bounded(capacity.max(1)));
        Ok(q.clone())
    }

    pub fn enqueue(&self, shared_name: &str, capacity: usize, token: bool) -> Result<()> {
        let (tx, _) = self.queue(shared_name, capacity)?;
        tx.send_timeout(token, self.queue_timeout)
            .map_err(|_| Error::Runtime(format!("enqueue to {shared_name} timed out")))
    }

    /// Removes `count` tokens, blocking until each is available.
    pub fn dequeue_many(&self, shared_name: &str, capacity: usize, count: usize) -> Result<Vec<bool>> {
        let (_, rx) = self.queue(shared_name, capacity)?;
        (0..count)
            .map(|i| {
                rx.recv_timeout(self.queue_timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => Error::Runtime(format!(
                        "dequeue {}/{count} from {shared_name} timed out",
                        i + 1
                    )),
                    RecvTimeoutError::Disconnected => {
                        Error::Runtime(format!("queue {shared_name} disconnected"))
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_initializer_wins() {
        let r = ClusterResources::new();
        r.init_variable("w", &Tensor::full([2], 1.0)).unwrap();
        r.init_variable("w", &Tensor::full([2], 5.0)).unwrap();
        assert_eq!(r.read_variable("w").unwrap().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_queue_roundtrip() {
        let r = ClusterResources::new();
        r.enqueue("q0", 2, false).unwrap();
        r.enqueue("q0", 2, false).unwrap();
        assert_eq!(r.dequeue_many("q0", 2, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_dequeue_times_out() {
        let r = ClusterResources::new().with_queue_timeout(Duration::from_millis(10));
        assert!(matches!(r.dequeue_many("empty", 1, 1), Err(Error::Runtime(_))));
    }
}
