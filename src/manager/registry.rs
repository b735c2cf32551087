use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::models::task::Lane;
use crate::utils::lock;
use crate::worker::task::Task;

pub const DEFAULT_CAPACITY: usize = 500;

/// What [`TaskRegistry::put`] does when every slot holds a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Log a warning and track the task anyway.
    #[default]
    Admit,
    Reject,
}

/// Bookkeeping for the background tasks one window or controller launched.
///
/// Lanes are only labels: the registry never serializes tasks of a lane.
/// All methods take `&self`; the lane map is behind a mutex so the registry
/// can be shared with worker threads.
#[derive(Debug)]
pub struct TaskRegistry {
    capacity: usize,
    policy: OverflowPolicy,
    lanes: Mutex<BTreeMap<Lane, Vec<Task>>>,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverflowPolicy::default())
    }

    pub fn with_policy(capacity: usize, policy: OverflowPolicy) -> Self {
        TaskRegistry {
            capacity,
            policy,
            lanes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Tracks `task` under `lane`, after pruning finished tasks from every lane.
    pub fn put(&self, task: Task, lane: Lane) -> Result<(), TaskError> {
        self.put_all(vec![task], lane)
    }

    /// Admits `tasks` together: under [`OverflowPolicy::Reject`] either all of
    /// them are tracked or none is.
    pub fn put_all(&self, tasks: Vec<Task>, lane: Lane) -> Result<(), TaskError> {
        let mut lanes = self.lock();
        let pruned = prune(&mut lanes);
        if pruned > 0 {
            debug!("Pruned {} finished tasks.", pruned);
        }

        let live: usize = lanes.values().map(Vec::len).sum();
        if live + tasks.len() > self.capacity {
            let id = tasks.first().map(Task::id);
            match (self.policy, id) {
                (_, None) => {}
                (OverflowPolicy::Admit, Some(id)) => warn!(
                    "Registry over capacity ({} live, capacity {}), admitting task '{}' anyway.",
                    live, self.capacity, id
                ),
                (OverflowPolicy::Reject, Some(id)) => {
                    warn!("Registry full, task '{}' rejected.", id);
                    return Err(TaskError::CapacityExhausted {
                        id,
                        lane,
                        capacity: self.capacity,
                    });
                }
            }
        }

        let slot = lanes.entry(lane).or_default();
        for task in tasks {
            debug!("Task '{}' registered in lane {}.", task.id(), lane);
            slot.push(task);
        }
        Ok(())
    }

    /// True iff no lane holds an unfinished task.
    pub fn is_empty(&self) -> bool {
        self.lock()
            .values()
            .flatten()
            .all(|task| task.is_finished())
    }

    pub fn live_count(&self) -> usize {
        self.lock()
            .values()
            .flatten()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn lane_count(&self, lane: Lane) -> usize {
        self.lock()
            .get(&lane)
            .map(|tasks| tasks.iter().filter(|task| !task.is_finished()).count())
            .unwrap_or(0)
    }

    /// Joins every tracked task, then drops the finished ones.
    ///
    /// Must not be called from the thread pumping the event loop that a
    /// tracked task's work waits on.
    pub fn wait_all(&self) {
        let tasks: Vec<Task> = self.lock().values().flatten().cloned().collect();
        for task in &tasks {
            task.join();
        }
        prune(&mut self.lock());
    }

    /// Terminates every live task and clears the bookkeeping.
    /// Returns how many tasks were terminated.
    pub fn stop_all(&self) -> usize {
        let stopped = self.terminate_all();
        info!("Stopped {} running tasks.", stopped);
        stopped
    }

    /// Force-quit path. Same effect as [`TaskRegistry::stop_all`].
    pub fn kill_all(&self) -> usize {
        let killed = self.terminate_all();
        warn!("Killed {} running tasks.", killed);
        killed
    }

    fn terminate_all(&self) -> usize {
        let tasks: Vec<Task> = {
            let mut lanes = self.lock();
            let drained: Vec<Task> = lanes
                .values_mut()
                .flat_map(|tasks| tasks.drain(..))
                .collect();
            lanes.clear();
            drained
        };
        // terminate() returns false for tasks that already finished
        tasks.iter().filter(|task| task.terminate()).count()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Lane, Vec<Task>>> {
        lock(&self.lanes)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn prune(lanes: &mut BTreeMap<Lane, Vec<Task>>) -> usize {
    let mut pruned = 0;
    for tasks in lanes.values_mut() {
        let before = tasks.len();
        tasks.retain(|task| !task.is_finished());
        pruned += before - tasks.len();
    }
    lanes.retain(|_, tasks| !tasks.is_empty());
    pruned
}
