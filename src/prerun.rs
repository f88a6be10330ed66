//! Time-boxed strong retention for speculatively started tasks.
//!
//! A speculative run may finish before anything is around to read its result.
//! The registry keeps the task alive until it is consumed, settles, or the
//! deadline passes, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::task::{Task, TaskId};

struct Hold {
    task: Task,
    deadline: Instant,
    generation: u64,
    expiry: AbortHandle,
}

#[derive(Default)]
struct Holds {
    map: HashMap<TaskId, Hold>,
    generation: u64,
}

pub struct PrerunRegistry {
    ttl: Duration,
    holds: Arc<Mutex<Holds>>,
}

impl PrerunRegistry {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            holds: Arc::default(),
        }
    }

    /// Holds `task` strongly until the deadline. Protecting an already
    /// protected task refreshes its deadline.
    pub fn protect(&self, task: &Task) {
        let deadline = Instant::now() + self.ttl;
        let mut holds = self.holds.lock().unwrap();
        holds.generation += 1;
        let generation = holds.generation;

        let expiry = spawn_expiry(Arc::downgrade(&self.holds), task.id(), generation, deadline);
        let hold = Hold {
            task: task.clone(),
            deadline,
            generation,
            expiry,
        };

        if let Some(old) = holds.map.insert(task.id(), hold) {
            old.expiry.abort();
        }
    }

    /// Releases the hold on `task`. Idempotent.
    pub fn unprotect(&self, task: &Task) {
        let removed = self.holds.lock().unwrap().map.remove(&task.id());
        if let Some(hold) = removed {
            hold.expiry.abort();
        }
    }

    pub fn is_protected(&self, task: &Task) -> bool {
        self.holds.lock().unwrap().map.contains_key(&task.id())
    }

    /// Deadline of the current hold on `task`.
    pub fn deadline(&self, task: &Task) -> Option<Instant> {
        self.holds
            .lock()
            .unwrap()
            .map
            .get(&task.id())
            .map(|hold| hold.deadline)
    }

    pub fn len(&self) -> usize {
        self.holds.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_expiry(
    holds: Weak<Mutex<Holds>>,
    id: TaskId,
    generation: u64,
    deadline: Instant,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;

        let Some(holds) = holds.upgrade() else {
            return;
        };

        // Dropped outside the lock: the task may own more tasks.
        let expired = {
            let mut holds = holds.lock().unwrap();
            match holds.map.get(&id) {
                Some(hold) if hold.generation == generation => holds.map.remove(&id),
                _ => None,
            }
        };

        if let Some(hold) = expired {
            tracing::debug!("prerun protection expired for {}", hold.task.name());
        }
    })
    .abort_handle()
}
