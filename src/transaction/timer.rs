use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

#[derive(Debug, PartialEq, Eq, Clone)]
struct TimerKey {
    execute_at: Instant,
    task_id: u64,
}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.task_id.cmp(&other.task_id))
    }
}

/// Coarse timer wheel shared by every transaction. `poll` is pumped from a
/// single endpoint task; due entries are drained in deadline order.
pub struct Timer<T> {
    tasks: RwLock<BTreeMap<TimerKey, T>>,
    id_to_tasks: RwLock<HashMap<u64, Instant>>,
    last_task_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            tasks: RwLock::new(BTreeMap::new()),
            id_to_tasks: RwLock::new(HashMap::new()),
            last_task_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|ts| ts.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, execute_at: Instant, value: T) -> u64 {
        let task_id = self.last_task_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tasks) = self.tasks.write() {
            tasks.insert(
                TimerKey {
                    execute_at,
                    task_id,
                },
                value,
            );
        }
        if let Ok(mut ids) = self.id_to_tasks.write() {
            ids.insert(task_id, execute_at);
        }
        task_id
    }

    pub fn cancel(&self, task_id: u64) -> Option<T> {
        let execute_at = self
            .id_to_tasks
            .write()
            .ok()
            .and_then(|mut ids| ids.remove(&task_id))?;
        self.tasks.write().ok().and_then(|mut tasks| {
            tasks.remove(&TimerKey {
                execute_at,
                task_id,
            })
        })
    }

    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut result = Vec::new();
        let drained_ids = {
            let mut tasks = match self.tasks.write() {
                Ok(tasks) => tasks,
                Err(_) => return result,
            };
            let due = tasks
                .range(
                    ..=TimerKey {
                        execute_at: now,
                        task_id: u64::MAX,
                    },
                )
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            if due.is_empty() {
                return result;
            }
            result.reserve(due.len());
            for key in due.iter() {
                if let Some(value) = tasks.remove(key) {
                    result.push(value);
                }
            }
            due
        };
        if let Ok(mut ids) = self.id_to_tasks.write() {
            for key in drained_ids {
                ids.remove(&key.task_id);
            }
        }
        result
    }
}
