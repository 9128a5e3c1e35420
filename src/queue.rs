use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Trigger,
    Submit,
    Cache,
    Finish,
    FinishStudy,
    Clear,
    Sweep,
}

impl QueueName {
    pub const ALL: [QueueName; 7] = [
        QueueName::Trigger,
        QueueName::Submit,
        QueueName::Cache,
        QueueName::Finish,
        QueueName::FinishStudy,
        QueueName::Clear,
        QueueName::Sweep,
    ];

    /// Queues whose active or waiting jobs mean a population cycle is in flight.
    pub const CYCLE: [QueueName; 3] = [QueueName::Submit, QueueName::Cache, QueueName::Finish];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Trigger => "trigger",
            QueueName::Submit => "submit",
            QueueName::Cache => "cache",
            QueueName::Finish => "finish",
            QueueName::FinishStudy => "finish_study",
            QueueName::Clear => "clear",
            QueueName::Sweep => "sweep",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|queue| queue.as_str() == value.trim())
            .ok_or_else(|| CacheError::InvalidIdentifier(format!("queue {value}")))
    }
}

/// Where the rearrangement file for a Finish job comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishSource {
    /// Already on local disk, typically a synchronous download.
    LocalFile {
        final_file: Utf8PathBuf,
        delete_file: bool,
    },
    /// Produced by a finished async query and fetched by the Finish stage.
    AsyncResult { query_id: String, final_file: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishRequest {
    pub repertoire_cache_uuid: String,
    pub source: FinishSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Trigger,
    Submit,
    Cache { repertoire_cache_uuid: String },
    Finish(FinishRequest),
    FinishStudy { study_cache_uuid: String },
    Clear { repository_id: String, study_id: String },
    Sweep,
}

impl Message {
    pub fn queue(&self) -> QueueName {
        match self {
            Message::Trigger => QueueName::Trigger,
            Message::Submit => QueueName::Submit,
            Message::Cache { .. } => QueueName::Cache,
            Message::Finish(_) => QueueName::Finish,
            Message::FinishStudy { .. } => QueueName::FinishStudy,
            Message::Clear { .. } => QueueName::Clear,
            Message::Sweep => QueueName::Sweep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub message: Message,
}

impl Job {
    pub fn queue(&self) -> QueueName {
        self.message.queue()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Repeat {
    message: Message,
    every: Duration,
    next_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    waiting: HashMap<QueueName, VecDeque<Job>>,
    active: HashMap<QueueName, HashSet<u64>>,
    completed: HashMap<QueueName, u64>,
    failed: HashMap<QueueName, u64>,
    repeats: HashMap<QueueName, Repeat>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, message: Message) -> u64 {
        self.next_id += 1;
        let job = Job {
            id: self.next_id,
            message,
        };
        self.waiting.entry(job.queue()).or_default().push_back(job);
        self.next_id
    }

    fn busy(&self, queue: QueueName) -> bool {
        self.active.get(&queue).is_some_and(|jobs| !jobs.is_empty())
            || self.waiting.get(&queue).is_some_and(|jobs| !jobs.is_empty())
    }

    fn take(&mut self, queue: QueueName) -> Option<Job> {
        let job = self.waiting.get_mut(&queue)?.pop_front()?;
        self.active.entry(queue).or_default().insert(job.id);
        Some(job)
    }
}

/// In-process named job queues with waiting/active/completed/failed accounting
/// and repeatable jobs.
#[derive(Default)]
pub struct JobQueues {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl JobQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, message: Message) -> u64 {
        let queue = message.queue();
        let id = self.lock().push(message);
        tracing::debug!(%queue, job_id = id, "job enqueued");
        self.ready.notify_all();
        id
    }

    /// Enqueue `message` only if none of `guards` has an active or waiting job,
    /// checked and applied under one lock.
    pub fn enqueue_if_idle(&self, message: Message, guards: &[QueueName]) -> Option<u64> {
        let mut state = self.lock();
        if guards.iter().any(|queue| state.busy(*queue)) {
            return None;
        }
        let id = state.push(message);
        drop(state);
        self.ready.notify_all();
        Some(id)
    }

    pub fn claim(&self, queue: QueueName) -> Option<Job> {
        self.lock().take(queue)
    }

    /// Wait up to `timeout` for a job; `None` on timeout or after [`JobQueues::close`].
    pub fn claim_timeout(&self, queue: QueueName, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(job) = state.take(queue) {
                return Some(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn complete(&self, job: &Job, succeeded: bool) {
        self.complete_and_enqueue(job, succeeded, Vec::new());
    }

    /// Retire `job` and enqueue its follow-ups under one lock, so no observer
    /// sees the cycle idle between the two.
    pub fn complete_and_enqueue(&self, job: &Job, succeeded: bool, follow_ups: Vec<Message>) {
        let queue = job.queue();
        let mut state = self.lock();
        if let Some(active) = state.active.get_mut(&queue) {
            active.remove(&job.id);
        }
        let counter = if succeeded {
            state.completed.entry(queue).or_default()
        } else {
            state.failed.entry(queue).or_default()
        };
        *counter += 1;
        let queued = follow_ups.len();
        for message in follow_ups {
            state.push(message);
        }
        drop(state);
        if queued > 0 {
            self.ready.notify_all();
        }
    }

    pub fn active_count(&self, queue: QueueName) -> usize {
        self.lock().active.get(&queue).map_or(0, HashSet::len)
    }

    pub fn waiting_count(&self, queue: QueueName) -> usize {
        self.lock().waiting.get(&queue).map_or(0, VecDeque::len)
    }

    pub fn waiting_messages(&self, queue: QueueName) -> Vec<Message> {
        self.lock()
            .waiting
            .get(&queue)
            .map(|jobs| jobs.iter().map(|job| job.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn counts(&self, queue: QueueName) -> QueueCounts {
        let state = self.lock();
        QueueCounts {
            waiting: state.waiting.get(&queue).map_or(0, VecDeque::len),
            active: state.active.get(&queue).map_or(0, HashSet::len),
            completed: state.completed.get(&queue).copied().unwrap_or(0),
            failed: state.failed.get(&queue).copied().unwrap_or(0),
        }
    }

    /// Register (or replace) the recurring job for the message's queue.
    pub fn register_repeat(&self, message: Message, every: Duration) {
        let queue = message.queue();
        self.lock().repeats.insert(
            queue,
            Repeat {
                message,
                every,
                next_at: Instant::now() + every,
            },
        );
        tracing::info!(%queue, every_secs = every.as_secs(), "recurring job registered");
    }

    /// Enqueue every repeatable job due at `now`; returns how many fired.
    pub fn fire_due(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let due = state
            .repeats
            .values_mut()
            .filter(|repeat| repeat.next_at <= now)
            .map(|repeat| {
                repeat.next_at = now + repeat.every;
                repeat.message.clone()
            })
            .collect::<Vec<_>>();
        for message in &due {
            state.push(message.clone());
        }
        drop(state);
        if !due.is_empty() {
            self.ready.notify_all();
        }
        due.len()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
