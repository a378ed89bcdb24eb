//! Ordered blocking queues handing completed requests from the network threads to the training loop.

use std::{
    collections::{HashMap, VecDeque},
    error::Error,
    fmt,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

/// Signals that a request on `channel` has fully landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub channel: String,
    pub seq: u64,
}

impl TaskEntry {
    pub fn new(channel: impl Into<String>, seq: u64) -> Self {
        Self {
            channel: channel.into(),
            seq,
        }
    }
}

/// Failures of the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueErr {
    /// The channel was never registered.
    Unregistered(String),
    /// The channel was closed, no more entries will come out of it.
    Closed(String),
    /// The channel reached its configured capacity.
    Full { channel: String, capacity: usize },
    /// No entry showed up before the deadline.
    Timeout(String),
}

impl fmt::Display for QueueErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered(channel) => write!(f, "channel `{channel}` is not registered"),
            Self::Closed(channel) => write!(f, "channel `{channel}` is closed"),
            Self::Full { channel, capacity } => {
                write!(f, "channel `{channel}` is full ({capacity} entries)")
            }
            Self::Timeout(channel) => write!(f, "timed out waiting on channel `{channel}`"),
        }
    }
}

impl Error for QueueErr {}

#[derive(Debug, Default)]
struct ChannelState {
    entries: VecDeque<TaskEntry>,
    /// Slots handed out by `reserve` and not filled or dropped yet.
    reserved: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Channel {
    state: Mutex<ChannelState>,
    ready: Condvar,
}

/// A place on a channel taken by `TaskQueue::reserve`, released when dropped unfilled.
#[derive(Debug)]
pub struct TaskSlot {
    name: String,
    chan: Option<Arc<Channel>>,
}

impl TaskSlot {
    /// Appends `entry` to the reserved channel and wakes one waiting popper.
    ///
    /// Never fails: a slot reserved while the channel was open is honored even if
    /// the channel was closed since, its entry is popped before `Closed` is reported.
    pub fn fill(mut self, entry: TaskEntry) {
        let Some(chan) = self.chan.take() else {
            return;
        };

        debug!(seq = entry.seq; "pushing task on channel {}", self.name);

        let mut state = chan.state.lock();
        state.reserved -= 1;
        state.entries.push_back(entry);
        drop(state);

        chan.ready.notify_one();
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(chan) = self.chan.take() {
            chan.state.lock().reserved -= 1;
        }
    }
}

/// A set of named FIFO channels.
///
/// `push` never blocks, `pop` parks the calling thread until an entry arrives or the
/// channel is closed. Entries pushed before `close` are still handed out, after them
/// poppers get `QueueErr::Closed`.
#[derive(Debug, Default)]
pub struct TaskQueue {
    capacity: Option<NonZeroUsize>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl TaskQueue {
    /// Creates a new `TaskQueue`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of pending entries per channel, unbounded if `None`.
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `channel`, registering it twice is a no-op.
    pub fn register(&self, channel: &str) {
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default();
    }

    /// The registered channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn channel(&self, channel: &str) -> Result<Arc<Channel>, QueueErr> {
        self.channels
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| QueueErr::Unregistered(channel.to_string()))
    }

    /// Takes a place on `channel` for an entry that will be pushed later.
    ///
    /// Reserved places count against the capacity until they are filled or dropped.
    ///
    /// # Returns
    /// The slot, or the error `push` would have returned.
    pub fn reserve(&self, channel: &str) -> Result<TaskSlot, QueueErr> {
        let chan = self.channel(channel)?;
        let mut state = chan.state.lock();

        if state.closed {
            return Err(QueueErr::Closed(channel.to_string()));
        }

        if let Some(capacity) = self.capacity {
            if state.entries.len() + state.reserved >= capacity.get() {
                return Err(QueueErr::Full {
                    channel: channel.to_string(),
                    capacity: capacity.get(),
                });
            }
        }

        state.reserved += 1;
        drop(state);

        Ok(TaskSlot {
            name: channel.to_string(),
            chan: Some(chan),
        })
    }

    /// Appends `entry` to `channel` and wakes one waiting popper.
    pub fn push(&self, channel: &str, entry: TaskEntry) -> Result<(), QueueErr> {
        self.reserve(channel)?.fill(entry);
        Ok(())
    }

    /// Takes the oldest entry of `channel`, blocking until there is one.
    pub fn pop(&self, channel: &str) -> Result<TaskEntry, QueueErr> {
        let chan = self.channel(channel)?;
        let mut state = chan.state.lock();

        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Ok(entry);
            }

            if state.closed {
                return Err(QueueErr::Closed(channel.to_string()));
            }

            chan.ready.wait(&mut state);
        }
    }

    /// Same as `pop` but gives up after `timeout`.
    pub fn pop_timeout(&self, channel: &str, timeout: Duration) -> Result<TaskEntry, QueueErr> {
        let chan = self.channel(channel)?;
        let deadline = Instant::now() + timeout;
        let mut state = chan.state.lock();

        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Ok(entry);
            }

            if state.closed {
                return Err(QueueErr::Closed(channel.to_string()));
            }

            if chan.ready.wait_until(&mut state, deadline).timed_out() {
                return state
                    .entries
                    .pop_front()
                    .ok_or_else(|| QueueErr::Timeout(channel.to_string()));
            }
        }
    }

    /// Takes the oldest entry of `channel` if there is one.
    pub fn try_pop(&self, channel: &str) -> Result<Option<TaskEntry>, QueueErr> {
        let chan = self.channel(channel)?;
        let mut state = chan.state.lock();

        match state.entries.pop_front() {
            Some(entry) => Ok(Some(entry)),
            None if state.closed => Err(QueueErr::Closed(channel.to_string())),
            None => Ok(None),
        }
    }

    /// The amount of pending entries on `channel`.
    pub fn len(&self, channel: &str) -> Result<usize, QueueErr> {
        Ok(self.channel(channel)?.state.lock().entries.len())
    }

    /// Closes `channel`, waking every blocked popper.
    pub fn close(&self, channel: &str) -> Result<(), QueueErr> {
        let chan = self.channel(channel)?;
        chan.state.lock().closed = true;
        chan.ready.notify_all();
        Ok(())
    }

    /// Closes every registered channel.
    pub fn close_all(&self) {
        for chan in self.channels.read().values() {
            chan.state.lock().closed = true;
            chan.ready.notify_all();
        }
    }
}
