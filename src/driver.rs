// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental decode driving.
//!
//! A [`DecodeSession`] owns one engine and one [`BufferQueue`] and advances by
//! exactly one engine step per [`DecodeSession::step`]. The [`Scheduler`] polls
//! sessions round-robin, so a long push/decode sequence never nests calls and
//! independent sessions interleave.

use crate::engine::{DecodeStatus, DecoderEngine, FrameCallback};
use crate::{BufferQueue, DecodeConfig, Error, Result};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Lifecycle of a [`DecodeSession`].
///
/// `Idle → Decoding → Flushing → Done`, or `Failed` from any running state.
/// `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Decoding,
    Flushing,
    Done,
    Failed,
}

impl DriverState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// How a successful session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The engine went idle after the flush with no output pending.
    Finished,
    /// The engine asked for more input again after the flush.
    ///
    /// libde265 reports this once it has drained everything; other engines may
    /// mean something else by it.
    InputExhausted,
}

type CompletionCallback = std::boxed::Box<dyn FnOnce(Result<Completion>)>;

/// One decoder engine fed from one buffer queue.
///
/// The terminal callback fires exactly once, when the session reaches `Done` or
/// `Failed`. Frame callbacks fire from inside engine steps, so every frame produced
/// before completion is delivered before the terminal callback. A session cannot
/// be cancelled once started; dropping it before completion releases the engine
/// without calling the terminal callback.
pub struct DecodeSession<E: DecoderEngine> {
    engine: E,
    queue: BufferQueue,
    state: DriverState,
    on_complete: Option<CompletionCallback>,
    timestamp: u64,
}

impl<E: DecoderEngine> DecodeSession<E> {
    /// Install `on_frame` on the engine, apply the filter policy from `config`, and
    /// return an `Idle` session.
    pub fn new<F>(mut engine: E, queue: BufferQueue, on_frame: FrameCallback, on_complete: F, config: &DecodeConfig) -> Self
    where
        F: FnOnce(Result<Completion>) + 'static,
    {
        engine.set_frame_callback(on_frame);
        engine.disable_filters(config.disable_filters);
        debug!(
            "session created: {} buffer(s), {} bytes, filters {}",
            queue.len(),
            queue.byte_len(),
            if config.disable_filters { "off" } else { "on" }
        );
        Self {
            engine,
            queue,
            state: DriverState::Idle,
            on_complete: Some(std::boxed::Box::new(on_complete)),
            timestamp: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run one engine step and apply the resulting transition.
    ///
    /// Does nothing once the session is terminal.
    pub fn step(&mut self) -> DriverState {
        match self.state {
            DriverState::Done | DriverState::Failed => return self.state,
            DriverState::Idle => self.state = DriverState::Decoding,
            DriverState::Decoding | DriverState::Flushing => {},
        }

        match self.engine.decode_step() {
            DecodeStatus::Ok => {
                // The queue only becomes exhausted together with the flush
                if self.queue.is_exhausted() && !self.engine.has_more_output() {
                    self.finish(Ok(Completion::Finished));
                }
            },
            DecodeStatus::NeedsMoreInput => self.feed(),
            DecodeStatus::Other(code) => {
                warn!("decoder engine failed with status {code}");
                self.finish(Err(Error::Decode(code)));
            },
        }
        self.state
    }

    fn feed(&mut self) {
        if self.queue.is_exhausted() {
            self.finish(Ok(Completion::InputExhausted));
            return;
        }

        match self.queue.pop_front() {
            Some(buffer) => {
                debug!("push {} bytes at timestamp {}", buffer.len(), self.timestamp);
                match self.engine.push_data(&buffer, self.timestamp) {
                    Ok(()) => {
                        self.timestamp += 1;
                        self.state = DriverState::Decoding;
                    },
                    Err(e) => self.finish(Err(e)),
                }
            },
            None => {
                debug!("input queue exhausted, flushing");
                self.queue.mark_exhausted();
                self.engine.flush();
                self.state = DriverState::Flushing;
            },
        }
    }

    fn finish(&mut self, outcome: Result<Completion>) {
        self.state = if outcome.is_ok() { DriverState::Done } else { DriverState::Failed };
        debug!("session {:?}: {:?}", self.state, outcome);
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(outcome);
        }
    }
}

/// Result of polling a [`Task`] once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoll {
    Pending,
    Complete,
}

/// A unit of cooperative work that advances one step per poll.
pub trait Task {
    fn poll_step(&mut self) -> TaskPoll;
}

impl<E: DecoderEngine> Task for DecodeSession<E> {
    fn poll_step(&mut self) -> TaskPoll {
        if self.step().is_terminal() {
            TaskPoll::Complete
        } else {
            TaskPoll::Pending
        }
    }
}

enum Job {
    Task(std::boxed::Box<dyn Task>),
    Deferred(std::boxed::Box<dyn FnOnce()>),
}

type RunQueue = Rc<RefCell<VecDeque<Job>>>;

/// Single-threaded round-robin run queue.
///
/// Each tick runs one job: a task is polled once and re-queued at the back while
/// it is pending; a deferred closure runs once. Jobs may queue more work through a
/// [`Spawner`], including from inside engine callbacks.
#[derive(Default)]
pub struct Scheduler {
    jobs: RunQueue,
}

/// Cloneable handle for queueing work on a [`Scheduler`].
#[derive(Clone)]
pub struct Spawner {
    jobs: RunQueue,
}

impl Spawner {
    pub fn spawn<T: Task + 'static>(&self, task: T) {
        self.jobs.borrow_mut().push_back(Job::Task(std::boxed::Box::new(task)));
    }

    /// Run `f` on a later tick, after the work already queued.
    pub fn defer<F: FnOnce() + 'static>(&self, f: F) {
        self.jobs.borrow_mut().push_back(Job::Deferred(std::boxed::Box::new(f)));
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn spawner(&self) -> Spawner {
        Spawner { jobs: Rc::clone(&self.jobs) }
    }

    pub fn spawn<T: Task + 'static>(&self, task: T) {
        self.spawner().spawn(task);
    }

    pub fn defer<F: FnOnce() + 'static>(&self, f: F) {
        self.spawner().defer(f);
    }

    /// Jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.jobs.borrow().len()
    }

    /// Run one job. Returns `false` when there was nothing to run.
    pub fn tick(&self) -> bool {
        // The borrow ends before the job runs, so jobs can queue more jobs
        let job = self.jobs.borrow_mut().pop_front();
        match job {
            Some(Job::Task(mut task)) => {
                if task.poll_step() == TaskPoll::Pending {
                    self.jobs.borrow_mut().push_back(Job::Task(task));
                }
                true
            },
            Some(Job::Deferred(f)) => {
                f();
                true
            },
            None => false,
        }
    }

    /// Tick until the run queue is empty. Returns the number of ticks.
    pub fn run_until_idle(&self) -> u64 {
        let mut ticks = 0;
        while self.tick() {
            ticks += 1;
        }
        ticks
    }
}
