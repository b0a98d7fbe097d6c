//! Cooperative task scheduler.
//!
//! The scripting host has no native coroutine support, so "cooperative" is
//! implemented, not inherited: each spawned task runs its body on a
//! dedicated OS thread, but that thread is parked waiting on a rendezvous
//! channel except for the single instant the scheduler has told it to run.
//! The scheduler is the sole arbiter of which task's thread is unparked at
//! any moment, so scheduling policy is exactly as cooperative and
//! single-threaded-equivalent as a hand-rolled state machine would be; OS
//! threads are only the mechanism used to let a script function suspend
//! mid-body.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::errors::ScriptError;

pub type TaskId = u64;

pub enum TaskEvent {
    Yielded(TaskId),
    SleepingUntil(TaskId, Instant),
    WaitingIo(TaskId, Box<dyn FnMut() -> bool + Send>),
    Finished(TaskId, Result<(), ScriptError>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    Proceed,
    Cancelled,
}

/// Cloned into every native suspension function (`sleep_seconds`,
/// `yield_now`, `receive_async`) a task's script registers.
#[derive(Clone)]
pub struct SuspendHandle {
    task_id: TaskId,
    to_scheduler: Sender<TaskEvent>,
    resume_rx: Arc<Mutex<Receiver<Resume>>>,
}

impl SuspendHandle {
    fn rendezvous(&self, event: TaskEvent) -> Result<(), ScriptError> {
        let _ = self.to_scheduler.send(event);
        let rx = self.resume_rx.lock().expect("resume channel poisoned");
        match rx.recv() {
            Ok(Resume::Proceed) | Err(_) => Ok(()),
            Ok(Resume::Cancelled) => Err(ScriptError::Runtime {
                function: "suspend".into(),
                message: "task cancelled".into(),
            }),
        }
    }

    pub fn yield_now(&self) -> Result<(), ScriptError> {
        self.rendezvous(TaskEvent::Yielded(self.task_id))
    }

    pub fn sleep_seconds(&self, seconds: f64) -> Result<(), ScriptError> {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        self.rendezvous(TaskEvent::SleepingUntil(self.task_id, deadline))
    }

    /// Blocks until `condition` reports true or the task is cancelled.
    /// `condition` is polled by the scheduler, never by the task thread
    /// itself, so it must be cheap and non-blocking.
    pub fn wait_io(&self, condition: Box<dyn FnMut() -> bool + Send>) -> Result<(), ScriptError> {
        self.rendezvous(TaskEvent::WaitingIo(self.task_id, condition))
    }

    /// Waits for the very first Proceed before the task body runs at all,
    /// so a freshly spawned task never preempts the one currently running.
    fn await_initial_start(&self) -> Resume {
        let rx = self.resume_rx.lock().expect("resume channel poisoned");
        rx.recv().unwrap_or(Resume::Cancelled)
    }
}

enum Waiting {
    Sleeping(Instant),
    Io(Box<dyn FnMut() -> bool + Send>),
}

struct TaskSlot {
    resume_tx: Sender<Resume>,
    join: Option<JoinHandle<()>>,
}

/// One worker's scheduler: a ready queue, a sleeping set, and an IO-waiter
/// list, all driven from the worker's own thread.
pub struct Scheduler {
    next_id: AtomicU64,
    tasks: HashMap<TaskId, TaskSlot>,
    ready: VecDeque<TaskId>,
    waiting: HashMap<TaskId, Waiting>,
    events_tx: Sender<TaskEvent>,
    events_rx: Receiver<TaskEvent>,
    idle_sleep: Duration,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(idle_sleep: Duration, stop: Arc<AtomicBool>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            next_id: AtomicU64::new(0),
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            waiting: HashMap::new(),
            events_tx,
            events_rx,
            idle_sleep,
            stop,
        }
    }

    /// Spawns `body` as a new task. `body` receives a `SuspendHandle` it
    /// must use for every suspension point; it runs to completion (or to
    /// cancellation) on its own OS thread, but only while the scheduler has
    /// it marked as the running task.
    pub fn spawn_task<F>(&mut self, body: F) -> TaskId
    where
        F: FnOnce(SuspendHandle) -> Result<(), ScriptError> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (resume_tx, resume_rx) = mpsc::channel();
        let handle = SuspendHandle {
            task_id: id,
            to_scheduler: self.events_tx.clone(),
            resume_rx: Arc::new(Mutex::new(resume_rx)),
        };
        let events_tx = self.events_tx.clone();
        let join = std::thread::spawn(move || {
            match handle.await_initial_start() {
                Resume::Cancelled => {
                    let _ = events_tx.send(TaskEvent::Finished(
                        id,
                        Err(ScriptError::Runtime {
                            function: "spawn_task".into(),
                            message: "task cancelled before start".into(),
                        }),
                    ));
                    return;
                }
                Resume::Proceed => {}
            }
            let result = body(handle);
            let _ = events_tx.send(TaskEvent::Finished(id, result));
        });
        self.tasks.insert(
            id,
            TaskSlot {
                resume_tx,
                join: Some(join),
            },
        );
        self.ready.push_back(id);
        id
    }

    fn promote_ready(&mut self) {
        let now = Instant::now();
        let due: Vec<TaskId> = self
            .waiting
            .iter()
            .filter_map(|(id, w)| match w {
                Waiting::Sleeping(deadline) if *deadline <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in due {
            self.waiting.remove(&id);
            self.ready.push_back(id);
        }

        let ready_io: Vec<TaskId> = self
            .waiting
            .iter_mut()
            .filter_map(|(id, w)| match w {
                Waiting::Io(cond) => {
                    if cond() {
                        Some(*id)
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect();
        for id in ready_io {
            self.waiting.remove(&id);
            self.ready.push_back(id);
        }
    }

    fn handle_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Yielded(id) => self.ready.push_back(id),
            TaskEvent::SleepingUntil(id, deadline) => {
                self.waiting.insert(id, Waiting::Sleeping(deadline));
            }
            TaskEvent::WaitingIo(id, cond) => {
                self.waiting.insert(id, Waiting::Io(cond));
            }
            TaskEvent::Finished(id, result) => {
                if let Err(err) = &result {
                    log::warn!("task {id} finished with error: {err}");
                }
                if let Some(slot) = self.tasks.remove(&id) {
                    if let Some(join) = slot.join {
                        let _ = join.join();
                    }
                }
            }
        }
    }

    /// Runs one scheduling step: promotes due sleepers/IO-waiters, then
    /// resumes at most one ready task and processes the event it reports
    /// back. Returns `true` if a task ran this step.
    pub fn step(&mut self) -> bool {
        self.promote_ready();
        let Some(id) = self.ready.pop_front() else {
            return false;
        };
        let Some(slot) = self.tasks.get(&id) else {
            return false;
        };
        if slot.resume_tx.send(Resume::Proceed).is_err() {
            self.tasks.remove(&id);
            return false;
        }
        if let Ok(event) = self.events_rx.recv() {
            self.handle_event(event);
        }
        true
    }

    /// Drives the scheduler until every task has finished or the stop flag
    /// is observed, at which point every remaining task is cancelled and
    /// drained.
    pub fn run_until_stopped(&mut self) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.cancel_all();
                return;
            }
            if self.tasks.is_empty() {
                return;
            }
            if !self.step() {
                std::thread::sleep(self.idle_sleep);
            }
        }
    }

    /// Cancels every scheduled task immediately, regardless of the stop
    /// flag. Used by a worker's main loop once it has itself observed the
    /// stop flag and wants to drain remaining tasks before exiting.
    pub fn shutdown(&mut self) {
        self.cancel_all();
    }

    fn cancel_all(&mut self) {
        self.waiting.clear();
        self.ready.clear();
        let ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.tasks.get(&id) {
                let _ = slot.resume_tx.send(Resume::Cancelled);
            }
        }
        while !self.tasks.is_empty() {
            if let Ok(event) = self.events_rx.recv() {
                self.handle_event(event);
            } else {
                break;
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(Duration::from_millis(1), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn single_task_runs_to_completion() {
        let mut sched = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        sched.spawn_task(move |_handle| {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        while sched.task_count() > 0 {
            sched.step();
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn yielding_task_resumes_after_others() {
        let mut sched = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        sched.spawn_task(move |handle| {
            order_a.lock().unwrap().push("a1");
            handle.yield_now()?;
            order_a.lock().unwrap().push("a2");
            Ok(())
        });
        let order_b = order.clone();
        sched.spawn_task(move |_handle| {
            order_b.lock().unwrap().push("b1");
            Ok(())
        });

        while sched.task_count() > 0 {
            sched.step();
        }
        let seq = order.lock().unwrap().clone();
        assert_eq!(seq, vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn sleeping_task_does_not_resume_before_deadline() {
        let mut sched = scheduler();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        sched.spawn_task(move |handle| {
            handle.sleep_seconds(0.02)?;
            done_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        sched.step(); // runs until the sleep call
        assert!(!done.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(40));
        while sched.task_count() > 0 {
            sched.step();
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_flag_cancels_pending_tasks() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sched = Scheduler::new(Duration::from_millis(1), stop.clone());
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_clone = cancelled.clone();
        sched.spawn_task(move |handle| match handle.sleep_seconds(10.0) {
            Err(_) => {
                cancelled_clone.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(()) => Ok(()),
        });
        sched.step(); // task reaches its sleep call and parks
        stop.store(true, Ordering::Release);
        sched.run_until_stopped();
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn io_waiter_resumes_once_condition_is_true() {
        let mut sched = scheduler();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_for_task = flag.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        sched.spawn_task(move |handle| {
            let flag_check = flag_for_task.clone();
            handle.wait_io(Box::new(move || flag_check.load(Ordering::SeqCst)))?;
            done_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        sched.step();
        assert!(!done.load(Ordering::SeqCst));
        flag.store(true, Ordering::SeqCst);
        while sched.task_count() > 0 {
            sched.step();
        }
        assert!(done.load(Ordering::SeqCst));
    }
}
