//! Push/pull connection loop: debounce, slot limiting, pacing, backoff.
//!
//! One loop runs per direction. Requests to send are debounced, wait for a
//! connection slot shared across loops, pace themselves by the median of
//! recent send durations, and back off exponentially on failure. A
//! watchdog tick fires the loop even when nobody asked.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, never, unbounded};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Effect, Transience};

/// Successful send durations considered for pacing.
const DURATION_WINDOW: usize = 9;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("connection loop closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

impl RunnerError {
    pub fn transience(&self) -> Transience {
        match self {
            RunnerError::Closed => Transience::Permanent,
            RunnerError::Send(_) => Transience::Retryable,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            RunnerError::Closed => Effect::None,
            RunnerError::Send(_) => Effect::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_connections: usize,
    pub watchdog_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(30),
            max_delay: Duration::from_secs(60),
            max_connections: 3,
            watchdog_interval: Duration::from_secs(5),
        }
    }
}

/// Counting semaphore bounding concurrent sends across loops.
pub struct ConnectionSlots {
    state: Mutex<usize>,
    available: Condvar,
    capacity: usize,
}

impl ConnectionSlots {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(capacity.max(1)),
            available: Condvar::new(),
            capacity: capacity.max(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a slot frees up or `deadline_check` asks to stop.
    fn acquire(&self, mut keep_waiting: impl FnMut() -> bool) -> bool {
        let mut free = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if *free > 0 {
                *free -= 1;
                return true;
            }
            if !keep_waiting() {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(free, Duration::from_millis(50))
                .unwrap_or_else(|p| p.into_inner());
            free = guard;
        }
    }

    fn release(&self) {
        let mut free = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *free = (*free + 1).min(self.capacity);
        self.available.notify_one();
    }
}

type SendFn = Box<dyn FnMut() -> Result<(), String> + Send>;
type VisibilityFn = Box<dyn Fn() -> bool + Send>;
type Waiter = Sender<Result<(), RunnerError>>;

enum Command {
    Send { now: bool, done: Option<Waiter> },
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopState {
    Pending,
    Debounce,
    WaitSlot,
    Delay,
    Send,
}

pub struct ConnectionLoop {
    cmd_tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionLoop {
    pub fn spawn(
        name: &str,
        config: RunnerConfig,
        slots: Arc<ConnectionSlots>,
        visibility: Option<VisibilityFn>,
        send_fn: SendFn,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let thread_name = format!("viewsync-loop-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_loop(config, slots, visibility, send_fn, cmd_rx))
            .expect("spawn connection loop thread");
        Self {
            cmd_tx,
            handle: Some(handle),
        }
    }

    /// Requests a send. `now` skips the pacing delay and interrupts any
    /// sleep in progress. The returned receiver resolves when the send
    /// completes (or the loop closes).
    pub fn send(&self, now: bool) -> Result<Receiver<Result<(), RunnerError>>, RunnerError> {
        let (done_tx, done_rx) = bounded(1);
        self.cmd_tx
            .send(Command::Send {
                now,
                done: Some(done_tx),
            })
            .map_err(|_| RunnerError::Closed)?;
        Ok(done_rx)
    }

    /// Fire-and-forget variant of [`send`](Self::send).
    pub fn nudge(&self, now: bool) -> Result<(), RunnerError> {
        self.cmd_tx
            .send(Command::Send { now, done: None })
            .map_err(|_| RunnerError::Closed)
    }

    /// Terminal: pending and queued sends reject with [`RunnerError::Closed`].
    pub fn close(&mut self) {
        let _ = self.cmd_tx.send(Command::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionLoop {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoopCore {
    config: RunnerConfig,
    slots: Arc<ConnectionSlots>,
    visibility: Option<VisibilityFn>,
    send_fn: SendFn,
    durations: VecDeque<Duration>,
    delay: Duration,
    failing: bool,
}

impl LoopCore {
    /// Pacing delay: median of recent successful durations spread over the
    /// slot capacity, clamped to the configured window.
    fn recompute_delay(&mut self) {
        if self.durations.is_empty() {
            self.delay = self.config.min_delay;
            return;
        }
        let mut sorted: Vec<Duration> = self.durations.iter().copied().collect();
        sorted.sort();
        let median = sorted[sorted.len() / 2];
        let paced = median / self.config.max_connections.max(1) as u32;
        self.delay = paced.clamp(self.config.min_delay, self.config.max_delay);
    }

    fn record_success(&mut self, took: Duration) {
        if self.durations.len() == DURATION_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(took);
        if self.failing {
            self.failing = false;
            self.delay = self.config.min_delay;
        } else {
            self.recompute_delay();
        }
    }

    fn record_failure(&mut self) {
        self.failing = true;
        self.delay = (self.delay * 2).clamp(self.config.min_delay, self.config.max_delay);
    }
}

fn run_loop(
    config: RunnerConfig,
    slots: Arc<ConnectionSlots>,
    visibility: Option<VisibilityFn>,
    send_fn: SendFn,
    cmd_rx: Receiver<Command>,
) {
    let mut core = LoopCore {
        delay: config.min_delay,
        config,
        slots,
        visibility,
        send_fn,
        durations: VecDeque::new(),
        failing: false,
    };
    let mut state = LoopState::Pending;
    let mut waiters: Vec<Waiter> = Vec::new();
    let mut immediate = false;
    let mut closed = false;

    loop {
        match state {
            LoopState::Pending => {
                let timer = if core.config.watchdog_interval.is_zero() {
                    never()
                } else {
                    crossbeam::channel::after(core.config.watchdog_interval)
                };
                crossbeam::select! {
                    recv(cmd_rx) -> cmd => match cmd {
                        Ok(Command::Send { now, done }) => {
                            immediate = now;
                            if let Some(done) = done {
                                waiters.push(done);
                            }
                            state = LoopState::Debounce;
                        }
                        Ok(Command::Close) | Err(_) => closed = true,
                    },
                    recv(timer) -> _ => {
                        // Watchdog: run a send cycle without a request.
                        immediate = false;
                        state = LoopState::Debounce;
                    }
                }
            }
            LoopState::Debounce => {
                // Coalesce queued requests into this cycle.
                while let Ok(cmd) = cmd_rx.try_recv() {
                    match cmd {
                        Command::Send { now, done } => {
                            immediate |= now;
                            if let Some(done) = done {
                                waiters.push(done);
                            }
                        }
                        Command::Close => {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    break;
                }
                if !immediate
                    && let Some(visible) = &core.visibility
                    && !visible()
                {
                    // Not visible: hold in debounce until it is, still
                    // accepting an interrupting send(now).
                    crossbeam::select! {
                        recv(cmd_rx) -> cmd => match cmd {
                            Ok(Command::Send { now, done }) => {
                                immediate |= now;
                                if let Some(done) = done {
                                    waiters.push(done);
                                }
                            }
                            Ok(Command::Close) | Err(_) => closed = true,
                        },
                        recv(crossbeam::channel::after(Duration::from_millis(50))) -> _ => {}
                    }
                    if closed {
                        break;
                    }
                    continue;
                }
                state = LoopState::WaitSlot;
            }
            LoopState::WaitSlot => {
                let acquired = core.slots.acquire(|| {
                    if let Ok(Command::Close) = cmd_rx.try_recv() {
                        closed = true;
                    }
                    !closed
                });
                if !acquired {
                    break;
                }
                state = if immediate {
                    LoopState::Send
                } else {
                    LoopState::Delay
                };
            }
            LoopState::Delay => {
                let timer = crossbeam::channel::after(core.delay);
                crossbeam::select! {
                    recv(cmd_rx) -> cmd => match cmd {
                        Ok(Command::Send { now, done }) => {
                            if let Some(done) = done {
                                waiters.push(done);
                            }
                            // send(now) interrupts the sleep.
                            if now {
                                state = LoopState::Send;
                            }
                        }
                        Ok(Command::Close) | Err(_) => {
                            core.slots.release();
                            closed = true;
                        }
                    },
                    recv(timer) -> _ => state = LoopState::Send,
                }
                if closed {
                    break;
                }
            }
            LoopState::Send => {
                let started = Instant::now();
                let result = (core.send_fn)();
                core.slots.release();
                match result {
                    Ok(()) => {
                        core.record_success(started.elapsed());
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                    Err(message) => {
                        warn!(error = %message, "send failed, backing off");
                        core.record_failure();
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(Err(RunnerError::Send(message.clone())));
                        }
                    }
                }
                immediate = false;
                state = LoopState::Pending;
            }
        }
        if closed {
            break;
        }
    }

    debug!("connection loop closed");
    for waiter in waiters {
        let _ = waiter.send(Err(RunnerError::Closed));
    }
    // Reject everything still queued.
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let Command::Send {
            done: Some(done), ..
        } = cmd
        {
            let _ = done.send(Err(RunnerError::Closed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_config() -> RunnerConfig {
        RunnerConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            max_connections: 2,
            watchdog_interval: Duration::ZERO,
        }
    }

    #[test]
    fn send_completes_and_reports() {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let slots = ConnectionSlots::new(2);
        let mut runner = ConnectionLoop::spawn(
            "test",
            quick_config(),
            slots,
            None,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let done = runner.send(true).unwrap();
        assert_eq!(done.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(()));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        runner.close();
    }

    #[test]
    fn failures_reject_waiters_and_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let slots = ConnectionSlots::new(1);
        let mut runner = ConnectionLoop::spawn(
            "test",
            quick_config(),
            slots,
            None,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("unreachable peer".to_string())
            }),
        );

        let done = runner.send(true).unwrap();
        let result = done.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            result,
            Err(RunnerError::Send("unreachable peer".to_string()))
        );
        runner.close();
    }

    #[test]
    fn close_rejects_pending_sends() {
        let slots = ConnectionSlots::new(1);
        let mut runner = ConnectionLoop::spawn(
            "test",
            RunnerConfig {
                // Enormous delay: the send stays parked until close.
                min_delay: Duration::from_secs(600),
                max_delay: Duration::from_secs(600),
                max_connections: 1,
                watchdog_interval: Duration::ZERO,
            },
            slots,
            None,
            Box::new(|| Ok(())),
        );

        let done = runner.send(false).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        runner.close();
        assert_eq!(
            done.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(RunnerError::Closed)
        );
    }

    #[test]
    fn watchdog_fires_without_requests() {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let slots = ConnectionSlots::new(1);
        let mut runner = ConnectionLoop::spawn(
            "test",
            RunnerConfig {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                max_connections: 1,
                watchdog_interval: Duration::from_millis(10),
            },
            slots,
            None,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        std::thread::sleep(Duration::from_millis(200));
        assert!(sent.load(Ordering::SeqCst) >= 1);
        runner.close();
    }

    #[test]
    fn visibility_gates_lazy_sends() {
        let visible = Arc::new(AtomicUsize::new(0));
        let gate = Arc::clone(&visible);
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let slots = ConnectionSlots::new(1);
        let mut runner = ConnectionLoop::spawn(
            "test",
            quick_config(),
            slots,
            Some(Box::new(move || gate.load(Ordering::SeqCst) > 0)),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let done = runner.send(false).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        visible.store(1, Ordering::SeqCst);
        assert_eq!(done.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(()));
        runner.close();
    }

    #[test]
    fn pacing_tracks_median_duration() {
        let mut core = LoopCore {
            config: RunnerConfig {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_secs(10),
                max_connections: 2,
                watchdog_interval: Duration::ZERO,
            },
            slots: ConnectionSlots::new(2),
            visibility: None,
            send_fn: Box::new(|| Ok(())),
            durations: VecDeque::new(),
            delay: Duration::from_millis(1),
            failing: false,
        };
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110] {
            core.record_success(Duration::from_millis(ms));
        }
        // Window keeps the last nine (30..=110), median 70, spread over two
        // connections.
        assert_eq!(core.durations.len(), DURATION_WINDOW);
        assert_eq!(core.delay, Duration::from_millis(35));
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let mut core = LoopCore {
            config: RunnerConfig {
                min_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(65),
                max_connections: 1,
                watchdog_interval: Duration::ZERO,
            },
            slots: ConnectionSlots::new(1),
            visibility: None,
            send_fn: Box::new(|| Ok(())),
            durations: VecDeque::new(),
            delay: Duration::from_millis(10),
            failing: false,
        };
        core.record_failure();
        assert_eq!(core.delay, Duration::from_millis(20));
        core.record_failure();
        assert_eq!(core.delay, Duration::from_millis(40));
        core.record_failure();
        assert_eq!(core.delay, Duration::from_millis(65));

        core.record_success(Duration::from_millis(100));
        assert_eq!(core.delay, Duration::from_millis(10));
        assert!(!core.failing);
    }
}
