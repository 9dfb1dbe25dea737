//! Multi-process simulation pool.
//!
//! `SimulationPool` runs a batch of independent requests on `n_process` worker
//! processes. Each worker loads its own model handle from the shared
//! [`ModelRef`]; only the reference and plain request/outcome data cross the
//! process boundary.
//!
//! Policy:
//! - Workers are spawned lazily by the first `run`; empty slots are refilled at
//!   the start of every later `run`.
//! - Dispatch is queue-pull with at most one request in flight per worker, so a
//!   worker's handle is never used concurrently.
//! - A worker that dies (EOF or corrupt frame on its stdout) fails its in-flight
//!   request with `WorkerCrashed`. A request whose delivery failed is requeued.
//! - Dead slots are respawned while the per-batch `max_respawns` budget lasts;
//!   after that the pool degrades to fewer workers. When none remain with
//!   requests still pending, `run` returns `PoolError::WorkersExhausted`.
//! - With `request_timeout` set, an overdue request fails with `Timeout` and its
//!   worker is killed and handled like a crash.

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter, ErrorKind};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{ConfigurationError, PoolError, PoolResult, WorkerFailure};
use crate::model::ModelRef;
use crate::outcome::{Failure, FailureKind, ResultPolicy, SimulationOutcome, SimulationValue};
use crate::protocol::{self, WorkerCommand, WorkerReply};
use crate::request::SimulationRequest;

/// Summary of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch identifier, also attached to log records.
    pub id: Uuid,
    /// When `run` was entered.
    pub started_at: DateTime<Utc>,
    /// When the last outcome was recorded.
    pub finished_at: DateTime<Utc>,
    /// Number of requests.
    pub requests: usize,
    /// Number of failure outcomes.
    pub failures: usize,
    /// Workers lost during the batch.
    pub crashes: usize,
    /// Replacement workers spawned during the batch.
    pub respawns: usize,
}

enum Event {
    Reply {
        slot: usize,
        generation: u64,
        reply: WorkerReply,
    },
    Closed {
        slot: usize,
        generation: u64,
        reason: Option<String>,
    },
}

enum Cause {
    Exited,
    Unreadable(String),
    WriteFailed(io::Error),
    UnexpectedReply(usize),
    Timeout(Duration),
}

struct InFlight {
    index: usize,
    deadline: Option<Instant>,
}

struct WorkerProcess {
    generation: u64,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    reader: Option<JoinHandle<()>>,
    in_flight: Option<InFlight>,
}

impl WorkerProcess {
    fn spawn(
        slot: usize,
        generation: u64,
        config: &PoolConfig,
        model: &ModelRef,
        events: Sender<Event>,
    ) -> io::Result<Self> {
        let mut child = Command::new(&config.worker.program)
            .args(&config.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(ErrorKind::BrokenPipe, "worker pipes unavailable"));
        };

        let reader = thread::Builder::new()
            .name(format!("fmupool-reader-{slot}"))
            .spawn(move || read_replies(slot, generation, stdout, &events));
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        let mut worker = Self {
            generation,
            child,
            stdin: Some(BufWriter::new(stdin)),
            reader: Some(reader),
            in_flight: None,
        };
        let init = WorkerCommand::Init {
            model: model.clone(),
            platform: config.platform.clone(),
        };
        if let Err(err) = worker.send(&init) {
            worker.terminate();
            return Err(err);
        }
        Ok(worker)
    }

    fn send(&mut self, command: &WorkerCommand) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::BrokenPipe, "worker stdin closed"))?;
        protocol::send(stdin, command)
    }

    /// Kills and reaps the process, returning its exit status.
    fn terminate(&mut self) -> String {
        self.stdin = None;
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(err) => format!("unknown status ({err})"),
        }
    }
}

fn read_replies(slot: usize, generation: u64, stdout: ChildStdout, events: &Sender<Event>) {
    let mut reader = BufReader::new(stdout);
    loop {
        let decoded = protocol::read_frame(&mut reader).and_then(|body| {
            protocol::parse::<WorkerReply>(&body).or_else(|err| match protocol::frame_index(&body) {
                // An intact frame with an unreadable body fails only its request.
                Some(index) => {
                    warn!(slot, index, %err, "unreadable reply");
                    let failure = Failure::new(index, FailureKind::Simulation, format!("unreadable reply: {err}"));
                    Ok(WorkerReply::Outcome { index, result: Err(failure) })
                }
                None => Err(err),
            })
        });
        match decoded {
            Ok(reply) => {
                let event = Event::Reply {
                    slot,
                    generation,
                    reply,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(err) => {
                let reason = (err.kind() != ErrorKind::UnexpectedEof).then(|| err.to_string());
                let _ = events.send(Event::Closed {
                    slot,
                    generation,
                    reason,
                });
                return;
            }
        }
    }
}

struct Batch {
    id: Uuid,
    started_at: DateTime<Utc>,
    outcomes: Vec<Option<SimulationOutcome>>,
    pending: VecDeque<usize>,
    completed: usize,
    failures: usize,
    crashes: usize,
    respawns: usize,
    respawns_left: usize,
}

impl Batch {
    fn new(len: usize, respawn_budget: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            outcomes: vec![None; len],
            pending: (0..len).collect(),
            completed: 0,
            failures: 0,
            crashes: 0,
            respawns: 0,
            respawns_left: respawn_budget,
        }
    }

    fn record(&mut self, index: usize, result: Result<SimulationValue, Failure>) {
        if let Err(failure) = &result {
            debug!(batch = %self.id, index, kind = ?failure.kind, message = %failure.message, "request failed");
            self.failures += 1;
        }
        self.outcomes[index] = Some(SimulationOutcome { index, result });
        self.completed += 1;
    }

    fn is_complete(&self) -> bool {
        self.completed == self.outcomes.len()
    }
}

/// Fan-out pool of worker processes sharing one model reference.
pub struct SimulationPool {
    model: ModelRef,
    config: PoolConfig,
    workers: Vec<Option<WorkerProcess>>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    next_generation: u64,
    retired: Vec<JoinHandle<()>>,
}

impl SimulationPool {
    /// Creates a pool. No process is spawned until the first `run`.
    pub fn new(model: ModelRef, config: PoolConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let capacity = config.event_capacity.max(2 * config.n_process + 2);
        let (events_tx, events_rx) = bounded(capacity);
        let workers = (0..config.n_process).map(|_| None).collect();
        Ok(Self {
            model,
            config,
            workers,
            events_tx,
            events_rx,
            next_generation: 0,
            retired: Vec::new(),
        })
    }

    /// Model every worker loads.
    #[must_use]
    pub const fn model(&self) -> &ModelRef {
        &self.model
    }

    /// Pool configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of running worker processes.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.workers.iter().flatten().count()
    }

    /// Runs a batch and returns one outcome per request, in request order.
    ///
    /// # Errors
    /// - `PoolError::Configuration` for an empty batch.
    /// - `PoolError::Spawn` if no worker process can be started.
    /// - `PoolError::WorkersExhausted` if every worker died with requests pending.
    pub fn run(
        &mut self,
        requests: &[SimulationRequest],
        policy: ResultPolicy,
    ) -> PoolResult<Vec<SimulationOutcome>> {
        self.run_with_report(requests, policy).map(|(outcomes, _)| outcomes)
    }

    /// Same as [`SimulationPool::run`], also returning a [`BatchReport`].
    ///
    /// # Errors
    /// See [`SimulationPool::run`].
    pub fn run_with_report(
        &mut self,
        requests: &[SimulationRequest],
        policy: ResultPolicy,
    ) -> PoolResult<(Vec<SimulationOutcome>, BatchReport)> {
        if requests.is_empty() {
            return Err(ConfigurationError::EmptyBatch.into());
        }

        let mut batch = Batch::new(requests.len(), self.config.max_respawns);
        info!(
            batch = %batch.id,
            requests = requests.len(),
            workers = self.config.n_process,
            %policy,
            "batch started"
        );

        self.reap_retired();
        self.drain_stale_events(&mut batch);
        self.fill_slots(&batch)?;

        loop {
            self.replenish(&mut batch);
            self.dispatch(&mut batch, requests, policy);
            if batch.is_complete() {
                break;
            }
            if self.live_workers() == 0 {
                if batch.respawns_left > 0 && !batch.pending.is_empty() {
                    continue;
                }
                error!(
                    batch = %batch.id,
                    completed = batch.completed,
                    pending = batch.pending.len(),
                    "no workers left"
                );
                return Err(PoolError::WorkersExhausted {
                    completed: batch.completed,
                    pending: batch.pending.len(),
                    crashes: batch.crashes,
                });
            }
            if let Some(event) = self.next_event(&mut batch)? {
                self.handle_event(event, &mut batch);
            }
        }

        let report = BatchReport {
            id: batch.id,
            started_at: batch.started_at,
            finished_at: Utc::now(),
            requests: requests.len(),
            failures: batch.failures,
            crashes: batch.crashes,
            respawns: batch.respawns,
        };
        info!(
            batch = %report.id,
            failures = report.failures,
            crashes = report.crashes,
            respawns = report.respawns,
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "batch finished"
        );

        let outcomes = batch
            .outcomes
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PoolError::internal("batch completed with a missing outcome"))?;
        Ok((outcomes, report))
    }

    /// Stops every worker and waits for them to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn spawn_worker(&mut self, slot: usize) -> io::Result<()> {
        let generation = self.next_generation;
        self.next_generation += 1;
        let worker = WorkerProcess::spawn(
            slot,
            generation,
            &self.config,
            &self.model,
            self.events_tx.clone(),
        )?;
        debug!(worker = slot, generation, pid = worker.child.id(), "worker spawned");
        self.workers[slot] = Some(worker);
        Ok(())
    }

    fn fill_slots(&mut self, batch: &Batch) -> PoolResult<()> {
        let mut last_error = None;
        for slot in 0..self.workers.len() {
            if self.workers[slot].is_some() {
                continue;
            }
            if let Err(err) = self.spawn_worker(slot) {
                error!(batch = %batch.id, worker = slot, %err, "failed to spawn worker");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) if self.live_workers() == 0 => Err(PoolError::Spawn {
                message: format!("{}: {err}", self.config.worker.program.display()),
            }),
            _ => Ok(()),
        }
    }

    fn replenish(&mut self, batch: &mut Batch) {
        for slot in 0..self.workers.len() {
            if batch.pending.is_empty() || batch.respawns_left == 0 {
                return;
            }
            if self.workers[slot].is_some() {
                continue;
            }
            batch.respawns_left -= 1;
            match self.spawn_worker(slot) {
                Ok(()) => {
                    batch.respawns += 1;
                    info!(batch = %batch.id, worker = slot, "worker respawned");
                }
                Err(err) => error!(batch = %batch.id, worker = slot, %err, "failed to respawn worker"),
            }
        }
    }

    fn dispatch(&mut self, batch: &mut Batch, requests: &[SimulationRequest], policy: ResultPolicy) {
        for slot in 0..self.workers.len() {
            let Some(worker) = self.workers[slot].as_mut() else {
                continue;
            };
            if worker.in_flight.is_some() {
                continue;
            }
            let Some(index) = batch.pending.pop_front() else {
                return;
            };

            let command = WorkerCommand::Simulate {
                index,
                request: requests[index].clone(),
                policy,
            };
            match worker.send(&command) {
                Ok(()) => {
                    worker.in_flight = Some(InFlight {
                        index,
                        deadline: self
                            .config
                            .request_timeout
                            .and_then(|t| Instant::now().checked_add(t)),
                    });
                    debug!(batch = %batch.id, worker = slot, index, "request dispatched");
                }
                Err(err) => {
                    // Never delivered: the request goes back to the queue.
                    batch.pending.push_front(index);
                    self.fail_worker(slot, Cause::WriteFailed(err), batch);
                }
            }
        }
    }

    fn next_event(&mut self, batch: &mut Batch) -> PoolResult<Option<Event>> {
        let deadline = self
            .workers
            .iter()
            .flatten()
            .filter_map(|w| w.in_flight.as_ref().and_then(|f| f.deadline))
            .min();

        let Some(deadline) = deadline else {
            return self
                .events_rx
                .recv()
                .map(Some)
                .map_err(|_| PoolError::internal("worker event channel closed"));
        };

        match self
            .events_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => {
                self.expire_overdue(batch);
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(PoolError::internal("worker event channel closed")),
        }
    }

    fn expire_overdue(&mut self, batch: &mut Batch) {
        let Some(timeout) = self.config.request_timeout else {
            return;
        };
        let now = Instant::now();
        for slot in 0..self.workers.len() {
            let overdue = self.workers[slot]
                .as_ref()
                .and_then(|w| w.in_flight.as_ref())
                .and_then(|f| f.deadline)
                .is_some_and(|deadline| deadline <= now);
            if overdue {
                self.fail_worker(slot, Cause::Timeout(timeout), batch);
            }
        }
    }

    fn handle_event(&mut self, event: Event, batch: &mut Batch) {
        match event {
            Event::Reply {
                slot,
                generation,
                reply: WorkerReply::Outcome { index, result },
            } => {
                let Some(worker) = self.current_mut(slot, generation) else {
                    debug!(worker = slot, generation, index, "reply from retired worker ignored");
                    return;
                };
                match worker.in_flight.take() {
                    Some(in_flight) if in_flight.index == index => batch.record(index, result),
                    other => {
                        worker.in_flight = other;
                        self.fail_worker(slot, Cause::UnexpectedReply(index), batch);
                    }
                }
            }
            Event::Closed {
                slot,
                generation,
                reason,
            } => {
                if self.current_mut(slot, generation).is_none() {
                    return;
                }
                let cause = reason.map_or(Cause::Exited, Cause::Unreadable);
                self.fail_worker(slot, cause, batch);
            }
        }
    }

    /// Handles `Closed` events that arrived while no batch was running.
    fn drain_stale_events(&mut self, batch: &mut Batch) {
        loop {
            match self.events_rx.try_recv() {
                Ok(Event::Closed {
                    slot,
                    generation,
                    reason,
                }) => {
                    if self.current_mut(slot, generation).is_some() {
                        let cause = reason.map_or(Cause::Exited, Cause::Unreadable);
                        self.fail_worker(slot, cause, batch);
                    }
                }
                Ok(Event::Reply { slot, .. }) => {
                    warn!(worker = slot, "discarding reply received between batches");
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    fn current_mut(&mut self, slot: usize, generation: u64) -> Option<&mut WorkerProcess> {
        self.workers
            .get_mut(slot)
            .and_then(Option::as_mut)
            .filter(|w| w.generation == generation)
    }

    /// Retires the worker in `slot` and fails its in-flight request.
    fn fail_worker(&mut self, slot: usize, cause: Cause, batch: &mut Batch) {
        let Some(mut worker) = self.workers[slot].take() else {
            return;
        };
        let status = worker.terminate();
        let failure = match cause {
            Cause::Exited => WorkerFailure::Crashed { worker: slot, status },
            Cause::WriteFailed(err) => WorkerFailure::Crashed {
                worker: slot,
                status: format!("{status}; write failed: {err}"),
            },
            Cause::Unreadable(message) => WorkerFailure::Protocol { worker: slot, message },
            Cause::UnexpectedReply(index) => WorkerFailure::Protocol {
                worker: slot,
                message: format!("unexpected reply for request {index}"),
            },
            Cause::Timeout(timeout) => WorkerFailure::Timeout {
                worker: slot,
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        };

        batch.crashes += 1;
        warn!(batch = %batch.id, worker = slot, %failure, "worker lost");

        if let Some(in_flight) = worker.in_flight.take() {
            batch.record(in_flight.index, Err(Failure::from_worker(in_flight.index, &failure)));
        }
        self.retired.extend(worker.reader.take());
    }

    fn reap_retired(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(JoinHandle::is_finished);
        for handle in finished {
            let _ = handle.join();
        }
        self.retired = running;
    }

    fn close(&mut self) {
        let mut closing: Vec<WorkerProcess> = self.workers.iter_mut().filter_map(Option::take).collect();
        for worker in &mut closing {
            let _ = worker.send(&WorkerCommand::Shutdown);
            worker.stdin = None;
        }

        let deadline = Instant::now().checked_add(self.config.shutdown_grace);
        for worker in &mut closing {
            loop {
                match worker.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if deadline.map_or(true, |d| Instant::now() < d) => thread::sleep(Duration::from_millis(10)),
                    _ => {
                        warn!(pid = worker.child.id(), "worker did not exit in time, killing");
                        worker.terminate();
                        break;
                    }
                }
            }
            self.retired.extend(worker.reader.take());
        }

        // Dropping the receiver unblocks readers stuck on a full channel.
        drop(std::mem::replace(&mut self.events_rx, crossbeam_channel::never()));
        for handle in self.retired.drain(..) {
            let _ = handle.join();
        }
        if !closing.is_empty() {
            debug!(workers = closing.len(), "pool shut down");
        }
    }
}

impl Drop for SimulationPool {
    fn drop(&mut self) {
        self.close();
    }
}
