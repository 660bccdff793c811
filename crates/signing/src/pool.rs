//! Supervisor and worker threads.
//!
//! Layout: one supervisor OS thread owns all bookkeeping (queue, per-worker
//! channels, deadlines); N worker threads block on their private job
//! channels and report through the supervisor's inbox. Timeout and crash
//! handling never run inside a worker, the supervisor abandons the worker's
//! channel and spawns a replacement, so a wedged signing call cannot wedge
//! the pool.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use dteflow_secrets::SecretCell;

use crate::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::signer::DocumentSigner;
use crate::task::{SignError, SignTask, SignedDocument};

/// Supervisor wakeup cadence when nothing is in flight.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Pool construction knobs.
#[derive(Debug, Clone)]
pub struct SignerPoolConfig {
    /// Number of worker threads.
    pub size: usize,
    /// Wall-clock budget per dispatched task.
    pub task_timeout: Duration,
    /// Thread-name prefix for logging.
    pub name: String,
}

impl Default for SignerPoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            task_timeout: Duration::from_secs(30),
            name: "signer-pool".to_string(),
        }
    }
}

impl SignerPoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

type Reply = oneshot::Sender<Result<SignedDocument, SignError>>;

enum SupervisorMsg {
    Submit {
        task: SignTask,
        reply: Reply,
    },
    Done {
        worker_id: usize,
        generation: u64,
        outcome: Result<SignedDocument, SignError>,
    },
    Shutdown,
}

/// What a worker receives; exactly one request/response pair per task.
struct WorkerJob {
    payload: JsonValue,
    certificate: SecretCell,
    passphrase: SecretCell,
}

struct QueuedTask {
    task: SignTask,
    reply: Reply,
    queued_at: Instant,
}

struct InFlight {
    reply: Reply,
    certificate: SecretCell,
    passphrase: SecretCell,
    queued_at: Instant,
    deadline: Instant,
}

struct WorkerSlot {
    id: usize,
    generation: u64,
    sender: mpsc::Sender<WorkerJob>,
    join: Option<thread::JoinHandle<()>>,
    busy: Option<InFlight>,
}

/// Pending result of a submitted task.
#[derive(Debug)]
pub struct SignJob {
    rx: oneshot::Receiver<Result<SignedDocument, SignError>>,
}

impl SignJob {
    pub async fn outcome(self) -> Result<SignedDocument, SignError> {
        self.rx.await.unwrap_or(Err(SignError::ShuttingDown))
    }
}

/// Fixed-size signing pool.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Shutdown is
/// explicit and idempotent: queued tasks are rejected, in-flight tasks get
/// their remaining deadline, then the workers are joined.
pub struct SignerPool {
    inbox: mpsc::Sender<SupervisorMsg>,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
    metrics: Arc<PoolMetrics>,
    accepting: Arc<AtomicBool>,
    size: usize,
}

impl SignerPool {
    pub fn new(signer: Arc<dyn DocumentSigner>, config: SignerPoolConfig) -> Self {
        let size = config.size.max(1);
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let metrics = Arc::new(PoolMetrics::default());

        let supervisor = {
            let supervisor = Supervisor {
                signer,
                config: config.clone(),
                results: inbox_tx.clone(),
                metrics: Arc::clone(&metrics),
                slots: Vec::with_capacity(size),
                queue: VecDeque::new(),
                next_generation: 0,
                draining: false,
            };
            thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || supervisor.run(inbox_rx))
                .expect("failed to spawn signer pool supervisor thread")
        };

        Self {
            inbox: inbox_tx,
            supervisor: Mutex::new(Some(supervisor)),
            metrics,
            accepting: Arc::new(AtomicBool::new(true)),
            size,
        }
    }

    /// Hand a task to the pool. Dispatches immediately when a worker is
    /// idle, queues FIFO otherwise.
    ///
    /// Whatever happens to the task later, its secret cells are wiped on
    /// the worker once the signing call ends; a rejected task is wiped
    /// right here.
    pub fn submit(&self, task: SignTask) -> SignJob {
        let (reply, rx) = oneshot::channel();
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.accepting.load(Ordering::SeqCst) {
            reject_task(task, reply, &self.metrics);
            return SignJob { rx };
        }

        if let Err(mpsc::SendError(msg)) = self.inbox.send(SupervisorMsg::Submit { task, reply }) {
            if let SupervisorMsg::Submit { task, reply } = msg {
                reject_task(task, reply, &self.metrics);
            }
        }
        SignJob { rx }
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot(self.size)
    }

    /// Stop the pool: refuse new submissions, reject everything queued,
    /// wait for in-flight tasks (bounded by their deadlines), join workers.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inbox.send(SupervisorMsg::Shutdown);
        if let Some(join) = self.supervisor.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl Drop for SignerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reject_task(task: SignTask, reply: Reply, metrics: &PoolMetrics) {
    task.certificate.wipe();
    task.passphrase.wipe();
    metrics.record_rejection();
    let _ = reply.send(Err(SignError::ShuttingDown));
}

struct Supervisor {
    signer: Arc<dyn DocumentSigner>,
    config: SignerPoolConfig,
    results: mpsc::Sender<SupervisorMsg>,
    metrics: Arc<PoolMetrics>,
    slots: Vec<WorkerSlot>,
    queue: VecDeque<QueuedTask>,
    next_generation: u64,
    draining: bool,
}

impl Supervisor {
    fn run(mut self, inbox: mpsc::Receiver<SupervisorMsg>) {
        let size = self.config.size.max(1);
        for id in 0..size {
            let slot = self.spawn_worker(id);
            self.slots.push(slot);
        }
        info!(pool = %self.config.name, size, "signer pool started");

        loop {
            let wait = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_POLL);

            match inbox.recv_timeout(wait) {
                Ok(msg) => self.handle(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            self.expire_overdue();
            self.dispatch_queued();
            self.metrics.set_gauges(self.active_count(), self.queue.len());

            if self.draining && self.queue.is_empty() && self.active_count() == 0 {
                break;
            }
        }

        let name = self.config.name.clone();
        for mut slot in self.slots {
            drop(slot.sender);
            if let Some(join) = slot.join.take() {
                let _ = join.join();
            }
        }
        info!(pool = %name, "signer pool stopped");
    }

    fn handle(&mut self, msg: SupervisorMsg) {
        match msg {
            SupervisorMsg::Submit { task, reply } => {
                if self.draining {
                    reject_task(task, reply, &self.metrics);
                } else {
                    self.queue.push_back(QueuedTask {
                        task,
                        reply,
                        queued_at: Instant::now(),
                    });
                }
            }
            SupervisorMsg::Done {
                worker_id,
                generation,
                outcome,
            } => self.settle(worker_id, generation, outcome),
            SupervisorMsg::Shutdown => {
                self.draining = true;
                for queued in self.queue.drain(..) {
                    reject_task(queued.task, queued.reply, &self.metrics);
                }
            }
        }
    }

    fn settle(
        &mut self,
        worker_id: usize,
        generation: u64,
        outcome: Result<SignedDocument, SignError>,
    ) {
        let Some(idx) = self.slots.iter().position(|s| s.id == worker_id) else {
            return;
        };
        if self.slots[idx].generation != generation {
            debug!(worker_id, "discarding result from abandoned worker");
            return;
        }
        let Some(in_flight) = self.slots[idx].busy.take() else {
            debug!(worker_id, "worker reported a result with no task in flight");
            return;
        };

        let latency_ms = in_flight.queued_at.elapsed().as_millis() as u64;
        let crashed = matches!(outcome, Err(SignError::WorkerCrashed(_)));
        match &outcome {
            Ok(_) => self.metrics.record_completion(latency_ms),
            Err(_) => self.metrics.record_failure(latency_ms),
        }

        // The worker wiped the shared material before reporting.
        let _ = in_flight.reply.send(outcome);

        if crashed {
            warn!(worker_id, "signer worker crashed, replacing it");
            self.replace_worker(idx);
        }
    }

    fn expire_overdue(&mut self) {
        let now = Instant::now();
        for idx in 0..self.slots.len() {
            let overdue = self.slots[idx]
                .busy
                .as_ref()
                .is_some_and(|f| f.deadline <= now);
            if !overdue {
                continue;
            }
            let Some(in_flight) = self.slots[idx].busy.take() else {
                continue;
            };

            warn!(
                worker_id = self.slots[idx].id,
                timeout_ms = self.config.task_timeout.as_millis() as u64,
                "signing task overran its deadline, abandoning worker"
            );
            self.metrics
                .record_timeout(self.config.task_timeout.as_millis() as u64);

            // Never wipe here: the overrunning call still holds the cell
            // lock, and blocking on it would wedge the whole supervisor.
            // The abandoned worker's clone shares the storage and wipes it
            // the moment that call returns.
            let _ = in_flight
                .reply
                .send(Err(SignError::TimedOut(self.config.task_timeout)));

            self.replace_worker(idx);
        }
    }

    fn dispatch_queued(&mut self) {
        while !self.queue.is_empty() {
            let Some(idx) = self.slots.iter().position(|s| s.busy.is_none()) else {
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.dispatch_to(idx, queued);
        }
    }

    fn dispatch_to(&mut self, idx: usize, queued: QueuedTask) {
        let QueuedTask {
            task,
            reply,
            queued_at,
        } = queued;
        let SignTask {
            payload,
            certificate,
            passphrase,
        } = task;

        let job = WorkerJob {
            payload,
            certificate: certificate.clone(),
            passphrase: passphrase.clone(),
        };
        let in_flight = InFlight {
            reply,
            certificate,
            passphrase,
            queued_at,
            deadline: Instant::now() + self.config.task_timeout,
        };

        match self.slots[idx].sender.send(job) {
            Ok(()) => {
                self.slots[idx].busy = Some(in_flight);
            }
            Err(mpsc::SendError(job)) => {
                // Worker died while idle; one replacement attempt, then the
                // task is failed to its caller.
                warn!(worker_id = self.slots[idx].id, "idle worker was dead, respawning");
                self.replace_worker(idx);
                match self.slots[idx].sender.send(job) {
                    Ok(()) => {
                        self.slots[idx].busy = Some(in_flight);
                    }
                    Err(_) => {
                        let latency_ms = in_flight.queued_at.elapsed().as_millis() as u64;
                        self.metrics.record_failure(latency_ms);
                        in_flight.certificate.wipe();
                        in_flight.passphrase.wipe();
                        let _ = in_flight
                            .reply
                            .send(Err(SignError::worker_crashed("worker unavailable")));
                    }
                }
            }
        }
    }

    fn replace_worker(&mut self, idx: usize) {
        let id = self.slots[idx].id;
        let fresh = self.spawn_worker(id);
        let old = std::mem::replace(&mut self.slots[idx], fresh);
        // Dropping the old sender closes the abandoned channel; the old
        // thread exits after its current call returns, and its late result
        // fails the generation check.
        drop(old.sender);
    }

    fn spawn_worker(&mut self, id: usize) -> WorkerSlot {
        self.next_generation += 1;
        let generation = self.next_generation;
        let (job_tx, job_rx) = mpsc::channel::<WorkerJob>();
        let signer = Arc::clone(&self.signer);
        let results = self.results.clone();
        let join = thread::Builder::new()
            .name(format!("{}-worker-{id}", self.config.name))
            .spawn(move || worker_loop(id, generation, signer, job_rx, results))
            .expect("failed to spawn signer worker thread");

        WorkerSlot {
            id,
            generation,
            sender: job_tx,
            join: Some(join),
            busy: None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|s| s.busy.as_ref().map(|f| f.deadline))
            .min()
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.busy.is_some()).count()
    }
}

fn worker_loop(
    worker_id: usize,
    generation: u64,
    signer: Arc<dyn DocumentSigner>,
    jobs: mpsc::Receiver<WorkerJob>,
    results: mpsc::Sender<SupervisorMsg>,
) {
    while let Ok(job) = jobs.recv() {
        let unwind = panic::catch_unwind(AssertUnwindSafe(|| run_job(signer.as_ref(), &job)));
        let (outcome, crashed) = match unwind {
            Ok(result) => (result, false),
            Err(panic) => (
                Err(SignError::worker_crashed(panic_message(panic.as_ref()))),
                true,
            ),
        };

        // Wipe on this thread, where the signing call has already released
        // the cell lock. This also covers workers the supervisor abandoned
        // at the deadline: their material is erased as soon as the
        // overrunning call ends, however long that takes.
        job.certificate.wipe();
        job.passphrase.wipe();

        if results
            .send(SupervisorMsg::Done {
                worker_id,
                generation,
                outcome,
            })
            .is_err()
        {
            return;
        }
        if crashed {
            // The supervisor replaces this worker; exit so the fresh one
            // starts from a clean stack.
            return;
        }
    }
}

fn run_job(signer: &dyn DocumentSigner, job: &WorkerJob) -> Result<SignedDocument, SignError> {
    job.certificate
        .expose(|cert| {
            job.passphrase
                .expose(|pass| signer.sign(&job.payload, cert, pass))
        })
        .map_err(|_| SignError::MaterialWiped)?
        .map_err(|_| SignError::MaterialWiped)?
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct DelaySigner;

    impl DocumentSigner for DelaySigner {
        fn sign(
            &self,
            payload: &JsonValue,
            certificate: &[u8],
            _passphrase: &[u8],
        ) -> Result<SignedDocument, SignError> {
            if let Some(ms) = payload.get("delay_ms").and_then(|v| v.as_u64()) {
                thread::sleep(Duration::from_millis(ms));
            }
            if payload.get("boom").is_some() {
                panic!("boom requested");
            }
            if payload.get("reject").is_some() {
                return Err(SignError::failed("bad certificate"));
            }
            Ok(SignedDocument {
                body: format!("signed:{payload}"),
                signature: format!("sig-{}", certificate.len()),
            })
        }
    }

    struct RecordingSigner {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl DocumentSigner for RecordingSigner {
        fn sign(
            &self,
            payload: &JsonValue,
            _certificate: &[u8],
            _passphrase: &[u8],
        ) -> Result<SignedDocument, SignError> {
            let n = payload.get("n").and_then(|v| v.as_i64()).unwrap_or(-1);
            self.seen.lock().unwrap().push(n);
            Ok(SignedDocument {
                body: format!("signed:{n}"),
                signature: "sig".to_string(),
            })
        }
    }

    fn material() -> (SecretCell, SecretCell) {
        (
            SecretCell::from_bytes(vec![0xC3; 48]),
            SecretCell::from_string("passphrase".into()),
        )
    }

    fn pool(size: usize, timeout: Duration) -> SignerPool {
        SignerPool::new(
            Arc::new(DelaySigner),
            SignerPoolConfig::default()
                .with_size(size)
                .with_task_timeout(timeout)
                .with_name("test-pool"),
        )
    }

    #[tokio::test]
    async fn success_returns_document_and_wipes_material() {
        let pool = pool(2, Duration::from_secs(5));
        let (cert, pass) = material();

        let job = pool.submit(SignTask::new(json!({"dte": "F001"}), cert.clone(), pass.clone()));
        let signed = job.outcome().await.unwrap();

        assert!(signed.body.starts_with("signed:"));
        assert_eq!(signed.signature, "sig-48");
        assert!(cert.is_wiped());
        assert!(pass.is_wiped());

        let m = pool.metrics();
        assert_eq!(m.total_tasks, 1);
        assert_eq!(m.completed_tasks, 1);
        assert_eq!(m.failed_tasks, 0);

        pool.shutdown();
    }

    #[tokio::test]
    async fn failure_still_wipes_material() {
        let pool = pool(1, Duration::from_secs(5));
        let (cert, pass) = material();

        let job = pool.submit(SignTask::new(json!({"reject": true}), cert.clone(), pass.clone()));
        let err = job.outcome().await.unwrap_err();

        assert_eq!(err, SignError::failed("bad certificate"));
        assert!(cert.is_wiped());
        assert!(pass.is_wiped());
        assert_eq!(pool.metrics().failed_tasks, 1);

        pool.shutdown();
    }

    #[tokio::test]
    async fn timeout_fails_task_wipes_material_and_replaces_worker() {
        let pool = pool(1, Duration::from_millis(50));
        let (slow_cert, slow_pass) = material();
        let (fast_cert, fast_pass) = material();

        let slow = pool.submit(SignTask::new(
            json!({"delay_ms": 400}),
            slow_cert.clone(),
            slow_pass.clone(),
        ));
        let fast = pool.submit(SignTask::new(json!({"dte": "ok"}), fast_cert, fast_pass));

        let err = slow.outcome().await.unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)));

        // The queued task runs on the replacement worker.
        let signed = fast.outcome().await.unwrap();
        assert!(signed.body.contains("ok"));

        // The abandoned call wipes the material when it finally returns.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(slow_cert.is_wiped());
        assert!(slow_pass.is_wiped());

        let m = pool.metrics();
        assert_eq!(m.timed_out_tasks, 1);
        assert_eq!(m.completed_tasks, 1);

        pool.shutdown();
    }

    #[tokio::test]
    async fn timed_out_reply_lands_at_the_deadline_despite_wedged_signer() {
        let pool = pool(1, Duration::from_millis(100));
        let (wedged_cert, wedged_pass) = material();
        let (next_cert, next_pass) = material();

        let started = Instant::now();
        let wedged = pool.submit(SignTask::new(
            json!({"delay_ms": 1500}),
            wedged_cert.clone(),
            wedged_pass.clone(),
        ));
        let next = pool.submit(SignTask::new(json!({"dte": "after"}), next_cert, next_pass));

        // The reply resolves at the deadline, not when the blocked signing
        // call eventually returns.
        let err = wedged.outcome().await.unwrap_err();
        assert!(matches!(err, SignError::TimedOut(_)));
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "timeout reply waited {:?} on the wedged signing call",
            started.elapsed()
        );

        // The replacement worker serves the queue while the old call is
        // still blocked.
        let signed = next.outcome().await.unwrap();
        assert!(signed.body.contains("after"));
        assert!(started.elapsed() < Duration::from_millis(1000));

        // Once the abandoned call ends, the shared material is erased.
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(wedged_cert.is_wiped());
        assert!(wedged_pass.is_wiped());

        pool.shutdown();
    }

    #[tokio::test]
    async fn crash_fails_only_its_own_task() {
        let pool = pool(1, Duration::from_secs(5));
        let (boom_cert, boom_pass) = material();
        let (ok_cert, ok_pass) = material();

        let crashed = pool.submit(SignTask::new(
            json!({"boom": true}),
            boom_cert.clone(),
            boom_pass.clone(),
        ));
        let healthy = pool.submit(SignTask::new(json!({"dte": "alive"}), ok_cert, ok_pass));

        let err = crashed.outcome().await.unwrap_err();
        assert!(matches!(err, SignError::WorkerCrashed(_)));
        assert!(boom_cert.is_wiped());
        assert!(boom_pass.is_wiped());

        let signed = healthy.outcome().await.unwrap();
        assert!(signed.body.contains("alive"));

        pool.shutdown();
    }

    #[tokio::test]
    async fn single_worker_preserves_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = SignerPool::new(
            Arc::new(RecordingSigner { seen: seen.clone() }),
            SignerPoolConfig::default()
                .with_size(1)
                .with_name("fifo-pool"),
        );

        let jobs: Vec<SignJob> = (1..=4)
            .map(|n| {
                let (cert, pass) = material();
                pool.submit(SignTask::new(json!({"n": n}), cert, pass))
            })
            .collect();

        for job in jobs {
            job.outcome().await.unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_refuses_new_tasks() {
        let pool = pool(1, Duration::from_secs(5));
        let (c1, p1) = material();
        let (c2, p2) = material();
        let (c3, p3) = material();

        let in_flight = pool.submit(SignTask::new(json!({"delay_ms": 150}), c1, p1));
        let queued = pool.submit(SignTask::new(json!({"dte": "q"}), c2.clone(), p2.clone()));

        pool.shutdown();

        assert!(in_flight.outcome().await.is_ok());
        assert_eq!(queued.outcome().await.unwrap_err(), SignError::ShuttingDown);
        assert!(c2.is_wiped());
        assert!(p2.is_wiped());

        let late = pool.submit(SignTask::new(json!({"dte": "late"}), c3.clone(), p3.clone()));
        assert_eq!(late.outcome().await.unwrap_err(), SignError::ShuttingDown);
        assert!(c3.is_wiped());
        assert!(p3.is_wiped());

        assert_eq!(pool.metrics().rejected_tasks, 2);
    }
}
