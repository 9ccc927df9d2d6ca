//! Durable workflow runner.
//!
//! Runs a registered chain of named steps over a shared application
//! context, persisting every step's output so that a crashed or restarted
//! process resumes each in-flight run at the first step that never reported
//! success. Completed steps are never re-executed.
//!
//! Scheduling is a bounded worker pool: each run occupies one semaphore
//! permit for its whole life, steps inside a run execute sequentially, and
//! independent runs proceed in parallel. Cancellation is cooperative via a
//! per-run child token; a cancelled run is left in-flight on purpose so the
//! next boot resumes it instead of burying it as failed.

mod store;
pub mod types;

pub use store::{RunRow, RunStore};
pub use types::{ProvisionRequest, RunStatus, Step, StepContext, StepOutput};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use provd_shared::errors::{ProvdError, ProvdResult};

/// Default bound on concurrently executing runs.
pub const DEFAULT_CONCURRENCY: usize = 10;

type Chain<A> = Arc<Vec<Arc<dyn Step<A>>>>;
type RunResult = Result<(), String>;

struct RunHandle {
    kind: String,
    version: i64,
    done: watch::Receiver<Option<RunResult>>,
}

/// The workflow runner. Cheap to share by reference; spawned run tasks hold
/// clones of its internals.
pub struct WorkflowRunner<A: Send + Sync + 'static> {
    store: RunStore,
    app: Arc<A>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    chains: Mutex<HashMap<String, Chain<A>>>,
    active: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl<A: Send + Sync + 'static> WorkflowRunner<A> {
    pub fn new(store: RunStore, app: Arc<A>, cancel: CancellationToken) -> Self {
        Self::with_concurrency(store, app, cancel, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(
        store: RunStore,
        app: Arc<A>,
        cancel: CancellationToken,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            app,
            cancel,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            chains: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Declare the ordered step chain for a workflow kind.
    pub fn register(&self, kind: &str, steps: Vec<Arc<dyn Step<A>>>) {
        self.chains
            .lock()
            .expect("chains mutex poisoned")
            .insert(kind.to_string(), Arc::new(steps));
    }

    /// Begin a fresh run. Duplicate run ids are rejected.
    pub fn start(&self, kind: &str, run_id: &str, request: &ProvisionRequest) -> ProvdResult<i64> {
        let chain = self.chain(kind)?;
        let request_json = serde_json::to_string(request)?;
        let version = self.store.insert_run(run_id, kind, &request_json)?;

        tracing::info!(run_id, kind, version, "starting run");
        self.spawn_run(kind, run_id, version, request.clone(), chain);
        Ok(version)
    }

    /// Replay every in-flight run from the first step without a persisted
    /// output. Returns how many runs were rescheduled.
    pub fn resume(&self) -> ProvdResult<usize> {
        let unfinished = self.store.unfinished_runs()?;
        let mut resumed = 0;

        for run in unfinished {
            let chain = match self.chain(&run.kind) {
                Ok(chain) => chain,
                Err(_) => {
                    tracing::warn!(run_id = %run.run_id, kind = %run.kind, "skipping run of unregistered kind");
                    continue;
                }
            };
            let request: ProvisionRequest = serde_json::from_str(&run.request)?;
            let version = self.store.bump_version(&run.run_id)?;

            tracing::info!(run_id = %run.run_id, version, "resuming run");
            self.spawn_run(&run.kind, &run.run_id, version, request, chain);
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Block until the run terminates; `Err` carries the failure message.
    pub async fn wait_by_id(&self, run_id: &str) -> ProvdResult<()> {
        let rx = self
            .active
            .lock()
            .expect("active mutex poisoned")
            .get(run_id)
            .map(|handle| handle.done.clone());

        if let Some(mut rx) = rx {
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result.map_err(ProvdError::Workflow);
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return match last {
                        Some(result) => result.map_err(ProvdError::Workflow),
                        None => Err(ProvdError::Workflow(format!("run {} aborted", run_id))),
                    };
                }
            }
        }

        // Not scheduled in this process; consult the persisted state.
        match self.store.get_run(run_id)? {
            Some(run) => match run.status {
                RunStatus::Done => Ok(()),
                RunStatus::Failed => Err(ProvdError::Workflow(
                    run.error
                        .unwrap_or_else(|| format!("run {} failed", run_id)),
                )),
                _ => Err(ProvdError::Workflow(format!(
                    "run {} is not scheduled in this process",
                    run_id
                ))),
            },
            None => Err(ProvdError::Workflow(format!("unknown run {}", run_id))),
        }
    }

    /// Currently scheduled runs of a kind, as `run_id → version`.
    pub fn active(&self, kind: &str) -> HashMap<String, i64> {
        self.active
            .lock()
            .expect("active mutex poisoned")
            .iter()
            .filter(|(_, handle)| handle.kind == kind)
            .map(|(run_id, handle)| (run_id.clone(), handle.version))
            .collect()
    }

    /// Cancel every run and wait up to `grace` for the pool to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.active.lock().expect("active mutex poisoned").len();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining, "shutdown grace expired with runs still active");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn chain(&self, kind: &str) -> ProvdResult<Chain<A>> {
        self.chains
            .lock()
            .expect("chains mutex poisoned")
            .get(kind)
            .cloned()
            .ok_or_else(|| ProvdError::Workflow(format!("unregistered workflow kind {}", kind)))
    }

    fn spawn_run(
        &self,
        kind: &str,
        run_id: &str,
        version: i64,
        request: ProvisionRequest,
        chain: Chain<A>,
    ) {
        let (tx, rx) = watch::channel(None);
        self.active.lock().expect("active mutex poisoned").insert(
            run_id.to_string(),
            RunHandle {
                kind: kind.to_string(),
                version,
                done: rx,
            },
        );

        let store = self.store.clone();
        let app = self.app.clone();
        let active = self.active.clone();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.child_token();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let result = execute_chain(&store, &app, &chain, &run_id, &request, &cancel).await;
            drop(permit);

            match &result {
                Ok(_) => {
                    if let Err(e) = store.set_status(&run_id, RunStatus::Done, None) {
                        tracing::error!(run_id = %run_id, "failed to mark run done: {}", e);
                    }
                    tracing::info!(run_id = %run_id, "run complete");
                }
                Err(e) if e.is_cancelled() => {
                    // Leave the run in-flight so resume() picks it up after
                    // the next boot.
                    tracing::warn!(run_id = %run_id, "run interrupted by cancellation");
                }
                Err(e) => {
                    if let Err(se) =
                        store.set_status(&run_id, RunStatus::Failed, Some(&e.to_string()))
                    {
                        tracing::error!(run_id = %run_id, "failed to mark run failed: {}", se);
                    }
                    tracing::error!(run_id = %run_id, "run failed: {}", e);
                }
            }

            let _ = tx.send(Some(result.map(|_| ()).map_err(|e| e.to_string())));
            active
                .lock()
                .expect("active mutex poisoned")
                .remove(&run_id);
        });
    }
}

async fn execute_chain<A: Send + Sync>(
    store: &RunStore,
    app: &Arc<A>,
    chain: &Chain<A>,
    run_id: &str,
    request: &ProvisionRequest,
    cancel: &CancellationToken,
) -> ProvdResult<StepOutput> {
    store.set_status(run_id, RunStatus::Running, None)?;

    let mut last = StepOutput::default();
    for step in chain.iter() {
        if let Some(json) = store.step_output(run_id, step.name())? {
            tracing::debug!(run_id, step = step.name(), "step already complete, skipping");
            last = serde_json::from_str(&json)?;
            continue;
        }

        if cancel.is_cancelled() {
            return Err(ProvdError::Cancelled);
        }

        tracing::info!(run_id, step = step.name(), "executing step");
        let output = step
            .run(StepContext {
                run_id,
                request,
                last: &last,
                app: app.as_ref(),
                cancel,
            })
            .await?;

        store.record_step(run_id, step.name(), &serde_json::to_string(&output)?)?;
        last = output;
    }

    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct TestApp {
        log: Mutex<Vec<String>>,
    }

    struct RecordStep {
        name: &'static str,
    }

    #[async_trait]
    impl Step<TestApp> for RecordStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, ctx: StepContext<'_, TestApp>) -> ProvdResult<StepOutput> {
            ctx.app
                .log
                .lock()
                .unwrap()
                .push(self.name.to_string());
            Ok(StepOutput {
                image_id: ctx.last.image_id + 1,
                ..StepOutput::default()
            })
        }
    }

    struct FailStep;

    #[async_trait]
    impl Step<TestApp> for FailStep {
        fn name(&self) -> &'static str {
            "explode"
        }

        async fn run(&self, _ctx: StepContext<'_, TestApp>) -> ProvdResult<StepOutput> {
            Err(ProvdError::Fetch("listing unavailable".into()))
        }
    }

    struct BlockStep;

    #[async_trait]
    impl Step<TestApp> for BlockStep {
        fn name(&self) -> &'static str {
            "block"
        }

        async fn run(&self, ctx: StepContext<'_, TestApp>) -> ProvdResult<StepOutput> {
            ctx.cancel.cancelled().await;
            Err(ProvdError::Cancelled)
        }
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            image_name: "golang".into(),
            bucket_name: "bucket".into(),
        }
    }

    fn runner(store: RunStore) -> (WorkflowRunner<TestApp>, Arc<TestApp>) {
        let app = Arc::new(TestApp::default());
        let runner = WorkflowRunner::new(store, app.clone(), CancellationToken::new());
        (runner, app)
    }

    #[tokio::test]
    async fn chain_runs_to_done() {
        let (runner, app) = runner(RunStore::open_in_memory().unwrap());
        runner.register(
            "provision",
            vec![
                Arc::new(RecordStep { name: "fetch" }),
                Arc::new(RecordStep { name: "unpack" }),
            ],
        );

        let version = runner.start("provision", "run-1", &request()).unwrap();
        assert_eq!(version, 1);
        runner.wait_by_id("run-1").await.unwrap();

        assert_eq!(*app.log.lock().unwrap(), vec!["fetch", "unpack"]);
        let run = runner.store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Done);

        // Step outputs were persisted and thread through the chain.
        let unpack: StepOutput = serde_json::from_str(
            &runner.store.step_output("run-1", "unpack").unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(unpack.image_id, 2);
    }

    #[tokio::test]
    async fn step_error_marks_run_failed() {
        let (runner, app) = runner(RunStore::open_in_memory().unwrap());
        runner.register(
            "provision",
            vec![Arc::new(RecordStep { name: "fetch" }), Arc::new(FailStep)],
        );

        runner.start("provision", "run-1", &request()).unwrap();
        let err = runner.wait_by_id("run-1").await.unwrap_err();
        assert!(err.to_string().contains("listing unavailable"));

        assert_eq!(*app.log.lock().unwrap(), vec!["fetch"]);
        let run = runner.store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("listing unavailable"));
    }

    #[tokio::test]
    async fn duplicate_run_id_is_rejected() {
        let (runner, _app) = runner(RunStore::open_in_memory().unwrap());
        runner.register("provision", vec![Arc::new(RecordStep { name: "fetch" })]);

        runner.start("provision", "run-1", &request()).unwrap();
        let err = runner.start("provision", "run-1", &request()).unwrap_err();
        assert!(matches!(err, ProvdError::Workflow(_)));
    }

    #[tokio::test]
    async fn unregistered_kind_is_rejected() {
        let (runner, _app) = runner(RunStore::open_in_memory().unwrap());
        let err = runner.start("nonsense", "run-1", &request()).unwrap_err();
        assert!(matches!(err, ProvdError::Workflow(_)));
    }

    #[tokio::test]
    async fn resume_skips_persisted_steps() {
        let store = RunStore::open_in_memory().unwrap();

        // Simulate a previous process that completed only the first step.
        store
            .insert_run("run-1", "provision", &serde_json::to_string(&request()).unwrap())
            .unwrap();
        store.set_status("run-1", RunStatus::Running, None).unwrap();
        let fetched = StepOutput {
            image_id: 1,
            ..StepOutput::default()
        };
        store
            .record_step("run-1", "fetch", &serde_json::to_string(&fetched).unwrap())
            .unwrap();

        let (runner, app) = runner(store);
        runner.register(
            "provision",
            vec![
                Arc::new(RecordStep { name: "fetch" }),
                Arc::new(RecordStep { name: "unpack" }),
            ],
        );

        assert_eq!(runner.resume().unwrap(), 1);
        runner.wait_by_id("run-1").await.unwrap();

        // Only the unpersisted step executed; version was bumped.
        assert_eq!(*app.log.lock().unwrap(), vec!["unpack"]);
        let run = runner.store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.version, 2);
    }

    #[tokio::test]
    async fn resume_ignores_terminal_runs() {
        let store = RunStore::open_in_memory().unwrap();
        store
            .insert_run("done", "provision", &serde_json::to_string(&request()).unwrap())
            .unwrap();
        store.set_status("done", RunStatus::Done, None).unwrap();
        store
            .insert_run("failed", "provision", &serde_json::to_string(&request()).unwrap())
            .unwrap();
        store
            .set_status("failed", RunStatus::Failed, Some("boom"))
            .unwrap();

        let (runner, _app) = runner(store);
        runner.register("provision", vec![Arc::new(RecordStep { name: "fetch" })]);
        assert_eq!(runner.resume().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_stays_in_flight() {
        let (runner, _app) = runner(RunStore::open_in_memory().unwrap());
        runner.register("provision", vec![Arc::new(BlockStep)]);

        runner.start("provision", "run-1", &request()).unwrap();
        assert_eq!(runner.active("provision").len(), 1);

        runner.shutdown(Duration::from_secs(2)).await;
        assert!(runner.active("provision").is_empty());

        // Interrupted, not failed: the next boot resumes it.
        let run = runner.store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(runner.store.unfinished_runs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_unknown_run_errors() {
        let (runner, _app) = runner(RunStore::open_in_memory().unwrap());
        let err = runner.wait_by_id("nope").await.unwrap_err();
        assert!(matches!(err, ProvdError::Workflow(_)));
    }
}
