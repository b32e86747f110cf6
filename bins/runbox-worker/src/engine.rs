/// Execution Orchestrator
///
/// **Core Responsibility:**
/// Drive one request through assemble → build → launch → collect, then reap.
///
/// **Critical Properties:**
/// - Forward phases run strictly in order; the first failure skips the rest
/// - Reaping runs exactly once per request, after every outcome
/// - Every failure is classified into the result; `execute*` never fails
/// - Runtime object names derive from the request id, so concurrent requests
///   never share an image tag, container name or staging directory

use crate::builder;
use crate::collector::{self, ExitStatus};
use crate::context::ContextAssembler;
use crate::error::SandboxError;
use crate::launcher;
use crate::reaper::{self, ResourceLedger};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use runbox_common::config::SandboxConfig;
use runbox_common::types::{ExecutionRequest, ExecutionResult, Phase, ResourceLimits};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub build_timeout: Duration,
    pub launch_timeout: Duration,
    pub execution_timeout: Duration,
    pub reap_timeout: Duration,
    pub max_output_bytes: usize,
    pub max_concurrency: usize,
    pub default_limits: ResourceLimits,
}

impl EngineSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            build_timeout: config.build_timeout(),
            launch_timeout: config.launch_timeout(),
            execution_timeout: config.execution_timeout(),
            reap_timeout: config.reap_timeout(),
            max_output_bytes: config.max_output_bytes,
            max_concurrency: config.max_concurrency.max(1),
            default_limits: config.limits,
        }
    }
}

/// Mutable state of one execution while it moves through its phases
struct ExecutionRun {
    id: String,
    phase: Phase,
    ledger: ResourceLedger,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
    output: String,
    build_log: String,
    build_succeeded: bool,
    run_succeeded: bool,
    timed_out: bool,
    cancelled: bool,
    exit_code: Option<i64>,
    failure: Option<SandboxError>,
    diagnostics: Vec<String>,
}

impl ExecutionRun {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            phase: Phase::Pending,
            ledger: ResourceLedger::default(),
            started_at: Utc::now(),
            clock: Instant::now(),
            output: String::new(),
            build_log: String::new(),
            build_succeeded: false,
            run_succeeded: false,
            timed_out: false,
            cancelled: false,
            exit_code: None,
            failure: None,
            diagnostics: Vec::new(),
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal phase transition {} -> {}",
            self.phase,
            next
        );
        debug!(execution_id = %self.id, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
    }

    fn fail(&mut self, err: SandboxError) {
        if matches!(err, SandboxError::Cancelled) {
            self.cancelled = true;
        }
        warn!(execution_id = %self.id, phase = %self.phase, error = %err, "Execution aborted");
        self.failure = Some(err);
    }

    /// Record a non-fatal problem
    fn note(&mut self, err: SandboxError) {
        self.diagnostics.push(err.to_string());
    }

    /// Whether the container may still be running and needs a SIGKILL
    fn needs_kill(&self) -> bool {
        self.exit_code.is_none()
    }

    fn into_result(self) -> ExecutionResult {
        ExecutionResult {
            execution_id: self.id,
            output: self.output,
            build_succeeded: self.build_succeeded,
            run_succeeded: self.run_succeeded,
            timed_out: self.timed_out,
            cancelled: self.cancelled,
            exit_code: self.exit_code,
            failure: self.failure.as_ref().and_then(SandboxError::kind),
            error: self.failure.as_ref().map(ToString::to_string),
            build_log: self.build_log,
            diagnostics: self.diagnostics,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
        }
    }
}

pub struct SandboxEngine {
    runtime: Arc<dyn ContainerRuntime>,
    assembler: ContextAssembler,
    settings: EngineSettings,
}

impl SandboxEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &SandboxConfig) -> Self {
        Self::with_parts(
            runtime,
            ContextAssembler::from_config(config),
            EngineSettings::from_config(config),
        )
    }

    pub fn with_parts(
        runtime: Arc<dyn ContainerRuntime>,
        assembler: ContextAssembler,
        settings: EngineSettings,
    ) -> Self {
        Self {
            runtime,
            assembler,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Execute one request; cancelling `cancel` aborts the current phase and
    /// jumps to cleanup, keeping any output collected so far.
    #[instrument(skip_all, fields(execution_id = %request.id))]
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let mut run = ExecutionRun::new(&request.id);
        info!(
            source_bytes = request.source_text.len(),
            descriptor_bytes = request.build_descriptor.len(),
            "Execution accepted"
        );

        if let Err(err) = self.run_forward(&request, &mut run, &cancel).await {
            run.fail(err);
        }

        run.advance(Phase::Reaping);
        let kill = run.needs_kill();
        for failure in reaper::reap(
            self.runtime.as_ref(),
            &run.ledger,
            kill,
            self.settings.reap_timeout,
        )
        .await
        {
            run.note(failure);
        }
        run.advance(Phase::Done);

        let result = run.into_result();
        info!(
            success = result.is_success(),
            build_succeeded = result.build_succeeded,
            run_succeeded = result.run_succeeded,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            exit_code = ?result.exit_code,
            output_bytes = result.output.len(),
            duration_ms = result.duration_ms,
            "Execution finished"
        );
        result
    }

    /// Forward phases; an `Err` ends them early and the caller proceeds to reaping
    async fn run_forward(
        &self,
        request: &ExecutionRequest,
        run: &mut ExecutionRun,
        cancel: &CancellationToken,
    ) -> Result<(), SandboxError> {
        let runtime = self.runtime.as_ref();

        run.advance(Phase::Assembling);
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        if let Some(limits) = &request.limits {
            limits
                .validate()
                .map_err(|e| SandboxError::Assembly(format!("invalid resource limits: {}", e)))?;
        }
        let assembler = self.assembler.clone();
        let staged = request.clone();
        let context = tokio::task::spawn_blocking(move || assembler.assemble(&staged))
            .await
            .map_err(|e| SandboxError::Assembly(format!("assembly task failed: {}", e)))??;

        // The id was validated during assembly; names derived from it are safe
        run.advance(Phase::Building);
        let tag = request.image_tag();
        run.ledger.claim_image(&tag);
        let image = match builder::build_image(
            runtime,
            context,
            &tag,
            self.settings.build_timeout,
            cancel,
        )
        .await
        {
            Ok(image) => image,
            Err(err) => {
                if let SandboxError::Build { log, .. } = &err {
                    run.build_log = log.clone();
                }
                return Err(err);
            }
        };
        run.build_log = image.build_log.clone();
        run.build_succeeded = true;

        run.advance(Phase::Launching);
        let name = request.container_name();
        run.ledger.claim_container(&name);
        let spec = ContainerSpec {
            name,
            image: image.tag.clone(),
            limits: request.limits.unwrap_or(self.settings.default_limits),
            network_enabled: request.allow_network,
        };
        let ledger = &mut run.ledger;
        let container = launcher::launch(
            runtime,
            spec,
            self.settings.launch_timeout,
            cancel,
            |handle| ledger.bind_container_id(handle.id.clone()),
        )
        .await?;

        run.advance(Phase::Running);
        let deadline = tokio::time::Instant::now() + self.settings.execution_timeout;

        run.advance(Phase::Collecting);
        let collected = collector::collect_output(
            runtime,
            &container,
            deadline,
            self.settings.max_output_bytes,
            cancel,
        )
        .await;
        run.output = collected.output;
        if let Some(err) = collected.read_error {
            run.note(err);
        }
        if collected.cancelled {
            return Err(SandboxError::Cancelled);
        }
        // Timeouts are logged, never stored as the error
        let deadline_hit = SandboxError::ExecutionTimeout {
            timeout: self.settings.execution_timeout,
        };
        if collected.timed_out {
            run.timed_out = true;
            info!(reason = %deadline_hit, "Execution deadline reached");
            return Ok(());
        }

        match collector::await_exit(runtime, &container, deadline, cancel).await {
            ExitStatus::Exited(code) => {
                run.exit_code = Some(code);
                run.run_succeeded = code == 0;
                collector::annotate_exit(&mut run.output, code);
            }
            ExitStatus::TimedOut => {
                run.timed_out = true;
                info!(reason = %deadline_hit, "Execution deadline reached while waiting for exit");
            }
            ExitStatus::Cancelled => return Err(SandboxError::Cancelled),
            ExitStatus::Unknown(err) => run.note(err),
        }
        Ok(())
    }

    /// Execute several requests concurrently, at most `max_concurrency` at a time.
    ///
    /// Results come back in input order. A request whose id repeats an earlier
    /// id in the batch is rejected without touching the runtime. Cancelling
    /// `cancel` cancels every request still in flight.
    pub async fn execute_batch(
        &self,
        requests: Vec<ExecutionRequest>,
        cancel: CancellationToken,
    ) -> Vec<ExecutionResult> {
        let mut seen = HashSet::new();
        let jobs = requests.into_iter().map(|request| {
            let duplicate = !seen.insert(request.id.clone());
            let token = cancel.child_token();
            async move {
                if duplicate {
                    let reason = format!("duplicate execution id '{}' in batch", request.id);
                    reject(&request.id, SandboxError::Assembly(reason))
                } else {
                    self.execute_with_cancel(request, token).await
                }
            }
        });

        stream::iter(jobs)
            .buffered(self.settings.max_concurrency)
            .collect()
            .await
    }
}

/// Result for a request refused before any phase touched the runtime
fn reject(id: &str, err: SandboxError) -> ExecutionResult {
    let mut run = ExecutionRun::new(id);
    run.advance(Phase::Assembling);
    run.fail(err);
    run.advance(Phase::Reaping);
    run.advance(Phase::Done);
    run.into_result()
}
