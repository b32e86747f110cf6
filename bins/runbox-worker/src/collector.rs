/// Output Collector
///
/// Follows a running container's combined stdout/stderr into one buffer until
/// the stream closes or the execution deadline passes. A timeout stops reading
/// but does not touch the container; the reaper kills it.

use crate::error::SandboxError;
use crate::launcher::ContainerHandle;
use crate::runtime::ContainerRuntime;
use futures_util::stream::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code of a container killed by SIGKILL, usually the OOM killer
pub const EXIT_KILLED: i64 = 137;
/// Exit code of a container terminated by SIGSEGV
pub const EXIT_SEGFAULT: i64 = 139;

/// Bounded byte buffer; bytes past the cap are counted and dropped
#[derive(Debug)]
struct OutputBuffer {
    data: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    /// Decode once at the end so multibyte characters split across chunks survive
    fn finish(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        let truncated = self.dropped > 0;
        if truncated {
            text.push_str(&format!(
                "\n[output truncated: {} bytes dropped]",
                self.dropped
            ));
        }
        (text, truncated)
    }
}

#[derive(Debug, Default)]
pub struct Collected {
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
    /// Non-fatal failure that ended reading early
    pub read_error: Option<SandboxError>,
}

impl Collected {
    /// Whether the stream ran to its natural end
    pub fn completed(&self) -> bool {
        !self.timed_out && !self.cancelled && self.read_error.is_none()
    }
}

pub async fn collect_output(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
    deadline: Instant,
    max_bytes: usize,
    cancel: &CancellationToken,
) -> Collected {
    let mut buffer = OutputBuffer::new(max_bytes);
    let mut collected = Collected::default();
    let mut stream = runtime.stream_logs(&container.id);

    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                collected.cancelled = true;
                break;
            }
            _ = &mut expiry => {
                collected.timed_out = true;
                break;
            }
            item = stream.next() => match item {
                Some(Ok(chunk)) => buffer.push(&chunk),
                Some(Err(e)) => {
                    warn!(container = %container.name, error = %e, "Output stream failed");
                    collected.read_error = Some(SandboxError::Collection(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    let (output, truncated) = buffer.finish();
    collected.output = output;
    collected.truncated = truncated;

    debug!(
        container = %container.name,
        output_bytes = collected.output.len(),
        completed = collected.completed(),
        timed_out = collected.timed_out,
        truncated,
        "Output collected"
    );
    collected
}

#[derive(Debug)]
pub enum ExitStatus {
    Exited(i64),
    TimedOut,
    Cancelled,
    Unknown(SandboxError),
}

/// Wait for the container's exit code within what is left of the deadline
pub async fn await_exit(
    runtime: &dyn ContainerRuntime,
    container: &ContainerHandle,
    deadline: Instant,
    cancel: &CancellationToken,
) -> ExitStatus {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => ExitStatus::Cancelled,
        res = tokio::time::timeout_at(deadline, runtime.wait_container(&container.id)) => match res {
            Ok(Ok(code)) => ExitStatus::Exited(code),
            Ok(Err(e)) => ExitStatus::Unknown(SandboxError::Collection(format!(
                "failed to read exit code: {}",
                e
            ))),
            Err(_) => ExitStatus::TimedOut,
        },
    }
}

/// Append a note explaining well-known abnormal exit codes
pub fn annotate_exit(output: &mut String, code: i64) {
    let note = match code {
        EXIT_KILLED => "[Container killed: likely OOM or exceeded memory limit]",
        EXIT_SEGFAULT => "[Container killed: segmentation fault]",
        _ => return,
    };
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(note);
}
