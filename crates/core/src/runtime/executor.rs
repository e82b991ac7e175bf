//! The execution state machine. Within one call the stages run strictly in
//! order (size check, AST guard, domain policy, lint, env assembly,
//! container run, output parse, cache) and every stage past container
//! creation guarantees removal on exit, including cancellation. Nothing is
//! retried here; the caller retries. All failures become a populated
//! [`ExecutionResult`]; this type never returns an error to the tool layer.

use crate::compiler::lint;
use crate::config::MfpConfig;
use crate::runtime::cache::CacheStore;
use crate::runtime::container::{
    ContainerLease, ContainerOutput, ContainerRuntime, ContainerSpec, WaitOutcome,
    COMPILED_MOUNT_PATH,
};
use crate::runtime::registry::Registry;
use crate::security::{guard::AstGuard, policy, vault};
use mfp_shared::{ExecutionResult, MfpError, MfpResult};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::time::Duration;

const RESULT_SUMMARY_MAX_CHARS: usize = 200;
const RAW_OUTPUT_MAX_CHARS: usize = 4096;

fn server_import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)(?:from\s+(\w+)\.functions\s+import|import\s+(\w+)\.functions)")
            .expect("static pattern")
    })
}

/// Regex-level import detection. Aliased or dynamic imports are not seen;
/// an undetected server simply gets no env injection and fails inside the
/// sandbox at call time.
#[must_use]
pub fn detect_servers_used(code: &str) -> Vec<String> {
    let mut servers = BTreeSet::new();
    for caps in server_import_pattern().captures_iter(code) {
        if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
            servers.insert(name.as_str().to_string());
        }
    }
    servers.into_iter().collect()
}

pub struct CodeExecutor {
    config: MfpConfig,
    registry: Arc<Registry>,
    cache: Arc<CacheStore>,
    runtime: Arc<dyn ContainerRuntime>,
    guard: AstGuard,
}

impl CodeExecutor {
    #[must_use]
    pub fn new(
        config: MfpConfig,
        registry: Arc<Registry>,
        cache: Arc<CacheStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let guard = AstGuard::new(registry.server_names());
        Self {
            config,
            registry,
            cache,
            runtime,
            guard,
        }
    }

    /// Run one snippet through the full pipeline.
    pub async fn execute(&self, code: &str, description: &str) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.run_pipeline(code, description, &started).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(&err, elapsed_ms(&started)),
        };

        tracing::info!(
            success = result.success,
            error_type = result.error_type.as_deref().unwrap_or(""),
            duration_ms = result.duration_ms,
            description = %truncate(description, 60),
            "code executed"
        );
        result
    }

    async fn run_pipeline(
        &self,
        code: &str,
        description: &str,
        started: &Instant,
    ) -> MfpResult<ExecutionResult> {
        // Stages before the container are cheap and cancel instantly.
        policy::check_code_size(code, self.config.max_code_size_bytes)?;
        self.guard.validate(code)?;
        policy::check_domains(code, &self.config.allowed_domains)?;

        let payload = build_payload(code);
        lint::lint_snippet(&payload).await?;

        let servers_used = detect_servers_used(code);
        let env = vault::build_all_server_env(&servers_used)?;

        let spec = ContainerSpec {
            image: self.config.docker_image.clone(),
            network: self.config.docker_network.clone(),
            env,
            compiled_dir: self.config.compiled_output_dir.clone(),
        };

        let container_id = self.runtime.launch(&spec, &payload).await?;
        let lease = ContainerLease::new(self.runtime.clone(), container_id);
        let deadline = Duration::from_secs(self.config.execution_timeout_seconds);

        let outcome = match self.runtime.wait(lease.id(), deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        match outcome {
            WaitOutcome::TimedOut { stdout, stderr } => {
                let _ = self.runtime.kill(lease.id()).await;
                lease.release().await;

                let err = MfpError::Timeout {
                    seconds: self.config.execution_timeout_seconds,
                };
                let mut result = ExecutionResult::failure(&err, elapsed_ms(started));
                // Partial output survives the kill when available.
                result.stdout = stdout;
                result.stderr = stderr;
                Ok(result)
            }
            WaitOutcome::Exited(output) => {
                lease.release().await;
                let mut result = parse_output(output, elapsed_ms(started));

                if result.success && self.config.cache_enabled {
                    let swagger_hash = self.registry.combined_swagger_hash(&servers_used);
                    let summary = summarize_data(result.data.as_ref());
                    let cache_id = self
                        .cache
                        .put(code, description, &servers_used, &swagger_hash, &summary)
                        .await?;
                    result.cache_id = Some(cache_id);
                }

                Ok(result)
            }
        }
    }
}

/// Prelude + user code. The prelude points the module search path at the
/// read-only compiled-library mount.
fn build_payload(code: &str) -> String {
    format!(
        "import sys as _sys\n_sys.path.insert(0, \"{COMPILED_MOUNT_PATH}\")\n\n{}\n",
        code.trim_end()
    )
}

/// Parse container output into a result. The sandbox protocol is a JSON
/// object with a boolean `success` on stdout; the *last* such object wins.
/// Without one, raw stdout becomes the data and the exit code decides
/// success.
fn parse_output(output: ContainerOutput, duration_ms: u64) -> ExecutionResult {
    let stdout = output.stdout;
    let stderr = truncate(&output.stderr, RAW_OUTPUT_MAX_CHARS);

    if let Some(parsed) = last_protocol_object(&stdout) {
        let success = parsed
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        return ExecutionResult {
            success,
            data: if success { parsed.get("data").cloned() } else { None },
            error: if success {
                None
            } else {
                Some(
                    parsed
                        .get("error")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("Sandbox reported failure")
                        .to_string(),
                )
            },
            error_type: (!success).then(|| "runtime".to_string()),
            stdout,
            stderr,
            duration_ms,
            cache_id: None,
        };
    }

    if output.exit_code == 0 {
        let trimmed = stdout.trim();
        ExecutionResult {
            success: true,
            data: (!trimmed.is_empty())
                .then(|| serde_json::Value::String(truncate(trimmed, RAW_OUTPUT_MAX_CHARS))),
            error: None,
            error_type: None,
            stdout,
            stderr,
            duration_ms,
            cache_id: None,
        }
    } else {
        let err = MfpError::Runtime {
            message: format!("sandbox exited with code {}", output.exit_code),
            stderr: stderr.clone(),
            exit_code: output.exit_code,
        };
        let mut result = ExecutionResult::failure(&err, duration_ms);
        result.stdout = stdout;
        result
    }
}

/// Scan stdout bottom-up for the last JSON object carrying a boolean
/// `success` field.
fn last_protocol_object(stdout: &str) -> Option<serde_json::Value> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.get("success").and_then(serde_json::Value::as_bool).is_some() {
                return Some(value);
            }
        }
    }
    // The whole stream may be one pretty-printed object.
    let whole = stdout.trim();
    if whole.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(whole) {
            if value.get("success").and_then(serde_json::Value::as_bool).is_some() {
                return Some(value);
            }
        }
    }
    None
}

fn summarize_data(data: Option<&serde_json::Value>) -> String {
    match data {
        Some(value) => {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            truncate(&rendered, RESULT_SUMMARY_MAX_CHARS)
        }
        None => String::new(),
    }
}

fn elapsed_ms(started: &Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
