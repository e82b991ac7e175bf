//! Test doubles and fixtures shared by unit and integration tests.

use crate::config::MfpConfig;
use crate::runtime::container::{ContainerRuntime, ContainerSpec, WaitOutcome};
use async_trait::async_trait;
use mfp_shared::{
    FunctionSpec, HttpMethod, MfpResult, ServerManifest, MANIFEST_SCHEMA_VERSION,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tokio::time::Duration;

/// Scripted behavior for one container run on the stub runtime.
#[derive(Debug, Clone)]
pub enum StubOutcome {
    Exit {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    /// Never exits; `wait` burns the full deadline and reports a timeout.
    Hang,
}

impl StubOutcome {
    #[must_use]
    pub fn success_json(data: &str) -> Self {
        Self::Exit {
            exit_code: 0,
            stdout: format!("{{\"success\": true, \"data\": {data}}}\n"),
            stderr: String::new(),
        }
    }
}

/// In-memory [`ContainerRuntime`] that records the full container
/// lifecycle, so tests can assert that every launched container was
/// removed and that credentials reached the sandbox env (and nothing
/// else).
#[derive(Default)]
pub struct StubRuntime {
    outcomes: Mutex<VecDeque<StubOutcome>>,
    launches: Mutex<Vec<(ContainerSpec, String)>>,
    created: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl StubRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scripted(self, outcome: StubOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn push_outcome(&self, outcome: StubOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Containers created but not yet removed. The executor's cleanup
    /// guarantee means this must be zero after every call settles.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let created = self.created.lock().unwrap().len();
        let removed = self.removed.lock().unwrap().len();
        created - removed
    }

    #[must_use]
    pub fn kill_count(&self) -> usize {
        self.killed.lock().unwrap().len()
    }

    #[must_use]
    pub fn last_launch(&self) -> Option<(ContainerSpec, String)> {
        self.launches.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn launch(&self, spec: &ContainerSpec, payload: &str) -> MfpResult<String> {
        let id = format!("stub-{}", self.created.lock().unwrap().len());
        self.created.lock().unwrap().push(id.clone());
        self.launches
            .lock()
            .unwrap()
            .push((spec.clone(), payload.to_string()));
        Ok(id)
    }

    async fn wait(&self, _id: &str, deadline: Duration) -> MfpResult<WaitOutcome> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StubOutcome::Exit {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });

        match outcome {
            StubOutcome::Exit {
                exit_code,
                stdout,
                stderr,
            } => Ok(WaitOutcome::Exited(
                crate::runtime::container::ContainerOutput {
                    exit_code,
                    stdout,
                    stderr,
                },
            )),
            StubOutcome::Hang => {
                tokio::time::sleep(deadline).await;
                Ok(WaitOutcome::TimedOut {
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }

    async fn kill(&self, id: &str) -> MfpResult<()> {
        self.killed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> MfpResult<()> {
        let mut removed = self.removed.lock().unwrap();
        if !removed.iter().any(|r| r == id) {
            removed.push(id.to_string());
        }
        Ok(())
    }
}

/// Minimal config rooted in a scratch directory.
#[must_use]
pub fn test_config(dir: &Path) -> MfpConfig {
    MfpConfig {
        log_level: "info".into(),
        host: "127.0.0.1".into(),
        port: 8000,
        compiled_output_dir: dir.join("compiled"),
        swagger_config_file: dir.join("swaggers.yaml"),
        llm_api_url: String::new(),
        llm_api_key: None,
        llm_model: String::new(),
        docker_image: "mfp-sandbox:latest".into(),
        docker_network: "mfp-network".into(),
        execution_timeout_seconds: 30,
        cache_enabled: true,
        cache_ttl_seconds: 3600,
        cache_max_entries: 500,
        cache_db_path: dir.join("cache.db"),
        max_code_size_bytes: 65_536,
        allowed_domains: vec![],
    }
}

/// Write a compiled server (manifest + library + init marker) the way the
/// orchestrator would, so registries in tests have something to load.
pub fn seed_compiled_server(compiled_dir: &Path, server_name: &str) {
    let server_dir = compiled_dir.join(server_name);
    std::fs::create_dir_all(&server_dir).unwrap();

    let manifest = ServerManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        server_name: server_name.to_string(),
        description: format!("{server_name} API"),
        base_url: format!("https://api.{server_name}.example.com/v1"),
        is_read_only: true,
        generated_at: "2026-01-01T00:00:00Z".into(),
        swagger_hash: mfp_shared::hashing::hash_content(server_name),
        endpoint_count: 1,
        functions: vec![FunctionSpec {
            name: "get_current".into(),
            signature: "get_current(city: str)".into(),
            method: HttpMethod::Get,
            path: "/current".into(),
            summary: "Fetch current data".into(),
            parameters: vec![],
            returns: vec![],
        }],
    };

    std::fs::write(
        server_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(
        server_dir.join("functions.py"),
        "def get_current(city):\n    return {\"city\": city}\n",
    )
    .unwrap();
    std::fs::write(server_dir.join("__init__.py"), "").unwrap();
}
