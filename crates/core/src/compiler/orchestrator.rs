//! Compile orchestrator. Drives fetch, parse, codegen and write for every
//! configured swagger source, with manifest-hash-gated incremental builds
//! and a lint pass over the generated files. The orchestrator exclusively
//! owns the compiled output directory.

use crate::compiler::enhance::DocEnhancer;
use crate::compiler::{codegen, lint, swagger::SwaggerParser};
use crate::config::MfpConfig;
use mfp_shared::{
    FunctionSpec, MfpError, MfpResult, ServerManifest, ServerSpec, SwaggerSource,
    MANIFEST_SCHEMA_VERSION,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct CompileSummary {
    pub compiled: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub total_endpoints: usize,
}

impl CompileSummary {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    servers: Vec<serde_yaml::Value>,
}

pub struct Orchestrator {
    config: MfpConfig,
    enhancer: Option<Arc<dyn DocEnhancer>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: MfpConfig) -> Self {
        Self {
            config,
            enhancer: None,
        }
    }

    #[must_use]
    pub fn with_enhancer(mut self, enhancer: Arc<dyn DocEnhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    /// Load swagger source definitions from the sources file. A missing file
    /// is an empty compile; individually invalid entries are logged and
    /// skipped.
    pub fn load_sources(&self) -> MfpResult<Vec<SwaggerSource>> {
        let path = &self.config.swagger_config_file;
        if !path.exists() {
            tracing::warn!(path = %path.display(), "swagger sources file not found");
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| {
            MfpError::Config(format!(
                "Failed to read swagger sources file {}: {e}",
                path.display()
            ))
        })?;
        let parsed: SourcesFile = serde_yaml::from_str(&raw).map_err(|e| {
            MfpError::Config(format!(
                "Failed to parse swagger sources file {}: {e}",
                path.display()
            ))
        })?;

        let mut sources = Vec::new();
        for entry in parsed.servers {
            match serde_yaml::from_value::<SwaggerSource>(entry) {
                Ok(source) => sources.push(source),
                Err(e) => tracing::warn!(error = %e, "invalid swagger source entry skipped"),
            }
        }

        tracing::info!(count = sources.len(), "swagger sources loaded");
        Ok(sources)
    }

    /// Run the full compile pipeline. Per-source failures fail that source
    /// only; a sources-file problem or a lint failure fails the whole pass.
    pub async fn compile_all(&self, dry_run: bool) -> MfpResult<CompileSummary> {
        let sources = self.load_sources()?;
        let mut summary = CompileSummary::default();

        if sources.is_empty() {
            tracing::warn!("no swagger sources configured");
            return Ok(summary);
        }

        if !dry_run {
            std::fs::create_dir_all(&self.config.compiled_output_dir).map_err(|e| {
                MfpError::Compile(format!("Failed to create output directory: {e}"))
            })?;
        }

        let mut written_files = Vec::new();
        for source in &sources {
            match self.compile_source(source, dry_run).await {
                Ok(Some(endpoint_count)) => {
                    summary.compiled.push(source.name.clone());
                    summary.total_endpoints += endpoint_count;
                    written_files
                        .push(self.server_dir(&source.name).join("functions.py"));
                }
                Ok(None) => summary.skipped.push(source.name.clone()),
                Err(e) => {
                    tracing::error!(server = %source.name, error = %e, "compile failed");
                    summary.failed.push(source.name.clone());
                }
            }
        }

        if !dry_run {
            lint::lint_files(&written_files).await?;
        }

        tracing::info!(
            compiled = summary.compiled.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            total_endpoints = summary.total_endpoints,
            "compile complete"
        );
        Ok(summary)
    }

    fn server_dir(&self, server_name: &str) -> PathBuf {
        self.config.compiled_output_dir.join(server_name)
    }

    /// Compile one source. `Ok(Some(n))` = compiled with `n` endpoints,
    /// `Ok(None)` = up to date, nothing written.
    async fn compile_source(
        &self,
        source: &SwaggerSource,
        dry_run: bool,
    ) -> MfpResult<Option<usize>> {
        let raw = self.fetch_document(source).await?;
        let spec = SwaggerParser::new(source).parse(&raw)?;

        let server_dir = self.server_dir(&source.name);
        let manifest_path = server_dir.join("manifest.json");

        if !dry_run && is_up_to_date(&manifest_path, &spec.source_hash) {
            tracing::info!(server = %source.name, "server up to date");
            return Ok(None);
        }

        if dry_run {
            tracing::info!(
                server = %source.name,
                endpoints = spec.endpoints.len(),
                "dry run parsed"
            );
            return Ok(Some(spec.endpoints.len()));
        }

        let mut code = codegen::generate(&spec);
        if let Some(enhancer) = &self.enhancer {
            code = enhancer.enhance(&source.name, &code).await;
        }

        self.write_output(&server_dir, &spec, &code)?;
        tracing::info!(
            server = %source.name,
            endpoints = spec.endpoints.len(),
            "server compiled"
        );
        Ok(Some(spec.endpoints.len()))
    }

    async fn fetch_document(&self, source: &SwaggerSource) -> MfpResult<Vec<u8>> {
        if source.swagger_url.starts_with("http://") || source.swagger_url.starts_with("https://")
        {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| MfpError::Internal(format!("Failed to build HTTP client: {e}")))?;
            let response = client
                .get(&source.swagger_url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| {
                    MfpError::Parse(format!(
                        "Failed to fetch swagger from {}: {e}",
                        source.swagger_url
                    ))
                })?;
            let bytes = response.bytes().await.map_err(|e| {
                MfpError::Parse(format!(
                    "Failed to read swagger body from {}: {e}",
                    source.swagger_url
                ))
            })?;
            Ok(bytes.to_vec())
        } else {
            std::fs::read(&source.swagger_url).map_err(|e| {
                MfpError::Parse(format!(
                    "Failed to read swagger file {}: {e}",
                    source.swagger_url
                ))
            })
        }
    }

    /// Write library + manifest + package-init marker. Each file lands via
    /// temp-path-then-rename within the output directory, so readers never
    /// observe a half-written artifact.
    fn write_output(&self, server_dir: &Path, spec: &ServerSpec, code: &str) -> MfpResult<()> {
        std::fs::create_dir_all(server_dir)
            .map_err(|e| MfpError::Compile(format!("Failed to create server dir: {e}")))?;

        let manifest = build_manifest(spec);
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| MfpError::Compile(format!("Failed to serialize manifest: {e}")))?;

        write_atomic(&server_dir.join("functions.py"), code.as_bytes())?;
        write_atomic(&server_dir.join("manifest.json"), manifest_json.as_bytes())?;
        write_atomic(
            &server_dir.join("__init__.py"),
            format!("\"\"\"Generated MFP package for {}.\"\"\"\n", spec.name).as_bytes(),
        )?;

        tracing::debug!(dir = %server_dir.display(), "compiled output written");
        Ok(())
    }
}

fn build_manifest(spec: &ServerSpec) -> ServerManifest {
    let functions = spec
        .endpoints
        .iter()
        .map(|endpoint| FunctionSpec {
            name: endpoint.operation_id.clone(),
            signature: codegen::function_signature(endpoint),
            method: endpoint.method,
            path: endpoint.path.clone(),
            summary: endpoint.summary.clone(),
            parameters: endpoint.parameters.clone(),
            returns: endpoint.response_fields.clone(),
        })
        .collect();

    ServerManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        server_name: spec.name.clone(),
        description: spec.description.clone(),
        base_url: spec.base_url.clone(),
        is_read_only: spec.is_read_only,
        generated_at: chrono::Utc::now().to_rfc3339(),
        swagger_hash: spec.source_hash.clone(),
        endpoint_count: spec.endpoints.len(),
        functions,
    }
}

fn is_up_to_date(manifest_path: &Path, current_hash: &str) -> bool {
    let Ok(raw) = std::fs::read_to_string(manifest_path) else {
        return false;
    };
    match serde_json::from_str::<ServerManifest>(&raw) {
        Ok(manifest) => {
            manifest.schema_version == MANIFEST_SCHEMA_VERSION
                && manifest.swagger_hash == current_hash
        }
        Err(_) => false,
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> MfpResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MfpError::Compile(format!("Invalid output path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp, contents)
        .map_err(|e| MfpError::Compile(format!("Failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| MfpError::Compile(format!("Failed to move {} into place: {e}", path.display())))?;
    Ok(())
}
