//! Command dispatch. Exit codes: 0 success, 1 compile/runtime failure,
//! 2 configuration error.

use crate::cli::{Cli, Commands, Transport};
use crate::output;
use mfp_core::compiler::enhance::LlmEnhancer;
use mfp_core::runtime::container::ContainerRuntime;
use mfp_core::{
    CacheStore, CodeExecutor, DockerCliRuntime, McpServer, MfpConfig, Orchestrator, Registry,
};
use mfp_shared::MfpError;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_COMPILE_FAILURE: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

fn exit_code_for(err: &MfpError) -> i32 {
    match err {
        MfpError::Config(_) => EXIT_CONFIG_ERROR,
        _ => EXIT_COMPILE_FAILURE,
    }
}

fn init_logging(config: &MfpConfig) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn dispatch(cli: Cli) -> i32 {
    let config = match MfpConfig::load() {
        Ok(config) => config,
        Err(e) => {
            output::failure(&format!("Configuration error: {e:#}"));
            return EXIT_CONFIG_ERROR;
        }
    };
    init_logging(&config);

    match cli.command {
        Commands::Compile {
            dry_run,
            llm_enhance,
        } => cmd_compile(config, dry_run, llm_enhance).await,
        Commands::Serve {
            transport,
            host,
            port,
        } => cmd_serve(config, transport, host, port).await,
        Commands::Run { transport } => {
            let code = cmd_compile(config.clone(), false, false).await;
            if code != EXIT_OK {
                return code;
            }
            cmd_serve(config, transport, None, None).await
        }
    }
}

async fn cmd_compile(config: MfpConfig, dry_run: bool, llm_enhance: bool) -> i32 {
    let mut orchestrator = Orchestrator::new(config.clone());
    if llm_enhance {
        match LlmEnhancer::from_config(&config) {
            Ok(enhancer) => orchestrator = orchestrator.with_enhancer(Arc::new(enhancer)),
            Err(e) => {
                output::failure(&e.to_string());
                return exit_code_for(&e);
            }
        }
    }

    let summary = match orchestrator.compile_all(dry_run).await {
        Ok(summary) => summary,
        Err(e) => {
            output::failure(&format!("Compile failed: {e}"));
            return exit_code_for(&e);
        }
    };

    if !summary.compiled.is_empty() {
        output::success(&format!(
            "Compiled: {} ({} endpoints)",
            summary.compiled.join(", "),
            summary.total_endpoints
        ));
    }
    if !summary.skipped.is_empty() {
        output::skipped(&format!("Up-to-date: {}", summary.skipped.join(", ")));
    }
    if summary.has_failures() {
        output::failure(&format!("Compile failed for: {}", summary.failed.join(", ")));
        return EXIT_COMPILE_FAILURE;
    }

    EXIT_OK
}

async fn cmd_serve(
    config: MfpConfig,
    transport: Transport,
    host: Option<String>,
    port: Option<u16>,
) -> i32 {
    let host = host.unwrap_or_else(|| config.host.clone());
    let port = port.unwrap_or(config.port);

    let cache = match CacheStore::connect(
        &config.cache_db_path,
        config.cache_ttl_seconds,
        config.cache_max_entries,
    )
    .await
    {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            output::failure(&format!("Cache unavailable: {e}"));
            return exit_code_for(&e);
        }
    };
    if let Err(e) = cache.initialize().await {
        output::failure(&format!("Cache initialization failed: {e}"));
        return exit_code_for(&e);
    }
    match cache.cleanup_expired().await {
        Ok(count) if count > 0 => tracing::info!(count, "expired cache entries swept"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "startup cache sweep failed"),
    }

    let registry = match Registry::load(&config.compiled_output_dir) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            output::failure(&format!("Registry load failed: {e}"));
            return exit_code_for(&e);
        }
    };

    let servers = registry.list_servers();
    tracing::info!(
        servers = ?servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        transport = ?transport,
        "MFP starting"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCliRuntime::new());
    let executor = Arc::new(CodeExecutor::new(
        config,
        registry.clone(),
        cache.clone(),
        runtime,
    ));
    let server = Arc::new(McpServer::new(registry, cache, executor));

    let served = match transport {
        Transport::Stdio => server.run_stdio().await,
        Transport::Http => server.run_http(&host, port).await,
    };

    match served {
        Ok(()) => EXIT_OK,
        Err(e) => {
            output::failure(&format!("Server error: {e:#}"));
            EXIT_COMPILE_FAILURE
        }
    }
}
