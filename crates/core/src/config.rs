use anyhow::Context;
use std::env;
use std::path::PathBuf;

/// Main MFP configuration, loaded once from `MFP_*` environment variables and
/// passed by construction, never a process-wide singleton. The credential vault
/// is the only component that reads the environment after this point.
#[derive(Debug, Clone)]
pub struct MfpConfig {
    pub log_level: String,
    pub host: String,
    pub port: u16,

    // Compiler
    pub compiled_output_dir: PathBuf,
    pub swagger_config_file: PathBuf,
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    // Executor
    pub docker_image: String,
    pub docker_network: String,
    pub execution_timeout_seconds: u64,

    // Cache
    pub cache_enabled: bool,
    pub cache_ttl_seconds: i64,
    pub cache_max_entries: i64,
    pub cache_db_path: PathBuf,

    // Security
    pub max_code_size_bytes: usize,
    pub allowed_domains: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl MfpConfig {
    pub fn load() -> anyhow::Result<Self> {
        let log_level = env_or("MFP_LOG_LEVEL", "info");

        // Loopback by default; set MFP_HOST=0.0.0.0 explicitly to expose the
        // HTTP transport to other hosts.
        let host = env_or("MFP_HOST", "127.0.0.1");

        let port_str = env_or("MFP_PORT", "8000");
        let port = port_str
            .parse::<u16>()
            .with_context(|| format!("Invalid MFP_PORT value '{port_str}'"))?;
        if port == 0 {
            anyhow::bail!("Invalid MFP_PORT value '0': must be between 1 and 65535");
        }

        let compiled_output_dir = PathBuf::from(env_or("MFP_COMPILED_OUTPUT_DIR", "./compiled"));
        let swagger_config_file =
            PathBuf::from(env_or("MFP_SWAGGER_CONFIG_FILE", "./config/swaggers.yaml"));

        let docker_image = env_or("MFP_DOCKER_IMAGE", "mfp-sandbox:latest");
        let docker_network = env_or("MFP_DOCKER_NETWORK", "mfp-network");

        let execution_timeout_seconds = env_or("MFP_EXECUTION_TIMEOUT_SECONDS", "30")
            .parse::<u64>()
            .context("Failed to parse MFP_EXECUTION_TIMEOUT_SECONDS")?;
        if execution_timeout_seconds == 0 || execution_timeout_seconds > 300 {
            anyhow::bail!(
                "MFP_EXECUTION_TIMEOUT_SECONDS must be between 1 and 300 (got {})",
                execution_timeout_seconds
            );
        }

        let cache_enabled = env_or("MFP_CACHE_ENABLED", "true")
            .parse::<bool>()
            .context("Failed to parse MFP_CACHE_ENABLED")?;

        let cache_ttl_seconds = env_or("MFP_CACHE_TTL_SECONDS", "3600")
            .parse::<i64>()
            .context("Failed to parse MFP_CACHE_TTL_SECONDS")?;
        if cache_ttl_seconds <= 0 {
            anyhow::bail!(
                "MFP_CACHE_TTL_SECONDS must be positive (got {})",
                cache_ttl_seconds
            );
        }

        let cache_max_entries = env_or("MFP_CACHE_MAX_ENTRIES", "500")
            .parse::<i64>()
            .context("Failed to parse MFP_CACHE_MAX_ENTRIES")?;
        if cache_max_entries <= 0 || cache_max_entries > 100_000 {
            anyhow::bail!(
                "MFP_CACHE_MAX_ENTRIES must be between 1 and 100000 (got {})",
                cache_max_entries
            );
        }

        let cache_db_path = PathBuf::from(env_or("MFP_CACHE_DB_PATH", "./data/cache.db"));

        let max_code_size_bytes = env_or("MFP_MAX_CODE_SIZE_BYTES", "65536")
            .parse::<usize>()
            .context("Failed to parse MFP_MAX_CODE_SIZE_BYTES")?;
        if max_code_size_bytes == 0 || max_code_size_bytes > 1_048_576 {
            anyhow::bail!(
                "MFP_MAX_CODE_SIZE_BYTES must be between 1 and 1048576 (got {})",
                max_code_size_bytes
            );
        }

        let allowed_domains_str = env::var("MFP_ALLOWED_DOMAINS").unwrap_or_default();
        let allowed_domains: Vec<String> = allowed_domains_str
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        let llm_api_url = env_or(
            "MFP_LLM_API_URL",
            "https://api.openai.com/v1/chat/completions",
        );
        let llm_api_key = env::var("MFP_LLM_API_KEY").ok();
        let llm_model = env_or("MFP_LLM_MODEL", "gpt-4o-mini");

        Ok(Self {
            log_level,
            host,
            port,
            compiled_output_dir,
            swagger_config_file,
            llm_api_url,
            llm_api_key,
            llm_model,
            docker_image,
            docker_network,
            execution_timeout_seconds,
            cache_enabled,
            cache_ttl_seconds,
            cache_max_entries,
            cache_db_path,
            max_code_size_bytes,
            allowed_domains,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex so env var tests run serially (prevents parallel test interference)
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Guard to ensure env var cleanup even on panic
    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = MfpConfig::load().unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.execution_timeout_seconds, 30);
        assert_eq!(config.max_code_size_bytes, 65_536);
        assert_eq!(config.cache_max_entries, 500);
        assert!(config.cache_enabled);
        assert!(config.allowed_domains.is_empty());
        assert_eq!(config.docker_image, "mfp-sandbox:latest");
    }

    #[test]
    fn test_allowed_domains_parsing() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var(
            "MFP_ALLOWED_DOMAINS",
            " api.weather.example.com , hotel.example.com ,",
        );
        let _guard = EnvGuard("MFP_ALLOWED_DOMAINS");

        let config = MfpConfig::load().unwrap();
        assert_eq!(
            config.allowed_domains,
            vec!["api.weather.example.com", "hotel.example.com"]
        );
    }

    #[test]
    fn test_timeout_range_validation() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("MFP_EXECUTION_TIMEOUT_SECONDS", "0");
        let _guard = EnvGuard("MFP_EXECUTION_TIMEOUT_SECONDS");
        assert!(MfpConfig::load().is_err());

        std::env::set_var("MFP_EXECUTION_TIMEOUT_SECONDS", "301");
        assert!(MfpConfig::load().is_err());

        std::env::set_var("MFP_EXECUTION_TIMEOUT_SECONDS", "2");
        let config = MfpConfig::load().unwrap();
        assert_eq!(config.execution_timeout_seconds, 2);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("MFP_PORT", "0");
        let _guard = EnvGuard("MFP_PORT");
        assert!(MfpConfig::load().is_err());

        std::env::set_var("MFP_PORT", "not-a-port");
        assert!(MfpConfig::load().is_err());
    }

    #[test]
    fn test_code_size_ceiling_validated() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("MFP_MAX_CODE_SIZE_BYTES", "2097152");
        let _guard = EnvGuard("MFP_MAX_CODE_SIZE_BYTES");
        assert!(MfpConfig::load().is_err());
    }
}
