//! Credential vault, the only component permitted to read auth material
//! from the process environment. Values are handed to the sandbox as env
//! vars; they are never embedded in generated code or results.

use mfp_shared::{MfpError, MfpResult};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn env_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static pattern"))
}

/// Resolve `${VAR}` references in a config value against the process
/// environment. An unresolvable reference is a configuration error: a
/// half-expanded credential must never reach the sandbox.
pub fn expand(value: &str) -> MfpResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut last = 0;

    for caps in env_ref_pattern().captures_iter(value) {
        let whole = caps.get(0).expect("capture 0 always present");
        let var_name = &caps[1];
        let resolved = std::env::var(var_name).map_err(|_| {
            MfpError::Config(format!(
                "Environment variable '{var_name}' referenced but not set"
            ))
        })?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Environment variable key fragment for a server name: uppercased, with
/// non-alphanumeric characters collapsed to `_`.
fn env_fragment(server_name: &str) -> String {
    server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the env var map injected into a sandbox container for one server:
/// `MFP_{SERVER}_BASE_URL` and `MFP_{SERVER}_AUTH`, with `${VAR}` references
/// in the auth value resolved. Unset variables are simply omitted.
pub fn build_server_env(server_name: &str) -> MfpResult<HashMap<String, String>> {
    let prefix = format!("MFP_{}_", env_fragment(server_name));
    let mut env = HashMap::new();

    let base_url_key = format!("{prefix}BASE_URL");
    if let Ok(base_url) = std::env::var(&base_url_key) {
        if !base_url.is_empty() {
            env.insert(base_url_key, base_url);
        }
    }

    let auth_key = format!("{prefix}AUTH");
    if let Ok(auth) = std::env::var(&auth_key) {
        if !auth.is_empty() {
            env.insert(auth_key, expand(&auth)?);
        }
    }

    Ok(env)
}

/// Merged env vars for every server a snippet references.
pub fn build_all_server_env(server_names: &[String]) -> MfpResult<HashMap<String, String>> {
    let mut combined = HashMap::new();
    for name in server_names {
        combined.extend(build_server_env(name)?);
    }
    Ok(combined)
}
