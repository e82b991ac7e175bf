//! Execution policy: the code-size ceiling and the outbound-domain
//! allowlist. The size check runs before any parsing; the domain check is
//! a pre-execution static pass over URL literals in the snippet.

use mfp_shared::{MfpError, MfpResult};
use regex::Regex;
use std::sync::OnceLock;

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"https?://([A-Za-z0-9._-]+)"#).expect("static pattern")
    })
}

/// Hard size ceiling, enforced on raw bytes before anything looks at the
/// code. Exactly `max_bytes` is accepted; one byte more is rejected.
pub fn check_code_size(code: &str, max_bytes: usize) -> MfpResult<()> {
    let size = code.len();
    if size > max_bytes {
        return Err(MfpError::Security {
            kind: "code_size".into(),
            pattern: format!("{size} bytes exceeds limit of {max_bytes}"),
        });
    }
    Ok(())
}

/// Check a single hostname against the allowlist. Exact match or dot-suffix
/// match (`api.weather.example.com` passes for `example.com`). An empty
/// allowlist permits everything.
pub fn domain_allowed(host: &str, allowed_domains: &[String]) -> bool {
    if allowed_domains.is_empty() {
        return true;
    }
    allowed_domains
        .iter()
        .any(|domain| host == domain || host.ends_with(&format!(".{domain}")))
}

/// Statically extract `http(s)://` hostnames from a snippet and reject the
/// first one outside the allowlist. Hosts reached through indirection are
/// not caught here; those fail inside the sandbox, which has no credentials
/// for them.
pub fn check_domains(code: &str, allowed_domains: &[String]) -> MfpResult<()> {
    if allowed_domains.is_empty() {
        return Ok(());
    }
    for caps in url_pattern().captures_iter(code) {
        let host = &caps[1];
        if !domain_allowed(host, allowed_domains) {
            tracing::warn!(host = %host, "domain outside allowlist");
            return Err(MfpError::Policy { host: host.into() });
        }
    }
    Ok(())
}
