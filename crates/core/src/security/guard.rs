//! Static security analyzer for LLM-submitted Python snippets.
//!
//! The source is reduced to a comment- and string-stripped statement model
//! (logical lines with indentation), then each statement is visited for
//! imports, dangerous calls, dunder attribute access, and scope
//! declarations. The first violation wins. The submitted code itself is
//! never logged, only the violation kind and the offending symbol.

use mfp_shared::{MfpError, MfpResult};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Modules whose import is always rejected: filesystem, process control,
/// raw sockets, reflective import, bytecode, and alternate HTTP stacks.
const BLOCKED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "ctypes",
    "pty",
    "signal",
    "resource",
    "multiprocessing",
    "threading",
    "concurrent",
    "pickle",
    "marshal",
    "shelve",
    "importlib",
    "pkgutil",
    "pathlib",
    "glob",
    "tempfile",
    "io",
    "builtins",
    "gc",
    "inspect",
    "dis",
    "code",
    "codeop",
    "pdb",
    "trace",
    "ast",
    "tokenize",
    "symtable",
    "urllib",
    "http",
    "xmlrpc",
    "ftplib",
    "smtplib",
    "telnetlib",
    "requests",
    "aiohttp",
];

/// Known-good modules: data handling plus the HTTP client the generated
/// libraries use. Advisory only; imports outside this list are not
/// rejected, just noted.
const ALLOWED_MODULES: &[&str] = &[
    "httpx",
    "json",
    "datetime",
    "re",
    "math",
    "typing",
    "dataclasses",
    "collections",
    "itertools",
    "functools",
    "operator",
    "string",
    "decimal",
    "fractions",
    "statistics",
    "random",
    "enum",
    "abc",
    "copy",
    "textwrap",
    "unicodedata",
    "struct",
    "hashlib",
    "hmac",
    "base64",
    "binascii",
    "zlib",
    "csv",
    "calendar",
    "time",
    "uuid",
    "__future__",
];

/// Builtin calls rejected when invoked as bare names. Method calls with the
/// same name (`re.compile`) stay legal.
const BLOCKED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "input",
    "print",
    "breakpoint",
    "vars",
    "dir",
    "globals",
    "locals",
];

/// Attribute names whose access (or invocation) is rejected: the usual
/// sandbox-escape gadgets plus environment and process reach-arounds.
const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__loader__",
    "__spec__",
    "__dict__",
    "__mro__",
    "__bases__",
    "__import__",
    "environ",
    "system",
    "popen",
    "spawn",
    "execv",
    "execve",
    "fork",
    "kill",
    "getenv",
    "setenv",
    "putenv",
];

fn blocked_call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let names = BLOCKED_CALLS.join("|");
        // Bare-name calls only: no preceding `.` or identifier character.
        Regex::new(&format!(r"(?:^|[^\w.])({names})\s*\(")).expect("static pattern")
    })
}

fn blocked_attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let names = BLOCKED_ATTRIBUTES.join("|");
        Regex::new(&format!(r"\.\s*({names})\b")).expect("static pattern")
    })
}

/// One logical source line after comment/string stripping and
/// continuation joining.
#[derive(Debug)]
struct LogicalLine {
    indent: usize,
    text: String,
}

/// Static guard over submitted snippets. Carries the registry's
/// server-name snapshot so `from {server}.functions import …` counts as a
/// known-good import alongside the allowlist.
#[derive(Debug, Clone, Default)]
pub struct AstGuard {
    known_servers: HashSet<String>,
}

impl AstGuard {
    #[must_use]
    pub fn new(known_servers: HashSet<String>) -> Self {
        Self { known_servers }
    }

    /// Validate a snippet. Returns the first violation found.
    pub fn validate(&self, code: &str) -> MfpResult<()> {
        let stripped = strip_strings_and_comments(code);
        for line in logical_lines(&stripped) {
            self.visit_line(&line)?;
        }
        Ok(())
    }

    fn visit_line(&self, line: &LogicalLine) -> MfpResult<()> {
        let text = line.text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if let Some(rest) = text.strip_prefix("import ") {
            for module in imported_roots(rest) {
                self.check_module(&module)?;
            }
        } else if let Some(rest) = text.strip_prefix("from ") {
            if let Some(module) = rest.split_whitespace().next() {
                let root = module.split('.').next().unwrap_or(module);
                self.check_module(root)?;
            }
        }

        // Scope declarations are only rejected at module scope; inside a
        // function body `global` is Python's normal assignment escape hatch.
        if line.indent == 0 {
            for keyword in ["global", "nonlocal"] {
                if text == keyword || text.starts_with(&format!("{keyword} ")) {
                    return Err(violation("blocked_scope", keyword));
                }
            }
        }

        if let Some(caps) = blocked_call_pattern().captures(text) {
            return Err(violation("blocked_call", &caps[1]));
        }

        if let Some(caps) = blocked_attribute_pattern().captures(text) {
            return Err(violation("blocked_attribute", &caps[1]));
        }

        Ok(())
    }

    fn check_module(&self, module: &str) -> MfpResult<()> {
        if module.is_empty() {
            return Ok(());
        }
        if BLOCKED_MODULES.contains(&module) {
            return Err(violation("blocked_import", module));
        }
        // Conservative: only explicitly blocked modules are rejected. An
        // import outside the allowlist that is not a compiled server library
        // passes here and fails to resolve inside the sandbox.
        if !ALLOWED_MODULES.contains(&module) && !self.known_servers.contains(module) {
            tracing::debug!(module = %module, "import outside allowlist admitted");
        }
        Ok(())
    }
}

fn violation(kind: &str, pattern: &str) -> MfpError {
    tracing::warn!(kind = %kind, symbol = %pattern, "security violation blocked");
    MfpError::Security {
        kind: kind.into(),
        pattern: pattern.into(),
    }
}

/// Root module names from the clause of an `import` statement:
/// `a.b as c, d` → `["a", "d"]`.
fn imported_roots(clause: &str) -> Vec<String> {
    clause
        .split(',')
        .filter_map(|part| part.trim().split_whitespace().next())
        .map(|name| name.split('.').next().unwrap_or(name).to_string())
        .collect()
}

/// Replace string literal contents with empty literals and drop comments,
/// preserving line structure. Handles single/double quotes, escapes, and
/// triple-quoted blocks; f-string interpolations are treated as opaque
/// string content.
fn strip_strings_and_comments(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let triple = i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote;
            let closer_len = if triple { 3 } else { 1 };
            out.push('"');
            out.push('"');
            i += closer_len;

            while i < chars.len() {
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == quote
                    && (!triple
                        || (i + 2 < chars.len()
                            && chars[i + 1] == quote
                            && chars[i + 2] == quote))
                {
                    i += closer_len;
                    break;
                }
                if chars[i] == '\n' {
                    if !triple {
                        // Unterminated single-quoted literal; resync at EOL.
                        break;
                    }
                    out.push('\n');
                }
                i += 1;
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Split stripped source into logical lines, joining backslash
/// continuations and lines left open by unbalanced brackets.
fn logical_lines(stripped: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut pending = String::new();
    let mut pending_indent = 0;
    let mut depth: i64 = 0;

    for raw in stripped.lines() {
        if pending.is_empty() {
            if raw.trim().is_empty() {
                continue;
            }
            pending_indent = raw.len() - raw.trim_start().len();
        }

        let mut piece = raw.trim_end();
        let continued = piece.ends_with('\\');
        if continued {
            piece = &piece[..piece.len() - 1];
        }

        for c in piece.chars() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }

        pending.push_str(piece);
        pending.push(' ');

        if !continued && depth <= 0 {
            lines.push(LogicalLine {
                indent: pending_indent,
                text: std::mem::take(&mut pending),
            });
            depth = 0;
        }
    }

    if !pending.is_empty() {
        lines.push(LogicalLine {
            indent: pending_indent,
            text: pending,
        });
    }

    lines
}
