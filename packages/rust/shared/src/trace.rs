//! Traceability hashing with a fixed, versioned canonicalization policy.
//!
//! Policy v1 (`tp1`): strip a leading UTF-8 BOM, normalize CRLF and bare CR
//! line endings to LF, and ensure exactly one trailing newline. Inputs that
//! differ only in those encodings hash identically; any content difference
//! changes the fingerprint. Non-UTF-8 input is hashed raw, byte for byte.
//!
//! Same policy version + same logical content ⇒ same fingerprint, across
//! runs and machines.

use sha2::{Digest, Sha256};

/// Version of the canonicalization policy baked into fingerprints.
pub const TRACE_POLICY_VERSION: u32 = 1;

/// Prefix carried by every fingerprint, tied to the policy version.
pub const FINGERPRINT_PREFIX: &str = "tp1";

/// Canonicalize text under policy v1.
pub fn canonicalize(input: &str) -> String {
    let stripped = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut out = String::with_capacity(stripped.len());

    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            other => out.push(other),
        }
    }

    while out.ends_with('\n') {
        out.pop();
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Fingerprint canonical text: `tp1:<sha256 hex>` of the canonical form.
pub fn fingerprint(text: &str) -> String {
    let canonical = canonicalize(text);
    format!("{FINGERPRINT_PREFIX}:{}", hex_sha256(canonical.as_bytes()))
}

/// Fingerprint raw source bytes. UTF-8 input goes through the text policy;
/// anything else is hashed as-is.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => fingerprint(text),
        Err(_) => format!("{FINGERPRINT_PREFIX}:{}", hex_sha256(bytes)),
    }
}

/// Content hash for artifact files: `sha256:<hex>` of the raw bytes.
/// No canonicalization — artifact bytes are produced by us and must match
/// exactly at gate-time re-validation.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", hex_sha256(bytes))
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
