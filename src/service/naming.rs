//! Container naming: every container managed by the core starts with `ca_`;
//! the name is derived deterministically from the service name so restarts
//! and registry refreshes always resolve to the same container.

use regex::Regex;
use std::sync::OnceLock;

fn disallowed_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_.\-]").unwrap())
}

/// Derive `container_name` from a service name: lowercase, prefix `ca_`,
/// replace disallowed characters with `-`, strip leading/trailing `-`/`.`,
/// truncate to 255 bytes.
pub fn container_name(service_name: &str) -> String {
    let lowered = service_name.to_lowercase();
    let prefixed = if lowered.starts_with("ca_") {
        lowered
    } else {
        format!("ca_{lowered}")
    };
    let sanitized = disallowed_chars().replace_all(&prefixed, "-");
    let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.');
    let mut truncated = trimmed.to_string();
    truncated.truncate(255);
    truncated
}

/// The deterministic named-volume name for a bare mount target: `ca_{container_name}_{md5(target)}`.
pub fn volume_name(container_name: &str, target: &str) -> String {
    let digest = md5::compute(target.as_bytes());
    format!("ca_{container_name}_{digest:x}")
}
