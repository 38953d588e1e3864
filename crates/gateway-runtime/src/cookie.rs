//! The gateway cookie file.
//!
//! Remembers the last-known SDN endpoint between runs, as plain JSON at
//! `.gateway_cookies/.cookie.blxrbdn-gw-{node_id}`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Directory holding cookie files.
pub const COOKIE_DIR: &str = ".gateway_cookies";

/// Persisted gateway state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCookies {
    /// Last SDN endpoint the gateway registered with.
    pub sdn_url: Option<String>,
}

/// Path of the cookie file for `node_id`.
pub fn cookie_path(base_dir: &std::path::Path, node_id: &str) -> PathBuf {
    base_dir
        .join(COOKIE_DIR)
        .join(format!(".cookie.blxrbdn-gw-{node_id}"))
}

/// Best-effort read; a missing or unparsable cookie is an empty one.
pub fn load(base_dir: &std::path::Path, node_id: &str) -> GatewayCookies {
    let path = cookie_path(base_dir, node_id);
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(err) => {
            debug!(path = %path.display(), %err, "no cookie file");
            GatewayCookies::default()
        }
    }
}

/// Rewrites the cookie file.
pub fn store(
    base_dir: &std::path::Path,
    node_id: &str,
    cookies: &GatewayCookies,
) -> std::io::Result<()> {
    let path = cookie_path(base_dir, node_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(cookies)?;
    std::fs::write(path, contents)
}
