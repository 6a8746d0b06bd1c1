//! Bearer token authentication and per-caller rate limiting for the relay.
//!
//! Token resolution on startup:
//!
//!   `server.auth_token` in config      → used as-is
//!   else `server.token_file` exists    → read (0600, written by us earlier)
//!   else `server.token_file` given     → fresh 256-bit token, written atomically
//!   else                               → auth disabled (warned)
//!
//! Clients present the token as `Authorization: Bearer <token>`, which is
//! what [`crate::provider::RemoteKeyFetcher`] sends when `auth_token` is set.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 32; // 256 bits

/// Holds the accepted bearer token.
pub struct AuthGuard {
    token: String,
    token_file: Option<PathBuf>,
}

impl AuthGuard {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_file: None,
        }
    }

    /// Resolve the server token. Returns `None` when auth is disabled.
    pub fn bootstrap(configured: Option<&str>, token_file: Option<&Path>) -> Result<Option<Self>> {
        if let Some(token) = configured.map(str::trim).filter(|t| !t.is_empty()) {
            info!("🔐 Bearer auth enabled (token from config)");
            return Ok(Some(Self::new(token)));
        }

        let Some(path) = token_file else {
            warn!("No auth token configured — credential routes are open");
            return Ok(None);
        };

        let token = match load_file_token(path) {
            Ok(token) => {
                info!(path = %path.display(), "🔐 Bearer auth enabled (token file)");
                token
            }
            Err(_) => {
                info!("🔐 No auth token found — generating new 256-bit token");
                let token = generate_token();
                atomic_write_token_file(path, &token)
                    .context("Failed to write generated token file")?;
                info!(path = %path.display(), "Auth token file written (0600)");
                token
            }
        };

        Ok(Some(Self {
            token,
            token_file: Some(path.to_path_buf()),
        }))
    }

    /// Validate a bearer token using constant-time comparison.
    pub fn validate(&self, candidate: &str) -> bool {
        constant_time_eq(candidate.trim(), &self.token)
    }

    /// Validate a raw `Authorization` header value.
    pub fn validate_header(&self, header: Option<&str>) -> bool {
        header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|token| self.validate(token))
            .unwrap_or(false)
    }

    pub fn token_file_path(&self) -> Option<&Path> {
        self.token_file.as_deref()
    }
}

impl Drop for AuthGuard {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

// ── Token Generation ────────────────────────────────────────────────

/// Cryptographically random 256-bit token, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);
    // Raw bytes are not needed once encoded
    bytes.zeroize();
    hex
}

// ── File Operations (Atomic) ────────────────────────────────────────

/// Write the token file via atomic rename.
///
/// Steps:
///   1. write to `<name>.token.tmp`
///   2. fsync the temp file
///   3. rename over the real path (atomic on POSIX)
///
/// A crash during 1 or 2 leaves the previous file intact; after 3 readers
/// see either the old token or the new one, never a partial write.
fn atomic_write_token_file(path: &Path, token: &str) -> Result<()> {
    let tmp_path = path.with_extension("token.tmp");

    // Parent may not exist on first boot
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context("Failed to create temp token file")?;

        // Restrict permissions before any token bytes hit the file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(token.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?; // fsync before the rename makes it visible
    }

    fs::rename(&tmp_path, path).context("Atomic rename failed")?;

    // Re-apply on the final path in case the rename target kept old bits
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Read a token file written by us or by an operator.
fn load_file_token(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).context("Failed to read token file")?;
    let trimmed = content.trim().to_string();
    if trimmed.is_empty() {
        anyhow::bail!("Token file is empty");
    }
    // Operators may supply their own token, so any non-blank single word is accepted
    if trimmed.chars().any(char::is_whitespace) {
        anyhow::bail!("Token file contains invalid data");
    }
    Ok(trimmed)
}

// ── Constant-Time Comparison ────────────────────────────────────────

/// Compare two strings without leaking where they differ.
///
/// Both inputs are HMAC'd under the same fixed key; equal inputs give equal
/// digests. The digests are fixed-length, so comparing them takes the same
/// time whatever the inputs' lengths or contents.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let key = b"keyrelay-constant-time-comparison-key";
    // HMAC accepts keys of any length; the else arm is unreachable in practice
    let (Ok(mut mac_a), Ok(mut mac_b)) = (
        HmacSha256::new_from_slice(key),
        HmacSha256::new_from_slice(key),
    ) else {
        return false;
    };

    mac_a.update(a.as_bytes());
    mac_b.update(b.as_bytes());

    // 32-byte arrays on both sides
    mac_a.finalize().into_bytes() == mac_b.finalize().into_bytes()
}

// ── Per-Caller Rate Limiting ────────────────────────────────────────

/// Sliding-window rate limiter per caller identity.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_secs: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    /// `Ok(())` if allowed, `Err(seconds until a slot frees)` otherwise.
    pub fn check(&self, caller: &str) -> std::result::Result<(), u64> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let timestamps = windows.entry(caller.to_string()).or_default();

        // Drop requests that have aged out of the window
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            // A slot frees when the oldest request in the window expires
            let remaining = timestamps
                .first()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)).as_secs())
                .unwrap_or(self.window.as_secs());
            return Err(remaining.max(1));
        }

        timestamps.push(now);
        Ok(())
    }
}
