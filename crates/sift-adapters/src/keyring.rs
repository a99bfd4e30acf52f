//! Credential storage for sift
//!
//! The GitHub token lives in one system keychain entry as JSON. When the
//! keychain is disabled (or a populated credentials file already exists) a
//! local 0600 file is used instead.

use crate::util::env_flag_enabled;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

const KEYRING_SERVICE: &str = "sift-credentials";
const KEYRING_USERNAME: &str = "default";
pub const DISABLE_KEYRING_ENV: &str = "SIFT_DISABLE_KEYRING";
pub const CREDENTIALS_FILE_ENV: &str = "SIFT_CREDENTIALS_FILE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    github_token: Option<String>,
}

type KeyringResult<T> = Result<T, String>;

static CREDENTIALS_CACHE: OnceLock<Mutex<Option<StoredCredentials>>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<Option<StoredCredentials>> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(None))
}

fn keyring_disabled() -> bool {
    if cfg!(test) || env_flag_enabled(DISABLE_KEYRING_ENV) {
        return true;
    }
    if std::env::var(CREDENTIALS_FILE_ENV).is_ok_and(|p| !p.trim().is_empty()) {
        return true;
    }
    // A populated credentials file wins over the keychain to avoid prompts.
    matches!(read_fallback_credentials(), Ok(creds) if creds.github_token.is_some())
}

/// Human-friendly credential backend label used in CLI messages.
pub fn credentials_store_label() -> &'static str {
    if keyring_disabled() {
        "local credentials file"
    } else {
        "system keychain"
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn fallback_credentials_path() -> KeyringResult<PathBuf> {
    if let Ok(path) = std::env::var(CREDENTIALS_FILE_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    if cfg!(test) {
        return Ok(std::env::temp_dir().join("sift-test-credentials.json"));
    }

    dirs::config_dir()
        .map(|p| p.join("sift").join("credentials.json"))
        .ok_or_else(|| "Could not determine credentials file path".to_string())
}

fn read_fallback_credentials() -> KeyringResult<StoredCredentials> {
    let path = fallback_credentials_path()?;
    let json = match fs::read_to_string(&path) {
        Ok(json) => json,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StoredCredentials::default())
        }
        Err(err) => return Err(format!("{}: {}", path.display(), err)),
    };
    serde_json::from_str(&json).map_err(|e| format!("{}: invalid credentials: {}", path.display(), e))
}

/// Write the credentials file owner-only, replacing it atomically.
fn write_fallback_credentials(creds: &StoredCredentials) -> KeyringResult<()> {
    let path = fallback_credentials_path()?;
    let fail = |what: &str, err: std::io::Error| format!("{} {}: {}", what, path.display(), err);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail("cannot create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }

    let content = serde_json::to_vec(creds).map_err(|e| e.to_string())?;
    let tmp_path = path.with_extension("json.tmp");
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(&content)
    });
    if let Err(err) = written.and_then(|()| fs::rename(&tmp_path, &path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(fail("cannot write", err));
    }
    Ok(())
}

/// Log keychain trouble once per process.
pub fn warn_keychain_error_once(context: &str, err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        context,
        error = err,
        "couldn't access system keychain; set GITHUB_TOKEN or {}=1 to bypass it",
        DISABLE_KEYRING_ENV
    );
}

fn read_credentials_uncached() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return read_fallback_credentials();
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse credentials: {}", e))
        }
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn write_credentials(creds: &StoredCredentials) -> KeyringResult<()> {
    if keyring_disabled() {
        return write_fallback_credentials(creds);
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    let json = serde_json::to_string(creds)
        .map_err(|e| format!("Failed to serialize credentials: {}", e))?;
    entry.set_password(&json).map_err(|e| e.to_string())
}

fn read_credentials_cached() -> KeyringResult<StoredCredentials> {
    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(creds) = guard.as_ref() {
        return Ok(creds.clone());
    }
    let creds = read_credentials_uncached()?;
    *guard = Some(creds.clone());
    Ok(creds)
}

fn update_cache(creds: StoredCredentials) {
    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(creds);
}

#[cfg(test)]
fn reset_for_tests() {
    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = None;
    KEYRING_ERROR_WARNED.store(false, Ordering::Relaxed);
}

pub fn get_github_token() -> KeyringResult<Option<String>> {
    Ok(read_credentials_cached()?.github_token)
}

pub fn set_github_token(token: &str) -> KeyringResult<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err("Refusing to store an empty token".to_string());
    }
    let mut creds = read_credentials_cached().unwrap_or_default();
    creds.github_token = Some(token.to_string());
    write_credentials(&creds)?;
    update_cache(creds);
    Ok(())
}
