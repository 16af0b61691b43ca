//! Canonical paths for vigil state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vigil::config::paths;
//!
//! let home = paths::ensure_home()?;
//! let drop_dir = paths::watch_dir()?;
//! ```
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `$VIGIL_HOME/ledger.db` | Idempotency ledger (sqlite backend) |
//! | `$VIGIL_HOME/ledger.jsonl` | Idempotency ledger (jsonl backend) |
//! | `$VIGIL_HOME/segments/` | Default drop directory |

use std::path::PathBuf;

use anyhow::Result;

/// Get the vigil home directory (~/.vigil)
pub fn vigil_home() -> Result<PathBuf> {
    super::vigil_home()
}

/// Get the drop directory the watcher monitors
pub fn watch_dir() -> Result<PathBuf> {
    Ok(super::config()?.watch_dir.clone())
}

/// Ensure the home directory exists and return it
pub fn ensure_home() -> Result<PathBuf> {
    let home = vigil_home()?;
    std::fs::create_dir_all(&home)?;
    Ok(home)
}
