//! Plain-text blacklist file: one address per line, sorted.
//!
//! Downstream systems diff these files between runs, so the written order
//! is always lexicographic and independent of detection order.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::info;

use crate::error::DataError;

/// Read a previously written address list.
///
/// A missing file is an empty list. Blank lines and surrounding whitespace
/// are ignored.
///
/// # Errors
/// Returns [`DataError::Io`] if the file exists but cannot be read.
pub fn read_known(path: &Path) -> Result<BTreeSet<String>, DataError> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let content = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Write addresses sorted, one per line, creating parent directories.
///
/// # Errors
/// Returns [`DataError::Io`] if the directory or file cannot be written.
pub fn write_sorted(path: &Path, addresses: &BTreeSet<String>) -> Result<(), DataError> {
    let io_err = |source| DataError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut content = String::new();
    for address in addresses {
        content.push_str(address);
        content.push('\n');
    }
    std::fs::write(path, content).map_err(io_err)?;

    info!(path = %path.display(), addresses = addresses.len(), "blacklist written");
    Ok(())
}
