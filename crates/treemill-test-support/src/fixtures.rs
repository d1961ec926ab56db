//! Test fixtures: temporary source trees and shell transformers.
//!
//! Transformer scripts are run through `/bin/sh <script> -o <dest> <src>` so tests
//! never exec a file they have just written.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Interpreter used to run transformer scripts.
pub const SHELL: &str = "/bin/sh";

/// Copies the source to the destination, like a transformer that always succeeds.
pub const COPY_SCRIPT: &str = "cp \"$3\" \"$2\"\n";

/// Script failing with a stderr message for sources ending in `suffix`, copying otherwise.
#[must_use]
pub fn failing_script(suffix: &str) -> String {
    format!(
        "case \"$3\" in\n  *{suffix}) echo \"cannot decompile $3\" >&2; exit 1 ;;\nesac\ncp \"$3\" \"$2\"\n"
    )
}

/// Script sleeping for `seconds` before copying.
#[must_use]
pub fn sleeping_script(seconds: &str) -> String {
    format!("sleep {seconds}\ncp \"$3\" \"$2\"\n")
}

/// Temporary directory holding a source tree, a destination root and scripts.
pub struct Workspace {
    temp: TempDir,
    source: PathBuf,
    dest: PathBuf,
}

impl Workspace {
    /// Create an empty source directory; the destination is left for the run to create.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("failed to create temporary workspace")?;
        let source = temp.path().join("src");
        let dest = temp.path().join("dst");
        fs::create_dir_all(&source)
            .with_context(|| format!("failed to create {}", source.display()))?;
        Ok(Self { temp, source, dest })
    }

    /// Root of the source tree.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Root of the destination tree.
    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Write small files at each relative path under the source root.
    ///
    /// # Errors
    ///
    /// Returns an error if a file or its parent cannot be created.
    pub fn write_sources(&self, relatives: &[&str]) -> Result<()> {
        for relative in relatives {
            let path = self.source.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, relative.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }

    /// Write a transformer script outside the source tree and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the script cannot be written.
    pub fn script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let dir = self.temp.path().join("scripts");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, format!("#!{SHELL}\n{body}"))
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Sorted paths of every file under the destination root, relative to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination tree cannot be read.
    pub fn dest_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.dest.exists() {
            return Ok(files);
        }
        for entry in WalkDir::new(&self.dest) {
            let entry =
                entry.with_context(|| format!("failed to walk {}", self.dest.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.dest)
                .with_context(|| format!("{} escaped the destination", entry.path().display()))?;
            files.push(relative.to_path_buf());
        }
        files.sort();
        Ok(files)
    }
}

/// Whether directory permissions are enforced for this process (false when running as root).
///
/// # Errors
///
/// Returns an error if the probe directory cannot be created or restored.
#[cfg(unix)]
pub fn permissions_enforced() -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().context("failed to create probe directory")?;
    let probe = temp.path().join("locked");
    fs::create_dir(&probe).context("failed to create locked directory")?;
    fs::set_permissions(&probe, fs::Permissions::from_mode(0o000))?;
    let enforced = fs::read_dir(&probe).is_err();
    fs::set_permissions(&probe, fs::Permissions::from_mode(0o755))?;
    Ok(enforced)
}
