use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `<dir>/<name>.<generation>` for the log file `<dir>/<name>`.
pub fn rotated_path(base: &Path, generation: u64) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("echod.log");
    base.with_file_name(format!("{name}.{generation}"))
}

/// Generation number of `candidate` if it is a rotated backup of `base`.
pub fn backup_generation(base: &Path, candidate: &Path) -> Option<u64> {
    let base_name = base.file_name()?.to_str()?;
    let name = candidate.file_name()?.to_str()?;
    let suffix = name.strip_prefix(base_name)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// All rotated backups of `base` on disk, oldest generation first.
pub fn list_backups(base: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let dir = match base.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if let Some(generation) = backup_generation(base, &path) {
            backups.push((generation, path));
        }
    }
    backups.sort_by_key(|(generation, _)| *generation);
    Ok(backups)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
