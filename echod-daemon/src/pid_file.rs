use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{io_err, DaemonError};
use crate::paths::ensure_parent_dir;

/// Exclusive PID file naming the running daemon. Removed on [`PidFile::release`]
/// or drop, but only while it still names this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
    released: bool,
}

impl PidFile {
    /// Claim `path` for the current process.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        Self::acquire_for(path, std::process::id() as i32)
    }

    /// Claim `path` for `pid`. A file naming a live process is a conflict; a
    /// file naming a dead process, or holding garbage, is replaced.
    pub fn acquire_for(path: &Path, pid: i32) -> Result<Self, DaemonError> {
        ensure_parent_dir(path).map_err(|e| io_err(path, e))?;

        // Two attempts: the second follows removal of a stale file.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}")
                        .and_then(|()| file.sync_all())
                        .map_err(|e| io_err(path, e))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(path, e)),
            }

            Self::check(path)?;
            tracing::warn!(path = %path.display(), "removing stale PID file");
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(path, e)),
            }
        }

        Err(io_err(
            path,
            std::io::Error::new(ErrorKind::AlreadyExists, "PID file reappeared during acquire"),
        ))
    }

    /// Fail with `PidFileConflict` if `path` names a live process.
    pub fn check(path: &Path) -> Result<(), DaemonError> {
        match Self::read(path)? {
            Some(pid) if is_process_alive(pid) => Err(DaemonError::PidFileConflict {
                path: path.to_path_buf(),
                pid,
            }),
            _ => Ok(()),
        }
    }

    /// Pid recorded in `path`; `None` if the file is missing or unparsable.
    pub fn read(path: &Path) -> Result<Option<i32>, DaemonError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn release(mut self) -> Result<(), DaemonError> {
        self.remove()
    }

    fn remove(&mut self) -> Result<(), DaemonError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if Self::read(&self.path)? != Some(self.pid) {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.path, e)),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            tracing::warn!(error = %err, "failed to remove PID file");
        }
    }
}

/// Probe with signal 0. `EPERM` means the process exists under another user.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    fn dead_pid() -> i32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    #[test]
    fn acquire_writes_pid_and_release_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("echod.pid");

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", own_pid()));
        assert_eq!(PidFile::read(&path).unwrap(), Some(own_pid()));

        pid_file.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("echod.pid");
        fs::write(&path, format!("{}\n", own_pid())).unwrap();

        let err = PidFile::acquire_for(&path, 99_999).unwrap_err();
        match err {
            DaemonError::PidFileConflict { pid, .. } => assert_eq!(pid, own_pid()),
            other => panic!("expected conflict, got: {other}"),
        }
        assert_eq!(PidFile::read(&path).unwrap(), Some(own_pid()), "file must be untouched");
    }

    #[test]
    fn dead_pid_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("echod.pid");
        let stale = dead_pid();
        assert!(!is_process_alive(stale));
        fs::write(&path, format!("{stale}\n")).unwrap();

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(PidFile::read(&path).unwrap(), Some(own_pid()));
        drop(pid_file);
        assert!(!path.exists(), "drop removes the file");
    }

    #[test]
    fn garbage_content_is_treated_as_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("echod.pid");
        fs::write(&path, "not a pid\n").unwrap();

        assert_eq!(PidFile::read(&path).unwrap(), None);
        PidFile::check(&path).unwrap();
        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(pid_file.pid(), own_pid());
    }

    #[test]
    fn release_leaves_a_file_owned_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("echod.pid");
        let pid_file = PidFile::acquire(&path).unwrap();

        fs::write(&path, "12345\n").unwrap();
        pid_file.release().unwrap();
        assert_eq!(PidFile::read(&path).unwrap(), Some(12345));
    }

    #[test]
    fn probe_rejects_non_positive_pids() {
        assert!(is_process_alive(own_pid()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }
}
