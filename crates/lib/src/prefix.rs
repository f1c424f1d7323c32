//! Install prefix layout and cross-process locking.
//!
//! Everything a run writes lives under one install prefix:
//!
//! ```text
//! <prefix>/
//! ├── embedded/          canonical install root
//! └── .kiln/
//!     ├── manifest.json  build manifest
//!     ├── lock           exclusive run lock
//!     ├── work/          per-build working directories
//!     └── logs/          per-recipe step output
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::{EMBEDDED_DIR, LOCK_FILENAME, MANIFEST_FILENAME, STATE_DIR};

/// Paths of an install prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPrefix {
  root: PathBuf,
}

impl InstallPrefix {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// `<prefix>/embedded`, the canonical install root.
  pub fn embedded_dir(&self) -> PathBuf {
    self.root.join(EMBEDDED_DIR)
  }

  pub fn state_dir(&self) -> PathBuf {
    self.root.join(STATE_DIR)
  }

  pub fn work_dir(&self) -> PathBuf {
    self.state_dir().join("work")
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.state_dir().join("logs")
  }

  pub fn log_file(&self, recipe: &str) -> PathBuf {
    self.logs_dir().join(format!("{recipe}.log"))
  }

  pub fn manifest_path(&self) -> PathBuf {
    self.state_dir().join(MANIFEST_FILENAME)
  }

  pub fn lock_path(&self) -> PathBuf {
    self.state_dir().join(LOCK_FILENAME)
  }

  /// Absolute location of a validated artifact subpath.
  pub fn artifact_dir(&self, artifact_path: &str) -> PathBuf {
    self.root.join(artifact_path)
  }

  /// Create the state directories.
  pub fn ensure_layout(&self) -> io::Result<()> {
    std::fs::create_dir_all(self.work_dir())?;
    std::fs::create_dir_all(self.logs_dir())?;
    Ok(())
  }

  /// Take the exclusive run lock on this prefix.
  pub fn lock(&self, command: &str) -> Result<PrefixLock, PrefixLockError> {
    PrefixLock::acquire(self, command)
  }
}

/// Holder information written into the lock file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub prefix: PathBuf,
}

#[derive(Debug, Error)]
pub enum PrefixLockError {
  #[error(
    "install prefix is locked by another process: {command} (PID {pid}, started at unix time {started_at_unix})\n\
     If you're sure no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at_unix: u64,
    lock_path: PathBuf,
  },

  #[error(
    "install prefix is locked (could not read lock metadata)\n\
     If you're sure no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create state directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Exclusive lock on an install prefix, released on drop.
#[derive(Debug)]
pub struct PrefixLock {
  file: File,
  lock_path: PathBuf,
}

impl PrefixLock {
  fn acquire(prefix: &InstallPrefix, command: &str) -> Result<Self, PrefixLockError> {
    let state = prefix.state_dir();
    let lock_path = prefix.lock_path();

    std::fs::create_dir_all(&state).map_err(PrefixLockError::CreateDir)?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(PrefixLockError::OpenFile)?;

    if let Err(err) = try_lock_exclusive(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention_error(&lock_path));
      }
      return Err(PrefixLockError::LockFailed(err));
    }

    write_metadata(&file, command, prefix.root())?;
    debug!(path = %lock_path.display(), "acquired prefix lock");

    Ok(Self { file, lock_path })
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_metadata(file: &File, command: &str, prefix: &Path) -> Result<(), PrefixLockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    prefix: prefix.to_path_buf(),
  };

  file.set_len(0).map_err(PrefixLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata)
    .map_err(|e| PrefixLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(PrefixLockError::WriteMetadata)?;
  Ok(())
}

fn read_contention_error(lock_path: &Path) -> PrefixLockError {
  if let Ok(mut file) = File::open(lock_path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return PrefixLockError::Contention {
        command: metadata.command,
        pid: metadata.pid,
        started_at_unix: metadata.started_at_unix,
        lock_path: lock_path.to_path_buf(),
      };
    }
  }

  PrefixLockError::ContentionUnknown {
    lock_path: lock_path.to_path_buf(),
  }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is plain data and valid when zeroed; the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
