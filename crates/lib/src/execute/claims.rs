//! Exclusive claims on artifact subpaths of the install prefix.
//!
//! Two builds may not write overlapping subpaths at the same time. Paths
//! overlap when they are equal or one contains the other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct SubpathClaims {
  held: Mutex<Vec<PathBuf>>,
  released: Notify,
}

/// A held claim, released on drop.
#[derive(Debug)]
pub(crate) struct Claim {
  claims: Arc<SubpathClaims>,
  path: PathBuf,
}

impl SubpathClaims {
  /// Wait until no held claim overlaps `subpath`, then claim it.
  pub(crate) async fn claim(self: &Arc<Self>, subpath: &str) -> Claim {
    let path = PathBuf::from(subpath);
    loop {
      // Registered before checking so a release in between is not missed.
      let released = self.released.notified();
      {
        let mut held = self.lock();
        let conflict = held.iter().find(|other| overlaps(other, &path)).cloned();
        match conflict {
          None => {
            held.push(path.clone());
            return Claim {
              claims: Arc::clone(self),
              path,
            };
          }
          Some(other) => debug!(subpath = %path.display(), held_by = %other.display(), "waiting for subpath"),
        }
      }
      released.await;
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
    self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Drop for Claim {
  fn drop(&mut self) {
    let mut held = self.claims.lock();
    if let Some(pos) = held.iter().position(|p| *p == self.path) {
      held.swap_remove(pos);
    }
    drop(held);
    self.claims.released.notify_waiters();
  }
}

fn overlaps(a: &Path, b: &Path) -> bool {
  a.starts_with(b) || b.starts_with(a)
}
