//! Source unpacking into a build's working directory.
//!
//! Supports:
//! - `.tar.gz` / `.tgz`
//! - `.tar`
//! - `.zip`
//! - plain directory trees (copied)

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("unsupported archive format: {0}")]
  UnsupportedArchive(PathBuf),

  #[error("failed to unpack {archive}: {source}")]
  Unpack {
    archive: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("archive entry escapes the destination: {0}")]
  UnsafeEntry(String),

  #[error("failed to copy source tree {path}: {message}")]
  Copy { path: PathBuf, message: String },
}

/// Unpack an archive into `dest`, keeping the archive's own directory structure.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), ExtractError> {
  let name = archive_path
    .file_name()
    .map(|n| n.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();

  let unpack_err = |source: io::Error| ExtractError::Unpack {
    archive: archive_path.to_path_buf(),
    source,
  };

  fs::create_dir_all(dest).map_err(unpack_err)?;

  if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
    let file = File::open(archive_path).map_err(unpack_err)?;
    unpack_tar(Archive::new(GzDecoder::new(BufReader::new(file))), dest).map_err(unpack_err)?;
  } else if name.ends_with(".tar") {
    let file = File::open(archive_path).map_err(unpack_err)?;
    unpack_tar(Archive::new(BufReader::new(file)), dest).map_err(unpack_err)?;
  } else if name.ends_with(".zip") {
    unpack_zip(archive_path, dest)?;
  } else {
    return Err(ExtractError::UnsupportedArchive(archive_path.to_path_buf()));
  }

  debug!(archive = %archive_path.display(), dest = %dest.display(), "unpacked source");
  Ok(())
}

fn unpack_tar<R: io::Read>(mut archive: Archive<R>, dest: &Path) -> io::Result<()> {
  archive.set_preserve_permissions(true);
  for entry in archive.entries()? {
    let mut entry = entry?;
    // unpack_in refuses entries that would land outside `dest`
    entry.unpack_in(dest)?;
  }
  Ok(())
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<(), ExtractError> {
  let zip_err = |e: zip::result::ZipError| ExtractError::Unpack {
    archive: archive_path.to_path_buf(),
    source: io::Error::other(e),
  };
  let io_err = |source: io::Error| ExtractError::Unpack {
    archive: archive_path.to_path_buf(),
    source,
  };

  let file = File::open(archive_path).map_err(io_err)?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

  for i in 0..archive.len() {
    let mut file = archive.by_index(i).map_err(zip_err)?;

    let path = file
      .enclosed_name()
      .ok_or_else(|| ExtractError::UnsafeEntry(file.name().to_string()))?;
    let dest_path = dest.join(path);

    if file.is_dir() {
      fs::create_dir_all(&dest_path).map_err(io_err)?;
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut outfile = File::create(&dest_path).map_err(io_err)?;
    io::copy(&mut file, &mut outfile).map_err(io_err)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = file.unix_mode() {
        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode)).map_err(io_err)?;
      }
    }
  }

  Ok(())
}

/// Copy a directory tree into `dest`. Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<(), ExtractError> {
  let copy_err = |path: &Path, message: String| ExtractError::Copy {
    path: path.to_path_buf(),
    message,
  };

  for entry in WalkDir::new(src) {
    let entry = entry.map_err(|e| copy_err(src, e.to_string()))?;
    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
    let target = dest.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target).map_err(|e| copy_err(entry.path(), e.to_string()))?;
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path()).map_err(|e| copy_err(entry.path(), e.to_string()))?;
      symlink(&link, &target).map_err(|e| copy_err(entry.path(), e.to_string()))?;
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target).map_err(|e| copy_err(entry.path(), e.to_string()))?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(original, link)
}

/// The single top-level directory of an unpacked tree, if there is exactly one entry and it is a directory.
pub fn single_top_level_dir(dir: &Path) -> io::Result<Option<PathBuf>> {
  let mut entries = fs::read_dir(dir)?;
  let (Some(first), None) = (entries.next().transpose()?, entries.next().transpose()?) else {
    return Ok(None);
  };
  Ok(first.file_type()?.is_dir().then(|| first.path()))
}
