//! Archive writer.
//!
//! Serializes a directory (normally the snapshot mount point) into a tar or
//! gzip-compressed tar file. The directory's own name is the single
//! top-level entry, so `/tmp/snap_backup` extracts as `snap_backup/...`.
//!
//! The archive is built under `<destination>.partial` and renamed into place
//! only once the tar stream is finished and synced. On any error the partial
//! file is removed. The process working directory is never changed.
//!
//! Sockets cannot be represented in tar; they are left out and reported in
//! `ArchiveArtifact::skipped`.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use lvsnap_clock::Clock;
use thiserror::Error;
use walkdir::WalkDir;

use crate::fs::MockFilesystem;

/// Suffix of an archive still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A finished archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub created_at: u64,
    pub compressed: bool,
    /// Source entries left out of the archive (sockets).
    pub skipped: Vec<PathBuf>,
}

/// Errors from archive writing.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive source {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("archive source {} has no directory name", .0.display())]
    UnnamedSource(PathBuf),

    #[error("failed to write archive {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writes a directory tree into an archive file.
pub trait ArchiveWriter: Send + Sync {
    fn write(
        &self,
        source_dir: &Path,
        destination: &Path,
        compressed: bool,
    ) -> Result<ArchiveArtifact, ArchiveError>;
}

impl<W: ArchiveWriter + ?Sized> ArchiveWriter for &W {
    fn write(
        &self,
        source_dir: &Path,
        destination: &Path,
        compressed: bool,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        (**self).write(source_dir, destination, compressed)
    }
}

/// `<destination>.partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Tar writer backed by the `tar` and `flate2` crates.
#[derive(Debug, Clone)]
pub struct TarArchiveWriter<C: Clock> {
    clock: C,
}

impl<C: Clock> TarArchiveWriter<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> ArchiveWriter for TarArchiveWriter<C> {
    fn write(
        &self,
        source_dir: &Path,
        destination: &Path,
        compressed: bool,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::NotADirectory(source_dir.to_path_buf()));
        }
        let entry_name = source_dir
            .file_name()
            .ok_or_else(|| ArchiveError::UnnamedSource(source_dir.to_path_buf()))?;

        let created_at = self.clock.now_unix_sec();
        let partial = partial_path(destination);

        let finished = write_tar(source_dir, Path::new(entry_name), &partial, compressed)
            .and_then(|skipped| fs::rename(&partial, destination).map(|()| skipped));
        let skipped = match finished {
            Ok(skipped) => skipped,
            Err(source) => {
                let _ = fs::remove_file(&partial);
                return Err(ArchiveError::Write {
                    path: destination.to_path_buf(),
                    source,
                });
            }
        };

        Ok(ArchiveArtifact {
            path: destination.to_path_buf(),
            created_at,
            compressed,
            skipped,
        })
    }
}

/// Returns the skipped source paths.
fn write_tar(
    source_dir: &Path,
    entry_name: &Path,
    out: &Path,
    compressed: bool,
) -> io::Result<Vec<PathBuf>> {
    let file = File::create(out)?;
    let (file, skipped) = if compressed {
        let encoder = GzEncoder::new(file, Compression::default());
        let (encoder, skipped) = append_tree(encoder, source_dir, entry_name)?;
        (encoder.finish()?, skipped)
    } else {
        append_tree(file, source_dir, entry_name)?
    };
    file.sync_all()?;
    Ok(skipped)
}

fn append_tree<W: Write>(
    writer: W,
    source_dir: &Path,
    entry_name: &Path,
) -> io::Result<(W, Vec<PathBuf>)> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut skipped = Vec::new();

    for entry in WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let name = if relative.as_os_str().is_empty() {
            entry_name.to_path_buf()
        } else {
            entry_name.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_socket() {
            skipped.push(entry.path().to_path_buf());
        } else if file_type.is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else {
            // Files, symlinks (stored as links), fifos and device nodes.
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    Ok((builder.into_inner()?, skipped))
}

/// A recorded `write` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub source_dir: PathBuf,
    pub destination: PathBuf,
    pub compressed: bool,
}

/// Archive writer for tests.
///
/// Records every request; optionally fails, and optionally registers the
/// produced file in a `MockFilesystem` so later steps can see it.
#[derive(Debug, Clone, Default)]
pub struct MockArchiveWriter {
    requests: Arc<Mutex<Vec<ArchiveRequest>>>,
    failure: Option<String>,
    created_at: u64,
    registry: Option<MockFilesystem>,
}

impl MockArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Successful writes add the destination to `fs` with mtime `created_at`.
    pub fn registering(fs: MockFilesystem, created_at: u64) -> Self {
        Self {
            created_at,
            registry: Some(fs),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ArchiveRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ArchiveWriter for MockArchiveWriter {
    fn write(
        &self,
        source_dir: &Path,
        destination: &Path,
        compressed: bool,
    ) -> Result<ArchiveArtifact, ArchiveError> {
        self.requests.lock().unwrap().push(ArchiveRequest {
            source_dir: source_dir.to_path_buf(),
            destination: destination.to_path_buf(),
            compressed,
        });

        if let Some(message) = &self.failure {
            return Err(ArchiveError::Write {
                path: destination.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, message.clone()),
            });
        }
        if let Some(fs) = &self.registry {
            fs.add_file(destination, self.created_at);
        }

        Ok(ArchiveArtifact {
            path: destination.to_path_buf(),
            created_at: self.created_at,
            compressed,
            skipped: Vec::new(),
        })
    }
}
