//! Run lock.
//!
//! Two runs sharing a snapshot name would fight over the same logical
//! volume and mount point. The binary takes `<lock_dir>/<snapshot>.lock`,
//! created exclusively and holding the owner's pid, before the controller
//! starts; the file is removed when the guard drops. A lock whose pid no
//! longer exists is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Attempts before giving up on a lock that keeps changing under us.
const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {} (pid {pid})", path.display())]
    Held { path: PathBuf, pid: u32 },

    #[error("could not take lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id()).map_err(io_err)?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = match fs::read_to_string(path) {
                        Ok(text) => text.trim().parse::<u32>().ok(),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_err(e)),
                    };
                    if let Some(pid) = holder {
                        if process_alive(pid) {
                            return Err(LockError::Held {
                                path: path.to_path_buf(),
                                pid,
                            });
                        }
                    }
                    // Dead or unreadable owner.
                    match fs::remove_file(path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        Err(io_err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock file kept changing",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
