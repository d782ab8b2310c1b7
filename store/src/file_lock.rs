// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

///
/// An advisory file lock, released on drop. Shared locks are taken by every build against the
/// storage generation; the exclusive lock is reserved for operations that must not race any
/// build, like garbage collection and shard renames.
///
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn shared(path: &Path) -> io::Result<FileLock> {
        Self::acquire(path, libc::LOCK_SH)
    }

    pub fn exclusive(path: &Path) -> io::Result<FileLock> {
        Self::acquire(path, libc::LOCK_EX)
    }

    fn acquire(path: &Path, operation: libc::c_int) -> io::Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
