//! Advisory locking of the data file.
//!
//! A collection owns its three files for its whole lifetime; concurrent
//! opens from another process would bypass the single-writer contract.
//! The data file itself carries an exclusive OS lock, so no extra lock
//! file is needed. The lock is released when the file handle is closed.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub(crate) fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn lock_exclusive(_file: &File) -> io::Result<()> {
    // No advisory locking on this platform; opening still works, the
    // single-process contract is just not enforced.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    #[cfg(unix)]
    fn test_second_handle_cannot_lock() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("data");

        let first = File::create(&path).expect("Failed to create file");
        lock_exclusive(&first).expect("Failed to acquire lock");

        let second = fs::File::options()
            .read(true)
            .write(true)
            .open(&path)
            .expect("Failed to open second handle");
        assert!(lock_exclusive(&second).is_err());

        // Dropping the first handle releases the lock.
        drop(first);
        lock_exclusive(&second).expect("Failed to acquire lock after release");
    }
}
