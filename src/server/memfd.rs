//! Per-connection registry of memfd-backed shared-memory blocks.
//!
//! Grounded on the nix fd/fcntl usage in the teacher-adjacent
//! `colinmarc-magic-mirror` compositor's `sealed.rs` (memfd creation and
//! sealing) and `server.rs` (ancillary fd receipt via `recvmsg`). Here the
//! fds arrive from a *client* via `SCM_RIGHTS` rather than being created
//! locally, so this type only registers and reads them.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat::fstat;
use nix::unistd::pread;

use super::ServerError;

struct Block {
    fd: OwnedFd,
    size: usize,
}

/// Per-connection `shm_id -> (fd, size)` map (spec §4.4).
#[derive(Default)]
pub struct MemfdPool {
    blocks: HashMap<u32, Block>,
}

impl MemfdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `fd` under `shm_id`, replacing and closing any prior entry.
    /// Rejects zero-size fds. Marks the fd close-on-exec, per spec §4.4 and
    /// §5's file-descriptor discipline.
    pub fn register(&mut self, shm_id: u32, fd: OwnedFd) -> Result<(), ServerError> {
        let stat = fstat(fd.as_raw_fd())?;
        if stat.st_size <= 0 {
            return Err(ServerError::BadMemfdSize(shm_id));
        }

        let mut flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD)?);
        flags.insert(FdFlag::FD_CLOEXEC);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(flags))?;

        self.blocks.insert(
            shm_id,
            Block {
                fd,
                size: stat.st_size as usize,
            },
        );

        Ok(())
    }

    /// Bounds-checked positional read from a registered block.
    pub fn read_block(&self, shm_id: u32, offset: u32, length: u32) -> Result<Vec<u8>, ServerError> {
        let block = self
            .blocks
            .get(&shm_id)
            .ok_or(ServerError::UnknownMemfdBlock(shm_id))?;

        if length == 0 {
            return Err(ServerError::InvalidMemfdRange { shm_id, offset, length });
        }

        let end = (offset as u64)
            .checked_add(length as u64)
            .ok_or(ServerError::InvalidMemfdRange { shm_id, offset, length })?;
        if end > block.size as u64 {
            return Err(ServerError::InvalidMemfdRange { shm_id, offset, length });
        }

        let mut buf = vec![0u8; length as usize];
        let raw_fd: RawFd = block.fd.as_raw_fd();
        let n = pread(raw_fd, &mut buf, offset as i64)?;
        buf.truncate(n);
        if n != length as usize {
            return Err(ServerError::InvalidMemfdRange { shm_id, offset, length });
        }

        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl std::fmt::Debug for MemfdPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemfdPool")
            .field("blocks", &self.blocks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::io::{Seek, SeekFrom, Write};

    fn memfd(contents: &[u8]) -> OwnedFd {
        let name = CStr::from_bytes_with_nul(b"test\0").unwrap();
        let fd = nix::sys::memfd::memfd_create(name, nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC)
            .unwrap();
        let mut file = std::fs::File::from(fd);
        file.write_all(contents).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn register_and_read_within_bounds() {
        let mut pool = MemfdPool::new();
        pool.register(42, memfd(&[1, 2, 3, 4, 5])).unwrap();

        let bytes = pool.read_block(42, 1, 3).unwrap();
        assert_eq!(bytes, vec![2, 3, 4]);
    }

    #[test]
    fn read_past_size_is_rejected() {
        let mut pool = MemfdPool::new();
        pool.register(1, memfd(&[1, 2, 3])).unwrap();

        assert!(pool.read_block(1, 0, 100).is_err());
    }

    #[test]
    fn read_of_unregistered_id_is_rejected() {
        let pool = MemfdPool::new();
        assert!(pool.read_block(7, 0, 1).is_err());
    }

    #[test]
    fn zero_length_read_is_rejected() {
        let mut pool = MemfdPool::new();
        pool.register(1, memfd(&[1, 2, 3])).unwrap();
        assert!(pool.read_block(1, 0, 0).is_err());
    }

    #[test]
    fn reregistering_same_id_replaces_prior_block() {
        let mut pool = MemfdPool::new();
        pool.register(1, memfd(&[1, 2, 3])).unwrap();
        pool.register(1, memfd(&[9, 9])).unwrap();

        assert_eq!(pool.read_block(1, 0, 2).unwrap(), vec![9, 9]);
        assert_eq!(pool.len(), 1);
    }
}
