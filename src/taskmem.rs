//! # Task memory access
//!
//! Reads byte ranges out of a target process. Reads are all-or-nothing: a
//! request either fills the whole buffer or fails, there are no partial
//! results. Zero-sized requests are rejected by contract because the
//! underlying OS primitives behave unreliably for them.
//!
//! [`remap`] tries to establish a real memory mapping of the requested range
//! (possible when the range is backed by a file). Not every range can be
//! mapped; callers must treat [`TraceError::NotMappable`] as "fall back to a
//! plain read", which [`remap_or_read`] does for them. Both mapped and copied
//! buffers come back as one [`OwnedRegion`] type, so there is exactly one
//! disposal path and exactly one unmap per successful map.

use std::ffi::c_void;
use std::fs::File;
use std::io::IoSliceMut;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::{sysconf, SysconfVar};
use tracing::{debug, warn};

use crate::addr::Addr;
use crate::errors::{Result, TraceError};
use crate::task::Task;

/// An owned buffer of target memory, either truly mapped or copied
///
/// Dropping it releases the mapping (or the allocation); the bytes must not
/// be used after that point, which the borrow checker enforces.
#[derive(Debug)]
pub enum OwnedRegion {
    Mapped {
        base: NonNull<c_void>,
        map_len: usize,
        /// distance from `base` to the first requested byte (page rounding)
        lead: usize,
        len: usize,
    },
    Copied(Vec<u8>),
}

impl OwnedRegion {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            OwnedRegion::Mapped {
                base, lead, len, ..
            } => unsafe { std::slice::from_raw_parts(base.as_ptr().cast::<u8>().add(*lead), *len) },
            OwnedRegion::Copied(v) => v,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            OwnedRegion::Mapped { len, .. } => *len,
            OwnedRegion::Copied(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this region is a real mapping rather than a copy
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self, OwnedRegion::Mapped { .. })
    }
}

impl Deref for OwnedRegion {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        if let OwnedRegion::Mapped { base, map_len, .. } = self {
            if let Err(e) = unsafe { munmap(*base, *map_len) } {
                warn!("munmap of {map_len} bytes failed: {e}");
            }
        }
    }
}

// the mapping is immutable and private, so moving it across threads is fine
unsafe impl Send for OwnedRegion {}

/// Reads exactly `buf.len()` bytes at `addr` in `task`
///
/// # Errors
///
/// [`TraceError::InvalidArgument`] for an empty buffer or an invalid address;
/// an OS error when the range is not fully readable. Never returns with a
/// partially filled buffer counted as success.
pub fn read_exact(task: Task, addr: Addr, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Err(TraceError::InvalidArgument(
            "zero-sized reads are rejected".into(),
        ));
    }
    if addr.is_invalid() || addr.checked_add(buf.len() as u64).is_invalid() {
        return Err(TraceError::InvalidArgument(format!(
            "read of {} bytes at {addr} is out of range",
            buf.len()
        )));
    }

    let wanted = buf.len();
    let remote = RemoteIoVec {
        base: addr.usize(),
        len: wanted,
    };
    match process_vm_readv(task.pid(), &mut [IoSliceMut::new(buf)], &[remote]) {
        Ok(n) if n == wanted => Ok(()),
        Ok(n) => {
            debug!("short read at {addr}: {n} of {wanted} bytes");
            Err(TraceError::Os(nix::Error::EFAULT))
        }
        // some hardened kernels disable process_vm_readv; procfs still works
        Err(nix::Error::ENOSYS) | Err(nix::Error::EPERM) => read_via_procfs(task, addr, buf),
        Err(e) => Err(e.into()),
    }
}

fn read_via_procfs(task: Task, addr: Addr, buf: &mut [u8]) -> Result<()> {
    let file = File::open(format!("/proc/{}/mem", task.pid()))?;
    file.read_exact_at(buf, addr.u64())?;
    Ok(())
}

/// Reads `len` bytes at `addr` into a freshly allocated buffer
///
/// # Errors
///
/// Same contract as [`read_exact`].
pub fn read_vec(task: Task, addr: Addr, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact(task, addr, &mut buf)?;
    Ok(buf)
}

/// Maps `len` bytes at `addr` of `task` into the calling process
///
/// Only file-backed ranges can be mapped; the bytes come from the backing
/// file, which for read-only image ranges is identical to target memory.
///
/// # Errors
///
/// [`TraceError::NotMappable`] when the range is anonymous, spans region
/// boundaries, or lies beyond the backing file; callers fall back to
/// [`read_vec`]. [`TraceError::InvalidArgument`] for zero-sized requests and
/// invalid addresses.
pub fn remap(task: Task, addr: Addr, len: usize) -> Result<OwnedRegion> {
    if len == 0 {
        return Err(TraceError::InvalidArgument(
            "zero-sized mappings are rejected".into(),
        ));
    }
    if addr.is_invalid() || addr.checked_add(len as u64).is_invalid() {
        return Err(TraceError::InvalidArgument(format!(
            "mapping of {len} bytes at {addr} is out of range"
        )));
    }

    let maps = proc_maps::get_process_maps(task.raw_pid())?;
    let region = maps
        .iter()
        .find(|r| {
            let start = r.start() as u64;
            let end = start + r.size() as u64;
            addr.u64() >= start && addr.u64() + len as u64 <= end
        })
        .ok_or(TraceError::NotMappable)?;

    let Some(path) = region.filename() else {
        return Err(TraceError::NotMappable);
    };
    if !path.is_absolute() {
        // pseudo paths like [vdso] or [stack]
        return Err(TraceError::NotMappable);
    }

    let file_off = region.offset as u64 + (addr.u64() - region.start() as u64);
    let file = File::open(path)?;
    if file.metadata()?.len() < file_off + len as u64 {
        return Err(TraceError::NotMappable);
    }

    map_range(&file, file_off, len)
}

/// [`remap`] with the documented fallback to a plain read applied
///
/// # Errors
///
/// Same contract as [`read_vec`].
pub fn remap_or_read(task: Task, addr: Addr, len: usize) -> Result<OwnedRegion> {
    match remap(task, addr, len) {
        Ok(region) => Ok(region),
        Err(TraceError::NotMappable) => Ok(OwnedRegion::Copied(read_vec(task, addr, len)?)),
        Err(e) => {
            debug!("remap of {len} bytes at {addr} failed ({e}), falling back to read");
            Ok(OwnedRegion::Copied(read_vec(task, addr, len)?))
        }
    }
}

/// Maps a whole file read-only
///
/// # Errors
///
/// Fails for missing or empty files.
pub fn map_file(path: &Path) -> Result<OwnedRegion> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Err(TraceError::InvalidFormat(format!(
            "{} is empty",
            path.display()
        )));
    }
    map_range(&file, 0, len)
}

fn map_range(file: &File, offset: u64, len: usize) -> Result<OwnedRegion> {
    let page = page_size();
    let aligned = offset & !(page - 1);
    let lead = (offset - aligned) as usize;
    let map_len = len + lead;

    let map_len_nz =
        NonZeroUsize::new(map_len).ok_or_else(|| TraceError::InvalidArgument("empty map".into()))?;
    let base = unsafe {
        mmap(
            None,
            map_len_nz,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            file,
            aligned as i64,
        )?
    };

    Ok(OwnedRegion::Mapped {
        base,
        map_len,
        lead,
        len,
    })
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as u64,
        _ => 4096,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PATTERN: [u8; 32] = *b"crashtrace read pattern 01234567";

    #[test]
    fn test_read_own_memory() {
        let addr = Addr::from(PATTERN.as_ptr() as usize);
        let got = read_vec(Task::current(), addr, PATTERN.len()).unwrap();
        assert_eq!(got, PATTERN);
    }

    #[test]
    fn test_zero_sized_read_is_rejected() {
        let addr = Addr::from(PATTERN.as_ptr() as usize);
        let err = read_vec(Task::current(), addr, 0).unwrap_err();
        assert!(matches!(err, TraceError::InvalidArgument(_)));
    }

    #[test]
    fn test_unreadable_address_fails() {
        assert!(read_vec(Task::current(), Addr::from(8u64), 8).is_err());
        assert!(read_vec(Task::current(), Addr::INVALID, 8).is_err());
    }

    #[test]
    fn test_remap_of_executable_matches_read() {
        // a function body is file-backed text and not patched at runtime
        let addr = Addr::from(test_remap_of_executable_matches_read as usize);
        let mapped = remap(Task::current(), addr, 16).unwrap();
        assert!(mapped.is_mapped());
        let read = read_vec(Task::current(), addr, 16).unwrap();
        assert_eq!(mapped.bytes(), &read[..]);
    }

    #[test]
    fn test_remap_of_stack_falls_back() {
        let local = 0u64;
        let addr = Addr::from(std::ptr::addr_of!(local) as usize);
        assert!(matches!(
            remap(Task::current(), addr, 8),
            Err(TraceError::NotMappable)
        ));
        let region = remap_or_read(Task::current(), addr, 8).unwrap();
        assert!(!region.is_mapped());
        assert_eq!(region.bytes(), &[0u8; 8]);
    }

    #[test]
    fn test_remap_rejects_invalid_address() {
        assert!(matches!(
            remap(Task::current(), Addr::INVALID, 8),
            Err(TraceError::InvalidArgument(_))
        ));
        assert!(matches!(
            remap(Task::current(), Addr::from(u64::MAX - 4), 8),
            Err(TraceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_map_file_of_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let region = map_file(&exe).unwrap();
        assert_eq!(&region.bytes()[..4], b"\x7fELF");
    }
}
