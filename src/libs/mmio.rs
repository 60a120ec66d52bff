use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::libs::error::{invalid, Result};
use crate::libs::regs::RegisterSurface;

pub const LOCK_DIR: &str = "/var/run/pmdt_tools";

/// Register window onto a resource file (a PCI BAR under sysfs or
/// `/dev/mem`), held under an exclusive advisory lock until dropped.
pub struct MmioWindow {
    resource: PathBuf,
    /// Complex address of the first mapped byte.
    base: u64,
    map: Mutex<MmapMut>,
    lock_file: File,
}

impl MmioWindow {
    /// Maps `len` bytes of `resource`, starting at file offset `offset`, as
    /// complex addresses `base..base + len`.
    pub fn open<P: AsRef<Path>>(resource: P, offset: u64, base: u64, len: usize) -> Result<Self> {
        Self::open_with_lock_dir(resource, offset, base, len, Path::new(LOCK_DIR))
    }

    pub fn open_with_lock_dir<P: AsRef<Path>>(
        resource: P,
        offset: u64,
        base: u64,
        len: usize,
        lock_dir: &Path,
    ) -> Result<Self> {
        let resource = resource.as_ref().to_path_buf();
        if len == 0 || len % 4 != 0 {
            return Err(invalid("window length", format!("{:#x} is not a multiple of 4", len)));
        }
        let lock_file = Self::acquire_lock_file(lock_dir, &resource)?;

        let file = OpenOptions::new().read(true).write(true).open(&resource)?;
        // SAFETY: the mapping is only touched through aligned volatile
        // accesses and the advisory lock keeps other tools away.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&file)? };
        log::debug!("mapped {} at {:#x}, {:#x} bytes", resource.display(), base, len);

        Ok(MmioWindow {
            resource,
            base,
            map: Mutex::new(map),
            lock_file,
        })
    }

    fn acquire_lock_file(lock_dir: &Path, resource: &Path) -> Result<File> {
        fs::create_dir_all(lock_dir)?;
        let name: String = resource
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let lock_file = File::create(lock_dir.join(format!("{}.lock", name)))?;
        lock_file.try_lock_exclusive()?;
        Ok(lock_file)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MmapMut> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let off = addr.checked_sub(self.base)? as usize;
        (off % 4 == 0 && off + 4 <= len).then_some(off)
    }
}

impl RegisterSurface for MmioWindow {
    fn read32(&self, addr: u64) -> u32 {
        let map = self.lock();
        match self.offset_of(addr, map.len()) {
            // SAFETY: in bounds and 4-byte aligned.
            Some(off) => unsafe { ptr::read_volatile(map.as_ptr().add(off) as *const u32) },
            None => {
                log::warn!("read of {:#x} outside window {}", addr, self);
                u32::MAX
            }
        }
    }

    fn write32(&self, addr: u64, val: u32) {
        let mut map = self.lock();
        match self.offset_of(addr, map.len()) {
            // SAFETY: in bounds and 4-byte aligned.
            Some(off) => unsafe { ptr::write_volatile(map.as_mut_ptr().add(off) as *mut u32, val) },
            None => log::warn!("write of {:#x} outside window {} dropped", addr, self),
        }
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        if let Err(err) = self.lock_file.unlock() {
            log::warn!("unlocking {}: {}", self, err);
        }
    }
}

impl fmt::Display for MmioWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.resource.display(), self.base)
    }
}
