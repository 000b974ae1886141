//! Shared memory region management

use crate::{SharedMemoryError, Result};
use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::fs::File;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Smallest region we agree to map
pub const MIN_REGION_SIZE: usize = 512;

/// Largest region we agree to map (1GB)
pub const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// Shared memory region handle
pub struct SharedMemoryRegion {
    /// Region name/identifier
    pub name: String,
    /// Region size in bytes
    pub size: usize,
    /// Start of the mapping
    ptr: NonNull<u8>,
    /// Keeps the mapping alive, unmapped on drop
    _mapping: MmapMut,
}

impl SharedMemoryRegion {
    /// Create a new shared memory region
    ///
    /// Fails with [`SharedMemoryError::RegionExists`] if the name is taken;
    /// stale regions have to be removed first.
    pub fn create(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;
        validate_region_size(size)?;

        let c_name = c_region_name(&name)?;
        let fd = shm_open(
            c_name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| SharedMemoryError::from_platform_error(e as i32, format!("shm_open {}", name)))?;

        let file = File::from(fd);
        file.set_len(size as u64)?;

        let mut mapping = map_file(&file, size)?;
        let ptr = NonNull::new(mapping.as_mut_ptr())
            .ok_or_else(|| SharedMemoryError::MappingFailed("mmap returned null".to_string()))?;

        debug!("Created shared memory region {} ({} bytes)", name, size);

        Ok(Self {
            name,
            size,
            ptr,
            _mapping: mapping,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;

        let c_name = c_region_name(&name)?;
        let fd = shm_open(c_name.as_c_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| SharedMemoryError::from_platform_error(e as i32, format!("shm_open {}", name)))?;

        let file = File::from(fd);
        let size = file.metadata()?.len() as usize;
        validate_region_size(size)?;

        let mut mapping = map_file(&file, size)?;
        let ptr = NonNull::new(mapping.as_mut_ptr())
            .ok_or_else(|| SharedMemoryError::MappingFailed("mmap returned null".to_string()))?;

        debug!("Opened shared memory region {} ({} bytes)", name, size);

        Ok(Self {
            name,
            size,
            ptr,
            _mapping: mapping,
        })
    }

    /// Remove a region name from the system
    ///
    /// Returns `false` if there was nothing to remove. Existing mappings stay
    /// valid until their owners drop them.
    pub fn remove(name: &str) -> Result<bool> {
        let c_name = c_region_name(name)?;
        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ENOENT) => Ok(false),
            Err(e) => Err(SharedMemoryError::from_platform_error(e as i32, format!("shm_unlink {}", name))),
        }
    }

    /// Get raw pointer to the memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

// Safety: the mapping is shared memory; all access goes through atomics or
// process-shared locks placed inside it.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

/// Removes a region name when created and again when dropped
///
/// Guards both ends of a server's lifetime against stale segments left
/// behind by a crashed run.
pub struct SegmentCleaner {
    name: String,
}

impl SegmentCleaner {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        match SharedMemoryRegion::remove(&name) {
            Ok(true) => debug!("Removed stale shared memory region {}", name),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove shared memory region {}: {}", name, e),
        }
        Self { name }
    }
}

impl Drop for SegmentCleaner {
    fn drop(&mut self) {
        if let Err(e) = SharedMemoryRegion::remove(&self.name) {
            warn!("Failed to remove shared memory region {}: {}", self.name, e);
        }
    }
}

fn map_file(file: &File, size: usize) -> Result<MmapMut> {
    unsafe { MmapOptions::new().len(size).map_mut(file) }
        .map_err(|e| SharedMemoryError::MappingFailed(e.to_string()))
}

fn c_region_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| {
        SharedMemoryError::Platform("Invalid region name".to_string())
    })
}

/// Validate region name
fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(SharedMemoryError::Platform("Invalid region name length".to_string()));
    }

    if name.contains('\0') {
        return Err(SharedMemoryError::Platform("Region name contains null byte".to_string()));
    }

    if name.strip_prefix('/').unwrap_or(name).contains('/') {
        return Err(SharedMemoryError::Platform("Region name may only start with '/'".to_string()));
    }

    Ok(())
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    if size < MIN_REGION_SIZE || size > MAX_REGION_SIZE {
        return Err(SharedMemoryError::InvalidSize {
            size,
            min: MIN_REGION_SIZE,
            max: MAX_REGION_SIZE,
        });
    }

    Ok(())
}
