//! Named objects inside a shared memory segment
//!
//! The segment starts with a small header: magic, layout version, a bump
//! offset and a directory of named objects. The creator constructs objects
//! in place and registers them by name; openers look them up by the same
//! well-known names and get typed slices back.

use crate::{PlatformUtils, SharedMemoryError, SharedMemoryRegion, Result};
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Marker for types that may be placed in a shared segment
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), must not contain
/// pointers, references or heap-owned data, and must only be mutated through
/// atomics or a [`crate::SharedMutex`].
pub unsafe trait SharedMemorySafe {}

unsafe impl SharedMemorySafe for u8 {}
unsafe impl SharedMemorySafe for u32 {}
unsafe impl SharedMemorySafe for u64 {}
unsafe impl SharedMemorySafe for AtomicBool {}
unsafe impl SharedMemorySafe for AtomicU32 {}
unsafe impl SharedMemorySafe for AtomicU64 {}
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Maximum number of named objects per segment
pub const MAX_NAMED_OBJECTS: usize = 4;

/// Capacity of an object name, terminator included
pub const OBJECT_NAME_LENGTH: usize = 64;

#[repr(C)]
#[derive(Clone, Copy)]
struct ObjectEntry {
    name: [u8; OBJECT_NAME_LENGTH],
    offset: u64,
    count: u64,
    element_size: u64,
    element_align: u64,
}

impl ObjectEntry {
    fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(OBJECT_NAME_LENGTH);
        &self.name[..len]
    }
}

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    size: u64,
    used: u64,
    entry_count: AtomicU32,
    entries: [ObjectEntry; MAX_NAMED_OBJECTS],
}

/// Shared segment with a named-object directory
pub struct PortalSegment {
    region: SharedMemoryRegion,
}

impl PortalSegment {
    /// Bytes taken by the segment header
    pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();

    /// Create a segment and write an empty header
    pub fn create(name: impl Into<String>, size: usize) -> Result<Self> {
        if size <= Self::HEADER_SIZE {
            return Err(SharedMemoryError::InvalidSize {
                size,
                min: Self::HEADER_SIZE + 1,
                max: crate::MAX_REGION_SIZE,
            });
        }

        let region = SharedMemoryRegion::create(name, size)?;
        let header = region.as_ptr() as *mut SegmentHeader;

        unsafe {
            (*header).version = crate::SHARED_MEMORY_VERSION;
            (*header).size = size as u64;
            (*header).used = Self::HEADER_SIZE as u64;
            (*header).entry_count.store(0, Ordering::Relaxed);
            // published last: whoever sees the magic sees a complete header
            (*header).magic.store(crate::SHARED_MEMORY_MAGIC, Ordering::Release);
        }

        Ok(Self { region })
    }

    /// Open a segment created by another process
    pub fn open(name: impl Into<String>) -> Result<Self> {
        let region = SharedMemoryRegion::open(name)?;
        if region.size <= Self::HEADER_SIZE {
            return Err(SharedMemoryError::InvalidSize {
                size: region.size,
                min: Self::HEADER_SIZE + 1,
                max: crate::MAX_REGION_SIZE,
            });
        }

        let segment = Self { region };
        let header = segment.header();
        if header.magic.load(Ordering::Acquire) != crate::SHARED_MEMORY_MAGIC {
            return Err(SharedMemoryError::NotReady(format!(
                "segment {} has no valid header",
                segment.name()
            )));
        }
        if header.version != crate::SHARED_MEMORY_VERSION {
            return Err(SharedMemoryError::Protocol(format!(
                "Unsupported segment version: {}",
                header.version
            )));
        }

        Ok(segment)
    }

    pub fn name(&self) -> &str {
        &self.region.name
    }

    pub fn size(&self) -> usize {
        self.region.size
    }

    /// Bytes still free for an array of `T`, after alignment
    pub fn remaining_for<T>(&self) -> usize {
        let used = self.header().used as usize;
        let offset = PlatformUtils::align_up(used, align_of::<T>());
        self.region.size.saturating_sub(offset)
    }

    /// Construct `count` objects of type `T` in place and register them
    ///
    /// `init` receives every element index with a pointer to uninitialised
    /// memory and must fully initialise it.
    pub fn construct<T, F>(&mut self, name: &str, count: usize, mut init: F) -> Result<()>
    where
        T: SharedMemorySafe,
        F: FnMut(usize, *mut T) -> Result<()>,
    {
        if name.is_empty() || name.len() >= OBJECT_NAME_LENGTH {
            return Err(SharedMemoryError::NameTooLong {
                len: name.len(),
                limit: OBJECT_NAME_LENGTH - 1,
            });
        }
        if count == 0 {
            return Err(SharedMemoryError::Protocol(format!("Object {} has no elements", name)));
        }
        if self.lookup(name).is_some() {
            return Err(SharedMemoryError::Protocol(format!("Object {} already constructed", name)));
        }

        let index = self.header().entry_count.load(Ordering::Acquire) as usize;
        if index >= MAX_NAMED_OBJECTS {
            return Err(SharedMemoryError::Protocol("Segment directory is full".to_string()));
        }

        let offset = PlatformUtils::align_up(self.header().used as usize, align_of::<T>());
        let end = size_of::<T>()
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(offset))
            .filter(|&end| end <= self.region.size)
            .ok_or(SharedMemoryError::InvalidSize {
                size: offset.saturating_add(size_of::<T>().saturating_mul(count)),
                min: 0,
                max: self.region.size,
            })?;

        let base = unsafe { self.region.as_ptr().add(offset) as *mut T };
        for i in 0..count {
            init(i, unsafe { base.add(i) })?;
        }

        let mut entry = ObjectEntry {
            name: [0; OBJECT_NAME_LENGTH],
            offset: offset as u64,
            count: count as u64,
            element_size: size_of::<T>() as u64,
            element_align: align_of::<T>() as u64,
        };
        entry.name[..name.len()].copy_from_slice(name.as_bytes());

        let header = self.region.as_ptr() as *mut SegmentHeader;
        unsafe {
            (*header).entries[index] = entry;
            (*header).used = end as u64;
            (*header).entry_count.store(index as u32 + 1, Ordering::Release);
        }

        debug!("Constructed {} x{} at offset {} in {}", name, count, offset, self.name());
        Ok(())
    }

    /// Locate a named object constructed by the segment creator
    pub fn find<T: SharedMemorySafe>(&self, name: &str) -> Result<&[T]> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| SharedMemoryError::ObjectNotFound(name.to_string()))?;

        if entry.element_size as usize != size_of::<T>() || entry.element_align as usize != align_of::<T>() {
            return Err(SharedMemoryError::LayoutMismatch {
                name: name.to_string(),
                expected: size_of::<T>(),
                found: entry.element_size as usize,
            });
        }

        let offset = entry.offset as usize;
        let count = entry.count as usize;
        let in_bounds = size_of::<T>()
            .checked_mul(count)
            .and_then(|bytes| bytes.checked_add(offset))
            .map_or(false, |end| end <= self.region.size);
        if !in_bounds || offset % align_of::<T>() != 0 {
            return Err(SharedMemoryError::Protocol(format!("Object {} lies outside the segment", name)));
        }

        Ok(unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(offset) as *const T, count) })
    }

    fn lookup(&self, name: &str) -> Option<ObjectEntry> {
        let header = self.header();
        let count = (header.entry_count.load(Ordering::Acquire) as usize).min(MAX_NAMED_OBJECTS);
        header.entries[..count]
            .iter()
            .find(|entry| entry.name_bytes() == name.as_bytes())
            .copied()
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentCleaner;

    #[test]
    fn test_construct_and_find_across_mappings() {
        let name = PlatformUtils::generate_region_name("segment");
        let _cleaner = SegmentCleaner::new(&name);

        let mut creator = PortalSegment::create(&name, 4096).unwrap();
        creator
            .construct::<AtomicU64, _>("counters", 8, |i, slot| {
                unsafe { slot.write(AtomicU64::new(i as u64 * 10)) };
                Ok(())
            })
            .unwrap();

        let opener = PortalSegment::open(&name).unwrap();
        let counters = opener.find::<AtomicU64>("counters").unwrap();
        assert_eq!(counters.len(), 8);
        assert_eq!(counters[3].load(Ordering::SeqCst), 30);

        counters[3].store(99, Ordering::SeqCst);
        let own = creator.find::<AtomicU64>("counters").unwrap();
        assert_eq!(own[3].load(Ordering::SeqCst), 99);
    }

    #[test]
    fn test_find_rejects_missing_and_mismatched() {
        let name = PlatformUtils::generate_region_name("segment");
        let _cleaner = SegmentCleaner::new(&name);

        let mut segment = PortalSegment::create(&name, 4096).unwrap();
        segment
            .construct::<u32, _>("words", 4, |_, slot| {
                unsafe { slot.write(0) };
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            segment.find::<u32>("absent"),
            Err(SharedMemoryError::ObjectNotFound(_))
        ));
        assert!(matches!(
            segment.find::<u64>("words"),
            Err(SharedMemoryError::LayoutMismatch { expected: 8, found: 4, .. })
        ));
    }

    #[test]
    fn test_construct_respects_capacity() {
        let name = PlatformUtils::generate_region_name("segment");
        let _cleaner = SegmentCleaner::new(&name);

        let mut segment = PortalSegment::create(&name, 1024).unwrap();
        let room = segment.remaining_for::<u64>() / size_of::<u64>();

        let too_many = segment.construct::<u64, _>("big", room + 1, |_, slot| {
            unsafe { slot.write(0) };
            Ok(())
        });
        assert!(matches!(too_many, Err(SharedMemoryError::InvalidSize { .. })));

        segment
            .construct::<u64, _>("big", room, |_, slot| {
                unsafe { slot.write(0) };
                Ok(())
            })
            .unwrap();
        assert_eq!(segment.remaining_for::<u64>(), 0);

        let duplicate = segment.construct::<u8, _>("big", 1, |_, slot| {
            unsafe { slot.write(0) };
            Ok(())
        });
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_open_requires_header() {
        let name = PlatformUtils::generate_region_name("segment");
        let _cleaner = SegmentCleaner::new(&name);

        let _raw = SharedMemoryRegion::create(&name, 4096).unwrap();
        assert!(matches!(
            PortalSegment::open(&name),
            Err(SharedMemoryError::NotReady(_))
        ));
    }
}
