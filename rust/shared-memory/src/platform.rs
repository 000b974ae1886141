//! Platform-specific helpers for shared memory

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Generate a unique region name
    ///
    /// The result starts with `/` and stays short enough for platforms that
    /// cap POSIX shared memory names at 31 bytes.
    pub fn generate_region_name(prefix: &str) -> String {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let prefix = prefix.trim_start_matches('/');
        let prefix = &prefix[..prefix.len().min(12)];

        format!("/{}_{}", prefix, &unique[..16])
    }

    /// Round `value` up to a multiple of `align` (a power of two)
    pub fn align_up(value: usize, align: usize) -> usize {
        debug_assert!(align.is_power_of_two());
        (value + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_utils() {
        assert!(PlatformUtils::get_process_id() > 0);

        let region_name = PlatformUtils::generate_region_name("test");
        assert!(region_name.starts_with("/test_"));
        assert!(region_name.len() <= 31);
        assert_ne!(region_name, PlatformUtils::generate_region_name("test"));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(PlatformUtils::align_up(0, 8), 0);
        assert_eq!(PlatformUtils::align_up(1, 8), 8);
        assert_eq!(PlatformUtils::align_up(8, 8), 8);
        assert_eq!(PlatformUtils::align_up(1000, 64), 1024);
    }
}
