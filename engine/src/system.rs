//! Page mappings for code loaded from import archives.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and mprotect
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    }

    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

pub fn page_align(size: usize) -> usize {
    size.div_ceil(OS_PAGE_SIZE).max(1) * OS_PAGE_SIZE
}

/// Zeroed read-write pages. `size` is rounded up to whole pages.
#[cfg(unix)]
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no aliasing
    let ptr = unsafe { unix::anonymous_mmap(page_align(size)) };
    NonNull::new(ptr)
}

#[cfg(not(unix))]
#[must_use]
pub fn map_memory(_size: usize) -> Option<NonNull<u8>> {
    None
}

/// # Safety
/// `ptr` and `size` must come from one `map_memory` call and no reference
/// into the mapping may outlive this call.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    #[cfg(unix)]
    {
        // SAFETY: forwarded contract
        unsafe { unix::anonymous_munmap(ptr.as_ptr(), page_align(size)) };
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, size);
    }
}

/// Makes a mapping read-execute.
///
/// # Safety
/// `ptr` and `size` must come from one `map_memory` call; nothing may write
/// through the mapping afterwards.
pub unsafe fn make_executable(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: forwarded contract
        let rc = unsafe {
            unix::mprotect(
                ptr.as_ptr().cast(),
                page_align(size),
                unix::PROT_READ | unix::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, size);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "executable mappings are not supported on this platform",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn mappings_are_zeroed_and_page_sized() {
        assert_eq!(page_align(0), OS_PAGE_SIZE);
        assert_eq!(page_align(OS_PAGE_SIZE + 1), 2 * OS_PAGE_SIZE);

        let ptr = map_memory(100).expect("mapping");
        // SAFETY: freshly mapped, 100 bytes are in bounds
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(ptr.as_ptr(), 100);
            assert!(bytes.iter().all(|b| *b == 0));
            bytes[99] = 7;
            make_executable(ptr, 100).expect("mprotect");
            assert_eq!(*ptr.as_ptr().add(99), 7);
            unmap_memory(ptr, 100);
        }
    }
}
