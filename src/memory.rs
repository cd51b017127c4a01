//! Backing-memory providers: where a pool gets its arena from and where it
//! returns it on teardown.

use std::{
    alloc::{self, Layout},
    io,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::utils::align;

/// Supplies one zero-initialized, page-aligned block of memory for the
/// lifetime of a pool and takes it back on teardown.
///
/// # Safety
///
/// A successful [`acquire`](BackingMemory::acquire) must return memory that is
/// valid for reads and writes for exactly `len` bytes, is zero-filled, and is
/// not handed to anyone else until it is passed back to
/// [`release`](BackingMemory::release).
pub unsafe trait BackingMemory {
    /// Request a memory region of size `len`.
    fn acquire(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `base` to the provider.
    ///
    /// # Safety
    ///
    /// `base` and `len` must come from a single earlier call to `acquire` on
    /// this provider, and the memory must not be used afterwards.
    unsafe fn release(&self, base: NonNull<u8>, len: usize) -> io::Result<()>;
}

unsafe impl<M: BackingMemory + ?Sized> BackingMemory for &M {
    fn acquire(&self, len: usize) -> io::Result<NonNull<u8>> {
        (**self).acquire(len)
    }

    unsafe fn release(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { (**self).release(base, len) }
    }
}

unsafe impl<M: BackingMemory + ?Sized> BackingMemory for Arc<M> {
    fn acquire(&self, len: usize) -> io::Result<NonNull<u8>> {
        (**self).acquire(len)
    }

    unsafe fn release(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { (**self).release(base, len) }
    }
}

/// Anonymous private mappings straight from the kernel: `mmap`/`munmap` on
/// unix, `VirtualAlloc`/`VirtualFree` on windows. Pages are zeroed and only
/// backed by physical memory once touched, so large arenas are cheap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmap;

/// Arena memory from the global allocator, aligned to the page size.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapMemory;

/// Cached virtual memory page size of the computer. This is usually 4096.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the virtual memory page size of the computer in bytes.
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = platform::page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
mod platform {
    use super::{BackingMemory, Mmap};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        io,
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    unsafe impl BackingMemory for Mmap {
        fn acquire(&self, len: usize) -> io::Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            NonNull::new(addr.cast::<u8>())
                .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
        }

        unsafe fn release(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
            match unsafe { munmap(base.as_ptr().cast::<c_void>(), len as size_t) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{BackingMemory, Mmap};

    use windows::Win32::System::{Memory, SystemInformation};

    unsafe impl BackingMemory for Mmap {
        fn acquire(&self, len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, protection) };

            NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)
        }

        unsafe fn release(&self, base: NonNull<u8>, _len: usize) -> io::Result<()> {
            unsafe { Memory::VirtualFree(base.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE) }
                .map_err(io::Error::other)
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

impl HeapMemory {
    /// Rounds `len` up to whole pages, like a mapping would.
    fn layout(len: usize) -> io::Result<Layout> {
        Layout::from_size_align(align(len, page_size()), page_size())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    }
}

unsafe impl BackingMemory for HeapMemory {
    fn acquire(&self, len: usize) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-sized arena"));
        }

        let layout = Self::layout(len)?;
        // SAFETY: `layout` has a non-zero size.
        let addr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(addr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    unsafe fn release(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
        let layout = Self::layout(len)?;
        unsafe { alloc::dealloc(base.as_ptr(), layout) };

        Ok(())
    }
}
