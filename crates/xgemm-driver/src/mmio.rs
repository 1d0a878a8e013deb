// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped windows over accelerator address space
//!
//! Each [`MappedRegion`] is one `mmap` of the memory file (normally
//! `/dev/mem` opened `O_SYNC`) at a physical base. Every element and register
//! access is a single volatile load or store, so nothing sits between a write
//! call and the device observing it, and the compiler keeps accesses to the
//! same region in program order.
//!
//! Offsets past the end of a window are a contract violation and panic.

// MMIO windows are page aligned and element offsets are multiples of the
// element size, so pointer casts are aligned.
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{Result, XgemmError};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::File;
use std::mem::size_of;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;
use xgemm_chip::layout::{Window, WindowId};

/// Element types that can be stored in an operand or result window.
///
/// `Pod` guarantees that any bit pattern the device leaves behind is a valid
/// value.
pub trait Element: bytemuck::Pod + PartialEq + Debug + Send + Sync {
    /// Raw bits, zero-extended, for diagnostics.
    fn to_bits(self) -> u64;
}

macro_rules! impl_element {
    ($($t:ty => $u:ty),* $(,)?) => {
        $(
            impl Element for $t {
                #[allow(clippy::cast_sign_loss)]
                fn to_bits(self) -> u64 {
                    u64::from(self as $u)
                }
            }
        )*
    };
}

impl_element!(i16 => u16, u16 => u16, i32 => u32, u32 => u32);

/// One mapped window of accelerator memory
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    window: WindowId,
    phys_base: u64,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("window", &self.window)
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("phys_base", &format_args!("{:#x}", self.phys_base))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns its mapping exclusively. Moving it between
// threads does not invalidate the mapping (mmap'd memory is process-wide).
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - writes require &mut self; reads through &self are
// bounds-checked volatile loads. Callers sharing a device across threads
// serialise access themselves.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `phys` from the memory file
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::MapFailed`] if the window is empty or `mmap` fails.
    pub fn map(file: &File, window: WindowId, phys: Window) -> Result<Self> {
        if phys.size == 0 {
            return Err(XgemmError::map_failed(window, phys.base, 0, "window size is 0"));
        }

        // SAFETY: mmap necessary for MMIO - maps the physical window into the
        // process. Invariants: (1) file is open read/write; (2) size non-zero;
        // (3) base is page aligned (checked by DeviceConfig::validate);
        // (4) the mapping is released exactly once, in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                phys.size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                phys.base,
            )
        }
        .map_err(|e| XgemmError::map_failed(window, phys.base, phys.size, e.to_string()))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| XgemmError::map_failed(window, phys.base, phys.size, "mmap returned null"))?;

        tracing::info!(
            "Mapped {window} window {:#x}..{:#x} at {ptr:p}",
            phys.base,
            phys.end()
        );

        Ok(Self {
            ptr,
            size: phys.size,
            window,
            phys_base: phys.base,
        })
    }

    /// Window this region maps
    pub const fn window(&self) -> WindowId {
        self.window
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Physical base address
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Number of `T` elements the window holds
    pub const fn capacity<T: Element>(&self) -> usize {
        self.size / size_of::<T>()
    }

    /// Read a 32-bit register
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or `offset + 4` exceeds the window.
    pub fn read32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
        assert!(offset + 4 <= self.size, "register offset {offset:#x} out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap, valid for self.size; (2) offset+4 <= size;
        // (3) u32 aligned.
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("{} read32 @ {offset:#x} = {value:#x}", self.window);
        value
    }

    /// Write a 32-bit register
    ///
    /// # Panics
    ///
    /// Panics if `offset` is unaligned or `offset + 4` exceeds the window.
    pub fn write32(&mut self, offset: usize, value: u32) {
        assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
        assert!(offset + 4 <= self.size, "register offset {offset:#x} out of bounds");
        tracing::trace!("{} write32 @ {offset:#x} = {value:#x}", self.window);
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
    }

    /// Read one element
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the window.
    pub fn read<T: Element>(&self, index: usize) -> T {
        assert!(index < self.capacity::<T>(), "element {index} out of bounds in {}", self.window);
        // SAFETY: volatile element load. Invariants: (1) index < capacity so the
        // element lies inside the mapping; (2) base page aligned, offset a multiple
        // of size_of::<T>(); (3) T: Pod accepts any bit pattern.
        unsafe {
            self.ptr
                .as_ptr()
                .add(index * size_of::<T>())
                .cast::<T>()
                .read_volatile()
        }
    }

    /// Write one element
    ///
    /// # Panics
    ///
    /// Panics if `index` is outside the window.
    pub fn write<T: Element>(&mut self, index: usize, value: T) {
        assert!(index < self.capacity::<T>(), "element {index} out of bounds in {}", self.window);
        // SAFETY: volatile element store. Invariants as in read().
        unsafe {
            self.ptr
                .as_ptr()
                .add(index * size_of::<T>())
                .cast::<T>()
                .write_volatile(value);
        }
    }

    /// Copy `src` into the window starting at element `index`
    ///
    /// With `verify`, each element is read back right after it is written.
    ///
    /// # Errors
    ///
    /// Returns [`XgemmError::VerifyMismatch`] on the first element that reads
    /// back differently.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the window.
    pub fn write_slice<T: Element>(&mut self, index: usize, src: &[T], verify: bool) -> Result<()> {
        self.check_range::<T>(index, src.len());
        for (i, &value) in src.iter().enumerate() {
            self.write(index + i, value);
            if verify {
                verify_element(self.window, index + i, value, self.read(index + i))?;
            }
        }
        Ok(())
    }

    /// Copy `dst.len()` elements starting at `index` out of the window
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the window.
    pub fn read_slice<T: Element>(&self, index: usize, dst: &mut [T]) {
        self.check_range::<T>(index, dst.len());
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read(index + i);
        }
    }

    fn check_range<T: Element>(&self, index: usize, len: usize) {
        let capacity = self.capacity::<T>();
        assert!(
            index <= capacity && len <= capacity - index,
            "range {index}+{len} exceeds {} capacity {capacity}",
            self.window
        );
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - releases the mapping created in map().
        // Invariants: (1) ptr/size are exactly what mmap returned/was given;
        // (2) Drop runs once; (3) no references outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::error!("munmap of {} window failed: {e}", self.window);
        } else {
            tracing::debug!("Unmapped {} window {:#x}", self.window, self.phys_base);
        }
    }
}

/// The regions owned by one device, released in reverse acquisition order
#[derive(Debug, Default)]
pub struct RegionSet {
    regions: Vec<MappedRegion>,
}

impl RegionSet {
    /// Empty set
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Take ownership of a freshly mapped region
    pub fn push(&mut self, region: MappedRegion) {
        self.regions.push(region);
    }

    /// Region for a window
    pub fn get(&self, window: WindowId) -> Option<&MappedRegion> {
        self.regions.iter().find(|r| r.window == window)
    }

    /// Mutable region for a window
    pub fn get_mut(&mut self, window: WindowId) -> Option<&mut MappedRegion> {
        self.regions.iter_mut().find(|r| r.window == window)
    }

    /// Region for a window, or `ProtocolMisuse` if it is not mapped
    ///
    /// # Errors
    ///
    /// Returns error if the window was never mapped or has been released.
    pub fn require(&self, window: WindowId) -> Result<&MappedRegion> {
        self.get(window)
            .ok_or_else(|| XgemmError::protocol_misuse(format!("{window} window is not mapped")))
    }

    /// Mutable variant of [`RegionSet::require`]
    ///
    /// # Errors
    ///
    /// Returns error if the window was never mapped or has been released.
    pub fn require_mut(&mut self, window: WindowId) -> Result<&mut MappedRegion> {
        self.get_mut(window)
            .ok_or_else(|| XgemmError::protocol_misuse(format!("{window} window is not mapped")))
    }

    /// Mapped windows in acquisition order
    pub fn windows(&self) -> Vec<WindowId> {
        self.regions.iter().map(MappedRegion::window).collect()
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Unmap everything, last acquired first
    pub fn release(&mut self) {
        while let Some(region) = self.regions.pop() {
            drop(region);
        }
    }
}

impl Drop for RegionSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Compare a written element with its read-back
fn verify_element<T: Element>(window: WindowId, offset: usize, expected: T, found: T) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(XgemmError::VerifyMismatch {
            window,
            offset,
            expected: expected.to_bits(),
            found: found.to_bits(),
        })
    }
}
