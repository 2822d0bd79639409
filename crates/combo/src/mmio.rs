use core::{
    fmt::{Binary, Debug, LowerHex, UpperHex},
    marker::PhantomData,
    ops::{BitAndAssign, BitOrAssign, Not},
};

use crate::units::VirtAddr;

/// 32-bit register access to a device's mapped register window.
///
/// Every access has a hardware side effect, so implementations must neither
/// elide nor reorder them relative to each other.
pub trait RegisterIo: Send + Sync {
    /// Length of the window in bytes.
    fn len(&self) -> usize;
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u32(&self, offset: usize, value: u32);
}

pub trait MmioValue:
    'static
    + Copy
    + Debug
    + Binary
    + LowerHex
    + UpperHex
    + PartialEq
    + Eq
    + BitAndAssign
    + BitOrAssign
    + Not<Output = Self>
{
}

impl<T> MmioValue for T where
    T: 'static
        + Copy
        + Debug
        + Binary
        + LowerHex
        + UpperHex
        + PartialEq
        + Eq
        + BitAndAssign
        + BitOrAssign
        + Not<Output = T>
{
}

#[inline(always)]
fn barrier() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("dsb sy; isb");
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Volatile accessor over an ioremapped register window.
#[derive(Debug)]
pub struct Mmio<T: MmioValue> {
    addr: VirtAddr,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: MmioValue> Mmio<T> {
    /// # Safety
    ///
    /// `addr..addr + len` must be a live device mapping for as long as the
    /// returned value exists, and `addr` must be aligned for `T`.
    pub const unsafe fn new(addr: VirtAddr, len: usize) -> Self {
        Self {
            addr,
            len,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    #[inline(always)]
    #[track_caller]
    fn check(&self, offset: usize) {
        debug_assert!(
            offset + size_of::<T>() <= self.len && offset % align_of::<T>() == 0,
            "MMIO access at {offset:#x} outside of a {:#x} byte window",
            self.len
        );
    }

    #[inline(always)]
    pub fn read(&self, offset: usize) -> T {
        self.check(offset);
        barrier();
        // SAFETY: the window is mapped for the lifetime of `self` (see `new`).
        unsafe { self.addr.add_bytes(offset).as_raw_ptr::<T>().read_volatile() }
    }

    #[inline(always)]
    pub fn write(&self, offset: usize, value: T) {
        self.check(offset);
        // SAFETY: as in `read`.
        unsafe {
            self.addr
                .add_bytes(offset)
                .as_raw_ptr_mut::<T>()
                .write_volatile(value)
        };
        barrier();
        log::trace!("wrote {:#x} with {:#x}", self.addr.value() + offset, value);
    }

    #[inline(always)]
    pub fn set(&self, offset: usize, bits: T) {
        let mut value = self.read(offset);
        value |= bits;
        self.write(offset, value);
    }

    #[inline(always)]
    pub fn clear(&self, offset: usize, bits: T) {
        let mut value = self.read(offset);
        value &= !bits;
        self.write(offset, value);
    }
}

// SAFETY: the accessor only holds the address of a device mapping; volatile
// accesses from several contexts are what the hardware expects.
unsafe impl<T: MmioValue> Send for Mmio<T> {}
unsafe impl<T: MmioValue> Sync for Mmio<T> {}

impl RegisterIo for Mmio<u32> {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
}
