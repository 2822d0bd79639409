use core::fmt::{self, Debug, Display};

use derive_more::{Add, Deref, LowerHex, Sub, UpperHex};

/// log2 of the page size used for the coherent buffer and user mappings.
pub const PAGE_SHIFT: usize = 12;
/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask used to extract the offset within a page.
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

int_wrapper!(pub Irq: u32);

/// Represents an address as seen by the device (bus / DMA address).
#[derive(Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#016x})", self.0)
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#016x}", self.0)
    }
}

impl PhysAddr {
    /// A physical address that is guaranteed to be null (0).
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address value as an unsigned integer.
    pub const fn value(self) -> usize {
        self.0
    }

    /// Returns `true` if the address is aligned to the specified alignment.
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns the sum of the address and an offset.
    pub const fn add_bytes(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Returns the address aligned down to the nearest page boundary.
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Returns the address as a 32-bit bus address, or `None` if it does not
    /// fit below the card's 32-bit DMA mask.
    pub fn to_bus32(self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }
}

/// Represents an address in a virtual address space (kernel or client).
#[derive(
    Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, Add, Sub, Deref, Default, UpperHex, LowerHex,
)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#016x})", self.0)
    }
}

impl Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#016x}", self.0)
    }
}

impl VirtAddr {
    /// A virtual address that is guaranteed to be null (0).
    pub const NULL: Self = Self(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Creates a virtual address from a raw pointer.
    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw address value as an unsigned integer.
    #[inline(always)]
    pub const fn value(self) -> usize {
        self.0
    }

    /// Returns `true` if the address is null (0).
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the address is aligned to the specified alignment.
    #[inline(always)]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns the sum of the address and an offset.
    #[inline(always)]
    pub const fn add_bytes(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Returns the number of bytes from `base` up to this address, or `None`
    /// if this address lies below `base`.
    #[inline(always)]
    pub const fn offset_from(self, base: VirtAddr) -> Option<usize> {
        self.0.checked_sub(base.0)
    }

    /// Casts the address to a raw pointer of type `*const T`.
    #[inline(always)]
    pub const fn as_raw_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Casts the address to a raw mutable pointer of type `*mut T`.
    #[inline(always)]
    pub const fn as_raw_ptr_mut<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the address aligned down to the nearest page boundary.
    #[inline(always)]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_addresses_respect_the_32bit_mask() {
        assert_eq!(PhysAddr::new(0x1000_0000).to_bus32(), Some(0x1000_0000));
        assert_eq!(PhysAddr::new(0xffff_f000).to_bus32(), Some(0xffff_f000));
        assert_eq!(PhysAddr::new(0x1_0000_0000).to_bus32(), None);
    }

    #[test]
    fn page_helpers() {
        let addr = VirtAddr::new(0x7000_1234);
        assert_eq!(addr.page_base(), VirtAddr::new(0x7000_1000));
        assert_eq!(addr.offset_from(VirtAddr::new(0x7000_0000)), Some(0x1234));
        assert_eq!(VirtAddr::new(0x10).offset_from(addr), None);
        assert!(PhysAddr::new(0x3000).is_aligned(PAGE_SIZE));
    }

    #[test]
    fn irq_wrapper_formats_as_number() {
        let irq = Irq::from(17u32);
        assert_eq!(std::format!("{irq}"), "17");
        assert_eq!(irq.as_usize(), 17);
    }
}
