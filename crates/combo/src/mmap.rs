use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::{
    dma::DmaBuffer,
    hal::MmapEndpoint,
    units::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr},
};

/// A client's mapping of the device node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmArea {
    pub start: VirtAddr,
    /// Exclusive end.
    pub end: VirtAddr,
    /// Offset into the device node, in pages.
    pub pgoff: usize,
}

impl VmArea {
    pub const fn new(start: VirtAddr, len: usize, pgoff: usize) -> Self {
        Self {
            start,
            end: start.add_bytes(len),
            pgoff,
        }
    }

    pub fn contains(&self, address: VirtAddr) -> bool {
        self.start <= address && address < self.end
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("address {0} is outside of the faulting mapping")]
    OutsideMapping(VirtAddr),
    /// No page backs this offset (SIGBUS).
    #[error("no page at offset {page_offset} of the device node")]
    Bus { page_offset: usize },
    #[error("the device node is being torn down")]
    Closed,
}

const SEALED: usize = 1 << (usize::BITS - 1);

/// Number of page references handed out to client mappings.
///
/// Once sealed (only possible at zero), no further references can be taken.
#[derive(Debug, Default)]
pub struct MapCount(AtomicUsize);

impl MapCount {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire) & !SEALED
    }

    pub fn is_sealed(&self) -> bool {
        self.0.load(Ordering::Acquire) & SEALED != 0
    }

    fn acquire(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n & SEALED == 0).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & !SEALED != 0, "page reference released twice");
    }

    /// Seals the count if no reference is outstanding, otherwise returns the
    /// number of live references.
    pub fn seal(&self) -> Result<(), usize> {
        match self
            .0
            .compare_exchange(0, SEALED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(n) if n & SEALED != 0 => Ok(()),
            Err(n) => Err(n),
        }
    }
}

/// A page reference held by a client mapping. Dropping it is the unmap.
///
/// The reference only pins the liveness count; it never keeps the buffer
/// itself alive.
#[derive(Debug)]
pub struct MappedPage {
    phys: PhysAddr,
    count: Arc<MapCount>,
}

impl MappedPage {
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        self.count.release();
    }
}

/// Resolves faults on the device node onto the single page of the DMA buffer.
#[derive(Debug)]
pub struct MemoryMapExposure {
    page: PhysAddr,
    count: Arc<MapCount>,
}

impl MemoryMapExposure {
    pub fn new(buffer: &DmaBuffer) -> Self {
        Self {
            page: buffer.phys().page_base(),
            count: buffer.map_count(),
        }
    }

    /// Backing page of offset 0.
    pub fn page(&self) -> PhysAddr {
        self.page
    }

    /// Number of live client page references.
    pub fn mappings(&self) -> usize {
        self.count.get()
    }

    /// Refuses further faults if nothing is mapped, otherwise returns the
    /// number of live references.
    pub fn seal(&self) -> Result<(), usize> {
        self.count.seal()
    }

    pub fn resolve(&self, vma: &VmArea, address: VirtAddr) -> Result<MappedPage, Fault> {
        if !vma.contains(address) {
            return Err(Fault::OutsideMapping(address));
        }
        let within = address.offset_from(vma.start).unwrap_or_default();
        let page_offset = vma
            .pgoff
            .checked_mul(PAGE_SIZE)
            .and_then(|base| base.checked_add(within))
            .map_or(usize::MAX, |offset| offset >> PAGE_SHIFT);

        if page_offset != 0 {
            log::debug!("fault at {address} maps page offset {page_offset}, refusing");
            return Err(Fault::Bus { page_offset });
        }
        if !self.count.acquire() {
            return Err(Fault::Closed);
        }
        Ok(MappedPage {
            phys: self.page,
            count: self.count.clone(),
        })
    }
}

impl MmapEndpoint for MemoryMapExposure {
    fn fault(&self, vma: &VmArea, address: VirtAddr) -> Result<MappedPage, Fault> {
        self.resolve(vma, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emulated::HostMemory, units::PAGE_SIZE};

    fn exposure() -> (HostMemory, DmaBuffer, MemoryMapExposure) {
        let host = HostMemory::new();
        let buffer = DmaBuffer::new(host.alloc(PAGE_SIZE).unwrap());
        let exposure = MemoryMapExposure::new(&buffer);
        (host, buffer, exposure)
    }

    #[test]
    fn offset_zero_resolves_to_the_buffer_page() {
        let (host, buffer, exposure) = exposure();
        let vma = VmArea::new(VirtAddr::new(0x7f00_0000), PAGE_SIZE, 0);

        let first = exposure.resolve(&vma, VirtAddr::new(0x7f00_0000)).unwrap();
        let second = exposure.resolve(&vma, VirtAddr::new(0x7f00_0fff)).unwrap();
        assert_eq!(first.phys(), buffer.phys());
        assert_eq!(second.phys(), buffer.phys());
        assert_eq!(exposure.mappings(), 2);

        drop(first);
        drop(second);
        assert_eq!(exposure.mappings(), 0);
        host.free(buffer.into_memory());
    }

    #[test]
    fn other_page_offsets_fault() {
        let (host, buffer, exposure) = exposure();
        let vma = VmArea::new(VirtAddr::new(0x7f00_0000), 2 * PAGE_SIZE, 0);
        assert_eq!(
            exposure.resolve(&vma, VirtAddr::new(0x7f00_1000)).unwrap_err(),
            Fault::Bus { page_offset: 1 }
        );

        let shifted = VmArea::new(VirtAddr::new(0x7f00_0000), PAGE_SIZE, 3);
        assert_eq!(
            exposure.resolve(&shifted, VirtAddr::new(0x7f00_0000)).unwrap_err(),
            Fault::Bus { page_offset: 3 }
        );

        let huge = VmArea::new(VirtAddr::new(0x7f00_0000), PAGE_SIZE, usize::MAX);
        assert!(matches!(
            exposure.resolve(&huge, VirtAddr::new(0x7f00_0000)),
            Err(Fault::Bus { .. })
        ));

        assert_eq!(
            exposure.resolve(&vma, VirtAddr::new(0x7f00_2000)).unwrap_err(),
            Fault::OutsideMapping(VirtAddr::new(0x7f00_2000))
        );
        assert_eq!(exposure.mappings(), 0);
        host.free(buffer.into_memory());
    }

    #[test]
    fn sealing_waits_for_unmap() {
        let (host, buffer, exposure) = exposure();
        let vma = VmArea::new(VirtAddr::new(0x1000), PAGE_SIZE, 0);

        let page = exposure.resolve(&vma, VirtAddr::new(0x1000)).unwrap();
        assert_eq!(exposure.seal(), Err(1));
        drop(page);
        assert_eq!(exposure.seal(), Ok(()));
        assert_eq!(
            exposure.resolve(&vma, VirtAddr::new(0x1000)).unwrap_err(),
            Fault::Closed
        );
        assert_eq!(buffer.mappings(), 0);
        host.free(buffer.into_memory());
    }
}
