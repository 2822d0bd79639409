use alloc::sync::Arc;
use core::fmt::{self, Display};

use thiserror::Error;

use crate::{
    mmap::{Fault, MappedPage, VmArea},
    mmio::RegisterIo,
    units::{Irq, PhysAddr, VirtAddr},
    worker::DeferredWorker,
};

/// PCI vendor/device identifier pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl PciId {
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }
}

impl Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HalError {
    #[error("resource busy")]
    Busy,
    #[error("out of memory")]
    NoMemory,
    #[error("address outside of the device's DMA mask")]
    AddressRange,
    #[error("I/O error")]
    Io,
    #[error("operation not supported")]
    Unsupported,
}

/// Result of an interrupt handler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was raised by this handler's device and has been acknowledged.
    Handled,
    /// Not ours; the line may be shared with another device.
    NotHandled,
}

/// Top-half interrupt handler.
///
/// Called in interrupt context: implementations must not block, allocate, or
/// take locks that non-interrupt code may hold.
pub trait IrqHandler: Send + Sync + 'static {
    fn handle_irq(&self, irq: Irq) -> IrqReturn;
}

/// Bottom-half scheduler.
///
/// `queue` may be called from interrupt context. The executor later calls
/// [`DeferredWorker::run`] from a context that may block.
pub trait DeferredExecutor: Send + Sync + 'static {
    fn queue(&self, worker: Arc<DeferredWorker>);
}

/// Page-fault hook of a user-mappable device node.
pub trait MmapEndpoint: Send + Sync + 'static {
    fn fault(&self, vma: &VmArea, address: VirtAddr) -> Result<MappedPage, Fault>;
}

/// A coherent DMA allocation as handed out by the platform.
///
/// Ownership of this value is ownership of the allocation; it is given back
/// with [`Platform::free_coherent`].
#[derive(Debug, PartialEq, Eq)]
pub struct CoherentMemory {
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub len: usize,
}

/// Token for a registered interrupt handler.
#[derive(Debug, PartialEq, Eq)]
pub struct IrqRegistration {
    pub irq: Irq,
    pub cookie: u64,
}

/// Token for a registered mapping endpoint (device node).
#[derive(Debug, PartialEq, Eq)]
pub struct EndpointRegistration {
    pub minor: u32,
}

/// One PCI function together with the kernel services the driver uses on it.
pub trait Platform: Send + Sync {
    type Registers: RegisterIo + 'static;

    fn id(&self) -> PciId;
    fn irq_line(&self) -> Irq;

    fn enable_device(&self) -> Result<(), HalError>;
    fn disable_device(&self);

    /// Reserves BAR `bar` for `owner`.
    fn request_region(&self, bar: u8, owner: &'static str) -> Result<(), HalError>;
    fn release_region(&self, bar: u8);
    fn resource_start(&self, bar: u8) -> PhysAddr;

    fn map_registers(&self, bar: u8) -> Result<Self::Registers, HalError>;
    fn unmap_registers(&self, regs: Self::Registers);

    /// Allocates `len` bytes addressable by both the CPU and the device, with
    /// the device-visible address below `1 << dma_mask_bits`.
    fn alloc_coherent(&self, len: usize, dma_mask_bits: u8) -> Result<CoherentMemory, HalError>;
    fn free_coherent(&self, mem: CoherentMemory);

    fn request_irq(
        &self,
        irq: Irq,
        handler: Arc<dyn IrqHandler>,
        shared: bool,
        name: &'static str,
    ) -> Result<IrqRegistration, HalError>;
    /// Unregisters the handler. Returns only once no invocation of it is running
    /// and drops the platform's reference to it.
    fn free_irq(&self, registration: IrqRegistration);

    fn register_endpoint(
        &self,
        name: &'static str,
        endpoint: Arc<dyn MmapEndpoint>,
    ) -> Result<EndpointRegistration, HalError>;
    fn deregister_endpoint(&self, registration: EndpointRegistration);

    fn executor(&self) -> Arc<dyn DeferredExecutor>;
}
