//! Software model of the COMBO card and of the kernel services around it.
//!
//! Used by the unit tests and by the `combo-sim` tool. The card model keeps a
//! register file and card-local memory and executes DMA commands against a
//! [`HostMemory`] arena standing in for coherent system memory.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc},
    collections::VecDeque,
    sync::Arc,
    vec,
    vec::Vec,
};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::{
    DEVICE_ID, VENDOR_ID,
    device::AttachStage,
    hal::{
        CoherentMemory, DeferredExecutor, EndpointRegistration, HalError, IrqHandler,
        IrqRegistration, IrqReturn, MmapEndpoint, PciId, Platform,
    },
    mmap::{Fault, MappedPage, VmArea},
    mmio::RegisterIo,
    regs::{
        BUILD_TIME, DMA_CMD, DMA_COMMAND, DMA_COMPLETE_CODE, DMA_COUNT, DMA_DST, DMA_SRC,
        DmaCommand, ID_REVISION, INT_ACK, INT_ENABLE, INT_RAISE, INT_RAISED, WINDOW_LEN,
    },
    units::{Irq, PAGE_SIZE, PhysAddr, VirtAddr},
    worker::DeferredWorker,
};

/// Card address of the first byte of card-local memory.
pub const LOCAL_BASE: u32 = 0x40000;
/// Size of card-local memory.
pub const LOCAL_SIZE: usize = 256 * 1024;

const DEFAULT_PHYS_BASE: usize = 0x1000_0000;

struct Allocation {
    phys: PhysAddr,
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is owned by the arena and only reached under its lock
// or through the `CoherentMemory` handed out for it.
unsafe impl Send for Allocation {}

impl Allocation {
    fn contains(&self, phys: usize, len: usize) -> bool {
        let base = self.phys.value();
        phys >= base && phys.checked_add(len).is_some_and(|end| end <= base + self.layout.size())
    }
}

struct HostInner {
    next_phys: usize,
    live: Vec<Allocation>,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        for a in self.live.drain(..) {
            // SAFETY: allocated with this layout in `HostMemory::alloc`.
            unsafe { dealloc(a.ptr.as_ptr(), a.layout) };
        }
    }
}

/// Page-granular arena of "coherent" memory with fake bus addresses.
///
/// Bus addresses are handed out from a configurable base and never reused.
#[derive(Clone)]
pub struct HostMemory {
    inner: Arc<Mutex<HostInner>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::with_phys_base(DEFAULT_PHYS_BASE)
    }

    pub fn with_phys_base(base: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HostInner {
                next_phys: base & !(PAGE_SIZE - 1),
                live: Vec::new(),
            })),
        }
    }

    /// Allocates zeroed, page-aligned memory.
    pub fn alloc(&self, len: usize) -> Result<CoherentMemory, HalError> {
        let len = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).map_err(|_| HalError::NoMemory)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(HalError::NoMemory)?;

        let mut inner = self.inner.lock();
        let phys = PhysAddr::new(inner.next_phys);
        inner.next_phys += len;
        inner.live.push(Allocation { phys, ptr, layout });

        Ok(CoherentMemory {
            virt: VirtAddr::from_ptr(ptr.as_ptr()),
            phys,
            len,
        })
    }

    pub fn free(&self, mem: CoherentMemory) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.live.iter().position(|a| a.phys == mem.phys) else {
            log::error!("freeing unknown coherent allocation at {}", mem.phys);
            return;
        };
        let a = inner.live.swap_remove(index);
        // SAFETY: allocated with this layout in `alloc`.
        unsafe { dealloc(a.ptr.as_ptr(), a.layout) };
    }

    /// Number of allocations not yet freed.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Device-side read of host memory.
    pub fn dma_read(&self, phys: usize, buf: &mut [u8]) -> Result<(), HalError> {
        let inner = self.inner.lock();
        let a = inner
            .live
            .iter()
            .find(|a| a.contains(phys, buf.len()))
            .ok_or(HalError::AddressRange)?;
        let src = a.ptr.as_ptr().wrapping_add(phys - a.phys.value());
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: bounds checked by `contains`.
            *byte = unsafe { src.add(i).read_volatile() };
        }
        Ok(())
    }

    /// Device-side write of host memory.
    pub fn dma_write(&self, phys: usize, data: &[u8]) -> Result<(), HalError> {
        let inner = self.inner.lock();
        let a = inner
            .live
            .iter()
            .find(|a| a.contains(phys, data.len()))
            .ok_or(HalError::AddressRange)?;
        let dst = a.ptr.as_ptr().wrapping_add(phys - a.phys.value());
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: bounds checked by `contains`.
            unsafe { dst.add(i).write_volatile(*byte) };
        }
        Ok(())
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

struct CardRegs {
    id_revision: u32,
    build_time: u32,
    raised: u32,
    enable: u32,
    src: u32,
    dst: u32,
    count: u32,
    cmd: u32,
    /// Command-register reads left before the in-flight transfer executes.
    countdown: u32,
    last_ack: Option<u32>,
}

struct CardInner {
    regs: Mutex<CardRegs>,
    local: Mutex<Vec<u8>>,
    host: Option<HostMemory>,
    latency: AtomicU32,
    hang: AtomicBool,
    faults: AtomicUsize,
    transfers: AtomicUsize,
}

/// Register-level model of the card.
///
/// Clones share the same card.
#[derive(Clone)]
pub struct EmulatedCard {
    inner: Arc<CardInner>,
}

impl EmulatedCard {
    /// A card without a host memory attachment: host-side DMA faults.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_host(host: HostMemory) -> Self {
        Self::build(Some(host))
    }

    fn build(host: Option<HostMemory>) -> Self {
        Self {
            inner: Arc::new(CardInner {
                regs: Mutex::new(CardRegs {
                    id_revision: 0xc058_0103,
                    build_time: 0x9b0f_0c2a,
                    raised: 0,
                    enable: 0,
                    src: 0,
                    dst: 0,
                    count: 0,
                    cmd: 0,
                    countdown: 0,
                    last_ack: None,
                }),
                local: Mutex::new(vec![0; LOCAL_SIZE]),
                host,
                latency: AtomicU32::new(0),
                hang: AtomicBool::new(false),
                faults: AtomicUsize::new(0),
                transfers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_identity(&self, id_revision: u32, build_time: u32) {
        let mut regs = self.inner.regs.lock();
        regs.id_revision = id_revision;
        regs.build_time = build_time;
    }

    /// Number of command-register reads that report busy before a transfer
    /// executes.
    pub fn set_latency(&self, reads: u32) {
        self.inner.latency.store(reads, Ordering::Relaxed);
    }

    /// A hung card accepts commands but never finishes them.
    pub fn set_hang(&self, hang: bool) {
        self.inner.hang.store(hang, Ordering::Relaxed);
    }

    pub fn host(&self) -> Option<&HostMemory> {
        self.inner.host.as_ref()
    }

    pub fn status(&self) -> u32 {
        self.inner.regs.lock().raised
    }

    pub fn interrupt_enable(&self) -> u32 {
        self.inner.regs.lock().enable
    }

    /// Last value written to the acknowledge register.
    pub fn last_ack(&self) -> Option<u32> {
        self.inner.regs.lock().last_ack
    }

    /// Whether the card is asserting its interrupt line.
    pub fn interrupt_pending(&self) -> bool {
        let regs = self.inner.regs.lock();
        regs.raised & regs.enable != 0
    }

    pub fn dma_running(&self) -> bool {
        self.inner.regs.lock().cmd & 1 != 0
    }

    /// Number of transfers executed.
    pub fn transfers(&self) -> usize {
        self.inner.transfers.load(Ordering::Relaxed)
    }

    /// Number of transfers that hit an unbacked address.
    pub fn dma_faults(&self) -> usize {
        self.inner.faults.load(Ordering::Relaxed)
    }

    pub fn read_local(&self, addr: u32, len: usize) -> Vec<u8> {
        let local = self.inner.local.lock();
        match local_range(addr, len) {
            Some(range) => local[range].to_vec(),
            None => Vec::new(),
        }
    }

    /// Finishes the in-flight transfer regardless of latency. Returns `false`
    /// if nothing was running or the card is hung.
    pub fn complete_dma(&self) -> bool {
        let mut regs = self.inner.regs.lock();
        if regs.cmd & 1 == 0 || self.inner.hang.load(Ordering::Relaxed) {
            return false;
        }
        self.execute(&mut regs);
        true
    }

    fn start(&self, regs: &mut CardRegs, cmd: u32) {
        regs.cmd = cmd;
        if self.inner.hang.load(Ordering::Relaxed) {
            return;
        }
        regs.countdown = self.inner.latency.load(Ordering::Relaxed);
        if regs.countdown == 0 {
            self.execute(regs);
        }
    }

    fn execute(&self, regs: &mut CardRegs) {
        let cmd = DmaCommand::new(regs.cmd);
        let len = regs.count as usize;
        let src = cmd.read_as_enum::<DMA_COMMAND::SRC::Value>(DMA_COMMAND::SRC);
        let dst = cmd.read_as_enum::<DMA_COMMAND::DST::Value>(DMA_COMMAND::DST);

        let ok = match (src, dst) {
            (Some(DMA_COMMAND::SRC::Value::Host), Some(DMA_COMMAND::DST::Value::Local)) => {
                self.host_to_local(regs.src, regs.dst, len)
            }
            (Some(DMA_COMMAND::SRC::Value::Local), Some(DMA_COMMAND::DST::Value::Host)) => {
                self.local_to_host(regs.src, regs.dst, len)
            }
            _ => false,
        };
        if ok {
            self.inner.transfers.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!(
                "emulated card: DMA fault, cmd {:#x} src {:#x} dst {:#x} len {:#x}",
                regs.cmd,
                regs.src,
                regs.dst,
                len
            );
            self.inner.faults.fetch_add(1, Ordering::Relaxed);
        }

        let raise = !cmd.is_set(DMA_COMMAND::NO_INTERRUPT);
        regs.cmd &= !1;
        regs.countdown = 0;
        if raise {
            regs.raised |= DMA_COMPLETE_CODE;
        }
    }

    fn host_to_local(&self, src: u32, dst: u32, len: usize) -> bool {
        let (Some(host), Some(range)) = (self.host(), local_range(dst, len)) else {
            return false;
        };
        let mut local = self.inner.local.lock();
        host.dma_read(src as usize, &mut local[range]).is_ok()
    }

    fn local_to_host(&self, src: u32, dst: u32, len: usize) -> bool {
        let (Some(host), Some(range)) = (self.host(), local_range(src, len)) else {
            return false;
        };
        let local = self.inner.local.lock();
        host.dma_write(dst as usize, &local[range]).is_ok()
    }
}

impl Default for EmulatedCard {
    fn default() -> Self {
        Self::new()
    }
}

fn local_range(addr: u32, len: usize) -> Option<core::ops::Range<usize>> {
    let start = addr.checked_sub(LOCAL_BASE)? as usize;
    let end = start.checked_add(len)?;
    (end <= LOCAL_SIZE).then_some(start..end)
}

impl RegisterIo for EmulatedCard {
    fn len(&self) -> usize {
        WINDOW_LEN
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut regs = self.inner.regs.lock();
        match offset {
            ID_REVISION => regs.id_revision,
            BUILD_TIME => regs.build_time,
            INT_RAISED => regs.raised,
            INT_ENABLE => regs.enable,
            DMA_SRC => regs.src,
            DMA_DST => regs.dst,
            DMA_COUNT => regs.count,
            DMA_CMD => {
                let value = regs.cmd;
                if regs.cmd & 1 != 0 && !self.inner.hang.load(Ordering::Relaxed) {
                    regs.countdown = regs.countdown.saturating_sub(1);
                    if regs.countdown == 0 {
                        self.execute(&mut regs);
                    }
                }
                value
            }
            _ => 0,
        }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        let mut regs = self.inner.regs.lock();
        match offset {
            INT_ENABLE => regs.enable = value,
            INT_RAISE => regs.raised |= value,
            INT_ACK => {
                regs.raised &= !value;
                regs.last_ack = Some(value);
            }
            DMA_SRC => regs.src = value,
            DMA_DST => regs.dst = value,
            DMA_COUNT => regs.count = value,
            DMA_CMD => {
                if DmaCommand::new(value).is_set(DMA_COMMAND::STOP) {
                    regs.cmd = 0;
                    regs.countdown = 0;
                } else if value & 1 != 0 {
                    self.start(&mut regs, value);
                } else {
                    regs.cmd = value;
                }
            }
            _ => log::trace!("emulated card: ignoring write {value:#x} to {offset:#x}"),
        }
    }
}

/// Executor that queues deferred work until the owner drains it.
pub struct QueueExecutor {
    queue: Mutex<VecDeque<Arc<DeferredWorker>>>,
}

impl QueueExecutor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued workers until the queue is empty. Returns the number of
    /// entries processed.
    pub fn run_pending(&self) -> usize {
        let mut processed = 0;
        loop {
            let Some(worker) = self.queue.lock().pop_front() else {
                return processed;
            };
            worker.run();
            processed += 1;
        }
    }
}

impl Default for QueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredExecutor for QueueExecutor {
    fn queue(&self, worker: Arc<DeferredWorker>) {
        self.queue.lock().push_back(worker);
    }
}

/// Snapshot of what the platform currently has handed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub enabled: usize,
    pub regions: usize,
    pub register_maps: usize,
    pub coherent: usize,
    pub irqs: usize,
    pub endpoints: usize,
}

impl ResourceCounts {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

struct IrqEntry {
    cookie: u64,
    handler: Arc<dyn IrqHandler>,
    shared: bool,
    name: &'static str,
}

struct EndpointEntry {
    minor: u32,
    name: &'static str,
    endpoint: Arc<dyn MmapEndpoint>,
}

#[derive(Default)]
struct PlatformState {
    counts: ResourceCounts,
    irqs: Vec<IrqEntry>,
    endpoints: Vec<EndpointEntry>,
    next_cookie: u64,
    next_minor: u32,
    fail_at: Option<AttachStage>,
}

/// One emulated PCI function with an [`EmulatedCard`] behind BAR 0.
pub struct EmulatedPlatform {
    id: PciId,
    irq: Irq,
    bar_start: PhysAddr,
    card: EmulatedCard,
    host: HostMemory,
    executor: Arc<QueueExecutor>,
    state: Mutex<PlatformState>,
    in_handler: AtomicUsize,
}

impl EmulatedPlatform {
    pub fn new() -> Self {
        Self::with_host(HostMemory::new())
    }

    pub fn with_host(host: HostMemory) -> Self {
        Self {
            id: PciId::new(VENDOR_ID, DEVICE_ID),
            irq: Irq(11),
            bar_start: PhysAddr::new(0xfe00_0000),
            card: EmulatedCard::with_host(host.clone()),
            host,
            executor: Arc::new(QueueExecutor::new()),
            state: Mutex::new(PlatformState::default()),
            in_handler: AtomicUsize::new(0),
        }
    }

    pub fn with_id(mut self, id: PciId) -> Self {
        self.id = id;
        self
    }

    pub fn card(&self) -> &EmulatedCard {
        &self.card
    }

    pub fn host(&self) -> &HostMemory {
        &self.host
    }

    pub fn counts(&self) -> ResourceCounts {
        self.state.lock().counts
    }

    /// Makes the platform call behind `stage` fail once.
    pub fn fail_next(&self, stage: AttachStage) {
        self.state.lock().fail_at = Some(stage);
    }

    fn injected(&self, stage: AttachStage) -> bool {
        let mut state = self.state.lock();
        if state.fail_at == Some(stage) {
            state.fail_at = None;
            log::debug!("emulated platform: injecting failure at {stage:?}");
            true
        } else {
            false
        }
    }

    /// Invokes the registered handlers while the card asserts its line.
    /// Returns the number of handled invocations.
    pub fn deliver_interrupts(&self) -> usize {
        let mut handled = 0;
        while self.card.interrupt_pending() {
            // Entered under the lock so `free_irq` either removes the handler
            // first or waits for this pass to finish.
            let handlers: Vec<_> = {
                let state = self.state.lock();
                self.in_handler.fetch_add(1, Ordering::AcqRel);
                state.irqs.iter().map(|e| e.handler.clone()).collect()
            };
            let mut claimed = false;
            for handler in &handlers {
                if handler.handle_irq(self.irq) == IrqReturn::Handled {
                    claimed = true;
                }
            }
            drop(handlers);
            self.in_handler.fetch_sub(1, Ordering::AcqRel);

            if !claimed {
                log::warn!(
                    "irq {}: nobody cared (status {:#x})",
                    self.irq,
                    self.card.status()
                );
                break;
            }
            handled += 1;
        }
        handled
    }

    /// Runs deferred work queued so far.
    pub fn run_deferred(&self) -> usize {
        self.executor.run_pending()
    }

    pub fn pending_deferred(&self) -> usize {
        self.executor.pending()
    }

    /// Resolves a client page fault on the device node called `name`.
    pub fn fault(&self, name: &str, vma: &VmArea, address: VirtAddr) -> Result<MappedPage, Fault> {
        let endpoint = self
            .state
            .lock()
            .endpoints
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.endpoint.clone())
            .ok_or(Fault::Closed)?;
        endpoint.fault(vma, address)
    }
}

impl Default for EmulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for EmulatedPlatform {
    type Registers = EmulatedCard;

    fn id(&self) -> PciId {
        self.id
    }

    fn irq_line(&self) -> Irq {
        self.irq
    }

    fn enable_device(&self) -> Result<(), HalError> {
        if self.injected(AttachStage::EnableDevice) {
            return Err(HalError::Io);
        }
        self.state.lock().counts.enabled += 1;
        Ok(())
    }

    fn disable_device(&self) {
        let mut state = self.state.lock();
        state.counts.enabled = state.counts.enabled.saturating_sub(1);
    }

    fn request_region(&self, bar: u8, owner: &'static str) -> Result<(), HalError> {
        if bar != 0 {
            return Err(HalError::Unsupported);
        }
        if self.injected(AttachStage::RequestRegion) {
            return Err(HalError::Busy);
        }
        let mut state = self.state.lock();
        if state.counts.regions != 0 {
            return Err(HalError::Busy);
        }
        log::trace!("BAR {bar} reserved by {owner}");
        state.counts.regions += 1;
        Ok(())
    }

    fn release_region(&self, _bar: u8) {
        let mut state = self.state.lock();
        state.counts.regions = state.counts.regions.saturating_sub(1);
    }

    fn resource_start(&self, _bar: u8) -> PhysAddr {
        self.bar_start
    }

    fn map_registers(&self, bar: u8) -> Result<EmulatedCard, HalError> {
        if bar != 0 {
            return Err(HalError::Unsupported);
        }
        if self.injected(AttachStage::MapRegisters) {
            return Err(HalError::NoMemory);
        }
        self.state.lock().counts.register_maps += 1;
        Ok(self.card.clone())
    }

    fn unmap_registers(&self, _regs: EmulatedCard) {
        let mut state = self.state.lock();
        state.counts.register_maps = state.counts.register_maps.saturating_sub(1);
    }

    fn alloc_coherent(&self, len: usize, dma_mask_bits: u8) -> Result<CoherentMemory, HalError> {
        if self.injected(AttachStage::AllocBuffer) {
            return Err(HalError::NoMemory);
        }
        let mem = self.host.alloc(len)?;
        let limit = 1u128 << dma_mask_bits.min(64);
        if (mem.phys.value() + mem.len) as u128 > limit {
            self.host.free(mem);
            return Err(HalError::AddressRange);
        }
        self.state.lock().counts.coherent += 1;
        Ok(mem)
    }

    fn free_coherent(&self, mem: CoherentMemory) {
        self.host.free(mem);
        let mut state = self.state.lock();
        state.counts.coherent = state.counts.coherent.saturating_sub(1);
    }

    fn request_irq(
        &self,
        irq: Irq,
        handler: Arc<dyn IrqHandler>,
        shared: bool,
        name: &'static str,
    ) -> Result<IrqRegistration, HalError> {
        if irq != self.irq {
            return Err(HalError::Unsupported);
        }
        if self.injected(AttachStage::RequestIrq) {
            return Err(HalError::Busy);
        }
        let mut state = self.state.lock();
        if state.irqs.iter().any(|e| !e.shared || !shared) {
            return Err(HalError::Busy);
        }
        let cookie = state.next_cookie;
        state.next_cookie += 1;
        state.irqs.push(IrqEntry {
            cookie,
            handler,
            shared,
            name,
        });
        state.counts.irqs += 1;
        Ok(IrqRegistration { irq, cookie })
    }

    fn free_irq(&self, registration: IrqRegistration) {
        let entry = {
            let mut state = self.state.lock();
            let Some(index) = state.irqs.iter().position(|e| e.cookie == registration.cookie)
            else {
                log::error!("freeing unknown irq registration {registration:?}");
                return;
            };
            state.counts.irqs -= 1;
            state.irqs.remove(index)
        };
        while self.in_handler.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
        log::trace!("irq {}: released handler {}", registration.irq, entry.name);
    }

    fn register_endpoint(
        &self,
        name: &'static str,
        endpoint: Arc<dyn MmapEndpoint>,
    ) -> Result<EndpointRegistration, HalError> {
        if self.injected(AttachStage::RegisterEndpoint) {
            return Err(HalError::Busy);
        }
        let mut state = self.state.lock();
        if state.endpoints.iter().any(|e| e.name == name) {
            return Err(HalError::Busy);
        }
        let minor = state.next_minor;
        state.next_minor += 1;
        state.endpoints.push(EndpointEntry {
            minor,
            name,
            endpoint,
        });
        state.counts.endpoints += 1;
        Ok(EndpointRegistration { minor })
    }

    fn deregister_endpoint(&self, registration: EndpointRegistration) {
        let mut state = self.state.lock();
        let before = state.endpoints.len();
        state.endpoints.retain(|e| e.minor != registration.minor);
        if state.endpoints.len() != before {
            state.counts.endpoints -= 1;
        } else {
            log::error!("deregistering unknown endpoint {registration:?}");
        }
    }

    fn executor(&self) -> Arc<dyn DeferredExecutor> {
        self.executor.clone()
    }
}
