use alloc::{string::String, sync::Arc, vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

use crate::{
    DEVICE_ID, VENDOR_ID,
    config::{DriverConfig, SelfTestMode},
    dma::{Completion, DmaBuffer, DmaEngine, DmaError, TransferDescriptor, TransferSlot},
    hal::{EndpointRegistration, HalError, IrqRegistration, PciId, Platform},
    info::DeviceInfo,
    irq::InterruptDispatcher,
    mmap::MemoryMapExposure,
    regs::{ComboRegisters, DMA_COMPLETE_CODE, SOFTWARE_CODE},
    units::PAGE_SIZE,
    worker::{CompletionReporter, DeferredWorker},
};

/// Progress of the attach chain. Each state holds every resource of the states
/// before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachState {
    Unattached,
    DeviceEnabled,
    RegionReserved,
    RegistersMapped,
    BufferAllocated,
    InterruptRegistered,
    Exposed,
}

/// A fallible step of the attach chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachStage {
    EnableDevice,
    RequestRegion,
    MapRegisters,
    AllocBuffer,
    RequestIrq,
    RegisterEndpoint,
}

impl AttachStage {
    pub const ALL: [Self; 6] = [
        Self::EnableDevice,
        Self::RequestRegion,
        Self::MapRegisters,
        Self::AllocBuffer,
        Self::RequestIrq,
        Self::RegisterEndpoint,
    ];

    /// State reached once this step succeeds.
    pub const fn target(self) -> AttachState {
        match self {
            Self::EnableDevice => AttachState::DeviceEnabled,
            Self::RequestRegion => AttachState::RegionReserved,
            Self::MapRegisters => AttachState::RegistersMapped,
            Self::AllocBuffer => AttachState::BufferAllocated,
            Self::RequestIrq => AttachState::InterruptRegistered,
            Self::RegisterEndpoint => AttachState::Exposed,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SelfTestError {
    #[error("self-test transfer failed: {0}")]
    Dma(#[from] DmaError),
    #[error("self-test pattern did not survive the round trip (buffer offset {offset:#x})")]
    Mismatch { offset: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("device {0} is not a COMBO card")]
    UnsupportedDevice(PciId),
    #[error("a COMBO card is already attached")]
    AlreadyAttached,
    #[error("cannot enable device: {0}")]
    EnableDevice(HalError),
    #[error("cannot reserve register region: {0}")]
    RequestRegion(HalError),
    #[error("cannot map registers: {0}")]
    MapRegisters(HalError),
    #[error("cannot allocate DMA buffer: {0}")]
    AllocBuffer(HalError),
    #[error("cannot register interrupt handler: {0}")]
    RequestIrq(HalError),
    #[error("cannot register device node: {0}")]
    RegisterEndpoint(HalError),
    #[error(transparent)]
    SelfTest(#[from] SelfTestError),
}

impl AttachError {
    /// The attach step that failed, if the failure came from one.
    pub fn stage(&self) -> Option<AttachStage> {
        match self {
            Self::EnableDevice(_) => Some(AttachStage::EnableDevice),
            Self::RequestRegion(_) => Some(AttachStage::RequestRegion),
            Self::MapRegisters(_) => Some(AttachStage::MapRegisters),
            Self::AllocBuffer(_) => Some(AttachStage::AllocBuffer),
            Self::RequestIrq(_) => Some(AttachStage::RequestIrq),
            Self::RegisterEndpoint(_) => Some(AttachStage::RegisterEndpoint),
            Self::UnsupportedDevice(_) | Self::AlreadyAttached | Self::SelfTest(_) => None,
        }
    }
}

/// Detach refused: clients still map the DMA buffer. The handle is returned
/// intact.
#[derive(Error)]
#[error("{mappings} client mapping(s) of the DMA buffer are still live")]
pub struct DetachError<'d, P: Platform> {
    pub mappings: usize,
    pub handle: DeviceHandle<'d, P>,
}

impl<P: Platform> fmt::Debug for DetachError<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachError")
            .field("mappings", &self.mappings)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Single-instance driver.
///
/// Only one [`DeviceHandle`] can be live per driver at a time.
pub struct ComboDriver {
    config: DriverConfig,
    attached: AtomicBool,
}

impl ComboDriver {
    pub const fn new(config: DriverConfig) -> Self {
        Self {
            config,
            attached: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    fn claim(&self) -> Option<InstanceGuard<'_>> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InstanceGuard(&self.attached))
    }

    /// Walks the attach chain and runs the configured self-test. On failure
    /// every resource taken so far is given back before returning.
    pub fn attach<P: Platform>(&self, platform: Arc<P>) -> Result<DeviceHandle<'_, P>, AttachError> {
        let id = platform.id();
        if id != PciId::new(VENDOR_ID, DEVICE_ID) {
            log::warn!("refusing to attach to {id}");
            return Err(AttachError::UnsupportedDevice(id));
        }
        let Some(guard) = self.claim() else {
            log::warn!("refusing to attach to {id}: another card is attached");
            return Err(AttachError::AlreadyAttached);
        };
        log::info!("attaching driver to device [{id}]");

        let mut res = Resources::new(self.config.bar);
        let info = match acquire(&self.config, &*platform, &mut res) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("attach failed after reaching {:?}: {e}", res.state);
                res.release(&*platform);
                return Err(e);
            }
        };

        let mut handle = DeviceHandle {
            platform,
            config: self.config,
            info,
            res,
            _guard: guard,
        };
        if let Err(e) = handle.self_test() {
            log::warn!("self-test failed: {e}");
            handle.teardown();
            return Err(e.into());
        }
        log::info!("device [{id}] attached");
        Ok(handle)
    }

    pub fn detach<'d, P: Platform>(
        &'d self,
        handle: DeviceHandle<'d, P>,
    ) -> Result<(), DetachError<'d, P>> {
        handle.detach()
    }
}

struct InstanceGuard<'d>(&'d AtomicBool);

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything the attach chain has taken so far.
struct Resources<P: Platform> {
    state: AttachState,
    bar: u8,
    regs: Option<Arc<ComboRegisters<P::Registers>>>,
    slot: Arc<TransferSlot>,
    buffer: Option<DmaBuffer>,
    engine: Option<DmaEngine<P::Registers>>,
    worker: Option<Arc<DeferredWorker>>,
    reporter: Option<Arc<CompletionReporter>>,
    dispatcher: Option<Arc<InterruptDispatcher<P::Registers>>>,
    irq: Option<IrqRegistration>,
    exposure: Option<Arc<MemoryMapExposure>>,
    endpoint: Option<EndpointRegistration>,
}

impl<P: Platform> Resources<P> {
    fn new(bar: u8) -> Self {
        Self {
            state: AttachState::Unattached,
            bar,
            regs: None,
            slot: Arc::new(TransferSlot::new()),
            buffer: None,
            engine: None,
            worker: None,
            reporter: None,
            dispatcher: None,
            irq: None,
            exposure: None,
            endpoint: None,
        }
    }

    /// Gives back every held resource, newest first. A buffer that clients
    /// still map is leaked instead of freed.
    fn release(&mut self, platform: &P) {
        if self.state == AttachState::Unattached {
            return;
        }
        log::debug!("releasing resources from {:?}", self.state);

        if let Some(regs) = &self.regs {
            regs.disable_interrupts();
        }
        if let Some(engine) = self.engine.take() {
            engine.cancel();
        }

        if let Some(irq) = self.irq.take() {
            platform.free_irq(irq);
        }
        self.dispatcher = None;

        let mut leak = false;
        if let Some(exposure) = self.exposure.take() {
            if let Err(mappings) = exposure.seal() {
                log::error!("{mappings} client mapping(s) outlive the device");
                leak = true;
            }
        }
        if let Some(endpoint) = self.endpoint.take() {
            platform.deregister_endpoint(endpoint);
        }

        if let Some(worker) = self.worker.take() {
            worker.kill();
        }
        self.reporter = None;

        if let Some(buffer) = self.buffer.take() {
            if leak {
                log::error!("leaking DMA buffer at {} to keep client mappings valid", buffer.phys());
            } else {
                platform.free_coherent(buffer.into_memory());
            }
        }

        if let Some(regs) = self.regs.take() {
            match Arc::try_unwrap(regs) {
                Ok(regs) => platform.unmap_registers(regs.into_inner()),
                Err(_) => log::error!("register window still in use, leaving it mapped"),
            }
        }
        if self.state >= AttachState::RegionReserved {
            platform.release_region(self.bar);
        }
        if self.state >= AttachState::DeviceEnabled {
            platform.disable_device();
        }
        self.state = AttachState::Unattached;
    }
}

fn acquire<P: Platform>(
    config: &DriverConfig,
    platform: &P,
    res: &mut Resources<P>,
) -> Result<DeviceInfo, AttachError> {
    platform.enable_device().map_err(AttachError::EnableDevice)?;
    res.state = AttachState::DeviceEnabled;

    platform
        .request_region(config.bar, config.name)
        .map_err(AttachError::RequestRegion)?;
    res.state = AttachState::RegionReserved;
    log::debug!(
        "region {} phys addr: {}",
        config.bar,
        platform.resource_start(config.bar)
    );

    let io = platform
        .map_registers(config.bar)
        .map_err(AttachError::MapRegisters)?;
    let regs = Arc::new(ComboRegisters::new(io));
    res.regs = Some(regs.clone());
    res.state = AttachState::RegistersMapped;
    let info = regs.device_info();
    log::info!("{info}");

    let mem = platform
        .alloc_coherent(PAGE_SIZE, config.dma_mask_bits)
        .map_err(AttachError::AllocBuffer)?;
    let buffer = DmaBuffer::new(mem);
    log::debug!("DMA buffer: virt {} phys {}", buffer.virt(), buffer.phys());
    let reporter = Arc::new(CompletionReporter::new(
        buffer.view(),
        config.report_offset,
        config.report_max_len,
    ));
    let worker = DeferredWorker::new(config.name, platform.executor(), reporter.clone());
    res.engine = Some(DmaEngine::new(
        regs.clone(),
        res.slot.clone(),
        &buffer,
        config.sync_poll_attempts,
    ));
    let exposure = Arc::new(MemoryMapExposure::new(&buffer));
    res.buffer = Some(buffer);
    res.reporter = Some(reporter);
    res.worker = Some(worker.clone());
    res.state = AttachState::BufferAllocated;

    let dispatcher = Arc::new(InterruptDispatcher::new(
        regs.clone(),
        worker,
        res.slot.clone(),
    ));
    let irq = platform
        .request_irq(
            platform.irq_line(),
            dispatcher.clone(),
            config.shared_irq,
            config.name,
        )
        .map_err(AttachError::RequestIrq)?;
    log::debug!("interrupt handler registered on irq {}", irq.irq);
    res.irq = Some(irq);
    res.dispatcher = Some(dispatcher);
    res.state = AttachState::InterruptRegistered;

    let endpoint = platform
        .register_endpoint(config.name, exposure.clone())
        .map_err(AttachError::RegisterEndpoint)?;
    res.endpoint = Some(endpoint);
    res.exposure = Some(exposure);

    regs.enable_interrupts(DMA_COMPLETE_CODE | SOFTWARE_CODE);
    res.state = AttachState::Exposed;
    Ok(info)
}

fn held<T>(part: &Option<T>) -> &T {
    match part {
        Some(part) => part,
        None => unreachable!("attached device is missing a resource"),
    }
}

/// An attached card. Owns every resource taken during attach.
///
/// Give it back with [`DeviceHandle::detach`]. Dropping it tears the device
/// down as well, but cannot report a refusal.
pub struct DeviceHandle<'d, P: Platform> {
    platform: Arc<P>,
    config: DriverConfig,
    info: DeviceInfo,
    res: Resources<P>,
    _guard: InstanceGuard<'d>,
}

impl<'d, P: Platform> DeviceHandle<'d, P> {
    pub fn state(&self) -> AttachState {
        self.res.state
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn registers(&self) -> &ComboRegisters<P::Registers> {
        held(&self.res.regs).as_ref()
    }

    pub fn buffer(&self) -> &DmaBuffer {
        held(&self.res.buffer)
    }

    pub fn start_transfer(&self, desc: &TransferDescriptor) -> Result<(), DmaError> {
        held(&self.res.engine).start_transfer(desc)
    }

    /// Copies `len` bytes at `offset` in the DMA buffer to card address `card_addr`.
    pub fn copy_to_card(
        &self,
        offset: usize,
        card_addr: u32,
        len: u32,
        mode: Completion,
    ) -> Result<(), DmaError> {
        let desc = TransferDescriptor::to_device(self.buffer(), offset, card_addr, len, mode)?;
        self.start_transfer(&desc)
    }

    /// Copies `len` bytes at card address `card_addr` to `offset` in the DMA buffer.
    pub fn copy_from_card(
        &self,
        card_addr: u32,
        offset: usize,
        len: u32,
        mode: Completion,
    ) -> Result<(), DmaError> {
        let desc = TransferDescriptor::from_device(card_addr, self.buffer(), offset, len, mode)?;
        self.start_transfer(&desc)
    }

    pub fn transfer_busy(&self) -> bool {
        self.res.slot.is_busy()
    }

    /// Number of live client mappings of the DMA buffer.
    pub fn mappings(&self) -> usize {
        held(&self.res.exposure).mappings()
    }

    pub fn interrupts_handled(&self) -> usize {
        held(&self.res.dispatcher).handled()
    }

    pub fn worker_runs(&self) -> usize {
        held(&self.res.worker).runs()
    }

    /// Last string reported by the deferred worker on DMA completion.
    pub fn last_report(&self) -> Option<String> {
        held(&self.res.reporter).last_report()
    }

    fn self_test(&self) -> Result<(), SelfTestError> {
        let config = &self.config;
        if config.self_test == SelfTestMode::Skip {
            return Ok(());
        }
        let pattern = config.self_test_pattern;
        let len = u32::try_from(pattern.len()).map_err(|_| DmaError::InvalidLength(u32::MAX))?;
        let buffer = self.buffer();

        buffer.write_at(0, pattern)?;
        self.copy_to_card(0, config.card_scratch, len, Completion::Sync)?;
        self.copy_from_card(config.card_scratch, pattern.len(), len, Completion::Sync)?;

        let mut readback = vec![0u8; pattern.len()];
        buffer.read_at(pattern.len(), &mut readback)?;
        if readback != pattern {
            return Err(SelfTestError::Mismatch {
                offset: pattern.len(),
            });
        }
        log::info!(
            "self-test: buffer+{:#x} reads {:?}",
            pattern.len(),
            String::from_utf8_lossy(&readback)
        );

        if config.self_test == SelfTestMode::SyncAndAsync {
            self.copy_from_card(config.card_scratch, config.report_offset, len, Completion::Async)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.res.release(&*self.platform);
    }

    /// Tears the device down in reverse attach order.
    ///
    /// Refused while clients still map the DMA buffer; the handle is then
    /// returned unchanged inside the error.
    pub fn detach(mut self) -> Result<(), DetachError<'d, P>> {
        if let Err(mappings) = held(&self.res.exposure).seal() {
            log::warn!("refusing to detach: {mappings} client mapping(s) live");
            return Err(DetachError {
                mappings,
                handle: self,
            });
        }
        let id = self.platform.id();
        self.teardown();
        log::info!("device [{id}] detached");
        Ok(())
    }
}

impl<P: Platform> Drop for DeviceHandle<'_, P> {
    fn drop(&mut self) {
        if self.res.state != AttachState::Unattached {
            log::warn!("device handle dropped without detach");
            self.teardown();
        }
    }
}

impl<P: Platform> fmt::Debug for DeviceHandle<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.platform.id())
            .field("state", &self.res.state)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
