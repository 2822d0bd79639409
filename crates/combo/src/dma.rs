use alloc::{string::String, sync::Arc, vec};
use core::{
    ops::Range,
    sync::atomic::{AtomicU8, Ordering},
};

use thiserror::Error;

use crate::{
    hal::CoherentMemory,
    mmap::MapCount,
    mmio::RegisterIo,
    regs::{ComboRegisters, DMA_COMMAND, compose},
    units::{PAGE_SIZE, PhysAddr, VirtAddr},
    util::spin_while_bounded,
};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DmaError {
    #[error("transfer length {0} is not within 1..={max}", max = PAGE_SIZE)]
    InvalidLength(u32),
    #[error("host range {addr:#x}+{len:#x} is outside of the DMA buffer")]
    OutOfBounds { addr: u32, len: u32 },
    #[error("buffer access {offset:#x}+{len:#x} is outside of the DMA buffer")]
    BufferAccess { offset: usize, len: usize },
    #[error("another transfer owns the DMA command register")]
    TransferBusy,
    #[error("transfer did not complete within {attempts} polls")]
    TransferTimedOut { attempts: u32 },
}

/// Direction of a transfer, seen from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host memory to card-local memory.
    ToDevice,
    /// Card-local memory to host memory.
    FromDevice,
}

/// How completion of a transfer is observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Poll the busy bit; the card raises no interrupt.
    Sync,
    /// Return once the transfer is started; the card raises `DmaComplete`.
    Async,
}

/// One DMA operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub src: u32,
    pub dst: u32,
    pub len: u32,
    pub direction: Direction,
    pub mode: Completion,
}

impl TransferDescriptor {
    /// Copies `len` bytes at `offset` in `buffer` to card address `card_addr`.
    pub fn to_device(
        buffer: &DmaBuffer,
        offset: usize,
        card_addr: u32,
        len: u32,
        mode: Completion,
    ) -> Result<Self, DmaError> {
        Ok(Self {
            src: buffer.bus_addr(offset, len)?,
            dst: card_addr,
            len,
            direction: Direction::ToDevice,
            mode,
        })
    }

    /// Copies `len` bytes at card address `card_addr` to `offset` in `buffer`.
    pub fn from_device(
        card_addr: u32,
        buffer: &DmaBuffer,
        offset: usize,
        len: u32,
        mode: Completion,
    ) -> Result<Self, DmaError> {
        Ok(Self {
            src: card_addr,
            dst: buffer.bus_addr(offset, len)?,
            len,
            direction: Direction::FromDevice,
            mode,
        })
    }

    /// Host-side bus address of the transfer.
    pub fn host_addr(&self) -> u32 {
        match self.direction {
            Direction::ToDevice => self.src,
            Direction::FromDevice => self.dst,
        }
    }

    /// Raw command word starting this transfer.
    pub fn command(&self) -> u32 {
        let endpoints = match self.direction {
            Direction::ToDevice => DMA_COMMAND::SRC::Host + DMA_COMMAND::DST::Local,
            Direction::FromDevice => DMA_COMMAND::SRC::Local + DMA_COMMAND::DST::Host,
        };
        let fields = DMA_COMMAND::RUN::SET + endpoints;
        match self.mode {
            Completion::Sync => compose(fields + DMA_COMMAND::NO_INTERRUPT::SET),
            Completion::Async => compose(fields),
        }
    }
}

/// One page of coherent memory shared between the CPU and the card.
///
/// Freeing goes through the platform, never through `Drop`.
#[derive(Debug)]
pub struct DmaBuffer {
    mem: CoherentMemory,
    maps: Arc<MapCount>,
}

// SAFETY: the buffer is plain memory; CPU accesses go through volatile copies
// and the device side is serialized by the transfer protocol.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn new(mem: CoherentMemory) -> Self {
        debug_assert!(mem.len >= PAGE_SIZE);
        Self {
            mem,
            maps: Arc::new(MapCount::new()),
        }
    }

    pub fn virt(&self) -> VirtAddr {
        self.mem.virt
    }

    pub fn phys(&self) -> PhysAddr {
        self.mem.phys
    }

    pub fn len(&self) -> usize {
        self.mem.len
    }

    pub fn is_empty(&self) -> bool {
        self.mem.len == 0
    }

    /// Bus addresses covered by the buffer.
    pub fn bus_range(&self) -> Range<u64> {
        let base = self.mem.phys.value() as u64;
        base..base + self.mem.len as u64
    }

    /// Bus address of `offset`, checking that `len` bytes from there fit.
    pub fn bus_addr(&self, offset: usize, len: u32) -> Result<u32, DmaError> {
        self.check(offset, len as usize)?;
        self.mem
            .phys
            .add_bytes(offset)
            .to_bus32()
            .ok_or(DmaError::BufferAccess {
                offset,
                len: len as usize,
            })
    }

    /// Number of live client mappings of this buffer.
    pub fn mappings(&self) -> usize {
        self.maps.get()
    }

    pub(crate) fn map_count(&self) -> Arc<MapCount> {
        self.maps.clone()
    }

    pub(crate) fn view(&self) -> BufferView {
        BufferView {
            virt: self.mem.virt,
            len: self.mem.len,
        }
    }

    pub fn into_memory(self) -> CoherentMemory {
        self.mem
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), DmaError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mem.len => Ok(()),
            _ => Err(DmaError::BufferAccess { offset, len }),
        }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), DmaError> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked; the allocation lives as long as `self`.
        unsafe { self.view().write(offset, data) };
        Ok(())
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), DmaError> {
        self.check(offset, buf.len())?;
        // SAFETY: as in `write_at`.
        unsafe { self.view().read(offset, buf) };
        Ok(())
    }

    /// Reads the NUL-terminated string at `offset`, stopping after `max_len` bytes.
    pub fn read_cstr(&self, offset: usize, max_len: usize) -> Result<String, DmaError> {
        // SAFETY: as in `write_at`.
        unsafe { self.view().read_cstr(offset, max_len) }
    }
}

/// Unowned view of a [`DmaBuffer`] for contexts that must not hold the buffer
/// itself (the deferred worker). The owner guarantees the view is not used
/// after the buffer is freed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BufferView {
    virt: VirtAddr,
    len: usize,
}

// SAFETY: see `DmaBuffer`.
unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    unsafe fn write(&self, offset: usize, data: &[u8]) {
        let base = self.virt.add_bytes(offset).as_raw_ptr_mut::<u8>();
        for (i, byte) in data.iter().enumerate() {
            unsafe { base.add(i).write_volatile(*byte) };
        }
    }

    unsafe fn read(&self, offset: usize, buf: &mut [u8]) {
        let base = self.virt.add_bytes(offset).as_raw_ptr::<u8>();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { base.add(i).read_volatile() };
        }
    }

    /// # Safety
    ///
    /// The buffer this view was taken from must still be allocated.
    pub(crate) unsafe fn read_cstr(&self, offset: usize, max_len: usize) -> Result<String, DmaError> {
        if offset >= self.len {
            return Err(DmaError::BufferAccess {
                offset,
                len: max_len,
            });
        }
        let mut bytes = vec![0u8; max_len.min(self.len - offset)];
        unsafe { self.read(offset, &mut bytes) };
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

const SLOT_IDLE: u8 = 0;
const SLOT_SYNC: u8 = 1;
const SLOT_ASYNC: u8 = 2;

/// Ownership of the DMA command register: at most one transfer in flight.
#[derive(Debug, Default)]
pub struct TransferSlot(AtomicU8);

impl TransferSlot {
    pub const fn new() -> Self {
        Self(AtomicU8::new(SLOT_IDLE))
    }

    fn claim(&self, mode: Completion) -> Result<(), DmaError> {
        let tag = match mode {
            Completion::Sync => SLOT_SYNC,
            Completion::Async => SLOT_ASYNC,
        };
        self.0
            .compare_exchange(SLOT_IDLE, tag, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| DmaError::TransferBusy)
    }

    fn release(&self) {
        self.0.store(SLOT_IDLE, Ordering::Release);
    }

    /// Releases an asynchronous transfer on completion. Returns `false` if no
    /// asynchronous transfer was in flight.
    pub fn complete_async(&self) -> bool {
        self.0
            .compare_exchange(SLOT_ASYNC, SLOT_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire) != SLOT_IDLE
    }
}

/// Programs the card's DMA registers.
pub struct DmaEngine<R: RegisterIo> {
    regs: Arc<ComboRegisters<R>>,
    slot: Arc<TransferSlot>,
    window: Range<u64>,
    poll_attempts: u32,
}

impl<R: RegisterIo> DmaEngine<R> {
    pub fn new(
        regs: Arc<ComboRegisters<R>>,
        slot: Arc<TransferSlot>,
        buffer: &DmaBuffer,
        poll_attempts: u32,
    ) -> Self {
        Self {
            regs,
            slot,
            window: buffer.bus_range(),
            poll_attempts,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    fn validate(&self, desc: &TransferDescriptor) -> Result<(), DmaError> {
        if desc.len == 0 || desc.len as usize > PAGE_SIZE {
            return Err(DmaError::InvalidLength(desc.len));
        }
        let start = desc.host_addr() as u64;
        let end = start + desc.len as u64;
        if start < self.window.start || end > self.window.end {
            return Err(DmaError::OutOfBounds {
                addr: desc.host_addr(),
                len: desc.len,
            });
        }
        Ok(())
    }

    /// Starts one transfer.
    ///
    /// `Sync` transfers return once the card has cleared the busy bit. `Async`
    /// transfers return immediately and keep the command register claimed until
    /// the interrupt handler sees `DmaComplete`.
    pub fn start_transfer(&self, desc: &TransferDescriptor) -> Result<(), DmaError> {
        self.validate(desc)?;
        self.slot.claim(desc.mode)?;

        log::debug!(
            "DMA {:?} {:#x} -> {:#x}, {} bytes ({:?})",
            desc.direction,
            desc.src,
            desc.dst,
            desc.len,
            desc.mode
        );
        self.regs
            .program_dma(desc.src, desc.dst, desc.len, desc.command());

        if desc.mode == Completion::Async {
            return Ok(());
        }

        let done = spin_while_bounded(self.poll_attempts, || self.regs.dma_busy());
        if !done {
            log::warn!(
                "DMA transfer still busy after {} polls, stopping it",
                self.poll_attempts
            );
            self.regs.stop_dma();
        }
        self.slot.release();

        if done {
            Ok(())
        } else {
            Err(DmaError::TransferTimedOut {
                attempts: self.poll_attempts,
            })
        }
    }

    /// Stops whatever the engine is doing and drops the command register claim.
    pub fn cancel(&self) {
        if self.slot.is_busy() {
            log::debug!("cancelling in-flight DMA transfer");
        }
        self.regs.stop_dma();
        self.slot.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::{EmulatedCard, HostMemory};

    const SCRATCH: u32 = 0x40000;

    struct Fixture {
        host: HostMemory,
        card: EmulatedCard,
        buffer: Option<DmaBuffer>,
        engine: DmaEngine<EmulatedCard>,
    }

    impl Fixture {
        fn new(poll_attempts: u32) -> Self {
            let host = HostMemory::new();
            let card = EmulatedCard::with_host(host.clone());
            let buffer = DmaBuffer::new(host.alloc(PAGE_SIZE).unwrap());
            let engine = DmaEngine::new(
                Arc::new(ComboRegisters::new(card.clone())),
                Arc::new(TransferSlot::new()),
                &buffer,
                poll_attempts,
            );
            Self {
                host,
                card,
                buffer: Some(buffer),
                engine,
            }
        }

        fn buffer(&self) -> &DmaBuffer {
            self.buffer.as_ref().unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(buffer) = self.buffer.take() {
                self.host.free(buffer.into_memory());
            }
        }
    }

    #[test]
    fn sync_round_trip_through_card_memory() {
        let fx = Fixture::new(1000);
        fx.card.set_latency(5);
        let buffer = fx.buffer();

        buffer.write_at(0, b"retezec10b").unwrap();
        let out = TransferDescriptor::to_device(buffer, 0, SCRATCH, 10, Completion::Sync).unwrap();
        fx.engine.start_transfer(&out).unwrap();
        assert_eq!(fx.card.read_local(SCRATCH, 10), b"retezec10b");

        let back =
            TransferDescriptor::from_device(SCRATCH, buffer, 10, 10, Completion::Sync).unwrap();
        fx.engine.start_transfer(&back).unwrap();

        let mut bytes = [0u8; 10];
        buffer.read_at(10, &mut bytes).unwrap();
        assert_eq!(&bytes, b"retezec10b");
        assert!(!fx.engine.is_busy());
    }

    #[test]
    fn full_page_transfers_preserve_contents() {
        let fx = Fixture::new(1000);
        let buffer = fx.buffer();
        let pattern: std::vec::Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7 + 3) as u8).collect();
        buffer.write_at(0, &pattern).unwrap();

        let zeros = std::vec![0u8; PAGE_SIZE];

        for len in [1u32, 17, 512, PAGE_SIZE as u32] {
            let n = len as usize;
            buffer.write_at(0, &pattern).unwrap();
            let out =
                TransferDescriptor::to_device(buffer, 0, SCRATCH, len, Completion::Sync).unwrap();
            fx.engine.start_transfer(&out).unwrap();
            assert_eq!(fx.card.read_local(SCRATCH, n), &pattern[..n]);

            buffer.write_at(0, &zeros).unwrap();
            let back =
                TransferDescriptor::from_device(SCRATCH, buffer, 0, len, Completion::Sync).unwrap();
            fx.engine.start_transfer(&back).unwrap();
            let mut readback = std::vec![0u8; n];
            buffer.read_at(0, &mut readback).unwrap();
            assert_eq!(readback, &pattern[..n]);
        }
    }

    #[test]
    fn command_word_selects_direction_and_interrupt() {
        let fx = Fixture::new(10);
        let sync = TransferDescriptor::to_device(fx.buffer(), 0, SCRATCH, 4, Completion::Sync)
            .unwrap()
            .command();
        assert_eq!(sync, 0x1 | (0x1 << 7) | (0x2 << 1) | (0x4 << 4));
        let irq = TransferDescriptor::from_device(SCRATCH, fx.buffer(), 20, 10, Completion::Async)
            .unwrap()
            .command();
        assert_eq!(irq, 0x1 | (0x2 << 4) | (0x4 << 1));
    }

    #[test]
    fn rejects_bad_descriptors() {
        let fx = Fixture::new(10);
        let buffer = fx.buffer();
        let base = buffer.bus_addr(0, 1).unwrap();

        let mut desc = TransferDescriptor::to_device(buffer, 0, SCRATCH, 8, Completion::Sync).unwrap();
        desc.len = 0;
        assert_eq!(fx.engine.start_transfer(&desc), Err(DmaError::InvalidLength(0)));
        desc.len = PAGE_SIZE as u32 + 1;
        assert_eq!(
            fx.engine.start_transfer(&desc),
            Err(DmaError::InvalidLength(PAGE_SIZE as u32 + 1))
        );

        desc.len = 16;
        desc.src = base + PAGE_SIZE as u32 - 8;
        assert_eq!(
            fx.engine.start_transfer(&desc),
            Err(DmaError::OutOfBounds {
                addr: desc.src,
                len: 16
            })
        );

        assert!(matches!(
            TransferDescriptor::from_device(SCRATCH, buffer, PAGE_SIZE - 4, 8, Completion::Sync),
            Err(DmaError::BufferAccess { .. })
        ));
        assert!(!fx.engine.is_busy());
    }

    #[test]
    fn hung_card_times_out_and_releases_the_register() {
        let fx = Fixture::new(64);
        fx.card.set_hang(true);
        let desc = TransferDescriptor::to_device(fx.buffer(), 0, SCRATCH, 8, Completion::Sync).unwrap();
        assert_eq!(
            fx.engine.start_transfer(&desc),
            Err(DmaError::TransferTimedOut { attempts: 64 })
        );
        assert!(!fx.engine.is_busy());

        fx.card.set_hang(false);
        fx.engine.start_transfer(&desc).unwrap();
    }

    #[test]
    fn second_transfer_while_async_in_flight_is_busy() {
        let fx = Fixture::new(100);
        let buffer = fx.buffer();
        let async_desc =
            TransferDescriptor::from_device(SCRATCH, buffer, 20, 10, Completion::Async).unwrap();
        fx.engine.start_transfer(&async_desc).unwrap();
        assert!(fx.engine.is_busy());

        let sync_desc = TransferDescriptor::to_device(buffer, 0, SCRATCH, 10, Completion::Sync).unwrap();
        assert_eq!(fx.engine.start_transfer(&sync_desc), Err(DmaError::TransferBusy));
        assert_eq!(fx.engine.start_transfer(&async_desc), Err(DmaError::TransferBusy));

        assert!(fx.engine.slot.complete_async());
        fx.engine.start_transfer(&sync_desc).unwrap();

        fx.engine.start_transfer(&async_desc).unwrap();
        fx.engine.cancel();
        assert!(!fx.engine.is_busy());
    }

    #[test]
    fn buffer_access_is_bounds_checked() {
        let fx = Fixture::new(1);
        let buffer = fx.buffer();
        buffer.write_at(PAGE_SIZE - 3, b"end").unwrap();
        assert!(buffer.write_at(PAGE_SIZE - 2, b"end").is_err());
        assert!(buffer.read_at(usize::MAX, &mut [0u8; 2]).is_err());

        buffer.write_at(100, b"hello\0world").unwrap();
        assert_eq!(buffer.read_cstr(100, 64).unwrap(), "hello");
        assert_eq!(buffer.read_cstr(106, 3).unwrap(), "wor");
        assert_eq!(buffer.read_cstr(PAGE_SIZE - 3, 64).unwrap(), "end");
        assert!(buffer.read_cstr(PAGE_SIZE, 4).is_err());
    }
}
