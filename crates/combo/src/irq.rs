use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    dma::TransferSlot,
    hal::{IrqHandler, IrqReturn},
    mmio::RegisterIo,
    regs::{ComboRegisters, DMA_COMPLETE_CODE},
    units::Irq,
    util::RateLimit,
    worker::DeferredWorker,
};

/// Cause of an interrupt, decoded from the raised-interrupt register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptEvent {
    DmaComplete,
    /// Anything else, including zero (someone else's interrupt on a shared line).
    Unknown(u32),
}

impl InterruptEvent {
    pub const fn classify(status: u32) -> Self {
        match status {
            DMA_COMPLETE_CODE => Self::DmaComplete,
            other => Self::Unknown(other),
        }
    }
}

/// Handler registered on the card's interrupt line.
///
/// Runs in interrupt context: only register accesses and atomics, no locks and
/// no allocation. The rate-limited trace output assumes the installed logger is
/// safe to call from interrupt context.
pub struct InterruptDispatcher<R: RegisterIo> {
    regs: Arc<ComboRegisters<R>>,
    worker: Arc<DeferredWorker>,
    slot: Arc<TransferSlot>,
    log_limit: RateLimit,
    handled: AtomicUsize,
    unhandled: AtomicUsize,
}

impl<R: RegisterIo> InterruptDispatcher<R> {
    pub fn new(
        regs: Arc<ComboRegisters<R>>,
        worker: Arc<DeferredWorker>,
        slot: Arc<TransferSlot>,
    ) -> Self {
        Self {
            regs,
            worker,
            slot,
            log_limit: RateLimit::new(10, 100),
            handled: AtomicUsize::new(0),
            unhandled: AtomicUsize::new(0),
        }
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn unhandled(&self) -> usize {
        self.unhandled.load(Ordering::Relaxed)
    }

    pub fn dispatch(&self) -> IrqReturn {
        let status = self.regs.status();
        if let Some(suppressed) = self.log_limit.check() {
            if suppressed > 0 {
                log::trace!("{suppressed} interrupt messages suppressed");
            }
            log::trace!("combo IRQ: status {status:#x}");
        }

        match InterruptEvent::classify(status) {
            InterruptEvent::DmaComplete => {
                self.regs.stop_dma();
                self.regs.acknowledge(status);
                if !self.slot.complete_async() {
                    log::trace!("DMA completion without an asynchronous transfer in flight");
                }
                self.worker.schedule();
                self.handled.fetch_add(1, Ordering::Relaxed);
                IrqReturn::Handled
            }
            InterruptEvent::Unknown(_) => {
                self.unhandled.fetch_add(1, Ordering::Relaxed);
                IrqReturn::NotHandled
            }
        }
    }
}

impl<R: RegisterIo + 'static> IrqHandler for InterruptDispatcher<R> {
    fn handle_irq(&self, _irq: Irq) -> IrqReturn {
        self.dispatch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::{Completion, DmaBuffer, DmaEngine, TransferDescriptor},
        emulated::{EmulatedCard, HostMemory, QueueExecutor},
        regs::SOFTWARE_CODE,
        units::PAGE_SIZE,
    };

    struct Fixture {
        host: HostMemory,
        card: EmulatedCard,
        regs: Arc<ComboRegisters<EmulatedCard>>,
        slot: Arc<TransferSlot>,
        executor: Arc<QueueExecutor>,
        worker: Arc<DeferredWorker>,
        dispatcher: InterruptDispatcher<EmulatedCard>,
    }

    fn fixture() -> Fixture {
        let host = HostMemory::new();
        let card = EmulatedCard::with_host(host.clone());
        let regs = Arc::new(ComboRegisters::new(card.clone()));
        regs.enable_interrupts(DMA_COMPLETE_CODE | SOFTWARE_CODE);
        let slot = Arc::new(TransferSlot::new());
        let executor = Arc::new(QueueExecutor::new());
        let worker = DeferredWorker::new("test", executor.clone(), Arc::new(|| {}));
        let dispatcher = InterruptDispatcher::new(regs.clone(), worker.clone(), slot.clone());
        Fixture {
            host,
            card,
            regs,
            slot,
            executor,
            worker,
            dispatcher,
        }
    }

    #[test]
    fn classification() {
        assert_eq!(InterruptEvent::classify(0x0100), InterruptEvent::DmaComplete);
        assert_eq!(InterruptEvent::classify(0x1000), InterruptEvent::Unknown(0x1000));
        assert_eq!(InterruptEvent::classify(0x1100), InterruptEvent::Unknown(0x1100));
        assert_eq!(InterruptEvent::classify(0x0001), InterruptEvent::Unknown(0x0001));
        assert_eq!(InterruptEvent::classify(0), InterruptEvent::Unknown(0));
    }

    #[test]
    fn dma_complete_is_acknowledged_and_deferred() {
        let fx = fixture();
        let buffer = DmaBuffer::new(fx.host.alloc(PAGE_SIZE).unwrap());
        let engine = DmaEngine::new(fx.regs.clone(), fx.slot.clone(), &buffer, 10);

        let desc =
            TransferDescriptor::from_device(0x40000, &buffer, 20, 10, Completion::Async).unwrap();
        engine.start_transfer(&desc).unwrap();
        assert!(fx.slot.is_busy());
        assert_eq!(fx.card.status(), DMA_COMPLETE_CODE);

        assert_eq!(fx.dispatcher.handle_irq(Irq(11)), IrqReturn::Handled);
        assert_eq!(fx.card.status(), 0);
        assert_eq!(fx.card.last_ack(), Some(DMA_COMPLETE_CODE));
        assert!(!fx.slot.is_busy());
        assert_eq!(fx.executor.pending(), 1);
        assert_eq!(fx.worker.runs(), 0);

        fx.executor.run_pending();
        assert_eq!(fx.worker.runs(), 1);
        assert_eq!(fx.dispatcher.handled(), 1);

        fx.host.free(buffer.into_memory());
    }

    #[test]
    fn foreign_interrupts_are_not_acknowledged() {
        let fx = fixture();
        assert_eq!(fx.dispatcher.dispatch(), IrqReturn::NotHandled);

        fx.regs.raise(SOFTWARE_CODE);
        assert_eq!(fx.dispatcher.dispatch(), IrqReturn::NotHandled);
        assert_eq!(fx.card.status(), SOFTWARE_CODE);
        assert_eq!(fx.card.last_ack(), None);
        assert_eq!(fx.executor.pending(), 0);
        assert_eq!(fx.dispatcher.unhandled(), 2);
        assert_eq!(fx.dispatcher.handled(), 0);
    }

    #[test]
    fn repeated_completions_coalesce_before_the_worker_runs() {
        let fx = fixture();
        for _ in 0..3 {
            fx.regs.raise(DMA_COMPLETE_CODE);
            assert_eq!(fx.dispatcher.dispatch(), IrqReturn::Handled);
        }
        assert_eq!(fx.executor.pending(), 1);
        fx.executor.run_pending();
        assert_eq!(fx.worker.runs(), 1);
    }
}
