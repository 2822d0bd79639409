/// Which transfers attach runs against the card before handing out the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelfTestMode {
    /// No transfers.
    Skip,
    /// Host to card and back, both polled.
    Sync,
    /// As `Sync`, followed by an interrupt-signalled card to host copy whose
    /// completion is reported by the deferred worker.
    SyncAndAsync,
}

/// Driver tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Name used for the region, the IRQ and the device node.
    pub name: &'static str,
    /// BAR holding the register window.
    pub bar: u8,
    pub shared_irq: bool,
    pub dma_mask_bits: u8,
    /// Card-local scratch address used by the self-test.
    pub card_scratch: u32,
    /// Number of command-register reads a synchronous transfer may spend
    /// waiting for the busy bit before it is reported as timed out.
    pub sync_poll_attempts: u32,
    /// Buffer offset the deferred worker reports on DMA completion.
    pub report_offset: usize,
    /// Upper bound on the length of one report.
    pub report_max_len: usize,
    pub self_test: SelfTestMode,
    pub self_test_pattern: &'static [u8],
}

impl DriverConfig {
    pub const DEFAULT: Self = Self {
        name: "combo",
        bar: 0,
        shared_irq: true,
        dma_mask_bits: 32,
        card_scratch: 0x40000,
        sync_poll_attempts: 1_000_000,
        report_offset: 20,
        report_max_len: 64,
        self_test: SelfTestMode::SyncAndAsync,
        self_test_pattern: b"retezec10b",
    };

    pub const fn with_self_test(mut self, mode: SelfTestMode) -> Self {
        self.self_test = mode;
        self
    }

    pub const fn with_sync_poll_attempts(mut self, attempts: u32) -> Self {
        self.sync_poll_attempts = attempts;
        self
    }

    pub const fn with_self_test_pattern(mut self, pattern: &'static [u8]) -> Self {
        self.self_test_pattern = pattern;
        self
    }

    pub const fn with_card_scratch(mut self, addr: u32) -> Self {
        self.card_scratch = addr;
        self
    }

    pub const fn with_report_offset(mut self, offset: usize) -> Self {
        self.report_offset = offset;
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
