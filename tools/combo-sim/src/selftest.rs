use std::sync::Arc;

use anyhow::{Result, anyhow, bail, ensure};
use combo::{
    ComboDriver, Completion, DriverConfig, SelfTestMode, VmArea,
    emulated::EmulatedPlatform,
    units::{PAGE_SIZE, VirtAddr},
};

const MAP_BASE: usize = 0x7f00_0000_0000;

#[derive(Debug, clap::Args)]
pub struct SelftestConfig {
    /// Command-register reads before the card finishes a transfer.
    #[clap(long, default_value_t = 0)]
    latency: u32,
    /// Make the card accept DMA commands without ever completing them.
    #[clap(long)]
    hang: bool,
    /// Bytes sent through the card during the self-test.
    #[clap(long, default_value = "retezec10b")]
    payload: String,
    #[clap(long, default_value_t = 1_000_000)]
    poll_attempts: u32,
}

pub fn run(cfg: &SelftestConfig) -> Result<()> {
    ensure!(
        !cfg.payload.is_empty() && cfg.payload.len() <= 20,
        "payload must be 1 to 20 bytes long"
    );
    let pattern: &'static [u8] = Box::leak(cfg.payload.clone().into_bytes().into_boxed_slice());

    let platform = Arc::new(EmulatedPlatform::new());
    platform.card().set_latency(cfg.latency);
    platform.card().set_hang(cfg.hang);

    let config = DriverConfig::DEFAULT
        .with_self_test(SelfTestMode::SyncAndAsync)
        .with_self_test_pattern(pattern)
        .with_sync_poll_attempts(cfg.poll_attempts);
    let driver = ComboDriver::new(config);

    let handle = driver.attach(platform.clone())?;
    log::info!("{}", handle.info());

    // Let the asynchronous leg of the self-test finish and run its bottom half.
    platform.card().complete_dma();
    let interrupts = platform.deliver_interrupts();
    let runs = platform.run_deferred();
    log::info!("{interrupts} interrupt(s) handled, {runs} deferred run(s)");
    let Some(report) = handle.last_report() else {
        bail!("DMA completion was never reported");
    };
    ensure!(report.as_bytes() == pattern, "worker reported {report:?}");

    let offset = 0x100;
    handle.buffer().write_at(offset, pattern)?;
    handle.copy_to_card(offset, config.card_scratch + 0x100, pattern.len() as u32, Completion::Sync)?;
    handle.copy_from_card(
        config.card_scratch + 0x100,
        offset + 0x100,
        pattern.len() as u32,
        Completion::Sync,
    )?;
    let echoed = handle.buffer().read_cstr(offset + 0x100, pattern.len())?;
    log::info!("buffer+{:#x}: {echoed:?}", offset + 0x100);

    let vma = VmArea::new(VirtAddr::new(MAP_BASE), PAGE_SIZE, 0);
    let page = platform.fault(config.name, &vma, vma.start)?;
    log::info!("mapped {} -> {}", vma.start, page.phys());

    let handle = match handle.detach() {
        Ok(()) => bail!("detach succeeded while the buffer was mapped"),
        Err(refused) => {
            log::info!("detach refused: {refused}");
            refused.handle
        }
    };
    drop(page);
    handle.detach().map_err(|e| anyhow!("{e}"))?;

    let counts = platform.counts();
    ensure!(counts.is_clean(), "resources left after detach: {counts:?}");
    log::info!("self-test passed");
    Ok(())
}
