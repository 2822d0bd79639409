use std::sync::Arc;

use anyhow::{Result, bail, ensure};
use combo::{AttachStage, ComboDriver, DriverConfig, emulated::EmulatedPlatform};

pub fn run() -> Result<()> {
    let platform = Arc::new(EmulatedPlatform::new());
    let driver = ComboDriver::new(DriverConfig::DEFAULT);

    for stage in AttachStage::ALL {
        platform.fail_next(stage);
        match driver.attach(platform.clone()) {
            Ok(_) => bail!("attach succeeded despite a failure at {stage:?}"),
            Err(e) => {
                log::info!("{stage:?} -> {e}");
                ensure!(e.stage() == Some(stage), "failure reported at {:?}", e.stage());
            }
        }
        let counts = platform.counts();
        ensure!(counts.is_clean(), "{stage:?} left {counts:?} behind");
        ensure!(platform.host().outstanding() == 0, "{stage:?} leaked host memory");
        ensure!(!driver.is_attached(), "{stage:?} left the driver attached");
    }

    log::info!("all {} attach steps roll back cleanly", AttachStage::ALL.len());
    Ok(())
}
