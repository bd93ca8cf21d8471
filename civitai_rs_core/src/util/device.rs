use anyhow::Result;
use candle_core::Device;
use tracing::info;

/// Pick the accelerator if one was compiled in and is present, otherwise the CPU.
pub(crate) fn select_device(silent: bool) -> Result<Device> {
    #[cfg(feature = "metal")]
    let device = if candle_core::utils::metal_is_available() {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };
    #[cfg(not(feature = "metal"))]
    let device = Device::cuda_if_available(0)?;

    if !silent {
        info!("running on {device:?}.");
    }
    Ok(device)
}
