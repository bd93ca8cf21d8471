mod auto_dtype;
mod device;

pub use auto_dtype::{ModelDType, TryIntoDType};
pub(crate) use device::select_device;
