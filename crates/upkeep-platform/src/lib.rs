mod device;
mod paths;
mod probe;

pub use device::{abis_for_arch, host_abis, resolve_abis};
pub use paths::{AppPaths, AppPathsError};
pub use probe::HostProbe;
