mod error;
mod traits;
mod types;

pub use error::{NetworkStage, UpdateError};
pub use traits::{InstalledApps, Installer, Notifier, PackageInspector, ReleaseSource, SystemProbe};
pub use types::{
    Abi, AppDescriptor, ArtifactFormat, Asset, AssetRule, CacheMode, DownloadProgress,
    InstallOutcome, NetworkState, ReleaseInfo, RepoCoordinates, SystemConditions, UpdateStatus,
    VersionParseError,
};
