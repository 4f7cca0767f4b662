use std::path::Path;

use sha2::{Digest, Sha256};
use upkeep_api::{ArtifactFormat, UpdateError};

const APK_MANIFEST: &str = "AndroidManifest.xml";

#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compare the on-disk size of `path` with the size the release advertised.
///
/// # Errors
/// Returns [`UpdateError::SizeMismatch`] when the sizes differ.
pub fn verify_size(path: &Path, expected: u64) -> Result<(), UpdateError> {
    let actual = std::fs::metadata(path)
        .map_err(|error| UpdateError::io_with_path("failed to stat download", path, &error))?
        .len();

    if actual == expected {
        Ok(())
    } else {
        Err(UpdateError::SizeMismatch {
            file: file_label(path),
            expected,
            actual,
        })
    }
}

/// Open `path` as a zip container and read every entry through.
///
/// APKs must additionally carry a manifest at the archive root.
///
/// # Errors
/// Returns [`UpdateError::CorruptArchive`] when the container is unreadable,
/// an entry fails its CRC check, or the manifest is missing.
pub fn verify_archive(path: &Path, format: ArtifactFormat) -> Result<(), UpdateError> {
    let file = std::fs::File::open(path)
        .map_err(|error| UpdateError::io_with_path("failed to open download", path, &error))?;
    let corrupt = |details: String| UpdateError::CorruptArchive {
        file: file_label(path),
        format: format.extension(),
        details,
    };

    let mut archive = zip::ZipArchive::new(file).map_err(|error| corrupt(error.to_string()))?;
    let mut has_manifest = false;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| corrupt(error.to_string()))?;
        if entry.name() == APK_MANIFEST {
            has_manifest = true;
        }
        // Reading to the end makes the zip reader check the entry CRC.
        std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|error| corrupt(format!("entry '{}': {error}", entry.name())))?;
    }

    if format == ArtifactFormat::Apk && !has_manifest {
        return Err(corrupt(format!("missing {APK_MANIFEST}")));
    }
    Ok(())
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}
