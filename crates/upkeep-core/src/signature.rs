use std::io::Read;
use std::path::Path;

use upkeep_api::{PackageInspector, UpdateError};

use crate::integrity::sha256_hex;

const SIGNATURE_DIR: &str = "META-INF/";
const SIGNATURE_EXTENSIONS: [&str; 3] = [".RSA", ".DSA", ".EC"];

const TAG_INTEGER: u8 = 0x02;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xA0;

/// Fingerprints a package by the SHA-256 of its signer certificate.
///
/// The certificate is the first one embedded in the first
/// `META-INF/*.RSA`, `*.DSA` or `*.EC` PKCS#7 block, which is the value
/// `apksigner` prints as the certificate SHA-256 digest. `None` means the
/// package carries no signature block.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveSignatureInspector;

impl PackageInspector for ArchiveSignatureInspector {
    fn signing_fingerprint(&self, path: &Path) -> Result<Option<String>, UpdateError> {
        let file = std::fs::File::open(path)
            .map_err(|error| UpdateError::io_with_path("failed to open package", path, &error))?;
        let corrupt = |details: String| UpdateError::CorruptArchive {
            file: path.display().to_string(),
            format: "apk",
            details,
        };
        let mut archive = zip::ZipArchive::new(file).map_err(|error| corrupt(error.to_string()))?;

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|error| corrupt(error.to_string()))?;
            if !is_signature_block(entry.name()) {
                continue;
            }

            let name = entry.name().to_string();
            let mut block = Vec::new();
            entry
                .read_to_end(&mut block)
                .map_err(|error| corrupt(format!("{name}: {error}")))?;
            let certificate = first_certificate(&block)
                .ok_or_else(|| corrupt(format!("{name} holds no readable certificate")))?;
            return Ok(Some(sha256_hex(certificate)));
        }

        Ok(None)
    }
}

fn is_signature_block(name: &str) -> bool {
    let Some(file) = name.strip_prefix(SIGNATURE_DIR) else {
        return false;
    };
    !file.contains('/')
        && SIGNATURE_EXTENSIONS
            .iter()
            .any(|extension| file.to_ascii_uppercase().ends_with(extension))
}

/// One DER element: its tag, its content and the bytes following it.
struct Element<'a> {
    tag: u8,
    content: &'a [u8],
    encoded: &'a [u8],
    rest: &'a [u8],
}

fn read_element(input: &[u8]) -> Option<Element<'_>> {
    let (&tag, after_tag) = input.split_first()?;
    let (&first, after_length) = after_tag.split_first()?;

    let (length, header_len, body) = if first < 0x80 {
        (usize::from(first), 2, after_length)
    } else {
        // Long form only; indefinite lengths are not DER.
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 4 || after_length.len() < count {
            return None;
        }
        let length = after_length[..count]
            .iter()
            .fold(0_usize, |acc, byte| (acc << 8) | usize::from(*byte));
        (length, 2 + count, &after_length[count..])
    };

    if body.len() < length {
        return None;
    }
    Some(Element {
        tag,
        content: &body[..length],
        encoded: &input[..header_len + length],
        rest: &body[length..],
    })
}

fn expect(input: &[u8], tag: u8) -> Option<Element<'_>> {
    read_element(input).filter(|element| element.tag == tag)
}

/// DER bytes of the first certificate in a PKCS#7 `SignedData` block.
fn first_certificate(block: &[u8]) -> Option<&[u8]> {
    let content_info = expect(block, TAG_SEQUENCE)?;
    let content_type = expect(content_info.content, TAG_OID)?;
    let explicit = expect(content_type.rest, TAG_CONTEXT_0)?;
    let signed_data = expect(explicit.content, TAG_SEQUENCE)?;

    let version = expect(signed_data.content, TAG_INTEGER)?;
    let digest_algorithms = expect(version.rest, TAG_SET)?;
    let encapsulated = expect(digest_algorithms.rest, TAG_SEQUENCE)?;
    let certificates = expect(encapsulated.rest, TAG_CONTEXT_0)?;

    expect(certificates.content, TAG_SEQUENCE).map(|certificate| certificate.encoded)
}
