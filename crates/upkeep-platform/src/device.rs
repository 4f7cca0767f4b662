use upkeep_api::Abi;

/// Architectures a CPU family can execute, preferred first.
#[must_use]
pub fn abis_for_arch(arch: &str) -> Vec<Abi> {
    match arch {
        "aarch64" => vec![Abi::Arm64V8a, Abi::ArmeabiV7a],
        "arm" => vec![Abi::ArmeabiV7a],
        "x86_64" => vec![Abi::X86_64, Abi::X86],
        "x86" => vec![Abi::X86],
        _ => Vec::new(),
    }
}

#[must_use]
pub fn host_abis() -> Vec<Abi> {
    abis_for_arch(std::env::consts::ARCH)
}

/// The configured architecture list, or the host's when none is configured.
#[must_use]
pub fn resolve_abis(configured: &[Abi]) -> Vec<Abi> {
    if configured.is_empty() {
        return host_abis();
    }

    let mut abis = Vec::with_capacity(configured.len());
    for abi in configured {
        if !abis.contains(abi) {
            abis.push(*abi);
        }
    }
    abis
}
