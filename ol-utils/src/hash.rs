pub fn u8s_from_str(input: &str) -> [u8; 32] {
    blake3::hash(input.as_bytes()).into()
}

/// Hashes `input` under `seed`. Used for feature names, with the namespace
/// hash as the seed, so equal names in different namespaces land apart.
pub fn hash_with_seed(seed: u64, input: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(input.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Namespace hashes seed the feature hashes of that namespace. The default
/// (unnamed) namespace hashes to 0.
pub fn namespace_hash(name: &str) -> u64 {
    if name.is_empty() || name == " " {
        0
    } else {
        hash_with_seed(0, name)
    }
}
