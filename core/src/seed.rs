//! Seed derivation.
//!
//! A batch carries one seed string; every run derives its own display seed
//! from it and the engine hashes that string into the RNG seed. The hash is
//! fixed forever: changing it changes every historical run.

/// Display seed for run `run_index` of a batch seeded with `batch_seed`.
pub fn derive_run_seed(batch_seed: &str, run_index: u32) -> String {
    format!("{batch_seed}_{run_index}")
}

/// Deterministic 64-bit seed for a run seed string (FNV-1a).
pub fn seed_from_string(seed: &str) -> u64 {
    fnv1a64(seed.as_bytes())
}

/// A fresh batch seed for callers that do not supply one.
pub fn generate_batch_seed() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash = (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME);
    }
    hash
}
