//! Array object naming
//!
//! Array object names are capped at 31 characters. Longer orchestrator names
//! keep a readable prefix and end in a hash of the full name, so the mapping
//! is stable across calls and processes.

/// Longest object name arrays accept
pub const MAX_OBJECT_NAME_LEN: usize = 31;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(name: &str) -> u32 {
    name.bytes()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME))
}

/// Array-side name for an orchestrator volume or snapshot name
pub fn object_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if cleaned.len() <= MAX_OBJECT_NAME_LEN && cleaned == name {
        return cleaned;
    }

    let suffix = format!("{:08x}", fnv1a(name));
    let keep = MAX_OBJECT_NAME_LEN - suffix.len() - 1;
    let prefix: String = cleaned.chars().take(keep).collect();
    format!("{}-{}", prefix, suffix)
}
