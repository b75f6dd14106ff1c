//! Permission bitmask algebra: named permissions over a fixed bit enumeration.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use tracing::warn;

/// The version-control security namespace bits, as published by the external
/// service. Names are matched case-insensitively.
static BITS: Lazy<HashMap<&'static str, u64>> = Lazy::new(|| {
    HashMap::from([
        ("administer", 1),
        ("genericread", 2),
        ("genericcontribute", 4),
        ("forcepush", 8),
        ("createbranch", 16),
        ("createtag", 32),
        ("managenote", 64),
        ("policyexempt", 128),
        ("createrepository", 256),
        ("deleterepository", 512),
        ("renamerepository", 1024),
        ("editpolicies", 2048),
        ("removeotherslocks", 4096),
        ("managepermissions", 8192),
        ("pullrequestcontribute", 16384),
        ("pullrequestbypasspolicy", 32768),
    ])
});

/// Bit value for a single permission name, if known.
pub fn bit(name: &str) -> Option<u64> {
    BITS.get(name.to_ascii_lowercase().as_str()).copied()
}

/// OR together the bit values of the named permissions. Unknown names
/// contribute zero; callers needing strictness use [`bit`] directly.
pub fn resolve(names: &[String]) -> u64 {
    let mut mask = 0u64;
    for n in names {
        match bit(n) {
            Some(b) => mask |= b,
            None => warn!(permission = %n, "unknown permission name; contributes no bits"),
        }
    }
    mask
}

/// In-sync check between a current and a desired mask.
///
/// With `merge`, every desired bit must be present in current (current may
/// hold extra bits granted from other sources). Without it, bit-exact
/// equality is required.
pub fn in_sync(current: u64, desired: u64, merge: bool) -> bool {
    if merge {
        current & desired == desired
    } else {
        current == desired
    }
}
