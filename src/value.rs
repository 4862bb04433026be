// This module implements the runtime value representation shared between the generated code
// and the Lama runtime. Unboxed machine integers are distinguished from heap pointers by a
// one-bit tag: an integer n is stored as 2n+1, so every boxed integer is odd while heap
// pointers stay word-aligned and even. box_int and unbox_int perform the conversion; the
// generated code untags with an arithmetic shift right, which keeps the sign of negative
// values. The module also implements the tag-name hash used by S-expression construction and
// tag checks: up to ten leading characters of a tag are looked up in a fixed 64-symbol
// alphabet and packed into six bits each, and the result is cross-checked by re-deriving the
// characters from the hash. The hash handed to the runtime is itself boxed.

//! Boxed integers and tag-name hashing.

use crate::error::{CompileError, CompileResult};

/// Alphabet for tag hashing. The index of a character is its 6-bit code.
const TAG_CHARS: &[u8; 64] =
    b"_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789'";

/// Only this many leading characters participate in the hash.
const TAG_HASH_LIMIT: usize = 10;

/// Box a machine integer into its tagged representation.
pub fn box_int(n: i64) -> i64 {
    2 * n + 1
}

/// Recover a machine integer from its tagged representation.
pub fn unbox_int(v: i64) -> i64 {
    v >> 1
}

/// Hash a tag name into the boxed integer the generated code passes to the runtime.
///
/// Fails on characters outside the alphabet and on names the hash cannot represent
/// faithfully, e.g. a leading underscore whose zero code vanishes from the packed value.
pub fn tag_hash(tag: &str) -> CompileResult<i64> {
    let mut h: i64 = 0;
    for &b in tag.as_bytes().iter().take(TAG_HASH_LIMIT) {
        let pos = TAG_CHARS
            .iter()
            .position(|&c| c == b)
            .ok_or(CompileError::BadTagChar { ch: b as char })?;
        h = (h << 6) | pos as i64;
    }
    let rehashed = de_hash(h);
    let prefix: String = tag.chars().take(TAG_HASH_LIMIT).collect();
    if rehashed != prefix {
        return Err(CompileError::TagHashMismatch {
            tag: tag.to_string(),
            rehashed,
        });
    }
    Ok(box_int(h))
}

/// Unpack a hash back into its characters, most significant group first.
fn de_hash(mut h: i64) -> String {
    let mut chars = Vec::new();
    while h != 0 {
        chars.push(TAG_CHARS[(h & 0x3f) as usize] as char);
        h >>= 6;
    }
    chars.iter().rev().collect()
}
