//! Constant-time comparisons for secret-dependent data.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Execution time depends only on the slice lengths.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Constant-time comparison of 32-byte values.
#[must_use]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_verify_32() {
        let a = [1u8; 32];
        let mut b = a;
        assert!(verify_32(&a, &b));
        b[31] = 0;
        assert!(!verify_32(&a, &b));
    }
}
