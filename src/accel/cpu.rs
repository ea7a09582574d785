//! Scalar CPU reference and result validation.
//!
//! Device results are compared against the host reference with exact `f32`
//! equality. A device with different rounding or extended-precision
//! behaviour can legitimately disagree here; mismatches are counted, not
//! treated as errors.

/// Scalar CPU reference for the square transform.
pub fn square_reference(input: &[f32]) -> Vec<f32> {
    input.iter().map(|&x| x * x).collect()
}

/// Number of positions where `actual` is bit-for-bit equal (by `==`) to
/// `expected`. Both slices come from the same element count.
pub fn count_exact_matches(expected: &[f32], actual: &[f32]) -> usize {
    expected
        .iter()
        .zip(actual)
        .filter(|(e, a)| e == a)
        .count()
}
