/// `ceil(log2(n))`, with `log2ceil(0) == log2ceil(1) == 0`
pub const fn log2ceil(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        // 1001 = 9 -> 4
        // 1000 = 8 -> 3
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Smallest power of two that is `>= n` (and at least 1)
pub const fn next_power_of_two(n: usize) -> usize {
    1 << log2ceil(n)
}

/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Round `n` down to a multiple of `align`, which must be a power of two
pub const fn align_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}

/// Round `n` up to a multiple of `align`, which must be a power of two
pub const fn align_up(n: usize, align: usize) -> usize {
    align_down(n + align - 1, align)
}
