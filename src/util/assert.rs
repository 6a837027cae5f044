/// Test if `addr` is a multiple of `align`
pub const fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Test if `n` is a (non-zero) power of two
pub const fn is_power_of_two(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}
