/// Returns the factors of an integer, in ascending order.
pub fn factors(x: i64) -> Vec<i64> {
    debug_assert!(x > 0);
    let mut result = Vec::new();
    let mut i = 1;
    while i * i <= x {
        if x % i == 0 {
            result.push(i);
            if x / i != i {
                result.push(x / i);
            }
        }
        i += 1;
    }
    result.sort_unstable();
    result
}

/// Enumerates every ordered factorization of `extent` into `n_splits` factors
/// whose product is exactly `extent` and whose last (innermost) factor is at
/// most `max_innermost`. Results are in lexicographic order.
pub fn perfect_tilings(extent: i64, n_splits: usize, max_innermost: i64) -> Vec<Vec<i64>> {
    let mut out = Vec::new();
    let mut prefix = Vec::with_capacity(n_splits);
    tilings_rec(extent, n_splits, max_innermost, &mut prefix, &mut out);
    out
}

fn tilings_rec(
    remaining: i64,
    parts_left: usize,
    max_innermost: i64,
    prefix: &mut Vec<i64>,
    out: &mut Vec<Vec<i64>>,
) {
    if parts_left == 1 {
        if remaining <= max_innermost {
            let mut full = prefix.clone();
            full.push(remaining);
            out.push(full);
        }
        return;
    }
    for f in factors(remaining) {
        prefix.push(f);
        tilings_rec(remaining / f, parts_left - 1, max_innermost, prefix, out);
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factors() {
        assert_eq!(factors(1), vec![1]);
        assert_eq!(factors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(factors(13), vec![1, 13]);
    }

    #[test]
    fn test_perfect_tilings_products() {
        for t in perfect_tilings(24, 3, 8) {
            assert_eq!(t.iter().product::<i64>(), 24);
            assert!(*t.last().unwrap() <= 8);
        }
    }

    #[test]
    fn test_perfect_tilings_prime_over_limit_has_single_option() {
        // 13 cannot be placed innermost, so the only 2-way split is (13, 1).
        assert_eq!(perfect_tilings(13, 2, 4), vec![vec![13, 1]]);
    }

    #[test]
    fn test_perfect_tilings_deterministic_order() {
        let a = perfect_tilings(16, 2, 16);
        let b = perfect_tilings(16, 2, 16);
        assert_eq!(a, b);
        assert_eq!(a[0], vec![1, 16]);
    }
}
