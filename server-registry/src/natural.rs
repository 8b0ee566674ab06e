//! Natural ordering of server ids, so `server-2` ranks before `server-10`.

use std::cmp::Ordering;

/// Split `id` into its non-numeric prefix and trailing ASCII-digit run.
///
/// The run is empty when the id does not end in a digit.
pub fn split_numeric_suffix(id: &str) -> (&str, &str) {
    let digits = id.bytes().rev().take_while(u8::is_ascii_digit).count();
    id.split_at(id.len() - digits)
}

/// Compare two server ids by prefix, then by numeric suffix.
///
/// A missing suffix counts as 0; when that leaves a tie the full strings
/// decide, so `host-` sorts before `host-0`. Suffixes compare by value with
/// no width limit, so `node-007` and `node-7` are equal.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (prefix_a, digits_a) = split_numeric_suffix(a);
    let (prefix_b, digits_b) = split_numeric_suffix(b);
    prefix_a
        .cmp(prefix_b)
        .then_with(|| cmp_decimal(digits_a, digits_b))
        .then_with(|| {
            if digits_a.is_empty() || digits_b.is_empty() {
                a.cmp(b)
            } else {
                Ordering::Equal
            }
        })
}

fn cmp_decimal(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
