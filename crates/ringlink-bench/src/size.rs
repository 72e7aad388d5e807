//! Byte sizes with binary suffixes, as accepted on the command line.

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: usize = 1024 * MIB;

/// Parses `512`, `4K`, `16m`, `2G` (binary multiples; a trailing `B` or `iB` is allowed).
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let digits = upper
        .trim_end_matches('B')
        .trim_end_matches('I');
    let (number, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], KIB),
        Some('M') => (&digits[..digits.len() - 1], MIB),
        Some('G') => (&digits[..digits.len() - 1], GIB),
        _ => (digits, 1),
    };
    let value: usize = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {s:?} is too large"))
}

/// Shortest exact rendering with a binary suffix, e.g. `4K` or `1536`.
pub fn format_size(bytes: usize) -> String {
    match bytes {
        0 => "0".to_string(),
        b if b % GIB == 0 => format!("{}G", b / GIB),
        b if b % MIB == 0 => format!("{}M", b / MIB),
        b if b % KIB == 0 => format!("{}K", b / KIB),
        b => b.to_string(),
    }
}
