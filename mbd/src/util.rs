pub fn clamp(v: u64, lo: u64, hi: u64) -> u64 {
    v.min(hi).max(lo)
}

/// Render a byte count the way operators read them: an integer with the
/// largest suffix that divides it evenly, "unlim" for the no-limit sentinel.
pub fn strmemsize(v: u64) -> String {
    if v == u64::MAX {
        return "unlim".to_string();
    }
    const SUFFIXES: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
    for (mult, suffix) in SUFFIXES {
        if v >= mult && v % mult == 0 {
            return format!("{}{}", v / mult, suffix);
        }
    }
    v.to_string()
}

/// Parse a memory size with an optional K/M/G suffix (case-insensitive).
/// "unlim" and "max" mean no limit.
pub fn parse_memsize(s: &str) -> Result<u64, String> {
    let s = s.trim();
    match s.to_ascii_lowercase().as_str() {
        "unlim" | "max" => return Ok(u64::MAX),
        _ => {}
    }
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1 << 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory size {:?}", s))?;
    n.checked_mul(mult)
        .ok_or_else(|| format!("memory size {:?} overflows", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_inverted_range_takes_low() {
        assert_eq!(clamp(5, 10, 2), 10);
        assert_eq!(clamp(5, 0, 10), 5);
        assert_eq!(clamp(50, 0, 10), 10);
    }

    #[test]
    fn strmemsize_picks_suffix() {
        assert_eq!(strmemsize(0), "0");
        assert_eq!(strmemsize(512), "512");
        assert_eq!(strmemsize(4096), "4K");
        assert_eq!(strmemsize(3 << 20), "3M");
        assert_eq!(strmemsize(2 << 30), "2G");
        assert_eq!(strmemsize((1 << 30) + 1), ((1u64 << 30) + 1).to_string());
        assert_eq!(strmemsize(u64::MAX), "unlim");
    }

    #[test]
    fn parse_memsize_good() {
        assert_eq!(parse_memsize("0").unwrap(), 0);
        assert_eq!(parse_memsize("512").unwrap(), 512);
        assert_eq!(parse_memsize("4k").unwrap(), 4096);
        assert_eq!(parse_memsize("512M").unwrap(), 512 << 20);
        assert_eq!(parse_memsize("2G").unwrap(), 2 << 30);
        assert_eq!(parse_memsize("unlim").unwrap(), u64::MAX);
        assert_eq!(parse_memsize("MAX").unwrap(), u64::MAX);
    }

    #[test]
    fn parse_memsize_bad() {
        assert!(parse_memsize("").is_err());
        assert!(parse_memsize("-1").is_err());
        assert!(parse_memsize("12q").is_err());
        assert!(parse_memsize("99999999999999999999G").is_err());
    }
}
