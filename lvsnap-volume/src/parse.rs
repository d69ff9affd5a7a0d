//! Parsing helpers for LVM report output.
//!
//! `lvs`/`vgs` are invoked with `--noheadings` and `--separator ,`, but the
//! parsers also accept whitespace-separated columns, quoted and padded
//! fields, and stray heading rows. Sizes are normalized to bytes here and
//! nowhere else.

/// Column headings LVM prints when `--noheadings` is not honoured.
const HEADINGS: &[&str] = &["LV", "VG", "PV", "LV Name", "VG Name"];

/// Split one report row into trimmed, unquoted fields.
///
/// Rows containing a comma are split on commas (keeping empty fields, so a
/// blank trailing column survives); other rows are split on whitespace.
pub fn split_row(line: &str) -> Vec<String> {
    let clean = |field: &str| field.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
    if line.contains(',') {
        line.split(',').map(clean).collect()
    } else {
        line.split_whitespace().map(clean).collect()
    }
}

/// Data rows of a report: blank lines and heading rows are dropped.
pub fn data_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(split_row)
        .filter(|fields| {
            fields
                .first()
                .map_or(false, |first| !first.is_empty() && !HEADINGS.contains(&first.as_str()))
        })
        .collect()
}

fn unit_multiplier(unit: char) -> Option<u64> {
    const KIB: u64 = 1024;
    // LVM: lower-case units are powers of 1024, upper-case powers of 1000.
    let m = match unit {
        'b' | 'B' => 1,
        's' | 'S' => 512,
        'k' => KIB,
        'm' => KIB.pow(2),
        'g' => KIB.pow(3),
        't' => KIB.pow(4),
        'p' => KIB.pow(5),
        'e' => KIB.pow(6),
        'K' => 1000,
        'M' => 1000u64.pow(2),
        'G' => 1000u64.pow(3),
        'T' => 1000u64.pow(4),
        'P' => 1000u64.pow(5),
        'E' => 1000u64.pow(6),
        _ => return None,
    };
    Some(m)
}

/// Parse an LVM size field into bytes.
///
/// Accepts `10737418240B`, `10737418240`, `<1.50g`, `20.00G`, `4096s`.
/// The `<`/`>` rounding markers LVM prints are ignored.
pub fn parse_size(raw: &str) -> Option<u64> {
    let s = raw.trim().trim_start_matches(['<', '>']);
    let last = s.chars().last()?;

    let (number, multiplier) = if last.is_ascii_digit() {
        (s, 1)
    } else {
        (&s[..s.len() - last.len_utf8()], unit_multiplier(last)?)
    };
    if number.is_empty() {
        return None;
    }

    if number.contains('.') {
        let value: f64 = number.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let bytes = (value * multiplier as f64).round();
        if bytes > u64::MAX as f64 {
            return None;
        }
        Some(bytes as u64)
    } else {
        number.parse::<u64>().ok()?.checked_mul(multiplier)
    }
}

/// Parse a percentage column such as `snap_percent`. Blank means "not
/// applicable" and yields `None`.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let s = raw.trim().trim_end_matches('%');
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // Rows
    // ===========================================

    #[test]
    fn test_split_row_comma_keeps_empty_trailing_field() {
        assert_eq!(
            split_row("  lv_data,vg0,/dev/vg0/lv_data,1024B,"),
            vec!["lv_data", "vg0", "/dev/vg0/lv_data", "1024B", ""]
        );
    }

    #[test]
    fn test_split_row_strips_quotes_and_padding() {
        assert_eq!(split_row("  'lv_data' , 'vg0'  "), vec!["lv_data", "vg0"]);
    }

    #[test]
    fn test_split_row_whitespace() {
        assert_eq!(
            split_row("  lv_data_snap   /dev/vg0/lv_data_snap  "),
            vec!["lv_data_snap", "/dev/vg0/lv_data_snap"]
        );
    }

    #[test]
    fn test_data_rows_skip_blank_and_headings() {
        let out = "  LV       VG\n\n  lv_data  vg0\n   \n  lv_home  vg0\n";
        let rows = data_rows(out);
        assert_eq!(rows, vec![vec!["lv_data", "vg0"], vec!["lv_home", "vg0"]]);
    }

    // ===========================================
    // Sizes
    // ===========================================

    #[test]
    fn test_parse_size_bytes() {
        assert_eq!(parse_size("10737418240B"), Some(10_737_418_240));
        assert_eq!(parse_size("  512 "), Some(512));
        assert_eq!(parse_size("0B"), Some(0));
    }

    #[test]
    fn test_parse_size_binary_units() {
        assert_eq!(parse_size("1.50g"), Some(1_610_612_736));
        assert_eq!(parse_size("<1.50g"), Some(1_610_612_736));
        assert_eq!(parse_size("4m"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("2t"), Some(2 * 1024u64.pow(4)));
    }

    #[test]
    fn test_parse_size_decimal_units() {
        assert_eq!(parse_size("20.00G"), Some(20_000_000_000));
        assert_eq!(parse_size("3K"), Some(3_000));
    }

    #[test]
    fn test_parse_size_sectors() {
        assert_eq!(parse_size("8s"), Some(4096));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("B"), None);
        assert_eq!(parse_size("12x"), None);
        assert_eq!(parse_size("abc"), None);
        assert_eq!(parse_size("-5B"), None);
        assert_eq!(parse_size("99999999999999999999B"), None);
    }

    // ===========================================
    // Percent
    // ===========================================

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("0.00"), Some(0.0));
        assert_eq!(parse_percent(" 12.50 "), Some(12.5));
        assert_eq!(parse_percent("100.00%"), Some(100.0));
        assert_eq!(parse_percent(""), None);
        assert_eq!(parse_percent("n/a"), None);
    }
}
