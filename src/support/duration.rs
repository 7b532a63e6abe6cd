use std::time::Duration;

/// Parses strings like `1d2h3m4s` into a [`Duration`]. Any digit run not
/// followed by a recognized unit letter (`d`, `h`, `m`, `s`) is treated as
/// trailing seconds; unrecognized letters are skipped rather than rejected,
/// matching the forgiving grammar config files are hand-edited against.
pub fn parse(input: &str) -> Duration {
    let input = input.trim().to_ascii_lowercase();
    let mut total: u64 = 0;
    let mut acc: u64 = 0;
    for ch in input.chars() {
        match ch {
            '0'..='9' => acc = acc.saturating_mul(10).saturating_add(ch as u64 - '0' as u64),
            'd' => {
                total = total.saturating_add(acc.saturating_mul(24 * 3600));
                acc = 0;
            }
            'h' => {
                total = total.saturating_add(acc.saturating_mul(3600));
                acc = 0;
            }
            'm' => {
                total = total.saturating_add(acc.saturating_mul(60));
                acc = 0;
            }
            's' => {
                total = total.saturating_add(acc);
                acc = 0;
            }
            _ => {}
        }
    }
    total = total.saturating_add(acc);
    Duration::from_secs(total)
}

/// Renders a [`Duration`] back to the same `1d2h3m4s` shorthand, for logs.
pub fn to_string(d: Duration) -> String {
    let mut secs = d.as_secs();
    let mut out = String::new();
    let days = secs / (24 * 3600);
    if days > 0 {
        out.push_str(&format!("{days}d"));
        secs %= 24 * 3600;
    }
    let hours = secs / 3600;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
        secs %= 3600;
    }
    let minutes = secs / 60;
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_duration() {
        assert_eq!(parse("6h1s"), Duration::from_secs(6 * 3600 + 1));
        assert_eq!(parse("1d2h3m4s"), Duration::from_secs(93784));
    }

    #[test]
    fn bare_digits_are_seconds() {
        assert_eq!(parse("45"), Duration::from_secs(45));
    }

    #[test]
    fn unknown_letters_are_ignored() {
        assert_eq!(parse("1z6"), Duration::from_secs(16));
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(parse(""), Duration::from_secs(0));
    }

    #[test]
    fn round_trips_readably() {
        assert_eq!(to_string(Duration::from_secs(93784)), "1d2h3m4s");
        assert_eq!(to_string(Duration::from_secs(0)), "0s");
    }
}
