//! Walltime parsing and formatting.
//!
//! Two grammars live here: the user-facing one (`2h`, `90m`, `1-00:00:00`,
//! bare minutes like `sbatch -t`) and the scheduler's elapsed/limit strings
//! from `squeue` (`MM:SS`, `HH:MM:SS`, `D-HH:MM:SS`, `UNLIMITED`, `INVALID`).

/// Parses a user-supplied walltime into seconds.
///
/// Accepted forms: `<n>s`, `<n>m`, `<n>h`, `<n>d`, `D-HH:MM:SS`, `D-HH:MM`,
/// `D-HH`, `HH:MM:SS`, `HH:MM`, and a bare integer meaning minutes.
pub fn parse_duration(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("time must not be empty".to_string());
    }

    let lower = s.to_ascii_lowercase();
    if let Some(raw) = lower.strip_suffix('s') {
        return parse_unit(raw, 1, input);
    }
    if let Some(raw) = lower.strip_suffix('m') {
        return parse_unit(raw, 60, input);
    }
    if let Some(raw) = lower.strip_suffix('h') {
        return parse_unit(raw, 3600, input);
    }
    if let Some(raw) = lower.strip_suffix('d') {
        return parse_unit(raw, 86400, input);
    }

    if let Some((days, rest)) = lower.split_once('-') {
        let days: u64 = days
            .parse()
            .map_err(|_| format!("invalid day count in {input:?}"))?;
        let parts: Vec<&str> = rest.split(':').collect();
        let (h, m, sec) = match parts.as_slice() {
            [h] => (field(h, input)?, 0, 0),
            [h, m] => (field(h, input)?, field(m, input)?, 0),
            [h, m, sec] => (field(h, input)?, field(m, input)?, field(sec, input)?),
            _ => return Err(format!("invalid time: {input:?}")),
        };
        return Ok(days * 86400 + h * 3600 + m * 60 + sec);
    }

    let parts: Vec<&str> = lower.split(':').collect();
    match parts.as_slice() {
        // Bare integers are minutes, matching the scheduler's convention.
        [n] => parse_unit(n, 60, input),
        [h, m] => Ok(field(h, input)? * 3600 + field(m, input)? * 60),
        [h, m, sec] => Ok(field(h, input)? * 3600 + field(m, input)? * 60 + field(sec, input)?),
        _ => Err(format!("invalid time: {input:?}")),
    }
}

fn parse_unit(raw: &str, scale: u64, original: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(format!("invalid time: {original:?}"));
    }
    let value: u64 = raw
        .parse()
        .map_err(|_| format!("invalid time number: {original:?}"))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| format!("time too large: {original:?}"))
}

fn field(raw: &str, original: &str) -> Result<u64, String> {
    raw.parse()
        .map_err(|_| format!("invalid time field in {original:?}"))
}

/// Formats seconds as a scheduler walltime: `HH:MM:SS` under one day,
/// `D-HH:MM:SS` from one day up.
pub fn format_walltime(secs: u64) -> String {
    let days = secs / 86400;
    let h = (secs % 86400) / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if days > 0 {
        format!("{days}-{h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

/// Parses an elapsed/limit string from the scheduler's live listing.
///
/// Two-field strings are `MM:SS`. `UNLIMITED` and `INVALID` (and anything
/// unrecognized) collapse to `None`.
pub fn parse_elapsed(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() || s == "UNLIMITED" || s == "INVALID" {
        return None;
    }

    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let secs = match parts.as_slice() {
        [m, sec] if days == 0 => m.parse::<u64>().ok()? * 60 + sec.parse::<u64>().ok()?,
        [h, m, sec] => {
            h.parse::<u64>().ok()? * 3600 + m.parse::<u64>().ok()? * 60 + sec.parse::<u64>().ok()?
        }
        [h] if days > 0 => h.parse::<u64>().ok()? * 3600,
        [h, m] if days > 0 => h.parse::<u64>().ok()? * 3600 + m.parse::<u64>().ok()? * 60,
        _ => return None,
    };
    Some(days * 86400 + secs)
}
