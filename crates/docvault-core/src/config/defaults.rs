use std::time::Duration;

use crate::error::DocvaultError;

pub(super) fn default_archive_size_mib() -> u64 {
    250
}

pub(super) fn default_archive_max_documents() -> usize {
    10_000
}

pub(super) fn default_batch_size() -> usize {
    200
}

pub(super) fn default_blob_limit_mib() -> u64 {
    5
}

pub(super) fn default_skip_content_types() -> Vec<String> {
    vec!["video/".into(), "image/".into(), "audio/".into()]
}

pub(super) fn default_keep_snapshots() -> usize {
    84
}

pub(super) fn default_timeout() -> String {
    "30m".to_string()
}

pub(super) fn default_restore_parallel() -> usize {
    1
}

pub(super) fn default_upload_batch_mib() -> u64 {
    2
}

pub(super) fn default_retries() -> usize {
    5
}

pub(super) fn default_retry_delay_ms() -> u64 {
    1000
}

pub(super) fn default_retry_max_delay_ms() -> u64 {
    60_000
}

pub(super) fn default_blob_concurrency() -> usize {
    10
}

pub(super) fn default_gzip_level() -> u32 {
    crate::compress::DEFAULT_LEVEL
}

/// Parse a simple duration string like "90s", "30m", "4h", or "2d".
pub fn parse_human_duration(raw: &str) -> crate::error::Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(DocvaultError::Config("duration must not be empty".into()));
    }

    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => return Err(DocvaultError::Config("duration must not be empty".into())),
    };

    let value: u64 = num_part
        .parse()
        .map_err(|_| DocvaultError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(DocvaultError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
        None => value.saturating_mul(60),
    };

    if secs == 0 {
        return Err(DocvaultError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(Duration::from_secs(secs))
}
