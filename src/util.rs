use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const CANCELLED: &str = "Cancelled by user";

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Render a byte count with a binary unit suffix.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;

    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < MIB {
        format!("{:.1} KB", value / KIB)
    } else {
        format!("{:.1} MB", value / MIB)
    }
}

/// Compute download progress as a percentage.
#[must_use]
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32) * 100.0,
        _ => 0.0,
    }
}

/// Substitute `{name}` placeholders in a release template.
#[must_use]
pub fn expand_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_owned(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes_and_speeds() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2_048), "2.0 KB");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
        assert_eq!(format_speed(0.0), "0 B/s");
    }

    #[test]
    fn calculates_progress_percent() {
        assert_eq!(progress_percent(5, Some(10)), 50.0);
        assert_eq!(progress_percent(5, Some(0)), 0.0);
        assert_eq!(progress_percent(5, None), 0.0);
    }

    #[test]
    fn expands_every_placeholder_occurrence() {
        let url = expand_template(
            "https://host/{version}/pkg-{version}-{target}.zip",
            &[("version", "1.5.0"), ("target", "x86_64-unknown-linux-gnu")],
        );
        assert_eq!(
            url,
            "https://host/1.5.0/pkg-1.5.0-x86_64-unknown-linux-gnu.zip"
        );
        assert_eq!(expand_template("{unknown}", &[]), "{unknown}");
    }

    #[test]
    fn respects_optional_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(&Some(flag.clone())));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(&Some(flag)));
        assert!(!cancel_requested(&None));
    }
}
