//! Progress events and the policies deciding which of them become visible

use serde::Serialize;

/// How an operation ended, as reflected in the aggregated status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Succeeded,
    Failed,
    Cancelled,
}

/// Immutable progress snapshot of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgressEvent {
    Started {
        label: String,
    },
    Message {
        label: String,
        message: String,
    },
    Files {
        label: String,
        current: u64,
        total: u64,
        name: String,
        percent: u8,
    },
    Bytes {
        label: String,
        current: u64,
        total: u64,
        name: String,
        percent: u8,
    },
    Finished {
        label: String,
        completion: Completion,
    },
}

impl ProgressEvent {
    pub fn label(&self) -> &str {
        match self {
            ProgressEvent::Started { label }
            | ProgressEvent::Message { label, .. }
            | ProgressEvent::Files { label, .. }
            | ProgressEvent::Bytes { label, .. }
            | ProgressEvent::Finished { label, .. } => label,
        }
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressEvent::Files { percent, .. } | ProgressEvent::Bytes { percent, .. } => {
                Some(*percent)
            }
            _ => None,
        }
    }

    /// Whether this event is transfer progress, which is dropped for cancelled operations
    pub fn is_transfer_progress(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Files { .. } | ProgressEvent::Bytes { .. }
        )
    }

    /// One-line text for the visible status
    pub fn describe(&self) -> String {
        match self {
            ProgressEvent::Started { label } => format!("{}: starting", label),
            ProgressEvent::Message { label, message } => format!("{}: {}", label, message),
            ProgressEvent::Files {
                label,
                current,
                total,
                name,
                percent,
            } => format!("{}: {}/{} {} ({}%)", label, current, total, name, percent),
            ProgressEvent::Bytes {
                label,
                name,
                percent,
                ..
            } => format!("{}: {} ({}%)", label, name, percent),
            ProgressEvent::Finished { label, completion } => match completion {
                Completion::Succeeded => format!("{}: done", label),
                Completion::Failed => format!("{}: failed", label),
                Completion::Cancelled => format!("{}: cancelled", label),
            },
        }
    }
}

/// Progress reported by an operation body; the host turns it into a [`ProgressEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Message(String),
    Files {
        current: u64,
        total: u64,
        name: String,
    },
    Bytes {
        current: u64,
        total: u64,
        name: String,
    },
}

/// Byte completion percentage, rounded to nearest.
///
/// Forced to 100 once some bytes moved and at most `threshold` remain, so a transfer never
/// sits at 99% because of rounding.
pub fn byte_percent(current: u64, total: u64, threshold: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let current = current.min(total);
    if current > 0 && total - current <= threshold {
        return 100;
    }
    let current = current as u128;
    let total = total as u128;
    ((current * 200 + total) / (total * 2)).min(100) as u8
}

/// File-count completion percentage, truncated
pub fn file_percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current.min(total) as u128 * 100) / total as u128) as u8
}

/// Byte progress is only shown on 10% steps and in the last stretch
pub fn is_byte_milestone(percent: u8) -> bool {
    percent % 10 == 0 || percent > 95
}

/// Sampling stride for file progress between milestones
pub fn file_sample_rate(total: u64) -> u64 {
    match total {
        0..=20 => 2,
        21..=100 => 5,
        101..=500 => 10,
        501..=2000 => 25,
        _ => 50,
    }
}

/// Anti-spam policy for per-file updates.
///
/// The first and last files always pass, as does the file that crosses a 10% milestone
/// (5% for batches over 100 files). Everything else is sampled every
/// [`file_sample_rate`] files.
pub fn should_show_file(current: u64, total: u64) -> bool {
    if total == 0 || current == 0 {
        return false;
    }
    if current == 1 || current >= total {
        return true;
    }

    let step = if total > 100 { 5 } else { 10 };
    let now = file_percent(current, total) / step;
    let before = file_percent(current - 1, total) / step;
    if now > before {
        return true;
    }

    current % file_sample_rate(total) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_percent_rounding() {
        assert_eq!(byte_percent(0, 1_000_000, 1024), 0);
        assert_eq!(byte_percent(5_000, 1_000_000, 1024), 1);
        assert_eq!(byte_percent(4_999, 1_000_000, 1024), 0);
        assert_eq!(byte_percent(500_000, 1_000_000, 1024), 50);
        assert_eq!(byte_percent(1_000_000, 1_000_000, 1024), 100);
        assert_eq!(byte_percent(10, 0, 1024), 0);
    }

    #[test]
    fn test_byte_percent_near_completion() {
        assert_eq!(byte_percent(999, 1000, 1024), 100);
        assert_eq!(byte_percent(999, 1000, 0), 100);
        assert_eq!(byte_percent(989, 1000, 0), 99);
        assert_eq!(byte_percent(10_000_000 - 1024, 10_000_000, 1024), 100);
    }

    #[test]
    fn test_byte_percent_is_monotonic_and_ends_at_100() {
        for total in [1u64, 7, 999, 1000, 4096, 123_457] {
            let mut last = 0u8;
            let mut current = 0;
            while current <= total {
                let p = byte_percent(current, total, 1024);
                assert!(p >= last, "total={} current={}", total, current);
                last = p;
                current += (total / 37).max(1);
            }
            assert_eq!(byte_percent(total, total, 1024), 100);
        }
    }

    #[test]
    fn test_first_and_last_file_always_shown() {
        for total in 1..=5000u64 {
            assert!(should_show_file(1, total), "total={}", total);
            assert!(should_show_file(total, total), "total={}", total);
        }
    }

    #[test]
    fn test_file_milestones() {
        // 10% milestones for 50 files land on every 5th file
        assert!(should_show_file(5, 50));
        assert!(should_show_file(25, 50));
        // 5% milestones for 1000 files
        assert!(should_show_file(50, 1000));
        assert!(should_show_file(550, 1000));
    }

    #[test]
    fn test_file_sampling_thins_large_batches() {
        let shown = (1..=10_000u64).filter(|c| should_show_file(*c, 10_000)).count();
        assert!(shown < 10_000 / 40, "shown={}", shown);
        assert!(!should_show_file(7, 10_000));
        assert!(should_show_file(100, 10_000));

        let shown_small = (1..=10u64).filter(|c| should_show_file(*c, 10)).count();
        assert_eq!(shown_small, 10);
    }

    #[test]
    fn test_byte_milestones() {
        assert!(is_byte_milestone(0));
        assert!(is_byte_milestone(40));
        assert!(!is_byte_milestone(41));
        assert!(is_byte_milestone(96));
        assert!(is_byte_milestone(100));
    }

    #[test]
    fn test_describe() {
        let event = ProgressEvent::Files {
            label: "Upload".to_string(),
            current: 3,
            total: 10,
            name: "a.txt".to_string(),
            percent: 30,
        };
        assert_eq!(event.describe(), "Upload: 3/10 a.txt (30%)");
        assert_eq!(event.percent(), Some(30));
        assert!(event.is_transfer_progress());
    }
}
