//! Progress metrics and user-facing message rendering.

use crate::domain::av::probe::MediaInfo;
use crate::domain::telemetry::ProgressSnapshot;
use crate::error::JobError;
use std::time::Duration;

/// Width of the progress bar glyph, in cells.
pub const BAR_WIDTH: usize = 20;

/// Floor for the speed factor when estimating time remaining.
pub const SPEED_EPSILON: f64 = 0.01;

/// What the encode is measured against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub input_bytes: u64,
    /// Total media duration in seconds, when the probe found one.
    pub total_duration: Option<f64>,
}

impl Baseline {
    fn duration(&self) -> Option<f64> {
        self.total_duration.filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Values derived from a snapshot. Time-based fields are `None` when the
/// total duration is unknown, which leaves a size-only report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressMetrics {
    pub percent: Option<f64>,
    pub estimated_final_bytes: Option<u64>,
    pub compression_ratio: f64,
    /// Seconds of wall time left.
    pub eta: Option<f64>,
}

impl ProgressMetrics {
    pub fn compute(snapshot: &ProgressSnapshot, baseline: &Baseline) -> Self {
        let elapsed = snapshot.elapsed_time;
        let duration = baseline.duration();

        let percent = duration.map(|total| (elapsed / total * 100.0).clamp(0.0, 100.0));
        let estimated_final_bytes = duration
            .filter(|_| elapsed > 0.0)
            .map(|total| (snapshot.output_bytes as f64 * total / elapsed) as u64);
        let eta = duration
            .map(|total| (total - elapsed).max(0.0) / snapshot.speed_factor.max(SPEED_EPSILON));

        Self {
            percent,
            estimated_final_bytes,
            compression_ratio: baseline.input_bytes as f64 / snapshot.output_bytes.max(1) as f64,
            eta,
        }
    }
}

/// Human-readable byte size: two decimals below 10, one below 100, none above.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if size < 10.0 {
        format!("{:.2} {}", size, UNITS[unit])
    } else if size < 100.0 {
        format!("{:.1} {}", size, UNITS[unit])
    } else {
        format!("{} {}", size as u64, UNITS[unit])
    }
}

/// `HH:MM:SS`, truncating fractions. Negative or non-finite input renders as zero.
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((width as f64) * percent / 100.0) as usize;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(width - filled))
}

/// The live status text for one encoding job.
pub fn render_progress(
    name: &str,
    snapshot: &ProgressSnapshot,
    baseline: &Baseline,
    wall_elapsed: Duration,
) -> String {
    let metrics = ProgressMetrics::compute(snapshot, baseline);
    let mut text = format!("🔄 Encoding {}\n\n", name);

    match (metrics.percent, baseline.duration()) {
        (Some(percent), Some(total)) => {
            text.push_str(&format!(
                "{} {:.1}%\n",
                progress_bar(percent, BAR_WIDTH),
                percent
            ));
            text.push_str(&format!(
                "Duration: {} / {}\n",
                format_time(snapshot.elapsed_time),
                format_time(total)
            ));
        }
        _ => text.push_str(&format!(
            "Duration: {} / unknown\n",
            format_time(snapshot.elapsed_time)
        )),
    }

    text.push_str(&format!(
        "Frames: {} @ {:.1} FPS\n",
        snapshot.frame, snapshot.fps
    ));
    text.push_str(&format!("Quality: q={:.1}\n", snapshot.quality));

    let estimate = metrics
        .estimated_final_bytes
        .map(format_size)
        .unwrap_or_else(|| "calculating".to_string());
    text.push_str(&format!(
        "Size: {} (Est. Final: {})\n",
        format_size(snapshot.output_bytes),
        estimate
    ));
    text.push_str(&format!(
        "Compression: {:.2}x\n",
        metrics.compression_ratio
    ));
    text.push_str(&format!(
        "Bitrate: {:.1} kbps | Speed: {:.2}x\n",
        snapshot.bitrate, snapshot.speed_factor
    ));

    let eta = metrics
        .eta
        .map(format_time)
        .unwrap_or_else(|| "--:--:--".to_string());
    text.push_str(&format!(
        "ETA: {} | Elapsed: {}",
        eta,
        format_time(wall_elapsed.as_secs_f64())
    ));
    text
}

/// Probe summary posted before encoding starts.
pub fn render_input_info(name: &str, input_bytes: u64, info: &MediaInfo) -> String {
    format!(
        "📂 Input: {}\nSize: {}\nDuration: {}\nResolution: {}\nCodec: {}",
        name,
        format_size(input_bytes),
        info.duration
            .map(format_time)
            .unwrap_or_else(|| "unknown".to_string()),
        info.resolution().unwrap_or_else(|| "N/A".to_string()),
        info.codec.as_deref().unwrap_or("unknown"),
    )
}

/// Figures reported when a job succeeds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionReport {
    pub original_bytes: u64,
    pub final_bytes: u64,
    pub compression_ratio: f64,
    pub processing_time: Duration,
}

impl CompletionReport {
    pub fn new(original_bytes: u64, final_bytes: u64, processing_time: Duration) -> Self {
        Self {
            original_bytes,
            final_bytes,
            compression_ratio: original_bytes as f64 / final_bytes.max(1) as f64,
            processing_time,
        }
    }

    pub fn render(&self, name: &str) -> String {
        format!(
            "✅ Done: {}\n\nOriginal: {}\nFinal: {}\nRatio: {:.2}x\nTime: {}",
            name,
            format_size(self.original_bytes),
            format_size(self.final_bytes),
            self.compression_ratio,
            format_time(self.processing_time.as_secs_f64()),
        )
    }
}

pub fn render_failure(name: &str, error: &JobError) -> String {
    match error {
        JobError::Cancelled => format!("⏹ {} cancelled", name),
        other => format!("❌ {} failed\n{}", name, other),
    }
}

pub fn render_batch_summary(number: u32, succeeded: usize, failed: usize, cancelled: usize) -> String {
    let mut text = format!(
        "🎉 Batch #{} complete: {} succeeded, {} failed",
        number, succeeded, failed
    );
    if cancelled > 0 {
        text.push_str(&format!(", {} cancelled", cancelled));
    }
    text
}

/// Split `text` into pieces of at most `max_chars` characters, never inside a character.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for c in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncate to `max_chars` characters, for edit-in-place status text.
pub fn truncate_message(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(elapsed: f64, output_bytes: u64, speed: f64) -> ProgressSnapshot {
        ProgressSnapshot {
            elapsed_time: elapsed,
            output_bytes,
            speed_factor: speed,
            ..Default::default()
        }
    }

    #[test]
    fn test_percentage_is_time_based() {
        let baseline = Baseline {
            input_bytes: 1000,
            total_duration: Some(100.0),
        };
        let metrics = ProgressMetrics::compute(&snapshot(25.0, 10, 1.0), &baseline);
        assert!((metrics.percent.unwrap() - 25.0).abs() < 0.1);

        let over = ProgressMetrics::compute(&snapshot(130.0, 10, 1.0), &baseline);
        assert_eq!(over.percent, Some(100.0));
        assert_eq!(over.eta, Some(0.0));
    }

    #[test]
    fn test_derived_metrics() {
        let baseline = Baseline {
            input_bytes: 8_000_000,
            total_duration: Some(100.0),
        };
        let metrics = ProgressMetrics::compute(&snapshot(25.0, 1_000_000, 2.0), &baseline);

        assert_eq!(metrics.estimated_final_bytes, Some(4_000_000));
        assert_eq!(metrics.compression_ratio, 8.0);
        assert_eq!(metrics.eta, Some(37.5));
    }

    #[test]
    fn test_zero_speed_and_zero_output_do_not_divide_by_zero() {
        let baseline = Baseline {
            input_bytes: 500,
            total_duration: Some(10.0),
        };
        let metrics = ProgressMetrics::compute(&snapshot(0.0, 0, 0.0), &baseline);

        assert_eq!(metrics.estimated_final_bytes, None);
        assert_eq!(metrics.compression_ratio, 500.0);
        assert_eq!(metrics.eta, Some(10.0 / SPEED_EPSILON));
    }

    #[test]
    fn test_unknown_duration_degrades_to_size_only() {
        let baseline = Baseline {
            input_bytes: 2048,
            total_duration: None,
        };
        let snap = snapshot(12.0, 1024, 1.0);
        let metrics = ProgressMetrics::compute(&snap, &baseline);
        assert_eq!(metrics.percent, None);
        assert_eq!(metrics.eta, None);
        assert_eq!(metrics.estimated_final_bytes, None);

        let text = render_progress("a.mkv", &snap, &baseline, Duration::from_secs(3));
        assert!(text.contains("Duration: 00:00:12 / unknown"));
        assert!(text.contains("Size: 1.00 KB (Est. Final: calculating)"));
        assert!(!text.contains('%'));
    }

    #[test]
    fn test_render_progress() {
        let baseline = Baseline {
            input_bytes: 4 * 1024 * 1024,
            total_duration: Some(100.0),
        };
        let mut snap = snapshot(25.0, 1024 * 1024, 1.02);
        snap.frame = 600;
        snap.fps = 23.9;
        snap.bitrate = 512.0;

        let text = render_progress("ep1.mkv", &snap, &baseline, Duration::from_secs(30));
        assert!(text.starts_with("🔄 Encoding ep1.mkv"));
        assert!(text.contains("[█████░░░░░░░░░░░░░░░] 25.0%"));
        assert!(text.contains("Duration: 00:00:25 / 00:01:40"));
        assert!(text.contains("Frames: 600 @ 23.9 FPS"));
        assert!(text.contains("Size: 1.00 MB (Est. Final: 4.00 MB)"));
        assert!(text.contains("Compression: 4.00x"));
        assert!(text.contains("Bitrate: 512.0 kbps | Speed: 1.02x"));
        assert!(text.contains("ETA: 00:01:13 | Elapsed: 00:00:30"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(50 * 1024 * 1024), "50.0 MB");
        assert_eq!(format_size(700 * 1024 * 1024), "700 MB");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "00:00:00");
        assert_eq!(format_time(3725.9), "01:02:05");
        assert_eq!(format_time(-3.0), "00:00:00");
        assert_eq!(format_time(f64::INFINITY), "00:00:00");
    }

    #[test]
    fn test_progress_bar_is_fixed_width() {
        assert_eq!(progress_bar(0.0, 4), "[░░░░]");
        assert_eq!(progress_bar(50.0, 4), "[██░░]");
        assert_eq!(progress_bar(250.0, 4), "[████]");
    }

    #[test]
    fn test_chunk_message_respects_char_boundaries() {
        let chunks = chunk_message("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
        assert_eq!(chunk_message("", 10), vec![""]);
        assert_eq!(chunk_message("abcd", 2), vec!["ab", "cd"]);
    }

    #[test]
    fn test_completion_report() {
        let report = CompletionReport::new(10 * 1024 * 1024, 2 * 1024 * 1024, Duration::from_secs(65));
        assert_eq!(report.compression_ratio, 5.0);
        let text = report.render("ep1.mkv");
        assert!(text.contains("Original: 10.0 MB"));
        assert!(text.contains("Final: 2.00 MB"));
        assert!(text.contains("Ratio: 5.00x"));
        assert!(text.contains("Time: 00:01:05"));
    }

    #[test]
    fn test_batch_summary() {
        assert_eq!(
            render_batch_summary(3, 4, 1, 0),
            "🎉 Batch #3 complete: 4 succeeded, 1 failed"
        );
        assert!(render_batch_summary(3, 0, 0, 2).ends_with(", 2 cancelled"));
    }
}
