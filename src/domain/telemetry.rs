//! Encoder diagnostic output parsing.
//!
//! The encoder prints stats lines such as
//! `frame=  120 fps=23.9 q=28.0 size=    2048kB time=00:00:05.00 bitrate= 512.0kbits/s dup=0 drop=1 speed=1.02x`.
//! Each field is matched on its own; a line may carry any subset of them.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Latest known metrics for one job. Fields are sticky: a line that does not
/// mention a field leaves it as it was.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub frame: u64,
    pub fps: f64,
    /// Seconds of media encoded so far. Never decreases.
    pub elapsed_time: f64,
    /// kbit/s
    pub bitrate: f64,
    pub speed_factor: f64,
    pub output_bytes: u64,
    pub quality: f64,
    pub duplicate_frames: u64,
    pub dropped_frames: u64,
    /// Bumped on every update that changed at least one field.
    pub sequence: u64,
}

/// Values recognised in a single line, before plausibility checks against the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time: Option<f64>,
    pub bitrate: Option<f64>,
    pub speed: Option<f64>,
    pub size_bytes: Option<u64>,
    pub quality: Option<f64>,
    pub dup: Option<u64>,
    pub drop: Option<u64>,
}

impl ParsedLine {
    pub fn is_empty(&self) -> bool {
        *self == ParsedLine::default()
    }
}

struct Patterns {
    frame: Regex,
    fps: Regex,
    time: Regex,
    bitrate: Regex,
    speed: Regex,
    size: Regex,
    quality: Regex,
    dup: Regex,
    drop: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("telemetry pattern is valid");
        Patterns {
            frame: re(r"\bframe=\s*(\d+)"),
            fps: re(r"\bfps=\s*([\d.]+)"),
            time: re(r"\btime=\s*(\d+):(\d{1,2}):(\d{1,2}(?:\.\d+)?)"),
            bitrate: re(r"\bbitrate=\s*([\d.]+)\s*kbits/s"),
            speed: re(r"\bspeed=\s*([\d.]+)\s*x"),
            size: re(r"\bL?size=\s*(\d+)\s*(?:kB|KiB)"),
            quality: re(r"\bq=\s*(-?[\d.]+)"),
            dup: re(r"\bdup=\s*(\d+)"),
            drop: re(r"\bdrop=\s*(\d+)"),
        }
    })
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Non-negative finite floats only; anything else is treated as absent.
fn plausible_f64(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parse `H:MM:SS.ff` into seconds.
pub fn parse_clock(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let hours: f64 = hours.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    if hours < 0.0 || minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Extract every recognised field from one diagnostic line.
pub fn parse_line(line: &str) -> ParsedLine {
    let p = patterns();

    let time = p.time.captures(line).and_then(|caps| {
        parse_clock(
            caps.get(1)?.as_str(),
            caps.get(2)?.as_str(),
            caps.get(3)?.as_str(),
        )
    });

    ParsedLine {
        frame: capture(&p.frame, line).and_then(|v| v.parse().ok()),
        fps: capture(&p.fps, line).and_then(plausible_f64),
        time,
        bitrate: capture(&p.bitrate, line).and_then(plausible_f64),
        speed: capture(&p.speed, line).and_then(plausible_f64),
        size_bytes: capture(&p.size, line)
            .and_then(|v| v.parse::<u64>().ok())
            .and_then(|kb| kb.checked_mul(1024)),
        quality: capture(&p.quality, line).and_then(plausible_f64),
        dup: capture(&p.dup, line).and_then(|v| v.parse().ok()),
        drop: capture(&p.drop, line).and_then(|v| v.parse().ok()),
    }
}

impl ProgressSnapshot {
    /// Fold one diagnostic line into the snapshot. Returns whether anything changed.
    ///
    /// A line whose `time=` would move progress backwards is out of order and
    /// is discarded as a whole.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let parsed = parse_line(line);
        if parsed.is_empty() {
            return false;
        }
        if matches!(parsed.time, Some(t) if t < self.elapsed_time) {
            return false;
        }

        let mut changed = false;
        set_if_changed(&mut self.frame, parsed.frame, &mut changed);
        set_if_changed(&mut self.fps, parsed.fps, &mut changed);
        set_if_changed(&mut self.elapsed_time, parsed.time, &mut changed);
        set_if_changed(&mut self.bitrate, parsed.bitrate, &mut changed);
        set_if_changed(&mut self.speed_factor, parsed.speed, &mut changed);
        set_if_changed(&mut self.output_bytes, parsed.size_bytes, &mut changed);
        set_if_changed(&mut self.quality, parsed.quality, &mut changed);
        set_if_changed(&mut self.duplicate_frames, parsed.dup, &mut changed);
        set_if_changed(&mut self.dropped_frames, parsed.drop, &mut changed);

        if changed {
            self.sequence += 1;
        }
        changed
    }
}

fn set_if_changed<T: PartialEq>(field: &mut T, value: Option<T>, changed: &mut bool) {
    if let Some(value) = value {
        if *field != value {
            *field = value;
            *changed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "frame=120 fps=23.9 time=00:00:05.00 bitrate=512.0kbits/s speed=1.02x size=2048kB";

    #[test]
    fn test_apply_line_extracts_all_fields() {
        let mut snapshot = ProgressSnapshot::default();
        assert!(snapshot.apply_line(STATS));

        assert_eq!(snapshot.frame, 120);
        assert_eq!(snapshot.fps, 23.9);
        assert_eq!(snapshot.elapsed_time, 5.0);
        assert_eq!(snapshot.bitrate, 512.0);
        assert_eq!(snapshot.speed_factor, 1.02);
        assert_eq!(snapshot.output_bytes, 2_097_152);
        assert_eq!(snapshot.sequence, 1);
    }

    #[test]
    fn test_real_encoder_line() {
        let line = "frame= 2412 fps= 48 q=28.0 size=   10240KiB time=00:01:40.48 bitrate= 834.8kbits/s dup=3 drop=7 speed=1.93x    ";
        let mut snapshot = ProgressSnapshot::default();
        assert!(snapshot.apply_line(line));

        assert_eq!(snapshot.frame, 2412);
        assert_eq!(snapshot.fps, 48.0);
        assert_eq!(snapshot.quality, 28.0);
        assert_eq!(snapshot.output_bytes, 10240 * 1024);
        assert!((snapshot.elapsed_time - 100.48).abs() < 1e-9);
        assert_eq!(snapshot.bitrate, 834.8);
        assert_eq!(snapshot.duplicate_frames, 3);
        assert_eq!(snapshot.dropped_frames, 7);
        assert_eq!(snapshot.speed_factor, 1.93);
    }

    #[test]
    fn test_fields_are_sticky() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.apply_line(STATS);
        assert!(snapshot.apply_line("frame=130"));

        assert_eq!(snapshot.frame, 130);
        assert_eq!(snapshot.elapsed_time, 5.0);
        assert_eq!(snapshot.output_bytes, 2_097_152);
        assert_eq!(snapshot.sequence, 2);
    }

    #[test]
    fn test_unrelated_and_duplicate_lines_change_nothing() {
        let mut snapshot = ProgressSnapshot::default();
        assert!(!snapshot.apply_line("Stream #0:0: Video: h264 (High), yuv420p, 1920x1080"));
        assert!(!snapshot.apply_line("  Duration: 00:10:00.00, start: 0.000000, bitrate: 5000 kb/s"));
        assert!(snapshot.apply_line(STATS));
        assert!(!snapshot.apply_line(STATS));
        assert_eq!(snapshot.sequence, 1);
    }

    #[test]
    fn test_out_of_order_time_is_discarded() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.apply_line("frame=300 time=00:00:10.00");
        assert!(!snapshot.apply_line("frame=150 time=00:00:05.00"));

        assert_eq!(snapshot.frame, 300);
        assert_eq!(snapshot.elapsed_time, 10.0);
    }

    #[test]
    fn test_elapsed_time_never_decreases() {
        let lines = [
            "time=00:00:01.00",
            "time=00:00:03.50",
            "time=00:00:02.00",
            "time=00:00:03.50",
            "time=-577014:32:22.77",
            "time=00:00:04.00",
        ];
        let mut snapshot = ProgressSnapshot::default();
        let mut last = 0.0;
        for line in lines {
            snapshot.apply_line(line);
            assert!(snapshot.elapsed_time >= last);
            last = snapshot.elapsed_time;
        }
        assert_eq!(last, 4.0);
    }

    #[test]
    fn test_malformed_and_implausible_values_are_ignored() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.apply_line(STATS);

        assert!(!snapshot.apply_line("fps=1.2.3 speed=N/A bitrate=N/A size=N/A time=N/A"));
        assert!(!snapshot.apply_line("q=-1.0"));
        assert!(!snapshot.apply_line("time=00:99:00.00"));
        assert_eq!(
            parse_line("frame=    0 fps=0.0 q=0.0 size=       0kB time=-00:00:00.04 bitrate=N/A speed=N/A").time,
            None
        );
        assert_eq!(snapshot.fps, 23.9);
        assert_eq!(snapshot.quality, 0.0);
        assert_eq!(snapshot.elapsed_time, 5.0);
    }

    #[test]
    fn test_parse_line_ignores_lookalike_keys() {
        let parsed = parse_line("freq=44100 Lsize=4096kB");
        assert_eq!(parsed.quality, None);
        assert_eq!(parsed.size_bytes, Some(4096 * 1024));
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("01", "30", "00.00"), Some(5400.0));
        assert_eq!(parse_clock("0", "01", "30.5"), Some(90.5));
        assert_eq!(parse_clock("0", "00", "61"), None);
    }
}
