use serde::Serialize;
use serde_json::Value;

/// Metadata extracted from the probe tool's JSON output.
///
/// Every field is optional: a probe that ran but returned odd data degrades
/// to missing values rather than failing the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaInfo {
    /// Seconds. `None` when neither the stream nor the container reports it.
    pub duration: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub bit_rate: Option<u64>,
    pub codec: Option<String>,
}

impl MediaInfo {
    /// Parse probe stdout. Unparseable output yields an empty `MediaInfo`.
    pub fn from_probe_output(stdout: &str) -> Self {
        match serde_json::from_str::<Value>(stdout) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::default(),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let stream = value
            .get("streams")
            .and_then(|streams| streams.as_array())
            .and_then(|streams| streams.first());
        let format = value.get("format");

        // Stream value first, container value when the stream one is absent or unusable.
        let field = |name: &str, valid: fn(f64) -> bool| {
            [stream, format]
                .into_iter()
                .flatten()
                .filter_map(|source| source.get(name).and_then(number))
                .find(|v| v.is_finite() && valid(*v))
        };

        Self {
            duration: field("duration", |d| d > 0.0),
            width: stream
                .and_then(|s| s.get("width"))
                .and_then(|v| v.as_u64())
                .and_then(|w| u32::try_from(w).ok()),
            height: stream
                .and_then(|s| s.get("height"))
                .and_then(|v| v.as_u64())
                .and_then(|h| u32::try_from(h).ok()),
            frame_rate: stream
                .and_then(|s| s.get("r_frame_rate").or_else(|| s.get("avg_frame_rate")))
                .and_then(|v| v.as_str())
                .and_then(parse_rate),
            bit_rate: field("bit_rate", |b| b >= 0.0).map(|b| b as u64),
            codec: stream
                .and_then(|s| s.get("codec_name"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    pub fn resolution(&self) -> Option<String> {
        Some(format!("{}x{}", self.width?, self.height?))
    }
}

/// ffprobe reports most numbers as strings; accept both forms.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a frame rate like `30000/1001` or `25`.
pub fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_full_probe() {
        let probe = json!({
            "streams": [{
                "codec_name": "h264",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30000/1001",
                "duration": "120.500000",
                "bit_rate": "5000000"
            }],
            "format": { "duration": "121.0", "bit_rate": "5200000", "size": "78000000" }
        });
        let info = MediaInfo::from_value(&probe);

        assert_eq!(info.codec.as_deref(), Some("h264"));
        assert_eq!(info.resolution().as_deref(), Some("1920x1080"));
        assert_eq!(info.duration, Some(120.5));
        assert_eq!(info.bit_rate, Some(5_000_000));
        assert!((info.frame_rate.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_duration_falls_back_to_format() {
        // Matroska streams usually carry no per-stream duration.
        let probe = json!({
            "streams": [{ "codec_name": "hevc", "width": 1280, "height": 720, "r_frame_rate": "24/1" }],
            "format": { "duration": "42.0" }
        });
        let info = MediaInfo::from_value(&probe);
        assert_eq!(info.duration, Some(42.0));
        assert_eq!(info.frame_rate, Some(24.0));
    }

    #[test]
    fn test_unusable_stream_duration_falls_back_to_format() {
        let probe = json!({
            "streams": [{ "codec_name": "h264", "duration": "N/A", "bit_rate": "N/A" }],
            "format": { "duration": "95.5", "bit_rate": "800000" }
        });
        let info = MediaInfo::from_value(&probe);
        assert_eq!(info.duration, Some(95.5));
        assert_eq!(info.bit_rate, Some(800_000));

        let probe = json!({
            "streams": [{ "duration": "0.000000" }],
            "format": { "duration": "12.0" }
        });
        assert_eq!(MediaInfo::from_value(&probe).duration, Some(12.0));
    }

    #[test]
    fn test_missing_or_bad_fields_degrade() {
        let probe = json!({
            "streams": [{ "width": "wide", "r_frame_rate": "0/0", "duration": "N/A" }],
            "format": {}
        });
        let info = MediaInfo::from_value(&probe);
        assert_eq!(info.duration, None);
        assert_eq!(info.width, None);
        assert_eq!(info.frame_rate, None);
        assert_eq!(info.resolution(), None);
        assert_eq!(info.codec, None);
    }

    #[test]
    fn test_unparseable_output_is_empty_info() {
        assert_eq!(MediaInfo::from_probe_output("not json"), MediaInfo::default());
        assert_eq!(MediaInfo::from_probe_output("{}"), MediaInfo::default());
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("50/2"), Some(25.0));
        assert_eq!(parse_rate("1/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }
}
