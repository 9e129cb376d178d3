//! Configuration loaded from the environment.

use crate::adapters::retry::RetryPolicy;
use crate::application::controller::ControllerSettings;
use crate::application::runner::RunnerSettings;
use crate::application::scheduler::AdmissionPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Root for job workspaces and staged uploads
    pub work_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Jobs of one batch allowed in flight at once
    pub max_concurrent: usize,
    /// Delay between admissions of the first cohort
    pub start_delay: Duration,
    /// Minimum time between two progress renders of one job
    pub render_interval: Duration,
    /// Branding suffix appended to output file names
    pub output_suffix: String,
    /// `None` keeps the input's extension
    pub output_extension: Option<String>,
    pub error_tail_lines: usize,
    pub max_message_len: usize,
    pub download_retries: u32,
    pub download_backoff: Duration,
    /// How long a nuke waits for killed jobs to report back
    pub nuke_grace: Duration,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values use defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| Duration::from_secs(parsed(&lookup, key, default));

        let output_extension = string("OUTPUT_EXTENSION", "mkv");
        let output_extension = output_extension.trim().trim_start_matches('.');

        Self {
            addr: string("ADDR", "127.0.0.1"),
            port: string("PORT", "3000"),
            work_dir: PathBuf::from(string("WORK_DIR", "./downloads")),
            ffmpeg_path: string("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: string("FFPROBE_PATH", "ffprobe"),
            max_concurrent: parsed(&lookup, "MAX_CONCURRENT", 5usize).max(1),
            start_delay: secs("START_DELAY_SECS", 10),
            render_interval: secs("RENDER_INTERVAL_SECS", 2),
            output_suffix: string("OUTPUT_SUFFIX", "_processed"),
            output_extension: (!output_extension.is_empty()).then(|| output_extension.to_string()),
            error_tail_lines: parsed(&lookup, "ERROR_TAIL_LINES", 20),
            max_message_len: parsed(&lookup, "MAX_MESSAGE_LEN", 4096usize).max(1),
            download_retries: parsed(&lookup, "DOWNLOAD_RETRIES", 3),
            download_backoff: secs("DOWNLOAD_BACKOFF_SECS", 5),
            nuke_grace: secs("NUKE_GRACE_SECS", 5),
        }
    }

    /// Where multipart uploads are written before they join a batch.
    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("uploads")
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            render_interval: self.render_interval,
            output_suffix: self.output_suffix.clone(),
            output_extension: self.output_extension.clone(),
            error_tail_lines: self.error_tail_lines,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            concurrency_limit: self.max_concurrent,
            stagger: self.start_delay,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            work_dir: self.work_dir.clone(),
            admission: self.admission_policy(),
            nuke_grace: self.nuke_grace,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.download_retries,
            backoff: self.download_backoff,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.addr, "127.0.0.1");
        assert_eq!(config.port, "3000");
        assert_eq!(config.work_dir, PathBuf::from("./downloads"));
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.start_delay, Duration::from_secs(10));
        assert_eq!(config.render_interval, Duration::from_secs(2));
        assert_eq!(config.output_extension.as_deref(), Some("mkv"));
        assert_eq!(config.max_message_len, 4096);
        assert_eq!(config.download_retries, 3);
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = config_with(&[
            ("MAX_CONCURRENT", "0"),
            ("START_DELAY_SECS", "not a number"),
            ("OUTPUT_EXTENSION", ".webm"),
            ("OUTPUT_SUFFIX", " @Brand"),
            ("ERROR_TAIL_LINES", " 5 "),
        ]);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.start_delay, Duration::from_secs(10));
        assert_eq!(config.output_extension.as_deref(), Some("webm"));
        assert_eq!(config.output_suffix, " @Brand");
        assert_eq!(config.error_tail_lines, 5);
    }

    #[test]
    fn test_empty_extension_keeps_input_extension() {
        let config = config_with(&[("OUTPUT_EXTENSION", "")]);
        assert_eq!(config.output_extension, None);
        assert_eq!(config.runner_settings().output_extension, None);
    }

    #[test]
    fn test_derived_views() {
        let config = config_with(&[("MAX_CONCURRENT", "2"), ("DOWNLOAD_BACKOFF_SECS", "1")]);
        assert_eq!(config.admission_policy().concurrency_limit, 2);
        assert_eq!(config.admission_policy().stagger, Duration::from_secs(10));
        assert_eq!(config.retry_policy().backoff, Duration::from_secs(1));
        assert_eq!(config.staging_dir(), PathBuf::from("./downloads/uploads"));
    }
}
