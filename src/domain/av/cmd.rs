//! Argument vectors for the probe and encode tools.
//!
//! User parameters are split into tokens with shell-like quoting rules and
//! passed as separate arguments. Nothing here is ever handed to a shell.

use crate::error::ParameterError;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Flags placed before the input: quiet banner, info-level diagnostics,
/// periodic stats lines, and overwrite of an existing output.
pub const ENCODE_PREAMBLE: [&str; 5] = ["-hide_banner", "-loglevel", "info", "-stats", "-y"];

/// Stream and format entries requested from the probe tool.
const PROBE_ENTRIES: &str = "stream=width,height,r_frame_rate,avg_frame_rate,duration,bit_rate,nb_frames,codec_name:format=duration,bit_rate,size";

/// The user-supplied encode argument string, kept alongside its tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodeParameters {
    raw: String,
    tokens: Vec<String>,
}

impl EncodeParameters {
    pub fn parse(raw: &str) -> Result<Self, ParameterError> {
        let raw = raw.trim();
        Ok(Self {
            tokens: tokenize(raw)?,
            raw: raw.to_string(),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

/// Example parameter strings shown when the user asks for help.
pub fn parameter_examples() -> &'static [&'static str] {
    &[
        "-vf scale=1280:720 -c:v libx264 -crf 23",
        "-q:v 2 -preset slow",
        "-c:v copy -c:a copy",
    ]
}

/// Split `raw` into arguments.
///
/// Whitespace separates tokens. Single quotes keep their content literally.
/// Double quotes allow `\"` and `\\` escapes. Outside quotes a backslash
/// escapes the next character.
pub fn tokenize(raw: &str) -> Result<Vec<String>, ParameterError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // A token exists as soon as anything (even an empty quote pair) was seen.
    let mut in_token = false;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(ParameterError::UnterminatedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(ParameterError::UnterminatedQuote('"')),
                        },
                        Some(c) => current.push(c),
                        None => return Err(ParameterError::UnterminatedQuote('"')),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(c) => {
                    in_token = true;
                    current.push(c);
                }
                None => return Err(ParameterError::TrailingEscape),
            },
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Arguments for the metadata probe, selecting the first video stream and
/// asking for JSON output.
pub fn probe_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        PROBE_ENTRIES,
        "-of",
        "json",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(input.as_os_str().to_owned());
    args
}

/// A fully built encode call, minus the program path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeInvocation {
    pub input: PathBuf,
    pub output: PathBuf,
    pub args: Vec<OsString>,
}

impl EncodeInvocation {
    pub fn build(input: &Path, parameters: &EncodeParameters, output: &Path) -> Self {
        let mut args: Vec<OsString> = ENCODE_PREAMBLE.iter().map(OsString::from).collect();
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
        args.extend(parameters.tokens().iter().map(OsString::from));
        args.push(output.as_os_str().to_owned());

        Self {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            args,
        }
    }

    /// Printable command line for logs. Arguments with spaces are single-quoted.
    pub fn command_line(&self, program: &str) -> String {
        let mut line = program.to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('\'') {
                line.push('\'');
                line.push_str(&arg.replace('\'', r"'\''"));
                line.push('\'');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

/// Output file name: original base name, branding suffix, then the configured
/// extension (or the input's own extension when none is configured).
pub fn output_file_name(original_name: &str, suffix: &str, extension: Option<&str>) -> String {
    let original = Path::new(original_name);
    let base = original
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "output".to_string());
    let extension = extension
        .map(str::to_string)
        .or_else(|| {
            original
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "mkv".to_string());

    format!("{}{}.{}", base, suffix, extension.trim_start_matches('.'))
}
