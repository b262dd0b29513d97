use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use crate::{error::RelayError, types::Platform};

/// Container every output leg is muxed into.
const STREAM_FORMAT: &str = "flv";
const AUDIO_CODEC: &str = "aac";
const AUDIO_BITRATE: &str = "128k";
const AUDIO_RATE: &str = "44100";

/// Program plus arguments for one relay process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Turns a source file and its platforms into a relay invocation.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, source: &Path, platforms: &[Platform]) -> Result<Invocation, RelayError>;
}

impl<F> CommandBuilder for F
where
    F: Fn(&Path, &[Platform]) -> Result<Invocation, RelayError> + Send + Sync,
{
    fn build(&self, source: &Path, platforms: &[Platform]) -> Result<Invocation, RelayError> {
        self(source, platforms)
    }
}

/// Output URLs of every relayable platform, in order.
pub fn resolve_outputs(platforms: &[Platform]) -> Result<Vec<String>, RelayError> {
    if platforms.is_empty() {
        return Err(RelayError::InvalidConfiguration {
            reason: "no platforms configured".to_string(),
        });
    }
    let outputs: Vec<String> = platforms.iter().filter_map(Platform::output_url).collect();
    if outputs.is_empty() {
        return Err(RelayError::InvalidConfiguration {
            reason: format!(
                "none of the {} platforms has a usable destination",
                platforms.len()
            ),
        });
    }
    Ok(outputs)
}

/// ffmpeg based relay: video is copied, audio re-encoded, one process per stream.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CommandBuilder for FfmpegCommand {
    fn build(&self, source: &Path, platforms: &[Platform]) -> Result<Invocation, RelayError> {
        let outputs = resolve_outputs(platforms)?;

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-re".into(),
            "-i".into(),
            source.to_string_lossy().into_owned(),
        ];

        if let [url] = outputs.as_slice() {
            args.extend(codec_args());
            args.extend([
                "-f".into(),
                STREAM_FORMAT.into(),
                "-flvflags".into(),
                "no_duration_filesize".into(),
                url.clone(),
            ]);
        } else {
            args.extend(["-map".into(), "0:v?".into(), "-map".into(), "0:a?".into()]);
            args.extend(codec_args());
            let legs = outputs
                .iter()
                .map(|url| format!("[f={}:onfail=ignore]{}", STREAM_FORMAT, url))
                .collect::<Vec<_>>()
                .join("|");
            args.extend(["-f".into(), "tee".into(), legs]);
        }

        Ok(Invocation {
            program: self.program.to_string_lossy().into_owned(),
            args,
        })
    }
}

fn codec_args() -> [String; 8] {
    [
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        AUDIO_CODEC.into(),
        "-b:a".into(),
        AUDIO_BITRATE.into(),
        "-ar".into(),
        AUDIO_RATE.into(),
    ]
}

#[cfg(test)]
#[path = "command_test.rs"]
mod command_test;
