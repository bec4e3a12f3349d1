//! Runs the external transcoder for one task.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use process_utils::{Dialect, split_command_line, tokio_command};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::parser::{ProgressParser, TranscodeProgress};
use super::records::RecordReader;
use crate::{Error, Result};

/// Flag appended to every invocation so FFmpeg emits machine readable progress
/// on the diagnostic channel.
const PROGRESS_ARGS: [&str; 2] = ["-progress", "pipe:2"];

/// Invokes the configured transcoder binary.
#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: PathBuf,
}

impl Transcoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Build the argument vector for a resolved command line.
    pub fn build_args(command_line: &str) -> Result<Vec<String>> {
        let mut args = split_command_line(command_line, Dialect::native())?;
        args.extend(PROGRESS_ARGS.iter().map(|s| s.to_string()));
        Ok(args)
    }

    /// Run the transcoder to completion.
    ///
    /// `on_progress` is invoked for every parsed progress record, in output
    /// order. When `cancel` fires the child is killed and its exit awaited; the
    /// returned error then carries whatever diagnostic output was captured, and
    /// it is up to the caller to tell cancellation apart from failure.
    pub async fn run(
        &self,
        command_line: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(TranscodeProgress) + Send + Sync),
    ) -> Result<()> {
        let args = Self::build_args(command_line)?;
        debug!(binary = %self.binary.display(), ?args, "Spawning transcoder");

        let mut child = tokio_command(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "failed to start transcoder {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("transcoder stderr was not captured".to_string()))?;

        let read_output = async {
            let mut reader = RecordReader::new(BufReader::new(stderr));
            let mut parser = ProgressParser::new();
            let mut transcript = String::new();
            loop {
                match reader.next_record().await {
                    Ok(Some(record)) => {
                        if let Some(progress) = parser.feed(&record) {
                            on_progress(progress);
                        }
                        transcript.push_str(&record);
                        transcript.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Error reading transcoder output");
                        break;
                    }
                }
            }
            transcript
        };

        let wait_exit = async {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    debug!("Cancellation requested, killing transcoder");
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to kill transcoder");
                    }
                    child.wait().await
                }
            }
        };

        let (transcript, status) = tokio::join!(read_output, wait_exit);
        let status = status
            .map_err(|e| Error::Process(format!("failed to wait for transcoder: {}", e)))?;

        if status.success() && !cancel.is_cancelled() {
            Ok(())
        } else if transcript.is_empty() {
            Err(Error::Transcoder(format!("transcoder exited with {}", status)))
        } else {
            Err(Error::Transcoder(transcript))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_appends_progress_flag() {
        let args = Transcoder::build_args("-i in.mp4 -c copy out.mp4").unwrap();
        assert_eq!(args, vec![
            "-i", "in.mp4", "-c", "copy", "out.mp4", "-progress", "pipe:2"
        ]);
    }

    #[test]
    fn test_build_args_rejects_unclosed_quote() {
        let err = Transcoder::build_args("-i \"in.mp4").unwrap_err();
        assert!(matches!(err, Error::CommandLine(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_process_error() {
        let transcoder = Transcoder::new("/definitely/not/a/transcoder");
        let cancel = CancellationToken::new();
        let err = transcoder
            .run("-i a.mp4 b.mp4", &cancel, &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_transcript_keeps_every_record() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("transcoder");
        std::fs::write(
            &binary,
            "#!/bin/sh\n\
             echo '  Duration: 00:00:10.00, start: 0' >&2\n\
             echo 'frame=5 time=00:00:02.00 speed=1x' >&2\n\
             echo 'boom' >&2\n\
             exit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let reported = parking_lot::Mutex::new(Vec::new());
        let err = Transcoder::new(&binary)
            .run("-i a.mp4 b.mp4", &CancellationToken::new(), &|p| {
                reported.lock().push(p)
            })
            .await
            .unwrap_err();

        let Error::Transcoder(transcript) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(
            transcript,
            "Duration: 00:00:10.00, start: 0\nframe=5 time=00:00:02.00 speed=1x\nboom\n"
        );
        assert_eq!(reported.lock().len(), 1);
    }
}
