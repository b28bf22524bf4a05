//! External encoder process.
//!
//! The encoder is any program that reads raw PCM on standard input and writes an encoded
//! stream to standard output. Its output is never parsed; the accumulator only cuts it into
//! chunks.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::{PcmFormat, StreamRelayError};

/// Program and arguments used to launch the encoder.
///
/// # Example
///
/// ```
/// use stream_relay::EncoderConfig;
///
/// let config = EncoderConfig::default();
/// assert_eq!(config.program, "oggenc2");
/// assert!(config.args.contains(&"--raw".to_string()));
///
/// let lame = EncoderConfig::new("lame")
///     .args(["-r", "--float", "-s", "48", "-", "-"]);
/// assert_eq!(lame.args.len(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Program to launch, looked up on `PATH` when not absolute.
    pub program: String,

    /// Command-line arguments.
    pub args: Vec<String>,

    /// PCM layout the program expects on standard input.
    pub input: PcmFormat,
}

impl EncoderConfig {
    /// Creates a config for `program` with no arguments and the default input format.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: PcmFormat::default(),
        }
    }

    /// Ogg Vorbis via `oggenc2`: raw 48kHz float input, resampled to 44.1kHz.
    pub fn oggenc() -> Self {
        Self::new("oggenc2").args([
            "--raw",
            "--raw-format=3",
            "--raw-rate=48000",
            "--resample",
            "44100",
            "-",
        ])
    }

    /// `cat`: forwards the converted PCM unchanged.
    ///
    /// Handy for diagnostics, and for exercising the pipeline without an encoder installed.
    pub fn passthrough() -> Self {
        Self::new("cat")
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the PCM layout written to the program.
    #[must_use]
    pub fn input(mut self, input: PcmFormat) -> Self {
        self.input = input;
        self
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::oggenc()
    }
}

/// A running encoder with its standard input and output redirected.
///
/// The child is killed if this handle is dropped without [`finish()`](Self::finish).
#[derive(Debug)]
pub struct EncoderProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl EncoderProcess {
    /// Launches the encoder.
    pub fn spawn(config: &EncoderConfig) -> Result<Self, StreamRelayError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamRelayError::EncoderSpawn {
                program: config.program.clone(),
                source,
            })?;

        tracing::info!(
            program = %config.program,
            pid = child.id(),
            sample_rate = config.input.sample_rate,
            channels = config.input.channels,
            "encoder started"
        );

        Ok(Self {
            program: config.program.clone(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
        })
    }

    /// Returns the program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the OS process id, if the process has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Takes the encoder's standard input. Dropping it closes the pipe.
    pub fn take_stdin(&mut self) -> Result<ChildStdin, StreamRelayError> {
        self.stdin.take().ok_or_else(|| StreamRelayError::EncoderPipe {
            program: self.program.clone(),
            pipe: "stdin",
        })
    }

    /// Takes the encoder's standard output.
    pub fn take_stdout(&mut self) -> Result<ChildStdout, StreamRelayError> {
        self.stdout.take().ok_or_else(|| StreamRelayError::EncoderPipe {
            program: self.program.clone(),
            pipe: "stdout",
        })
    }

    /// Waits for the encoder to exit on its own.
    ///
    /// Closes standard input first if it was never taken. If the process is still running
    /// after `timeout` it is killed and [`StreamRelayError::EncoderTimeout`] is returned.
    /// A non-zero exit is [`StreamRelayError::EncoderExit`].
    pub async fn finish(mut self, timeout: Duration) -> Result<ExitStatus, StreamRelayError> {
        drop(self.stdin.take());

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status.map_err(StreamRelayError::EncoderIo)?,
            Err(_) => {
                tracing::warn!(program = %self.program, ?timeout, "encoder did not exit, killing it");
                self.child.kill().await.map_err(StreamRelayError::EncoderIo)?;
                return Err(StreamRelayError::EncoderTimeout {
                    program: self.program,
                    timeout,
                });
            }
        };

        if status.success() {
            tracing::info!(program = %self.program, %status, "encoder exited");
            Ok(status)
        } else {
            tracing::warn!(program = %self.program, %status, "encoder failed");
            Err(StreamRelayError::EncoderExit {
                program: self.program,
                status,
            })
        }
    }

    /// Kills the encoder and reaps it.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(program = %self.program, "kill failed: {e}");
        }
    }
}
