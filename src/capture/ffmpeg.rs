//! Decoder subprocess plumbing shared by the streamers.
//!
//! A streamer is a `StreamerCore` plus a reader loop. The core owns the
//! channels, the stop signal and the child process; the reader loop only
//! decides how frames are paced and what happens when the consumer is slow.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::CaptureError;
use crate::frame::{Frame, PixelFormat};
use crate::signal::{lock, StopSignal};

/// Upper bound on how long `stop()` waits for the reader thread after killing the decoder.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const STDERR_TAIL_LINES: usize = 8;

/// An external executable plus arguments that always precede the call-specific ones.
///
/// Leading arguments allow wrappers (`nice -n 10 ffmpeg`, a container runner,
/// a test script interpreter) without changing the call sites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalTool {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }

    /// A `Command` with the program and leading arguments applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }

    pub(crate) fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Rolling copy of the last lines a child wrote to stderr.
#[derive(Clone, Default)]
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    /// Drain `stderr` on a background thread until the child closes it.
    fn follow(&self, stderr: ChildStderr, program: String) {
        let lines = Arc::clone(&self.lines);
        let spawned = thread::Builder::new()
            .name("decoder-stderr".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::debug!("{}: {}", program, line);
                    let mut tail = lock(&lines);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        if let Err(err) = spawned {
            log::warn!("cannot follow decoder stderr: {}", err);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        lock(&self.lines).iter().cloned().collect()
    }
}

/// The decoder child process. Killed and reaped at most once.
pub(crate) struct DecodeProcess {
    program: String,
    child: Mutex<Option<Child>>,
}

impl DecodeProcess {
    pub(crate) fn spawn(
        tool: &ExternalTool,
        args: &[String],
    ) -> Result<(Self, ChildStdout, StderrTail), CaptureError> {
        let program = tool.display_name();
        let mut child = tool
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CaptureError::Launch {
                program: program.clone(),
                reason: err.to_string(),
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Launch {
                program,
                reason: "stdout pipe was not attached".into(),
            });
        };

        let tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            tail.follow(stderr, program.clone());
        }

        log::info!("{} started (pid {})", program, child.id());
        Ok((
            Self {
                program,
                child: Mutex::new(Some(child)),
            },
            stdout,
            tail,
        ))
    }

    /// Kill and reap the child. Later calls are no-ops.
    pub(crate) fn terminate(&self) {
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };
        if let Err(err) = child.kill() {
            // Already exited on its own; still reap it below.
            log::debug!("{}: kill: {}", self.program, err);
        }
        match child.wait() {
            Ok(status) => log::info!("{} exited ({})", self.program, status),
            Err(err) => log::warn!("{}: failed to reap decoder: {}", self.program, err),
        }
    }
}

/// Reads fixed-size RGBA frames from a byte stream.
pub(crate) struct FrameReader<R> {
    source: R,
    width: u32,
    height: u32,
    frame_len: usize,
    frames_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(source: R, width: u32, height: u32) -> Self {
        Self {
            source,
            width,
            height,
            frame_len: PixelFormat::Rgba8.frame_len(width, height),
            frames_read: 0,
        }
    }

    /// Read exactly one frame. A short read is an error, never a partial frame.
    pub(crate) fn read_frame(&mut self) -> std::io::Result<Frame> {
        let mut buffer = vec![0u8; self.frame_len];
        self.source.read_exact(&mut buffer)?;
        self.frames_read += 1;
        Ok(Frame::from_exact(self.width, self.height, buffer))
    }

    pub(crate) fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Everything a reader loop needs; dropping it tears the stream down.
///
/// On drop the decoder is killed and reaped, then the frame sink and error
/// sender are dropped, which closes both channels for consumers.
pub(crate) struct ReaderContext<S> {
    pub(crate) reader: FrameReader<ChildStdout>,
    pub(crate) sink: S,
    pub(crate) stop: StopSignal,
    errors: Sender<CaptureError>,
    process: Arc<DecodeProcess>,
    stderr: StderrTail,
    _finished: Sender<()>,
}

impl<S> ReaderContext<S> {
    /// Report a failed read as the stream's single fatal error.
    ///
    /// Suppressed when the failure was caused by a requested stop.
    pub(crate) fn fail(&self, source: std::io::Error) {
        if self.stop.is_triggered() {
            return;
        }
        let error = CaptureError::StreamRead {
            frames: self.reader.frames_read(),
            source,
            stderr_tail: self.stderr.snapshot(),
        };
        log::warn!("{}: {}", self.process.program, error);
        let _ = self.errors.try_send(error);
    }
}

impl<S> Drop for ReaderContext<S> {
    fn drop(&mut self) {
        self.process.terminate();
    }
}

/// Channels, stop signal and decoder process shared by both streamer variants.
pub(crate) struct StreamerCore<S> {
    frames: Receiver<Frame>,
    errors: Receiver<CaptureError>,
    idle: Mutex<Option<(S, Sender<CaptureError>)>>,
    stop: StopSignal,
    process: Mutex<Option<Arc<DecodeProcess>>>,
    finished: Mutex<Option<Receiver<()>>>,
}

impl<S: Send + 'static> StreamerCore<S> {
    /// `sink` is the producer end of `frames`.
    pub(crate) fn new(sink: S, frames: Receiver<Frame>) -> Self {
        let (errors_tx, errors_rx) = bounded(1);
        Self {
            frames,
            errors: errors_rx,
            idle: Mutex::new(Some((sink, errors_tx))),
            stop: StopSignal::new(),
            process: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }

    pub(crate) fn frames(&self) -> Receiver<Frame> {
        self.frames.clone()
    }

    pub(crate) fn errors(&self) -> Receiver<CaptureError> {
        self.errors.clone()
    }

    /// Spawn the decoder and run `reader_loop` on a dedicated thread.
    pub(crate) fn launch<F>(
        &self,
        name: &str,
        tool: &ExternalTool,
        args: &[String],
        width: u32,
        height: u32,
        reader_loop: F,
    ) -> Result<(), CaptureError>
    where
        F: FnOnce(ReaderContext<S>) + Send + 'static,
    {
        if self.stop.is_triggered() {
            return Err(CaptureError::Launch {
                program: tool.display_name(),
                reason: "streamer has been stopped".into(),
            });
        }
        let (sink, errors) = lock(&self.idle)
            .take()
            .ok_or_else(|| CaptureError::Launch {
                program: tool.display_name(),
                reason: "streamer already started".into(),
            })?;

        let (process, stdout, stderr) = DecodeProcess::spawn(tool, args)?;
        let process = Arc::new(process);
        let (finished_tx, finished_rx) = bounded(0);
        *lock(&self.process) = Some(Arc::clone(&process));
        *lock(&self.finished) = Some(finished_rx);

        let ctx = ReaderContext {
            reader: FrameReader::new(stdout, width, height),
            sink,
            stop: self.stop.clone(),
            errors,
            process,
            stderr,
            _finished: finished_tx,
        };
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || reader_loop(ctx))
            .map_err(|err| CaptureError::Launch {
                program: tool.display_name(),
                reason: format!("cannot spawn reader thread: {}", err),
            })?;
        Ok(())
    }

    pub(crate) fn stop(&self) {
        if !self.stop.trigger() {
            return;
        }
        // Never started: dropping the idle ends closes both channels.
        drop(lock(&self.idle).take());

        let process = lock(&self.process).take();
        if let Some(process) = process {
            process.terminate();
        }
        let finished = lock(&self.finished).take();
        if let Some(finished) = finished {
            if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(STOP_TIMEOUT) {
                log::warn!("frame reader did not exit within {:?}", STOP_TIMEOUT);
            }
        }
    }
}
