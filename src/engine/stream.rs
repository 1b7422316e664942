//! Streamed response consumption.
//!
//! A response is a sequence of [`Frame`]s pulled through [`ResponseStream`].
//! Each output channel goes through its own [`LineBuffer`]: text accumulates
//! until a newline arrives, then everything up to the last newline is written
//! to the sink in one write. Whatever is left is flushed when the stream ends.
use super::error::{CommandOutput, EngineResult};
use super::protocol::Frame;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Pull-based view of a streamed response.
pub trait ResponseStream: Send {
    /// The next frame, or `None` once the stream has ended cleanly.
    fn next_frame(&mut self) -> EngineResult<Option<Frame>>;
}

/// A shareable output destination.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputSink")
    }
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Discards everything written to it.
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// A sink backed by a shared in-memory buffer.
    pub fn buffer() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Self::new(SharedBuffer(Arc::clone(&buffer)));
        (sink, buffer)
    }

    /// Write `bytes` as a single write call and flush.
    pub fn write_chunk(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Accumulate-until-newline state for one output channel.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append `chunk`; returns the complete lines ready to be written, if any.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        self.pending.push_str(chunk);
        let cut = self.pending.rfind('\n')? + 1;
        let rest = self.pending.split_off(cut);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Take the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Outcome of draining a response stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub output: CommandOutput,
    /// Last result code seen; 0 when no frame carried one.
    pub result_code: i32,
}

/// Multiplexes frames into a stdout/stderr sink pair.
pub struct FramePump<'a> {
    stdout: &'a OutputSink,
    stderr: &'a OutputSink,
    stdout_lines: LineBuffer,
    stderr_lines: LineBuffer,
    outcome: StreamOutcome,
}

impl<'a> FramePump<'a> {
    pub fn new(stdout: &'a OutputSink, stderr: &'a OutputSink) -> Self {
        Self {
            stdout,
            stderr,
            stdout_lines: LineBuffer::default(),
            stderr_lines: LineBuffer::default(),
            outcome: StreamOutcome::default(),
        }
    }

    pub fn accept(&mut self, frame: &Frame) {
        if !frame.stdout.is_empty() {
            self.outcome.output.stdout.push_str(&frame.stdout);
            if let Some(lines) = self.stdout_lines.push(&frame.stdout) {
                emit(self.stdout, &lines);
            }
        }
        if !frame.stderr.is_empty() {
            self.outcome.output.stderr.push_str(&frame.stderr);
            if let Some(lines) = self.stderr_lines.push(&frame.stderr) {
                emit(self.stderr, &lines);
            }
        }
        if let Some(code) = frame.result_code {
            self.outcome.result_code = code;
        }
    }

    /// Flush trailing partial lines and return what was captured.
    pub fn finish(mut self) -> StreamOutcome {
        if let Some(rest) = self.stdout_lines.finish() {
            emit(self.stdout, &rest);
        }
        if let Some(rest) = self.stderr_lines.finish() {
            emit(self.stderr, &rest);
        }
        self.outcome
    }
}

fn emit(sink: &OutputSink, text: &str) {
    if let Err(err) = sink.write_chunk(text.as_bytes()) {
        tracing::warn!(error = %err, "failed to write engine output");
    }
}

/// Drain `stream` into the sinks until it ends.
///
/// On a stream error the lines received so far stay written, the partial
/// remainder is dropped, and the error is returned.
pub fn drain(
    stream: &mut dyn ResponseStream,
    stdout: &OutputSink,
    stderr: &OutputSink,
) -> EngineResult<StreamOutcome> {
    let mut pump = FramePump::new(stdout, stderr);
    while let Some(frame) = stream.next_frame()? {
        pump.accept(&frame);
    }
    Ok(pump.finish())
}
