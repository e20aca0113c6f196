use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

struct SinkState {
    stderr: AtomicBool,
    file: Mutex<Option<File>>,
}

/// Writer for the tracing fmt layer. Output goes to stderr until the
/// process detaches from its terminal, and to the configured error log
/// once the configuration has been read.
#[derive(Clone)]
pub struct ErrorLogSink {
    state: Arc<SinkState>,
}

impl Default for ErrorLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorLogSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SinkState {
                stderr: AtomicBool::new(true),
                file: Mutex::new(None),
            }),
        }
    }

    /// Start appending to `path`, creating it and its directory if needed.
    pub fn attach_file(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut slot) = self.state.file.lock() {
            *slot = Some(file);
        }
        Ok(())
    }

    /// Stop writing to stderr; called once stdio points at /dev/null.
    pub fn detach_stderr(&self) {
        self.state.stderr.store(false, Ordering::SeqCst);
    }

    pub fn writes_stderr(&self) -> bool {
        self.state.stderr.load(Ordering::SeqCst)
    }
}

pub struct SinkWriter {
    state: Arc<SinkState>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state.stderr.load(Ordering::SeqCst) {
            io::stderr().write_all(buf)?;
        }
        if let Ok(mut slot) = self.state.file.lock() {
            if let Some(file) = slot.as_mut() {
                file.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut slot) = self.state.file.lock() {
            if let Some(file) = slot.as_mut() {
                file.flush()?;
            }
        }
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ErrorLogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            state: Arc::clone(&self.state),
        }
    }
}
