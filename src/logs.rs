//! Log sink and per-process output draining.
//!
//! Child output and supervisor notices all end up in one unbounded channel.
//! Each launched process gets a single drain thread that reads its merged
//! stdout/stderr pipe line by line and forwards lines in the order the child
//! wrote them. The channel never applies backpressure, so a slow front end
//! cannot stall a child's writes.

use std::io::{self, BufRead, BufReader, PipeReader, Read};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::service::ServiceKind;

/// Who produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Service(ServiceKind),
    Supervisor,
}

/// What kind of line an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// A line the service wrote to stdout or stderr.
    Output,
    /// State transition reported by the supervisor.
    Notice,
    /// Recovered error reported by the supervisor.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub source: LogSource,
    pub kind: LogKind,
    pub text: String,
}

/// Append-only producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

/// Consumer side, drained by the front end on its own schedule.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::UnboundedReceiver<LogEntry>,
}

pub fn channel() -> (LogSink, LogStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogSink { tx }, LogStream { rx })
}

impl LogSink {
    pub fn push(&self, entry: LogEntry) {
        // A closed consumer just means nobody is watching any more.
        let _ = self.tx.send(entry);
    }

    /// Records a state transition both in tracing and in the stream.
    pub fn notice(&self, source: LogSource, text: impl Into<String>) {
        let text = text.into();
        match source {
            LogSource::Service(kind) => info!(service = %kind, "{}", text),
            LogSource::Supervisor => info!("{}", text),
        }
        self.push(LogEntry {
            source,
            kind: LogKind::Notice,
            text,
        });
    }

    /// Records a recovered error both in tracing and in the stream.
    pub fn warning(&self, source: LogSource, text: impl Into<String>) {
        let text = text.into();
        match source {
            LogSource::Service(kind) => warn!(service = %kind, "{}", text),
            LogSource::Supervisor => warn!("{}", text),
        }
        self.push(LogEntry {
            source,
            kind: LogKind::Warning,
            text,
        });
    }
}

impl LogStream {
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    /// Everything currently queued, without waiting.
    pub fn drain(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }
}

/// Starts the drain thread for one launched process.
///
/// The thread is detached so that services left running do not hold up
/// shutdown. It ends by itself at end-of-input, which is what happens when
/// the process exits or is terminated.
pub fn attach(service: ServiceKind, output: Option<PipeReader>, sink: LogSink) -> io::Result<()> {
    let Some(output) = output else {
        return Ok(());
    };
    std::thread::Builder::new()
        .name(format!("airack-{}-output", service.slug()))
        .spawn(move || drain(service, output, sink))?;
    Ok(())
}

fn drain<R: Read>(service: ServiceKind, reader: R, sink: LogSink) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => sink.push(output_line(service, &buf)),
            Err(err) => {
                debug!(%service, error = %err, "output read failed");
                if !buf.is_empty() {
                    sink.push(output_line(service, &buf));
                }
                break;
            }
        }
    }
    debug!(%service, "output closed");
}

fn output_line(service: ServiceKind, raw: &[u8]) -> LogEntry {
    let mut line = raw;
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    LogEntry {
        source: LogSource::Service(service),
        kind: LogKind::Output,
        text: String::from_utf8_lossy(line).into_owned(),
    }
}
