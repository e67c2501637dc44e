//! Destinations for inventory reports.
//!
//! The transport to the scheduler belongs to the orchestration layer; these
//! sinks cover the common hand-offs: an in-process channel, a JSON file the
//! orchestrator polls, and a Unix socket stream of framed reports.

use super::InventoryReport;
use super::wire;
use crate::error::{Error, Result};
use kanal::{Receiver, Sender};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Receives each report a collector produces.
pub trait InventorySink: Send {
    /// Deliver one report.
    fn publish(&mut self, report: &InventoryReport) -> Result<()>;
}

impl<S: InventorySink + ?Sized> InventorySink for Box<S> {
    fn publish(&mut self, report: &InventoryReport) -> Result<()> {
        (**self).publish(report)
    }
}

/// Sends reports over an in-process channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<InventoryReport>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its reports.
    pub fn new() -> (Self, Receiver<InventoryReport>) {
        let (tx, rx) = kanal::unbounded();
        (Self { tx }, rx)
    }
}

impl InventorySink for ChannelSink {
    fn publish(&mut self, report: &InventoryReport) -> Result<()> {
        self.tx
            .send(report.clone())
            .map_err(|e| Error::Publish(format!("inventory channel: {e}")))
    }
}

/// Replaces a JSON file with the latest report.
///
/// The file is written to a temporary sibling and renamed into place, so
/// readers never see a partial report.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InventorySink for JsonFileSink {
    fn publish(&mut self, report: &InventoryReport) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, report)
            .map_err(|e| Error::Publish(format!("failed to encode report: {e}")))?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// Streams framed reports to a Unix socket.
///
/// Connects lazily and reconnects on the next publish after a failure.
#[derive(Debug)]
pub struct SocketSink {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl SocketSink {
    /// Sink connecting to the socket at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: None,
        }
    }
}

impl InventorySink for SocketSink {
    fn publish(&mut self, report: &InventoryReport) -> Result<()> {
        let frame = wire::encode_report(report)?;

        let stream = match &mut self.stream {
            Some(stream) => stream,
            slot => slot.insert(UnixStream::connect(&self.path).map_err(|e| {
                Error::Publish(format!("connect {}: {e}", self.path.display()))
            })?),
        };

        if let Err(e) = stream.write_all(&frame) {
            self.stream = None;
            return Err(Error::Publish(format!("write {}: {e}", self.path.display())));
        }
        Ok(())
    }
}
