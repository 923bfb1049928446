use anyhow::Context;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use std::sync::Mutex;

/// A log writer.
pub trait Writer: Send + Sync + 'static {
    /// Write the given key-value pairs to the log.
    fn write(&self, level: log::Level, values: &BTreeMap<String, Value>) -> anyhow::Result<()>;
}

impl Debug for dyn Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish()
    }
}

/// Writes JSONL records, blocking until each write completes.
pub struct BlockingWriter<W: Write + Sync + Send + 'static> {
    mu: Mutex<W>,
}

impl<W: Write + Sync + Send + 'static> BlockingWriter<W> {
    pub fn new(w: W) -> Self {
        Self { mu: Mutex::new(w) }
    }
}

impl Default for BlockingWriter<std::io::Stderr> {
    fn default() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Sync + Send + 'static> Writer for BlockingWriter<W> {
    fn write(&self, _: log::Level, values: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        let mut buf = Vec::with_capacity(256);
        serde_json::to_writer(&mut buf, values).context("serialize log record")?;
        buf.push(b'\n');

        match self.mu.lock() {
            Ok(mut w) => {
                w.write_all(&buf).context("write log record")?;
                Ok(())
            }
            Err(poisoned) => Err(anyhow::anyhow!("poisoned mutex: {:?}", poisoned)),
        }
    }
}
