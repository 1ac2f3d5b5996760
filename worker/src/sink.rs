use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use log::warn;
use serde::Serialize;

/// Where scalar training metrics end up.
///
/// Writes are best effort, a sink never fails the run.
pub trait MetricsSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64);

    fn flush(&mut self) {}
}

/// Discards every record, used by every rank but 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: u64) {}
}

#[derive(Serialize)]
struct Record<'a> {
    tag: &'a str,
    value: f64,
    step: u64,
}

/// Appends one JSON object per record to a file.
pub struct JsonlSink {
    out: Option<BufWriter<File>>,
}

impl JsonlSink {
    /// File name of the records inside the save directory.
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Opens `path` for appending, a sink that can't open its file logs a warning and
    /// drops every record.
    pub fn open(path: &Path) -> Self {
        let out = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("metrics won't be written to {}: {e}", path.display());
                None
            }
        };

        Self { out }
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        let Some(out) = &mut self.out else {
            return;
        };

        let record = Record { tag, value, step };
        let written = serde_json::to_writer(&mut *out, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));

        if let Err(e) = written {
            warn!("dropping metric {tag}: {e}");
        }
    }

    fn flush(&mut self) {
        let Some(out) = &mut self.out else {
            return;
        };

        if let Err(e) = out.flush() {
            warn!("failed to flush metrics: {e}");
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JsonlSink::FILE_NAME);

        {
            let mut sink = JsonlSink::open(&path);
            sink.add_scalar("train/loss_all", 0.5, 0);
            sink.add_scalar("eval/changed_IoU", 12.25, 1);
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["tag"], "eval/changed_IoU");
        assert_eq!(lines[1]["value"], 12.25);
        assert_eq!(lines[1]["step"], 1);
    }
}
