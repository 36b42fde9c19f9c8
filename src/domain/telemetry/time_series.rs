use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, mpsc};
use std::thread;

/// `tracing` target for analytic events, so they can be filtered apart from operational logs.
pub const ANALYTICS_TARGET: &str = "bde_analytics";

/// Granularity a time-series point was aggregated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricLevel {
    SJob,
    RawJob,
    Site,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    /// Unix seconds.
    pub time: i64,
    pub level: MetricLevel,
    pub id: String,
    /// Bytes/s.
    pub rate: f64,
    /// Bytes moved since the previous point for the same id.
    pub delta_bytes: u64,
    /// Cumulative bytes at this level.
    pub tx_bytes: u64,
    pub description: String,
}

/// Destination for throughput and progress series.
pub trait TimeSeriesSink: std::fmt::Debug + Send + Sync {
    fn record(&self, point: MetricPoint);

    fn flush(&self) {}
}

enum SeriesMessage {
    Point(MetricPoint),
    Flush,
    Shutdown,
}

/// Writes points as `;`-separated CSV from a background thread so callers never block on I/O.
#[derive(Debug)]
pub struct CsvTimeSeries {
    sender: Mutex<mpsc::Sender<SeriesMessage>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CsvTimeSeries {
    const HEADERS: [&'static str; 7] = ["Time", "Level", "Id", "Rate", "DeltaBytes", "TxBytes", "Description"];

    /// Opens `file_path` (or stdout when `None`) and spawns the writer thread.
    pub fn init(file_path: Option<&Path>) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match file_path {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout()),
        };

        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new().name("time-series-writer".into()).spawn(move || Self::worker_loop(rx, writer))?;

        Ok(CsvTimeSeries { sender: Mutex::new(tx), worker: Mutex::new(Some(worker)) })
    }

    fn worker_loop(rx: mpsc::Receiver<SeriesMessage>, writer: Box<dyn Write + Send>) {
        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);

        if let Err(e) = csv_wtr.write_record(Self::HEADERS) {
            log::error!("Time series: failed to write headers: {}", e);
        }

        for msg in rx {
            match msg {
                SeriesMessage::Point(point) => {
                    let row = [
                        point.time.to_string(),
                        format!("{:?}", point.level),
                        point.id,
                        format!("{:.3}", point.rate),
                        point.delta_bytes.to_string(),
                        point.tx_bytes.to_string(),
                        point.description,
                    ];
                    if let Err(e) = csv_wtr.write_record(&row) {
                        log::error!("Time series: failed to write record: {}", e);
                    }
                }
                SeriesMessage::Flush => {
                    let _ = csv_wtr.flush();
                }
                SeriesMessage::Shutdown => break,
            }
        }

        let _ = csv_wtr.flush();
    }

    fn send(&self, msg: SeriesMessage) {
        if let Ok(sender) = self.sender.lock() {
            // A dead writer thread must not take the scheduler down with it.
            let _ = sender.send(msg);
        }
    }

    /// Flushes outstanding rows and waits for the writer thread to exit.
    pub fn shutdown(&self) {
        self.send(SeriesMessage::Shutdown);
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl TimeSeriesSink for CsvTimeSeries {
    fn record(&self, point: MetricPoint) {
        self.send(SeriesMessage::Point(point));
    }

    fn flush(&self) {
        self.send(SeriesMessage::Flush);
    }
}

impl Drop for CsvTimeSeries {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps every point in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTimeSeries {
    points: Mutex<Vec<MetricPoint>>,
}

impl MemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn points_for(&self, level: MetricLevel, id: &str) -> Vec<MetricPoint> {
        self.points().into_iter().filter(|p| p.level == level && p.id == id).collect()
    }
}

impl TimeSeriesSink for MemoryTimeSeries {
    fn record(&self, point: MetricPoint) {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }
}
