//! Ready-made sinks.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::output::{Datapoints, Event, Row};
use crate::traits::{EventSink, RawSink, TimeSeriesSink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned sink mutex");
        poisoned.into_inner()
    })
}

/// A row as recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub database: String,
    pub table: String,
    pub row: Row,
}

/// Sink that keeps every item in memory. Implements all three sink traits.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    rows: Mutex<Vec<TableRow>>,
    datapoints: Mutex<Vec<Datapoints>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn rows(&self) -> Vec<TableRow> {
        lock(&self.rows).clone()
    }

    pub fn rows_for(&self, database: &str, table: &str) -> Vec<Row> {
        lock(&self.rows)
            .iter()
            .filter(|r| r.database == database && r.table == table)
            .map(|r| r.row.clone())
            .collect()
    }

    pub fn datapoints(&self) -> Vec<Datapoints> {
        lock(&self.datapoints).clone()
    }

    /// Total number of records across all kinds.
    pub fn len(&self) -> usize {
        lock(&self.events).len() + lock(&self.rows).len() + lock(&self.datapoints).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn enqueue(&self, event: Event) {
        lock(&self.events).push(event);
    }
}

impl RawSink for MemorySink {
    fn enqueue(&self, database: &str, table: &str, row: Row) {
        lock(&self.rows).push(TableRow {
            database: database.to_string(),
            table: table.to_string(),
            row,
        });
    }
}

impl TimeSeriesSink for MemorySink {
    fn enqueue(&self, datapoints: Datapoints) {
        lock(&self.datapoints).push(datapoints);
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Event(&'a Event),
    Raw {
        database: &'a str,
        table: &'a str,
        row: &'a Row,
    },
    Datapoints(&'a Datapoints),
}

/// Sink that writes one JSON object per record, tagged with a `kind` field.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, line: &Line<'_>) {
        let mut writer = lock(&self.writer);
        let result = serde_json::to_writer(&mut *writer, line)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to write output line");
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn enqueue(&self, event: Event) {
        self.write_line(&Line::Event(&event));
    }
}

impl<W: Write + Send> RawSink for JsonLinesSink<W> {
    fn enqueue(&self, database: &str, table: &str, row: Row) {
        self.write_line(&Line::Raw {
            database,
            table,
            row: &row,
        });
    }
}

impl<W: Write + Send> TimeSeriesSink for JsonLinesSink<W> {
    fn enqueue(&self, datapoints: Datapoints) {
        self.write_line(&Line::Datapoints(&datapoints));
    }
}
