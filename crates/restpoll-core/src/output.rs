//! Handler output types and routing to sinks.
//!
//! Handlers return an [`Output`]: zero or more [`OutputItem`]s of a single
//! kind. The [`OutputRouter`] looks at the kind of the first item and hands
//! every item to the sink registered for that kind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::traits::{EventSink, RawSink, TimeSeriesSink};

/// A structured event record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_set_id: Option<i64>,
}

/// One table row: a key plus named columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub columns: serde_json::Map<String, serde_json::Value>,
}

impl Row {
    pub fn new(key: impl Into<String>, columns: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            columns,
        }
    }

    /// Build a row from a JSON object; any other JSON value is rejected.
    pub fn from_json(key: impl Into<String>, value: serde_json::Value) -> Result<Self, AppError> {
        match value {
            serde_json::Value::Object(columns) => Ok(Self::new(key, columns)),
            other => Err(AppError::HandlerError(format!(
                "row columns must be a JSON object, got {other}"
            ))),
        }
    }
}

/// Rows for a single table. One item may carry many rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub database: String,
    pub table: String,
    pub rows: Vec<Row>,
}

impl RawRow {
    pub fn new(database: impl Into<String>, table: impl Into<String>, row: Row) -> Self {
        Self::many(database, table, vec![row])
    }

    pub fn many(database: impl Into<String>, table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            rows,
        }
    }
}

/// The value of a single datapoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatapointValue {
    Numeric(f64),
    String(String),
}

impl From<f64> for DatapointValue {
    fn from(value: f64) -> Self {
        DatapointValue::Numeric(value)
    }
}

impl From<&str> for DatapointValue {
    fn from(value: &str) -> Self {
        DatapointValue::String(value.to_string())
    }
}

impl From<String> for DatapointValue {
    fn from(value: String) -> Self {
        DatapointValue::String(value)
    }
}

/// A timestamped value. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(timestamp: i64, value: impl Into<DatapointValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    pub fn at(time: DateTime<Utc>, value: impl Into<DatapointValue>) -> Self {
        Self::new(time.timestamp_millis(), value)
    }
}

/// A batch of datapoints for one time series, identified by exactly one of
/// `id` or `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub datapoints: Vec<Datapoint>,
}

impl Datapoints {
    pub fn by_id(id: i64, datapoints: Vec<Datapoint>) -> Self {
        Self {
            id: Some(id),
            external_id: None,
            datapoints,
        }
    }

    pub fn by_external_id(external_id: impl Into<String>, datapoints: Vec<Datapoint>) -> Self {
        Self {
            id: None,
            external_id: Some(external_id.into()),
            datapoints,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        match (&self.id, &self.external_id) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err(AppError::RoutingError(
                "datapoints carry neither id nor external_id".into(),
            )),
            (Some(_), Some(_)) => Err(AppError::RoutingError(
                "datapoints carry both id and external_id".into(),
            )),
        }
    }
}

/// The kinds of output a handler can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Event,
    Raw,
    Datapoints,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Event => write!(f, "event"),
            OutputKind::Raw => write!(f, "raw"),
            OutputKind::Datapoints => write!(f, "datapoints"),
        }
    }
}

/// A single decoded item produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    Event(Event),
    Raw(RawRow),
    Datapoints(Datapoints),
}

impl OutputItem {
    pub fn kind(&self) -> OutputKind {
        match self {
            OutputItem::Event(_) => OutputKind::Event,
            OutputItem::Raw(_) => OutputKind::Raw,
            OutputItem::Datapoints(_) => OutputKind::Datapoints,
        }
    }
}

impl From<Event> for OutputItem {
    fn from(event: Event) -> Self {
        OutputItem::Event(event)
    }
}

impl From<RawRow> for OutputItem {
    fn from(raw: RawRow) -> Self {
        OutputItem::Raw(raw)
    }
}

impl From<Datapoints> for OutputItem {
    fn from(datapoints: Datapoints) -> Self {
        OutputItem::Datapoints(datapoints)
    }
}

/// Everything a handler produced for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output(Vec<OutputItem>);

impl Output {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Kind of the first item, if any.
    pub fn kind(&self) -> Option<OutputKind> {
        self.0.first().map(OutputItem::kind)
    }

    pub fn items(&self) -> &[OutputItem] {
        &self.0
    }
}

impl IntoIterator for Output {
    type Item = OutputItem;
    type IntoIter = std::vec::IntoIter<OutputItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<OutputItem> for Output {
    fn from_iter<I: IntoIterator<Item = OutputItem>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<()> for Output {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<Vec<OutputItem>> for Output {
    fn from(items: Vec<OutputItem>) -> Self {
        Self(items)
    }
}

impl From<OutputItem> for Output {
    fn from(item: OutputItem) -> Self {
        Self(vec![item])
    }
}

macro_rules! output_from {
    ($ty:ty) => {
        impl From<$ty> for Output {
            fn from(item: $ty) -> Self {
                Self(vec![item.into()])
            }
        }

        impl From<Vec<$ty>> for Output {
            fn from(items: Vec<$ty>) -> Self {
                Self(items.into_iter().map(Into::into).collect())
            }
        }

        impl From<Option<$ty>> for Output {
            fn from(item: Option<$ty>) -> Self {
                Self(item.into_iter().map(Into::into).collect())
            }
        }
    };
}

output_from!(Event);
output_from!(RawRow);
output_from!(Datapoints);

/// Forwards handler output to the sink matching its kind.
#[derive(Clone, Default)]
pub struct OutputRouter {
    events: Option<Arc<dyn EventSink>>,
    raw: Option<Arc<dyn RawSink>>,
    time_series: Option<Arc<dyn TimeSeriesSink>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn with_raw_sink(mut self, sink: Arc<dyn RawSink>) -> Self {
        self.raw = Some(sink);
        self
    }

    pub fn with_time_series_sink(mut self, sink: Arc<dyn TimeSeriesSink>) -> Self {
        self.time_series = Some(sink);
        self
    }

    /// Route every item of `output`. Returns the number of records enqueued
    /// (rows count individually).
    ///
    /// The first item decides the sink. A later item of a different kind, or
    /// a kind with no sink registered, fails the whole output; items enqueued
    /// before the failure stay enqueued.
    pub fn route(&self, output: Output) -> Result<usize, AppError> {
        let Some(kind) = output.kind() else {
            return Ok(0);
        };

        let mut routed = 0;
        match kind {
            OutputKind::Event => {
                let sink = self.events.as_ref().ok_or_else(|| missing_sink(kind))?;
                for item in output {
                    let found = item.kind();
                    let OutputItem::Event(event) = item else {
                        return Err(mixed_kinds(kind, found));
                    };
                    sink.enqueue(event);
                    routed += 1;
                }
            }
            OutputKind::Raw => {
                let sink = self.raw.as_ref().ok_or_else(|| missing_sink(kind))?;
                for item in output {
                    let found = item.kind();
                    let OutputItem::Raw(raw) = item else {
                        return Err(mixed_kinds(kind, found));
                    };
                    for row in raw.rows {
                        sink.enqueue(&raw.database, &raw.table, row);
                        routed += 1;
                    }
                }
            }
            OutputKind::Datapoints => {
                let sink = self.time_series.as_ref().ok_or_else(|| missing_sink(kind))?;
                for item in output {
                    let found = item.kind();
                    let OutputItem::Datapoints(datapoints) = item else {
                        return Err(mixed_kinds(kind, found));
                    };
                    datapoints.validate()?;
                    sink.enqueue(datapoints);
                    routed += 1;
                }
            }
        }
        Ok(routed)
    }
}

fn missing_sink(kind: OutputKind) -> AppError {
    AppError::RoutingError(format!("no sink configured for {kind} output"))
}

fn mixed_kinds(expected: OutputKind, found: OutputKind) -> AppError {
    AppError::RoutingError(format!(
        "unexpected {found} item in {expected} output"
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sink::MemorySink;

    fn row(key: &str) -> Row {
        Row::from_json(key, json!({"test": "test"})).unwrap()
    }

    fn router(sink: &Arc<MemorySink>) -> OutputRouter {
        OutputRouter::new()
            .with_event_sink(sink.clone())
            .with_raw_sink(sink.clone())
            .with_time_series_sink(sink.clone())
    }

    #[test]
    fn empty_output_is_not_an_error() {
        let router = OutputRouter::new();
        assert_eq!(router.route(Output::empty()).unwrap(), 0);
        assert_eq!(router.route(().into()).unwrap(), 0);
    }

    #[test]
    fn events_go_to_event_sink() {
        let sink = Arc::new(MemorySink::new());
        let events = vec![
            Event {
                external_id: Some("a".into()),
                ..Default::default()
            },
            Event {
                external_id: Some("b".into()),
                ..Default::default()
            },
        ];
        let routed = router(&sink).route(events.into()).unwrap();
        assert_eq!(routed, 2);
        assert_eq!(sink.events().len(), 2);
        assert!(sink.rows().is_empty());
    }

    #[test]
    fn raw_rows_fan_out_per_table() {
        let sink = Arc::new(MemorySink::new());
        let output = Output::from(vec![
            RawRow::many("db", "assets", vec![row("1"), row("2")]),
            RawRow::new("db", "timeseries", row("3")),
        ]);
        let routed = router(&sink).route(output).unwrap();
        assert_eq!(routed, 3);
        assert_eq!(sink.rows_for("db", "assets").len(), 2);
        assert_eq!(sink.rows_for("db", "timeseries").len(), 1);
    }

    #[test]
    fn datapoints_go_to_time_series_sink() {
        let sink = Arc::new(MemorySink::new());
        let output = Output::from(Datapoints::by_external_id(
            "temp",
            vec![Datapoint::new(1_000, 21.5), Datapoint::new(2_000, "n/a")],
        ));
        assert_eq!(router(&sink).route(output).unwrap(), 1);
        assert_eq!(sink.datapoints()[0].datapoints.len(), 2);
    }

    #[test]
    fn datapoints_need_exactly_one_identifier() {
        let sink = Arc::new(MemorySink::new());
        let anonymous = Datapoints {
            id: None,
            external_id: None,
            datapoints: vec![],
        };
        assert!(matches!(
            router(&sink).route(anonymous.into()),
            Err(AppError::RoutingError(_))
        ));

        let both = Datapoints {
            id: Some(1),
            external_id: Some("x".into()),
            datapoints: vec![],
        };
        assert!(router(&sink).route(both.into()).is_err());
        assert!(sink.datapoints().is_empty());
    }

    #[test]
    fn missing_sink_is_a_routing_error() {
        let sink = Arc::new(MemorySink::new());
        let router = OutputRouter::new().with_event_sink(sink);
        let err = router
            .route(RawRow::new("db", "t", row("1")).into())
            .unwrap_err();
        assert!(err.to_string().contains("no sink configured for raw output"));
    }

    #[test]
    fn mixed_kinds_fail_after_first_kind() {
        let sink = Arc::new(MemorySink::new());
        let output = Output::from(vec![
            OutputItem::Event(Event::default()),
            OutputItem::Raw(RawRow::new("db", "t", row("1"))),
        ]);
        let err = router(&sink).route(output).unwrap_err();
        assert!(err.to_string().contains("unexpected raw item in event output"));
        assert_eq!(sink.events().len(), 1);
        assert!(sink.rows().is_empty());
    }

    #[test]
    fn option_output() {
        assert!(Output::from(None::<Event>).is_empty());
        assert_eq!(Output::from(Some(Event::default())).kind(), Some(OutputKind::Event));
    }

    #[test]
    fn event_serializes_type_field() {
        let event = Event {
            event_type: Some("alarm".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"type": "alarm"}));
    }

    #[test]
    fn row_requires_object_columns() {
        assert!(Row::from_json("k", json!([1, 2])).is_err());
    }
}
