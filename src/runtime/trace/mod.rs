//! Trace events and trace sinks
//!
//! A [`TraceContext`] collects structured [`TraceEvent`]s for one request.
//! Artifacts describe the timestamps they record with a [`TraceInfo`]; the
//! executor turns those raw timestamps into events after each invocation.
//! Collected events can be exported in the Chrome `about:tracing` format.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

/// Detail levels a trace sink accepts, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceLevel(u8);

impl TraceLevel {
    /// Tracing disabled.
    pub const NONE: TraceLevel = TraceLevel(0);
    /// Per-request events (one per dispatched task).
    pub const REQUEST: TraceLevel = TraceLevel(1);
    /// Runtime-only detail, including timestamps recorded by artifacts.
    pub const RUNTIME: TraceLevel = TraceLevel(1 << 1);
    /// Operator-level events.
    pub const OPERATOR: TraceLevel = TraceLevel(1 << 2);
    /// Everything above.
    pub const STANDARD: TraceLevel = TraceLevel(0b111);

    /// Whether every bit of `other` is enabled in `self`.
    #[inline]
    pub fn contains(
        self,
        other: TraceLevel,
    ) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Union of two levels.
    #[inline]
    pub fn union(
        self,
        other: TraceLevel,
    ) -> TraceLevel {
        TraceLevel(self.0 | other.0)
    }

    /// Whether tracing is disabled.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for TraceLevel {
    fn default() -> Self {
        TraceLevel::NONE
    }
}

impl FromStr for TraceLevel {
    type Err = String;

    /// Parses `none`, `request`, `runtime`, `operator`, `standard`, or a
    /// `|`-separated combination such as `request|runtime`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut level = TraceLevel::NONE;
        for part in s.split('|').map(str::trim) {
            let bits = match part.to_ascii_lowercase().as_str() {
                "none" | "" => TraceLevel::NONE,
                "request" => TraceLevel::REQUEST,
                "runtime" => TraceLevel::RUNTIME,
                "operator" => TraceLevel::OPERATOR,
                "standard" | "all" => TraceLevel::STANDARD,
                other => return Err(format!("unknown trace level `{}`", other)),
            };
            level = level.union(bits);
        }
        Ok(level)
    }
}

impl TryFrom<String> for TraceLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TraceLevel> for String {
    fn from(level: TraceLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        if *self == TraceLevel::STANDARD {
            return write!(f, "standard");
        }
        let names = [
            (TraceLevel::REQUEST, "request"),
            (TraceLevel::RUNTIME, "runtime"),
            (TraceLevel::OPERATOR, "operator"),
        ];
        let parts: Vec<&str> = names
            .iter()
            .filter(|(level, _)| self.contains(*level))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", parts.join("|"))
    }
}

/// Shape of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    /// A single point in time.
    Instant,
    /// A start/end pair with a duration.
    Complete,
}

impl TraceEventKind {
    /// Chrome trace phase letter.
    pub fn phase(self) -> &'static str {
        match self {
            TraceEventKind::Instant => "i",
            TraceEventKind::Complete => "X",
        }
    }
}

/// One structured trace event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Event name
    pub name: String,
    /// Start (or point) timestamp
    pub timestamp: u64,
    /// Duration for complete events
    pub duration: Option<u64>,
    /// Event shape
    pub kind: TraceEventKind,
    /// Thread or stream id the event belongs to
    pub tid: usize,
}

impl TraceEvent {
    /// A point event.
    pub fn instant(
        name: impl Into<String>,
        timestamp: u64,
        tid: usize,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp,
            duration: None,
            kind: TraceEventKind::Instant,
            tid,
        }
    }

    /// A complete event spanning `start..end`.
    ///
    /// An `end` earlier than `start` yields a zero duration.
    pub fn complete(
        name: impl Into<String>,
        start: u64,
        end: u64,
        tid: usize,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp: start,
            duration: Some(end.saturating_sub(start)),
            kind: TraceEventKind::Complete,
            tid,
        }
    }
}

impl Serialize for TraceEvent {
    fn serialize<S>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let fields = if self.duration.is_some() { 6 } else { 5 };
        let mut state = serializer.serialize_struct("TraceEvent", fields)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("ph", self.kind.phase())?;
        state.serialize_field("ts", &self.timestamp)?;
        if let Some(duration) = self.duration {
            state.serialize_field("dur", &duration)?;
        }
        state.serialize_field("pid", &0)?;
        state.serialize_field("tid", &self.tid)?;
        state.end()
    }
}

#[derive(Serialize)]
struct ChromeTrace<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
}

/// Microseconds since the Unix epoch.
///
/// Every trace event uses this clock, including timestamps that
/// instrumented artifacts write into their backing tensors.
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// Trace sink for one request.
#[derive(Debug)]
pub struct TraceContext {
    level: TraceLevel,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceContext {
    /// Create a sink accepting events at `level`.
    pub fn new(level: TraceLevel) -> Self {
        Self {
            level,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Accepted levels.
    #[inline]
    pub fn level(&self) -> TraceLevel {
        self.level
    }

    /// Whether events of `level` should be recorded.
    #[inline]
    pub fn should_log(
        &self,
        level: TraceLevel,
    ) -> bool {
        self.level.contains(level)
    }

    /// Current time on the trace clock.
    #[inline]
    pub fn now_micros(&self) -> u64 {
        timestamp_micros()
    }

    /// Append one event.
    pub fn log_event(
        &self,
        event: TraceEvent,
    ) {
        self.events.lock().push(event);
    }

    /// Append several events under a single lock.
    pub fn log_events(
        &self,
        events: impl IntoIterator<Item = TraceEvent>,
    ) {
        self.events.lock().extend(events);
    }

    /// Snapshot of the collected events.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Remove and return the collected events.
    pub fn take_events(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no events were collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Render the collected events as Chrome trace JSON.
    pub fn to_chrome_json(&self) -> serde_json::Result<String> {
        let events = self.events.lock();
        serde_json::to_string(&ChromeTrace {
            trace_events: &events,
        })
    }
}

/// Width of one timestamp slot in a trace backing tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampWidth {
    /// 32-bit little-endian slots
    U32,
    /// 64-bit little-endian slots
    U64,
}

impl TimestampWidth {
    /// Slot size in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            TimestampWidth::U32 => 4,
            TimestampWidth::U64 => 8,
        }
    }

    /// Read slot `index` from `data`, or `None` when it lies out of range.
    pub fn read(
        self,
        data: &[u8],
        index: usize,
    ) -> Option<u64> {
        let start = index.checked_mul(self.bytes())?;
        let end = start.checked_add(self.bytes())?;
        let slot = data.get(start..end)?;
        Some(match self {
            TimestampWidth::U32 => u32::from_le_bytes(slot.try_into().ok()?) as u64,
            TimestampWidth::U64 => u64::from_le_bytes(slot.try_into().ok()?),
        })
    }

    /// Write `value` into slot `index` of `data`.
    ///
    /// # Panics
    /// Panics if the slot lies out of range.
    pub fn write(
        self,
        data: &mut [u8],
        index: usize,
        value: u64,
    ) {
        let start = index * self.bytes();
        match self {
            TimestampWidth::U32 => {
                data[start..start + 4].copy_from_slice(&(value as u32).to_le_bytes())
            }
            TimestampWidth::U64 => data[start..start + 8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

/// One event an artifact records into a backing tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfoEvent {
    /// Event name
    pub name: String,
    /// Event shape
    pub kind: TraceEventKind,
    /// Slot of the (start) timestamp
    pub index: usize,
    /// Slot of the end timestamp, for complete events
    pub end_index: Option<usize>,
}

/// Trace descriptor of a compiled artifact.
///
/// Maps each backing tensor (a placeholder the artifact writes timestamps
/// into) to the events stored in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceInfo {
    /// Whether the artifact was built with instrumentation
    pub enabled: bool,
    /// Timestamp slot width
    pub width: TimestampWidth,
    /// Backing tensor name -> events, in declaration order
    pub events: IndexMap<String, Vec<TraceInfoEvent>>,
}

impl TraceInfo {
    /// A disabled descriptor.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            width: TimestampWidth::U64,
            events: IndexMap::new(),
        }
    }

    /// An enabled descriptor with no events yet.
    pub fn new(width: TimestampWidth) -> Self {
        Self {
            enabled: true,
            width,
            events: IndexMap::new(),
        }
    }

    /// Declare a point event stored at slot `index` of `backing`.
    pub fn add_instant(
        &mut self,
        backing: impl Into<String>,
        name: impl Into<String>,
        index: usize,
    ) -> &mut Self {
        self.events
            .entry(backing.into())
            .or_default()
            .push(TraceInfoEvent {
                name: name.into(),
                kind: TraceEventKind::Instant,
                index,
                end_index: None,
            });
        self
    }

    /// Declare a complete event stored at slots `start` and `end` of `backing`.
    pub fn add_complete(
        &mut self,
        backing: impl Into<String>,
        name: impl Into<String>,
        start: usize,
        end: usize,
    ) -> &mut Self {
        self.events
            .entry(backing.into())
            .or_default()
            .push(TraceInfoEvent {
                name: name.into(),
                kind: TraceEventKind::Complete,
                index: start,
                end_index: Some(end),
            });
        self
    }

    /// Bytes needed by `backing` to hold every declared slot.
    pub fn backing_size(
        &self,
        backing: &str,
    ) -> usize {
        self.events
            .get(backing)
            .and_then(|events| {
                events
                    .iter()
                    .map(|e| e.end_index.unwrap_or(e.index).max(e.index) + 1)
                    .max()
            })
            .map(|slots| slots * self.width.bytes())
            .unwrap_or(0)
    }
}

impl Default for TraceInfo {
    fn default() -> Self {
        Self::disabled()
    }
}
