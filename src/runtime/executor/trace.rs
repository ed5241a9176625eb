//! Translation of artifact-recorded timestamps into trace events

use crate::runtime::context::PlaceholderBindings;
use crate::runtime::trace::{TraceContext, TraceEvent, TraceEventKind, TraceInfo};

use super::ExecutionError;

/// Read every event declared in `info` from its backing tensor and append
/// the resulting events to `sink`.
///
/// Backing tensors are numbered from 1 in declaration order; that number is
/// the event's `tid`.
pub(super) fn translate_trace_events(
    info: &TraceInfo,
    bindings: &PlaceholderBindings,
    sink: &TraceContext,
) -> Result<(), ExecutionError> {
    let mut translated = Vec::new();

    for (tid, (backing, events)) in info.events.iter().enumerate() {
        let tid = tid + 1;
        let data = bindings
            .get(backing)
            .ok_or_else(|| ExecutionError::MissingTraceBacking(backing.clone()))?
            .as_bytes();

        for event in events {
            let too_small = || ExecutionError::TraceBackingTooSmall {
                backing: backing.clone(),
                event: event.name.clone(),
            };
            let start = info.width.read(data, event.index).ok_or_else(too_small)?;

            let translated_event = match (event.kind, event.end_index) {
                (TraceEventKind::Complete, Some(end_index)) => {
                    let end = info.width.read(data, end_index).ok_or_else(too_small)?;
                    TraceEvent::complete(event.name.clone(), start, end, tid)
                }
                _ => TraceEvent::instant(event.name.clone(), start, tid),
            };
            translated.push(translated_event);
        }
    }

    sink.log_events(translated);
    Ok(())
}
