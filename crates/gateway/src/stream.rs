//! Server-sent event stream of an invocation's output.
//!
//! Events:
//! - `write` / `writeln`: one per output chunk, `{ "data", "timestamp" }`;
//!   `writeln` when the chunk ends a line (the newline is stripped);
//! - `ping`: every [`PING_INTERVAL`] while the invocation runs, carrying the
//!   elapsed milliseconds;
//! - `complete`: once, with the terminal status; the stream then ends.

use std::{convert::Infallible, sync::Arc, time::Duration};

use {
    async_stream::stream,
    axum::response::sse::Event,
    chrono::{DateTime, Utc},
    futures::Stream,
    jobkit_cron::{InvocationRecord, JobInvocation, OutputBuffer, OutputChunk},
    tokio::sync::mpsc,
    tracing::debug,
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{gauge, http as http_metrics};

pub const PING_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn chunk_event(chunk: &OutputChunk) -> Event {
    let text = chunk.text();
    let (name, data) = match text.strip_suffix('\n') {
        Some(line) => ("writeln", line),
        None => ("write", text.as_str()),
    };
    let payload = serde_json::json!({ "data": data, "timestamp": chunk.timestamp });
    Event::default().event(name).data(payload.to_string())
}

fn complete_event(status: &str) -> Event {
    Event::default().event("complete").data(status)
}

enum Step {
    Chunk(OutputChunk),
    Tick,
}

/// Detaches the SSE listener when the client goes away.
struct ListenerGuard {
    output: OutputBuffer,
    id: String,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.output.remove_listener(&self.id);
        debug!(listener = %self.id, "output stream closed");
        #[cfg(feature = "metrics")]
        gauge!(http_metrics::OUTPUT_STREAMS_ACTIVE).decrement(1.0);
    }
}

/// Follow a running invocation until it completes.
pub fn live(
    invocation: Arc<JobInvocation>,
    after: Option<DateTime<Utc>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let id = uuid::Uuid::new_v4().to_string();
        let output = invocation.output().clone();
        let backlog = output.follow(
            id.clone(),
            Arc::new(move |chunk: &OutputChunk| {
                let _ = tx.send(chunk.clone());
            }),
            after,
        );
        #[cfg(feature = "metrics")]
        gauge!(http_metrics::OUTPUT_STREAMS_ACTIVE).increment(1.0);
        let _guard = ListenerGuard { output: output.clone(), id };

        for chunk in backlog {
            yield Ok(chunk_event(&chunk));
        }

        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let step = tokio::select! {
                Some(chunk) = rx.recv() => Step::Chunk(chunk),
                _ = ticker.tick() => Step::Tick,
            };
            match step {
                Step::Chunk(chunk) => {
                    yield Ok(chunk_event(&chunk));
                },
                Step::Tick if invocation.is_done() => {
                    while let Ok(chunk) = rx.try_recv() {
                        yield Ok(chunk_event(&chunk));
                    }
                    yield Ok(complete_event(invocation.status().as_str()));
                    break;
                },
                Step::Tick => {
                    let elapsed = (Utc::now() - invocation.started()).num_milliseconds();
                    yield Ok(Event::default().event("ping").data(elapsed.to_string()));
                },
            }
        }
    }
}

/// Replay a finished invocation's stored output, then complete.
pub fn finished(
    record: InvocationRecord,
    after: Option<DateTime<Utc>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        for chunk in record.output.chunks(after) {
            yield Ok(chunk_event(&chunk));
        }
        yield Ok(complete_event(record.status.as_str()));
    }
}
