//! Captured console output of an invocation, with live listeners.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::{Arc, Mutex},
};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

/// One write into an [`OutputBuffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "lossy_string")]
    pub data: Vec<u8>,
}

impl OutputChunk {
    /// The chunk as text, replacing invalid UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    #[must_use]
    pub fn ends_with_newline(&self) -> bool {
        self.data.last() == Some(&b'\n')
    }
}

/// Callback invoked synchronously on every write.
pub type OutputListener = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

#[derive(Default)]
struct Inner {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    listeners: HashMap<String, OutputListener>,
}

impl Inner {
    fn chunks_after(&self, after: Option<DateTime<Utc>>) -> Vec<OutputChunk> {
        match after {
            Some(after) => self
                .chunks
                .iter()
                .filter(|c| c.timestamp > after)
                .cloned()
                .collect(),
            None => self.chunks.iter().cloned().collect(),
        }
    }
}

/// Append-only, timestamped output log.
///
/// Clones share the same buffer. Every [`write`](Self::write) calls the
/// registered listeners before returning, so a slow listener slows the writer.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
    max_bytes: Option<usize>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that drops its oldest chunks once it holds more than
    /// `max_bytes`. The newest chunk is always kept.
    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_bytes: Some(max_bytes),
        }
    }

    /// Append `data` as a new chunk stamped with the current time.
    pub fn write(&self, data: &[u8]) {
        let chunk = OutputChunk {
            timestamp: Utc::now(),
            data: data.to_vec(),
        };

        // Listeners run outside the lock so they may read the buffer or
        // detach themselves.
        let listeners: Vec<OutputListener> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.bytes += chunk.data.len();
            inner.chunks.push_back(chunk.clone());
            if let Some(max) = self.max_bytes {
                while inner.bytes > max && inner.chunks.len() > 1 {
                    if let Some(dropped) = inner.chunks.pop_front() {
                        inner.bytes -= dropped.data.len();
                    }
                }
            }
            inner.listeners.values().cloned().collect()
        };

        for listener in listeners {
            listener(&chunk);
        }
    }

    /// Append a line, adding the trailing newline.
    pub fn writeln(&self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data);
    }

    /// Register `listener` under `id`, replacing any listener with that id.
    pub fn add_listener(&self, id: impl Into<String>, listener: OutputListener) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listeners.insert(id.into(), listener);
    }

    /// Register `listener` and return the chunks after `after` in one step.
    /// Every later write reaches the listener and none of them is in the
    /// returned backlog.
    pub fn follow(
        &self,
        id: impl Into<String>,
        listener: OutputListener,
        after: Option<DateTime<Utc>>,
    ) -> Vec<OutputChunk> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listeners.insert(id.into(), listener);
        inner.chunks_after(after)
    }

    pub fn remove_listener(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listeners.remove(id);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listeners.len()
    }

    /// Chunks written strictly after `after`, or every chunk when `None`.
    #[must_use]
    pub fn chunks(&self, after: Option<DateTime<Utc>>) -> Vec<OutputChunk> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks_after(after)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes currently held.
    #[must_use]
    pub fn bytes_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bytes
    }

    /// Everything written so far, as lossy UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut bytes = Vec::with_capacity(inner.bytes);
        for chunk in &inner.chunks {
            bytes.extend_from_slice(&chunk.data);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Rebuild a buffer from stored chunks. The result has no listeners.
    #[must_use]
    pub fn from_chunks(chunks: Vec<OutputChunk>) -> Self {
        let bytes = chunks.iter().map(|c| c.data.len()).sum();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                chunks: chunks.into(),
                bytes,
                listeners: HashMap::new(),
            })),
            max_bytes: None,
        }
    }

    /// A detached copy holding the same chunks.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self::from_chunks(self.chunks(None))
    }
}

impl io::Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutputBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("chunks", &self.len())
            .field("bytes", &self.bytes_len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Serialize for OutputBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.chunks(None).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OutputBuffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<OutputChunk>::deserialize(deserializer).map(Self::from_chunks)
    }
}

/// Chunk data travels as text; output is console text in practice.
mod lossy_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{io::Write as _, sync::atomic::{AtomicUsize, Ordering}},
    };

    #[test]
    fn chunks_after_timestamp_returns_suffix() {
        let buf = OutputBuffer::new();
        for i in 0..5 {
            buf.write(format!("line {i}\n").as_bytes());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let all = buf.chunks(None);
        assert_eq!(all.len(), 5);

        let after = buf.chunks(Some(all[2].timestamp));
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].text(), "line 3\n");
        assert_eq!(after[1].text(), "line 4\n");
    }

    #[test]
    fn listeners_see_every_write_until_removed() {
        let buf = OutputBuffer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        buf.add_listener(
            "client-1",
            Arc::new(move |chunk: &OutputChunk| {
                counter.fetch_add(chunk.data.len(), Ordering::SeqCst);
            }),
        );

        buf.write(b"abc");
        buf.writeln("de");
        assert_eq!(seen.load(Ordering::SeqCst), 6);

        buf.remove_listener("client-1");
        assert_eq!(buf.listener_count(), 0);
        buf.write(b"ignored");
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn follow_splits_backlog_and_live_writes() {
        let buf = OutputBuffer::new();
        buf.write(b"one");
        buf.write(b"two");
        let newest = buf.chunks(None)[1].timestamp;

        let everything = buf.follow("full", Arc::new(|_: &OutputChunk| {}), None);
        assert_eq!(everything.len(), 2);
        buf.remove_listener("full");

        let live = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&live);
        let backlog = buf.follow(
            "client",
            Arc::new(move |chunk: &OutputChunk| sink.lock().unwrap().push(chunk.text())),
            Some(newest),
        );
        assert!(backlog.is_empty());

        // May carry the same timestamp as "two"; it still arrives live.
        buf.write(b"three");
        assert_eq!(*live.lock().unwrap(), vec!["three".to_string()]);
    }

    #[test]
    fn listener_may_read_the_buffer() {
        let buf = OutputBuffer::new();
        let reader = buf.clone();
        let lens = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lens);
        buf.add_listener(
            "reader",
            Arc::new(move |_: &OutputChunk| {
                sink.lock().unwrap().push(reader.len());
            }),
        );
        buf.write(b"a");
        buf.write(b"b");
        assert_eq!(*lens.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn max_bytes_drops_oldest_chunks() {
        let buf = OutputBuffer::with_max_bytes(8);
        buf.write(b"12345");
        buf.write(b"67890");
        assert_eq!(buf.contents(), "67890");
        assert_eq!(buf.bytes_len(), 5);

        buf.write(b"this chunk alone is too big");
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn io_write_and_contents() {
        let mut buf = OutputBuffer::new();
        write!(buf, "hello ").unwrap();
        writeln!(buf, "world").unwrap();
        assert_eq!(buf.contents(), "hello world\n");
    }

    #[test]
    fn serializes_as_chunk_list() {
        let buf = OutputBuffer::new();
        buf.writeln("done");
        let json = serde_json::to_value(&buf).unwrap();
        assert_eq!(json[0]["data"], "done\n");

        let restored: OutputBuffer = serde_json::from_value(json).unwrap();
        assert_eq!(restored.contents(), "done\n");
        assert_eq!(restored.listener_count(), 0);
    }
}
