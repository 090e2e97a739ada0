//! Per-turn buffer between agent generation and speech synthesis.
//!
//! The writer side is owned by the session orchestrator, which appends each
//! agent fragment as it arrives; the reader side is handed to the synthesis
//! streamer so audio can start on fragment 1 while generation is still
//! producing fragment N.

use tokio::sync::mpsc;

enum Slot {
    Text(String),
    Done,
}

/// Creates a connected single-producer, single-consumer fragment buffer.
pub fn fragment_buffer() -> (FragmentWriter, FragmentReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FragmentWriter {
            tx: Some(tx),
            record: Vec::new(),
            done: false,
        },
        FragmentReader { rx },
    )
}

/// Append-only producer half.
pub struct FragmentWriter {
    tx: Option<mpsc::UnboundedSender<Slot>>,
    record: Vec<String>,
    done: bool,
}

impl FragmentWriter {
    /// Appends a fragment. Ignored once the buffer is done or cleared.
    pub fn push(&mut self, text: impl Into<String>) {
        if self.done {
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        let text = text.into();
        self.record.push(text.clone());
        // A dropped reader only means synthesis stopped early; the record
        // still tracks the reply for transcripts.
        let _ = tx.send(Slot::Text(text));
    }

    /// Marks the buffer done; the reader drains what is queued and ends.
    pub fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Slot::Done);
        }
    }

    /// Drops everything appended so far and closes the buffer.
    pub fn clear(&mut self) {
        self.record.clear();
        self.done = true;
        self.tx = None;
    }

    /// Number of fragments appended this turn.
    pub fn len(&self) -> usize {
        self.record.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Concatenation of every fragment appended so far.
    pub fn text(&self) -> String {
        self.record.concat()
    }
}

/// Consumer half; reads block until the next fragment or the done marker.
pub struct FragmentReader {
    rx: mpsc::UnboundedReceiver<Slot>,
}

impl FragmentReader {
    /// Returns the next fragment, or `None` once the buffer is done, cleared,
    /// or the writer is gone.
    pub async fn next(&mut self) -> Option<String> {
        match self.rx.recv().await {
            Some(Slot::Text(text)) => Some(text),
            Some(Slot::Done) | None => {
                self.rx.close();
                None
            }
        }
    }
}
