//! Optional diagnostic sink.
//!
//! Every trace line is also emitted as a `tracing` debug event; the sink is
//! for embedders that want a plain text log per connection.

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;

use crate::options::TraceLevels;

pub(crate) struct Tracer {
    level: Mutex<TraceLevels>,
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl Tracer {
    pub fn new(level: TraceLevels) -> Self {
        Self {
            level: Mutex::new(level),
            sink: Mutex::new(None),
        }
    }

    pub fn level(&self) -> TraceLevels {
        *self.level.lock()
    }

    pub fn set_level(&self, level: TraceLevels) {
        *self.level.lock() = level;
    }

    pub fn set_sink(&self, sink: Option<Box<dyn Write + Send>>) {
        *self.sink.lock() = sink;
    }

    pub fn trace(&self, level: TraceLevels, connection_id: Option<&str>, args: fmt::Arguments<'_>) {
        let connection_id = connection_id.unwrap_or("-");
        tracing::debug!(target: "pushwire::trace", connection_id, "{args}");

        if !self.level().contains(level) {
            return;
        }
        // Writes are serialized so lines never interleave.
        let mut sink = self.sink.lock();
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = writeln!(sink, "{connection_id} - {args}") {
                tracing::warn!("trace sink write failed: {e}");
            }
        }
    }
}
