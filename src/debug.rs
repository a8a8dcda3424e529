use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

// JSON-lines instrumentation for the encoder and assembler. One logger is
// shared across a whole document build; counters accumulate until
// emit_summary drains them.
#[derive(Clone)]
pub(crate) struct DebugLogger {
    inner: Arc<Mutex<DebugState>>,
}

struct DebugState {
    writer: BufWriter<File>,
    counters: HashMap<String, u64>,
    span_totals: HashMap<String, f64>,
}

impl DebugLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(DebugState {
                writer: BufWriter::new(file),
                counters: HashMap::new(),
                span_totals: HashMap::new(),
            })),
        })
    }

    #[allow(dead_code)]
    pub fn log_json(&self, json: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn increment(&self, key: &str, amount: u64) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.counters.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn log_span_ms(&self, name: &str, ms: f64) {
        let json = format!(
            "{{\"type\":\"span\",\"name\":\"{}\",\"unit\":\"ms\",\"ms\":{:.3}}}",
            json_escape(name),
            ms
        );
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn emit_summary(&self, context: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let mut counters: Vec<(String, u64)> = state.counters.drain().collect();
            counters.sort_by(|a, b| a.0.cmp(&b.0));
            let mut spans: Vec<(String, f64)> = state.span_totals.drain().collect();
            spans.sort_by(|a, b| a.0.cmp(&b.0));

            let mut out = format!(
                "{{\"type\":\"summary\",\"context\":\"{}\",\"counts\":{{",
                json_escape(context)
            );
            for (idx, (key, value)) in counters.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&format!("\"{}\":{}", json_escape(key), value));
            }
            out.push_str("},\"spans_ms\":{");
            for (idx, (key, value)) in spans.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&format!("\"{}\":{:.3}", json_escape(key), value));
            }
            out.push_str("}}");
            let _ = writeln!(state.writer, "{out}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

pub(crate) fn json_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}
