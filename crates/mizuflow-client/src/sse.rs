// Minimal server-sent-events parsing: byte chunks -> lines -> events.
//
// The transport hands us arbitrary byte chunks; an event is one or more
// `event:`/`data:` lines terminated by a blank line. Multiple `data:` lines
// are joined with a newline per the SSE format.

/// Splits an incoming byte stream into complete lines, tolerating chunk
/// boundaries anywhere (including mid-UTF-8 and mid-CRLF).
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) event: String,
    pub(crate) data: String,
}

/// Accumulates lines into events. Feed every line (blank ones included);
/// a completed event is returned at each blank-line boundary.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: String,
    data: String,
}

impl SseParser {
    pub(crate) fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_empty() && self.data.is_empty() {
                return None;
            }
            let event = SseEvent {
                event: if self.event.is_empty() {
                    "message".to_string()
                } else {
                    std::mem::take(&mut self.event)
                },
                data: std::mem::take(&mut self.data),
            };
            self.event.clear();
            return Some(event);
        }
        // Comment lines keep the connection warm; nothing to record.
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value.trim());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_blocks() {
        let mut parser = SseParser::default();
        assert!(parser.push_line("event: message").is_none());
        assert!(parser.push_line("data: {\"k\":1}").is_none());
        let event = parser.push_line("").expect("event");
        assert_eq!(event.event, "message");
        assert_eq!(event.data, "{\"k\":1}");
    }

    #[test]
    fn event_type_defaults_to_message() {
        let mut parser = SseParser::default();
        parser.push_line("data: pong");
        let event = parser.push_line("").expect("event");
        assert_eq!(event.event, "message");
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut parser = SseParser::default();
        parser.push_line("data: a");
        parser.push_line("data: b");
        let event = parser.push_line("").expect("event");
        assert_eq!(event.data, "a\nb");
    }

    #[test]
    fn comments_and_stray_blanks_are_skipped() {
        let mut parser = SseParser::default();
        assert!(parser.push_line(": keep-alive").is_none());
        assert!(parser.push_line("").is_none());
        parser.push_line("event: ping");
        parser.push_line("data: pong");
        let event = parser.push_line("").expect("event");
        assert_eq!(event.event, "ping");
        assert_eq!(event.data, "pong");
    }

    #[test]
    fn splitter_handles_arbitrary_chunk_boundaries() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"event: mes").is_empty());
        let lines = splitter.push(b"sage\r\ndata: x\n\nevent");
        assert_eq!(lines, vec!["event: message", "data: x", ""]);
        let lines = splitter.push(b": ping\n");
        assert_eq!(lines, vec!["event: ping"]);
    }
}
