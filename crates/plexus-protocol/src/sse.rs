use bytes::Bytes;

/// One server-sent event: optional `event:` name plus the joined `data:`
/// payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Wire encoding: `event: <name>\n` (when named), one `data:` line per
    /// payload line, blank-line terminator.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// A classified SSE line, with its value already owned so frame state
/// can be updated without borrowing the byte buffer.
#[derive(Debug)]
enum SseField {
    /// `: keep-alive` style comment, or an `id:`/`retry:`/vendor field.
    Ignored,
    /// `event:`; an empty name clears the pending event.
    Event(Option<String>),
    /// `data:`; a bare `data` line contributes an empty payload line.
    Data(String),
}

fn classify_line(line: &[u8]) -> SseField {
    if line.first() == Some(&b':') {
        return SseField::Ignored;
    }
    let (name, value) = match line.iter().position(|&b| b == b':') {
        Some(colon) => (&line[..colon], Some(field_value(&line[colon + 1..]))),
        None => (line, None),
    };
    match name {
        b"event" => SseField::Event(value.filter(|v| !v.is_empty())),
        b"data" => SseField::Data(value.unwrap_or_default()),
        _ => SseField::Ignored,
    }
}

/// Field values drop the single optional space after the colon.
fn field_value(raw: &[u8]) -> String {
    let raw = raw.strip_prefix(b" ").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Incremental SSE splitter. Raw bytes accumulate in one buffer that is
/// scanned by offset and compacted once per push, so a multi-byte UTF-8
/// sequence split across chunks survives intact. Comment lines are
/// skipped, CR is stripped, multiple `data:` lines within one event are
/// joined with `\n`.
#[derive(Debug, Default)]
pub struct SseSplitter {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl SseSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        self.feed(chunk)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.feed(chunk.as_bytes())
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut cursor = 0;
        while let Some(newline) = next_newline(&self.buffer, cursor) {
            let line = strip_cr(&self.buffer[cursor..newline]);
            if line.is_empty() {
                self.flush(&mut frames);
            } else {
                let field = classify_line(line);
                self.apply(field);
            }
            cursor = newline + 1;
        }
        if cursor > 0 {
            self.buffer = self.buffer.split_off(cursor);
        }
        frames
    }

    /// Drain whatever remains at end of stream. A field line without its
    /// blank-line terminator still completes the pending frame; the
    /// caller decides whether to warn about it.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            let line = strip_cr(&tail);
            if !line.is_empty() {
                let field = classify_line(line);
                self.apply(field);
            }
        }
        let mut frames = Vec::new();
        self.flush(&mut frames);
        frames
    }

    fn apply(&mut self, field: SseField) {
        match field {
            SseField::Ignored => {}
            SseField::Event(name) => self.event = name,
            SseField::Data(value) => match &mut self.data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&value);
                }
                None => self.data = Some(value),
            },
        }
    }

    fn flush(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data.is_none() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data.take().unwrap_or_default(),
        });
    }
}

fn next_newline(buffer: &[u8], from: usize) -> Option<usize> {
    buffer[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_data_only_events() {
        let mut splitter = SseSplitter::new();
        let frames = splitter.push_str("data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "[DONE]");
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn splits_named_events_and_joins_data_lines() {
        let mut splitter = SseSplitter::new();
        let frames =
            splitter.push_str("event: message_start\ndata: {\"x\":\ndata: 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"x\":\n1}");
    }

    #[test]
    fn tolerates_comments_crlf_and_partial_chunks() {
        let mut splitter = SseSplitter::new();
        assert!(splitter.push_str(": keep-alive\r\ndata: par").is_empty());
        let frames = splitter.push_str("tial\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "partial");
    }

    #[test]
    fn keeps_a_multibyte_sequence_split_across_chunks() {
        let mut splitter = SseSplitter::new();
        let encoded = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let head = Bytes::copy_from_slice(&encoded[..8]);
        let tail = Bytes::copy_from_slice(&encoded[8..]);
        assert!(splitter.push_bytes(&head).is_empty());
        let frames = splitter.push_bytes(&tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn finish_completes_unterminated_frame() {
        let mut splitter = SseSplitter::new();
        assert!(splitter.push_str("data: tail").is_empty());
        let frames = splitter.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "tail");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut splitter = SseSplitter::new();
        let frames = splitter.push_str("id: 7\nretry: 100\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn encode_round_trips() {
        let frame = SseFrame::named("content_block_delta", "{\"k\":\"v\"}");
        let mut splitter = SseSplitter::new();
        let bytes = frame.encode();
        let frames = splitter.push_str(std::str::from_utf8(&bytes).unwrap());
        assert_eq!(frames, vec![frame]);
    }
}
