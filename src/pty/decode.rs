//! Incremental decoding of raw PTY bytes into text.
//!
//! PTY reads land on arbitrary byte boundaries, so a multi-byte UTF-8
//! character or a `\r\n` pair can be split across two chunks. The decoder
//! holds back the incomplete tail until the next chunk arrives.

/// Streaming bytes-to-text decoder.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
    pending_cr: bool,
    normalize_newlines: bool,
}

impl OutputDecoder {
    /// Create a decoder. With `normalize_newlines`, the terminal's `\r\n`
    /// output translation is folded back to `\n`; lone `\r` is preserved.
    pub fn new(normalize_newlines: bool) -> Self {
        Self {
            pending: Vec::new(),
            pending_cr: false,
            normalize_newlines,
        }
    }

    /// Decode the next chunk. Bytes that cannot be decoded yet stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::new();
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_up_to]));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            start = valid_up_to;
                            break;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_up_to + len;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        self.translate(text)
    }

    /// Flush anything still held back (end of stream).
    pub fn finish(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        let mut out = self.translate(String::from_utf8_lossy(&bytes).into_owned());
        if self.pending_cr {
            self.pending_cr = false;
            out.push('\r');
        }
        out
    }

    fn translate(&mut self, text: String) -> String {
        if !self.normalize_newlines {
            return text;
        }

        let mut out = String::with_capacity(text.len() + 1);
        for c in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if c != '\n' {
                    out.push('\r');
                }
            }
            if c == '\r' {
                self.pending_cr = true;
            } else {
                out.push(c);
            }
        }
        out
    }
}
