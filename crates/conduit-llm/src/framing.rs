//! Newline framing for text protocols

use futures_util::{Stream, StreamExt};

use crate::error::LlmError;

/// Rolling buffer that splits byte chunks into lines
///
/// Splitting happens on raw bytes so multi-byte characters cut across chunk
/// boundaries stay intact. The partial trailing fragment is kept until the
/// next chunk or [`LineAssembler::finish`].
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Feed a chunk, returning every line it completes
    ///
    /// Blank lines are dropped and a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Flush the trailing fragment, if it holds anything
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r');
    (!line.trim().is_empty()).then(|| line.to_owned())
}

/// Turn a byte stream into a stream of non-blank lines
pub fn lines<S, B, E>(body: S) -> impl Stream<Item = Result<String, LlmError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<LlmError> + Send,
{
    async_stream::stream! {
        let mut assembler = LineAssembler::default();
        let mut body = std::pin::pin!(body);

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in assembler.push(bytes.as_ref()) {
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        if let Some(line) = assembler.finish() {
            yield Ok(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    #[test]
    fn keeps_partial_fragment_between_chunks() {
        let mut assembler = LineAssembler::default();

        assert!(assembler.push(b"{\"a\":").is_empty());
        assert_eq!(assembler.push(b"1}\n{\"b\""), vec!["{\"a\":1}".to_owned()]);
        assert_eq!(assembler.push(b":2}\r\n\n"), vec!["{\"b\":2}".to_owned()]);
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let text = "héllo\n".as_bytes();
        let (first, second) = text.split_at(2);

        let mut assembler = LineAssembler::default();
        assert!(assembler.push(first).is_empty());
        assert_eq!(assembler.push(second), vec!["héllo".to_owned()]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push(b"{\"done\":true}").is_empty());
        assert_eq!(assembler.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[tokio::test]
    async fn line_stream_stops_at_first_error() {
        let chunks: Vec<Result<&'static [u8], LlmError>> = vec![
            Ok(&b"one\ntw"[..]),
            Ok(&b"o\n"[..]),
            Err(LlmError::Transport("reset".to_owned())),
            Ok(&b"three\n"[..]),
        ];

        let collected: Vec<_> = lines(stream::iter(chunks)).collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].as_deref().unwrap(), "one");
        assert_eq!(collected[1].as_deref().unwrap(), "two");
        assert!(matches!(collected[2], Err(LlmError::Transport(_))));
    }
}
