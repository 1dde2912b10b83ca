//! Splitting raw log chunks into lines

/// Lines of a chunked byte stream.
///
/// A line is yielded once its `\n` has been seen and keeps the separator.
/// Whatever follows the last separator is yielded when the stream ends.
/// Bytes are decoded per line, so multi-byte characters split across chunks
/// survive.
pub struct SplitBuffer<I> {
    chunks: I,
    buffered: Vec<u8>,
    exhausted: bool,
}

pub fn split_buffer<I, E>(chunks: I) -> SplitBuffer<I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<u8>, E>>,
{
    SplitBuffer {
        chunks: chunks.into_iter(),
        buffered: Vec::new(),
        exhausted: false,
    }
}

impl<I, E> Iterator for SplitBuffer<I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
{
    type Item = Result<String, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pos) = self.buffered.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffered.drain(..=pos).collect();
                return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.exhausted {
                if self.buffered.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.buffered);
                return Some(Ok(String::from_utf8_lossy(&rest).into_owned()));
            }

            match self.chunks.next() {
                Some(Ok(chunk)) => self.buffered.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(chunks: &[&[u8]]) -> Vec<String> {
        split_buffer(chunks.iter().map(|c| Ok::<_, ()>(c.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_lines_across_chunks() {
        assert_eq!(
            lines(&[b"hel", b"lo\nwor", b"ld\n"]),
            vec!["hello\n".to_string(), "world\n".to_string()]
        );
    }

    #[test]
    fn test_unterminated_tail_comes_last() {
        assert_eq!(
            lines(&[b"hello\nworld"]),
            vec!["hello\n".to_string(), "world".to_string()]
        );
    }

    #[test]
    fn test_multibyte_character_split() {
        let bytes = "caf\u{e9}\n".as_bytes();
        let (a, b) = bytes.split_at(4);
        assert_eq!(lines(&[a, b]), vec!["caf\u{e9}\n".to_string()]);
    }

    #[test]
    fn test_error_is_passed_through() {
        let chunks = vec![Ok(b"one\ntw".to_vec()), Err("broken")];
        let mut split = split_buffer(chunks);
        assert_eq!(split.next(), Some(Ok("one\n".to_string())));
        assert_eq!(split.next(), Some(Err("broken")));
    }

    #[test]
    fn test_empty_stream() {
        assert!(lines(&[]).is_empty());
        assert!(lines(&[b""]).is_empty());
    }
}
