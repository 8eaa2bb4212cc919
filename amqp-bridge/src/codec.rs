use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Splits a byte stream into chunks which are separated by a byte sequence. The separator is not
/// part of the chunks.
///
/// At the end of the stream a non-empty remainder is emitted as the last chunk, an empty one is
/// dropped.
pub struct SeparatorCodec {
    separator: Vec<u8>,
    /// Position in the buffer before which we know there is no separator.
    next_index: usize,
    /// The buffer was consumed up to a separator.
    after_separator: bool,
}

impl SeparatorCodec {
    pub fn new(separator: impl Into<Vec<u8>>) -> Self {
        SeparatorCodec {
            separator: separator.into(),
            next_index: 0,
            after_separator: false,
        }
    }

    /// The last chunk was followed by a separator and nothing else. At the end of the stream it
    /// means an empty last chunk was dropped.
    pub fn ended_with_separator(&self) -> bool {
        self.after_separator
    }

    fn find_separator(&self, src: &[u8]) -> Option<usize> {
        if self.separator.is_empty() || src.len() < self.separator.len() {
            return None;
        }

        src[self.next_index..]
            .windows(self.separator.len())
            .position(|window| window == self.separator.as_slice())
            .map(|pos| pos + self.next_index)
    }
}

impl Decoder for SeparatorCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.find_separator(src) {
            Some(pos) => {
                let chunk = src.split_to(pos).freeze();
                let _separator = src.split_to(self.separator.len());
                self.next_index = 0;
                self.after_separator = src.is_empty();

                Ok(Some(chunk))
            }
            None => {
                // the end of the buffer can be the beginning of a separator
                self.next_index = (src.len() + 1).saturating_sub(self.separator.len());
                self.after_separator &= src.is_empty();

                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }

        self.next_index = 0;

        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}
