/*!
 * @file codec/reader.rs
 * @brief Incremental OP_REPLY parser (component C)
 *
 * `feed` appends bytes; `poll` extracts as many replies as are fully
 * buffered, one per call, never blocking and always restartable across
 * arbitrary chunk boundaries. Unconsumed trailing bytes stay buffered.
 */

use crate::codec::pack::{unpack_from, UnpackedValue};
use crate::error::{MongoError, Result};
use crate::wire::{HEADER_LEN, MAX_MESSAGE_LENGTH};

/// Once the consumed prefix grows past this many bytes (and there's
/// nothing unconsumed left to preserve beyond it), the buffer is
/// compacted so long-lived connections don't retain an ever-growing
/// `Vec`.
const COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
struct Header {
    message_length: u32,
}

#[derive(Debug)]
enum ReaderState {
    NeedHeader,
    NeedBody(Header),
}

/// A parsed reply. The reader only ever yields `Document` (the shape of an
/// OP_REPLY frame); the other variants exist for API parity with the
/// tagged `mongoReply` the callback-facing API historically returned once
/// a caller decodes the BSON documents it carries.
#[derive(Debug, Clone)]
pub enum Reply {
    Integer(i64),
    Str(Vec<u8>),
    Array(Vec<Reply>),
    Document {
        response_flags: i32,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Vec<u8>>,
    },
}

impl Reply {
    /// Cursor identifier for cursor-producing replies; zero means "no more
    /// batches" (used by the async controller's EXHAUST retention policy).
    pub fn cursor_id(&self) -> i64 {
        match self {
            Reply::Document { cursor_id, .. } => *cursor_id,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct ReplyReader {
    input: Vec<u8>,
    consumed: usize,
    state: ReaderState,
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyReader {
    pub fn new() -> Self {
        ReplyReader {
            input: Vec::new(),
            consumed: 0,
            state: ReaderState::NeedHeader,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Extracts the next fully-buffered reply, if any. Returns `Ok(None)`
    /// when more bytes are needed; never blocks.
    pub fn poll(&mut self) -> Result<Option<Reply>> {
        loop {
            match self.state {
                ReaderState::NeedHeader => {
                    let available = self.input.len() - self.consumed;
                    if available < HEADER_LEN {
                        return Ok(None);
                    }
                    let header_bytes =
                        &self.input[self.consumed..self.consumed + HEADER_LEN];
                    let (values, _) = unpack_from(header_bytes, 0, "<iiii")?;
                    let message_length = as_u32(&values[0]);
                    // values[1] requestID, values[2] responseTo are not
                    // inspected by this core (no request multiplexing);
                    // values[3] is the opcode, also unused — a reply is a
                    // reply regardless of the opcode tag.
                    if message_length < HEADER_LEN as u32 || message_length > MAX_MESSAGE_LENGTH {
                        return Err(MongoError::Protocol(format!(
                            "invalid messageLength {message_length}"
                        )));
                    }
                    self.consumed += HEADER_LEN;
                    self.state = ReaderState::NeedBody(Header { message_length });
                }
                ReaderState::NeedBody(header) => {
                    let body_len = (header.message_length as usize) - HEADER_LEN;
                    let available = self.input.len() - self.consumed;
                    if available < body_len {
                        return Ok(None);
                    }
                    let body = &self.input[self.consumed..self.consumed + body_len];
                    let reply = parse_reply_body(body)?;
                    self.consumed += body_len;
                    self.state = ReaderState::NeedHeader;
                    self.maybe_compact();
                    return Ok(Some(reply));
                }
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.consumed == self.input.len() {
            self.input.clear();
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD {
            self.input.drain(0..self.consumed);
            self.consumed = 0;
        }
    }
}

fn as_u32(v: &UnpackedValue) -> u32 {
    match v {
        UnpackedValue::U32(x) => *x,
        _ => unreachable!("header directive always decodes to U32"),
    }
}

fn parse_reply_body(body: &[u8]) -> Result<Reply> {
    let (values, mut pos) = unpack_from(body, 0, "<iqii")?;
    let response_flags = as_u32(&values[0]) as i32;
    let cursor_id = match &values[1] {
        UnpackedValue::U64(v) => *v as i64,
        _ => unreachable!(),
    };
    let starting_from = as_u32(&values[2]) as i32;
    let number_returned = as_u32(&values[3]);

    let mut documents = Vec::new();
    for _ in 0..number_returned {
        if pos + 4 > body.len() {
            break;
        }
        let doc_len = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        if doc_len < 4 || pos + doc_len > body.len() {
            return Err(MongoError::Protocol(format!(
                "truncated document at offset {pos} (len {doc_len})"
            )));
        }
        documents.push(body[pos..pos + doc_len].to_vec());
        pos += doc_len;
    }

    Ok(Reply::Document {
        response_flags,
        cursor_id,
        starting_from,
        documents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack::{pack_append, PackArg};

    fn sample_reply(cursor_id: i64, docs: &[&[u8]]) -> Vec<u8> {
        let mut body = pack_append(
            "<iqii",
            &[
                PackArg::U32(0),
                PackArg::U64(cursor_id as u64),
                PackArg::U32(0),
                PackArg::U32(docs.len() as u32),
            ],
        );
        for d in docs {
            body.extend_from_slice(d);
        }
        let message_length = (16 + body.len()) as u32;
        let mut frame = pack_append(
            "<iiii",
            &[
                PackArg::U32(message_length),
                PackArg::U32(1),
                PackArg::U32(0),
                PackArg::U32(1),
            ],
        );
        frame.extend_from_slice(&body);
        frame
    }

    fn bson_doc(field_value: i32) -> Vec<u8> {
        bson::to_vec(&bson::doc! { "n": field_value }).unwrap()
    }

    #[test]
    fn scenario_6_split_frame_across_header_and_body() {
        let doc = bson_doc(1);
        let frame = sample_reply(0, &[&doc]);

        let mut whole = ReplyReader::new();
        whole.feed(&frame);
        let reply_whole = whole.poll().unwrap().unwrap();

        // Split inside the header.
        let mut split_header = ReplyReader::new();
        split_header.feed(&frame[0..5]);
        assert!(split_header.poll().unwrap().is_none());
        split_header.feed(&frame[5..]);
        let reply_split_header = split_header.poll().unwrap().unwrap();

        // Split inside the body.
        let mut split_body = ReplyReader::new();
        let body_split_at = 16 + 10;
        split_body.feed(&frame[0..body_split_at]);
        assert!(split_body.poll().unwrap().is_none());
        split_body.feed(&frame[body_split_at..]);
        let reply_split_body = split_body.poll().unwrap().unwrap();

        for reply in [reply_whole, reply_split_header, reply_split_body] {
            match reply {
                Reply::Document {
                    cursor_id,
                    documents,
                    ..
                } => {
                    assert_eq!(cursor_id, 0);
                    assert_eq!(documents, vec![doc.clone()]);
                }
                _ => panic!("expected Document reply"),
            }
        }
    }

    #[test]
    fn rejects_message_length_below_header_size() {
        let mut reader = ReplyReader::new();
        // message_length = 4, well below the 16-byte header floor.
        let frame = pack_append(
            "<iiii",
            &[PackArg::U32(4), PackArg::U32(1), PackArg::U32(0), PackArg::U32(1)],
        );
        reader.feed(&frame);
        let err = reader.poll().unwrap_err();
        assert!(matches!(err, MongoError::Protocol(_)));
    }

    #[test]
    fn rejects_message_length_above_maximum() {
        let mut reader = ReplyReader::new();
        let frame = pack_append(
            "<iiii",
            &[
                PackArg::U32(MAX_MESSAGE_LENGTH + 1),
                PackArg::U32(1),
                PackArg::U32(0),
                PackArg::U32(1),
            ],
        );
        reader.feed(&frame);
        let err = reader.poll().unwrap_err();
        assert!(matches!(err, MongoError::Protocol(_)));
    }

    #[test]
    fn leaves_trailing_bytes_for_the_next_poll() {
        let doc = bson_doc(7);
        let frame = sample_reply(0, &[&doc]);
        let mut reader = ReplyReader::new();
        let mut combined = frame.clone();
        combined.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        reader.feed(&combined);
        let reply = reader.poll().unwrap();
        assert!(reply.is_some());
        assert!(reader.poll().unwrap().is_none());
        assert_eq!(reader.input.len() - reader.consumed, 3);
    }

    #[test]
    fn multiple_replies_back_to_back() {
        let doc_a = bson_doc(1);
        let doc_b = bson_doc(2);
        let mut combined = sample_reply(5, &[&doc_a]);
        combined.extend_from_slice(&sample_reply(0, &[&doc_b]));

        let mut reader = ReplyReader::new();
        reader.feed(&combined);
        let first = reader.poll().unwrap().unwrap();
        let second = reader.poll().unwrap().unwrap();
        assert_eq!(first.cursor_id(), 5);
        assert_eq!(second.cursor_id(), 0);
        assert!(reader.poll().unwrap().is_none());
    }
}
