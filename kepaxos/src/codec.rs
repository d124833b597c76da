//! Wire codec (§4.4): big-endian, length-framed protocol messages.
//!
//! ```text
//! u16 sender_len              (includes trailing NUL in the sender string)
//! u8[sender_len] sender       (NUL-terminated)
//! u64 ballot                  (transmitted as two u32: high then low)
//! u64 seq                     (transmitted as two u32: high then low)
//! u8  mtype                   (1..5)
//! u8  ctype                   (application command type byte; 0 for control frames)
//! u8  committed               (0 or 1)
//! u32 klen
//! u8[klen] key
//! u32 dlen
//! u8[dlen] data
//! ```

use crate::ballot::Ballot;
use crate::error::CodecError;

/// Minimum valid frame length: no sender, no key, no data.
pub const MIN_FRAME_LEN: usize = 3 + 6 * 4 + 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    PreAccept = 1,
    PreAcceptResponse = 2,
    Accept = 3,
    AcceptResponse = 4,
    Commit = 5,
}

impl MessageType {
    fn from_byte(b: u8) -> Result<Self, CodecError> {
        match b {
            1 => Ok(MessageType::PreAccept),
            2 => Ok(MessageType::PreAcceptResponse),
            3 => Ok(MessageType::Accept),
            4 => Ok(MessageType::AcceptResponse),
            5 => Ok(MessageType::Commit),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }

    fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded protocol message, paired with its sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub ballot: Ballot,
    pub seq: u64,
    pub ctype: u8,
    pub committed: bool,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub mtype: MessageType,
}

impl Message {
    /// Build a control frame (`PRE_ACCEPT`/`ACCEPT`) with no data, `ctype = 0`.
    pub fn control(
        mtype: MessageType,
        sender: impl Into<String>,
        ballot: Ballot,
        key: impl Into<Vec<u8>>,
        seq: u64,
    ) -> Self {
        Message {
            sender: sender.into(),
            ballot,
            seq,
            ctype: 0,
            committed: false,
            key: key.into(),
            data: Vec::new(),
            mtype,
        }
    }

    /// Build a response frame (`*_RESPONSE`) carrying the `committed` flag.
    pub fn response(
        mtype: MessageType,
        sender: impl Into<String>,
        ballot: Ballot,
        key: impl Into<Vec<u8>>,
        seq: u64,
        committed: bool,
    ) -> Self {
        Message {
            sender: sender.into(),
            ballot,
            seq,
            ctype: 0,
            committed,
            key: key.into(),
            data: Vec::new(),
            mtype,
        }
    }

    /// Build a `COMMIT` frame, which is the only frame carrying `ctype`/`data`.
    pub fn commit(
        sender: impl Into<String>,
        ballot: Ballot,
        ctype: u8,
        key: impl Into<Vec<u8>>,
        data: impl Into<Vec<u8>>,
        seq: u64,
    ) -> Self {
        Message {
            sender: sender.into(),
            ballot,
            seq,
            ctype,
            committed: false,
            key: key.into(),
            data: data.into(),
            mtype: MessageType::Commit,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let sender_bytes = self.sender.as_bytes();
        // +1 for the trailing NUL included in sender_len.
        let sender_len = sender_bytes.len() + 1;
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + sender_len + self.key.len() + self.data.len());

        out.extend_from_slice(&(sender_len as u16).to_be_bytes());
        out.extend_from_slice(sender_bytes);
        out.push(0);

        let ballot = self.ballot.raw();
        out.extend_from_slice(&((ballot >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(ballot as u32).to_be_bytes());

        out.extend_from_slice(&((self.seq >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(self.seq as u32).to_be_bytes());

        out.push(self.mtype.as_byte());
        out.push(self.ctype);
        out.push(self.committed as u8);

        out.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);

        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);

        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MIN_FRAME_LEN {
            return Err(CodecError::Truncated {
                got: buf.len(),
                min: MIN_FRAME_LEN,
            });
        }

        let mut cursor = Cursor::new(buf);
        let sender_len = cursor.take_u16()? as usize;
        let sender_bytes = cursor.take_n(sender_len, "sender")?;
        if sender_len == 0 || sender_bytes[sender_len - 1] != 0 {
            return Err(CodecError::SenderNotTerminated);
        }
        let sender = String::from_utf8_lossy(&sender_bytes[..sender_len - 1]).into_owned();

        let ballot_hi = cursor.take_u32()? as u64;
        let ballot_lo = cursor.take_u32()? as u64;
        let ballot = Ballot::from_raw((ballot_hi << 32) | ballot_lo);

        let seq_hi = cursor.take_u32()? as u64;
        let seq_lo = cursor.take_u32()? as u64;
        let seq = (seq_hi << 32) | seq_lo;

        let mtype = MessageType::from_byte(cursor.take_u8()?)?;
        let ctype = cursor.take_u8()?;
        let committed = cursor.take_u8()? != 0;

        let klen = cursor.take_u32()? as usize;
        let key = cursor.take_n(klen, "key")?.to_vec();

        let dlen = cursor.take_u32()? as usize;
        let data = cursor.take_n(dlen, "data")?.to_vec();

        Ok(Message {
            sender,
            ballot,
            seq,
            ctype,
            committed,
            key,
            data,
            mtype,
        })
    }
}

/// Tiny forward-only byte cursor so `decode` stays linear and bounds-checked.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take_n(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(CodecError::FieldOverrun { field })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_n(1, "u8")?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take_n(2, "u16")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take_n(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mtype: MessageType) -> Message {
        Message {
            sender: "node1".into(),
            ballot: Ballot::new(7, 2),
            seq: 42,
            ctype: 9,
            committed: true,
            key: b"test_key".to_vec(),
            data: b"test_value".to_vec(),
            mtype,
        }
    }

    #[test]
    fn round_trip_every_message_type() {
        for mtype in [
            MessageType::PreAccept,
            MessageType::PreAcceptResponse,
            MessageType::Accept,
            MessageType::AcceptResponse,
            MessageType::Commit,
        ] {
            let msg = sample(mtype);
            let encoded = msg.encode();
            let decoded = Message::decode(&encoded).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn round_trip_empty_fields() {
        let msg = Message::control(MessageType::PreAccept, "", Ballot::zero(), Vec::new(), 0);
        let encoded = msg.encode();
        // `MIN_FRAME_LEN` is the decoder's conservative lower bound; an
        // actual empty-sender frame is one byte longer since `encode`
        // always appends the sender's trailing NUL.
        assert_eq!(encoded.len(), MIN_FRAME_LEN + 1);
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_truncated_frame() {
        let msg = sample(MessageType::Commit);
        let encoded = msg.encode();
        let truncated = &encoded[..encoded.len() - 1];
        assert!(Message::decode(truncated).is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        let err = Message::decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut encoded = sample(MessageType::Commit).encode();
        // mtype byte sits right after the sender_len(2) + sender(6) + ballot(8) + seq(8).
        let mtype_offset = 2 + 6 + 8 + 8;
        encoded[mtype_offset] = 0xff;
        assert!(matches!(
            Message::decode(&encoded),
            Err(CodecError::UnknownMessageType(0xff))
        ));
    }

    #[test]
    fn decoded_shape_matches_expected_fields() {
        let msg = sample(MessageType::PreAcceptResponse);
        let decoded = Message::decode(&msg.encode()).unwrap();

        let shape = serde_json::json!({
            "sender": decoded.sender,
            "ballot": decoded.ballot.raw(),
            "seq": decoded.seq,
            "ctype": decoded.ctype,
            "committed": decoded.committed,
        });
        assert_eq!(shape["sender"], "node1");
        assert_eq!(shape["ballot"], Ballot::new(7, 2).raw());
        assert_eq!(shape["seq"], 42);
        assert_eq!(shape["ctype"], 9);
        assert_eq!(shape["committed"], true);
    }
}
