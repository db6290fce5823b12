//! The `v1.kernel.websocket.jupyter.org` binary framing used between a
//! browser client and this gateway.
//!
//! This is very similar to the ZeroMQ wire format, but uses a small
//! offset-table framing so a message (including any binary buffers) can be
//! sent as a single WebSocket binary payload instead of raw multipart
//! frames. All integers are little-endian (offsets are counted in bytes):
//!
//! ```text
//! 0:  offset_count (n+1)
//! 8:  offset_0
//! 16: offset_1
//! ...
//! 8*offset_count: offset_n
//! offset_0: channel
//! offset_1: header
//! offset_2: parent_header
//! offset_3: metadata
//! offset_4: content
//! offset_5: buffer_0
//! (offset_6: buffer_1, ...)
//! ```
//!
//! The gateway sits on the server side of this protocol, so it both encodes
//! outgoing frames and decodes incoming ones.

use bytes::Bytes;

use super::Message;

/// Encode a message plus its channel name into a single binary WS payload.
pub fn encode(msg: &Message, channel: &str) -> Option<Vec<u8>> {
    let offset_count = 5 + msg.buffers.len() as u64;
    let offset_0 = 8 * (offset_count + 1);
    let mut offsets = vec![offset_count];
    let mut payload = Vec::new();

    offsets.push(offset_0 + payload.len() as u64);
    payload.extend_from_slice(channel.as_bytes());

    offsets.push(offset_0 + payload.len() as u64);
    payload.append(&mut serde_json::to_vec(&msg.header).ok()?);

    offsets.push(offset_0 + payload.len() as u64);
    payload.append(&mut serde_json::to_vec(&msg.parent_header).ok()?);

    offsets.push(offset_0 + payload.len() as u64);
    payload.append(&mut serde_json::to_vec(&msg.metadata).ok()?);

    offsets.push(offset_0 + payload.len() as u64);
    payload.append(&mut serde_json::to_vec(&msg.content).ok()?);

    for buffer in &msg.buffers {
        offsets.push(offset_0 + payload.len() as u64);
        payload.extend_from_slice(buffer);
    }

    Some(
        offsets
            .into_iter()
            .flat_map(|n| n.to_le_bytes())
            .chain(payload)
            .collect(),
    )
}

/// Decode a binary WS payload into a message and its channel name.
pub fn decode(payload: &[u8]) -> Option<(Message, String)> {
    let offset_count: usize = u64::from_le_bytes(payload.get(0..8)?.try_into().ok()?)
        .try_into()
        .ok()?;

    let mut offsets = Vec::with_capacity(offset_count);
    for i in 0..offset_count {
        let index = 8 * (i + 1);
        offsets.push(
            u64::from_le_bytes(payload.get(index..index + 8)?.try_into().ok()?)
                .try_into()
                .ok()?,
        );
    }
    offsets.push(payload.len());

    if offsets.len() < 6 {
        return None;
    }

    let channel = String::from_utf8(payload.get(offsets[0]..offsets[1])?.to_vec()).ok()?;
    let header = serde_json::from_slice(payload.get(offsets[1]..offsets[2])?).ok()?;
    let parent_header = serde_json::from_slice(payload.get(offsets[2]..offsets[3])?).ok()?;
    let metadata = serde_json::from_slice(payload.get(offsets[3]..offsets[4])?).ok()?;
    let content = serde_json::from_slice(payload.get(offsets[4]..offsets[5])?).ok()?;

    let mut buffers = Vec::new();
    for i in 5..offset_count {
        buffers.push(Bytes::from(payload.get(offsets[i]..offsets[i + 1])?.to_vec()));
    }

    let msg = Message {
        header,
        parent_header,
        metadata,
        content,
        buffers,
    };
    Some((msg, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageType;

    #[test]
    fn encode_decode_round_trip_preserves_channel_and_content() {
        let msg = Message::new(
            MessageType::ExecuteRequest,
            "session-1",
            serde_json::json!({"code": "1+1"}),
        );
        let encoded = encode(&msg, "shell").expect("encode");
        let (decoded, channel) = decode(&encoded).expect("decode");
        assert_eq!(channel, "shell");
        assert_eq!(decoded.header.msg_id, msg.header.msg_id);
        assert_eq!(decoded.content, msg.content);
    }

    #[test]
    fn encode_decode_preserves_buffers() {
        let mut msg = Message::new(MessageType::Stream, "s", serde_json::json!({}));
        msg.buffers = vec![Bytes::from_static(b"\x00\x01\x02"), Bytes::from_static(b"hi")];
        let encoded = encode(&msg, "iopub").expect("encode");
        let (decoded, _) = decode(&encoded).expect("decode");
        assert_eq!(decoded.buffers, msg.buffers);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        assert!(decode(&[1, 2, 3]).is_none());
    }
}
