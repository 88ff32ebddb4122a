//! Binary event record codec — the value stored under the primary Event key.
//!
//! Layout (§4.1):
//! `id(32) || pubkey(32) || created_at_varint || kind_u16(2) || tags || content_varbytes || sig(64)`
//! where `tags = tag_count_varint || (field_count_varint || (field_varbytes)*)*`
//! and every `*_varbytes` is `len_varint || bytes`.

use crate::codec::ints::{put_varint, read_varint};
use crate::error::EngineError;
use crate::event::{Event, EventId, Kind, PublicKey, Tag};

/// Minimum possible decoded length: 32+32+1(created_at varint, min 1 byte)
/// +2(kind)+1(tag_count varint, min 1 byte)+1(content len varint, min 1 byte)+64(sig).
pub const MIN_RECORD_LEN: usize = 32 + 32 + 1 + 2 + 1 + 1 + 64;

pub fn encode(event: &Event) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_RECORD_LEN + event.content.len());
    buf.extend_from_slice(event.id.as_bytes());
    buf.extend_from_slice(event.pubkey.as_bytes());
    put_varint(&mut buf, event.created_at as u64);
    buf.extend_from_slice(&event.kind.0.to_be_bytes());

    put_varint(&mut buf, event.tags.len() as u64);
    for tag in &event.tags {
        put_varint(&mut buf, tag.0.len() as u64);
        for field in &tag.0 {
            let bytes = field.as_bytes();
            put_varint(&mut buf, bytes.len() as u64);
            buf.extend_from_slice(bytes);
        }
    }

    let content_bytes = event.content.as_bytes();
    put_varint(&mut buf, content_bytes.len() as u64);
    buf.extend_from_slice(content_bytes);

    buf.extend_from_slice(&event.sig);
    buf
}

pub fn decode(buf: &[u8]) -> Result<Event, EngineError> {
    if buf.len() < MIN_RECORD_LEN {
        return Err(EngineError::Corrupt("record shorter than minimum length".into()));
    }

    let mut cursor = 0usize;
    let id = take_fixed::<32>(buf, &mut cursor)?;
    let pubkey = take_fixed::<32>(buf, &mut cursor)?;

    let (created_at, n) = read_varint(&buf[cursor..])
        .ok_or_else(|| EngineError::Corrupt("truncated created_at varint".into()))?;
    cursor += n;

    let kind_bytes = buf
        .get(cursor..cursor + 2)
        .ok_or_else(|| EngineError::Corrupt("truncated kind".into()))?;
    let kind = Kind(u16::from_be_bytes([kind_bytes[0], kind_bytes[1]]));
    cursor += 2;

    let (tag_count, n) = read_varint(&buf[cursor..])
        .ok_or_else(|| EngineError::Corrupt("truncated tag count".into()))?;
    cursor += n;

    let mut tags = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        let (field_count, n) = read_varint(&buf[cursor..])
            .ok_or_else(|| EngineError::Corrupt("truncated tag field count".into()))?;
        cursor += n;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let field = take_varbytes_string(buf, &mut cursor)?;
            fields.push(field);
        }
        tags.push(Tag::new(fields));
    }

    let content = take_varbytes_string(buf, &mut cursor)?;

    let sig_bytes = buf
        .get(cursor..cursor + 64)
        .ok_or_else(|| EngineError::Corrupt("truncated signature".into()))?;
    let mut sig = [0u8; 64];
    sig.copy_from_slice(sig_bytes);

    Ok(Event {
        id: EventId(id),
        pubkey: PublicKey(pubkey),
        created_at: created_at as i64,
        kind,
        tags,
        content,
        sig,
    })
}

fn take_fixed<const N: usize>(buf: &[u8], cursor: &mut usize) -> Result<[u8; N], EngineError> {
    let slice = buf
        .get(*cursor..*cursor + N)
        .ok_or_else(|| EngineError::Corrupt("truncated fixed-width field".into()))?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    *cursor += N;
    Ok(out)
}

fn take_varbytes_string(buf: &[u8], cursor: &mut usize) -> Result<String, EngineError> {
    let (len, n) = read_varint(&buf[*cursor..])
        .ok_or_else(|| EngineError::Corrupt("truncated varbytes length".into()))?;
    *cursor += n;
    let bytes = buf
        .get(*cursor..*cursor + len as usize)
        .ok_or_else(|| EngineError::Corrupt("truncated varbytes payload".into()))?;
    *cursor += len as usize;
    String::from_utf8(bytes.to_vec()).map_err(|_| EngineError::Corrupt("non-utf8 field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Kind, PublicKey, Tag};

    fn sample() -> Event {
        Event {
            id: EventId([7u8; 32]),
            pubkey: PublicKey([9u8; 32]),
            created_at: 1_700_000_123,
            kind: Kind(1),
            tags: vec![
                Tag::new(vec!["e".into(), "abc123".into()]),
                Tag::new(vec!["p".into(), "deadbeef".into(), "relay.example".into()]),
            ],
            content: "hello, world".into(),
            sig: [3u8; 64],
        }
    }

    #[test]
    fn round_trip() {
        let ev = sample();
        let buf = encode(&ev);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.id, ev.id);
        assert_eq!(decoded.pubkey, ev.pubkey);
        assert_eq!(decoded.created_at, ev.created_at);
        assert_eq!(decoded.kind, ev.kind);
        assert_eq!(decoded.tags.len(), ev.tags.len());
        assert_eq!(decoded.tags[0].0, ev.tags[0].0);
        assert_eq!(decoded.tags[1].0, ev.tags[1].0);
        assert_eq!(decoded.content, ev.content);
        assert_eq!(decoded.sig, ev.sig);
    }

    #[test]
    fn round_trip_empty_content_and_tags() {
        let mut ev = sample();
        ev.tags.clear();
        ev.content.clear();
        let buf = encode(&ev);
        let decoded = decode(&buf).unwrap();
        assert!(decoded.tags.is_empty());
        assert!(decoded.content.is_empty());
    }

    #[test]
    fn rejects_short_buffer() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }

    #[test]
    fn rejects_truncated_mid_record() {
        let ev = sample();
        let buf = encode(&ev);
        let truncated = &buf[..buf.len() - 5];
        assert!(decode(truncated).is_err());
    }
}
