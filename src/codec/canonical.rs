//! Canonical event serialization and content-hash computation.
//!
//! This is part of the event-id hash domain, so it is hand-written rather
//! than delegated to a general-purpose JSON crate: the exact escaping rules
//! (§4.1) must be bit-for-bit stable across runs and across the wire-level
//! collaborator that produced the original event.

use sha2::{Digest, Sha256};

use crate::event::Event;

/// Serialize `[0, pubkey_hex, created_at, kind, tags, content]` as compact
/// UTF-8 JSON with NIP-01 escaping, and return its SHA-256 digest — the
/// event id.
pub fn compute_id(event: &Event) -> [u8; 32] {
    let json = canonical_json(event);
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn canonical_json(event: &Event) -> String {
    let mut out = String::with_capacity(event.content.len() + 128);
    out.push('[');
    out.push('0');
    out.push(',');
    push_json_string(&mut out, &event.pubkey.to_hex());
    out.push(',');
    out.push_str(&event.created_at.to_string());
    out.push(',');
    out.push_str(&event.kind.0.to_string());
    out.push(',');
    out.push('[');
    for (i, tag) in event.tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, field) in tag.0.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            push_json_string(&mut out, field);
        }
        out.push(']');
    }
    out.push(']');
    out.push(',');
    push_json_string(&mut out, &event.content);
    out.push(']');
    out
}

/// Push `s` as a double-quoted JSON string, escaping `"`, `\`, and control
/// characters below 0x20 with the named short forms where they exist
/// (`\n \r \t \b \f`) and `\u00XX` otherwise. No HTML-escaping of `< > &`.
fn push_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
