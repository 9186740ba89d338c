//! Chunk wire format and hash-chain verification.
//!
//! A chunk is a time-bounded slice of a session's event stream. Its `digest`
//! is the SHA-256 of the JSON encoding of `events`; every chunk after the
//! first embeds the digest of its predecessor in `prevDigest`.
//!
//! The digest covers the bytes the producer hashed, not this crate's
//! re-encoding. A decoded chunk keeps the received `events` text (minus
//! insignificant whitespace) in [`Chunk::encoded_events`]; verification and
//! re-serialization use that text, so number spelling, key order and fields
//! this crate does not model survive storage.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::error::SerializationError;
use crate::event::SessionEvent;
use crate::hash::{hash, hash_json};
use crate::ids::{Digest, ProjectKey, SessionId, UserId};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub session_id: SessionId,
    pub project_key: ProjectKey,
    pub idx: u64,
    pub start_ts: u64,
    pub end_ts: u64,
    pub has_snapshot: bool,
    pub digest: Digest,
    pub prev_digest: Option<Digest>,
    pub fingerprint: String,
    pub user: Option<ChunkUser>,
    pub events: Vec<SessionEvent>,
    /// Received encoding of `events`. `None` for locally sealed chunks.
    /// Code that rewrites `events` on a decoded chunk must clear it.
    pub encoded_events: Option<EncodedEvents>,
}

/// Equality is over the decoded content; the retained encoding is ignored.
impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.project_key == other.project_key
            && self.idx == other.idx
            && self.start_ts == other.start_ts
            && self.end_ts == other.end_ts
            && self.has_snapshot == other.has_snapshot
            && self.digest == other.digest
            && self.prev_digest == other.prev_digest
            && self.fingerprint == other.fingerprint
            && self.user == other.user
            && self.events == other.events
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUser {
    pub id: UserId,
}

/// Compact JSON text of an `events` array as it arrived on the wire.
#[derive(Debug, Clone)]
pub struct EncodedEvents(Box<RawValue>);

impl EncodedEvents {
    fn from_received(raw: &RawValue) -> Result<Self, serde_json::Error> {
        RawValue::from_string(compact_json(raw.get())).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for EncodedEvents {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Drop whitespace outside string literals. Everything else, including
/// number spelling and escapes, is kept verbatim.
fn compact_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
            out.push(ch);
        } else if !matches!(ch, ' ' | '\n' | '\r' | '\t') {
            out.push(ch);
        }
    }
    out
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkOut<'a> {
    session_id: &'a SessionId,
    project_key: &'a ProjectKey,
    idx: u64,
    start_ts: u64,
    end_ts: u64,
    has_snapshot: bool,
    digest: &'a Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_digest: Option<&'a Digest>,
    fingerprint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a ChunkUser>,
    events: EventsOut<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EventsOut<'a> {
    Encoded(&'a RawValue),
    Decoded(&'a [SessionEvent]),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkIn {
    session_id: SessionId,
    project_key: ProjectKey,
    idx: u64,
    start_ts: u64,
    end_ts: u64,
    has_snapshot: bool,
    digest: Digest,
    #[serde(default)]
    prev_digest: Option<Digest>,
    fingerprint: String,
    #[serde(default)]
    user: Option<ChunkUser>,
    events: Box<RawValue>,
}

impl Serialize for Chunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let events = match &self.encoded_events {
            Some(encoded) => EventsOut::Encoded(encoded.0.as_ref()),
            None => EventsOut::Decoded(&self.events),
        };
        ChunkOut {
            session_id: &self.session_id,
            project_key: &self.project_key,
            idx: self.idx,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            has_snapshot: self.has_snapshot,
            digest: &self.digest,
            prev_digest: self.prev_digest.as_ref(),
            fingerprint: &self.fingerprint,
            user: self.user.as_ref(),
            events,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Chunk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ChunkIn::deserialize(deserializer)?;
        let events = serde_json::from_str(wire.events.get()).map_err(D::Error::custom)?;
        let encoded = EncodedEvents::from_received(&wire.events).map_err(D::Error::custom)?;
        Ok(Self {
            session_id: wire.session_id,
            project_key: wire.project_key,
            idx: wire.idx,
            start_ts: wire.start_ts,
            end_ts: wire.end_ts,
            has_snapshot: wire.has_snapshot,
            digest: wire.digest,
            prev_digest: wire.prev_digest,
            fingerprint: wire.fingerprint,
            user: wire.user,
            events,
            encoded_events: Some(encoded),
        })
    }
}

/// Structural defect found in a single chunk.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChunkFault {
    #[error("time range is inverted: start {start_ts} > end {end_ts}")]
    InvertedRange { start_ts: u64, end_ts: u64 },
    #[error("events are not sorted by timestamp at position {position}")]
    Unsorted { position: usize },
    #[error("event at {timestamp_ms}ms falls outside [{start_ts}, {end_ts}]")]
    OutOfRange {
        timestamp_ms: u64,
        start_ts: u64,
        end_ts: u64,
    },
    #[error("hasSnapshot does not match the first event")]
    SnapshotFlagMismatch,
    #[error("snapshot event found at position {position}")]
    SnapshotMisplaced { position: usize },
}

impl Chunk {
    /// Digest of a locally built event list.
    pub fn digest_events(events: &[SessionEvent]) -> Result<Digest, SerializationError> {
        Ok(hash_json(events)?)
    }

    /// Digest over the received encoding when there is one, otherwise over
    /// the canonical encoding of `events`.
    pub fn recompute_digest(&self) -> Result<Digest, SerializationError> {
        match &self.encoded_events {
            Some(encoded) => Ok(hash(encoded.as_str().as_bytes())),
            None => Self::digest_events(&self.events),
        }
    }

    /// True when `digest` reproduces.
    pub fn digest_matches(&self) -> bool {
        self.recompute_digest()
            .map(|digest| digest == self.digest)
            .unwrap_or(false)
    }

    pub fn snapshot_count(&self) -> usize {
        self.events.iter().filter(|event| event.is_snapshot()).count()
    }

    /// Check ordering, range and snapshot-placement rules.
    pub fn validate(&self) -> Result<(), ChunkFault> {
        if self.start_ts > self.end_ts {
            return Err(ChunkFault::InvertedRange {
                start_ts: self.start_ts,
                end_ts: self.end_ts,
            });
        }

        for (position, pair) in self.events.windows(2).enumerate() {
            if pair[1].timestamp_ms < pair[0].timestamp_ms {
                return Err(ChunkFault::Unsorted {
                    position: position + 1,
                });
            }
        }

        for event in [self.events.first(), self.events.last()].into_iter().flatten() {
            if event.timestamp_ms < self.start_ts || event.timestamp_ms > self.end_ts {
                return Err(ChunkFault::OutOfRange {
                    timestamp_ms: event.timestamp_ms,
                    start_ts: self.start_ts,
                    end_ts: self.end_ts,
                });
            }
        }

        let leads_with_snapshot = self.events.first().is_some_and(SessionEvent::is_snapshot);
        if leads_with_snapshot != self.has_snapshot {
            return Err(ChunkFault::SnapshotFlagMismatch);
        }
        if let Some(position) = self
            .events
            .iter()
            .skip(1)
            .position(SessionEvent::is_snapshot)
        {
            return Err(ChunkFault::SnapshotMisplaced {
                position: position + 1,
            });
        }
        Ok(())
    }
}

// ─── Chain verification ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "fault", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChainFault {
    /// The next chunk in idx order is not the expected one.
    Gap { expected: u64, found: u64 },
    Duplicate,
    /// `digest` does not reproduce from `events`.
    DigestMismatch,
    /// `prevDigest` does not equal the predecessor's digest.
    BrokenLink,
    /// Chunk 0 claims a predecessor.
    UnexpectedPrevDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBreak {
    pub idx: u64,
    pub fault: ChainFault,
}

/// Result of walking a session's chain. Chunks before `first_break` are
/// trustworthy; everything from the break onward is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub chunk_count: usize,
    pub trusted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Walk the chain in `idx` order and check every digest and link.
pub fn verify_chain(chunks: &[Chunk]) -> ChainReport {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.idx);

    let mut previous: Option<&Chunk> = None;
    for (position, chunk) in ordered.iter().enumerate() {
        let expected = position as u64;
        let fault = if chunk.idx != expected {
            if previous.is_some_and(|prev| prev.idx == chunk.idx) {
                Some(ChainFault::Duplicate)
            } else {
                Some(ChainFault::Gap {
                    expected,
                    found: chunk.idx,
                })
            }
        } else if !chunk.digest_matches() {
            Some(ChainFault::DigestMismatch)
        } else {
            match (previous, &chunk.prev_digest) {
                (None, None) => None,
                (None, Some(_)) => Some(ChainFault::UnexpectedPrevDigest),
                (Some(prev), Some(link)) if *link == prev.digest => None,
                (Some(_), _) => Some(ChainFault::BrokenLink),
            }
        };

        if let Some(fault) = fault {
            return ChainReport {
                chunk_count: ordered.len(),
                trusted: position,
                first_break: Some(ChainBreak {
                    idx: chunk.idx,
                    fault,
                }),
            };
        }
        previous = Some(chunk);
    }

    ChainReport {
        chunk_count: ordered.len(),
        trusted: ordered.len(),
        first_break: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Keyframe, Viewport};

    fn keyframe() -> Keyframe {
        Keyframe {
            doctype: "<!DOCTYPE html>".into(),
            markup: "<html></html>".into(),
            style_rules: Vec::new(),
            viewport: Viewport {
                width: 800,
                height: 600,
            },
        }
    }

    fn chunk(idx: u64, prev: Option<&Chunk>, events: Vec<SessionEvent>) -> Chunk {
        let start_ts = prev.map_or(0, |p| p.end_ts);
        let end_ts = events
            .last()
            .map_or(start_ts, |e| e.timestamp_ms)
            .max(start_ts);
        Chunk {
            session_id: SessionId::from_string("session_test"),
            project_key: ProjectKey::from_string("pk"),
            idx,
            start_ts,
            end_ts,
            has_snapshot: events.first().is_some_and(SessionEvent::is_snapshot),
            digest: Chunk::digest_events(&events).unwrap(),
            prev_digest: prev.map(|p| p.digest.clone()),
            fingerprint: "dvf".into(),
            user: None,
            events,
            encoded_events: None,
        }
    }

    fn sample_chain() -> Vec<Chunk> {
        let c0 = chunk(
            0,
            None,
            vec![
                SessionEvent::snapshot(0, keyframe()),
                SessionEvent::new(40, EventKind::Pointer { x: 1.0, y: 1.0 }),
            ],
        );
        let c1 = chunk(
            1,
            Some(&c0),
            vec![SessionEvent::new(
                120,
                EventKind::Route {
                    path: "/pricing".into(),
                },
            )],
        );
        let c2 = chunk(
            2,
            Some(&c1),
            vec![SessionEvent::new(300, EventKind::Scroll { x: 0.0, y: 90.0 })],
        );
        vec![c0, c1, c2]
    }

    #[test]
    fn intact_chain_verifies_in_any_input_order() {
        let mut chunks = sample_chain();
        chunks.reverse();
        let report = verify_chain(&chunks);
        assert!(report.is_intact());
        assert_eq!(report.trusted, 3);
    }

    #[test]
    fn tampered_events_break_the_chain_at_that_chunk() {
        let mut chunks = sample_chain();
        chunks[1].events[0].timestamp_ms = 121;
        let report = verify_chain(&chunks);
        assert_eq!(report.trusted, 1);
        assert_eq!(
            report.first_break,
            Some(ChainBreak {
                idx: 1,
                fault: ChainFault::DigestMismatch
            })
        );
    }

    #[test]
    fn relinked_chunk_is_reported_as_broken_link() {
        let mut chunks = sample_chain();
        chunks[2].prev_digest = Some(chunks[0].digest.clone());
        let report = verify_chain(&chunks);
        assert_eq!(report.trusted, 2);
        assert_eq!(report.first_break.unwrap().fault, ChainFault::BrokenLink);
    }

    #[test]
    fn missing_chunk_is_a_gap() {
        let mut chunks = sample_chain();
        chunks.remove(1);
        let report = verify_chain(&chunks);
        assert_eq!(report.trusted, 1);
        assert_eq!(
            report.first_break.unwrap().fault,
            ChainFault::Gap {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn validate_accepts_well_formed_chunks() {
        for chunk in sample_chain() {
            chunk.validate().unwrap();
        }
    }

    #[test]
    fn validate_rejects_misplaced_snapshot_and_unsorted_events() {
        let mut chunks = sample_chain();
        chunks[1]
            .events
            .push(SessionEvent::snapshot(120, keyframe()));
        assert_eq!(
            chunks[1].validate(),
            Err(ChunkFault::SnapshotMisplaced { position: 1 })
        );

        let mut unsorted = sample_chain().remove(0);
        unsorted.events.swap(0, 1);
        assert!(matches!(
            unsorted.validate(),
            Err(ChunkFault::SnapshotFlagMismatch | ChunkFault::Unsorted { .. })
        ));
    }

    #[test]
    fn chunk_wire_format_omits_absent_optionals() {
        let chunks = sample_chain();
        let first = serde_json::to_value(&chunks[0]).unwrap();
        assert!(first.get("prevDigest").is_none());
        assert!(first.get("user").is_none());
        assert_eq!(first["hasSnapshot"], true);
        let second = serde_json::to_value(&chunks[1]).unwrap();
        assert_eq!(second["prevDigest"], chunks[0].digest.as_str());
        let back: Chunk = serde_json::from_value(second).unwrap();
        assert!(back.digest_matches());
    }

    fn foreign_body(events: &str, digest_of: &str) -> String {
        format!(
            r#"{{"sessionId":"session_js","projectKey":"pk","idx":0,"startTs":0,"endTs":0,"hasSnapshot":false,"digest":"{}","fingerprint":"dvf","events":{events}}}"#,
            hash(digest_of.as_bytes()).as_str()
        )
    }

    #[test]
    fn foreign_encoding_verifies_against_received_text() {
        let events = r#"[{"kind":"pointer","timestampMs":0,"x":10,"y":20,"pressure":0.5}]"#;
        let chunk: Chunk = serde_json::from_str(&foreign_body(events, events)).unwrap();

        assert_eq!(chunk.events[0].kind, EventKind::Pointer { x: 10.0, y: 20.0 });
        assert!(chunk.digest_matches());
        assert!(verify_chain(std::slice::from_ref(&chunk)).is_intact());

        let stored = serde_json::to_string(&chunk).unwrap();
        assert!(stored.contains(events));
        let reloaded: Chunk = serde_json::from_str(&stored).unwrap();
        assert!(reloaded.digest_matches());
        assert_eq!(reloaded, chunk);
    }

    #[test]
    fn insignificant_whitespace_does_not_break_the_digest() {
        let compact = r#"[{"timestampMs":0,"kind":"route","path":"/a b"}]"#;
        let pretty = "[\n  {\n    \"timestampMs\": 0,\n    \"kind\": \"route\",\n    \"path\": \"/a b\"\n  }\n]";
        let chunk: Chunk = serde_json::from_str(&foreign_body(pretty, compact)).unwrap();

        assert_eq!(chunk.encoded_events.as_ref().unwrap().as_str(), compact);
        assert!(chunk.digest_matches());
    }

    #[test]
    fn edited_wire_events_do_not_verify() {
        let signed = r#"[{"timestampMs":0,"kind":"pointer","x":10,"y":20}]"#;
        let edited = r#"[{"timestampMs":0,"kind":"pointer","x":11,"y":20}]"#;
        let chunk: Chunk = serde_json::from_str(&foreign_body(edited, signed)).unwrap();

        assert!(!chunk.digest_matches());
        assert_eq!(
            verify_chain(&[chunk]).first_break.map(|b| b.fault),
            Some(ChainFault::DigestMismatch)
        );
    }

    #[test]
    fn locally_sealed_chunks_encode_like_their_digest() {
        let chunks = sample_chain();
        let wire = serde_json::to_string(&chunks[0]).unwrap();
        let decoded: Chunk = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            decoded.encoded_events.as_ref().unwrap().as_str(),
            serde_json::to_string(&chunks[0].events).unwrap()
        );
        assert!(decoded.digest_matches());
    }

    #[test]
    fn compaction_leaves_string_contents_alone() {
        assert_eq!(
            compact_json("[ {\"a\" : \"x  y\\\" \\n z\"} ,\t1.50 ]"),
            "[{\"a\":\"x  y\\\" \\n z\"},1.50]"
        );
    }
}
