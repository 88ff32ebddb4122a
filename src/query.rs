//! Query planner and executor (§4.6): filter → key ranges → serials →
//! `IdPkTs`, with cartesian range expansion across independent filter
//! axes, post-filter verification for 8-byte hash collision tolerance,
//! and search relevance ranking.
//!
//! Grounded in the teacher's `storage/lmdb.rs::query` and its per-family
//! `scan_*_index` helpers: same "seek a range, collect candidates, sort,
//! truncate" shape, generalized from the teacher's if/else-if single-axis
//! choice to the cartesian union of ranges §4.6 calls for, because the
//! engine must stay conservatively correct under 8-byte hash collisions
//! rather than rely on picking one "best" index.

use std::collections::{HashMap, HashSet};

use crate::cancel::CancelToken;
use crate::codec::ints::created_at_to_u64;
use crate::error::{EngineError, Result};
use crate::event::{Event, EventId, PublicKey, Serial};
use crate::keys::{
    decode_full_id_key, full_id_serial_range, kind_ts_range, pubkey_kind_range, pubkey_ts_range,
    tag_value_range, trailing_serial, ts_range, word_range,
};
use crate::store::{ByteRange, Store};
use crate::tokenizer::{hash_word, tokenize};

/// A subscription filter (§3). Missing field = unrestricted for that axis.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub ids: Option<Vec<EventId>>,
    pub authors: Option<Vec<PublicKey>>,
    pub kinds: Option<Vec<u16>>,
    /// Maps a single-letter tag key (the JSON field is `#<letter>`) to the
    /// set of values that satisfy it.
    pub tags: HashMap<char, Vec<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

impl Filter {
    fn since_u64(&self) -> u64 {
        self.since.map(created_at_to_u64).unwrap_or(0)
    }

    fn until_u64(&self) -> u64 {
        self.until.map(created_at_to_u64).unwrap_or(u64::MAX)
    }
}

/// (id, pubkey, created_at, serial): the compact result carrier used
/// everywhere a full `Event` isn't needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdPkTs {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub serial: Serial,
}

enum Scan {
    /// A family that does not contribute to search match-count scoring.
    Plain { database: PlainFamily, start: Vec<u8>, end: Vec<u8> },
    /// A Word range: one per distinct search token.
    Word { start: Vec<u8>, end: Vec<u8> },
}

enum PlainFamily {
    PubkeyKindTs,
    PubkeyTs,
    KindTs,
    TagValueTs,
    Ts,
}

/// §4.6 step 1: translate each present filter axis into one or more
/// `[start, end]` key ranges over its most selective index family.
fn plan_ranges(filter: &Filter) -> Vec<Scan> {
    let since = filter.since_u64();
    let until = filter.until_u64();
    let mut scans = Vec::new();

    match (&filter.authors, &filter.kinds) {
        (Some(authors), Some(kinds)) => {
            for pubkey in authors {
                for kind in kinds {
                    let (start, end) = pubkey_kind_range(pubkey, *kind, since, until);
                    scans.push(Scan::Plain { database: PlainFamily::PubkeyKindTs, start, end });
                }
            }
        }
        (Some(authors), None) => {
            for pubkey in authors {
                let (start, end) = pubkey_ts_range(pubkey, since, until);
                scans.push(Scan::Plain { database: PlainFamily::PubkeyTs, start, end });
            }
        }
        (None, Some(kinds)) => {
            for kind in kinds {
                let (start, end) = kind_ts_range(*kind, since, until);
                scans.push(Scan::Plain { database: PlainFamily::KindTs, start, end });
            }
        }
        (None, None) => {}
    }

    for (letter, values) in &filter.tags {
        if !letter.is_ascii() {
            continue;
        }
        for value in values {
            let hash = hash_word(value);
            let (start, end) = tag_value_range(*letter as u8, hash, since, until);
            scans.push(Scan::Plain { database: PlainFamily::TagValueTs, start, end });
        }
    }

    if let Some(search) = &filter.search {
        for hash in tokenize(search) {
            let (start, end) = word_range(hash);
            scans.push(Scan::Word { start, end });
        }
    }

    if scans.is_empty() {
        let (start, end) = ts_range(since, until);
        scans.push(Scan::Plain { database: PlainFamily::Ts, start, end });
    }

    scans
}

/// Checked every `CANCEL_CHECK_STRIDE` entries inside a range scan: frequent
/// enough that a cancelled long scan drops its iterator promptly, cheap
/// enough not to dominate the per-entry cost of a short one.
const CANCEL_CHECK_STRIDE: usize = 256;

fn scan_family(
    rtxn: &heed::RoTxn,
    store: &Store,
    family: &PlainFamily,
    start: &[u8],
    end: &[u8],
    ctx: &CancelToken,
) -> Result<Vec<Serial>> {
    let range = ByteRange::new(start, end);
    let database = match family {
        PlainFamily::PubkeyKindTs => &store.pubkey_kind_ts,
        PlainFamily::PubkeyTs => &store.pubkey_ts,
        PlainFamily::KindTs => &store.kind_ts,
        PlainFamily::TagValueTs => &store.tag_value_ts,
        PlainFamily::Ts => &store.ts,
    };
    let mut serials = Vec::new();
    for (i, entry) in database.range(rtxn, &range)?.enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            ctx.check()?;
        }
        let (key, _) = entry?;
        if let Some(serial) = trailing_serial(key) {
            serials.push(serial);
        }
    }
    Ok(serials)
}

fn scan_word(rtxn: &heed::RoTxn, store: &Store, start: &[u8], end: &[u8], ctx: &CancelToken) -> Result<Vec<Serial>> {
    let range = ByteRange::new(start, end);
    let mut serials = Vec::new();
    for (i, entry) in store.word.range(rtxn, &range)?.enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            ctx.check()?;
        }
        let (key, _) = entry?;
        if let Some(serial) = trailing_serial(key) {
            serials.push(serial);
        }
    }
    Ok(serials)
}

fn fetch_id_pk_ts(rtxn: &heed::RoTxn, store: &Store, serial: Serial) -> Result<Option<IdPkTs>> {
    let (start, end) = full_id_serial_range(serial);
    let range = ByteRange::new(&start, &end);
    for entry in store.full_id.range(rtxn, &range)? {
        let (key, _) = entry?;
        if let Some(value) = decode_full_id_key(key) {
            return Ok(Some(IdPkTs {
                id: value.id,
                pubkey: value.pubkey,
                created_at: value.created_at,
                serial,
            }));
        }
    }
    Ok(None)
}

fn authors_or_kinds_present(filter: &Filter) -> bool {
    filter.authors.is_some() || filter.kinds.is_some()
}

/// §4.6 step 4: re-check each present axis exactly against the
/// materialized event. Needed whenever the candidate could have entered
/// the union from a range that doesn't jointly encode every other axis
/// (e.g. a tag-value hash range says nothing about kind), and always for
/// tag values themselves since their key embeds only an 8-byte hash.
fn matches_exactly(filter: &Filter, event: &Event) -> bool {
    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind.0) {
            return false;
        }
    }
    for (letter, values) in &filter.tags {
        let key = letter.to_string();
        if !event.tags.iter().any(|t| t.matches_any(&key, values)) {
            return false;
        }
    }
    true
}

/// §4.6: plan ranges, scan, dedupe, post-filter, rank, and truncate.
/// Disallows `ids` (callers needing an id lookup use the dedicated
/// id-to-serial path in `store::Store::find_serial_by_id` instead).
pub fn query_for_ids(rtxn: &heed::RoTxn, store: &Store, filter: &Filter, ctx: &CancelToken) -> Result<Vec<IdPkTs>> {
    if filter.ids.is_some() {
        return Err(EngineError::IdsDisallowed);
    }

    let scans = plan_ranges(filter);
    let mut all_serials: HashSet<Serial> = HashSet::new();
    let mut word_hits = 0usize;
    let mut word_match_count: HashMap<Serial, u32> = HashMap::new();

    for scan in &scans {
        ctx.check()?;
        let (family_serials, is_word) = match scan {
            Scan::Plain { database, start, end } => (scan_family(rtxn, store, database, start, end, ctx)?, false),
            Scan::Word { start, end } => (scan_word(rtxn, store, start, end, ctx)?, true),
        };
        if is_word {
            word_hits += 1;
        }
        for serial in family_serials {
            all_serials.insert(serial);
            if is_word {
                *word_match_count.entry(serial).or_insert(0) += 1;
            }
        }
    }

    let needs_exact_check = !filter.tags.is_empty()
        || (filter.search.is_some() && (authors_or_kinds_present(filter) || !filter.tags.is_empty()));

    let mut candidates: Vec<(IdPkTs, u32)> = Vec::with_capacity(all_serials.len());
    for (i, serial) in all_serials.into_iter().enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            ctx.check()?;
        }
        let Some(triplet) = fetch_id_pk_ts(rtxn, store, serial)? else {
            continue;
        };
        if let Some(authors) = &filter.authors {
            if !authors.contains(&triplet.pubkey) {
                continue;
            }
        }
        if triplet.created_at < filter.since.unwrap_or(i64::MIN) || triplet.created_at > filter.until.unwrap_or(i64::MAX) {
            continue;
        }
        if needs_exact_check {
            let Some(event) = store.fetch_event(rtxn, serial)? else {
                continue;
            };
            if !matches_exactly(filter, &event) {
                continue;
            }
        }
        let count = word_match_count.get(&serial).copied().unwrap_or(0);
        candidates.push((triplet, count));
    }

    rank(&mut candidates, filter, word_hits);

    let mut results: Vec<IdPkTs> = candidates.into_iter().map(|(t, _)| t).collect();
    if let Some(limit) = filter.limit {
        results.truncate(limit);
    }
    Ok(results)
}

/// §4.6 step 5. Without search: sort strictly by `created_at` descending.
/// With search: `score = 0.5·(match_count / total_search_terms) +
/// 0.5·normalize(created_at)`, normalizing `created_at` min-max across the
/// candidate set; ties break by `created_at` descending.
fn rank(candidates: &mut [(IdPkTs, u32)], filter: &Filter, total_search_terms: usize) {
    if filter.search.is_none() || candidates.is_empty() {
        candidates.sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at));
        return;
    }

    let min_ts = candidates.iter().map(|(t, _)| t.created_at).min().unwrap();
    let max_ts = candidates.iter().map(|(t, _)| t.created_at).max().unwrap();
    let norm_ts = |ts: i64| -> f64 {
        if max_ts == min_ts {
            1.0
        } else {
            (ts - min_ts) as f64 / (max_ts - min_ts) as f64
        }
    };
    let norm_count = |count: u32| -> f64 {
        if total_search_terms == 0 {
            0.0
        } else {
            count as f64 / total_search_terms as f64
        }
    };
    let score = |triplet: &IdPkTs, count: u32| 0.5 * norm_count(count) + 0.5 * norm_ts(triplet.created_at);

    candidates.sort_by(|(a, ac), (b, bc)| {
        let score_a = score(a, *ac);
        let score_b = score(b, *bc);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

/// `query_events`: run `query_for_ids`, then batch-fetch the full `Event`
/// for each surviving serial in a single read transaction, seeking in
/// sorted-serial order.
pub fn query_events(rtxn: &heed::RoTxn, store: &Store, filter: &Filter, ctx: &CancelToken) -> Result<Vec<Event>> {
    if let Some(ids) = &filter.ids {
        let mut events = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if i % CANCEL_CHECK_STRIDE == 0 {
                ctx.check()?;
            }
            if let Some(serial) = store.find_serial_by_id(rtxn, id)? {
                if let Some(event) = store.fetch_event(rtxn, serial)? {
                    if matches_exactly(filter, &event) {
                        events.push(event);
                    }
                }
            }
        }
        events.sort_unstable_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        return Ok(events);
    }

    let ids = query_for_ids(rtxn, store, filter, ctx)?;
    let mut serials: Vec<Serial> = ids.iter().map(|t| t.serial).collect();
    serials.sort_unstable();

    let mut by_serial: HashMap<Serial, Event> = HashMap::with_capacity(serials.len());
    for (i, serial) in serials.into_iter().enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            ctx.check()?;
        }
        if let Some(event) = store.fetch_event(rtxn, serial)? {
            by_serial.insert(serial, event);
        }
    }

    Ok(ids.into_iter().filter_map(|t| by_serial.remove(&t.serial)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::codec::canonical::compute_id;
    use crate::event::{Kind, Tag};
    use crate::store::SerialAllocator;
    use crate::write::save_event;
    use tempfile::tempdir;

    fn make_event(pubkey: PublicKey, created_at: i64, kind: u16, content: &str, tags: Vec<Tag>) -> Event {
        let mut event = Event {
            id: EventId([0; 32]),
            pubkey,
            created_at,
            kind: Kind(kind),
            tags,
            content: content.to_string(),
            sig: [0u8; 64],
        };
        event.id = EventId(compute_id(&event));
        event
    }

    #[test]
    fn save_and_fetch_by_id_author_kind() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([9u8; 32]);
        let event = make_event(pk, 1_700_000_000, 1, "hello", vec![]);
        save_event(&store, &allocator, &event, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let ctx = CancelToken::never();

        let by_id =
            query_events(&rtxn, &store, &Filter { ids: Some(vec![event.id]), ..Default::default() }, &ctx).unwrap();
        assert_eq!(by_id.len(), 1);

        let by_author =
            query_events(&rtxn, &store, &Filter { authors: Some(vec![pk]), ..Default::default() }, &ctx).unwrap();
        assert_eq!(by_author.len(), 1);

        let by_kind =
            query_events(&rtxn, &store, &Filter { kinds: Some(vec![1]), ..Default::default() }, &ctx).unwrap();
        assert_eq!(by_kind.len(), 1);
    }

    #[test]
    fn replacement_hides_old_event_from_queries() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([10u8; 32]);

        let e1 = make_event(pk, 100, 0, "A", vec![]);
        let e2 = make_event(pk, 200, 0, "B", vec![]);
        save_event(&store, &allocator, &e1, &[]).unwrap();
        save_event(&store, &allocator, &e2, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let ctx = CancelToken::never();
        let results = query_events(
            &rtxn,
            &store,
            &Filter { authors: Some(vec![pk]), kinds: Some(vec![0]), ..Default::default() },
            &ctx,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, e2.id);

        let by_old_id =
            query_events(&rtxn, &store, &Filter { ids: Some(vec![e1.id]), ..Default::default() }, &ctx).unwrap();
        assert!(by_old_id.is_empty());
    }

    #[test]
    fn tag_filter_matches_exact_values() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([11u8; 32]);

        let tagged = make_event(pk, 100, 1, "hi", vec![Tag::new(vec!["t".into(), "nostr".into()])]);
        let untagged = make_event(pk, 150, 1, "bye", vec![]);
        save_event(&store, &allocator, &tagged, &[]).unwrap();
        save_event(&store, &allocator, &untagged, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let ctx = CancelToken::never();
        let mut tags = HashMap::new();
        tags.insert('t', vec!["nostr".to_string()]);
        let results = query_events(&rtxn, &store, &Filter { tags, ..Default::default() }, &ctx).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, tagged.id);
    }

    #[test]
    fn search_ranks_by_blended_score() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([12u8; 32]);

        let e_a = make_event(pk, 100, 1, "the quick brown fox", vec![]);
        let e_b = make_event(pk, 200, 1, "brown brown brown", vec![]);
        save_event(&store, &allocator, &e_a, &[]).unwrap();
        save_event(&store, &allocator, &e_b, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let ctx = CancelToken::never();

        let brown_only = query_events(
            &rtxn,
            &store,
            &Filter { search: Some("brown".to_string()), ..Default::default() },
            &ctx,
        )
        .unwrap();
        assert_eq!(brown_only[0].id, e_b.id, "tie in match count, newer wins");

        let blended = query_events(
            &rtxn,
            &store,
            &Filter { search: Some("quick brown fox".to_string()), ..Default::default() },
            &ctx,
        )
        .unwrap();
        assert_eq!(blended[0].id, e_b.id, "0.667 beats 0.5 per the worked example");
        assert_eq!(blended[1].id, e_a.id);
    }

    #[test]
    fn limit_truncates_results() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([13u8; 32]);
        for i in 0..5 {
            let event = make_event(pk, 100 + i, 1, "x", vec![]);
            save_event(&store, &allocator, &event, &[]).unwrap();
        }

        let rtxn = store.read_txn().unwrap();
        let ctx = CancelToken::never();
        let results = query_events(
            &rtxn,
            &store,
            &Filter { authors: Some(vec![pk]), limit: Some(2), ..Default::default() },
            &ctx,
        )
        .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn cancelled_ctx_aborts_before_scanning() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 10 * 1024 * 1024).unwrap();
        let allocator = SerialAllocator::new(16);
        let pk = PublicKey([14u8; 32]);
        let event = make_event(pk, 100, 1, "x", vec![]);
        save_event(&store, &allocator, &event, &[]).unwrap();

        let rtxn = store.read_txn().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let ctx = CancelToken::new(rx);
        tx.send(true).unwrap();

        let err = query_events(&rtxn, &store, &Filter { authors: Some(vec![pk]), ..Default::default() }, &ctx)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
