//! Maintenance-facing integration tests: the expiration sweeper running as
//! a real background task, and marker persistence across engine reopen.

use relay_engine::codec::canonical::compute_id;
use relay_engine::{CancelToken, Engine, EngineConfig, Event, EventId, Kind, PublicKey, Tag};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
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

#[tokio::test]
async fn sweeper_task_removes_expired_events_then_exits_on_shutdown() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        sweep_interval_secs: 1,
        ..EngineConfig::for_data_dir(dir.path().to_string_lossy().to_string())
    };
    let ctx = CancelToken::never();
    let engine = Engine::open(&config, &ctx).unwrap();

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let pk = PublicKey([50u8; 32]);
    let expiring = make_event(
        pk,
        now,
        1,
        "gone soon",
        vec![Tag::new(vec!["expiration".into(), (now + 1).to_string()])],
    );
    engine.save_event(&ctx, &expiring).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = engine.spawn_expiration_sweeper(shutdown_rx);

    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let err = engine.fetch_event_by_serial(
        &ctx,
        engine
            .query_for_serials(&ctx, &relay_engine::Filter { authors: Some(vec![pk]), ..Default::default() })
            .unwrap()
            .first()
            .copied()
            .unwrap_or(u64::MAX),
    );
    assert!(err.is_err(), "expired event must no longer be fetchable");
}

#[test]
fn markers_persist_across_reopen() {
    let dir = tempdir().unwrap();
    let ctx = CancelToken::never();
    {
        let engine =
            Engine::open(&EngineConfig::for_data_dir(dir.path().to_string_lossy().to_string()), &ctx).unwrap();
        engine.set_marker(&ctx, "last_compaction", b"2026-07-29").unwrap();
        engine.close(&ctx).unwrap();
    }

    let engine = Engine::open(&EngineConfig::for_data_dir(dir.path().to_string_lossy().to_string()), &ctx).unwrap();
    assert!(engine.has_marker(&ctx, "last_compaction").unwrap());
    assert_eq!(engine.get_marker(&ctx, "last_compaction").unwrap(), Some(b"2026-07-29".to_vec()));
}

#[test]
fn relay_identity_secret_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let ctx = CancelToken::never();
    let first = {
        let engine =
            Engine::open(&EngineConfig::for_data_dir(dir.path().to_string_lossy().to_string()), &ctx).unwrap();
        engine.get_or_create_relay_identity_secret(&ctx).unwrap()
    };

    let engine = Engine::open(&EngineConfig::for_data_dir(dir.path().to_string_lossy().to_string()), &ctx).unwrap();
    let second = engine.get_or_create_relay_identity_secret(&ctx).unwrap();
    assert_eq!(first, second);
}
