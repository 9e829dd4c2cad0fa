//! End-to-end scenarios over the in-memory doubles: enqueue → engine,
//! queue advancement, loops, seeks, admission, and assistant recovery.

use std::sync::Arc;
use std::time::Duration;

use chordcast::engine::{event_channel, CallRouter, EngineEvent, StreamKind};
use chordcast::gateway::AttachmentRef;
use chordcast::models::{
    AccessMode, AdminEntry, AdminRights, AssistantKey, ChatId, MemberStatus, UserId,
};
use chordcast::provider::{AttachmentSource, BackendKind, MediaSource, PlayInput, SourceResolver};
use chordcast::queue::ChatQueueStore;
use chordcast::repository::ChatStore;
use chordcast::service::admission::AdmissionService;
use chordcast::service::assistant::AssistantPool;
use chordcast::service::coordinator::{EnqueueRequest, PlaybackCoordinator};
use chordcast::test_helpers::{
    test_track, Harness, MemoryChatStore, MockEngine, MockGateway, MockUserSession,
    RecordingNotifier,
};
use chordcast::Error;

const CHAT: ChatId = ChatId(-100_200);
const USER: UserId = UserId(7);

fn play_request(input: &str) -> EnqueueRequest {
    EnqueueRequest {
        chat: CHAT,
        user: USER,
        requester: "tester".to_string(),
        input: PlayInput::Text(input.to_string()),
        is_video: false,
    }
}

fn harness() -> (Harness, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path().to_path_buf());
    h.ready_chat(CHAT);
    (h, dir)
}

#[tokio::test]
async fn test_play_free_text_starts_playback() {
    let (h, _dir) = harness();
    h.sources
        .add_fixture("Bohemian Rhapsody", vec![test_track("bohemian")]);

    let outcome = h
        .coordinator
        .enqueue(play_request("Bohemian Rhapsody"))
        .await
        .unwrap();

    assert_eq!(outcome.started.as_ref().unwrap().id, "bohemian");
    assert!(outcome.queued.is_empty());
    assert!(h.queue.is_active(CHAT));
    assert_eq!(h.queue.queue_len(CHAT), 1);
    assert_eq!(h.engine.total_plays(), 1);

    let now_playing = h.notifier.now_playing.lock().clone();
    assert_eq!(now_playing.len(), 1);
    assert_eq!(now_playing[0].1, "Track bohemian");
}

#[tokio::test]
async fn test_playlist_enqueues_all_and_advances() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLx",
        vec![test_track("one"), test_track("two"), test_track("three")],
    );

    let outcome = h
        .coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLx"))
        .await
        .unwrap();

    assert_eq!(outcome.started.as_ref().unwrap().id, "one");
    assert_eq!(outcome.queued.len(), 2);
    assert_eq!(h.queue.queue_len(CHAT), 3);
    assert_eq!(h.engine.total_plays(), 1);

    // Stream end promotes the second track.
    h.coordinator.advance(CHAT).await;
    assert_eq!(h.queue.queue_len(CHAT), 2);
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "two");
    assert_eq!(h.engine.total_plays(), 2);
}

#[tokio::test]
async fn test_loop_replays_same_file_then_advances() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLloop",
        vec![test_track("looped"), test_track("after")],
    );

    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLloop"))
        .await
        .unwrap();
    h.coordinator.set_loop(CHAT, USER, 2).await.unwrap();

    // Two stream ends replay the same local path.
    h.coordinator.advance(CHAT).await;
    h.coordinator.advance(CHAT).await;

    let plays = h.engine.plays(CHAT);
    assert_eq!(plays.len(), 3);
    assert!(plays.iter().all(|p| p.source.ends_with("looped.mp3")));
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "looped");

    // Loop exhausted: the next end moves on.
    h.coordinator.advance(CHAT).await;
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "after");
    assert_eq!(h.engine.total_plays(), 4);
}

#[tokio::test]
async fn test_queue_finished_notified_once() {
    let (h, _dir) = harness();
    h.sources.add_fixture("solo", vec![test_track("solo")]);

    h.coordinator.enqueue(play_request("solo")).await.unwrap();
    h.coordinator.advance(CHAT).await;

    assert!(!h.queue.is_active(CHAT));
    assert_eq!(h.queue.queue_len(CHAT), 0);
    assert_eq!(h.notifier.finished_count(CHAT), 1);
}

#[tokio::test]
async fn test_remove_at_protects_head() {
    let (h, _dir) = harness();
    let tracks: Vec<_> = ["a", "b", "c", "d", "e"].iter().map(|id| test_track(id)).collect();
    h.sources
        .add_fixture("https://www.youtube.com/playlist?list=PLrm", tracks);

    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLrm"))
        .await
        .unwrap();
    assert_eq!(h.queue.queue_len(CHAT), 5);

    let removed = h.coordinator.remove_at(CHAT, USER, 3).await.unwrap();
    assert_eq!(removed.id, "c");
    assert_eq!(h.queue.queue_len(CHAT), 4);

    let err = h.coordinator.remove_at(CHAT, USER, 1).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(h.queue.queue_len(CHAT), 4);
}

#[tokio::test]
async fn test_seek_bounds() {
    let (h, _dir) = harness();
    let mut short = test_track("short");
    short.duration_secs = 40;
    h.sources.add_fixture("short", vec![short]);

    h.coordinator.enqueue(play_request("short")).await.unwrap();
    h.engine.set_played(CHAT, 10);

    // played 10 + delta 30 == duration 40: rejected
    let err = h.coordinator.seek(CHAT, USER, 30).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    // one second earlier is accepted
    h.coordinator.seek(CHAT, USER, 29).await.unwrap();

    // before the start: rejected
    let err = h.coordinator.seek(CHAT, USER, -11).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_seek_reissues_play_with_flags() {
    let (h, _dir) = harness();
    let mut long = test_track("long");
    long.duration_secs = 90;
    h.sources.add_fixture("long", vec![long]);

    h.coordinator.enqueue(play_request("long")).await.unwrap();
    h.engine.set_played(CHAT, 10);
    h.coordinator.seek(CHAT, USER, 30).await.unwrap();

    let plays = h.engine.plays(CHAT);
    assert_eq!(plays.len(), 2);
    assert!(plays[1].audio_command.contains("-ss 40"));
    assert!(plays[1].audio_command.contains("-to 90"));
}

#[tokio::test]
async fn test_speed_bounds() {
    let (h, _dir) = harness();
    h.sources.add_fixture("speedy", vec![test_track("speedy")]);
    h.coordinator.enqueue(play_request("speedy")).await.unwrap();

    for bad in [0.49, 4.01] {
        let err = h.coordinator.speed(CHAT, USER, bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{bad} accepted");
    }

    h.coordinator.speed(CHAT, USER, 0.5).await.unwrap();
    h.coordinator.speed(CHAT, USER, 4.0).await.unwrap();

    let plays = h.engine.plays(CHAT);
    assert_eq!(plays.len(), 3);
    assert!(plays[1].audio_command.contains("atempo=0.50"));
    assert!(plays[2].audio_command.contains("atempo=2.00,atempo=2.00"));
}

#[tokio::test]
async fn test_admission_denied_mutates_nothing() {
    let (h, _dir) = harness();
    h.store.set_play_mode(CHAT, AccessMode::Admins).await.unwrap();
    h.sources.add_fixture("forbidden", vec![test_track("forbidden")]);

    let err = h
        .coordinator
        .enqueue(play_request("forbidden"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Admission(_)));
    assert_eq!(h.engine.total_plays(), 0);
    assert_eq!(h.queue.queue_len(CHAT), 0);
    assert!(!h.queue.is_active(CHAT));
    // The one user-visible message is the returned error; nothing else.
    assert_eq!(h.notifier.error_count(CHAT), 0);
}

#[tokio::test]
async fn test_bot_precheck_is_a_distinct_failure() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(dir.path().to_path_buf());
    // No rights granted at all.
    h.sources.add_fixture("x", vec![test_track("x")]);

    let err = h.coordinator.enqueue(play_request("x")).await.unwrap_err();
    assert!(matches!(err, Error::BotNotAdmin(_)));
}

#[tokio::test]
async fn test_queue_full_rejected_at_cap() {
    let (h, _dir) = harness();
    for i in 0..10 {
        let id = format!("t{i}");
        h.sources.add_fixture(&id, vec![test_track(&id)]);
        h.coordinator.enqueue(play_request(&id)).await.unwrap();
    }
    assert_eq!(h.queue.queue_len(CHAT), 10);

    h.sources.add_fixture("overflow", vec![test_track("overflow")]);
    let err = h
        .coordinator
        .enqueue(play_request("overflow"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull { len: 10 }));
}

#[tokio::test]
async fn test_duplicates_are_surfaced() {
    let (h, _dir) = harness();
    h.sources.add_fixture("dup", vec![test_track("dup")]);

    h.coordinator.enqueue(play_request("dup")).await.unwrap();
    let outcome = h.coordinator.enqueue(play_request("dup")).await.unwrap();

    assert!(outcome.started.is_none());
    assert!(outcome.queued.is_empty());
    assert_eq!(outcome.duplicates.len(), 1);
    assert_eq!(outcome.duplicates[0].id, "dup");
    assert_eq!(h.queue.queue_len(CHAT), 1);
}

#[tokio::test]
async fn test_dead_track_skipped_during_advance() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLdead",
        vec![test_track("first"), test_track("broken"), test_track("last")],
    );
    h.sources.fail_download_of("broken");

    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLdead"))
        .await
        .unwrap();

    h.coordinator.advance(CHAT).await;

    // "broken" failed to materialize: one error notification, playback
    // lands on "last".
    assert_eq!(h.notifier.error_count(CHAT), 1);
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "last");
    assert!(h.queue.is_active(CHAT));
}

#[tokio::test]
async fn test_play_failure_leaves_chat_inactive() {
    let (h, _dir) = harness();
    h.sources.add_fixture("failing", vec![test_track("failing")]);
    h.engine
        .fail_next_play
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h.coordinator.enqueue(play_request("failing")).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert!(!h.queue.is_active(CHAT));
    assert_eq!(h.queue.queue_len(CHAT), 0);
}

#[tokio::test]
async fn test_video_stream_end_is_ignored() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLv",
        vec![test_track("v1"), test_track("v2")],
    );
    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLv"))
        .await
        .unwrap();

    let (tx, rx) = event_channel();
    let handle = h.coordinator.spawn_event_loop(rx);

    tx.send(EngineEvent::StreamEnded {
        chat: CHAT,
        kind: StreamKind::Video,
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "v1");

    tx.send(EngineEvent::StreamEnded {
        chat: CHAT,
        kind: StreamKind::Audio,
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.queue.playing(CHAT).unwrap().track.id, "v2");

    drop(tx);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_banned_assistant_recovery() {
    let (h, _dir) = harness();
    let assistant = h.session.user_id();
    h.gateway.set_member(CHAT, assistant, MemberStatus::Banned);
    // Bot is admin but lacks ban-users.
    h.gateway.grant_bot_admin(CHAT, false);
    h.sources.add_fixture("banned", vec![test_track("banned")]);

    let err = h.coordinator.enqueue(play_request("banned")).await.unwrap_err();
    match err {
        Error::Assistant { reason, .. } => assert!(reason.contains("banned")),
        other => panic!("expected assistant failure, got {other:?}"),
    }
    assert_eq!(h.engine.total_plays(), 0);
    assert!(!h.queue.is_active(CHAT));

    // With ban rights the bot unbans, the assistant rejoins, playback
    // starts.
    h.gateway.grant_bot_admin(CHAT, true);
    h.coordinator.enqueue(play_request("banned")).await.unwrap();

    assert!(h.gateway.promoted.lock().contains(&(CHAT, assistant)));
    assert!(h.session.join_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert_eq!(h.engine.total_plays(), 1);
    assert!(h.queue.is_active(CHAT));
}

#[tokio::test]
async fn test_advance_routes_only_to_bound_assistant() {
    let dir = tempfile::tempdir().unwrap();

    let queue = Arc::new(ChatQueueStore::new());
    let gateway = Arc::new(MockGateway::new());
    let store = Arc::new(MemoryChatStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let sources = Arc::new(chordcast::test_helpers::FixtureSourceFactory::new(
        dir.path().to_path_buf(),
    ));

    let engine_one = Arc::new(MockEngine::new());
    let engine_two = Arc::new(MockEngine::new());
    let session_one = Arc::new(MockUserSession::new(UserId(2001)));
    let session_two = Arc::new(MockUserSession::new(UserId(2002)));

    let mut pool = AssistantPool::new(store.clone(), gateway.clone());
    pool.register(session_one, engine_one.clone());
    pool.register(session_two.clone(), engine_two.clone());
    let assistants = Arc::new(pool);

    // Sticky-bind the chat to client2 ahead of time.
    store
        .set_assistant(CHAT, &AssistantKey::numbered(2))
        .await
        .unwrap();
    gateway.grant_bot_admin(CHAT, true);
    gateway.set_member(CHAT, session_two.user_id(), MemberStatus::Member);

    let admission = Arc::new(AdmissionService::new(gateway.clone(), store.clone(), UserId(1)));
    let calls = Arc::new(CallRouter::new(assistants.clone(), queue.clone()));
    let coordinator = Arc::new(PlaybackCoordinator::new(
        queue.clone(),
        admission,
        assistants,
        calls,
        sources.clone(),
        notifier,
        None,
    ));

    sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLs",
        vec![test_track("s1"), test_track("s2")],
    );
    coordinator
        .enqueue(EnqueueRequest {
            chat: CHAT,
            user: USER,
            requester: "tester".to_string(),
            input: PlayInput::Text("https://www.youtube.com/playlist?list=PLs".to_string()),
            is_video: false,
        })
        .await
        .unwrap();
    coordinator.advance(CHAT).await;

    // Every engine call went to client2's engine.
    assert_eq!(engine_two.total_plays(), 2);
    assert_eq!(engine_one.total_plays(), 0);
    assert!(engine_one.ops.lock().is_empty());
}

#[tokio::test]
async fn test_roster_cache_is_stable_between_invalidations() {
    let (h, _dir) = harness();
    let admin = AdminEntry::new(
        UserId(42),
        MemberStatus::Administrator(AdminRights::new(AdminRights::BAN_USERS)),
    );
    h.gateway.set_admins(CHAT, vec![admin.clone()]);

    let first = h.admission.admins(CHAT, false).await;
    let second = h.admission.admins(CHAT, false).await;
    assert_eq!(*first, *second);
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    h.admission.invalidate(CHAT);
    let third = h.admission.admins(CHAT, false).await;
    assert_eq!(*third, vec![admin]);
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn test_failed_roster_fetch_negatively_cached() {
    let (h, _dir) = harness();
    h.gateway
        .fail_admin_fetch
        .store(true, std::sync::atomic::Ordering::SeqCst);

    assert!(h.admission.admins(CHAT, false).await.is_empty());
    assert!(h.admission.admins(CHAT, false).await.is_empty());
    // Second read came from the negative cache entry.
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_auth_round_trip() {
    let (h, _dir) = harness();
    let user = UserId(77);

    assert!(!h.admission.is_authorized(CHAT, user).await.unwrap());

    h.store.add_auth_user(CHAT, user).await.unwrap();
    assert!(h.admission.is_authorized(CHAT, user).await.unwrap());

    h.store.remove_auth_user(CHAT, user).await.unwrap();
    assert!(!h.admission.is_authorized(CHAT, user).await.unwrap());
}

#[tokio::test]
async fn test_loop_round_trip_and_bounds() {
    let (h, _dir) = harness();
    h.sources.add_fixture("loopy", vec![test_track("loopy")]);
    h.coordinator.enqueue(play_request("loopy")).await.unwrap();

    for n in 0..=10u8 {
        h.coordinator.set_loop(CHAT, USER, n).await.unwrap();
        assert_eq!(h.queue.loop_count(CHAT), n);
    }

    h.coordinator.set_loop(CHAT, USER, 3).await.unwrap();
    let err = h.coordinator.set_loop(CHAT, USER, 11).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(h.queue.loop_count(CHAT), 3);
}

#[tokio::test]
async fn test_attachment_size_limit() {
    let gateway = Arc::new(MockGateway::new());
    let dir = tempfile::tempdir().unwrap();
    let max: u64 = 4 * 1024 * 1024;

    let at_limit = AttachmentRef {
        chat: CHAT,
        message_id: 1,
        file_name: "ok.mp3".to_string(),
        file_size: max,
        is_video: false,
    };
    gateway.add_attachment("https://t.me/music/1", at_limit);

    let over = AttachmentRef {
        chat: CHAT,
        message_id: 2,
        file_name: "big.mp3".to_string(),
        file_size: max + 1,
        is_video: false,
    };
    gateway.add_attachment("https://t.me/music/2", over);

    let source = AttachmentSource::new(
        "https://t.me/music/1",
        gateway.clone(),
        dir.path().to_path_buf(),
        max,
    );
    let tracks = source.get_info().await.unwrap();
    assert_eq!(tracks[0].title, "ok.mp3");

    let source = AttachmentSource::new(
        "https://t.me/music/2",
        gateway.clone(),
        dir.path().to_path_buf(),
        max,
    );
    let err = source.get_info().await.unwrap_err();
    match err {
        Error::FileTooLarge { limit_mb, .. } => assert_eq!(limit_mb, 4),
        other => panic!("expected FileTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn test_download_deadline_names_the_track() {
    struct SlowSource;

    #[async_trait::async_trait]
    impl MediaSource for SlowSource {
        fn is_valid(&self) -> bool {
            true
        }
        async fn get_info(&self) -> chordcast::Result<Vec<chordcast::models::Track>> {
            Ok(vec![test_track("sloth")])
        }
        async fn search(&self) -> chordcast::Result<Vec<chordcast::models::Track>> {
            self.get_info().await
        }
        async fn get_track(&self) -> chordcast::Result<chordcast::models::Track> {
            Ok(test_track("sloth"))
        }
        async fn download(
            &self,
            _track: &chordcast::models::Track,
            _is_video: bool,
        ) -> chordcast::Result<std::path::PathBuf> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("deadline fires first")
        }
    }

    let resolver = SourceResolver::with_backend(
        Box::new(SlowSource),
        BackendKind::Youtube,
        Duration::from_secs(30),
        Duration::from_millis(20),
    );

    let err = resolver
        .download(&test_track("sloth"), false)
        .await
        .unwrap_err();
    match err {
        Error::Deadline(msg) => assert!(msg.contains("timed out for video sloth")),
        other => panic!("expected deadline, got {other:?}"),
    }
}

#[tokio::test]
async fn test_queue_view_snapshot() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLq",
        vec![test_track("q1"), test_track("q2"), test_track("q3")],
    );
    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLq"))
        .await
        .unwrap();

    let view = h.coordinator.queue_view(CHAT);
    assert_eq!(view.total, 3);
    assert_eq!(view.now.unwrap().track.id, "q1");
    assert_eq!(view.upcoming.len(), 2);
    assert_eq!(view.upcoming[1].track.id, "q3");
}

#[tokio::test]
async fn test_participant_change_invalidates_roster() {
    let (h, _dir) = harness();
    h.gateway.set_admins(CHAT, vec![]);

    h.admission.admins(CHAT, false).await;
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // A change to some bystander keeps the cache.
    h.coordinator
        .note_participant_change(&chordcast::test_helpers::participant_change(
            CHAT,
            UserId(555),
            MemberStatus::Member,
        ));
    h.admission.admins(CHAT, false).await;
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // A change targeting the bot drops the roster entry.
    h.coordinator
        .note_participant_change(&chordcast::test_helpers::participant_change(
            CHAT,
            h.gateway.bot_id,
            MemberStatus::Member,
        ));
    h.admission.admins(CHAT, false).await;
    assert_eq!(
        h.gateway.admin_fetches.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn test_stop_clears_queue_and_leaves() {
    let (h, _dir) = harness();
    h.sources.add_fixture(
        "https://www.youtube.com/playlist?list=PLst",
        vec![test_track("st1"), test_track("st2")],
    );
    h.coordinator
        .enqueue(play_request("https://www.youtube.com/playlist?list=PLst"))
        .await
        .unwrap();

    h.coordinator.stop(CHAT, USER).await.unwrap();
    assert!(!h.queue.is_active(CHAT));
    assert_eq!(h.queue.queue_len(CHAT), 0);
    assert!(h
        .engine
        .ops
        .lock()
        .iter()
        .any(|op| matches!(op, chordcast::test_helpers::EngineOp::Leave(c) if *c == CHAT)));
}

#[tokio::test]
async fn test_pop_head_releases_materialized_file() {
    let (h, _dir) = harness();
    h.sources.add_fixture("filecheck", vec![test_track("filecheck")]);
    h.coordinator.enqueue(play_request("filecheck")).await.unwrap();

    let path = h.queue.playing(CHAT).unwrap().local_path.unwrap();
    assert!(path.exists());

    h.coordinator.advance(CHAT).await;
    assert!(!path.exists());
}
