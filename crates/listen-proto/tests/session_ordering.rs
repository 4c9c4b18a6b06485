use chrono::DateTime;
use listen_proto::protocol::{parse_frame, GatewayFrame, NowPlaying};
use listen_proto::session::{Session, TrackChange};

fn delivery(id: u64) -> NowPlaying {
    NowPlaying {
        song: serde_json::from_value(serde_json::json!({ "id": id, "duration": 90 })).unwrap(),
        started_at: DateTime::from_timestamp(1_700_000_000 + id as i64 * 100, 0).unwrap(),
        listeners: id,
        requester: None,
        event: None,
        last_played: Vec::new(),
    }
}

fn permutations(items: &[u64]) -> Vec<Vec<u64>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

#[test]
fn newest_delivery_always_wins() {
    for order in permutations(&[1, 2, 3, 4, 5]) {
        let mut session = Session::new(50, 10);
        for id in &order {
            session.apply_now_playing(delivery(*id));
        }
        assert_eq!(session.current_song_id(), Some(5), "order {:?}", order);
        assert_eq!(session.listeners, 5);

        let played: Vec<_> = session.history.recent().map(|e| e.played_at).collect();
        assert!(
            played.windows(2).all(|w| w[0] > w[1]),
            "history out of order for {:?}",
            order
        );
        assert!(session.history.recent().all(|e| e.song.id != 5));
    }
}

#[test]
fn rev_only_moves_on_accepted_deliveries() {
    let mut session = Session::default();
    let start = session.rev;
    assert!(matches!(
        session.apply_now_playing(delivery(3)),
        TrackChange::Changed { .. }
    ));
    assert_eq!(session.apply_now_playing(delivery(2)), TrackChange::Stale);
    assert_eq!(session.rev, start + 1);
}

#[test]
fn gateway_track_frames_feed_the_session() {
    let frame = r#"{
        "op": 1,
        "t": "TRACK_UPDATE",
        "d": {
            "song": { "id": 77, "title": "Hare Hare Yukai", "artists": [], "duration": 250 },
            "startTime": "2024-03-01T12:00:00.000Z",
            "listeners": 412,
            "requester": null,
            "event": null,
            "lastPlayed": []
        }
    }"#;
    let np = match parse_frame(frame).unwrap() {
        GatewayFrame::Track(np) => np,
        other => panic!("expected a track frame, got {:?}", other),
    };

    let mut session = Session::default();
    session.apply_now_playing(np);
    assert_eq!(session.current_song_id(), Some(77));
    assert_eq!(session.listeners, 412);
}
