//! End-to-end coordinator scenarios over in-memory collaborators.

use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tether_core::{
    ConnectionId, Coordinator, CoordinatorConfig, Directory, MemoryDirectory, MemoryIdentity,
    MemoryMessageStore, Outbound, Outbox, Plane, StreamRelay,
};
use tether_protocol::{codec, kinds, Envelope, ErrorCode};
use tokio::sync::mpsc;

struct Client {
    conn: ConnectionId,
    rx: mpsc::Receiver<Outbound>,
    next_id: u32,
    /// Pushed envelopes not yet inspected.
    inbox: Vec<Envelope>,
}

impl Client {
    fn collect(&mut self) {
        while let Ok(frame) = self.rx.try_recv() {
            if let Outbound::Text(text) = frame {
                self.inbox.push(serde_json::from_str(&text).unwrap());
            }
        }
    }

    /// Take pushed envelopes of one type.
    fn take(&mut self, kind: &str) -> Vec<Envelope> {
        self.collect();
        let (matching, rest) = std::mem::take(&mut self.inbox)
            .into_iter()
            .partition(|e| e.t == kind && e.reply_to.is_none());
        self.inbox = rest;
        matching
    }

    fn clear(&mut self) {
        self.collect();
        self.inbox.clear();
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    identity: Arc<MemoryIdentity>,
    directory: Arc<MemoryDirectory>,
    hub_id: String,
    general: String,
}

impl Harness {
    async fn new() -> Self {
        let identity = Arc::new(MemoryIdentity::new());
        let directory = Arc::new(MemoryDirectory::new());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig::default(),
            identity.clone(),
            directory.clone(),
            Arc::new(MemoryMessageStore::new()),
        ));

        for user in ["alice", "bob", "carol", "mallory"] {
            identity.register(user, "pw");
        }
        let hub = directory.create_hub("alice", "Home").await.unwrap();
        directory.join_hub("bob", &hub.hub_id).await.unwrap();
        directory.join_hub("carol", &hub.hub_id).await.unwrap();
        let general = directory
            .create_channel("alice", &hub.hub_id, "general", false)
            .await
            .unwrap();

        Self {
            coordinator,
            identity,
            directory,
            hub_id: hub.hub_id,
            general: general.channel_id,
        }
    }

    fn connect(&self) -> Client {
        let (outbox, rx) = Outbox::channel(256);
        Client {
            conn: self.coordinator.accept(outbox),
            rx,
            next_id: 0,
            inbox: Vec::new(),
        }
    }

    async fn login(&self, user: &str) -> Client {
        let mut client = self.connect();
        let reply = self
            .request(&mut client, kinds::AUTH_LOGIN, json!({"username": user, "password": "pw"}))
            .await;
        assert_eq!(reply.ok, Some(true), "login failed: {reply:?}");
        client
    }

    /// Send a request and return its reply; pushes are kept in the inbox.
    async fn request(&self, client: &mut Client, kind: &str, body: Value) -> Envelope {
        client.next_id += 1;
        let id = format!("r{}", client.next_id);
        let raw = codec::encode(&Envelope::request(kind, id.clone(), body)).unwrap();
        self.coordinator.on_envelope(&client.conn, &raw).await;

        client.collect();
        let at = client
            .inbox
            .iter()
            .position(|e| e.reply_to.as_deref() == Some(id.as_str()))
            .expect("no reply");
        client.inbox.remove(at)
    }

    async fn create_call(&self, client: &mut Client, channel: &str) -> String {
        let reply = self
            .request(client, kinds::RTC_CALL_CREATE, json!({"channel_id": channel}))
            .await;
        reply.body["call"]["call_id"].as_str().unwrap().to_string()
    }

    async fn join_call(&self, client: &mut Client, call_id: &str) -> Envelope {
        self.request(client, kinds::RTC_JOIN, json!({"call_id": call_id}))
            .await
    }
}

fn peer_id(reply: &Envelope) -> String {
    reply.body["peer_id"].as_str().unwrap().to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_call_create_yields_one_call() {
    let h = Arc::new(Harness::new().await);
    let mut observer = h.login("carol").await;

    let mut handles = Vec::new();
    for user in ["alice", "bob"] {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            let mut client = h.login(user).await;
            let general = h.general.clone();
            h.create_call(&mut client, &general).await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(h.coordinator.stats().calls, 1);
    assert_eq!(observer.take(kinds::RTC_CALL_EVENT).len(), 1);
}

#[tokio::test]
async fn test_rejoin_returns_same_peer() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let call_id = h.create_call(&mut alice, &h.general).await;

    let first = h.join_call(&mut alice, &call_id).await;
    let again = h.join_call(&mut alice, &call_id).await;

    assert_eq!(peer_id(&first), peer_id(&again));
    assert_eq!(again.body["rejoined"], json!(true));
    assert_eq!(again.body["peers"].as_array().unwrap().len(), 1);
    assert_eq!(h.coordinator.stats().peers, 1);
}

#[tokio::test]
async fn test_switching_calls_leaves_first() {
    let h = Harness::new().await;
    let other = h
        .directory
        .create_channel("alice", &h.hub_id, "other", false)
        .await
        .unwrap()
        .channel_id;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;
    let mut carol = h.login("carol").await;

    let call_a = h.create_call(&mut alice, &h.general).await;
    let call_b = h.create_call(&mut alice, &other).await;
    let old = peer_id(&h.join_call(&mut alice, &call_a).await);
    h.join_call(&mut bob, &call_a).await;
    carol.clear();

    let new = h.join_call(&mut alice, &call_b).await;
    assert_eq!(new.body["rejoined"], json!(false));
    assert_ne!(peer_id(&new), old);

    // Carol sees the departure from A before the arrival in B.
    carol.collect();
    let order: Vec<(String, String)> = carol
        .inbox
        .iter()
        .filter(|e| e.t == kinds::RTC_PEER_EVENT)
        .map(|e| {
            (
                e.body["kind"].as_str().unwrap().to_string(),
                e.body["call_id"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("left".to_string(), call_a.clone()),
            ("joined".to_string(), call_b.clone()),
        ]
    );
    assert_eq!(
        h.coordinator.signaling().call(&call_a).unwrap().peers.len(),
        1
    );

    // The old peer id cannot be routed to any more.
    let reply = h
        .request(
            &mut bob,
            kinds::RTC_OFFER,
            json!({"call_id": call_a, "to_peer": old, "payload": {"sdp": "x"}}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));
    assert!(alice.take(kinds::RTC_OFFER).is_empty());
}

#[tokio::test]
async fn test_switch_out_of_last_seat_ends_call() {
    let h = Harness::new().await;
    let other = h
        .directory
        .create_channel("alice", &h.hub_id, "other", false)
        .await
        .unwrap()
        .channel_id;
    let mut alice = h.login("alice").await;
    let mut carol = h.login("carol").await;

    let call_a = h.create_call(&mut alice, &h.general).await;
    let call_b = h.create_call(&mut alice, &other).await;
    h.join_call(&mut alice, &call_a).await;
    carol.clear();
    h.join_call(&mut alice, &call_b).await;

    assert!(h.coordinator.signaling().call(&call_a).is_none());
    let ends = carol.take(kinds::RTC_CALL_END);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].body["call_id"], json!(call_a));
}

#[tokio::test]
async fn test_signaling_delivers_between_members_only() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;
    let mut carol = h.login("carol").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    let a = peer_id(&h.join_call(&mut alice, &call_id).await);
    let b = peer_id(&h.join_call(&mut bob, &call_id).await);

    let reply = h
        .request(
            &mut alice,
            kinds::RTC_OFFER,
            json!({"call_id": call_id, "to_peer": b, "payload": {"sdp": "offer"}}),
        )
        .await;
    assert_eq!(reply.body["delivered"], json!(true));
    let offers = bob.take(kinds::RTC_OFFER);
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].body["from_peer"], json!(a));
    assert_eq!(offers[0].body["to_peer"], json!(b));
    assert_eq!(offers[0].body["payload"], json!({"sdp": "offer"}));

    // Carol holds no seat in the call.
    let reply = h
        .request(
            &mut carol,
            kinds::RTC_ANSWER,
            json!({"call_id": call_id, "to_peer": a, "payload": {}}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));
    assert!(alice.take(kinds::RTC_ANSWER).is_empty());

    // Oversized payloads are refused.
    let big = "x".repeat(70 * 1024);
    let reply = h
        .request(
            &mut alice,
            kinds::RTC_OFFER,
            json!({"call_id": call_id, "to_peer": b, "payload": {"sdp": big}}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));
}

#[tokio::test]
async fn test_ice_before_offer_is_flushed_after_it() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    h.join_call(&mut alice, &call_id).await;
    let b = peer_id(&h.join_call(&mut bob, &call_id).await);
    bob.clear();

    for n in 0..2 {
        h.request(
            &mut alice,
            kinds::RTC_ICE,
            json!({"call_id": call_id, "to_peer": b, "payload": {"candidate": n}}),
        )
        .await;
    }
    bob.collect();
    assert!(bob.inbox.is_empty());

    h.request(
        &mut alice,
        kinds::RTC_OFFER,
        json!({"call_id": call_id, "to_peer": b, "payload": {"sdp": "offer"}}),
    )
    .await;
    bob.collect();
    let delivered: Vec<(&str, Value)> = bob
        .inbox
        .iter()
        .map(|e| (e.t.as_str(), e.body["payload"].clone()))
        .collect();
    assert_eq!(
        delivered,
        vec![
            (kinds::RTC_OFFER, json!({"sdp": "offer"})),
            (kinds::RTC_ICE, json!({"candidate": 0})),
            (kinds::RTC_ICE, json!({"candidate": 1})),
        ]
    );
}

#[tokio::test]
async fn test_close_broadcasts_one_leave_and_one_end() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;
    let mut carol = h.login("carol").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    h.join_call(&mut alice, &call_id).await;
    h.join_call(&mut bob, &call_id).await;
    carol.clear();

    h.coordinator.close(&alice.conn).await;
    h.coordinator.close(&alice.conn).await;
    assert_eq!(carol.take(kinds::RTC_PEER_EVENT).len(), 1);
    assert!(carol.take(kinds::RTC_CALL_END).is_empty());
    assert!(!h.coordinator.presence().is_online("alice"));

    h.coordinator.close(&bob.conn).await;
    let left = carol.take(kinds::RTC_PEER_EVENT);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].body["kind"], json!("left"));
    assert_eq!(carol.take(kinds::RTC_CALL_END).len(), 1);
    assert_eq!(h.coordinator.stats().calls, 0);
}

#[tokio::test]
async fn test_end_call_clears_seats() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    h.join_call(&mut alice, &call_id).await;
    let b = peer_id(&h.join_call(&mut bob, &call_id).await);

    let reply = h
        .request(&mut alice, kinds::RTC_END_CALL, json!({"call_id": call_id}))
        .await;
    assert_eq!(reply.body["peers"], json!(2));
    assert_eq!(bob.take(kinds::RTC_CALL_END).len(), 1);
    assert!(h.coordinator.seat_of(&bob.conn).is_none());
    assert!(h.coordinator.seat_of(&alice.conn).is_none());

    let reply = h
        .request(
            &mut alice,
            kinds::RTC_OFFER,
            json!({"call_id": call_id, "to_peer": b, "payload": {}}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));

    let reply = h.request(&mut bob, kinds::RTC_LEAVE, json!({})).await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_racing_end_call_never_keeps_a_dead_seat() {
    let h = Arc::new(Harness::new().await);
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    for _ in 0..500 {
        let call_id = h.create_call(&mut bob, &h.general).await;

        let joiner = {
            let h = h.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move {
                let reply = h.join_call(&mut alice, &call_id).await;
                (alice, reply)
            })
        };
        let ender = {
            let h = h.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move {
                h.request(&mut bob, kinds::RTC_END_CALL, json!({"call_id": call_id}))
                    .await;
                bob
            })
        };
        let (a, reply) = joiner.await.unwrap();
        alice = a;
        bob = ender.await.unwrap();

        if let Some(seat) = h.coordinator.seat_of(&alice.conn) {
            assert!(
                h.coordinator.signaling().is_member(&seat.call_id, &seat.peer_id),
                "seat held in a call that no longer exists"
            );
        }
        if reply.ok == Some(false) {
            assert_eq!(reply.error_code(), Some(ErrorCode::NotFound));
            assert!(h.coordinator.seat_of(&alice.conn).is_none());
        }

        assert!(h.coordinator.seat_of(&alice.conn).is_none());
        alice.clear();
        bob.clear();
    }

    let stats = h.coordinator.stats();
    assert_eq!(stats.calls, 0);
    assert_eq!(stats.peers, 0);
}

#[tokio::test]
async fn test_stream_publish_requires_seat() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    let reply = h
        .request(
            &mut alice,
            kinds::RTC_STREAM_PUBLISH,
            json!({"call_id": call_id, "media": "screen", "active": true}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));

    h.join_call(&mut alice, &call_id).await;
    bob.clear();
    h.request(
        &mut alice,
        kinds::RTC_STREAM_PUBLISH,
        json!({"call_id": call_id, "media": "screen", "active": true}),
    )
    .await;
    let events = bob.take(kinds::RTC_PEER_EVENT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body["kind"], json!("stream"));
    assert_eq!(events[0].body["media"], json!("screen"));
    assert_eq!(events[0].body["active"], json!(true));
}

#[tokio::test]
async fn test_messages_follow_visibility() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;
    let mut mallory = h.login("mallory").await;

    for text in ["one", "two", "three"] {
        let reply = h
            .request(
                &mut alice,
                kinds::MSG_SEND,
                json!({"channel_id": h.general, "text": text}),
            )
            .await;
        assert_eq!(reply.ok, Some(true));
    }
    let events = bob.take(kinds::MSG_EVENT);
    let seqs: Vec<u64> = events
        .iter()
        .map(|e| e.body["message"]["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(mallory.take(kinds::MSG_EVENT).is_empty());
    assert!(alice.take(kinds::MSG_EVENT).is_empty());

    let reply = h
        .request(
            &mut mallory,
            kinds::MSG_SEND,
            json!({"channel_id": h.general, "text": "let me in"}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::Forbidden));

    let reply = h
        .request(
            &mut bob,
            kinds::MSG_SEND,
            json!({"channel_id": h.general, "text": "x".repeat(8 * 1024 + 1)}),
        )
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::BadRequest));

    let page = h
        .request(
            &mut bob,
            kinds::MSG_LIST,
            json!({"channel_id": h.general, "before_seq": 3, "limit": 1}),
        )
        .await;
    let messages = page.body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], json!("two"));
    assert_eq!(page.body["has_more"], json!(true));
}

#[tokio::test]
async fn test_concurrent_sends_get_distinct_seqs() {
    let h = Arc::new(Harness::new().await);
    let mut handles = Vec::new();
    for user in ["alice", "bob", "carol"] {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            let mut client = h.login(user).await;
            let mut seqs = Vec::new();
            for n in 0..5 {
                let general = h.general.clone();
                let reply = h
                    .request(
                        &mut client,
                        kinds::MSG_SEND,
                        json!({"channel_id": general, "text": format!("{user} {n}")}),
                    )
                    .await;
                seqs.push(reply.body["message"]["seq"].as_u64().unwrap());
            }
            seqs
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (1..=15).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_private_channel_created_only_for_its_audience() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let reply = h
        .request(
            &mut alice,
            kinds::CHANNEL_CREATE,
            json!({"hub_id": h.hub_id, "name": "staff", "private": true}),
        )
        .await;
    assert_eq!(reply.ok, Some(true));
    assert!(bob.take(kinds::CHANNEL_EVENT).is_empty());

    h.request(
        &mut alice,
        kinds::CHANNEL_CREATE,
        json!({"hub_id": h.hub_id, "name": "lobby", "private": false}),
    )
    .await;
    let events = bob.take(kinds::CHANNEL_EVENT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body["kind"], json!("created"));
    assert_eq!(events[0].body["channel"]["name"], json!("lobby"));
}

#[tokio::test]
async fn test_channel_join_emits_member_event() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;
    let mut mallory = h.login("mallory").await;

    let reply = h
        .request(&mut bob, kinds::CHANNEL_JOIN, json!({"channel_id": h.general}))
        .await;
    assert_eq!(reply.body["channel"]["channel_id"], json!(h.general));
    let events = alice.take(kinds::CHANNEL_EVENT);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].body["kind"], json!("member_joined"));

    // Joining again is not announced twice.
    h.request(&mut bob, kinds::CHANNEL_JOIN, json!({"channel_id": h.general}))
        .await;
    assert!(alice.take(kinds::CHANNEL_EVENT).is_empty());

    let reply = h
        .request(&mut mallory, kinds::CHANNEL_JOIN, json!({"channel_id": h.general}))
        .await;
    assert_eq!(reply.error_code(), Some(ErrorCode::Forbidden));
}

#[tokio::test]
async fn test_hub_delete_ends_live_calls() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    h.join_call(&mut bob, &call_id).await;
    bob.clear();

    let reply = h
        .request(&mut alice, kinds::HUB_DELETE, json!({"hub_id": h.hub_id}))
        .await;
    assert_eq!(reply.ok, Some(true));
    assert_eq!(bob.take(kinds::RTC_CALL_END).len(), 1);
    let hub_events = bob.take(kinds::HUB_EVENT);
    assert_eq!(hub_events[0].body["kind"], json!("deleted"));
    assert!(h.coordinator.seat_of(&bob.conn).is_none());
    assert!(h.directory.channel(&h.general).await.is_err());
}

#[tokio::test]
async fn test_logout_releases_seat_and_presence() {
    let h = Harness::new().await;
    let mut alice = h.login("alice").await;
    let mut bob = h.login("bob").await;

    let call_id = h.create_call(&mut alice, &h.general).await;
    h.join_call(&mut alice, &call_id).await;
    h.join_call(&mut bob, &call_id).await;
    alice.clear();

    let reply = h.request(&mut bob, kinds::AUTH_LOGOUT, json!({})).await;
    assert_eq!(reply.ok, Some(true));
    assert!(!h.coordinator.presence().is_online("bob"));
    assert_eq!(alice.take(kinds::RTC_PEER_EVENT).len(), 1);

    let reply = h.request(&mut bob, kinds::AUTH_ME, json!({})).await;
    assert_eq!(reply.error_code(), Some(ErrorCode::AuthRequired));
}

#[tokio::test]
async fn test_hello_resume_restores_presence() {
    let h = Harness::new().await;
    let token = h.identity.issue_token("bob");
    let mut bob = h.connect();

    let ack = h
        .request(&mut bob, kinds::HELLO, json!({"resume": {"token": token}}))
        .await;
    assert_eq!(ack.t, kinds::HELLO_ACK);
    assert_eq!(ack.body["session"]["authenticated"], json!(true));
    assert!(h.coordinator.presence().is_online("bob"));

    let me = h.request(&mut bob, kinds::AUTH_ME, json!({})).await;
    assert_eq!(me.body, json!({"user_id": "bob", "connections": 1}));
}

#[test]
fn test_stream_takeover_scenario() {
    let relay = StreamRelay::new();
    let attach = |plane| {
        let (outbox, rx) = Outbox::channel(64);
        (relay.attach(plane, outbox), rx)
    };
    let (a_ctl, mut a_ctl_rx) = attach(Plane::Control);
    let (a_media, _a_media_rx) = attach(Plane::Media);
    let (b_ctl, _b_ctl_rx) = attach(Plane::Control);
    let (b_media, _b_media_rx) = attach(Plane::Media);
    let (viewer, mut viewer_rx) = attach(Plane::Media);

    let join = |role: &str, client: &str| {
        format!(r#"{{"type":"join","stream":"demo","role":"{role}","client_id":"{client}"}}"#)
    };
    relay.on_text(&a_ctl, &join("broadcaster", "A")).unwrap();
    relay.on_text(&a_media, &join("broadcaster", "A")).unwrap();
    relay.on_text(&viewer, &join("viewer", "V")).unwrap();
    relay.on_text(&b_ctl, &join("broadcaster", "B")).unwrap();
    relay.on_text(&b_media, &join("broadcaster", "B")).unwrap();

    let mut saw_takeover = false;
    while let Ok(frame) = a_ctl_rx.try_recv() {
        if let Outbound::Text(text) = frame {
            saw_takeover |= text.contains(r#""type":"takeover""#);
        }
    }
    assert!(saw_takeover);

    assert!(relay.on_frame(&a_media, Bytes::from_static(b"from-a")).is_err());
    assert_eq!(relay.on_frame(&b_media, Bytes::from_static(b"from-b")).unwrap(), 1);

    let mut binary = Vec::new();
    while let Ok(frame) = viewer_rx.try_recv() {
        if let Outbound::Binary(data) = frame {
            binary.push(data);
        }
    }
    assert_eq!(binary, vec![Bytes::from_static(b"from-b")]);
}
