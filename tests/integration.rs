//! Integration tests for the sync layer.

use crossbeam_channel::Receiver;
use livesync::{
    fields_from_json, ChannelTransport, ClientMirror, Computation, Cursor, FieldDiff, Fields,
    MemoryCollection, Publication, PublicationContext, Selector, Server, ServerMessage, Session,
    SubscriptionState, UserId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn fields(value: Value) -> Fields {
    fields_from_json(value)
}

fn connect(server: &Server) -> (Arc<Session>, Receiver<ServerMessage>) {
    let (transport, receiver) = ChannelTransport::new();
    (server.connect(transport).unwrap(), receiver)
}

/// Everything the client has received so far.
fn messages(session: &Session, receiver: &Receiver<ServerMessage>) -> Vec<ServerMessage> {
    session.flush().unwrap();
    receiver.try_iter().collect()
}

fn documents(messages: &[ServerMessage]) -> Vec<&ServerMessage> {
    messages.iter().filter(|m| m.collection().is_some()).collect()
}

/// Publication asserting one fixed document and marking itself ready.
fn publish_doc(server: &Server, name: &str, id: &'static str, doc: Value) {
    server
        .publish(name, move |ctx: &PublicationContext, _params: &[Value]| {
            ctx.added("docs", id, fields(doc.clone()))?;
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
}

// --- Merge Scenarios ---

#[test]
fn test_overlapping_subscriptions_merge_and_retract() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = Server::default();
    publish_doc(&server, "a", "doc1", json!({"x": 1, "y": 1}));
    publish_doc(&server, "b", "doc1", json!({"y": 2, "z": 3}));
    let (session, receiver) = connect(&server);

    let a = session.subscribe("a", vec![]).unwrap();
    let b = session.subscribe("b", vec![]).unwrap();

    let received = messages(&session, &receiver);
    let docs = documents(&received);
    assert_eq!(docs.len(), 2);
    assert_eq!(
        docs[0],
        &ServerMessage::Added {
            collection: "docs".into(),
            id: "doc1".into(),
            fields: fields(json!({"x": 1, "y": 1})),
        }
    );
    match docs[1] {
        ServerMessage::Changed {
            fields: changed,
            cleared,
            ..
        } => {
            assert_eq!(changed.get("z"), Some(&json!(3)));
            // Either live value of y is acceptable.
            if let Some(y) = changed.get("y") {
                assert!(y == &json!(1) || y == &json!(2));
            }
            assert!(cleared.is_empty());
        }
        other => panic!("expected changed, got {:?}", other),
    }
    assert_eq!(session.refcount("docs", "doc1").unwrap(), 2);

    a.stop();
    let received = messages(&session, &receiver);
    let docs = documents(&received);
    assert_eq!(docs.len(), 1);
    match docs[0] {
        ServerMessage::Changed {
            fields: changed,
            cleared,
            ..
        } => {
            assert_eq!(cleared, &vec!["x".to_string()]);
            assert!(!changed.contains_key("z"));
        }
        other => panic!("expected changed, got {:?}", other),
    }
    assert!(received.contains(&ServerMessage::Nosub {
        id: a.id(),
        error: None
    }));
    assert_eq!(
        session.document("docs", "doc1").unwrap(),
        Some(fields(json!({"y": 2, "z": 3})))
    );

    b.stop();
    let received = messages(&session, &receiver);
    assert_eq!(
        documents(&received),
        vec![&ServerMessage::Removed {
            collection: "docs".into(),
            id: "doc1".into(),
        }]
    );
    assert_eq!(session.refcount("docs", "doc1").unwrap(), 0);
}

#[test]
fn test_mirror_follows_merged_stream() {
    let server = Server::default();
    publish_doc(&server, "a", "doc1", json!({"x": 1}));
    publish_doc(&server, "b", "doc1", json!({"x": 1, "y": 2}));
    let (session, receiver) = connect(&server);
    let mut mirror = ClientMirror::new();
    mirror.declare_collection("docs").unwrap();

    let a = session.subscribe("a", vec![]).unwrap();
    let b = session.subscribe("b", vec![]).unwrap();
    session.flush().unwrap();
    mirror.drain(&receiver).unwrap();
    assert!(mirror.is_ready(a.id()));
    assert!(mirror.is_ready(b.id()));
    assert_eq!(
        mirror.document("docs", &"doc1".into()),
        Some(&fields(json!({"x": 1, "y": 2})))
    );

    b.stop();
    session.flush().unwrap();
    mirror.drain(&receiver).unwrap();
    assert!(mirror.is_stopped(b.id()));
    assert_eq!(
        mirror.document("docs", &"doc1".into()),
        Some(&fields(json!({"x": 1})))
    );
}

// --- Deduplication ---

#[test]
fn test_identical_subscribe_is_coalesced() {
    let server = Server::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    server
        .publish("posts", move |ctx: &PublicationContext, params: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            let owner = params.first().cloned().unwrap_or(Value::Null);
            ctx.added("posts", "p1", fields(json!({"owner": owner})))?;
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    let first = session.subscribe("posts", vec![json!("alice")]).unwrap();
    messages(&session, &receiver);

    let second = session.subscribe("posts", vec![json!("alice")]).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.subscription_count(), 1);
    // No retract/re-add pair reaches the client.
    assert!(messages(&session, &receiver).is_empty());

    // Different params start a second subscription.
    let third = session.subscribe("posts", vec![json!("bob")]).unwrap();
    assert_ne!(first.id(), third.id());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_resubscribe_after_stop_starts_fresh() {
    let server = Server::default();
    publish_doc(&server, "a", "doc1", json!({"x": 1}));
    let (session, receiver) = connect(&server);

    let first = session.subscribe("a", vec![]).unwrap();
    first.stop();
    let second = session.subscribe("a", vec![]).unwrap();
    assert_ne!(first.id(), second.id());

    let received = messages(&session, &receiver);
    let docs = documents(&received);
    assert!(matches!(docs[0], ServerMessage::Added { .. }));
    assert!(matches!(docs[1], ServerMessage::Removed { .. }));
    assert!(matches!(docs[2], ServerMessage::Added { .. }));
}

#[test]
fn test_computation_reruns_never_flicker() {
    let server = Server::default();
    let posts = MemoryCollection::new("posts");
    posts
        .insert("p1", fields(json!({"owner": "alice", "title": "hi"})))
        .unwrap();
    posts
        .insert("p2", fields(json!({"owner": "bob", "title": "yo"})))
        .unwrap();
    let source = posts.clone();
    server
        .publish("by_owner", move |_ctx: &PublicationContext, params: &[Value]| {
            let owner = params.first().cloned().unwrap_or(Value::Null);
            Ok(Publication::cursor(source.find(Selector::eq("owner", owner))))
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    let computation = Computation::new(Arc::clone(&session));
    let mut ids = Vec::new();
    for _ in 0..5 {
        let handle = computation
            .run(|cycle| cycle.subscribe("by_owner", vec![json!("alice")]))
            .unwrap()
            .unwrap();
        ids.push(handle.id());
    }
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(computation.runs(), 5);

    let received = messages(&session, &receiver);
    let docs = documents(&received);
    assert_eq!(docs.len(), 1);
    assert!(matches!(docs[0], ServerMessage::Added { id, .. } if id.as_str() == "p1"));

    // Switching owner stops the subscription no longer requested.
    computation
        .run(|cycle| cycle.subscribe("by_owner", vec![json!("bob")]))
        .unwrap()
        .unwrap();
    assert_eq!(session.subscription_count(), 1);
    let received = messages(&session, &receiver);
    let docs = documents(&received);
    assert!(docs
        .iter()
        .any(|m| matches!(m, ServerMessage::Added { id, .. } if id.as_str() == "p2")));
    assert!(docs
        .iter()
        .any(|m| matches!(m, ServerMessage::Removed { id, .. } if id.as_str() == "p1")));
    assert!(received
        .iter()
        .any(|m| matches!(m, ServerMessage::Nosub { id, error: None } if *id == ids[0])));

    computation.stop();
    assert!(computation.is_stopped());
    assert_eq!(session.subscription_count(), 0);
    assert!(computation.run(|_| ()).is_err());
    assert_eq!(posts.observer_count(), 0);
}

// --- Ready ---

#[test]
fn test_ready_follows_cursor_snapshot() {
    let server = Server::default();
    let posts = MemoryCollection::new("posts");
    for i in 0..3 {
        posts
            .insert(format!("p{}", i), fields(json!({"n": i})))
            .unwrap();
    }
    let comments = MemoryCollection::new("comments");
    comments.insert("c1", fields(json!({"post": "p0"}))).unwrap();

    let (p, c) = (posts.clone(), comments.clone());
    server
        .publish("feed", move |_ctx: &PublicationContext, _params: &[Value]| {
            Ok(Publication::Cursors(vec![
                Box::new(p.find(Selector::all())) as Box<dyn Cursor>,
                Box::new(c.find(Selector::all())),
            ]))
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    let handle = session.subscribe("feed", vec![]).unwrap();
    assert!(handle.ready());
    assert_eq!(handle.state(), SubscriptionState::Ready);

    let received = messages(&session, &receiver);
    let ready_at = received
        .iter()
        .position(|m| matches!(m, ServerMessage::Ready { .. }))
        .unwrap();
    assert_eq!(ready_at, 4);
    assert_eq!(
        received
            .iter()
            .filter(|m| matches!(m, ServerMessage::Ready { .. }))
            .count(),
        1
    );

    // Live changes flow after ready.
    posts.insert("p9", fields(json!({"n": 9}))).unwrap();
    let mut diff = FieldDiff::new();
    diff.insert("n".into(), Some(json!(10)));
    posts.update("p0", diff).unwrap();
    posts.remove("p1").unwrap();

    let received = messages(&session, &receiver);
    assert_eq!(received.len(), 3);
    assert!(matches!(&received[0], ServerMessage::Added { id, .. } if id.as_str() == "p9"));
    assert!(matches!(&received[1], ServerMessage::Changed { id, .. } if id.as_str() == "p0"));
    assert!(matches!(&received[2], ServerMessage::Removed { id, .. } if id.as_str() == "p1"));
}

#[test]
fn test_empty_publication_is_ready_immediately() {
    let server = Server::default();
    server
        .publish("nothing", |_ctx: &PublicationContext, _params: &[Value]| {
            Ok(Publication::empty())
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    let handle = session.subscribe("nothing", vec![]).unwrap();
    assert!(handle.ready());
    assert_eq!(
        messages(&session, &receiver),
        vec![ServerMessage::Ready {
            subs: vec![handle.id()]
        }]
    );
    assert_eq!(session.edge_count(handle.id()).unwrap(), 0);
}

#[test]
fn test_ready_twice_is_noop() {
    let server = Server::default();
    server
        .publish("twice", |ctx: &PublicationContext, _params: &[Value]| {
            ctx.ready();
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    session.subscribe("twice", vec![]).unwrap();
    let received = messages(&session, &receiver);
    assert_eq!(received.len(), 1);
}

#[test]
fn test_stop_before_ready_retracts_partial_edges() {
    let server = Server::default();
    publish_doc(&server, "shared", "doc1", json!({"a": 1}));
    server
        .publish("partial", |ctx: &PublicationContext, _params: &[Value]| {
            ctx.added("docs", "doc1", fields(json!({"b": 2})))?;
            ctx.added("docs", "doc2", fields(json!({"c": 3})))?;
            // Never ready.
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    session.subscribe("shared", vec![]).unwrap();
    let partial = session.subscribe("partial", vec![]).unwrap();
    assert_eq!(partial.state(), SubscriptionState::Initializing);
    assert!(!partial.ready());
    messages(&session, &receiver);

    partial.stop();
    let received = messages(&session, &receiver);
    assert!(!received
        .iter()
        .any(|m| matches!(m, ServerMessage::Ready { subs } if subs.contains(&partial.id()))));
    assert!(received.contains(&ServerMessage::Changed {
        collection: "docs".into(),
        id: "doc1".into(),
        fields: Fields::new(),
        cleared: vec!["b".into()],
    }));
    assert!(received.contains(&ServerMessage::Removed {
        collection: "docs".into(),
        id: "doc2".into(),
    }));
    assert_eq!(
        received.last(),
        Some(&ServerMessage::Nosub {
            id: partial.id(),
            error: None
        })
    );
    assert_eq!(session.edge_count(partial.id()).unwrap(), 0);
}

// --- Lifecycle ---

#[test]
fn test_on_stop_runs_once_in_order() {
    let server = Server::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    server
        .publish("tracked", move |ctx: &PublicationContext, _params: &[Value]| {
            for step in 1..=3 {
                let sink = Arc::clone(&sink);
                ctx.on_stop(move || sink.lock().push(step));
            }
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, _receiver) = connect(&server);

    let handle = session.subscribe("tracked", vec![]).unwrap();
    handle.stop();
    handle.stop();
    assert_eq!(*log.lock(), vec![1, 2, 3]);
    assert!(handle.is_stopped());
}

#[test]
fn test_handler_stops_itself() {
    let server = Server::default();
    server
        .publish("once", |ctx: &PublicationContext, _params: &[Value]| {
            ctx.added("docs", "d", fields(json!({"v": 1})))?;
            ctx.ready();
            ctx.stop();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, receiver) = connect(&server);

    let handle = session.subscribe("once", vec![]).unwrap();
    assert!(handle.is_stopped());
    assert!(handle.error().is_none());

    let received = messages(&session, &receiver);
    assert!(received.contains(&ServerMessage::Removed {
        collection: "docs".into(),
        id: "d".into(),
    }));
    assert_eq!(session.subscription_count(), 0);
}

#[test]
fn test_rerun_on_identity_change() {
    let server = Server::default();
    server
        .publish("me", |ctx: &PublicationContext, _params: &[Value]| {
            let user = ctx
                .identity()
                .map(|u| u.0.clone())
                .unwrap_or_else(|| "anonymous".to_string());
            ctx.added("users", user.as_str(), fields(json!({"name": user})))?;
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, receiver) = connect(&server);
    let mut mirror = ClientMirror::new();
    mirror.declare_collection("users").unwrap();

    let handle = session.subscribe("me", vec![]).unwrap();
    session.flush().unwrap();
    mirror.drain(&receiver).unwrap();
    assert!(mirror.document("users", &"anonymous".into()).is_some());

    session.set_identity(Some(UserId::from("alice")));
    assert_eq!(session.identity(), Some(UserId::from("alice")));
    assert_eq!(handle.state(), SubscriptionState::Ready);

    let received = messages(&session, &receiver);
    let removed_at = received
        .iter()
        .position(|m| matches!(m, ServerMessage::Removed { id, .. } if id.as_str() == "anonymous"))
        .unwrap();
    let added_at = received
        .iter()
        .position(|m| matches!(m, ServerMessage::Added { id, .. } if id.as_str() == "alice"))
        .unwrap();
    assert!(removed_at < added_at);
    mirror.apply_all(received).unwrap();
    assert!(mirror.document("users", &"anonymous".into()).is_none());
    assert!(mirror.document("users", &"alice".into()).is_some());

    // Same identity again: nothing reruns.
    session.set_identity(Some(UserId::from("alice")));
    assert!(messages(&session, &receiver).is_empty());
}

#[test]
fn test_on_stop_runs_on_rerun() {
    let server = Server::default();
    let stops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stops);
    server
        .publish("watch", move |ctx: &PublicationContext, _params: &[Value]| {
            let counter = Arc::clone(&counter);
            ctx.on_stop(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            ctx.ready();
            Ok(Publication::Manual)
        })
        .unwrap();
    let (session, _receiver) = connect(&server);

    let handle = session.subscribe("watch", vec![]).unwrap();
    session.set_identity(Some(UserId::from("a")));
    session.set_identity(Some(UserId::from("b")));
    assert_eq!(stops.load(Ordering::SeqCst), 2);

    handle.stop();
    assert_eq!(stops.load(Ordering::SeqCst), 3);
}

#[test]
fn test_buffering_until_collection_declared() {
    let server = Server::default();
    publish_doc(&server, "a", "doc1", json!({"x": 1}));
    let (session, receiver) = connect(&server);
    let mut mirror = ClientMirror::new();

    let handle = session.subscribe("a", vec![]).unwrap();
    session.flush().unwrap();
    mirror.drain(&receiver).unwrap();

    assert!(mirror.is_ready(handle.id()));
    assert_eq!(mirror.pending_count("docs"), 1);
    assert!(mirror.document("docs", &"doc1".into()).is_none());

    assert_eq!(mirror.declare_collection("docs").unwrap(), 1);
    assert_eq!(
        mirror.document("docs", &"doc1".into()),
        Some(&fields(json!({"x": 1})))
    );
}

#[test]
fn test_sessions_are_isolated() {
    let server = Server::default();
    publish_doc(&server, "a", "doc1", json!({"x": 1}));
    let (first, first_rx) = connect(&server);
    let (second, second_rx) = connect(&server);
    assert_eq!(server.session_count(), 2);

    first.subscribe("a", vec![]).unwrap();
    assert_eq!(messages(&first, &first_rx).len(), 2);
    assert!(messages(&second, &second_rx).is_empty());
    assert!(second.document("docs", "doc1").unwrap().is_none());

    assert!(server.disconnect(first.id()));
    assert!(!server.disconnect(first.id()));
    assert!(!first.is_connected());
    assert_eq!(server.session_count(), 1);

    server.shutdown();
    assert_eq!(server.session_count(), 0);
}
