//! Client-side flows: searches, puts, listens, persistence.

mod support;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cairn::common::messages::{
    Message, MessageBody, NodeRecord, RequestAnswer, RequestKind, ResponseBody,
};
use cairn::{accept_all, get_callback, Config, Dht, Id, Value, ValueFilter};

use support::*;

fn v4(host: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, host], port))
}

fn new_dht(t0: Instant) -> (Dht, Outbox) {
    let (transport, outbox) = TestTransport::new();
    let mut config = Config::default();
    config.node_id = Some(id_with_first_byte(0x00, 0x01));
    (Dht::new(config, transport, t0), outbox)
}

fn peer_token(peer: &Peer) -> Box<[u8]> {
    vec![peer.addr.port() as u8; 64].into()
}

/// Run the node against scripted peers that all serve `values` at any
/// key, answering every request kind. Returns the full request log.
fn serve(
    dht: &mut Dht,
    outbox: &Outbox,
    peers: &[Peer],
    values: &[Value],
    now: &mut Instant,
    rounds: usize,
) -> Vec<(Message, SocketAddr)> {
    let mut log = vec![];

    let records: Vec<NodeRecord> = peers
        .iter()
        .map(|p| NodeRecord {
            id: p.id,
            addr: p.addr,
        })
        .collect();

    for _ in 0..rounds {
        dht.periodic(None, *now);

        let sent = take_sent(outbox);
        for (message, to) in sent {
            log.push((message.clone(), to));

            let Some(peer) = peers.iter().find(|p| p.addr == to) else {
                continue;
            };
            let Some(kind) = request_kind(&message) else {
                continue;
            };

            let answer = match kind {
                RequestKind::Ping => RequestAnswer::default(),
                RequestKind::FindNode { .. } => {
                    RequestAnswer::default().with_nodes(records.clone(), vec![])
                }
                RequestKind::GetValues { .. } => RequestAnswer::default()
                    .with_nodes(records.clone(), vec![])
                    .with_token(peer_token(peer))
                    .with_values(values.to_vec()),
                RequestKind::Listen { rid, .. } => RequestAnswer::default().with_ack_rid(*rid),
                RequestKind::AnnounceValues { .. } => RequestAnswer::default(),
            };

            let reply = peer.response(&message, answer);
            dht.periodic(Some((&encode(&reply), peer.addr)), *now);
        }

        *now += Duration::from_millis(700);
    }

    log
}

#[test]
fn bootstrap_get_sends_find_node_within_one_tick() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let bootstrap = Peer::new(id_with_first_byte(0x00, 0x02), v4(2, 7100));

    assert!(dht.insert_node(bootstrap.id, bootstrap.addr));

    let target = Id([0xff; 20]);
    dht.get(target, get_callback(|_| true), None, accept_all());
    dht.periodic(None, t0);

    let sent = take_sent(&outbox);
    let find = find_sent(&sent, |m, a| {
        *a == bootstrap.addr
            && matches!(request_kind(m), Some(RequestKind::FindNode { target: t, .. }) if *t == target)
    });

    assert!(find.is_some(), "expected find_node(target) to the seed node");
}

#[test]
fn get_streams_each_value_once_and_completes() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);

    let peers = [
        Peer::new(id_with_first_byte(0xff, 1), v4(3, 7101)),
        Peer::new(id_with_first_byte(0xfe, 1), v4(4, 7102)),
        Peer::new(id_with_first_byte(0xfd, 1), v4(5, 7103)),
    ];
    dht.insert_node(peers[0].id, peers[0].addr);

    let target = Id([0xff; 20]);
    let value = Value::new(0, "hello").with_id(77);

    let received: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(vec![]));
    let done: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));

    let received_in_cb = received.clone();
    let done_in_cb = done.clone();
    dht.get(
        target,
        get_callback(move |values| {
            received_in_cb
                .borrow_mut()
                .extend(values.iter().map(|v| v.id));
            true
        }),
        Some(Box::new(move |ok| {
            *done_in_cb.borrow_mut() = Some(ok);
        })),
        accept_all(),
    );

    let mut now = t0;
    serve(&mut dht, &outbox, &peers, &[value], &mut now, 30);

    // Every peer returned value 77; the callback saw it exactly once.
    assert_eq!(*received.borrow(), vec![77]);
    assert_eq!(*done.borrow(), Some(true));
}

#[test]
fn get_filter_prefilters_values() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peers = [Peer::new(id_with_first_byte(0xff, 1), v4(6, 7104))];
    dht.insert_node(peers[0].id, peers[0].addr);

    let target = Id([0xff; 20]);
    let wanted = Value::new(7, "wanted").with_id(1);
    let unwanted = Value::new(0, "unwanted").with_id(2);

    let received: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(vec![]));
    let received_in_cb = received.clone();

    let filter: ValueFilter = Rc::new(|v: &Value| v.type_id == 7);
    dht.get(
        target,
        get_callback(move |values| {
            received_in_cb
                .borrow_mut()
                .extend(values.iter().map(|v| v.id));
            true
        }),
        None,
        filter,
    );

    let mut now = t0;
    serve(
        &mut dht,
        &outbox,
        &peers,
        &[wanted, unwanted],
        &mut now,
        30,
    );

    assert_eq!(*received.borrow(), vec![1]);
}

#[test]
fn get_with_no_reachable_peers_fails_without_values() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let silent = Peer::new(id_with_first_byte(0xff, 1), v4(7, 7105));
    dht.insert_node(silent.id, silent.addr);

    let target = Id([0xff; 20]);
    let called = Rc::new(RefCell::new(false));
    let done: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));

    let called_in_cb = called.clone();
    let done_in_cb = done.clone();
    dht.get(
        target,
        get_callback(move |_| {
            *called_in_cb.borrow_mut() = true;
            true
        }),
        Some(Box::new(move |ok| {
            *done_in_cb.borrow_mut() = Some(ok);
        })),
        accept_all(),
    );

    // Nobody ever answers; the frontier expires after the retry regime.
    let mut now = t0;
    for _ in 0..120 {
        now += Duration::from_secs(1);
        dht.periodic(None, now);
        take_sent(&outbox);
    }

    assert_eq!(*done.borrow(), Some(false));
    assert!(!*called.borrow(), "cb must not fire without values");
}

#[test]
fn put_announces_with_the_nodes_token_and_completes() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peers = [
        Peer::new(id_with_first_byte(0xff, 1), v4(8, 7106)),
        Peer::new(id_with_first_byte(0xfe, 1), v4(9, 7107)),
    ];
    dht.insert_node(peers[0].id, peers[0].addr);

    let target = Id([0xff; 20]);
    let value = Value::new(0, "announced").with_id(9);

    let done: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
    let done_in_cb = done.clone();
    dht.put(
        target,
        value.clone(),
        Some(Box::new(move |ok| {
            *done_in_cb.borrow_mut() = Some(ok);
        })),
        None,
    );

    assert_eq!(dht.get_put(&target).len(), 1);
    assert!(dht.get_put_value(&target, 9).is_some());

    let mut now = t0;
    let log = serve(&mut dht, &outbox, &peers, &[], &mut now, 30);

    let announce = log.iter().find_map(|(m, to)| match request_kind(m) {
        Some(RequestKind::AnnounceValues {
            key,
            token,
            values,
            ..
        }) if *key == target => Some((token.clone(), values.clone(), *to)),
        _ => None,
    });

    let (token, values, to) = announce.expect("an announce_values request");
    let peer = peers.iter().find(|p| p.addr == to).unwrap();
    assert_eq!(token, peer_token(peer), "announce must carry the node's token");
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].id, 9);
    assert_eq!(*done.borrow(), Some(true));
}

#[test]
fn cancel_put_stops_reannounce_traffic() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peers = [Peer::new(id_with_first_byte(0xff, 1), v4(10, 7108))];
    dht.insert_node(peers[0].id, peers[0].addr);

    let target = Id([0xff; 20]);
    dht.put(target, Value::new(0, "v").with_id(9), None, None);

    let mut now = t0;
    let log = serve(&mut dht, &outbox, &peers, &[], &mut now, 20);
    assert!(log
        .iter()
        .any(|(m, _)| matches!(request_kind(m), Some(RequestKind::AnnounceValues { .. }))));

    assert!(dht.cancel_put(&target, 9));
    assert!(!dht.cancel_put(&target, 9));

    // Run well past the re-announce deadline: silence for this value.
    now += Duration::from_secs(11 * 60);
    let log = serve(&mut dht, &outbox, &peers, &[], &mut now, 30);
    assert!(
        !log.iter()
            .any(|(m, _)| matches!(request_kind(m), Some(RequestKind::AnnounceValues { .. }))),
        "cancel_put must stop announce traffic"
    );
}

#[test]
fn listen_installs_refreshes_and_receives_pushes() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peers = [Peer::new(id_with_first_byte(0xff, 1), v4(11, 7109))];
    dht.insert_node(peers[0].id, peers[0].addr);

    let target = Id([0xff; 20]);
    let received: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(vec![]));
    let received_in_cb = received.clone();

    let token = dht.listen(
        target,
        get_callback(move |values| {
            received_in_cb
                .borrow_mut()
                .extend(values.iter().map(|v| v.id));
            true
        }),
        accept_all(),
    );

    let mut now = t0;
    let log = serve(&mut dht, &outbox, &peers, &[], &mut now, 30);

    let rid = log
        .iter()
        .find_map(|(m, _)| match request_kind(m) {
            Some(RequestKind::Listen { rid, token, .. }) => {
                assert_eq!(*token, peer_token(&peers[0]));
                Some(*rid)
            }
            _ => None,
        })
        .expect("a listen request");

    // The remote node pushes an update reusing the listen request id.
    let push = Message {
        transaction_id: rid,
        body: MessageBody::Response(ResponseBody {
            sender_id: peers[0].id,
            requester_addr: None,
            answer: RequestAnswer::default()
                .with_values(vec![Value::new(0, "pushed").with_id(4)])
                .with_ack_rid(rid),
        }),
    };
    dht.periodic(Some((&encode(&push), peers[0].addr)), now);

    assert_eq!(*received.borrow(), vec![4]);

    // The listen refreshes periodically.
    let listens = log
        .iter()
        .filter(|(m, _)| matches!(request_kind(m), Some(RequestKind::Listen { .. })))
        .count();
    assert!(listens >= 1);

    assert!(dht.cancel_listen(&target, token));
    assert!(!dht.cancel_listen(&target, token));
}

#[test]
fn concurrent_listens_have_independent_tokens() {
    let t0 = Instant::now();
    let (mut dht, _outbox) = new_dht(t0);
    let target = Id([0xff; 20]);

    let t1 = dht.listen(target, get_callback(|_| true), accept_all());
    let t2 = dht.listen(target, get_callback(|_| true), accept_all());

    assert_ne!(t1, t2);
    assert!(dht.cancel_listen(&target, t1));
    assert!(dht.cancel_listen(&target, t2));
    assert!(!dht.cancel_listen(&target, t1));
}

#[test]
fn listen_sees_values_already_stored_locally() {
    let t0 = Instant::now();
    let (mut dht, _outbox) = new_dht(t0);
    let target = Id([0xaa; 20]);

    // Seed local storage through import.
    let source = {
        let (mut other, outbox) = new_dht(t0);
        let peer = Peer::new(id_with_first_byte(0x50, 1), v4(12, 7110));
        let token_request = peer.request(
            1,
            RequestKind::GetValues {
                key: target,
                want: cairn::common::messages::Want {
                    v4: true,
                    v6: false,
                },
            },
        );
        other.periodic(Some((&encode(&token_request), peer.addr)), t0);
        let sent = take_sent(&outbox);
        let token = sent
            .iter()
            .find_map(|(m, _)| match &m.body {
                MessageBody::Response(body) => body.answer.token.clone(),
                _ => None,
            })
            .unwrap();

        let announce = peer.request(
            2,
            RequestKind::AnnounceValues {
                key: target,
                token,
                values: vec![Value::new(0, "local").with_id(12)],
                age_secs: 0,
            },
        );
        other.periodic(Some((&encode(&announce), peer.addr)), t0);
        other.export_values()
    };

    dht.import_values(&source).unwrap();

    let received: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(vec![]));
    let received_in_cb = received.clone();
    dht.listen(
        target,
        get_callback(move |values| {
            received_in_cb
                .borrow_mut()
                .extend(values.iter().map(|v| v.id));
            true
        }),
        accept_all(),
    );

    assert_eq!(*received.borrow(), vec![12]);
}

#[test]
fn import_restores_an_export_exactly() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peer = Peer::new(id_with_first_byte(0x51, 1), v4(13, 7111));
    let key = Id([0xbb; 20]);

    // Store two values server-side.
    let token_request = peer.request(
        1,
        RequestKind::GetValues {
            key,
            want: cairn::common::messages::Want {
                v4: true,
                v6: false,
            },
        },
    );
    dht.periodic(Some((&encode(&token_request), peer.addr)), t0);
    let token = take_sent(&outbox)
        .iter()
        .find_map(|(m, _)| match &m.body {
            MessageBody::Response(body) => body.answer.token.clone(),
            _ => None,
        })
        .unwrap();

    let announce = peer.request(
        2,
        RequestKind::AnnounceValues {
            key,
            token,
            values: vec![
                Value::new(0, "one").with_id(1),
                Value::new(0, "two").with_id(2),
            ],
            age_secs: 0,
        },
    );
    dht.periodic(Some((&encode(&announce), peer.addr)), t0);

    let export = dht.export_values();
    assert_eq!(export.len(), 1);

    let (mut restored, _outbox) = new_dht(t0);
    restored.import_values(&export).unwrap();

    let mut original: Vec<(u64, Vec<u8>)> = dht
        .get_local(&key, &accept_all())
        .iter()
        .map(|v| (v.id, v.data.to_vec()))
        .collect();
    let mut copied: Vec<(u64, Vec<u8>)> = restored
        .get_local(&key, &accept_all())
        .iter()
        .map(|v| (v.id, v.data.to_vec()))
        .collect();
    original.sort();
    copied.sort();

    assert_eq!(original, copied);
    assert_eq!(restored.get_store_size(), dht.get_store_size());
}

#[test]
fn export_nodes_lists_good_peers() {
    let t0 = Instant::now();
    let (mut dht, outbox) = new_dht(t0);
    let peers = [Peer::new(id_with_first_byte(0xff, 1), v4(14, 7112))];
    dht.insert_node(peers[0].id, peers[0].addr);

    // Nothing is good before a reply.
    assert!(dht.export_nodes().is_empty());

    let target = Id([0xff; 20]);
    dht.get(target, get_callback(|_| true), None, accept_all());
    let mut now = t0;
    serve(&mut dht, &outbox, &peers, &[], &mut now, 10);

    let exported = dht.export_nodes();
    assert!(exported.iter().any(|n| n.id == peers[0].id));
}

#[test]
fn shutdown_fails_pending_operations_and_notifies() {
    let t0 = Instant::now();
    let (mut dht, _outbox) = new_dht(t0);
    let peer = Peer::new(id_with_first_byte(0xff, 1), v4(15, 7113));
    dht.insert_node(peer.id, peer.addr);

    let target = Id([0xff; 20]);
    let done: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
    let done_in_cb = done.clone();
    dht.get(
        target,
        get_callback(|_| true),
        Some(Box::new(move |ok| {
            *done_in_cb.borrow_mut() = Some(ok);
        })),
        accept_all(),
    );

    let drained = Rc::new(RefCell::new(false));
    let drained_in_cb = drained.clone();
    dht.shutdown(Box::new(move || {
        *drained_in_cb.borrow_mut() = true;
    }));

    assert!(*drained.borrow());
    assert_eq!(*done.borrow(), Some(false));
}
