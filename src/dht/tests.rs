use super::message::{decode_nodes, encode_nodes};
use super::testing::{MemoryNetwork, MemoryTransport};
use super::*;
use crate::bencode::{decode, encode, Dict, Value};
use crate::constants::K;
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_millis(200),
        search_workers: 2,
        ..DhtConfig::local()
    }
}

fn addr(i: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, (i / 250) as u8, (i % 250) as u8 + 1], 6881))
}

fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// An identifier whose first byte is `prefix`.
fn id_with_prefix(prefix: u8, tail: u8) -> Id {
    let mut bytes = [0u8; 20];
    bytes[0] = prefix;
    bytes[19] = tail;
    Id::from(bytes)
}

fn table_on(
    network: &Arc<MemoryNetwork>,
    endpoint: SocketAddr,
    rt: &Runtime,
) -> (Arc<RoutingTable>, Arc<MemoryTransport>) {
    let transport = network.endpoint(endpoint);
    let table = RoutingTable::new(
        transport.clone(),
        Arc::new(Storage::new(Duration::from_secs(60), 100)),
        Arc::new(test_config()),
        rt.handle().clone(),
        CancellationToken::new(),
    );
    (table, transport)
}

fn dht_on(
    network: &Arc<MemoryNetwork>,
    endpoint: SocketAddr,
    rt: &Runtime,
) -> (Arc<Dht>, Arc<MemoryTransport>) {
    let transport = network.endpoint(endpoint);
    let dht = Dht::new(
        vec![transport.clone() as Arc<dyn Transport>],
        test_config(),
        rt.handle().clone(),
    );
    (dht, transport)
}

/// The routing-table entry `dht` holds for `id`.
fn routing_node(dht: &Dht, id: &Id) -> Arc<Node> {
    let table = &dht.tables()[0];
    table.bucket_for(id).unwrap().find(id).unwrap()
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

// ============================================================================
// Identifiers
// ============================================================================

#[test]
fn test_id_generate() {
    let id1 = Id::generate();
    let id2 = Id::generate();
    assert_ne!(id1, id2);
    assert!(id1 < Id::end());
}

#[test]
fn test_id_from_wire_invalid() {
    assert!(Id::from_wire(&[1u8; 10]).is_err());
    assert!(Id::from_wire(&[1u8; 20]).is_ok());
}

#[test]
fn test_id_distance() {
    let a = Id::generate();
    let b = Id::generate();
    let c = Id::generate();

    assert!(a.distance(&a).is_zero());
    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(&a.distance(&b) ^ &b.distance(&c), a.distance(&c));

    let zero = Id::zero();
    let ones = Id::from([0xFF; 20]);
    assert_eq!(zero.distance(&ones), ones);
}

#[test]
fn test_id_arithmetic() {
    let half = Id::pow2(159);
    assert_eq!(&half + &half, Id::end());
    assert_eq!(&Id::end() >> 1, half);
    assert_eq!(Id::end().checked_sub(&half), Some(half.clone()));
    assert_eq!(Id::zero().checked_sub(&half), None);

    assert!(Id::from_u64(255) < Id::from_u64(256));
    assert!(Id::from_be_bytes(&[0, 0, 1]) == Id::from_u64(1));
    assert!(Id::end().to_wire().is_err());
    assert_eq!(half.to_wire().unwrap()[0], 0x80);
}

#[test]
fn test_id_random_in_range() {
    let min = Id::pow2(100);
    let max = &min + &Id::pow2(40);
    for _ in 0..200 {
        let id = Id::random_in_range(&min, &max).unwrap();
        assert!(min <= id && id < max);
    }
    assert!(Id::random_in_range(&min, &min).is_none());
    assert!(Id::random_in_range(&max, &min).is_none());
}

#[test]
fn test_id_display() {
    let id = Id::from_u64(0xabcd);
    let shown = id.to_string();
    assert_eq!(shown.len(), 40);
    assert!(shown.ends_with("abcd"));
}

// ============================================================================
// BEP-42
// ============================================================================

#[test]
fn test_secure_node_id_generation() {
    let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
    let id = generate_secure_node_id(ip);
    assert!(validate_node_id(&id, ip));

    let ip6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0, 0, 0, 0, 0, 0x8888));
    let id6 = generate_secure_node_id(ip6);
    assert!(validate_node_id(&id6, ip6));
}

#[test]
fn test_bep42_example_ip() {
    let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
    let id = Id::from_be_bytes(&hex("5fbfbff10c5d6a4ec8a88e4c6ab4c28b95eee401"));
    assert!(validate_node_id(&id, ip));

    let other = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
    assert!(!validate_node_id(&id, other));
}

#[test]
fn test_local_network_always_valid() {
    let local = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
    assert!(validate_node_id(&Id::generate(), local));
    assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    assert!(is_local_network(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    assert!(is_local_network(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
}

// ============================================================================
// Messages
// ============================================================================

#[test]
fn test_envelope_query_roundtrip() {
    let mut args = Dict::new();
    args.put(b"id", Bytes::from_static(&[7u8; 20]));
    args.put(b"target", Bytes::from_static(&[9u8; 20]));
    let query = Envelope::Query {
        tid: Bytes::from_static(b"aa"),
        method: "find_node".into(),
        args,
    };

    let data = query.encode().unwrap();
    match Envelope::parse(&data).unwrap() {
        Envelope::Query { tid, method, args } => {
            assert_eq!(tid.as_ref(), b"aa");
            assert_eq!(method, "find_node");
            assert_eq!(args.id_at(b"target").unwrap(), Id::from([9u8; 20]));
        }
        other => panic!("unexpected envelope {:?}", other),
    }
}

#[test]
fn test_envelope_error_parse() {
    let data = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
    match Envelope::parse(data).unwrap() {
        Envelope::Error { tid, error } => {
            assert_eq!(tid.as_ref(), b"aa");
            assert_eq!(error.code, KrpcError::GENERIC);
            assert_eq!(error.message, "A Generic Error Ocurred");
        }
        other => panic!("unexpected envelope {:?}", other),
    }
}

#[test]
fn test_envelope_accepts_unsorted_keys() {
    let data = b"d1:y1:q1:t2:aa1:q4:ping1:ad2:id20:abcdefghij0123456789ee";
    match Envelope::parse(data).unwrap() {
        Envelope::Query { tid, method, args } => {
            assert_eq!(tid.as_ref(), b"aa");
            assert_eq!(method, "ping");
            assert!(args.id_at(b"id").is_ok());
        }
        other => panic!("unexpected envelope {:?}", other),
    }
}

#[test]
fn test_envelope_missing_type() {
    assert!(Envelope::parse(b"d1:t2:aae").is_err());
    assert!(Envelope::parse(b"d1:t2:aa1:y1:xe").is_err());
}

#[test]
fn test_compact_nodes_skip_port_zero() {
    let contacts = vec![
        Contact::new(Id::from([1u8; 20]), addr(1)),
        Contact::new(Id::from([2u8; 20]), SocketAddr::from(([10, 0, 0, 2], 0))),
        Contact::new(
            Id::from([3u8; 20]),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881),
        ),
    ];

    let nodes = encode_nodes(&contacts, false);
    assert_eq!(nodes.len(), 2 * 26);
    assert_eq!(decode_nodes(&nodes, false), vec![contacts[0].clone()]);

    let nodes6 = encode_nodes(&contacts, true);
    assert_eq!(nodes6.len(), 38);
    assert_eq!(decode_nodes(&nodes6, true), vec![contacts[2].clone()]);
}

#[test]
fn test_want_defaults_to_socket_family() {
    let from = addr(1);
    assert_eq!(
        Want::from_args(&Dict::new(), &from),
        Want { v4: true, v6: false }
    );

    let mut args = Dict::new();
    args.put(b"want", Want { v4: true, v6: true }.to_value());
    assert_eq!(Want::from_args(&args, &from), Want { v4: true, v6: true });
}

// ============================================================================
// Items and tokens
// ============================================================================

#[test]
fn test_signable_bep44_example() {
    let with_salt = signable(b"foobar", 1, b"12:Hello World!");
    assert_eq!(with_salt, b"4:salt6:foobar3:seqi1e1:v12:Hello World!".to_vec());

    let without_salt = signable(b"", 1, b"12:Hello World!");
    assert_eq!(without_salt, b"3:seqi1e1:v12:Hello World!".to_vec());
}

#[test]
fn test_immutable_target_bep44_example() {
    let item = Item::immutable(&Value::string("Hello World!")).unwrap();
    assert_eq!(
        item.target(),
        Id::from_be_bytes(&hex("e5f96f6f38320f0f33959cb4d3d656452117aadb"))
    );
    assert!(item.verify().is_ok());
    assert!(!item.is_mutable());
}

#[test]
fn test_mutable_target_bep44_example() {
    let key: [u8; 32] = hex("77ff84905a91936367c01360803104f92432fcd904a43511876df5cdf3e7e548")
        .try_into()
        .unwrap();
    assert_eq!(
        mutable_target(&key, b""),
        Id::from_be_bytes(&hex("4a533d47ec9c7d95b1ad75f576cffc641853b750"))
    );
    assert_eq!(
        mutable_target(&key, b"foobar"),
        Id::from_be_bytes(&hex("411eba73b6f087ca51a3795d9c8c938d365e32c1"))
    );
}

#[test]
fn test_signed_item_verify() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let item = Item::signed(
        &signer,
        Bytes::from_static(b"salt"),
        3,
        Bytes::from_static(b"5:hello"),
    )
    .unwrap();
    assert!(item.verify().is_ok());
    assert!(item.verify_for(&item.target()).is_ok());
    assert_eq!(
        item.verify_for(&Id::generate()),
        Err(DataError::HashMismatch)
    );

    let forged = Item::from_parts(
        *item.key().unwrap(),
        item.salt().clone(),
        Some(4),
        *item.sig().unwrap(),
        item.value().clone(),
    );
    assert_eq!(forged.verify(), Err(DataError::InvalidSignature));
}

#[test]
fn test_item_size_limits() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let salt = Bytes::from(vec![b's'; 65]);
    assert_eq!(
        Item::signed(&signer, salt, 1, Bytes::from_static(b"i1e")),
        Err(DataError::SaltTooLarge)
    );

    let big = Value::Bytes(Bytes::from(vec![0u8; 1000]));
    assert_eq!(Item::immutable(&big), Err(DataError::ValueTooLarge));
}

#[test]
fn test_token_validation() {
    let tokens = TokenIssuer::new(Duration::from_secs(300));
    let hash = Id::generate();
    let token = tokens.issue(&addr(1), &hash);

    assert!(tokens.validate(&addr(1), &hash, &token));
    assert!(!tokens.validate(&addr(2), &hash, &token));
    assert!(!tokens.validate(&addr(1), &Id::generate(), &token));
    assert!(!tokens.validate(&addr(1), &hash, b"bogus"));
}

#[test]
fn test_token_rotation() {
    let tokens = TokenIssuer::new(Duration::from_secs(300));
    let hash = Id::generate();
    let token = tokens.issue(&addr(1), &hash);

    tokens.rotate();
    assert!(tokens.validate(&addr(1), &hash, &token));
    tokens.rotate();
    assert!(!tokens.validate(&addr(1), &hash, &token));
}

// ============================================================================
// Storage
// ============================================================================

fn mutable_data(signer: &SigningKey, salt: &'static [u8]) -> DhtData {
    let key = signer.verifying_key().to_bytes();
    let data = DhtData::new(mutable_target(&key, salt));
    data.set_salt(Bytes::from_static(salt));
    data
}

fn signed(signer: &SigningKey, salt: &'static [u8], seq: i64, value: &'static [u8]) -> Item {
    Item::signed(
        signer,
        Bytes::from_static(salt),
        seq,
        Bytes::from_static(value),
    )
    .unwrap()
}

#[test]
fn test_data_sequence_and_cas() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let data = mutable_data(&signer, b"n");

    assert_eq!(data.apply(signed(&signer, b"n", 1, b"i1e")), Ok(true));
    assert!(matches!(
        data.apply(signed(&signer, b"n", 1, b"i9e")),
        Err(DataError::StaleSequence { .. })
    ));
    assert_eq!(
        data.apply_with_cas(signed(&signer, b"n", 3, b"i3e"), Some(2)),
        Err(DataError::CasMismatch {
            expected: 2,
            current: Some(1)
        })
    );
    assert_eq!(data.seq(), Some(1));

    assert_eq!(
        data.apply_with_cas(signed(&signer, b"n", 3, b"i3e"), Some(1)),
        Ok(true)
    );
    assert_eq!(data.seq(), Some(3));
}

#[test]
fn test_data_rejects_foreign_item() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let other = SigningKey::from_bytes(&[8u8; 32]);
    let data = mutable_data(&signer, b"n");

    assert_eq!(
        data.apply(signed(&other, b"n", 1, b"i1e")),
        Err(DataError::HashMismatch)
    );
    assert!(!data.has_value());
}

#[test]
fn test_data_observer_runs_once_per_sequence() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let data = mutable_data(&signer, b"n");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    data.observe(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    data.apply(signed(&signer, b"n", 1, b"i1e")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _ = data.apply(signed(&signer, b"n", 1, b"i1e"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    data.apply(signed(&signer, b"n", 2, b"i2e")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_observe_current_sees_existing_value() {
    let data = DhtData::new(Item::immutable(&Value::Integer(5)).unwrap().target());
    data.apply(Item::immutable(&Value::Integer(5)).unwrap())
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    data.observe_current(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(data.apply(Item::immutable(&Value::Integer(5)).unwrap()), Ok(false));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_observer_may_reenter_record() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let data = Arc::new(mutable_data(&signer, b"n"));
    let seen = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));

    let weak = Arc::downgrade(&data);
    let (seen_in, late_in) = (seen.clone(), late.clone());
    data.observe(Arc::new(move |item: &Item| {
        let Some(data) = weak.upgrade() else {
            return;
        };
        assert_eq!(data.current().as_ref(), Some(item));
        seen_in.fetch_add(1, Ordering::SeqCst);
        let late_in = late_in.clone();
        data.observe_current(Arc::new(move |_| {
            late_in.fetch_add(1, Ordering::SeqCst);
        }));
    }));

    data.apply(signed(&signer, b"n", 1, b"i1e")).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 1);

    // The observer registered during the first round runs on the next one.
    data.apply(signed(&signer, b"n", 2, b"i2e")).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(late.load(Ordering::SeqCst), 3);
}

#[test]
fn test_publish_merges_concurrent_value() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let data = mutable_data(&signer, b"counter");
    data.set_signer(signer.clone());
    data.set_merge(Arc::new(|old: &Bytes, new: &Bytes| {
        let sum = decode(old).ok().and_then(|v| v.as_integer()).unwrap_or(0)
            + decode(new).ok().and_then(|v| v.as_integer()).unwrap_or(0);
        Bytes::from(encode(&Value::Integer(sum)).unwrap_or_default())
    }));

    let first = data.publish(Bytes::from_static(b"i2e")).unwrap();
    assert_eq!(first.seq(), Some(1));

    // Another writer with the same key stored 3 at seq 2.
    assert_eq!(data.apply(signed(&signer, b"counter", 2, b"i3e")), Ok(true));
    let merged = data.current().unwrap();
    assert_eq!(merged.seq(), Some(3));
    assert_eq!(merged.value().as_ref(), b"i5e");
    assert!(merged.verify_for(data.hash()).is_ok());

    let next = data.publish(Bytes::from_static(b"i1e")).unwrap();
    assert_eq!(next.seq(), Some(4));
    assert_eq!(next.value().as_ref(), b"i6e");
}

#[test]
fn test_publish_requires_signer() {
    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let data = mutable_data(&signer, b"n");
    assert_eq!(
        data.publish(Bytes::from_static(b"i1e")).unwrap_err(),
        DataError::NotSigner
    );
}

#[test]
fn test_peer_set_capacity_and_family() {
    let storage = Storage::new(Duration::from_secs(60), 2);
    let hash = Id::generate();
    assert!(storage.announce(&hash, addr(1)));
    assert!(!storage.announce(&hash, addr(1)));
    assert!(storage.announce(&hash, addr(2)));
    assert!(!storage.announce(&hash, addr(3)));

    assert_eq!(storage.peers_for(&hash, false, 10).len(), 2);
    assert!(storage.peers_for(&hash, true, 10).is_empty());
    assert!(storage.peers_for(&Id::generate(), false, 10).is_empty());
}

#[test]
fn test_peer_set_expiry() {
    let storage = Storage::new(Duration::from_millis(30), 10);
    let hash = Id::generate();
    storage.announce(&hash, addr(1));
    std::thread::sleep(Duration::from_millis(60));
    assert!(storage.peer_set(&hash).is_empty());
}

// ============================================================================
// Queues
// ============================================================================

#[test]
fn test_distinct_queue_dedupes() {
    let queue: DistinctQueue<u32, &str> = DistinctQueue::new(2);
    assert!(queue.push(1, "a"));
    assert!(!queue.push(1, "b"));
    assert!(queue.push(2, "c"));
    assert!(!queue.push(3, "d"));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.try_pop(), Some("a"));
    assert!(!queue.contains(&1));
    assert!(queue.push(1, "e"));
}

#[test]
fn test_distinct_queue_reports_overflow() {
    let queue: DistinctQueue<u32, u32> = DistinctQueue::new(1);
    assert!(queue.push(1, 1));
    assert!(!queue.push(1, 1));
    assert!(!queue.take_overflow());

    assert!(!queue.push(2, 2));
    assert!(queue.take_overflow());
    assert!(!queue.take_overflow());
}

#[test]
fn test_distinct_queue_pop_cancelled() {
    let queue: Arc<DistinctQueue<u32, u32>> = Arc::new(DistinctQueue::new(4));
    let cancel = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || queue.pop(&cancel))
    };
    std::thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    queue.wake_all();
    assert_eq!(waiter.join().unwrap(), None);
}

#[test]
fn test_distinct_queue_pop_waits_for_push() {
    let queue: Arc<DistinctQueue<u32, u32>> = Arc::new(DistinctQueue::new(4));
    let cancel = CancellationToken::new();

    let waiter = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || queue.pop(&cancel))
    };
    std::thread::sleep(Duration::from_millis(20));
    queue.push(7, 70);
    assert_eq!(waiter.join().unwrap(), Some(70));
}

#[test]
fn test_reject_cache_expires() {
    let cache = RejectCache::new(16, Duration::from_millis(40));
    let hash = Id::generate();
    cache.insert(addr(1), hash.clone());
    assert!(cache.contains(&addr(1), &hash));
    assert!(!cache.contains(&addr(2), &hash));

    std::thread::sleep(Duration::from_millis(80));
    assert!(!cache.contains(&addr(1), &hash));
    assert!(cache.is_empty());
}

// ============================================================================
// Nodes, buckets and interests
// ============================================================================

#[test]
fn test_node_liveness() {
    let node = Node::new(Some(Id::generate()), addr(1));
    let window = Duration::from_secs(60);
    assert_eq!(node.liveness(window), Liveness::Bad);

    node.record_query();
    assert_eq!(node.liveness(window), Liveness::Bad);

    node.record_response();
    assert_eq!(node.liveness(window), Liveness::Good);
    assert_eq!(node.liveness(Duration::ZERO), Liveness::Questionable);

    node.record_failure();
    assert_eq!(node.liveness(window), Liveness::Questionable);
    node.record_failure();
    assert_eq!(node.liveness(window), Liveness::Bad);

    node.record_response();
    assert_eq!(node.failures(), 0);
    assert_eq!(node.liveness(window), Liveness::Good);
}

#[test]
fn test_node_learns_id_once() {
    let node = Node::new(None, addr(1));
    let id = Id::generate();
    assert!(node.contact().is_none());
    assert!(node.learn_id(id.clone()));
    assert!(node.learn_id(id.clone()));
    assert!(!node.learn_id(Id::generate()));
    assert_eq!(node.contact(), Some(Contact::new(id, addr(1))));
}

#[test]
fn test_bucket_split_precondition() {
    let narrow = Bucket::new(Id::zero(), Id::from_u64(K as u64));
    assert!(matches!(
        narrow.split(&Id::zero()),
        Err(DhtError::BucketTooSmall)
    ));

    let bucket = Bucket::new(Id::zero(), Id::pow2(159));
    assert!(matches!(
        bucket.split(&Id::pow2(159)),
        Err(DhtError::SplitOffPath)
    ));
    assert_eq!(bucket.range(), (Id::zero(), Id::pow2(159)));

    let upper = bucket.split(&Id::zero()).unwrap();
    assert_eq!(bucket.range(), (Id::zero(), Id::pow2(158)));
    assert_eq!(upper.range(), (Id::pow2(158), Id::pow2(159)));
}

#[test]
fn test_candidate_queue_order() {
    let queue = CandidateQueue::new(Id::zero(), 3);
    let far = Arc::new(Node::new(Some(id_with_prefix(0x40, 0)), addr(1)));
    let near = Arc::new(Node::new(Some(id_with_prefix(0x10, 0)), addr(2)));
    let unknown = Arc::new(Node::new(None, addr(3)));
    let middle = Arc::new(Node::new(Some(id_with_prefix(0x20, 0)), addr(4)));

    assert!(queue.offer(&far));
    assert!(queue.offer(&near));
    assert!(queue.offer(&unknown));
    assert!(!queue.offer(&near));
    assert!(queue.offer(&middle));

    let order: Vec<SocketAddr> = queue.nodes().iter().map(|n| n.endpoint()).collect();
    assert_eq!(order, vec![addr(3), addr(2), addr(4)]);
    assert!(!queue.contains(&far));

    let same_endpoint = Arc::new(Node::new(Some(id_with_prefix(0x01, 0)), addr(2)));
    assert!(!queue.offer(&same_endpoint));
}

#[test]
fn test_interest_flags() {
    let flags = InterestFlags::announce().union(InterestFlags::publish());
    assert!(flags.peers && flags.announce && flags.data && flags.publish);
    assert!(flags.persistent);
    assert!(!InterestFlags::lookup().persistent);

    let interest = Interest::new(Id::generate(), InterestFlags::lookup(), 4);
    assert!(interest.upgrade(InterestFlags::publish()));
    assert!(interest.flags().data);
    assert!(!interest.upgrade(InterestFlags::data()));
}

#[test]
fn test_config_refresh_backoff() {
    let config = DhtConfig::default();
    let first = config.value_refresh_min;
    assert_eq!(config.next_refresh_delay(first), first * 2);
    assert_eq!(
        config.next_refresh_delay(config.value_refresh_max),
        config.value_refresh_max
    );
    assert!(DhtConfig::local().bootstrap_nodes.is_empty());
    assert!(!DhtConfig::default().bootstrap_nodes.is_empty());
}

// ============================================================================
// Routing table
// ============================================================================

#[test]
fn test_routing_table_splits_on_ninth_node() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, transport) = table_on(&network, addr(0), &rt);

    let prefixes = [0x00, 0x10, 0x20, 0x30, 0x80, 0x90, 0xa0, 0xb0];
    for (i, prefix) in prefixes.iter().enumerate() {
        assert!(table.consider_node(
            Some(id_with_prefix(*prefix, 1)),
            addr(i + 1),
            Reason::Responded
        ));
    }
    assert_eq!(table.buckets().len(), 1);

    table.consider_node(Some(id_with_prefix(0xff, 1)), addr(9), Reason::Responded);
    let buckets = table.buckets();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[1].range(), (Id::pow2(159), Id::end()));

    let upper = table.bucket_for(&id_with_prefix(0x80, 1)).unwrap();
    assert!(Arc::ptr_eq(&upper, &buckets[1]));
    assert!(upper.find(&id_with_prefix(0x80, 1)).is_some());
    assert!(upper.find(&id_with_prefix(0xff, 1)).is_some());
    assert!(buckets[0].find(&id_with_prefix(0x00, 1)).is_some());

    table.check_coverage().unwrap();
    assert!(transport.calls().is_empty());
}

#[test]
fn test_routing_table_coverage_invariant() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    for i in 1..=400 {
        table.consider_node(Some(Id::generate()), addr(i), Reason::Rumor);
    }

    table.check_coverage().unwrap();
    let buckets = table.buckets();
    assert!(buckets.len() > 1);
    for bucket in &buckets {
        assert!(bucket.len() <= K);
        for node in bucket.nodes() {
            assert!(bucket.in_range(&node.id().unwrap()));
        }
    }
    assert!(table.bucket_for(&table.local_id()).is_ok());
}

#[test]
fn test_public_endpoint_regenerates_local_id() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, transport) = table_on(&network, addr(0), &rt);
    let old_id = table.local_id();

    let known: Vec<Id> = (1..=5).map(|_| Id::generate()).collect();
    for (i, id) in known.iter().enumerate() {
        assert!(table.consider_node(Some(id.clone()), addr(i + 1), Reason::Rumor));
    }

    let public: SocketAddr = "124.31.75.21:6881".parse().unwrap();
    transport.set_public_endpoint(public);

    let new_id = table.local_id();
    assert_ne!(new_id, old_id);
    assert!(validate_node_id(&new_id, public.ip()));
    table.check_coverage().unwrap();
    assert!(table.interest(&new_id).is_some());
    assert!(table.interest(&old_id).is_none());
    for id in &known {
        assert!(table.bucket_for(id).unwrap().find(id).is_some());
    }
}

#[test]
fn test_remove_id_clears_every_entry() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);
    let id = Id::generate();
    let other = Id::generate();

    table.consider_node(Some(id.clone()), addr(1), Reason::Rumor);
    table.consider_node(Some(other.clone()), addr(2), Reason::Rumor);
    for known in [&id, &other] {
        table.bucket_for(known).unwrap().find(known).unwrap().record_response();
    }
    let interest = table.add_interest(id.clone(), InterestFlags::lookup());
    assert!(interest.queue.len() + interest.bucket.len() > 0);

    assert!(table.remove_id(&id) >= 1);
    assert!(table.bucket_for(&id).unwrap().find(&id).is_none());
    assert!(interest
        .queue
        .nodes()
        .iter()
        .chain(interest.bucket.nodes().iter())
        .all(|n| n.id() != Some(id.clone())));
    assert!(table.bucket_for(&other).unwrap().find(&other).is_some());
    assert_eq!(table.remove_id(&id), 0);
}

#[test]
fn test_split_off_path_leaves_table_unchanged() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    table.split_bucket_at(0).unwrap();
    let buckets = table.buckets();
    assert_eq!(buckets.len(), 2);

    let off_path = if buckets[0].in_range(&table.local_id()) {
        1
    } else {
        0
    };
    assert!(matches!(
        table.split_bucket_at(off_path),
        Err(DhtError::SplitOffPath)
    ));
    assert_eq!(table.buckets().len(), 2);
    table.check_coverage().unwrap();
}

#[test]
fn test_rumor_does_not_replace_bad_node() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, transport) = table_on(&network, addr(0), &rt);

    table.split_bucket_at(0).unwrap();
    let bucket = table
        .buckets()
        .into_iter()
        .find(|b| !b.in_range(&table.local_id()))
        .unwrap();
    let (min, max) = bucket.range();

    for i in 1..=K {
        let id = Id::random_in_range(&min, &max).unwrap();
        table.consider_node(Some(id), addr(i), Reason::Rumor);
    }
    assert!(bucket.is_full());
    assert!(bucket.nodes().iter().all(|n| n.is_bad()));

    let rumored = Id::random_in_range(&min, &max).unwrap();
    table.consider_node(Some(rumored.clone()), addr(20), Reason::Rumor);
    assert!(bucket.find(&rumored).is_none());

    let responded = Id::random_in_range(&min, &max).unwrap();
    table.consider_node(Some(responded.clone()), addr(21), Reason::Responded);
    assert!(bucket.find(&responded).is_some());
    assert_eq!(bucket.len(), K);

    assert_eq!(table.buckets().len(), 2);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_questionable_node_evicted_after_two_pings() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, transport) = table_on(&network, addr(0), &rt);

    let mut ids = Vec::new();
    for i in 1..=K {
        let id = Id::generate();
        table.consider_node(Some(id.clone()), addr(i), Reason::Responded);
        ids.push(id);
    }
    let bucket = table.buckets()[0].clone();
    assert!(bucket.is_full());
    for id in &ids {
        bucket.find(id).unwrap().record_failure();
    }

    let replacement = Id::generate();
    assert!(table.consider_node(Some(replacement.clone()), addr(50), Reason::Responded));

    assert_eq!(transport.calls_to("ping", addr(1)), 2);
    assert_eq!(transport.calls().len(), 2);
    assert!(bucket.find(&ids[0]).is_none());
    assert_eq!(bucket.nodes()[0].id(), Some(replacement));
    assert_eq!(table.buckets().len(), 1);
}

#[test]
fn test_eviction_spares_responsive_node() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, transport) = table_on(&network, addr(0), &rt);

    let mut ids = Vec::new();
    for i in 1..=K {
        let id = Id::generate();
        table.consider_node(Some(id.clone()), addr(i), Reason::Responded);
        ids.push(id);
    }
    let bucket = table.buckets()[0].clone();
    for id in &ids {
        bucket.find(id).unwrap().record_failure();
    }

    // The oldest node is still online and answers pings.
    let responder = network.endpoint(addr(1));
    let responder_id = Bytes::copy_from_slice(&ids[0].to_wire().unwrap());
    responder.register(
        "ping",
        Arc::new(move |_from: SocketAddr, _args: Dict| -> Result<Dict, KrpcError> {
            let mut ret = Dict::new();
            ret.put(b"id", responder_id.clone());
            Ok(ret)
        }),
    );

    let replacement = Id::generate();
    table.consider_node(Some(replacement.clone()), addr(50), Reason::Responded);

    assert_eq!(transport.calls_to("ping", addr(1)), 1);
    assert_eq!(transport.calls_to("ping", addr(2)), 2);
    assert!(bucket.find(&ids[0]).is_some());
    assert!(bucket.find(&ids[1]).is_none());
    assert!(bucket.find(&replacement).is_some());
}

#[test]
fn test_closest_skips_bad_nodes() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    let good = id_with_prefix(0x10, 1);
    let bad = id_with_prefix(0x10, 2);
    table.consider_node(Some(good.clone()), addr(1), Reason::Responded);
    table.consider_node(Some(bad.clone()), addr(2), Reason::Rumor);

    let closest: Vec<Option<Id>> = table
        .closest(&id_with_prefix(0x10, 0), K)
        .iter()
        .map(|n| n.id())
        .collect();
    assert_eq!(closest, vec![Some(good)]);
    assert!(!table.is_booted());
}

#[test]
fn test_local_interest_is_permanent() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    assert!(!table.remove_interest(&table.local_id()));
    let hash = Id::generate();
    table.add_interest(hash.clone(), InterestFlags::peers());
    assert_eq!(table.interests().len(), 2);
    assert!(table.remove_interest(&hash));
    assert!(table.interest(&hash).is_none());
    assert!(table.interest(&table.local_id()).is_some());
}

#[test]
fn test_add_interest_seeds_from_routing_table() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    for i in 1..=4 {
        table.consider_node(Some(Id::generate()), addr(i), Reason::Responded);
    }
    let interest = table.add_interest(Id::generate(), InterestFlags::lookup());
    assert_eq!(interest.bucket.len(), 4);

    let upgraded = table.add_interest(interest.hash().clone(), InterestFlags::announce());
    assert!(Arc::ptr_eq(&interest, &upgraded));
    assert!(upgraded.flags().announce);
}

#[test]
fn test_stats_count_liveness() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (table, _transport) = table_on(&network, addr(0), &rt);

    table.consider_node(Some(Id::generate()), addr(1), Reason::Responded);
    table.consider_node(Some(Id::generate()), addr(2), Reason::Rumor);
    let stats = table.stats();
    assert_eq!(stats.buckets, 1);
    assert_eq!(stats.good, 1);
    assert_eq!(stats.bad, 1);
    assert_eq!(stats.nodes(), 2);
    assert_eq!(stats.interests, 1);
}

// ============================================================================
// Queries between nodes
// ============================================================================

#[test]
fn test_ping_learns_responder_id() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, _) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    a.ping_endpoint(addr(2)).unwrap();
    let b_id = b.tables()[0].local_id();
    let node = routing_node(&a, &b_id);
    assert_eq!(node.endpoint(), addr(2));
    assert!(node.has_responded());

    // The querier is considered off the handler thread.
    let a_id = a.tables()[0].local_id();
    assert!(wait_until(Duration::from_secs(2), || b.tables()[0]
        .bucket_for(&a_id)
        .is_ok_and(|bucket| bucket.find(&a_id).is_some())));
}

#[test]
fn test_ping_unknown_endpoint_times_out() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, _) = dht_on(&network, addr(1), &rt);

    assert!(matches!(a.ping_endpoint(addr(9)), Err(DhtError::Timeout)));
    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881);
    assert!(matches!(
        a.ping_endpoint(v6),
        Err(DhtError::Unreachable(_))
    ));
}

#[test]
fn test_unknown_method_is_rejected() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (_a, ta) = dht_on(&network, addr(1), &rt);
    let (_b, _) = dht_on(&network, addr(2), &rt);

    let mut args = Dict::new();
    args.put(b"id", Bytes::from_static(&[1u8; 20]));
    let err = ta
        .call(
            "vote",
            args,
            addr(2),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DhtError::Remote { code: 204, .. }));
}

#[test]
fn test_get_peers_then_announce() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, _) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);
    let (c, _) = dht_on(&network, addr(3), &rt);

    a.ping_endpoint(addr(2)).unwrap();
    let b_id = b.tables()[0].local_id();
    let node = routing_node(&a, &b_id);
    let table = &a.tables()[0];
    let hash = Id::generate();

    let reply = node.get_peers(table, &hash).unwrap();
    assert!(reply.has_token);
    assert!(reply.peers.is_empty());
    assert!(node.token(&hash).is_some());

    node.announce_peer(table, &hash).unwrap();
    assert_eq!(b.storage().peers_for(&hash, false, 10), vec![addr(1)]);

    c.ping_endpoint(addr(2)).unwrap();
    let from_c = routing_node(&c, &b_id);
    let reply = from_c.get_peers(&c.tables()[0], &hash).unwrap();
    assert_eq!(reply.peers, vec![addr(1)]);
}

#[test]
fn test_announce_without_token_fails() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, ta) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    a.ping_endpoint(addr(2)).unwrap();
    let node = routing_node(&a, &b.tables()[0].local_id());
    let hash = Id::generate();
    assert!(matches!(
        node.announce_peer(&a.tables()[0], &hash),
        Err(DhtError::NoToken)
    ));

    let mut args = Dict::new();
    args.put(b"id", Bytes::from_static(&[1u8; 20]));
    args.put(b"info_hash", Bytes::copy_from_slice(&hash.to_wire().unwrap()));
    args.put(b"port", 7000i64);
    args.put(b"token", Bytes::from_static(b"bogus"));
    let err = ta
        .call(
            "announce_peer",
            args,
            addr(2),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DhtError::Remote { code: 203, .. }));
    assert!(b.storage().peers_for(&hash, false, 10).is_empty());
}

#[test]
fn test_put_without_token_sends_nothing() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, ta) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    a.ping_endpoint(addr(2)).unwrap();
    let node = routing_node(&a, &b.tables()[0].local_id());
    let item = Item::immutable(&Value::string("hello")).unwrap();
    let data = a.storage().data_entry(&item.target());
    data.apply(item).unwrap();

    assert!(matches!(
        node.put(&a.tables()[0], &data, None),
        Err(DhtError::NoToken)
    ));
    assert_eq!(ta.calls_to("put", addr(2)), 0);
    assert!(b.storage().data(data.hash()).is_none());
}

#[test]
fn test_find_node_accepts_info_hash() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (_a, ta) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    let mut args = Dict::new();
    args.put(b"id", Bytes::from_static(&[1u8; 20]));
    args.put(b"info_hash", Bytes::from_static(&[9u8; 20]));
    let ret = ta
        .call(
            "find_node",
            args,
            addr(2),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap();
    assert_eq!(ret.id_at(b"id").unwrap(), b.tables()[0].local_id());
    assert!(ret.bytes_at(b"nodes").is_some());
}

#[test]
fn test_mutable_put_cas_and_sync() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, _) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    a.ping_endpoint(addr(2)).unwrap();
    let node = routing_node(&a, &b.tables()[0].local_id());
    let table = &a.tables()[0];

    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let salt = Bytes::from_static(b"profile");
    let target = mutable_target(&signer.verifying_key().to_bytes(), &salt);
    let data = a.storage().data_entry(&target);
    data.set_salt(salt);
    data.set_signer(signer);
    data.publish(Bytes::from_static(b"5:hello")).unwrap();

    let reply = node.get(table, &data).unwrap();
    assert!(reply.has_token);
    assert!(!reply.has_value);
    node.put(table, &data, None).unwrap();

    let stored = b.storage().data(&target).and_then(|d| d.current()).unwrap();
    assert_eq!(stored.seq(), Some(1));
    assert_eq!(stored.value().as_ref(), b"5:hello");

    data.publish(Bytes::from_static(b"5:world")).unwrap();
    let err = node.put(table, &data, Some(5)).unwrap_err();
    assert!(err.is_write_conflict());
    assert!(matches!(err, DhtError::Remote { code: 301, .. }));
    assert_eq!(node.failures(), 0);

    node.sync(table, &data).unwrap();
    let stored = b.storage().data(&target).and_then(|d| d.current()).unwrap();
    assert_eq!(stored.seq(), Some(2));
    assert_eq!(stored.value().as_ref(), b"5:world");
}

#[test]
fn test_get_fetches_mutable_item() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (b, _) = dht_on(&network, addr(2), &rt);
    let (c, _) = dht_on(&network, addr(3), &rt);

    let signer = SigningKey::from_bytes(&[9u8; 32]);
    let salt = Bytes::from_static(b"feed");
    let target = mutable_target(&signer.verifying_key().to_bytes(), &salt);
    let item = Item::signed(&signer, salt.clone(), 4, Bytes::from_static(b"4:post")).unwrap();
    b.storage().update_data(&target, None, item.clone()).unwrap();

    c.ping_endpoint(addr(2)).unwrap();
    let node = routing_node(&c, &b.tables()[0].local_id());
    let table = &c.tables()[0];

    let data = c.storage().data_entry(&target);
    data.set_salt(salt);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    data.observe(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let reply = node.get(table, &data).unwrap();
    assert!(reply.has_value && reply.updated);
    assert_eq!(reply.seq, Some(4));
    assert_eq!(data.current(), Some(item));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Known sequence numbers are not sent back again.
    let reply = node.get(table, &data).unwrap();
    assert!(!reply.has_value);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_put_rejects_bad_signature() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (a, ta) = dht_on(&network, addr(1), &rt);
    let (b, _) = dht_on(&network, addr(2), &rt);

    let signer = SigningKey::from_bytes(&[7u8; 32]);
    let item = Item::signed(&signer, Bytes::new(), 1, Bytes::from_static(b"i1e")).unwrap();
    let target = item.target();
    let token = b.tokens().issue(&addr(1), &target);

    let mut args = Dict::new();
    args.put(b"id", Bytes::copy_from_slice(&a.tables()[0].local_id().to_wire().unwrap()));
    args.put(b"token", token);
    args.put(b"v", Value::Integer(2));
    args.put(b"k", Bytes::copy_from_slice(item.key().unwrap()));
    args.put(b"sig", Bytes::copy_from_slice(item.sig().unwrap()));
    args.put(b"seq", 1i64);

    let err = ta
        .call(
            "put",
            args,
            addr(2),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DhtError::Remote { code: 206, .. }));
    assert!(b.storage().data(&target).map_or(true, |d| !d.has_value()));
}

#[test]
fn test_put_immutable_then_get_value() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (dht, _) = dht_on(&network, addr(1), &rt);

    let published = dht.put_immutable(&Value::string("Hello World!")).unwrap();
    let hash = published.hash().clone();
    assert_eq!(
        hash,
        Id::from_be_bytes(&hex("e5f96f6f38320f0f33959cb4d3d656452117aadb"))
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let lookup = dht.get_value(hash.clone(), move |item| {
        assert_eq!(item.value().as_ref(), b"12:Hello World!");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(lookup.is_cancelled());
    assert!(!published.is_cancelled());

    drop(published);
    dht.shutdown();
}

#[test]
fn test_finished_lookup_keeps_publication_interest() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (dht, _) = dht_on(&network, addr(1), &rt);

    let published = dht.put_immutable(&Value::string("shared")).unwrap();
    let hash = published.hash().clone();
    let lookup = dht.get_value(hash.clone(), |_| {});
    assert!(lookup.is_cancelled());
    drop(lookup);

    let table = dht.tables()[0].clone();
    assert!(wait_until(Duration::from_secs(2), || table.interest(&hash).is_some()));
    std::thread::sleep(Duration::from_millis(300));
    assert!(table.interest(&hash).is_some());

    drop(published);
    assert!(wait_until(Duration::from_secs(2), || table.interest(&hash).is_none()));
    dht.shutdown();
}

#[test]
fn test_put_mutable_publishes_locally() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let (dht, _) = dht_on(&network, addr(1), &rt);

    let signer = SigningKey::from_bytes(&[3u8; 32]);
    let key = signer.verifying_key().to_bytes();
    let handle = dht
        .put_mutable(signer, Bytes::from_static(b"s"), &Value::Integer(1), None)
        .unwrap();
    assert_eq!(*handle.hash(), mutable_target(&key, b"s"));
    assert_eq!(handle.current().and_then(|item| item.seq()), Some(1));

    let next = handle.publish(&Value::Integer(2)).unwrap();
    assert_eq!(next.seq(), Some(2));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let follower = dht.get_mutable(key, Bytes::from_static(b"s"), move |item| {
        assert_eq!(item.seq(), Some(2));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(!follower.is_cancelled());

    follower.cancel();
    dht.shutdown();
}

// ============================================================================
// Networks
// ============================================================================

#[test]
fn test_network_boots_from_single_hub() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let nodes: Vec<Arc<Dht>> = (0..20).map(|i| dht_on(&network, addr(i), &rt).0).collect();
    for dht in &nodes {
        dht.start().unwrap();
    }

    for dht in &nodes[1..] {
        dht.ping_endpoint(addr(0)).unwrap();
    }

    // Nodes that joined early only learned about the others later, so
    // lookups towards random targets spread the contacts around.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut booted = false;
    while Instant::now() < deadline {
        let pending: Vec<&Arc<Dht>> = nodes.iter().filter(|dht| !dht.is_booted()).collect();
        if pending.is_empty() {
            booted = true;
            break;
        }
        for dht in pending {
            dht.add_interest(&Id::generate(), InterestFlags::lookup());
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    for dht in &nodes {
        dht.tables()[0].check_coverage().unwrap();
    }
    for dht in &nodes {
        dht.shutdown();
    }
    assert!(booted);
}

#[test]
fn test_announce_reaches_closest_nodes() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let nodes: Vec<Arc<Dht>> = (0..12).map(|i| dht_on(&network, addr(i), &rt).0).collect();
    for dht in &nodes {
        dht.start().unwrap();
    }
    for dht in &nodes[1..] {
        dht.ping_endpoint(addr(0)).unwrap();
    }

    let hash = Id::generate();
    nodes[1].announce(hash.clone());
    let stored = wait_until(Duration::from_secs(20), || {
        nodes[3..]
            .iter()
            .chain(&nodes[..1])
            .any(|dht| dht.storage().peers_for(&hash, false, 10).contains(&addr(1)))
    });

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut found = false;
    while Instant::now() < deadline {
        // Each call re-queries the nodes already collected for the hash.
        if nodes[2].get_peers(hash.clone()).snapshot().contains(&addr(1)) {
            found = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    nodes[1].stop_peers(&hash);
    nodes[2].stop_peers(&hash);
    for dht in &nodes {
        dht.shutdown();
    }
    assert!(stored);
    assert!(found);
}

#[test]
fn test_shutdown_interrupts_bootstrap_retry() {
    let rt = runtime();
    let network = MemoryNetwork::new();
    let transport = network.endpoint(addr(1));
    let config = DhtConfig {
        bootstrap_nodes: vec![addr(9).to_string()],
        bootstrap_retry_delay: Duration::from_secs(30),
        ..test_config()
    };
    let dht = Dht::new(vec![transport.clone() as Arc<dyn Transport>], config, rt.handle().clone());
    dht.start().unwrap();

    assert!(wait_until(Duration::from_secs(2), || transport
        .calls_to("ping", addr(9))
        > 0));
    // Past the boot wait, into the retry delay
    std::thread::sleep(Duration::from_secs(1));

    let started = Instant::now();
    dht.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.calls_to("ping", addr(9)), 1);
}

#[test]
fn test_udp_ping_roundtrip() {
    let rt = runtime();
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let a = Dht::bind(&[local], test_config(), rt.handle().clone()).unwrap();
    let b = Dht::bind(&[local], test_config(), rt.handle().clone()).unwrap();

    let b_endpoint = b.tables()[0].transport().local_endpoint();
    assert_ne!(b_endpoint.port(), 0);
    a.ping_endpoint(b_endpoint).unwrap();
    assert!(a.tables()[0]
        .closest(&b.tables()[0].local_id(), 1)
        .iter()
        .any(|n| n.endpoint() == b_endpoint));

    a.shutdown();
    b.shutdown();
}

fn reply_reporting(tid: Bytes, reported: SocketAddr) -> Vec<u8> {
    let mut ret = Dict::new();
    ret.put(b"id", Bytes::from_static(&[5u8; 20]));
    Envelope::Response {
        tid,
        ret,
        ip: Some(reported),
    }
    .encode()
    .unwrap()
}

#[test]
fn test_public_endpoint_ignores_unsolicited_replies() {
    let rt = runtime();
    let socket = KrpcSocket::bind("127.0.0.1:0".parse().unwrap(), rt.handle().clone()).unwrap();
    let reported: SocketAddr = "8.8.8.8:1234".parse().unwrap();

    for host in 1..=3u8 {
        let from = SocketAddr::from(([10, 0, 0, host], 6881));
        socket.dispatch(&reply_reporting(Bytes::from_static(b"zz"), reported), from);
    }
    assert_eq!(socket.public_endpoint(), None);
    socket.close();
}

#[test]
fn test_public_endpoint_needs_distinct_reporters() {
    let rt = runtime();
    let socket = KrpcSocket::bind("127.0.0.1:0".parse().unwrap(), rt.handle().clone()).unwrap();
    let reported: SocketAddr = "8.8.8.8:1234".parse().unwrap();

    // One host answering repeatedly counts once
    let same = SocketAddr::from(([10, 0, 0, 1], 6881));
    for _ in 0..3 {
        let (tid, _rx) = socket.begin().unwrap();
        socket.dispatch(&reply_reporting(tid, reported), same);
    }
    assert_eq!(socket.public_endpoint(), None);

    for host in 2..=3u8 {
        let (tid, _rx) = socket.begin().unwrap();
        let from = SocketAddr::from(([10, 0, 0, host], 6881));
        socket.dispatch(&reply_reporting(tid, reported), from);
    }
    assert_eq!(socket.public_endpoint(), Some(reported));
    socket.close();
}
