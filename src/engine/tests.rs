use super::*;

use crate::constants::{MAX_EVS_ROUNDS, MAX_WRAP_SEQUENCE_VALUE};
use crate::testing::{self, id, Cluster, Envelope};
use crate::wire::{self, Seq, Service};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn views(cluster: &Cluster, id: ProcId) -> Vec<Delivery> {
    cluster.deliveries(id).iter().filter(|d| d.is_view()).cloned().collect()
}

#[test]
fn test_single_segment_bootstrap() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[1]));
    let a = id(0, 0);
    cluster.start(a);

    assert_eq!(cluster.state(a), State::Op);
    let delivered = views(&cluster, a);
    assert_eq!(delivered.len(), 2);
    match (&delivered[0], &delivered[1]) {
        (
            Delivery::Transitional { members: trans, memb_id: trans_id },
            Delivery::Regular { members, memb_id },
        ) => {
            assert_eq!(trans, &vec![a]);
            assert_eq!(members, &vec![a]);
            assert!(memb_id.time > trans_id.time);
            assert_eq!(memb_id.proc_id, a);
        }
        other => panic!("unexpected views {:?}", other),
    }

    // the token keeps circulating without ever leaving OP
    cluster.run_for(secs(5));
    assert_eq!(cluster.state(a), State::Op);
    assert_eq!(views(&cluster, a).len(), 2);
    assert_eq!(cluster.engine(a).status().counters.token_losses, 0);
}

#[test]
fn test_token_loss_recovery() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[1]));
    let a = id(0, 0);
    cluster.start(a);
    cluster.run_for(secs(2));
    let (_, first) = cluster.last_regular(a).unwrap();

    cluster.set_filter(|e: &Envelope| e.channel != Channel::Token);
    assert!(cluster.run_until(secs(5), |c| c.state(a) == State::Seg));
    cluster.clear_filter();

    assert!(cluster.run_until(secs(10), |c| {
        c.state(a) == State::Op && c.last_regular(a).map(|(_, memb_id)| memb_id != first).unwrap_or(false)
    }));
    let (members, second) = cluster.last_regular(a).unwrap();
    assert_eq!(members, vec![a]);
    assert!(second.time > first.time);
    assert_eq!(cluster.engine(a).status().counters.token_losses, 1);

    let delivered = views(&cluster, a);
    match &delivered[delivered.len() - 2] {
        Delivery::Transitional { members, .. } => assert_eq!(members, &vec![a]),
        other => panic!("expected a transitional view, got {:?}", other),
    }
}

#[test]
fn test_two_daemons_merge() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[2]));
    let (a, b) = (id(0, 0), id(0, 1));
    cluster.start(a);
    cluster.run_for(secs(3));
    cluster.start(b);

    assert!(cluster.run_until(secs(15), |c| c.installed(&[a, b])));
    let (_, at_a) = cluster.last_regular(a).unwrap();
    let (_, at_b) = cluster.last_regular(b).unwrap();
    assert_eq!(at_a, at_b);
    // the smallest representative assigned the identifier
    assert_eq!(at_a.proc_id, a);
}

#[test]
fn test_three_daemons_two_segments() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[2, 1]));
    let (a0, a1, b0) = (id(0, 0), id(0, 1), id(1, 0));
    cluster.start_all();

    assert!(cluster.run_until(secs(20), |c| c.installed(&[a0, a1, b0])));
    let ids: HashSet<MembershipId> = [a0, a1, b0].iter().map(|p| cluster.last_regular(*p).unwrap().1).collect();
    assert_eq!(ids.len(), 1);
}

#[test]
fn test_crash_delivers_transitional_then_regular() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let (a, b, c) = (id(0, 0), id(0, 1), id(0, 2));
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&[a, b, c])));
    let (_, before) = cluster.last_regular(a).unwrap();

    cluster.crash(c);
    assert!(cluster.run_until(secs(20), |cl| cl.installed(&[a, b])));

    for p in &[a, b] {
        let delivered = views(&cluster, *p);
        let n = delivered.len();
        match (&delivered[n - 2], &delivered[n - 1]) {
            (Delivery::Transitional { members: trans, .. }, Delivery::Regular { members, memb_id }) => {
                assert_eq!(trans, &vec![a, b]);
                assert_eq!(members, &vec![a, b]);
                assert!(memb_id.time > before.time);
            }
            other => panic!("unexpected views {:?}", other),
        }
    }
}

#[test]
fn test_agreed_total_order() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let members = [id(0, 0), id(0, 1), id(0, 2)];
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |c| c.installed(&members)));

    for round in 0..4 {
        for p in members.iter() {
            cluster.submit(*p, Service::Agreed, &format!("{}-{}", p, round));
        }
        cluster.run_for(Duration::from_millis(3));
    }
    assert!(cluster.run_until(secs(10), |c| members.iter().all(|p| c.messages(*p).len() == 12)));

    let order = cluster.messages(members[0]);
    for p in members.iter() {
        assert_eq!(cluster.messages(*p), order);
    }
    // messages of one sender keep their submission order
    let from_b: Vec<String> = order.iter().filter(|(s, _)| *s == members[1]).map(|(_, m)| m.clone()).collect();
    let expected: Vec<String> = (0..4).map(|r| format!("{}-{}", members[1], r)).collect();
    assert_eq!(from_b, expected);
}

#[test]
fn test_safe_and_large_messages() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[2]));
    let (a, b) = (id(0, 0), id(0, 1));
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |c| c.installed(&[a, b])));

    let large = "x".repeat(5000);
    cluster.submit(a, Service::Safe, "safe");
    cluster.submit(b, Service::Fifo, &large);
    assert!(cluster.run_until(secs(10), |c| c.messages(a).len() == 2 && c.messages(b).len() == 2));
    assert_eq!(cluster.messages(a), cluster.messages(b));
    assert!(cluster.messages(a).contains(&(b, large)));
}

#[test]
fn test_retransmission_after_drops() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let (a, b, c) = (id(0, 0), id(0, 1), id(0, 2));
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&[a, b, c])));

    let dropped = Rc::new(RefCell::new(0));
    let counter = dropped.clone();
    cluster.set_filter(move |e: &Envelope| {
        if e.channel == Channel::Broadcast && e.from == a && e.to == c && *counter.borrow() < 2 {
            *counter.borrow_mut() += 1;
            return false;
        }
        true
    });
    for n in 0..3 {
        cluster.submit(a, Service::Agreed, &format!("m{}", n));
    }
    assert!(cluster.run_until(secs(10), |cl| cl.messages(c).len() == 3));

    assert_eq!(*dropped.borrow(), 2);
    let expected: Vec<(ProcId, String)> = (0..3).map(|n| (a, format!("m{}", n))).collect();
    for p in &[a, b, c] {
        assert_eq!(cluster.messages(*p), expected);
    }
    let retrans: u64 = [a, b].iter().map(|p| cluster.engine(*p).status().counters.retrans).sum();
    assert!(retrans > 0);
}

#[test]
fn test_exactly_once_under_duplicates() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[2]));
    let (a, b) = (id(0, 0), id(0, 1));
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&[a, b])));

    let seen = Rc::new(RefCell::new(vec![]));
    let tap = seen.clone();
    cluster.set_filter(move |e: &Envelope| {
        if e.channel == Channel::Broadcast && e.to == b {
            tap.borrow_mut().push(e.clone());
        }
        true
    });
    cluster.submit(a, Service::Reliable, "once");
    cluster.submit(a, Service::Agreed, "twice?");
    assert!(cluster.run_until(secs(5), |cl| cl.messages(b).len() == 2));

    cluster.clear_filter();
    let copies: Vec<Envelope> = seen.borrow().clone();
    assert!(!copies.is_empty());
    for envelope in copies {
        cluster.inject(envelope.clone());
        cluster.inject(envelope);
    }
    cluster.run_for(secs(2));
    assert_eq!(cluster.messages(b), vec![(a, "once".to_string()), (a, "twice?".to_string())]);
}

#[test]
fn test_lossy_links_keep_order() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let members = [id(0, 0), id(0, 1), id(0, 2)];
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |c| c.installed(&members)));

    let mut rng = StdRng::seed_from_u64(7);
    cluster.set_filter(move |e: &Envelope| e.channel == Channel::Token || !rng.gen_bool(0.2));
    for n in 0..10 {
        for p in members.iter() {
            cluster.submit(*p, Service::Agreed, &format!("{}#{}", p, n));
        }
    }
    assert!(cluster.run_until(secs(20), |c| members.iter().all(|p| c.messages(*p).len() == 30)));

    let order = cluster.messages(members[0]);
    let unique: HashSet<&(ProcId, String)> = order.iter().collect();
    assert_eq!(unique.len(), 30);
    for p in members.iter() {
        assert_eq!(cluster.messages(*p), order);
    }
}

#[test]
fn test_configuration_hash_mismatch() {
    testing::init_tracing();
    let (a0, a1) = (id(0, 0), id(0, 1));
    let now = Instant::now();
    let conf = Arc::new(testing::conf(&[2, 1]));
    let mut receiver = Engine::new(conf.clone(), a0, EngineOptions::default()).unwrap();
    receiver.start(now).unwrap();
    receiver.drain_outbound();
    assert_eq!(receiver.state(), State::Seg);

    // one extra segment: everything it sends is ignored
    let other = Arc::new(testing::conf(&[2, 1, 1]));
    let mut stranger = Engine::new(other, a1, EngineOptions::default()).unwrap();
    stranger.start(now).unwrap();
    for datagram in stranger.drain_outbound() {
        receiver.handle_datagram(now, Channel::Broadcast, &datagram.bytes).unwrap();
    }
    assert!(!receiver.memb.f_members.contains(a1));

    // the same layout is accepted
    let mut peer = Engine::new(conf, a1, EngineOptions::default()).unwrap();
    peer.start(now).unwrap();
    for datagram in peer.drain_outbound() {
        receiver.handle_datagram(now, Channel::Broadcast, &datagram.bytes).unwrap();
    }
    assert!(receiver.memb.f_members.contains(a1));
}

#[test]
fn test_superseded_timers_are_cancelled() {
    testing::init_tracing();
    let (a0, a1) = (id(0, 0), id(0, 1));
    let start = Instant::now();
    let conf = Arc::new(testing::conf(&[2, 1]));
    let timeouts = Timeouts::local();

    let mut rep = Engine::new(conf.clone(), a0, EngineOptions::default()).unwrap();
    let mut follower = Engine::new(conf, a1, EngineOptions::default()).unwrap();
    rep.start(start).unwrap();
    follower.start(start).unwrap();
    assert!(follower.timers.is_scheduled(TimerKind::ScastAlive));
    assert!(follower.timers.is_scheduled(TimerKind::GatherOrRepresented));
    rep.drain_outbound();
    follower.drain_outbound();

    // alone in its segment as far as it knows, the rep starts gathering
    let gathered = start + timeouts.seg;
    rep.handle_timers(gathered).unwrap();
    assert_eq!(rep.state(), State::Gather);
    assert!(!rep.timers.is_scheduled(TimerKind::ScastAlive));
    assert!(!rep.timers.is_scheduled(TimerKind::GatherOrRepresented));
    assert!(rep.timers.is_scheduled(TimerKind::FormOrFail));

    // its JOIN puts the follower under its aegis before the follower's own probing ends
    let joined = start + timeouts.seg / 2;
    for datagram in rep.drain_outbound() {
        follower.handle_datagram(joined, Channel::Broadcast, &datagram.bytes).unwrap();
    }
    assert_eq!(follower.state(), State::Represented);
    assert!(!follower.timers.is_scheduled(TimerKind::ScastAlive));
    assert!(!follower.timers.is_scheduled(TimerKind::GatherOrRepresented));

    // past the probing period nothing fires a SEG-only transition
    follower.handle_timers(start + timeouts.seg + Duration::from_millis(10)).unwrap();
    assert_eq!(follower.state(), State::Represented);
    assert_eq!(follower.memb.my_seg_rep, Some(a0));

    // without further JOINs the follower falls back to probing
    follower.handle_timers(joined + timeouts.rep).unwrap();
    assert_eq!(follower.state(), State::Seg);
}

#[test]
fn test_priority_follows_ring() {
    let conf = Arc::new(testing::conf(&[1]));
    let a = id(0, 0);
    let mut engine = Engine::new(conf.clone(), a, EngineOptions::default()).unwrap();
    assert!(engine.accelerated);
    assert_eq!(engine.priority(), Priority::TokenFirst);
    engine.prot.highest_seq = 4;
    assert_eq!(engine.priority(), Priority::BroadcastFirst);

    let options = EngineOptions { accelerated_ring: Some(false), ..EngineOptions::default() };
    let engine = Engine::new(conf, a, options).unwrap();
    assert_eq!(engine.priority(), Priority::BroadcastFirst);
}

/// A ring of one that already sent its first token.
fn solo() -> (Engine, Instant) {
    let now = Instant::now();
    let mut engine = Engine::new(Arc::new(testing::conf(&[1])), id(0, 0), EngineOptions::default()).unwrap();
    engine.start(now).unwrap();
    engine.drain_outbound();
    engine.drain_deliveries();
    (engine, now)
}

fn regular_token(engine: &Engine, seq: Seq, aru: Seq, aru_last_id: Option<ProcId>) -> Bytes {
    let mut header = TokenHeader::blank(engine.me);
    header.memb_id = engine.active_id();
    header.seq = seq;
    header.aru = aru;
    header.aru_last_id = aru_last_id;
    wire::encode_token(&Token { header, body: TokenBody::Regular(vec![]) }, engine.conf.hash()).unwrap()
}

fn forwarded_tokens(engine: &mut Engine) -> Vec<TokenHeader> {
    let token_addr = engine.conf.token_addr(engine.me);
    engine
        .drain_outbound()
        .into_iter()
        .filter(|datagram| Some(datagram.to) == token_addr)
        .map(|datagram| wire::decode_token(&datagram.bytes).unwrap().inner.header)
        .collect()
}

/// Every daemon delivers a message at most once, and any two daemons deliver the messages
/// they have in common in the same order.
fn assert_consistent_order(cluster: &Cluster, members: &[ProcId]) {
    for p in members {
        let delivered = cluster.messages(*p);
        let unique: HashSet<&(ProcId, String)> = delivered.iter().collect();
        assert_eq!(unique.len(), delivered.len(), "duplicate delivery at {}", p);
    }
    for p in members {
        for q in members {
            let at_p = cluster.messages(*p);
            let at_q = cluster.messages(*q);
            let in_p: HashSet<&(ProcId, String)> = at_p.iter().collect();
            let in_q: HashSet<&(ProcId, String)> = at_q.iter().collect();
            let common_p: Vec<&(ProcId, String)> = at_p.iter().filter(|m| in_q.contains(m)).collect();
            let common_q: Vec<&(ProcId, String)> = at_q.iter().filter(|m| in_p.contains(m)).collect();
            assert_eq!(common_p, common_q, "{} and {} disagree on the order", p, q);
        }
    }
}

/// Every regular view comes right after a transitional one, and within one regular view each
/// daemon delivers a prefix of the same sequence.
fn assert_view_order(cluster: &Cluster, members: &[ProcId]) {
    let mut by_view: HashMap<MembershipId, Vec<Vec<(ProcId, String)>>> = HashMap::new();
    for p in members {
        let delivered = views(cluster, *p);
        for (i, view) in delivered.iter().enumerate() {
            if let Delivery::Regular { memb_id, .. } = view {
                match i.checked_sub(1).map(|prev| &delivered[prev]) {
                    Some(Delivery::Transitional { .. }) => (),
                    other => panic!("regular view {} at {} preceded by {:?}", memb_id, p, other),
                }
            }
        }
        for (view, messages) in cluster.messages_by_view(*p) {
            if let Delivery::Regular { memb_id, .. } = view {
                by_view.entry(memb_id).or_insert_with(Vec::new).push(messages);
            }
        }
    }
    for (memb_id, sequences) in by_view {
        let longest = sequences.iter().max_by_key(|s| s.len()).cloned().unwrap_or_default();
        for sequence in sequences {
            assert_eq!(&longest[..sequence.len()], &sequence[..], "deliveries diverge in ring {}", memb_id);
        }
    }
}

fn assert_aru_never_went_back(cluster: &Cluster, members: &[ProcId]) {
    for p in members {
        assert_eq!(cluster.engine(*p).status().counters.aru_decreases, 0, "aru went back at {}", p);
    }
}

/// Keeps `talker` broadcasting until `members` share one ring, so the others see foreign
/// packets.
fn heal_with_traffic(cluster: &mut Cluster, talker: ProcId, members: &[ProcId]) -> bool {
    for n in 0..120 {
        if cluster.installed(members) {
            return true;
        }
        cluster.submit(talker, Service::Agreed, &format!("{} heal {}", talker, n));
        cluster.run_for(Duration::from_millis(500));
    }
    cluster.installed(members)
}

/// Splits `[a, b, c]` into `{a, b}` and `{c}` while messages are in flight, keeps both sides
/// busy, then heals the network and checks the merged history.
fn partition_and_heal(seed: u64, loss: f64) {
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let (a, b, c) = (id(0, 0), id(0, 1), id(0, 2));
    let all = [a, b, c];
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&all)));

    let split = Rc::new(Cell::new(false));
    let cut = split.clone();
    let mut rng = StdRng::seed_from_u64(seed);
    cluster.set_filter(move |e: &Envelope| {
        if cut.get() && (e.from == c) != (e.to == c) {
            return false;
        }
        e.channel == Channel::Token || !rng.gen_bool(loss)
    });

    for n in 0..3 {
        for p in all.iter() {
            cluster.submit(*p, Service::Agreed, &format!("{} before {}", p, n));
        }
    }
    cluster.run_for(Duration::from_millis(2));
    split.set(true);
    assert!(cluster.run_until(secs(30), |cl| cl.installed(&[a, b]) && cl.installed(&[c])), "seed {}", seed);

    let left: Vec<(ProcId, String)> =
        (0..5).flat_map(|n| vec![(a, format!("{} left {}", a, n)), (b, format!("{} left {}", b, n))]).collect();
    let right: Vec<(ProcId, String)> = (0..5).map(|n| (c, format!("{} right {}", c, n))).collect();
    for (sender, payload) in left.iter().chain(right.iter()) {
        cluster.submit(*sender, Service::Agreed, payload);
    }
    assert!(
        cluster.run_until(secs(10), |cl| {
            let has = |p: ProcId, expected: &[(ProcId, String)]| {
                let delivered = cl.messages(p);
                expected.iter().all(|m| delivered.contains(m))
            };
            has(a, &left[..]) && has(b, &left[..]) && has(c, &right[..])
        }),
        "seed {}",
        seed
    );
    for p in &[a, b] {
        assert!(right.iter().all(|m| !cluster.messages(*p).contains(m)));
    }

    split.set(false);
    assert!(heal_with_traffic(&mut cluster, c, &all), "seed {}", seed);

    let after: Vec<(ProcId, String)> = all.iter().map(|p| (*p, format!("{} after", p))).collect();
    for (sender, payload) in after.iter() {
        cluster.submit(*sender, Service::Agreed, payload);
    }
    assert!(
        cluster.run_until(secs(20), |cl| all.iter().all(|p| {
            let delivered = cl.messages(*p);
            after.iter().all(|m| delivered.contains(m))
        })),
        "seed {}",
        seed
    );

    assert_consistent_order(&cluster, &all);
    assert_view_order(&cluster, &all);
    assert_aru_never_went_back(&cluster, &all);
}

#[test]
fn test_partition_heal_keeps_view_order() {
    testing::init_tracing();
    partition_and_heal(0, 0.0);
}

#[test]
fn test_partition_heal_under_loss() {
    testing::init_tracing();
    for seed in 1..4 {
        partition_and_heal(seed, 0.05);
    }
}

#[test]
fn test_partition_skips_holes_of_departed_daemons() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let (a, b, c) = (id(0, 0), id(0, 1), id(0, 2));
    let all = [a, b, c];
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&all)));
    cluster.run_for(secs(1));

    // c's packets stop reaching the others while its tokens still do
    let split = Rc::new(Cell::new(false));
    let cut = split.clone();
    cluster.set_filter(move |e: &Envelope| {
        let across = (e.from == c) != (e.to == c);
        !(across && (cut.get() || (e.from == c && e.channel == Channel::Broadcast)))
    });

    let base = cluster.engine(c).status().highest_seq;
    for n in 0..3 {
        cluster.submit(c, Service::Agreed, &format!("lost {}", n));
    }
    assert!(cluster.run_until(secs(2), |cl| [a, b].iter().all(|p| cl.engine(*p).status().highest_seq >= base + 3)));
    for n in 0..2 {
        cluster.submit(a, Service::Agreed, &format!("kept {}", n));
    }
    assert!(cluster.run_until(secs(2), |cl| [a, b].iter().all(|p| cl.engine(*p).status().highest_seq >= base + 5)));
    split.set(true);

    assert!(cluster.run_until(secs(30), |cl| cl.installed(&[a, b]) && cl.installed(&[c])));
    let kept = vec![(a, "kept 0".to_string()), (a, "kept 1".to_string())];
    for p in &[a, b] {
        assert!(cluster.messages(*p).iter().all(|(sender, _)| *sender != c));
        // the committed daemon's packets past the hole come with the transitional view
        let by_view = cluster.messages_by_view(*p);
        let (view, messages) = by_view.iter().find(|(_, messages)| messages.contains(&kept[0])).unwrap();
        match view {
            Delivery::Transitional { members, .. } => assert_eq!(members, &vec![a, b]),
            other => panic!("kept messages delivered in {:?}", other),
        }
        assert_eq!(messages, &kept);
    }
    let at_c: Vec<String> = cluster.messages(c).into_iter().map(|(_, payload)| payload).collect();
    assert_eq!(at_c, vec!["lost 0", "lost 1", "lost 2", "kept 0", "kept 1"]);

    cluster.clear_filter();
    assert!(heal_with_traffic(&mut cluster, c, &all));
    for p in all.iter() {
        cluster.submit(*p, Service::Agreed, &format!("{} joined", p));
    }
    assert!(cluster.run_until(secs(10), |cl| all
        .iter()
        .all(|p| all.iter().all(|q| cl.messages(*p).contains(&(*q, format!("{} joined", q)))))));

    for p in &[a, b] {
        assert!(!cluster.messages(*p).iter().any(|(_, payload)| payload.starts_with("lost")));
    }
    assert_consistent_order(&cluster, &all);
    assert_view_order(&cluster, &all);
    assert_aru_never_went_back(&cluster, &all);
}

#[test]
fn test_lookup_merges_quiet_partitions() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[3]));
    let (a, b, c) = (id(0, 0), id(0, 1), id(0, 2));
    let all = [a, b, c];
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |cl| cl.installed(&all)));

    cluster.set_filter(move |e: &Envelope| (e.from == c) == (e.to == c));
    assert!(cluster.run_until(secs(30), |cl| cl.installed(&[a, b]) && cl.installed(&[c])));

    // nothing is sent after the heal: only the periodic lookup finds the other side
    cluster.clear_filter();
    assert!(cluster.run_until(secs(70), |cl| cl.installed(&all)));
    let ids: HashSet<MembershipId> = all.iter().map(|p| cluster.last_regular(*p).unwrap().1).collect();
    assert_eq!(ids.len(), 1);
    assert_view_order(&cluster, &all);
}

#[test]
fn test_aru_never_decreases_within_a_ring() {
    testing::init_tracing();
    for seed in 0..3 {
        let mut cluster = Cluster::new(testing::conf(&[3]));
        let members = [id(0, 0), id(0, 1), id(0, 2)];
        cluster.start_all();
        assert!(cluster.run_until(secs(15), |c| c.installed(&members)));

        let mut rng = StdRng::seed_from_u64(seed);
        cluster.set_filter(move |e: &Envelope| e.channel == Channel::Token || !rng.gen_bool(0.15));
        for n in 0..20 {
            for p in members.iter() {
                cluster.submit(*p, Service::Agreed, &format!("{}/{}", p, n));
            }
        }

        let mut last: HashMap<ProcId, (MembershipId, Seq)> = HashMap::new();
        let done = cluster.run_until(secs(30), |c| {
            for p in members.iter() {
                let status = c.engine(*p).status();
                if status.state != State::Op {
                    continue;
                }
                if let Some((memb_id, aru)) = last.get(p) {
                    if *memb_id == status.membership_id {
                        assert!(status.aru >= *aru, "aru of {} went from {} to {}", p, aru, status.aru);
                    }
                }
                last.insert(*p, (status.membership_id, status.aru));
            }
            members.iter().all(|p| c.messages(*p).len() == 60)
        });
        assert!(done, "seed {}", seed);
        assert_consistent_order(&cluster, &members);
        assert_aru_never_went_back(&cluster, &members);
    }
}

#[test]
fn test_idle_ring_holds_the_token_until_hurried() {
    testing::init_tracing();
    let mut cluster = Cluster::new(testing::conf(&[2]));
    let (a, b) = (id(0, 0), id(0, 1));
    cluster.start_all();
    assert!(cluster.run_until(secs(15), |c| c.installed(&[a, b])));
    cluster.run_for(secs(1));

    let before_a = cluster.engine(a).status().counters;
    let before_b = cluster.engine(b).status().counters;
    cluster.run_for(secs(5));
    let after_a = cluster.engine(a).status().counters;
    let after_b = cluster.engine(b).status().counters;

    // the leader holds the token and only re-sends it on its hurry timer
    let idle_rounds = after_a.token_rounds - before_a.token_rounds;
    assert!(idle_rounds > 0 && idle_rounds < 50, "{} rounds while idle", idle_rounds);
    assert!(after_a.token_hurries > before_a.token_hurries);
    assert_eq!(after_b.token_hurries, before_b.token_hurries);
    assert_eq!(after_a.token_losses, before_a.token_losses);
    assert_eq!(after_b.token_losses, before_b.token_losses);

    // a member with something to send wakes the leader well before its next hurry
    cluster.submit(b, Service::Agreed, "wake up");
    assert!(cluster.run_until(Duration::from_millis(250), |c| c.messages(a).len() == 1 && c.messages(b).len() == 1));
    assert_eq!(cluster.messages(a), vec![(b, "wake up".to_string())]);
}

#[test]
fn test_evs_gives_up_after_too_many_rounds() {
    testing::init_tracing();
    for (rounds, gives_up) in &[(MAX_EVS_ROUNDS - 1, false), (MAX_EVS_ROUNDS, true)] {
        let (mut engine, now) = solo();
        engine.memb.state = State::Evs;
        engine.prot.token_rounds = *rounds;
        // packets 1 to 5 of the old ring never show up
        engine.prot.highest_seq = 5;
        engine.prot.last_seq = 10;

        let token = regular_token(&engine, 0, 0, None);
        engine.handle_datagram(now, Channel::Token, &token).unwrap();
        if *gives_up {
            assert_eq!(engine.state(), State::Seg);
            assert_eq!(engine.status().counters.token_losses, 1);
            assert!(!engine.timers.is_scheduled(TimerKind::TokenLoss));
        } else {
            assert_eq!(engine.state(), State::Evs);
            assert_eq!(engine.status().counters.token_losses, 0);
            assert_eq!(forwarded_tokens(&mut engine).len(), 1);
        }
    }
}

#[test]
fn test_token_near_wrap_is_swallowed() {
    testing::init_tracing();
    let (mut engine, now) = solo();
    let token = regular_token(&engine, 0, 0, None);
    engine.handle_datagram(now, Channel::Token, &token).unwrap();
    assert_eq!(forwarded_tokens(&mut engine).len(), 1);

    let (mut engine, now) = solo();
    let token = regular_token(&engine, MAX_WRAP_SEQUENCE_VALUE + 1, 0, None);
    engine.handle_datagram(now, Channel::Token, &token).unwrap();
    assert!(forwarded_tokens(&mut engine).is_empty());
    assert_eq!(engine.state(), State::Op);

    // with the token gone the ring is rebuilt, starting over from sequence zero
    let timeout = engine.timeouts.token;
    engine.handle_timers(now + timeout).unwrap();
    assert_eq!(engine.state(), State::Seg);
    assert_eq!(engine.status().counters.token_losses, 1);
}

#[test]
fn test_first_token_of_a_ring_restarts_the_aru() {
    testing::init_tracing();
    let (mut engine, now) = solo();
    engine.prot.highest_seq = 2;
    engine.prot.my_aru = 2;
    engine.prot.aru = 2;
    engine.prot.last_token.aru = 2;
    engine.prot.last_discarded = 2;
    engine.prot.last_delivered = 2;

    // still carrying the aru of the EVS phase
    let token = regular_token(&engine, 2, 3383, Some(id(0, 5)));
    engine.handle_datagram(now, Channel::Token, &token).unwrap();
    let forwarded = forwarded_tokens(&mut engine);
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].aru, 2);
    assert_eq!(forwarded[0].aru_last_id, Some(engine.me));
    assert_eq!(engine.prot.set_aru, None);
    assert_eq!(engine.prot.aru, 2);
    assert_eq!(engine.status().counters.aru_decreases, 0);
}

#[test]
fn test_aru_going_back_is_not_fatal() {
    testing::init_tracing();
    let (mut engine, now) = solo();
    engine.prot.highest_seq = 4;
    engine.prot.my_aru = 4;
    engine.prot.aru = 4;
    engine.prot.last_token.aru = 4;
    engine.prot.last_discarded = 4;
    engine.prot.last_delivered = 4;

    let token = regular_token(&engine, 4, 2, Some(id(0, 5)));
    engine.handle_datagram(now, Channel::Token, &token).unwrap();
    assert_eq!(engine.state(), State::Op);
    assert_eq!(engine.prot.aru, 2);
    assert_eq!(engine.status().counters.aru_decreases, 1);
    assert_eq!(forwarded_tokens(&mut engine).len(), 1);
}
