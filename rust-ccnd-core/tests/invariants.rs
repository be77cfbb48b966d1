//! Table-consistency and boundary-behavior checks.

mod common;

use common::*;
use rust_ccnd_core::face::FaceFlags;
use rust_ccnd_core::store::ContentFlags;
use rust_ccnd_common::content::{content_value, parse_content_object};
use rust_ccnd_common::interest::{AOK_CS, AOK_DEFAULT, AOK_EXPIRE, AOK_NEW, AOK_STALE};

#[test]
fn duplicate_content_keeps_one_entry() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let wire = content("/dup/x", b"same bytes");
    d.process_message(f1, wire.clone());
    d.process_message(f1, wire);
    assert_eq!(d.content_count(), 1);
    assert_eq!(d.accession_counter(), 1);
    assert_eq!(d.metrics().content_dups_recvd.value(), 1);
    d.check_store_integrity().unwrap();
}

#[test]
fn accessions_strictly_increase() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    for i in 0..20u32 {
        d.process_message(f1, content(&format!("/acc/{}", i), b"x"));
        assert_eq!(d.accession_counter(), (i + 1) as u64);
    }
}

#[test]
fn pending_interest_counts_balance() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    let f3 = d.add_internal_face(FaceFlags::empty());

    d.process_message(f1, interest("/b/1").nonce(vec![1, 0, 0, 1]).build());
    d.process_message(f1, interest("/b/2").nonce(vec![1, 0, 0, 2]).build());
    d.process_message(f2, interest("/b/3").nonce(vec![1, 0, 0, 3]).build());
    let sum = d.face_pending_interests(f1)
        + d.face_pending_interests(f2)
        + d.face_pending_interests(f3);
    assert_eq!(sum as usize, d.live_pit_count());
    assert_eq!(sum, 3);

    // answering one consumes exactly one entry, on the right face
    d.process_message(f3, content("/b/3", b"answer"));
    let sum = d.face_pending_interests(f1)
        + d.face_pending_interests(f2)
        + d.face_pending_interests(f3);
    assert_eq!(sum, 2);
    assert_eq!(sum as usize, d.live_pit_count());
    assert_eq!(d.face_pending_interests(f2), 0);

    // the rest expire
    run_for(&mut d, 4_500_000, 100_000);
    assert_eq!(d.live_pit_count(), 0);
    assert_eq!(d.face_pending_interests(f1), 0);
}

#[test]
fn consumed_nonce_still_suppresses() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    let nonce = [4u8, 4, 4, 4];
    let wire = interest("/t/s").nonce(nonce.to_vec()).build();
    d.process_message(f1, wire.clone());
    d.process_message(f2, content("/t/s", b"x"));
    assert_eq!(d.live_pit_count(), 0);
    // the tombstone still swallows a replay
    d.process_message(f1, wire);
    assert_eq!(d.live_pit_count(), 0);
    assert_eq!(d.metrics().interests_dropped.value(), 1);
}

#[test]
fn destroyed_faceid_never_resolves_again() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let doomed = d.add_internal_face(FaceFlags::empty());
    d.destroy_face(doomed);
    assert!(!d.face_exists(doomed));
    for _ in 0..50 {
        let id = d.add_internal_face(FaceFlags::empty());
        assert_ne!(id, doomed);
    }
    assert!(!d.face_exists(doomed));
    assert!(d.face_exists(f1));
}

#[test]
fn scope_zero_never_leaves_the_daemon() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    d.process_message(
        f1,
        interest("/local").nonce(vec![5, 5, 5, 5]).scope(0).build(),
    );
    assert_eq!(d.live_pit_count(), 0);
    run_for(&mut d, 100_000, 1000);
    assert!(d.take_output(f2).is_empty());
    assert!(d.take_output(f1).is_empty());
}

#[test]
fn scope_one_skips_link_faces() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let link = d.add_internal_face(FaceFlags::LINK);
    let plain = d.add_internal_face(FaceFlags::empty());
    d.process_message(
        f1,
        interest("/host").nonce(vec![6, 6, 6, 6]).scope(1).build(),
    );
    run_for(&mut d, 100_000, 500);
    assert!(d.take_output(link).is_empty(), "scope 1 never crosses links");
    assert!(!d.take_output(plain).is_empty());

    // and a scope-1 interest arriving over a link is out of scope
    let before = d.metrics().interests_accepted.value();
    d.process_message(
        link,
        interest("/host").nonce(vec![6, 6, 6, 7]).scope(1).build(),
    );
    assert_eq!(d.metrics().interests_accepted.value(), before);
}

#[test]
fn stale_content_needs_stale_tolerant_interest() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    d.process_message(f2, content_fresh("/s", b"old", 1));
    run_for(&mut d, 1_500_000, 100_000);
    assert!(d
        .content_flags(1)
        .unwrap()
        .contains(ContentFlags::STALE));

    // default origin kind (CS|NEW) does not accept stale
    d.process_message(f1, interest("/s").nonce(vec![8, 0, 0, 1]).build());
    assert_eq!(d.live_pit_count(), 1, "miss; interest propagates instead");
    run_for(&mut d, 5_000, 100);
    assert!(frames(&d.take_output(f1))
        .iter()
        .all(|m| parse_content_object(m).is_err()));

    // explicitly stale-tolerant interest is answered
    d.process_message(
        f1,
        interest("/s")
            .nonce(vec![8, 0, 0, 2])
            .answer_origin(AOK_DEFAULT | AOK_STALE)
            .build(),
    );
    run_for(&mut d, 5_000, 100);
    let out = d.take_output(f1);
    let answered = frames(&out)
        .iter()
        .filter_map(|m| parse_content_object(m).ok().map(|pco| (m.clone(), pco)))
        .next();
    let (msg, pco) = answered.expect("stale-ok interest answered from store");
    assert_eq!(content_value(&msg, &pco).unwrap(), b"old");
    // the fresh-only interest stays pending
    assert_eq!(d.live_pit_count(), 1);
}

#[test]
fn expire_origin_kind_marks_stale_after_answering() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    d.process_message(f2, content("/e", b"once"));
    d.process_message(
        f1,
        interest("/e")
            .nonce(vec![9, 0, 0, 1])
            .answer_origin(AOK_CS | AOK_NEW | AOK_EXPIRE)
            .scope(0)
            .build(),
    );
    run_for(&mut d, 100, 1);
    let out = d.take_output(f1);
    assert!(frames(&out)
        .iter()
        .any(|m| parse_content_object(m).is_ok()));
    assert!(d.content_flags(1).unwrap().contains(ContentFlags::STALE));
}

#[test]
fn child_selector_rightmost_returns_last_child() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    for (uri, payload) in [("/r/a", "A"), ("/r/b", "B"), ("/r/c", "C")] {
        d.process_message(f2, content(uri, payload.as_bytes()));
    }

    let answer = |d: &mut rust_ccnd_core::Daemon, b: rust_ccnd_common::interest::InterestBuilder| {
        d.process_message(f1, b.build());
        run_for(d, 100, 1);
        let out = d.take_output(f1);
        let msg = frames(&out)
            .into_iter()
            .find(|m| parse_content_object(m).is_ok())
            .expect("answered");
        let pco = parse_content_object(&msg).unwrap();
        content_value(&msg, &pco).unwrap().to_vec()
    };

    let leftmost = answer(&mut d, interest("/r").nonce(vec![0xc0, 0, 0, 1]));
    assert_eq!(leftmost, b"A");
    let rightmost = answer(
        &mut d,
        interest("/r").nonce(vec![0xc0, 0, 0, 2]).child_selector(5),
    );
    assert_eq!(rightmost, b"C");
}

#[test]
fn exclude_skips_listed_children() {
    use bytes::Bytes;
    use rust_ccnd_common::interest::ExcludeTerm;
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    for (uri, payload) in [("/x/a", "A"), ("/x/b", "B")] {
        d.process_message(f2, content(uri, payload.as_bytes()));
    }
    d.process_message(
        f1,
        interest("/x")
            .nonce(vec![0xd0, 0, 0, 1])
            .exclude(vec![ExcludeTerm::Component(Bytes::from_static(b"a"))])
            .build(),
    );
    run_for(&mut d, 100, 1);
    let out = d.take_output(f1);
    let msg = frames(&out)
        .into_iter()
        .find(|m| parse_content_object(m).is_ok())
        .expect("answered");
    let pco = parse_content_object(&msg).unwrap();
    assert_eq!(content_value(&msg, &pco).unwrap(), b"B");
}

#[test]
fn over_capacity_store_sheds_stale_entries() {
    let mut d = daemon_with(|cfg| cfg.capacity = 10);
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    for i in 0..30u32 {
        d.process_message(f1, content_fresh(&format!("/cap/{}", i), b"v", 1));
    }
    assert_eq!(d.content_count(), 30);
    // freshness expiry plus the cleaner pull the store back to quota
    run_for(&mut d, 20_000_000, 250_000);
    assert!(
        d.content_count() <= 11,
        "store at {} entries, capacity 10",
        d.content_count()
    );
    d.check_store_integrity().unwrap();
}
