//! End-to-end forwarding scenarios over internal faces.

mod common;

use common::*;
use rust_ccnd_core::face::FaceFlags;
use rust_ccnd_common::coding::{dtag, ElementDecoder, Token};
use rust_ccnd_common::content::{content_value, parse_content_object};
use rust_ccnd_common::interest::parse_interest;

#[test]
fn local_echo_interest_expires_unanswered() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    let f3 = d.add_internal_face(FaceFlags::empty());

    let nonce = [1u8, 2, 3, 4, 5, 6];
    d.process_message(f1, interest("/a/b").nonce(nonce.to_vec()).build());
    assert_eq!(d.live_pit_count(), 1);
    let ne = nonce_elem(&nonce);
    assert_eq!(d.pit_outbound(&ne).unwrap().len(), 2);

    // both other faces receive the interest, nonce intact
    run_for(&mut d, 100_000, 500);
    for f in [f2, f3] {
        let out = d.take_output(f);
        let msgs = frames(&out);
        assert_eq!(msgs.len(), 1, "face {} should see exactly one interest", f);
        let pi = parse_interest(&msgs[0]).unwrap();
        assert_eq!(&msgs[0][pi.nonce.clone()], &ne[..]);
    }

    // nothing answers; the entry expires after its 4 s lifetime
    run_for(&mut d, 4_200_000, 100_000);
    assert_eq!(d.live_pit_count(), 0);
    assert!(d.take_output(f1).is_empty(), "originator got no reply");
}

#[test]
fn cache_hit_answers_without_pit_state() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::LOCAL);

    d.process_message(f2, content("/x", b"hello"));
    assert_eq!(d.content_count(), 1);
    assert_eq!(d.accession_counter(), 1);

    d.process_message(f1, interest("/x").nonce(vec![9, 9, 9, 9]).build());
    assert_eq!(d.live_pit_count(), 0, "locally satisfied, no pending state");
    assert_eq!(d.accession_counter(), 1, "no new accession");

    run_for(&mut d, 100, 1);
    let out = d.take_output(f1);
    let msgs = frames(&out);
    assert_eq!(msgs.len(), 1);
    let pco = parse_content_object(&msgs[0]).unwrap();
    assert_eq!(pco.ncomps(), 1, "digest component is excised on the wire");
    assert_eq!(content_value(&msgs[0], &pco).unwrap(), b"hello");

    // no frames ever leave toward the publisher
    run_for(&mut d, 20_000, 1000);
    assert!(d.take_output(f2).is_empty());
}

#[test]
fn duplicate_nonce_is_suppressed() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let _f2 = d.add_internal_face(FaceFlags::empty());
    let _f3 = d.add_internal_face(FaceFlags::empty());
    let f4 = d.add_internal_face(FaceFlags::empty());

    let nonce = [7u8, 7, 7, 7, 7, 7];
    let wire = interest("/m").nonce(nonce.to_vec()).build();
    d.process_message(f1, wire.clone());
    assert_eq!(d.live_pit_count(), 1);
    let ne = nonce_elem(&nonce);
    assert_eq!(d.pit_outbound(&ne).unwrap().len(), 3);

    // retransmission from the same face changes nothing
    d.process_message(f1, wire.clone());
    assert_eq!(d.live_pit_count(), 1);
    assert_eq!(d.metrics().interests_dropped.value(), 1);
    assert_eq!(d.pit_outbound(&ne).unwrap().len(), 3);

    // the same nonce relayed back via another face removes that face
    // from the outbound set
    d.process_message(f4, wire);
    assert_eq!(d.live_pit_count(), 1);
    assert_eq!(d.metrics().interests_dropped.value(), 2);
    let outbound = d.pit_outbound(&ne).unwrap();
    assert_eq!(outbound.len(), 2);
    assert!(!outbound.contains(&f4));
}

#[test]
fn similar_interest_coalesces_toward_first_origin() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    let _f3 = d.add_internal_face(FaceFlags::empty());

    let n1 = [1u8, 1, 1, 1];
    let n2 = [2u8, 2, 2, 2];
    d.process_message(f1, interest("/p").nonce(n1.to_vec()).build());
    assert_eq!(d.pit_outbound(&nonce_elem(&n1)).unwrap().len(), 2);

    // same interest, different nonce, from F2: the existing entry will
    // serve, but we still reach back toward F1
    d.process_message(f2, interest("/p").nonce(n2.to_vec()).build());
    assert_eq!(d.pit_outbound(&nonce_elem(&n2)).unwrap(), vec![f1]);
}

#[test]
fn same_face_near_duplicates_tolerated_then_dropped() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let _f2 = d.add_internal_face(FaceFlags::empty());

    // distinct nonces, same everything else, all from f1
    for (i, n) in [[3u8, 0, 0, 1], [3, 0, 0, 2], [3, 0, 0, 3], [3, 0, 0, 4]]
        .iter()
        .enumerate()
    {
        d.process_message(f1, interest("/dup").nonce(n.to_vec()).build());
        let outbound = d.pit_outbound(&nonce_elem(n)).unwrap_or_default();
        if i < 3 {
            assert!(!outbound.is_empty(), "copy {} still propagates", i);
        } else {
            assert!(outbound.is_empty(), "copy {} is damped", i);
        }
    }
}

#[test]
fn stuffing_piggybacks_pending_interests() {
    let mut d = daemon_with(|cfg| cfg.mtu = 1400);
    let f1 = d.add_internal_face(FaceFlags::LINK);
    let f2 = d.add_internal_face(FaceFlags::LOCAL);

    let n0 = [0xa0u8, 0, 0, 1];
    let n1 = [0xa1u8, 0, 0, 1];
    let n2 = [0xa2u8, 0, 0, 2];
    d.process_message(f1, interest("/x").nonce(n0.to_vec()).build());
    d.process_message(f2, interest("/p1").nonce(n1.to_vec()).build());
    d.process_message(f2, interest("/p2").nonce(n2.to_vec()).build());
    assert_eq!(d.pit_outbound(&nonce_elem(&n1)).unwrap(), vec![f1]);
    assert_eq!(d.pit_outbound(&nonce_elem(&n2)).unwrap(), vec![f1]);

    // the answer to /x arrives; everything bound for f1 rides along
    d.process_message(f2, content("/x", &[0x55u8; 500]));
    run_for(&mut d, 20_000, 50);

    let out = d.take_output(f1);
    let mut saw_content = false;
    let mut saw = Vec::new();
    for frame in frames(&out) {
        // every frame on a link face is PDU-wrapped
        let dec = ElementDecoder::new(&frame).unwrap();
        assert_eq!(dec.token(), Token::Dtag(dtag::CCN_PROTOCOL_DATA_UNIT));
        let inner = frame.slice(dec.index()..frame.len() - 1);
        for member in frames(&inner) {
            if let Ok(pco) = parse_content_object(&member) {
                assert_eq!(content_value(&member, &pco).unwrap(), &[0x55u8; 500][..]);
                saw_content = true;
            } else {
                let pi = parse_interest(&member).unwrap();
                saw.push(member.slice(pi.nonce.clone()));
            }
        }
    }
    assert!(saw_content, "content object went out on the link face");
    assert!(saw.contains(&nonce_elem(&n1)), "p1 went out with it");
    assert!(saw.contains(&nonce_elem(&n2)), "p2 went out with it");
    assert!(d.pit_outbound(&nonce_elem(&n1)).unwrap_or_default().is_empty());
    assert!(d.pit_outbound(&nonce_elem(&n2)).unwrap_or_default().is_empty());
    assert!(d.metrics().interests_stuffed.value() >= 1);
}

#[test]
fn face_destruction_leaves_store_intact() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f3 = d.add_internal_face(FaceFlags::empty());

    for i in 1..=11u32 {
        d.process_message(f1, content(&format!("/q/{}", i), b"payload"));
    }
    assert_eq!(d.accession_counter(), 11);

    // queue accessions 7 and 11 for transmission on f3
    d.process_message(f3, interest("/q/7").nonce(vec![0x70, 0, 0, 7]).build());
    d.process_message(f3, interest("/q/11").nonce(vec![0x70, 0, 0, 11]).build());

    d.destroy_face(f3);
    assert!(!d.face_exists(f3));

    run_for(&mut d, 10_000, 10);
    assert_eq!(d.content_count(), 11);
    assert!(d.content_flags(7).is_some(), "entry 7 undisturbed");
    assert!(d.content_flags(11).is_some(), "entry 11 undisturbed");
    d.check_store_integrity().unwrap();
}

#[test]
fn forwarding_registration_directs_and_expires() {
    let mut d = daemon();
    let f1 = d.add_internal_face(FaceFlags::LOCAL);
    let f2 = d.add_internal_face(FaceFlags::empty());
    let f3 = d.add_internal_face(FaceFlags::empty());

    d.register_prefix(
        &name("/f"),
        f2,
        rust_ccnd_core::prefix::ForwardingFlags::ACTIVE,
        12,
    );
    // the registration is for /f exactly; without CHILD_INHERIT a
    // longer prefix still floods
    let n1 = [0xf1u8, 0, 0, 1];
    d.process_message(f1, interest("/f/a").nonce(n1.to_vec()).build());
    let outbound = d.pit_outbound(&nonce_elem(&n1)).unwrap();
    assert_eq!(outbound.len(), 2);
    assert!(outbound.contains(&f2) && outbound.contains(&f3));

    let n2 = [0xf2u8, 0, 0, 2];
    d.process_message(f1, interest("/f").nonce(n2.to_vec()).build());
    assert_eq!(
        d.pit_outbound(&nonce_elem(&n2)).unwrap(),
        vec![f2],
        "exact registration overrides flooding"
    );

    // registrations age out; five-second passes eat the 12 s lifetime
    run_for(&mut d, 20_000_000, 1_000_000);
    let n3 = [0xf3u8, 0, 0, 3];
    d.process_message(f1, interest("/f").nonce(n3.to_vec()).build());
    assert_eq!(
        d.pit_outbound(&nonce_elem(&n3)).unwrap().len(),
        2,
        "expired registration falls back to flooding"
    );
}
