use std::{num::NonZeroUsize, thread};

use comms::{Collective, LocalGroup, Rendezvous, Solo, TcpGroup};

#[test]
fn solo_gathers_local_contribution() {
    let solo = Solo::new();
    let mut slots = vec![Vec::new()];

    solo.all_gather(&mut slots, &[3.0f32, 4.0]).unwrap();

    assert_eq!(solo.world_size(), 1);
    assert!(solo.is_master());
    assert_eq!(slots, [vec![3.0, 4.0]]);
}

#[test]
fn solo_rejects_extra_slots() {
    let mut slots: Vec<Vec<f32>> = vec![Vec::new(); 2];
    assert!(Solo::new().all_gather(&mut slots, &[1.0]).is_err());
}

#[test]
fn local_group_gathers_ragged_contributions_in_rank_order() {
    const WORLD: usize = 3;

    let group = LocalGroup::group(NonZeroUsize::new(WORLD).unwrap());

    let handles: Vec<_> = group
        .into_iter()
        .map(|member| {
            thread::spawn(move || {
                let local: Vec<f32> = (0..=member.rank()).map(|i| i as f32).collect();
                let mut slots = vec![Vec::new(); WORLD];
                member.all_gather(&mut slots, &local).unwrap();
                slots
            })
        })
        .collect();

    for handle in handles {
        let slots = handle.join().unwrap();
        assert_eq!(slots[0], [0.0]);
        assert_eq!(slots[1], [0.0, 1.0]);
        assert_eq!(slots[2], [0.0, 1.0, 2.0]);
    }
}

#[test]
fn tcp_group_gathers_in_rank_order() {
    const WORLD: usize = 3;
    const ROUNDS: i64 = 5;

    let rendezvous = Rendezvous::bind("127.0.0.1:0").unwrap();
    let addr = rendezvous.local_addr().unwrap();

    let peers: Vec<_> = (1..WORLD)
        .map(|rank| {
            thread::spawn(move || {
                let group = TcpGroup::connect(addr, rank, WORLD).unwrap();
                let mut slots = vec![Vec::new(); WORLD];

                for round in 0..ROUNDS {
                    group
                        .all_gather(&mut slots, &[round, rank as i64])
                        .unwrap();

                    for (r, slot) in slots.iter().enumerate() {
                        assert_eq!(slot, &[round, r as i64]);
                    }
                }
            })
        })
        .collect();

    let master = rendezvous.accept(WORLD).unwrap();
    assert!(master.is_master());

    let mut slots = vec![Vec::new(); WORLD];
    for round in 0..ROUNDS {
        master.all_gather(&mut slots, &[round, 0]).unwrap();

        for (r, slot) in slots.iter().enumerate() {
            assert_eq!(slot, &[round, r as i64]);
        }
    }

    for peer in peers {
        peer.join().unwrap();
    }
}

#[test]
fn tcp_connect_rejects_master_rank() {
    assert!(TcpGroup::connect("127.0.0.1:1", 0, 2).is_err());
}
