use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use iroh_mirror_peering::{closest, closest_one, distance_cmp, xor_distance, Key, MirrorAddr};

fn random_mirrors(rng: &mut StdRng, count: usize) -> Vec<MirrorAddr> {
    (0..count)
        .map(|_| MirrorAddr::from_key(rng.gen::<Key>()))
        .collect()
}

#[test]
fn closest_matches_a_full_sort() {
    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..50 {
        let mirrors = random_mirrors(&mut rng, 1 + round % 12);
        let target: Key = rng.gen();
        let pick = round % 5;

        let mut sorted: Vec<&MirrorAddr> = mirrors.iter().collect();
        sorted.sort_by(|a, b| {
            distance_cmp(&xor_distance(&a.key, &target), &xor_distance(&b.key, &target))
        });
        sorted.truncate(pick);

        assert_eq!(closest(&target, &mirrors, pick), sorted, "round {round}");
    }
}

#[test]
fn every_device_picks_the_same_mirrors() {
    let mut rng = StdRng::seed_from_u64(11);
    let mirrors = random_mirrors(&mut rng, 8);
    let target: Key = rng.gen();

    let mut shuffled = mirrors.clone();
    shuffled.reverse();

    let mut ours: Vec<Key> = closest(&target, &mirrors, 2).iter().map(|m| m.key).collect();
    let mut theirs: Vec<Key> = closest(&target, &shuffled, 2).iter().map(|m| m.key).collect();
    ours.sort();
    theirs.sort();
    assert_eq!(ours, theirs);
}

#[test]
fn closest_one_agrees_with_closest() {
    let mut rng = StdRng::seed_from_u64(3);
    let mirrors = random_mirrors(&mut rng, 16);
    for _ in 0..20 {
        let target: Key = rng.gen();
        assert_eq!(closest_one(&target, &mirrors), closest(&target, &mirrors, 1).first().copied());
    }
    assert_eq!(closest_one::<MirrorAddr>(&[0; 32], &[]), None);
}
