//! Request scheduler: split missing chunk ranges across the peers the directory advertised.

use crate::chunk::MissingRange;

/// Split `range` into at most `peers` contiguous slices, in peer order.
///
/// The first `count % peers` slices carry one extra chunk. Empty slices are omitted, so a range
/// smaller than the peer list is served by the first `count` peers. No peers means no slices.
pub fn split_range(range: MissingRange, peers: usize) -> Vec<(usize, MissingRange)> {
    if peers == 0 || range.count == 0 {
        return vec![];
    }
    let n = peers as u32;
    let base = range.count / n;
    let extra = range.count % n;
    let mut out = Vec::with_capacity(peers);
    let mut start = range.start;
    for peer in 0..n {
        let count = base + u32::from(peer < extra);
        if count == 0 {
            continue;
        }
        out.push((peer as usize, MissingRange::new(start, count)));
        start += count;
    }
    out
}

/// Assign every missing range to the peers. Returns `(peer index, range)` requests.
///
/// Ranges are split in order; the peer that receives the first slice of each range rotates,
/// so single-chunk runs do not all land on peer 0.
pub fn plan_requests(ranges: &[MissingRange], peers: usize) -> Vec<(usize, MissingRange)> {
    if peers == 0 {
        return vec![];
    }
    let mut out = Vec::new();
    for (i, &range) in ranges.iter().enumerate() {
        out.extend(
            split_range(range, peers)
                .into_iter()
                .map(|(peer, r)| ((peer + i) % peers, r)),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(plan: &[(usize, MissingRange)]) -> Vec<u32> {
        let mut all: Vec<u32> = plan.iter().flat_map(|(_, r)| r.indices()).collect();
        all.sort_unstable();
        all
    }

    #[test]
    fn zero_peers_requests_nothing() {
        assert!(split_range(MissingRange::whole(10), 0).is_empty());
        assert!(plan_requests(&[MissingRange::whole(10)], 0).is_empty());
    }

    #[test]
    fn single_peer_gets_everything() {
        assert_eq!(
            split_range(MissingRange::new(3, 5), 1),
            vec![(0, MissingRange::new(3, 5))]
        );
    }

    #[test]
    fn split_is_contiguous_with_remainder_up_front() {
        assert_eq!(
            split_range(MissingRange::new(1, 10), 3),
            vec![
                (0, MissingRange::new(1, 4)),
                (1, MissingRange::new(5, 3)),
                (2, MissingRange::new(8, 3)),
            ]
        );
    }

    #[test]
    fn fewer_chunks_than_peers() {
        assert_eq!(
            split_range(MissingRange::new(7, 2), 5),
            vec![(0, MissingRange::new(7, 1)), (1, MissingRange::new(8, 1))]
        );
    }

    #[test]
    fn every_missing_chunk_is_requested_exactly_once() {
        let shapes: Vec<Vec<MissingRange>> = vec![
            vec![MissingRange::whole(1)],
            vec![MissingRange::whole(3)],
            vec![MissingRange::new(2, 1)],
            vec![MissingRange::new(1, 2), MissingRange::new(5, 7), MissingRange::new(20, 1)],
            vec![MissingRange::new(4, 100)],
        ];
        for ranges in &shapes {
            let mut expected: Vec<u32> = ranges.iter().flat_map(|r| r.indices()).collect();
            expected.sort_unstable();
            for peers in 1..=6 {
                let plan = plan_requests(ranges, peers);
                assert_eq!(requested(&plan), expected, "{ranges:?} over {peers} peers");
                assert!(plan.iter().all(|(p, r)| *p < peers && r.count > 0));
            }
        }
    }

    #[test]
    fn single_chunk_runs_rotate_across_peers() {
        let ranges = [
            MissingRange::new(1, 1),
            MissingRange::new(3, 1),
            MissingRange::new(5, 1),
        ];
        let peers: Vec<usize> = plan_requests(&ranges, 2).iter().map(|(p, _)| *p).collect();
        assert_eq!(peers, vec![0, 1, 0]);
    }
}
