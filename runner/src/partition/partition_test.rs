use super::{PartitionError, Partitioner, SliceRange, WorkUnit};

fn chunk(start: u32, stop: u32) -> WorkUnit {
    WorkUnit::Chunk(SliceRange::new(start, stop))
}

fn owned_by(rank: u32, size: u32, range: SliceRange) -> Vec<u32> {
    Partitioner::ranked(rank, size)
        .unwrap()
        .units(range)
        .map(|unit| match unit {
            WorkUnit::Slice(index) => index,
            other => panic!("ranked partitioner produced {other}"),
        })
        .collect()
}

#[test]
pub fn chunks_of_fifty() {
    let units: Vec<_> = Partitioner::chunked(50)
        .unwrap()
        .units(SliceRange::new(0, 120))
        .collect();

    assert_eq!(units, vec![chunk(0, 50), chunk(50, 100), chunk(100, 120)]);
}

#[test]
pub fn chunks_cover_range_without_gaps() {
    for (start, stop) in [(0, 0), (0, 1), (3, 17), (10, 110), (7, 1000)] {
        for chunk_size in [1, 2, 7, 50, 2000] {
            let units = Partitioner::chunked(chunk_size)
                .unwrap()
                .units(SliceRange::new(start, stop));
            let expected_len = units.len();

            let slices: Vec<u32> = units
                .flat_map(|unit| {
                    let range = unit.slices();
                    range.start..range.stop
                })
                .collect();

            assert_eq!(slices, (start..stop).collect::<Vec<_>>());
            assert_eq!(
                expected_len,
                ((stop - start) as usize + chunk_size as usize - 1) / chunk_size as usize
            );
        }
    }
}

#[test]
pub fn round_robin_over_four_ranks() {
    let range = SliceRange::new(0, 10);

    assert_eq!(owned_by(0, 4, range), vec![0, 4, 8]);
    assert_eq!(owned_by(1, 4, range), vec![1, 5, 9]);
    assert_eq!(owned_by(2, 4, range), vec![2, 6]);
    assert_eq!(owned_by(3, 4, range), vec![3, 7]);
}

#[test]
pub fn ranks_are_relative_to_start_slice() {
    assert_eq!(owned_by(0, 3, SliceRange::new(5, 12)), vec![5, 8, 11]);
    assert_eq!(owned_by(2, 3, SliceRange::new(5, 12)), vec![7, 10]);
}

#[test]
pub fn every_slice_owned_exactly_once() {
    for (start, stop) in [(0, 0), (0, 10), (4, 9), (100, 357)] {
        for size in 1..=12 {
            let mut owners = vec![0u32; (stop - start) as usize];
            let mut counts = Vec::new();

            for rank in 0..size {
                let owned = owned_by(rank, size, SliceRange::new(start, stop));
                counts.push(owned.len());

                for index in owned {
                    owners[(index - start) as usize] += 1;
                }
            }

            assert!(owners.iter().all(|&count| count == 1));

            let (min, max) = (
                counts.iter().min().copied().unwrap_or(0),
                counts.iter().max().copied().unwrap_or(0),
            );
            assert!(max - min <= 1, "unbalanced for {size} ranks: {counts:?}");
        }
    }
}

#[test]
pub fn surplus_ranks_own_nothing() {
    assert_eq!(owned_by(5, 8, SliceRange::new(0, 3)), Vec::<u32>::new());
    assert_eq!(owned_by(2, 8, SliceRange::new(0, 3)), vec![2]);
}

#[test]
pub fn empty_range_yields_no_units() {
    let range = SliceRange::new(42, 42);

    assert_eq!(Partitioner::chunked(50).unwrap().units(range).count(), 0);
    assert_eq!(Partitioner::ranked(0, 4).unwrap().units(range).count(), 0);
}

#[test]
pub fn invalid_parameters_are_rejected() {
    assert_eq!(Partitioner::chunked(0), Err(PartitionError::ZeroChunkSize));
    assert_eq!(Partitioner::ranked(0, 0), Err(PartitionError::ZeroRanks));
    assert_eq!(
        Partitioner::ranked(4, 4),
        Err(PartitionError::RankOutOfBounds { rank: 4, size: 4 })
    );
}
