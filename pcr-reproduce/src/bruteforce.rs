//! # Bit-Flip Brute Force
//!
//! Enumerates every way of flipping `d` bits of a byte window, for `d` from a
//! minimum to a maximum distance, and returns the first candidate accepted by
//! a check predicate.
//!
//! Candidates are ordered by distance, then lexicographically by bit
//! position. [`Combinations`] can be started at any rank, so the sequential
//! and parallel solvers walk exactly the same sequence and return the same
//! answer.
//!
//! Bit `b` addresses byte `b / 8`, mask `1 << (b % 8)`.

use log::trace;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BruteForceError {
    #[error("item size must be non-zero")]
    ZeroItemSize,
    #[error("window of {len} bytes is not a multiple of the {item_size}-byte item size")]
    WindowNotAligned { len: usize, item_size: usize },
    #[error("minimum distance {min} exceeds maximum distance {max}")]
    DistanceRange { min: usize, max: usize },
}

/// Number of `k`-subsets of `n` items, saturating at `u128::MAX`
pub fn binomial(n: usize, k: usize) -> u128 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: u128 = 1;
    for i in 0..k {
        // exact at every step: result * (n - i) is divisible by (i + 1)
        result = match result.checked_mul((n - i) as u128) {
            Some(v) => v / (i as u128 + 1),
            None => return u128::MAX,
        };
    }
    result
}

// ============================================================================
// COMBINATIONS
// ============================================================================

/// Lazy `k`-subsets of `0..n` in lexicographic order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combinations {
    n: usize,
    k: usize,
    next: Option<Vec<usize>>,
}

impl Combinations {
    pub fn new(n: usize, k: usize) -> Self {
        let next = if k <= n { Some((0..k).collect()) } else { None };
        Self { n, k, next }
    }

    /// Sequence restarted at the combination of lexicographic rank `rank`
    pub fn starting_at(n: usize, k: usize, rank: u128) -> Self {
        Self {
            n,
            k,
            next: Self::unrank(n, k, rank),
        }
    }

    /// Total number of combinations
    pub fn count_total(&self) -> u128 {
        binomial(self.n, self.k)
    }

    /// The combination with lexicographic rank `rank`
    pub fn unrank(n: usize, k: usize, mut rank: u128) -> Option<Vec<usize>> {
        if rank >= binomial(n, k) {
            return None;
        }
        let mut out = Vec::with_capacity(k);
        let mut candidate = 0;
        for slot in 0..k {
            loop {
                // combinations that start with `candidate` at this slot
                let with = binomial(n - candidate - 1, k - slot - 1);
                if rank < with {
                    break;
                }
                rank -= with;
                candidate += 1;
            }
            out.push(candidate);
            candidate += 1;
        }
        Some(out)
    }

    fn advance(current: &mut [usize], n: usize) -> bool {
        let k = current.len();
        for i in (0..k).rev() {
            if current[i] < n - k + i {
                current[i] += 1;
                for j in i + 1..k {
                    current[j] = current[j - 1] + 1;
                }
                return true;
            }
        }
        false
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut following = current.clone();
        if Self::advance(&mut following, self.n) {
            self.next = Some(following);
        }
        Some(current)
    }
}

// ============================================================================
// PROBLEM & SOLVERS
// ============================================================================

/// Flip `bits` in place; flipping twice restores the input
pub fn apply_flips(bytes: &mut [u8], bits: &[usize]) {
    for &bit in bits {
        if let Some(byte) = bytes.get_mut(bit / 8) {
            *byte ^= 1 << (bit % 8);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BruteForceProblem {
    /// Window to correct, a whole number of items
    pub initial: Vec<u8>,
    /// Width of one window item in bytes, e.g. 4 for a run of `u32` registers.
    ///
    /// Only validates the window shape and groups a solution's bits in
    /// [`BitFlipSolution::flipped_items`]; flips still range over every bit
    /// of the window, so the candidate sequence does not depend on it.
    pub item_size: usize,
    pub min_distance: usize,
    pub max_distance: usize,
}

/// The first accepted candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitFlipSolution {
    pub bits: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl BitFlipSolution {
    pub fn distance(&self) -> usize {
        self.bits.len()
    }

    /// Indices of the items a solution touches
    pub fn flipped_items(&self, item_size: usize) -> Vec<usize> {
        let mut items: Vec<usize> = self.bits.iter().map(|b| b / 8 / item_size.max(1)).collect();
        items.dedup();
        items
    }
}

impl BruteForceProblem {
    pub fn new(initial: impl Into<Vec<u8>>, max_distance: usize) -> Self {
        Self {
            initial: initial.into(),
            item_size: 1,
            min_distance: 0,
            max_distance,
        }
    }

    fn check_shape(&self) -> Result<(), BruteForceError> {
        if self.item_size == 0 {
            return Err(BruteForceError::ZeroItemSize);
        }
        if self.initial.len() % self.item_size != 0 {
            return Err(BruteForceError::WindowNotAligned {
                len: self.initial.len(),
                item_size: self.item_size,
            });
        }
        if self.min_distance > self.max_distance {
            return Err(BruteForceError::DistanceRange {
                min: self.min_distance,
                max: self.max_distance,
            });
        }
        Ok(())
    }

    pub fn bit_count(&self) -> usize {
        self.initial.len() * 8
    }

    /// Distances actually searched; flipping more bits than exist is skipped
    fn distances(&self) -> std::ops::RangeInclusive<usize> {
        self.min_distance..=self.max_distance.min(self.bit_count())
    }

    /// Number of candidates the search may evaluate
    pub fn candidate_count(&self) -> u128 {
        self.distances()
            .map(|d| binomial(self.bit_count(), d))
            .fold(0u128, |acc, c| acc.saturating_add(c))
    }

    /// Sequential search
    pub fn solve<F>(&self, check: F) -> Result<Option<BitFlipSolution>, BruteForceError>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.check_shape()?;
        let mut buf = self.initial.clone();
        for distance in self.distances() {
            trace!("bit flips at distance {}: {} candidates", distance, binomial(self.bit_count(), distance));
            for bits in Combinations::new(self.bit_count(), distance) {
                apply_flips(&mut buf, &bits);
                if check(&buf) {
                    return Ok(Some(BitFlipSolution { bits, bytes: buf }));
                }
                apply_flips(&mut buf, &bits);
            }
        }
        Ok(None)
    }

    /// Parallel search returning the same solution as [`solve`](Self::solve)
    pub fn solve_parallel<F>(&self, check: F) -> Result<Option<BitFlipSolution>, BruteForceError>
    where
        F: Fn(&[u8]) -> bool + Sync,
    {
        self.check_shape()?;
        let n = self.bit_count();
        for distance in self.distances() {
            let total = binomial(n, distance);
            let Ok(total) = usize::try_from(total) else {
                // too many to index; fall back to lazy sequential walking
                trace!("distance {} too large to split, searching sequentially", distance);
                let found = Combinations::new(n, distance).find_map(|bits| self.try_candidate(&check, bits));
                if found.is_some() {
                    return Ok(found);
                }
                continue;
            };
            trace!("bit flips at distance {}: {} candidates in parallel", distance, total);
            let found = (0..total).into_par_iter().find_map_first(|rank| {
                let bits = Combinations::unrank(n, distance, rank as u128)?;
                self.try_candidate(&check, bits)
            });
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn try_candidate<F>(&self, check: &F, bits: Vec<usize>) -> Option<BitFlipSolution>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut buf = self.initial.clone();
        apply_flips(&mut buf, &bits);
        check(&buf).then_some(BitFlipSolution { bits, bytes: buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(5, 0), 1);
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(64, 2), 2016);
        assert_eq!(binomial(3, 4), 0);
        assert_eq!(binomial(1000, 500), u128::MAX);
    }

    #[test]
    fn test_combinations_lexicographic() {
        let all: Vec<Vec<usize>> = Combinations::new(4, 2).collect();
        assert_eq!(
            all,
            vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]
        );
        assert_eq!(Combinations::new(3, 0).collect::<Vec<_>>(), vec![Vec::<usize>::new()]);
        assert_eq!(Combinations::new(2, 3).count(), 0);
    }

    #[test]
    fn test_unrank_matches_iteration() {
        for (rank, combination) in Combinations::new(7, 3).enumerate() {
            assert_eq!(Combinations::unrank(7, 3, rank as u128), Some(combination));
        }
        assert_eq!(Combinations::unrank(7, 3, 35), None);

        let rest: Vec<Vec<usize>> = Combinations::starting_at(5, 2, 7).collect();
        assert_eq!(rest, vec![vec![2, 3], vec![2, 4], vec![3, 4]]);
    }

    #[test]
    fn test_apply_flips_bit_order() {
        let mut bytes = [0u8; 2];
        apply_flips(&mut bytes, &[0, 9]);
        assert_eq!(bytes, [0x01, 0x02]);
        apply_flips(&mut bytes, &[0, 9]);
        assert_eq!(bytes, [0, 0]);
    }

    #[test]
    fn test_solve_finds_smallest_distance_first() {
        let target = [0b0000_0101u8, 0x00];
        let problem = BruteForceProblem::new(vec![0u8, 0], 3);
        let solution = problem.solve(|c| c == target).unwrap().unwrap();
        assert_eq!(solution.bits, vec![0, 2]);
        assert_eq!(solution.distance(), 2);
        assert_eq!(solution.bytes, target);

        // any single bit is accepted, the lowest rank wins
        let first = problem.solve(|c| c.iter().map(|b| b.count_ones()).sum::<u32>() == 1).unwrap();
        assert_eq!(first.unwrap().bits, vec![0]);
    }

    #[test]
    fn test_solve_exhaustion_is_none() {
        let problem = BruteForceProblem::new(vec![0u8], 1);
        assert_eq!(problem.solve(|c| c == [0xFF]).unwrap(), None);
        assert_eq!(problem.candidate_count(), 9);
    }

    #[test]
    fn test_parallel_agrees_with_sequential() {
        let problem = BruteForceProblem {
            initial: vec![0xAA; 8],
            item_size: 8,
            min_distance: 0,
            max_distance: 2,
        };
        let check = |c: &[u8]| c[3] == 0xAB || c[6] == 0x2A;
        let sequential = problem.solve(check).unwrap();
        let parallel = problem.solve_parallel(check).unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(sequential.unwrap().bits, vec![24]);
    }

    #[test]
    fn test_item_size_only_groups_bits() {
        let bytes = vec![0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let by_byte = BruteForceProblem::new(bytes.clone(), 2);
        let by_word = BruteForceProblem {
            item_size: 4,
            ..BruteForceProblem::new(bytes, 2)
        };
        assert_eq!(by_byte.candidate_count(), by_word.candidate_count());

        let check = |c: &[u8]| c[0] == 0x00 && c[5] == 0x01;
        let solution = by_word.solve(check).unwrap().unwrap();
        assert_eq!(Some(&solution), by_byte.solve(check).unwrap().as_ref());
        assert_eq!(solution.bits, vec![4, 40]);
        assert_eq!(solution.flipped_items(1), vec![0, 5]);
        assert_eq!(solution.flipped_items(4), vec![0, 1]);
    }

    #[test]
    fn test_shape_errors() {
        let mut problem = BruteForceProblem::new(vec![0u8; 6], 1);
        problem.item_size = 4;
        assert_eq!(
            problem.solve(|_| true).unwrap_err(),
            BruteForceError::WindowNotAligned { len: 6, item_size: 4 }
        );
        problem.item_size = 0;
        assert_eq!(problem.solve(|_| true).unwrap_err(), BruteForceError::ZeroItemSize);
        problem.item_size = 1;
        problem.min_distance = 2;
        assert!(matches!(problem.solve(|_| true), Err(BruteForceError::DistanceRange { .. })));
    }
}
