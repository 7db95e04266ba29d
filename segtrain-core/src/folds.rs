use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// Assigns every sample to one of `total_folds` folds, keeping the proportion
/// of each stratum roughly equal across folds.
///
/// Samples sharing a stratum are shuffled with `seed` and dealt round-robin;
/// the dealer keeps going across strata so fold sizes differ by at most one.
pub fn fold_assignment(strata: &[usize], total_folds: usize, seed: u64) -> Result<Vec<usize>> {
    if total_folds < 2 {
        return Err(Error::Config(format!(
            "cross-validation needs at least 2 folds, got {total_folds}"
        )));
    }
    if strata.len() < total_folds {
        return Err(Error::Config(format!(
            "cannot split {} samples into {total_folds} folds",
            strata.len()
        )));
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, stratum) in strata.iter().enumerate() {
        groups.entry(*stratum).or_default().push(index);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut assignment = vec![0; strata.len()];
    let mut dealt = 0usize;
    for indices in groups.values_mut() {
        indices.shuffle(&mut rng);
        for &index in indices.iter() {
            assignment[index] = dealt % total_folds;
            dealt += 1;
        }
    }
    Ok(assignment)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

impl FoldSplit {
    pub fn new(strata: &[usize], fold: usize, total_folds: usize, seed: u64) -> Result<Self> {
        if fold >= total_folds {
            return Err(Error::Config(format!(
                "fold {fold} is out of range for {total_folds} folds"
            )));
        }
        let assignment = fold_assignment(strata, total_folds, seed)?;
        let (val, train): (Vec<_>, Vec<_>) = (0..strata.len()).partition(|&i| assignment[i] == fold);
        Ok(Self { train, val })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strata() -> Vec<usize> {
        (0..103).map(|i| [0, 1, 1, 2, 2, 2, 3][i % 7]).collect()
    }

    #[test]
    fn folds_partition_every_sample() {
        let strata = strata();
        let mut seen = vec![0; strata.len()];
        for fold in 0..5 {
            let split = FoldSplit::new(&strata, fold, 5, 42).unwrap();
            assert_eq!(split.train.len() + split.val.len(), strata.len());
            for &i in &split.val {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn folds_are_balanced_in_size_and_strata() {
        let strata = strata();
        let assignment = fold_assignment(&strata, 5, 7).unwrap();
        let sizes = (0..5)
            .map(|f| assignment.iter().filter(|&&a| a == f).count())
            .collect::<Vec<_>>();
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1, "fold sizes {sizes:?}");

        for stratum in 0..4 {
            let per_fold = (0..5)
                .map(|f| {
                    strata
                        .iter()
                        .zip(&assignment)
                        .filter(|&(&s, &a)| s == stratum && a == f)
                        .count()
                })
                .collect::<Vec<_>>();
            let (min, max) = (per_fold.iter().min().unwrap(), per_fold.iter().max().unwrap());
            assert!(max - min <= 1, "stratum {stratum}: {per_fold:?}");
        }
    }

    #[test]
    fn assignment_depends_only_on_seed() {
        let strata = strata();
        assert_eq!(
            fold_assignment(&strata, 4, 3).unwrap(),
            fold_assignment(&strata, 4, 3).unwrap()
        );
        assert_ne!(
            fold_assignment(&strata, 4, 3).unwrap(),
            fold_assignment(&strata, 4, 4).unwrap()
        );
    }

    #[test]
    fn rejects_degenerate_configurations() {
        assert!(fold_assignment(&[0, 1, 2], 1, 0).is_err());
        assert!(fold_assignment(&[0, 1], 3, 0).is_err());
        assert!(FoldSplit::new(&strata(), 5, 5, 0).is_err());
    }
}
