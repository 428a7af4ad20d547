use crate::{Dataset, Subset};
use apteryx_core::Shuffle;
use rand::seq::SliceRandom;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("train fraction must be strictly between 0 and 1, got {0}")]
    InvalidFraction(f64),
}

/// `(n_train, n_val)` for a dataset of `len` examples, with `n_train = floor(len * train_pct)`.
pub fn split_lengths(len: usize, train_pct: f64) -> Result<(usize, usize), SplitError> {
    if !(train_pct > 0.0 && train_pct < 1.0) {
        return Err(SplitError::InvalidFraction(train_pct));
    }
    let n_train = (len as f64 * train_pct).floor() as usize;
    Ok((n_train, len - n_train))
}

/// Partitions `dataset` into disjoint train and eval subsets that together cover every index.
///
/// The permutation is reproducible when `shuffle` carries a seed.
pub fn random_split<D: Dataset>(
    dataset: Arc<D>,
    train_pct: f64,
    shuffle: Shuffle,
) -> Result<(Subset<D>, Subset<D>), SplitError> {
    let (n_train, n_val) = split_lengths(dataset.len(), train_pct)?;
    info!("Training on {n_train} examples;");
    info!("Validating on {n_val} examples.");

    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    indices.shuffle(&mut shuffle.rng());
    let eval_indices = indices.split_off(n_train);

    Ok((
        Subset::new(dataset.clone(), indices),
        Subset::new(dataset, eval_indices),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashSet;

    struct Range(usize);

    impl Dataset for Range {
        type Item = usize;

        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize) -> Result<usize> {
            Ok(index)
        }
    }

    #[rstest]
    #[case(10, 0.8, (8, 2))]
    #[case(7, 0.5, (3, 4))]
    #[case(0, 0.8, (0, 0))]
    #[case(1, 0.99, (0, 1))]
    #[case(1000, 0.001, (1, 999))]
    fn lengths_sum_to_total(#[case] len: usize, #[case] pct: f64, #[case] expected: (usize, usize)) {
        let lengths = split_lengths(len, pct).unwrap();
        assert_eq!(lengths, expected);
        assert_eq!(lengths.0 + lengths.1, len);
    }

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(-0.2)]
    #[case(1.5)]
    #[case(f64::NAN)]
    fn fraction_outside_unit_interval_is_rejected(#[case] pct: f64) {
        assert!(matches!(
            split_lengths(10, pct),
            Err(SplitError::InvalidFraction(_))
        ));
    }

    #[test]
    fn splits_are_disjoint_and_cover_dataset() {
        let (train, eval) = random_split(Arc::new(Range(103)), 0.8, Shuffle::Unseeded).unwrap();
        assert_eq!(train.len(), 82);
        assert_eq!(eval.len(), 21);

        let train_set: HashSet<usize> = (0..train.len()).map(|i| train.get(i).unwrap()).collect();
        let eval_set: HashSet<usize> = (0..eval.len()).map(|i| eval.get(i).unwrap()).collect();
        assert!(train_set.is_disjoint(&eval_set));
        assert_eq!(train_set.len() + eval_set.len(), 103);
        assert_eq!(
            train_set.union(&eval_set).copied().collect::<HashSet<_>>(),
            (0..103).collect::<HashSet<_>>()
        );
    }

    #[test]
    fn seeded_split_is_reproducible() {
        let dataset = Arc::new(Range(50));
        let (a, _) = random_split(dataset.clone(), 0.6, Shuffle::from_u64(3)).unwrap();
        let (b, _) = random_split(dataset.clone(), 0.6, Shuffle::from_u64(3)).unwrap();
        let (c, _) = random_split(dataset, 0.6, Shuffle::from_u64(4)).unwrap();
        assert_eq!(a.indices(), b.indices());
        assert_ne!(a.indices(), c.indices());
    }
}
