use crate::Dataset;
use anyhow::{anyhow, Result};
use std::{
    collections::BTreeMap,
    sync::{mpsc, Arc},
    thread::JoinHandle,
};
use tracing::{debug, trace};

/// Turns a group of dataset examples into a single model input.
pub trait Collator<T>: Send + Sync {
    type Batch: Send;

    fn collate(&self, items: Vec<T>) -> Result<Self::Batch>;
}

type BatchResult<B> = (usize, Result<B>);

enum Source<D: Dataset, C: Collator<D::Item>> {
    Inline {
        dataset: Arc<D>,
        collator: Arc<C>,
    },
    Workers {
        rx: mpsc::Receiver<BatchResult<C::Batch>>,
        pending: BTreeMap<usize, Result<C::Batch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Iterates over `order` in chunks of `batch_size`, yielding collated batches in order.
///
/// With `num_workers > 0` batches are collated ahead of time on that many threads.
pub struct DataLoader<D: Dataset, C: Collator<D::Item>> {
    batches: Arc<Vec<Vec<usize>>>,
    next: usize,
    source: Source<D, C>,
}

fn load_batch<D: Dataset, C: Collator<D::Item>>(
    dataset: &D,
    collator: &C,
    indices: &[usize],
) -> Result<C::Batch> {
    let items = indices
        .iter()
        .map(|index| dataset.get(*index))
        .collect::<Result<Vec<_>>>()?;
    collator.collate(items)
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset + 'static,
    C: Collator<D::Item> + 'static,
{
    pub fn new(
        dataset: Arc<D>,
        collator: Arc<C>,
        order: Vec<usize>,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        let batches: Arc<Vec<Vec<usize>>> =
            Arc::new(order.chunks(batch_size).map(|x| x.to_vec()).collect());

        let source = match num_workers {
            0 => Source::Inline { dataset, collator },
            num_workers => {
                debug!(num_workers, num_batches = batches.len(), "Starting prefetch workers");
                let (tx, rx) = mpsc::sync_channel(num_workers * 2);
                let handles = (0..num_workers)
                    .map(|worker| {
                        let tx = tx.clone();
                        let dataset = dataset.clone();
                        let collator = collator.clone();
                        let batches = batches.clone();
                        std::thread::spawn(move || {
                            for index in (worker..batches.len()).step_by(num_workers) {
                                let batch = load_batch(&*dataset, &*collator, &batches[index]);
                                if tx.send((index, batch)).is_err() {
                                    // loader dropped
                                    return;
                                }
                            }
                        })
                    })
                    .collect();
                Source::Workers {
                    rx,
                    pending: BTreeMap::new(),
                    handles,
                }
            }
        };

        Ok(Self {
            batches,
            next: 0,
            source,
        })
    }
}

impl<D: Dataset, C: Collator<D::Item>> DataLoader<D, C> {
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

impl<D: Dataset, C: Collator<D::Item>> Iterator for DataLoader<D, C> {
    type Item = Result<C::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.batches.len() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        match &mut self.source {
            Source::Inline { dataset, collator } => {
                Some(load_batch(&**dataset, &**collator, &self.batches[index]))
            }
            Source::Workers { rx, pending, .. } => loop {
                if let Some(batch) = pending.remove(&index) {
                    return Some(batch);
                }
                match rx.recv() {
                    Ok((received, batch)) => {
                        trace!(batch = received, "Prefetched batch");
                        pending.insert(received, batch);
                    }
                    Err(_) => {
                        return Some(Err(anyhow!(
                            "prefetch workers exited before producing batch {index}"
                        )))
                    }
                }
            },
        }
    }
}

impl<D: Dataset, C: Collator<D::Item>> Drop for DataLoader<D, C> {
    fn drop(&mut self) {
        if let Source::Workers { rx, handles, .. } = &mut self.source {
            // closing the receiver unblocks any worker stuck in send
            let (_, dead_rx) = mpsc::sync_channel(0);
            drop(std::mem::replace(rx, dead_rx));
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    struct Numbers(usize);

    impl Dataset for Numbers {
        type Item = usize;

        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize) -> Result<usize> {
            match index < self.0 {
                true => Ok(index),
                false => Err(anyhow!("no item {index}")),
            }
        }
    }

    struct Identity;

    impl Collator<usize> for Identity {
        type Batch = Vec<usize>;

        fn collate(&self, items: Vec<usize>) -> Result<Vec<usize>> {
            Ok(items)
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn yields_batches_in_order(#[case] num_workers: usize) {
        let order: Vec<usize> = (0..10).rev().collect();
        let loader =
            DataLoader::new(Arc::new(Numbers(10)), Arc::new(Identity), order, 4, num_workers).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<Vec<usize>> = loader.map(|x| x.unwrap()).collect();
        assert_eq!(
            batches,
            vec![vec![9, 8, 7, 6], vec![5, 4, 3, 2], vec![1, 0]]
        );
    }

    #[test]
    fn dataset_errors_surface_per_batch() {
        let loader =
            DataLoader::new(Arc::new(Numbers(2)), Arc::new(Identity), vec![0, 1, 5], 2, 2).unwrap();
        let results: Vec<_> = loader.collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn dropping_early_stops_workers() {
        let mut loader = DataLoader::new(
            Arc::new(Numbers(1000)),
            Arc::new(Identity),
            (0..1000).collect(),
            1,
            4,
        )
        .unwrap();
        assert_eq!(loader.next().unwrap().unwrap(), vec![0]);
        drop(loader);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(DataLoader::new(Arc::new(Numbers(3)), Arc::new(Identity), vec![0], 0, 0).is_err());
    }
}
