//! Pair batches and an in-memory batch source.

use crate::network::IMAGE_CHANNELS;
use candle::{Device, Result, Tensor};
use rand::prelude::*;

/// One mini-batch of image pairs.
#[derive(Clone, Debug)]
pub struct PairBatch {
    /// `(B, C, H, W)`
    pub left: Tensor,
    /// `(B, C, H, W)`
    pub right: Tensor,
    /// `(B,)` targets in `[0, 1]`.
    pub labels: Tensor,
    /// One identifier per example, written next to its prediction.
    pub ids: Vec<String>,
}

impl PairBatch {
    pub fn len(&self) -> Result<usize> {
        self.labels.dims1()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            left: self.left.to_device(device)?,
            right: self.right.to_device(device)?,
            labels: self.labels.to_device(device)?,
            ids: self.ids.clone(),
        })
    }
}

/// A dataset partition held in memory as stacked tensors.
#[derive(Clone, Debug)]
pub struct PairDataset {
    left: Tensor,
    right: Tensor,
    labels: Tensor,
    ids: Vec<String>,
}

impl PairDataset {
    pub fn new(left: Tensor, right: Tensor, labels: Tensor, ids: Vec<String>) -> Result<Self> {
        let n = labels.dims1()?;
        if left.dims4()?.0 != n || right.dims4()?.0 != n || ids.len() != n {
            candle::bail!(
                "pair dataset size mismatch: left {:?}, right {:?}, labels {n}, ids {}",
                left.shape(),
                right.shape(),
                ids.len()
            )
        }
        if left.shape() != right.shape() {
            candle::bail!(
                "left {:?} and right {:?} images differ in shape",
                left.shape(),
                right.shape()
            )
        }
        let labels = labels.to_dtype(candle::DType::F32)?;
        Ok(Self {
            left,
            right,
            labels,
            ids,
        })
    }

    /// Generates "changed patch" pairs: the right image is the left one with a
    /// random square patch repainted, and the label is the repainted fraction
    /// of the image. A label of zero means the two images are identical.
    pub fn synthetic<R: Rng>(
        n: usize,
        input_size: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let pixels = input_size * input_size;
        let mut left = Vec::with_capacity(n * IMAGE_CHANNELS * pixels);
        let mut right = Vec::with_capacity(n * IMAGE_CHANNELS * pixels);
        let mut labels = Vec::with_capacity(n);
        let mut ids = Vec::with_capacity(n);

        for idx in 0..n {
            let image: Vec<f32> = (0..IMAGE_CHANNELS * pixels).map(|_| rng.random()).collect();
            let mut changed = image.clone();
            let side = rng.random_range(0..=input_size);
            let top = rng.random_range(0..=input_size - side);
            let col = rng.random_range(0..=input_size - side);
            for c in 0..IMAGE_CHANNELS {
                for y in top..top + side {
                    for x in col..col + side {
                        changed[c * pixels + y * input_size + x] = rng.random();
                    }
                }
            }
            left.extend_from_slice(&image);
            right.extend_from_slice(&changed);
            labels.push((side * side) as f32 / pixels as f32);
            ids.push(format!("pair-{idx:05}"));
        }

        let shape = (n, IMAGE_CHANNELS, input_size, input_size);
        Self::new(
            Tensor::from_vec(left, shape, device)?,
            Tensor::from_vec(right, shape, device)?,
            Tensor::from_vec(labels, n, device)?,
            ids,
        )
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Splits the partition into batches of `batch_size`; the last batch holds
    /// whatever remains. With `shuffle` the examples are drawn in random order.
    pub fn batches<R: Rng>(
        &self,
        batch_size: usize,
        shuffle: Option<&mut R>,
    ) -> Result<Vec<PairBatch>> {
        if batch_size == 0 {
            candle::bail!("batch size must be positive")
        }
        let mut order: Vec<u32> = (0..self.len() as u32).collect();
        if let Some(rng) = shuffle {
            order.shuffle(rng);
        }

        let device = self.labels.device();
        let mut batches = Vec::with_capacity(self.len().div_ceil(batch_size));
        for chunk in order.chunks(batch_size) {
            let idx = Tensor::new(chunk, device)?;
            batches.push(PairBatch {
                left: self.left.index_select(&idx, 0)?,
                right: self.right.index_select(&idx, 0)?,
                labels: self.labels.index_select(&idx, 0)?,
                ids: chunk.iter().map(|&i| self.ids[i as usize].clone()).collect(),
            });
        }
        Ok(batches)
    }

    /// Batches in storage order.
    pub fn sequential_batches(&self, batch_size: usize) -> Result<Vec<PairBatch>> {
        self.batches::<StdRng>(batch_size, None)
    }
}

/// Supplies the batches of one phase, once per epoch.
pub trait BatchSource {
    fn batches(&mut self, epoch: usize) -> Result<Vec<PairBatch>>;
}

impl BatchSource for Vec<PairBatch> {
    fn batches(&mut self, _epoch: usize) -> Result<Vec<PairBatch>> {
        Ok(self.clone())
    }
}

/// Re-batches a [`PairDataset`] every epoch, reshuffling when it owns an rng.
pub struct PairLoader<R = StdRng> {
    dataset: PairDataset,
    batch_size: usize,
    rng: Option<R>,
}

impl PairLoader<StdRng> {
    pub fn sequential(dataset: PairDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size,
            rng: None,
        }
    }
}

impl<R: Rng> PairLoader<R> {
    pub fn shuffled(dataset: PairDataset, batch_size: usize, rng: R) -> Self {
        Self {
            dataset,
            batch_size,
            rng: Some(rng),
        }
    }

    pub fn dataset(&self) -> &PairDataset {
        &self.dataset
    }
}

impl<R: Rng> BatchSource for PairLoader<R> {
    fn batches(&mut self, _epoch: usize) -> Result<Vec<PairBatch>> {
        self.dataset.batches(self.batch_size, self.rng.as_mut())
    }
}
