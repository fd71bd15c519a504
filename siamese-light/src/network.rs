//! Reference quasi-siamese network.
//!
//! Both images go through the same convolutional encoder; the two encodings
//! are concatenated and a small head regresses a similarity score in `[0, 1]`.

use crate::PairModule;
use candle::{DType, Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{ops, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder, VarMap};

pub const IMAGE_CHANNELS: usize = 3;
const HIDDEN_CHANNELS: usize = 16;
const ENCODING_CHANNELS: usize = 32;
const HEAD_HIDDEN: usize = 32;

/// Shared-weight convolutional encoder.
struct Encoder {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl Encoder {
    fn new(vs: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(IMAGE_CHANNELS, HIDDEN_CHANNELS, 3, cfg, vs.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(HIDDEN_CHANNELS, ENCODING_CHANNELS, 3, cfg, vs.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // Global average pooling keeps the head independent of the input size.
        xs.apply(&self.conv1)?
            .relu()?
            .max_pool2d(2)?
            .apply(&self.conv2)?
            .relu()?
            .max_pool2d(2)?
            .mean(D::Minus1)?
            .mean(D::Minus1)
    }
}

pub struct SiameseNetwork {
    encoder: Encoder,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
    input_size: usize,
    varmap: VarMap,
    training: bool,
}

impl SiameseNetwork {
    /// Builds a freshly initialised network for square `input_size` images.
    pub fn new(input_size: usize, dropout: f32, device: &Device) -> Result<Self> {
        if input_size < 4 {
            candle::bail!("input size {input_size} is too small, need at least 4 pixels")
        }
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = Encoder::new(vs.pp("encoder"))?;
        let fc1 = candle_nn::linear(2 * ENCODING_CHANNELS, HEAD_HIDDEN, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(HEAD_HIDDEN, 1, vs.pp("fc2"))?;
        Ok(Self {
            encoder,
            fc1,
            fc2,
            dropout: Dropout::new(dropout),
            input_size,
            varmap,
            training: true,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn check_input(&self, xs: &Tensor) -> Result<()> {
        let (_, c, h, w) = xs.dims4()?;
        if c != IMAGE_CHANNELS || h != self.input_size || w != self.input_size {
            candle::bail!(
                "expected images of shape (_, {IMAGE_CHANNELS}, {s}, {s}), got {:?}",
                xs.shape(),
                s = self.input_size
            )
        }
        Ok(())
    }
}

impl PairModule for SiameseNetwork {
    fn forward(&self, left: &Tensor, right: &Tensor) -> Result<Tensor> {
        self.check_input(left)?;
        self.check_input(right)?;
        let left = self.encoder.forward(left)?;
        let right = self.encoder.forward(right)?;
        let xs = Tensor::cat(&[&left, &right], 1)?.apply(&self.fc1)?.relu()?;
        let xs = self.dropout.forward_t(&xs, self.training)?.apply(&self.fc2)?;
        ops::sigmoid(&xs)?.squeeze(1)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}
