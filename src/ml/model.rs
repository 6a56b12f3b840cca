//! Convolutional skip-segment classifier.
//!
//! Four conv stages (32, 64, 128, 128 channels) of conv 3x3 + batch norm +
//! ReLU + 2x max pool, global average pooling, then a small dropout MLP head
//! producing opening/ending/content logits.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Dropout, Linear,
    VarBuilder, VarMap,
};
use ndarray::ArrayView2;
use std::path::Path;

use super::SegmentClass;

const STAGE_CHANNELS: [usize; 4] = [32, 64, 128, 128];
const HIDDEN: usize = 64;

/// dB offset and scale bringing `[-80, 0]` spectrograms to roughly `[-1, 1]`.
const DB_OFFSET: f64 = 40.0;
const DB_SCALE: f64 = 40.0;

/// `(x + 40) / 40`. Training and inference both go through this.
pub fn normalize_db(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.affine(1.0 / DB_SCALE, DB_OFFSET / DB_SCALE)
}

struct ConvStage {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvStage {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?,
            bn: batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.bn.forward_t(&xs, train)?;
        xs.relu()?.max_pool2d(2)
    }
}

pub struct SkipSegmentCnn {
    stages: Vec<ConvStage>,
    fc1: Linear,
    fc2: Linear,
    dropout1: Dropout,
    dropout2: Dropout,
}

impl SkipSegmentCnn {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let mut stages = Vec::with_capacity(STAGE_CHANNELS.len());
        let mut in_channels = 1;
        for (i, &out_channels) in STAGE_CHANNELS.iter().enumerate() {
            stages.push(ConvStage::new(in_channels, out_channels, vb.pp(format!("stage{}", i)))?);
            in_channels = out_channels;
        }

        Ok(Self {
            stages,
            fc1: linear(in_channels, HIDDEN, vb.pp("fc1"))?,
            fc2: linear(HIDDEN, SegmentClass::COUNT, vb.pp("fc2"))?,
            dropout1: Dropout::new(0.3),
            dropout2: Dropout::new(0.2),
        })
    }
}

impl ModuleT for SkipSegmentCnn {
    /// `xs`: normalized windows `[batch, 1, mels, frames]`; returns logits
    /// `[batch, 3]`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for stage in &self.stages {
            xs = stage.forward_t(&xs, train)?;
        }
        // Global average pool over (mels, frames)
        let xs = xs.mean((2, 3))?;
        let xs = self.dropout1.forward_t(&xs, train)?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        let xs = self.dropout2.forward_t(&xs, train)?;
        self.fc2.forward(&xs)
    }
}

/// A classifier together with the variables backing it.
pub struct ModelHandle {
    pub varmap: VarMap,
    pub model: SkipSegmentCnn,
    pub device: Device,
}

impl ModelHandle {
    /// Freshly initialized weights.
    pub fn fresh(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = SkipSegmentCnn::new(vb).context("building classifier")?;
        Ok(Self {
            varmap,
            model,
            device: device.clone(),
        })
    }

    /// Weights loaded from a checkpoint file.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut handle = Self::fresh(device)?;
        handle
            .varmap
            .load(path)
            .with_context(|| format!("loading checkpoint {:?}", path))?;
        Ok(handle)
    }

    /// Write the checkpoint to a temporary file and rename it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("safetensors.tmp");
        self.varmap
            .save(&tmp)
            .with_context(|| format!("writing checkpoint {:?}", tmp))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing checkpoint {:?}", path))?;
        Ok(())
    }

    /// Class probabilities `[n, 3]` for a batch of dB windows.
    pub fn predict(&self, windows: &[ArrayView2<'_, f32>]) -> Result<Vec<[f32; 3]>> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let xs = windows_to_tensor(windows, &self.device)?;
        let logits = self.model.forward_t(&normalize_db(&xs)?, false)?;
        let probs = candle_nn::ops::softmax(&logits, 1)?.to_vec2::<f32>()?;
        Ok(probs.into_iter().map(|p| [p[0], p[1], p[2]]).collect())
    }
}

/// Stack equally shaped windows into a `[n, 1, mels, frames]` tensor.
pub fn windows_to_tensor(windows: &[ArrayView2<'_, f32>], device: &Device) -> Result<Tensor> {
    let (mels, frames) = windows
        .first()
        .map(|w| w.dim())
        .context("no windows to stack")?;
    let mut flat = Vec::with_capacity(windows.len() * mels * frames);
    for w in windows {
        anyhow::ensure!(
            w.dim() == (mels, frames),
            "window shape {:?} differs from {:?}",
            w.dim(),
            (mels, frames)
        );
        flat.extend(w.iter().copied());
    }
    Ok(Tensor::from_vec(flat, (windows.len(), 1, mels, frames), device)?)
}
