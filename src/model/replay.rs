// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/model/replay.rs - 回放已录制的模型输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::VecDeque;
use std::path::PathBuf;

use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ConfigError,
  model::{BackendKind, ExecutionMode, Model, PredictionError, RawPrediction},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("录制文件解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("录制批次 {batch} 格式错误: {reason}")]
  Malformed { batch: usize, reason: String },
  #[error("预测错误: {0}")]
  Prediction(#[from] PredictionError),
  #[error("录制输出已耗尽，已回放 {served} 个批次")]
  Exhausted { served: usize },
  #[error("批次样本数不匹配: 输入 {input}, 录制 {recorded}")]
  BatchMismatch { input: usize, recorded: usize },
  #[error("输入尺寸 {found:?} 与固定尺寸 {expected:?} 不一致")]
  InputShape {
    expected: (u32, u32),
    found: (usize, usize),
  },
}

/// 单个批次的录制输出，每个样本一行
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordedBatch {
  pub scores: Vec<Vec<f32>>,
  pub boxes: Vec<Vec<[f32; 4]>>,
  pub classes: Vec<Vec<i64>>,
}

impl RecordedBatch {
  fn into_prediction(self, batch: usize) -> Result<RawPrediction, ReplayError> {
    let malformed = |reason: String| ReplayError::Malformed { batch, reason };

    let n = self.scores.len();
    if self.boxes.len() != n || self.classes.len() != n {
      return Err(malformed(format!(
        "样本数不一致: scores {}, boxes {}, classes {}",
        n,
        self.boxes.len(),
        self.classes.len()
      )));
    }
    let k = self.scores.first().map(Vec::len).unwrap_or(0);
    for (i, ((s, b), c)) in self
      .scores
      .iter()
      .zip(&self.boxes)
      .zip(&self.classes)
      .enumerate()
    {
      if s.len() != k || b.len() != k || c.len() != k {
        return Err(malformed(format!("样本 {} 的候选框数与首个样本 ({}) 不一致", i, k)));
      }
    }

    let scores = Array2::from_shape_vec((n, k), self.scores.concat())
      .map_err(|e| malformed(e.to_string()))?;
    let boxes = Array3::from_shape_vec(
      (n, k, 4),
      self.boxes.concat().into_iter().flatten().collect(),
    )
    .map_err(|e| malformed(e.to_string()))?;
    let classes = Array2::from_shape_vec((n, k), self.classes.concat())
      .map_err(|e| malformed(e.to_string()))?;

    Ok(RawPrediction::new(scores, boxes, classes)?)
  }
}

/// 录制文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recording {
  #[serde(default = "default_stride")]
  pub stride: u32,
  /// 固定输入尺寸 [高, 宽]
  #[serde(default)]
  pub input_size: Option<[u32; 2]>,
  pub batches: Vec<RecordedBatch>,
}

fn default_stride() -> u32 {
  1
}

/// 按调用顺序回放录制输出的模型
pub struct ReplayModel {
  backend: BackendKind,
  stride: u32,
  input_size: Option<(u32, u32)>,
  mode: ExecutionMode,
  batches: VecDeque<RawPrediction>,
  served: usize,
}

impl ReplayModel {
  pub fn new(
    backend: BackendKind,
    stride: u32,
    input_size: Option<(u32, u32)>,
    batches: impl IntoIterator<Item = RawPrediction>,
  ) -> Self {
    Self {
      backend,
      stride: stride.max(1),
      input_size,
      mode: ExecutionMode::default(),
      batches: batches.into_iter().collect(),
      served: 0,
    }
  }

  pub fn from_recording(backend: BackendKind, recording: Recording) -> Result<Self, ReplayError> {
    let batches = recording
      .batches
      .into_iter()
      .enumerate()
      .map(|(i, batch)| batch.into_prediction(i))
      .collect::<Result<Vec<_>, _>>()?;
    let input_size = recording.input_size.map(|[h, w]| (h, w));
    Ok(Self::new(backend, recording.stride, input_size, batches))
  }

  /// 尚未回放的批次数
  pub fn remaining(&self) -> usize {
    self.batches.len()
  }
}

impl Model for ReplayModel {
  type Error = ReplayError;

  fn backend(&self) -> BackendKind {
    self.backend
  }

  fn stride(&self) -> u32 {
    self.stride
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    self.input_size
  }

  fn execution_mode(&self) -> ExecutionMode {
    self.mode
  }

  fn set_execution_mode(&mut self, mode: ExecutionMode) {
    self.mode = mode;
  }

  fn forward(
    &mut self,
    input: &Array4<f32>,
    mode: &ExecutionMode,
  ) -> Result<RawPrediction, Self::Error> {
    debug!("回放第 {} 个批次，执行模式 {:?}", self.served, mode);
    let (n, _, h, w) = input.dim();
    if let Some(expected) = self.input_size.filter(|_| self.backend.has_fixed_input())
      && (h, w) != (expected.0 as usize, expected.1 as usize)
    {
      error!("输入尺寸 {}x{} 与引擎尺寸 {:?} 不一致", h, w, expected);
      return Err(ReplayError::InputShape {
        expected,
        found: (h, w),
      });
    }

    let prediction = self.batches.pop_front().ok_or(ReplayError::Exhausted {
      served: self.served,
    })?;
    if prediction.samples() != n {
      return Err(ReplayError::BatchMismatch {
        input: n,
        recorded: prediction.samples(),
      });
    }
    self.served += 1;
    Ok(prediction)
  }
}

pub struct ReplayModelBuilder {
  path: PathBuf,
  backend: BackendKind,
}

impl FromUrlWithScheme for ReplayModelBuilder {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModelBuilder {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch);
    }

    let backend = match url.query_pairs().find(|(k, _)| k == "backend") {
      Some((_, v)) => v.parse()?,
      None => BackendKind::Native,
    };

    Ok(ReplayModelBuilder {
      path: PathBuf::from(url.path()),
      backend,
    })
  }
}

impl ReplayModelBuilder {
  pub fn backend(&self) -> BackendKind {
    self.backend
  }

  pub fn build(self) -> Result<ReplayModel, ReplayError> {
    info!("加载录制文件: {}", self.path.display());
    let data = std::fs::read(&self.path)?;
    let recording: Recording = serde_json::from_slice(&data)?;
    debug!(
      "录制批次数: {}, 步长: {}, 固定尺寸: {:?}",
      recording.batches.len(),
      recording.stride,
      recording.input_size
    );
    let model = ReplayModel::from_recording(self.backend, recording)?;
    info!("模型加载完成，后端: {}", model.backend());
    Ok(model)
  }
}
