// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/model.rs - 模型接口与原始预测
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

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, s};
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;

/// 推理后端类型，在构造时确定一次，之后显式传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
  /// 支持任意输入尺寸的原生后端
  Native,
  /// 输入尺寸固定的编译引擎
  Engine,
}

impl BackendKind {
  pub fn name(&self) -> &'static str {
    match self {
      BackendKind::Native => "native",
      BackendKind::Engine => "engine",
    }
  }

  /// 引擎后端只接受固定尺寸输入
  pub fn has_fixed_input(&self) -> bool {
    matches!(self, BackendKind::Engine)
  }
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for BackendKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "native" => Ok(BackendKind::Native),
      "engine" => Ok(BackendKind::Engine),
      _ => Err(ConfigError::UnknownBackend(s.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
  Full,
  Mixed,
}

impl fmt::Display for Precision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Precision::Full => f.write_str("full"),
      Precision::Mixed => f.write_str("mixed"),
    }
  }
}

/// 模型执行模式，每次前向调用都会显式传入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionMode {
  /// 是否记录梯度
  pub gradients: bool,
  pub precision: Precision,
}

impl ExecutionMode {
  pub fn inference(precision: Precision) -> Self {
    Self {
      gradients: false,
      precision,
    }
  }
}

impl Default for ExecutionMode {
  fn default() -> Self {
    Self {
      gradients: true,
      precision: Precision::Full,
    }
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum PredictionError {
  #[error("预测张量形状不一致: scores {scores:?}, boxes {boxes:?}, classes {classes:?}")]
  ShapeMismatch {
    scores: Vec<usize>,
    boxes: Vec<usize>,
    classes: Vec<usize>,
  },
}

/// 单个批次的原始模型输出
///
/// `scores` 为 `N×K`，`boxes` 为 `N×K×4`（x1, y1, x2, y2，缩放后坐标），
/// `classes` 为 `N×K`。三者行数必须一致。
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
  scores: Array2<f32>,
  boxes: Array3<f32>,
  classes: Array2<i64>,
}

impl RawPrediction {
  pub fn new(
    scores: Array2<f32>,
    boxes: Array3<f32>,
    classes: Array2<i64>,
  ) -> Result<Self, PredictionError> {
    let (n, k) = scores.dim();
    if boxes.dim() != (n, k, 4) || classes.dim() != (n, k) {
      return Err(PredictionError::ShapeMismatch {
        scores: scores.shape().to_vec(),
        boxes: boxes.shape().to_vec(),
        classes: classes.shape().to_vec(),
      });
    }
    Ok(Self {
      scores,
      boxes,
      classes,
    })
  }

  pub fn empty() -> Self {
    Self {
      scores: Array2::zeros((0, 0)),
      boxes: Array3::zeros((0, 0, 4)),
      classes: Array2::zeros((0, 0)),
    }
  }

  /// 样本数 N
  pub fn samples(&self) -> usize {
    self.scores.nrows()
  }

  /// 每个样本的候选框数 K
  pub fn candidates(&self) -> usize {
    self.scores.ncols()
  }

  pub fn scores(&self) -> ArrayView2<'_, f32> {
    self.scores.view()
  }

  pub fn boxes(&self) -> ArrayView3<'_, f32> {
    self.boxes.view()
  }

  pub fn classes(&self) -> ArrayView2<'_, i64> {
    self.classes.view()
  }

  pub fn into_parts(self) -> (Array2<f32>, Array3<f32>, Array2<i64>) {
    (self.scores, self.boxes, self.classes)
  }

  /// 沿样本轴拼接
  ///
  /// K 不同的部分以零分数行补齐到最大 K，零分数行不会通过解码阈值。
  pub fn concat<'a, I>(parts: I) -> Self
  where
    I: IntoIterator<Item = &'a RawPrediction>,
    I::IntoIter: Clone,
  {
    let parts = parts.into_iter();
    let samples: usize = parts.clone().map(RawPrediction::samples).sum();
    let candidates = parts
      .clone()
      .map(RawPrediction::candidates)
      .max()
      .unwrap_or(0);

    let mut scores = Array2::<f32>::zeros((samples, candidates));
    let mut boxes = Array3::<f32>::zeros((samples, candidates, 4));
    let mut classes = Array2::<i64>::zeros((samples, candidates));

    let mut row = 0;
    for part in parts {
      let (n, k) = (part.samples(), part.candidates());
      scores
        .slice_mut(s![row..row + n, ..k])
        .assign(&part.scores);
      boxes
        .slice_mut(s![row..row + n, ..k, ..])
        .assign(&part.boxes);
      classes
        .slice_mut(s![row..row + n, ..k])
        .assign(&part.classes);
      row += n;
    }

    Self {
      scores,
      boxes,
      classes,
    }
  }
}

pub trait Model {
  type Error;

  fn backend(&self) -> BackendKind;

  /// 输入尺寸需要对齐到的步长
  fn stride(&self) -> u32;

  /// 固定输入尺寸 (高, 宽)，仅引擎后端提供
  fn input_size(&self) -> Option<(u32, u32)> {
    None
  }

  fn execution_mode(&self) -> ExecutionMode;

  fn set_execution_mode(&mut self, mode: ExecutionMode);

  fn forward(
    &mut self,
    input: &Array4<f32>,
    mode: &ExecutionMode,
  ) -> Result<RawPrediction, Self::Error>;
}

impl<M: Model + ?Sized> Model for &mut M {
  type Error = M::Error;

  fn backend(&self) -> BackendKind {
    (**self).backend()
  }

  fn stride(&self) -> u32 {
    (**self).stride()
  }

  fn input_size(&self) -> Option<(u32, u32)> {
    (**self).input_size()
  }

  fn execution_mode(&self) -> ExecutionMode {
    (**self).execution_mode()
  }

  fn set_execution_mode(&mut self, mode: ExecutionMode) {
    (**self).set_execution_mode(mode)
  }

  fn forward(
    &mut self,
    input: &Array4<f32>,
    mode: &ExecutionMode,
  ) -> Result<RawPrediction, Self::Error> {
    (**self).forward(input, mode)
  }
}

/// 执行模式作用域
///
/// 创建时切换模型的执行模式，析构时恢复原模式，出错提前返回时同样恢复。
pub struct ModeScope<'m, M: Model + ?Sized> {
  model: &'m mut M,
  mode: ExecutionMode,
  previous: ExecutionMode,
}

impl<'m, M: Model + ?Sized> ModeScope<'m, M> {
  pub fn enter(model: &'m mut M, mode: ExecutionMode) -> Self {
    let previous = model.execution_mode();
    model.set_execution_mode(mode);
    debug!("进入执行模式 {:?}，原模式 {:?}", mode, previous);
    Self {
      model,
      mode,
      previous,
    }
  }

  pub fn mode(&self) -> ExecutionMode {
    self.mode
  }

  pub fn forward(&mut self, input: &Array4<f32>) -> Result<RawPrediction, M::Error> {
    self.model.forward(input, &self.mode)
  }
}

impl<M: Model + ?Sized> Drop for ModeScope<'_, M> {
  fn drop(&mut self) {
    self.model.set_execution_mode(self.previous);
    debug!("恢复执行模式 {:?}", self.previous);
  }
}

#[cfg(feature = "model_replay")]
mod replay;
#[cfg(feature = "model_replay")]
pub use self::replay::{RecordedBatch, Recording, ReplayError, ReplayModel, ReplayModelBuilder};
