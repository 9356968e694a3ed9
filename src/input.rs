// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input.rs - 批次数据源
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

use ndarray::Array4;
use thiserror::Error;

use crate::manifest::Manifest;

#[cfg(feature = "read_image_file")]
mod image_directory;
#[cfg(feature = "read_image_file")]
pub use self::image_directory::{ImageDirectory, ImageDirectoryError, ResizeOptions};

#[derive(Error, Debug, PartialEq)]
pub enum BatchError {
  #[error("批次张量含 {samples} 个样本，但 ids {ids} 个、ratios {ratios} 个")]
  LengthMismatch {
    samples: usize,
    ids: usize,
    ratios: usize,
  },
}

/// 一个输入批次：NCHW 张量、图片 id 与每张图片的缩放比例
#[derive(Debug, Clone)]
pub struct Batch {
  data: Array4<f32>,
  ids: Vec<i64>,
  ratios: Vec<f32>,
}

impl Batch {
  pub fn new(data: Array4<f32>, ids: Vec<i64>, ratios: Vec<f32>) -> Result<Self, BatchError> {
    let samples = data.dim().0;
    if ids.len() != samples || ratios.len() != samples {
      return Err(BatchError::LengthMismatch {
        samples,
        ids: ids.len(),
        ratios: ratios.len(),
      });
    }
    Ok(Self { data, ids, ratios })
  }

  pub fn data(&self) -> &Array4<f32> {
    &self.data
  }

  pub fn ids(&self) -> &[i64] {
    &self.ids
  }

  pub fn ratios(&self) -> &[f32] {
    &self.ratios
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn into_parts(self) -> (Array4<f32>, Vec<i64>, Vec<f32>) {
    (self.data, self.ids, self.ratios)
  }
}

/// 数据源：有限、可重复遍历的批次序列
pub trait DataSource {
  type Error;

  fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, Self::Error>> + '_>;

  fn num_batches(&self) -> usize;

  /// 本进程负责的图片数
  fn num_images(&self) -> usize;

  fn manifest(&self) -> &Manifest;
}

/// 内存中的批次列表
#[derive(Debug, Clone, Default)]
pub struct BatchList {
  batches: Vec<Batch>,
  manifest: Manifest,
}

impl BatchList {
  pub fn new(batches: Vec<Batch>, manifest: Manifest) -> Self {
    Self { batches, manifest }
  }
}

impl DataSource for BatchList {
  type Error = std::convert::Infallible;

  fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, Self::Error>> + '_> {
    Box::new(self.batches.iter().cloned().map(Ok))
  }

  fn num_batches(&self) -> usize {
    self.batches.len()
  }

  fn num_images(&self) -> usize {
    self.batches.iter().map(Batch::len).sum()
  }

  fn manifest(&self) -> &Manifest {
    &self.manifest
  }
}
