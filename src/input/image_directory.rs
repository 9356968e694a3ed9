// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/input/image_directory.rs - 图像目录数据源
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

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage, imageops::FilterType};
use ndarray::Array4;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  input::{Batch, BatchError, DataSource},
  manifest::{ImageEntry, Manifest, ManifestError},
};

const RGB_CHANNELS: usize = 3;
const MEAN: [f32; RGB_CHANNELS] = [0.485, 0.456, 0.406];
const STD: [f32; RGB_CHANNELS] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ImageDirectoryError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("清单错误: {0}")]
  ManifestError(#[from] ManifestError),
  #[error("批次错误: {0}")]
  BatchError(#[from] BatchError),
  #[error("图像 {file} 缩放后为 {width}x{height}，超出固定输入尺寸 {limit:?}")]
  TooLarge {
    file: String,
    width: u32,
    height: u32,
    limit: (u32, u32),
  },
}

/// 缩放参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeOptions {
  /// 短边目标
  pub resize: u32,
  /// 长边上限
  pub max_size: u32,
  /// 批次尺寸对齐步长
  pub stride: u32,
  /// 固定输入尺寸 (高, 宽)，设置后所有批次都补齐到该尺寸
  pub fixed_size: Option<(u32, u32)>,
}

impl ResizeOptions {
  /// 计算缩放比例：短边缩放到 `resize`，长边超过 `max_size` 时改为按长边缩放
  pub fn ratio(&self, width: u32, height: u32) -> f32 {
    let short = width.min(height).max(1) as f32;
    let long = width.max(height).max(1) as f32;
    let ratio = self.resize as f32 / short;
    if ratio * long > self.max_size as f32 {
      self.max_size as f32 / long
    } else {
      ratio
    }
  }

  fn align(&self, value: u32) -> u32 {
    let stride = self.stride.max(1);
    value.div_ceil(stride) * stride
  }
}

/// 从图像目录按清单读取图片的数据源
///
/// 多进程时按 rank 交错分片：rank, rank + world, ...
pub struct ImageDirectory {
  root: PathBuf,
  manifest: Manifest,
  entries: Vec<ImageEntry>,
  options: ResizeOptions,
  batch_size: usize,
}

impl ImageDirectory {
  pub fn new(
    root: impl AsRef<Path>,
    manifest: Manifest,
    options: ResizeOptions,
    batch_size: usize,
    rank: usize,
    world: usize,
  ) -> Result<Self, ImageDirectoryError> {
    let entries: Vec<_> = manifest
      .image_entries()?
      .into_iter()
      .skip(rank)
      .step_by(world.max(1))
      .collect();
    info!(
      "图像目录 {}: rank {} 分得 {} 张图片，批大小 {}",
      root.as_ref().display(),
      rank,
      entries.len(),
      batch_size
    );
    Ok(Self {
      root: root.as_ref().to_path_buf(),
      manifest,
      entries,
      options,
      batch_size: batch_size.max(1),
    })
  }

  pub fn options(&self) -> &ResizeOptions {
    &self.options
  }

  fn load_image(&self, entry: &ImageEntry) -> Result<(RgbImage, f32), ImageDirectoryError> {
    let path = self.root.join(&entry.file_name);
    let image = ImageReader::open(&path)?.decode()?.to_rgb8();
    let (width, height) = image.dimensions();
    let ratio = self.options.ratio(width, height);
    let new_width = ((width as f32 * ratio).round() as u32).max(1);
    let new_height = ((height as f32 * ratio).round() as u32).max(1);
    debug!(
      "图片 {} ({}x{}) 缩放到 {}x{}，比例 {:.4}",
      entry.file_name, width, height, new_width, new_height, ratio
    );
    let resized = image::imageops::resize(&image, new_width, new_height, FilterType::Triangle);
    Ok((resized, ratio))
  }

  fn load_batch(&self, chunk: &[ImageEntry]) -> Result<Batch, ImageDirectoryError> {
    let mut images = Vec::with_capacity(chunk.len());
    let mut ids = Vec::with_capacity(chunk.len());
    let mut ratios = Vec::with_capacity(chunk.len());
    for entry in chunk {
      let (image, ratio) = self.load_image(entry)?;
      images.push(image);
      ids.push(entry.id);
      ratios.push(ratio);
    }

    let (height, width) = match self.options.fixed_size {
      Some(size) => size,
      None => {
        let h = images.iter().map(RgbImage::height).max().unwrap_or(0);
        let w = images.iter().map(RgbImage::width).max().unwrap_or(0);
        (self.options.align(h), self.options.align(w))
      }
    };

    let shape = (images.len(), RGB_CHANNELS, height as usize, width as usize);
    let mut data = Array4::<f32>::zeros(shape);
    for (idx, (image, entry)) in images.iter().zip(chunk).enumerate() {
      if image.width() > width || image.height() > height {
        error!("图片 {} 超出输入尺寸 {}x{}", entry.file_name, height, width);
        return Err(ImageDirectoryError::TooLarge {
          file: entry.file_name.clone(),
          width: image.width(),
          height: image.height(),
          limit: (height, width),
        });
      }
      for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..RGB_CHANNELS {
          data[[idx, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
      }
    }

    Ok(Batch::new(data, ids, ratios)?)
  }
}

impl DataSource for ImageDirectory {
  type Error = ImageDirectoryError;

  fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, Self::Error>> + '_> {
    Box::new(
      self
        .entries
        .chunks(self.batch_size)
        .map(|chunk| self.load_batch(chunk)),
    )
  }

  fn num_batches(&self) -> usize {
    self.entries.len().div_ceil(self.batch_size)
  }

  fn num_images(&self) -> usize {
    self.entries.len()
  }

  fn manifest(&self) -> &Manifest {
    &self.manifest
  }
}
