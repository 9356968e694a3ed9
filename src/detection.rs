// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/detection.rs - 原始预测解码为检测记录
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::distributed::Aggregated;

/// 解码保留的最低分数（严格大于）
pub const SCORE_FLOOR: f32 = 0.0;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
  #[error("图片 {image_id} 的类别下标 {class} 超出类别表 (共 {known} 类)")]
  UnknownClass {
    image_id: i64,
    class: i64,
    known: usize,
  },
  #[error("图片 {image_id} 的类别下标 {class} 为负数")]
  NegativeClass { image_id: i64, class: i64 },
  #[error("图片 {image_id} 的缩放比例 {ratio} 无效")]
  InvalidRatio { image_id: i64, ratio: f32 },
}

/// 一条检测记录，`bbox` 为原图坐标下的 [x, y, w, h]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub image_id: i64,
  pub score: f32,
  pub bbox: [f32; 4],
  pub category_id: i64,
}

/// 角点框还原到原图并转换为 [x, y, w, h]，宽高按包含端点计算
fn to_xywh(corners: [f32; 4], ratio: f32) -> [f32; 4] {
  let [x1, y1, x2, y2] = corners.map(|v| v / ratio);
  [x1, y1, x2 - x1 + 1.0, y2 - y1 + 1.0]
}

fn category_of(
  class: i64,
  image_id: i64,
  taxonomy: Option<&[i64]>,
) -> Result<i64, DecodeError> {
  let Some(taxonomy) = taxonomy else {
    return Ok(class);
  };
  let index =
    usize::try_from(class).map_err(|_| DecodeError::NegativeClass { image_id, class })?;
  taxonomy
    .get(index)
    .copied()
    .ok_or(DecodeError::UnknownClass {
      image_id,
      class,
      known: taxonomy.len(),
    })
}

/// 将汇总结果解码为检测记录，按样本顺序、候选顺序输出
///
/// 提供类别表时，类别下标 i 映射为 `taxonomy[i]`；否则保留原始下标。
pub fn decode(
  aggregated: &Aggregated,
  taxonomy: Option<&[i64]>,
) -> Result<Vec<Detection>, DecodeError> {
  let prediction = aggregated.prediction();
  let scores = prediction.scores();
  let boxes = prediction.boxes();
  let classes = prediction.classes();

  let mut detections = Vec::new();
  let samples = aggregated.ids().iter().zip(aggregated.ratios());
  for (sample, (&image_id, &ratio)) in samples.enumerate() {
    let kept: Vec<usize> = scores
      .row(sample)
      .iter()
      .enumerate()
      .filter(|&(_, &score)| score > SCORE_FLOOR)
      .map(|(k, _)| k)
      .collect();
    if kept.is_empty() {
      continue;
    }
    if !(ratio.is_finite() && ratio > 0.0) {
      return Err(DecodeError::InvalidRatio { image_id, ratio });
    }

    for k in kept {
      let corners = [
        boxes[[sample, k, 0]],
        boxes[[sample, k, 1]],
        boxes[[sample, k, 2]],
        boxes[[sample, k, 3]],
      ];
      let class = classes[[sample, k]];
      detections.push(Detection {
        image_id,
        score: scores[[sample, k]],
        bbox: to_xywh(corners, ratio),
        category_id: category_of(class, image_id, taxonomy)?,
      });
    }
  }

  debug!("{} 个样本解码出 {} 个检测", aggregated.samples(), detections.len());
  if detections.is_empty() {
    warn!("没有检测结果!");
  }
  Ok(detections)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::RawPrediction;
  use ndarray::{Array2, Array3, array};

  fn aggregated(
    scores: Array2<f32>,
    boxes: Array3<f32>,
    classes: Array2<i64>,
    ids: Vec<i64>,
    ratios: Vec<f32>,
  ) -> Aggregated {
    Aggregated::new(RawPrediction::new(scores, boxes, classes).unwrap(), ids, ratios).unwrap()
  }

  #[test]
  fn single_image_round_trip_to_original_coordinates() {
    let input = aggregated(
      array![[0.9]],
      array![[[10.0, 10.0, 30.0, 30.0]]],
      array![[0]],
      vec![1],
      vec![2.0],
    );
    let detections = decode(&input, Some(&[42][..])).unwrap();
    assert_eq!(
      detections,
      [Detection {
        image_id: 1,
        score: 0.9,
        bbox: [5.0, 5.0, 11.0, 11.0],
        category_id: 42,
      }]
    );
  }

  #[test]
  fn keeps_only_positive_scores() {
    let input = aggregated(
      array![[0.5, 0.0, -0.1], [0.0, 0.0, 0.0], [0.0, 0.25, 0.0]],
      Array3::zeros((3, 3, 4)),
      array![[1, 2, 3], [1, 1, 1], [4, 5, 6]],
      vec![10, 11, 12],
      vec![1.0, 1.0, 1.0],
    );
    let detections = decode(&input, None).unwrap();
    let kept: Vec<_> = detections
      .iter()
      .map(|d| (d.image_id, d.category_id))
      .collect();
    assert_eq!(kept, [(10, 1), (12, 5)]);
    // 零尺寸角点框仍有 1 像素宽高
    assert_eq!(detections[0].bbox, [0.0, 0.0, 1.0, 1.0]);
  }

  #[test]
  fn each_sample_uses_its_own_ratio() {
    let input = aggregated(
      array![[1.0], [1.0]],
      array![[[4.0, 8.0, 12.0, 16.0]], [[4.0, 8.0, 12.0, 16.0]]],
      array![[0], [0]],
      vec![0, 1],
      vec![4.0, 0.5],
    );
    let detections = decode(&input, None).unwrap();
    assert_eq!(detections[0].bbox, [1.0, 2.0, 3.0, 3.0]);
    assert_eq!(detections[1].bbox, [8.0, 16.0, 17.0, 17.0]);
  }

  #[test]
  fn remaps_through_taxonomy() {
    let input = aggregated(
      array![[0.3, 0.6]],
      Array3::zeros((1, 2, 4)),
      array![[2, 0]],
      vec![5],
      vec![1.0],
    );
    let taxonomy = [1, 7, 90];
    let categories: Vec<_> = decode(&input, Some(&taxonomy[..]))
      .unwrap()
      .into_iter()
      .map(|d| d.category_id)
      .collect();
    assert_eq!(categories, [90, 1]);

    let raw: Vec<_> = decode(&input, None)
      .unwrap()
      .into_iter()
      .map(|d| d.category_id)
      .collect();
    assert_eq!(raw, [2, 0]);
  }

  #[test]
  fn rejects_classes_outside_taxonomy() {
    let input = aggregated(
      array![[0.3]],
      Array3::zeros((1, 1, 4)),
      array![[3]],
      vec![5],
      vec![1.0],
    );
    assert_eq!(
      decode(&input, Some(&[1, 2][..])),
      Err(DecodeError::UnknownClass {
        image_id: 5,
        class: 3,
        known: 2
      })
    );

    let input = aggregated(
      array![[0.3]],
      Array3::zeros((1, 1, 4)),
      array![[-1]],
      vec![5],
      vec![1.0],
    );
    assert_eq!(
      decode(&input, Some(&[1, 2][..])),
      Err(DecodeError::NegativeClass {
        image_id: 5,
        class: -1
      })
    );
  }

  #[test]
  fn invalid_ratio_only_matters_with_detections() {
    let empty = aggregated(
      array![[0.0]],
      Array3::zeros((1, 1, 4)),
      array![[0]],
      vec![3],
      vec![0.0],
    );
    assert!(decode(&empty, None).unwrap().is_empty());

    let kept = aggregated(
      array![[0.8]],
      Array3::zeros((1, 1, 4)),
      array![[0]],
      vec![3],
      vec![0.0],
    );
    assert_eq!(
      decode(&kept, None),
      Err(DecodeError::InvalidRatio {
        image_id: 3,
        ratio: 0.0
      })
    );
  }
}
