// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output/coco_eval.rs - COCO 检测评估
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

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  detection::Detection,
  manifest::{GroundTruth, Manifest, ManifestError},
  output::BenchmarkEvaluator,
};

const IOU_STEPS: usize = 10;
const RECALL_POINTS: usize = 101;
const MAX_DETS: [usize; 3] = [1, 10, 100];
const AREA_RANGES: [(&str, f64, f64); 4] = [
  ("all", 0.0, 1e10),
  ("small", 0.0, 1024.0),
  ("medium", 1024.0, 9216.0),
  ("large", 9216.0, 1e10),
];

#[derive(Error, Debug)]
pub enum EvaluationError {
  #[error("清单错误: {0}")]
  Manifest(#[from] ManifestError),
  #[error("检测结果中的图片 {image_id} 不在清单中")]
  UnknownImage { image_id: i64 },
}

/// 0.50:0.05:0.95
fn iou_thresholds() -> [f64; IOU_STEPS] {
  let step = (0.95 - 0.5) / (IOU_STEPS - 1) as f64;
  let mut thresholds = [0.0; IOU_STEPS];
  for (i, t) in thresholds.iter_mut().enumerate() {
    *t = 0.5 + i as f64 * step;
  }
  thresholds[IOU_STEPS - 1] = 0.95;
  thresholds
}

fn recall_thresholds() -> [f64; RECALL_POINTS] {
  let step = 1.0 / (RECALL_POINTS - 1) as f64;
  let mut thresholds = [0.0; RECALL_POINTS];
  for (i, r) in thresholds.iter_mut().enumerate() {
    *r = i as f64 * step;
  }
  thresholds[RECALL_POINTS - 1] = 1.0;
  thresholds
}

fn in_range(area: f64, (_, lo, hi): (&str, f64, f64)) -> bool {
  area >= lo && area <= hi
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  score: f64,
  bbox: [f64; 4],
}

impl Candidate {
  fn area(&self) -> f64 {
    self.bbox[2] * self.bbox[3]
  }
}

/// 框的交并比；真值为 crowd 时分母取检测框面积
fn box_iou(dt: &[f64; 4], gt: &[f64; 4], crowd: bool) -> f64 {
  let w = (dt[0] + dt[2]).min(gt[0] + gt[2]) - dt[0].max(gt[0]);
  let h = (dt[1] + dt[3]).min(gt[1] + gt[3]) - dt[1].max(gt[1]);
  if w <= 0.0 || h <= 0.0 {
    return 0.0;
  }
  let inter = w * h;
  let dt_area = dt[2] * dt[3];
  let union = if crowd {
    dt_area
  } else {
    dt_area + gt[2] * gt[3] - inter
  };
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 单张图片、单个类别、单个面积区间的匹配结果
struct ImageEval {
  dt_scores: Vec<f64>,
  /// [iou 阈值][检测]
  dt_matched: Vec<Vec<bool>>,
  dt_ignore: Vec<Vec<bool>>,
  gt_ignore: Vec<bool>,
}

/// `dts` 需已按分数降序排列
fn evaluate_image(
  gts: &[&GroundTruth],
  dts: &[Candidate],
  range: (&str, f64, f64),
  thresholds: &[f64; IOU_STEPS],
) -> Option<ImageEval> {
  if gts.is_empty() && dts.is_empty() {
    return None;
  }

  // 忽略的真值排在最后
  let mut gts: Vec<(&GroundTruth, bool)> = gts
    .iter()
    .map(|gt| (*gt, gt.is_crowd() || !in_range(gt.area() as f64, range)))
    .collect();
  gts.sort_by_key(|&(_, ignore)| ignore);
  let gt_ignore: Vec<bool> = gts.iter().map(|&(_, ignore)| ignore).collect();

  let ious: Vec<Vec<f64>> = dts
    .iter()
    .map(|dt| {
      gts
        .iter()
        .map(|(gt, _)| box_iou(&dt.bbox, &gt.bbox.map(f64::from), gt.is_crowd()))
        .collect()
    })
    .collect();

  let mut dt_matched = vec![vec![false; dts.len()]; IOU_STEPS];
  let mut dt_ignore = vec![vec![false; dts.len()]; IOU_STEPS];
  for (t, &threshold) in thresholds.iter().enumerate() {
    let mut gt_matched = vec![false; gts.len()];
    for d in 0..dts.len() {
      let mut best = threshold.min(1.0 - 1e-10);
      let mut matched: Option<usize> = None;
      for (g, (gt, _)) in gts.iter().enumerate() {
        if gt_matched[g] && !gt.is_crowd() {
          continue;
        }
        if matched.is_some_and(|m| !gt_ignore[m] && gt_ignore[g]) {
          break;
        }
        if ious[d][g] < best {
          continue;
        }
        best = ious[d][g];
        matched = Some(g);
      }
      if let Some(g) = matched {
        dt_ignore[t][d] = gt_ignore[g];
        dt_matched[t][d] = true;
        gt_matched[g] = true;
      }
    }
    for (d, dt) in dts.iter().enumerate() {
      if !dt_matched[t][d] && !in_range(dt.area(), range) {
        dt_ignore[t][d] = true;
      }
    }
  }

  Some(ImageEval {
    dt_scores: dts.iter().map(|dt| dt.score).collect(),
    dt_matched,
    dt_ignore,
    gt_ignore,
  })
}

/// 累积后的精度与召回表，-1 表示该组合没有有效真值
struct Tables {
  cats: usize,
  /// [t][r][k][a][m]
  precision: Vec<f64>,
  /// [t][k][a][m]
  recall: Vec<f64>,
}

impl Tables {
  fn new(cats: usize) -> Self {
    let (areas, dets) = (AREA_RANGES.len(), MAX_DETS.len());
    Self {
      cats,
      precision: vec![-1.0; IOU_STEPS * RECALL_POINTS * cats * areas * dets],
      recall: vec![-1.0; IOU_STEPS * cats * areas * dets],
    }
  }

  fn precision_at(&self, t: usize, r: usize, k: usize, a: usize, m: usize) -> usize {
    (((t * RECALL_POINTS + r) * self.cats + k) * AREA_RANGES.len() + a) * MAX_DETS.len() + m
  }

  fn recall_at(&self, t: usize, k: usize, a: usize, m: usize) -> usize {
    ((t * self.cats + k) * AREA_RANGES.len() + a) * MAX_DETS.len() + m
  }

  fn accumulate(&mut self, k: usize, a: usize, m: usize, evals: &[&ImageEval]) {
    let max_det = MAX_DETS[m];
    let mut entries: Vec<(f64, usize, usize)> = evals
      .iter()
      .enumerate()
      .flat_map(|(e, eval)| {
        eval
          .dt_scores
          .iter()
          .take(max_det)
          .enumerate()
          .map(move |(d, &score)| (score, e, d))
      })
      .collect();
    entries.sort_by(|x, y| y.0.total_cmp(&x.0));

    let positives = evals
      .iter()
      .flat_map(|eval| eval.gt_ignore.iter())
      .filter(|&&ignore| !ignore)
      .count();
    if positives == 0 {
      return;
    }

    let recall_points = recall_thresholds();
    for t in 0..IOU_STEPS {
      let mut tp = 0usize;
      let mut fp = 0usize;
      let mut recall = Vec::with_capacity(entries.len());
      let mut precision = Vec::with_capacity(entries.len());
      for &(_, e, d) in &entries {
        let ignored = evals[e].dt_ignore[t][d];
        let matched = evals[e].dt_matched[t][d];
        if !ignored {
          if matched {
            tp += 1;
          } else {
            fp += 1;
          }
        }
        recall.push(tp as f64 / positives as f64);
        precision.push(tp as f64 / (tp as f64 + fp as f64 + f64::EPSILON));
      }

      let index = self.recall_at(t, k, a, m);
      self.recall[index] = recall.last().copied().unwrap_or(0.0);

      // 精度包络：从后向前取最大值
      for i in (1..precision.len()).rev() {
        if precision[i] > precision[i - 1] {
          precision[i - 1] = precision[i];
        }
      }
      for (r, &point) in recall_points.iter().enumerate() {
        let pos = recall.partition_point(|&x| x < point);
        let index = self.precision_at(t, r, k, a, m);
        self.precision[index] = precision.get(pos).copied().unwrap_or(0.0);
      }
    }
  }

  fn summarize(&self, average_precision: bool, iou: Option<usize>, a: usize, m: usize) -> f64 {
    let ts = match iou {
      Some(t) => t..t + 1,
      None => 0..IOU_STEPS,
    };
    let mut sum = 0.0;
    let mut n = 0usize;
    for t in ts {
      for k in 0..self.cats {
        let values: Vec<f64> = if average_precision {
          (0..RECALL_POINTS)
            .map(|r| self.precision[self.precision_at(t, r, k, a, m)])
            .collect()
        } else {
          vec![self.recall[self.recall_at(t, k, a, m)]]
        };
        for v in values.into_iter().filter(|&v| v > -1.0) {
          sum += v;
          n += 1;
        }
      }
    }
    if n == 0 { -1.0 } else { sum / n as f64 }
  }
}

/// COCO 检测指标的 12 项统计
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
  pub stats: [f64; 12],
}

impl EvaluationSummary {
  pub fn average_precision(&self) -> f64 {
    self.stats[0]
  }
}

impl fmt::Display for EvaluationSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const ROWS: [(bool, &str, &str, usize); 12] = [
      (true, "0.50:0.95", "all", 100),
      (true, "0.50", "all", 100),
      (true, "0.75", "all", 100),
      (true, "0.50:0.95", "small", 100),
      (true, "0.50:0.95", "medium", 100),
      (true, "0.50:0.95", "large", 100),
      (false, "0.50:0.95", "all", 1),
      (false, "0.50:0.95", "all", 10),
      (false, "0.50:0.95", "all", 100),
      (false, "0.50:0.95", "small", 100),
      (false, "0.50:0.95", "medium", 100),
      (false, "0.50:0.95", "large", 100),
    ];
    for (i, ((ap, iou, area, max_det), value)) in ROWS.iter().zip(self.stats).enumerate() {
      let (title, kind) = if *ap {
        ("Average Precision", "(AP)")
      } else {
        ("Average Recall", "(AR)")
      };
      write!(
        f,
        " {:<18} {} @[ IoU={:<9} | area={:>6} | maxDets={:>3} ] = {:0.3}",
        title, kind, iou, area, max_det, value
      )?;
      if i + 1 < ROWS.len() {
        writeln!(f)?;
      }
    }
    Ok(())
  }
}

/// COCO bbox 评估：按类别与图片贪心匹配，计算 AP/AR
#[derive(Debug, Clone, Copy, Default)]
pub struct CocoEvaluator;

impl BenchmarkEvaluator for CocoEvaluator {
  type Summary = EvaluationSummary;
  type Error = EvaluationError;

  fn evaluate(
    &self,
    manifest: &Manifest,
    detections: &[Detection],
  ) -> Result<EvaluationSummary, EvaluationError> {
    let now = Instant::now();
    info!("载入检测结果...");
    let image_ids: Vec<i64> = manifest
      .image_ids()?
      .into_iter()
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();
    let mut cat_ids: Vec<i64> = manifest.category_ids()?;
    if cat_ids.is_empty() {
      cat_ids = manifest.ground_truth().iter().map(|gt| gt.category_id).collect();
    }
    let cat_ids: Vec<i64> = cat_ids
      .into_iter()
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

    let mut gts: HashMap<(i64, i64), Vec<&GroundTruth>> = HashMap::new();
    for gt in manifest.ground_truth() {
      gts.entry((gt.image_id, gt.category_id)).or_default().push(gt);
    }
    let mut dts: HashMap<(i64, i64), Vec<Candidate>> = HashMap::new();
    for det in detections {
      if image_ids.binary_search(&det.image_id).is_err() {
        return Err(EvaluationError::UnknownImage {
          image_id: det.image_id,
        });
      }
      dts
        .entry((det.image_id, det.category_id))
        .or_default()
        .push(Candidate {
          score: det.score as f64,
          bbox: det.bbox.map(f64::from),
        });
    }
    let max_det = MAX_DETS[MAX_DETS.len() - 1];
    for candidates in dts.values_mut() {
      candidates.sort_by(|x, y| y.score.total_cmp(&x.score));
      candidates.truncate(max_det);
    }

    info!("逐图评估...");
    let thresholds = iou_thresholds();
    let mut tables = Tables::new(cat_ids.len());
    for (k, cat_id) in cat_ids.iter().enumerate() {
      for (a, &range) in AREA_RANGES.iter().enumerate() {
        let evals: Vec<ImageEval> = image_ids
          .iter()
          .filter_map(|image_id| {
            let key = (*image_id, *cat_id);
            evaluate_image(
              gts.get(&key).map(Vec::as_slice).unwrap_or_default(),
              dts.get(&key).map(Vec::as_slice).unwrap_or_default(),
              range,
              &thresholds,
            )
          })
          .collect();
        if evals.is_empty() {
          continue;
        }
        let evals: Vec<&ImageEval> = evals.iter().collect();
        for m in 0..MAX_DETS.len() {
          tables.accumulate(k, a, m, &evals);
        }
      }
    }

    let last = MAX_DETS.len() - 1;
    let stats = [
      tables.summarize(true, None, 0, last),
      tables.summarize(true, Some(0), 0, last),
      tables.summarize(true, Some(5), 0, last),
      tables.summarize(true, None, 1, last),
      tables.summarize(true, None, 2, last),
      tables.summarize(true, None, 3, last),
      tables.summarize(false, None, 0, 0),
      tables.summarize(false, None, 0, 1),
      tables.summarize(false, None, 0, last),
      tables.summarize(false, None, 1, last),
      tables.summarize(false, None, 2, last),
      tables.summarize(false, None, 3, last),
    ];
    debug!("评估完成，耗时 {:.2?}", now.elapsed());
    Ok(EvaluationSummary { stats })
  }
}
