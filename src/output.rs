// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/output.rs - 检测结果写出与评估
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
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Serializer, Value, ser::PrettyFormatter};
use thiserror::Error;
use tracing::subscriber::NoSubscriber;
use tracing::{info, warn};

use crate::detection::Detection;
use crate::manifest::Manifest;

mod coco_eval;
pub use self::coco_eval::{CocoEvaluator, EvaluationError, EvaluationSummary};

/// 外部评估器：给定清单与检测结果，计算汇总指标
pub trait BenchmarkEvaluator {
  type Summary: fmt::Display;
  type Error: std::error::Error + Send + Sync + 'static;

  fn evaluate(
    &self,
    manifest: &Manifest,
    detections: &[Detection],
  ) -> Result<Self::Summary, Self::Error>;
}

/// 发布检测结果
pub trait Publish {
  type Error;

  fn publish(&self, manifest: &Manifest, detections: &[Detection]) -> Result<Outcome, Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("评估失败: {0}")]
  EvaluationError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 一次发布的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// 没有检测结果，未写出也未评估
  NoDetections,
  Published {
    written: Option<PathBuf>,
    summary: Option<String>,
  },
}

/// 写出文件的结构，字段顺序为 annotations、images、categories
#[derive(Serialize)]
struct DetectionsFile<'a> {
  annotations: &'a [Detection],
  images: &'a [Value],
  #[serde(skip_serializing_if = "Option::is_none")]
  categories: Option<&'a [Value]>,
}

/// 写出检测文件并在有真值时调用评估器
pub struct EvaluationOutput<E> {
  detections_file: Option<PathBuf>,
  evaluator: E,
}

impl<E: BenchmarkEvaluator> EvaluationOutput<E> {
  pub fn new(detections_file: Option<PathBuf>, evaluator: E) -> Self {
    Self {
      detections_file,
      evaluator,
    }
  }

  pub fn detections_file(&self) -> Option<&Path> {
    self.detections_file.as_deref()
  }

  fn write(
    &self,
    path: &Path,
    manifest: &Manifest,
    detections: &[Detection],
  ) -> Result<(), OutputError> {
    let file = DetectionsFile {
      annotations: detections,
      images: &manifest.images,
      categories: manifest.categories.as_deref(),
    };
    let mut writer = BufWriter::new(File::create(path)?);
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut writer, formatter);
    file.serialize(&mut serializer)?;
    writer.flush()?;
    Ok(())
  }
}

impl<E: BenchmarkEvaluator> Publish for EvaluationOutput<E> {
  type Error = OutputError;

  fn publish(&self, manifest: &Manifest, detections: &[Detection]) -> Result<Outcome, Self::Error> {
    if detections.is_empty() {
      warn!("没有检测结果，跳过写出与评估");
      return Ok(Outcome::NoDetections);
    }

    let written = match &self.detections_file {
      Some(path) => {
        info!("写出 {} 个检测结果到 {}", detections.len(), path.display());
        self.write(path, manifest, detections)?;
        Some(path.clone())
      }
      None => None,
    };

    let summary = if manifest.has_ground_truth() {
      info!("开始评估...");
      // 评估器内部的日志不输出，只打印最终指标
      let summary = tracing::subscriber::with_default(NoSubscriber::default(), || {
        self.evaluator.evaluate(manifest, detections)
      })
      .map_err(|e| OutputError::EvaluationError(Box::new(e)))?;
      let summary = summary.to_string();
      println!("{summary}");
      Some(summary)
    } else {
      info!("清单不含真值，跳过评估");
      None
    };

    Ok(Outcome::Published { written, summary })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::cell::Cell;

  #[derive(Default)]
  struct CountingEvaluator {
    calls: Cell<usize>,
  }

  #[derive(Debug, Error)]
  #[error("评估器故障")]
  struct Broken;

  impl BenchmarkEvaluator for CountingEvaluator {
    type Summary = String;
    type Error = Broken;

    fn evaluate(&self, _: &Manifest, detections: &[Detection]) -> Result<String, Broken> {
      self.calls.set(self.calls.get() + 1);
      if detections.iter().any(|d| d.score > 1.0) {
        return Err(Broken);
      }
      Ok(format!("{} detections", detections.len()))
    }
  }

  fn manifest(with_gt: bool) -> Manifest {
    let mut value = json!({
      "images": [{"id": 1, "file_name": "a.jpg", "height": 40}],
      "categories": [{"id": 42, "name": "ship"}]
    });
    if with_gt {
      value["annotations"] = json!([{"image_id": 1, "category_id": 42, "bbox": [5, 5, 11, 11]}]);
    }
    serde_json::from_value(value).unwrap()
  }

  fn detection(score: f32) -> Detection {
    Detection {
      image_id: 1,
      score,
      bbox: [5.0, 5.0, 11.0, 11.0],
      category_id: 42,
    }
  }

  #[test]
  fn writes_schema_with_echoed_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detections.json");
    let output = EvaluationOutput::new(Some(path.clone()), CountingEvaluator::default());

    let outcome = output.publish(&manifest(false), &[detection(0.5)]).unwrap();
    assert_eq!(
      outcome,
      Outcome::Published {
        written: Some(path.clone()),
        summary: None
      }
    );
    assert_eq!(output.evaluator.calls.get(), 0);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\n    \"annotations\": ["));
    let annotations = text.find("\"annotations\"").unwrap();
    let images = text.find("\"images\"").unwrap();
    let categories = text.find("\"categories\"").unwrap();
    assert!(annotations < images && images < categories);

    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["images"], Value::Array(manifest(false).images));
    assert_eq!(value["categories"][0]["name"], "ship");
    assert_eq!(value["annotations"][0]["category_id"], 42);
    assert_eq!(value["annotations"][0]["bbox"], json!([5.0, 5.0, 11.0, 11.0]));
  }

  #[test]
  fn empty_run_writes_and_evaluates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("detections.json");
    let output = EvaluationOutput::new(Some(path.clone()), CountingEvaluator::default());

    let outcome = output.publish(&manifest(true), &[]).unwrap();
    assert_eq!(outcome, Outcome::NoDetections);
    assert!(!path.exists());
    assert_eq!(output.evaluator.calls.get(), 0);
  }

  #[test]
  fn evaluates_when_ground_truth_present() {
    let output = EvaluationOutput::new(None, CountingEvaluator::default());
    let outcome = output.publish(&manifest(true), &[detection(0.5)]).unwrap();
    assert_eq!(
      outcome,
      Outcome::Published {
        written: None,
        summary: Some("1 detections".to_string())
      }
    );
    assert_eq!(output.evaluator.calls.get(), 1);
  }

  #[test]
  fn evaluator_failure_propagates() {
    let output = EvaluationOutput::new(None, CountingEvaluator::default());
    assert!(matches!(
      output.publish(&manifest(true), &[detection(2.0)]),
      Err(OutputError::EvaluationError(_))
    ));
  }
}
