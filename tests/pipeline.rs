// 该文件是 Qianliyan （千里眼） 项目的一部分。
// tests/pipeline.rs - 推理流水线集成测试
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

#![cfg(feature = "model_replay")]

use std::path::PathBuf;

use ndarray::{Array2, Array3, Array4, array};
use serde_json::{Value, json};

use qianliyan::{
  config::InferConfig,
  distributed::{Collective, Standalone, ThreadGroup},
  input::{Batch, BatchList},
  manifest::Manifest,
  model::{BackendKind, RawPrediction, ReplayModel},
  output::{CocoEvaluator, EvaluationOutput, Outcome},
  task::{InferTask, Task},
};

fn config(detections_file: Option<PathBuf>, world: usize, rank: usize) -> InferConfig {
  InferConfig {
    detections_file,
    world,
    rank,
    ..Default::default()
  }
}

fn batch(ids: &[i64], ratios: &[f32]) -> Batch {
  Batch::new(
    Array4::zeros((ids.len(), 3, 4, 4)),
    ids.to_vec(),
    ratios.to_vec(),
  )
  .unwrap()
}

fn replay(predictions: Vec<RawPrediction>) -> ReplayModel {
  ReplayModel::new(BackendKind::Native, 1, None, predictions)
}

fn read_json(path: &PathBuf) -> Value {
  serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn single_image_is_decoded_written_and_scored() {
  let manifest: Manifest = serde_json::from_value(json!({
    "images": [{"id": 1, "file_name": "a.jpg"}],
    "annotations": [{"id": 1, "image_id": 1, "category_id": 42, "bbox": [5, 5, 11, 11]}],
    "categories": [{"id": 42, "name": "ship"}]
  }))
  .unwrap();
  let source = BatchList::new(vec![batch(&[1], &[2.0])], manifest);
  let model = replay(vec![
    RawPrediction::new(
      array![[0.9]],
      array![[[10.0, 10.0, 30.0, 30.0]]],
      array![[0]],
    )
    .unwrap(),
  ]);

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("detections.json");
  let output = EvaluationOutput::new(Some(path.clone()), CocoEvaluator);
  let outcome = InferTask::new(config(Some(path.clone()), 0, 0), Standalone)
    .run_task(source, model, output)
    .unwrap();

  let Some(Outcome::Published { written, summary }) = outcome else {
    panic!("expected published detections");
  };
  assert_eq!(written, Some(path.clone()));
  let summary = summary.unwrap();
  assert!(summary.lines().next().unwrap().ends_with("= 1.000"));

  let file = read_json(&path);
  assert_eq!(
    file["annotations"],
    json!([{"image_id": 1, "score": 0.9, "bbox": [5.0, 5.0, 11.0, 11.0], "category_id": 42}])
  );
  assert_eq!(file["categories"][0]["id"], 42);
}

fn worker_prediction(score: f32, samples: usize, candidates: usize) -> RawPrediction {
  let scores = Array2::from_shape_fn((samples, candidates), |(i, j)| {
    if j == 0 { score + i as f32 / 100.0 } else { 0.0 }
  });
  let boxes = Array3::from_shape_fn((samples, candidates, 4), |(i, _, c)| {
    (i * 10 + c * 4) as f32
  });
  RawPrediction::new(scores, boxes, Array2::from_elem((samples, candidates), 1)).unwrap()
}

fn images_manifest(count: i64) -> Manifest {
  let images: Vec<Value> = (0..count)
    .map(|id| json!({"id": id, "file_name": format!("{id}.jpg")}))
    .collect();
  serde_json::from_value(json!({ "images": images })).unwrap()
}

#[test]
fn multi_worker_run_matches_single_worker_concatenation() {
  let dir = tempfile::tempdir().unwrap();
  let manifest = images_manifest(5);

  // 每个 rank 的批次与预测
  let shards = [
    (
      vec![batch(&[0, 2], &[1.0, 2.0]), batch(&[4], &[0.5])],
      vec![worker_prediction(0.5, 2, 2), worker_prediction(0.6, 1, 2)],
    ),
    (
      vec![batch(&[1, 3], &[1.5, 1.0])],
      vec![worker_prediction(0.7, 2, 3)],
    ),
  ];

  let single_path = dir.path().join("single.json");
  let (batches, predictions): (Vec<_>, Vec<_>) = shards
    .iter()
    .map(|(b, p)| (b.clone(), p.clone()))
    .unzip();
  InferTask::new(config(Some(single_path.clone()), 0, 0), Standalone)
    .run_task(
      BatchList::new(batches.concat(), manifest.clone()),
      replay(predictions.concat()),
      EvaluationOutput::new(Some(single_path.clone()), CocoEvaluator),
    )
    .unwrap();

  let multi_path = dir.path().join("multi.json");
  let outcomes: Vec<_> = std::thread::scope(|scope| {
    let handles: Vec<_> = ThreadGroup::create(2)
      .into_iter()
      .zip(shards)
      .map(|(member, (batches, predictions))| {
        let rank = member.rank();
        let path = (rank == 0).then(|| multi_path.clone());
        let manifest = manifest.clone();
        scope.spawn(move || {
          InferTask::new(config(path.clone(), 2, rank), member).run_task(
            BatchList::new(batches, manifest),
            replay(predictions),
            EvaluationOutput::new(path, CocoEvaluator),
          )
        })
      })
      .collect();
    handles
      .into_iter()
      .map(|h| h.join().unwrap().unwrap())
      .collect()
  });

  assert!(matches!(outcomes[0], Some(Outcome::Published { .. })));
  assert_eq!(outcomes[1], None);

  let single = read_json(&single_path);
  let multi = read_json(&multi_path);
  assert_eq!(single, multi);
  let ids: Vec<i64> = multi["annotations"]
    .as_array()
    .unwrap()
    .iter()
    .map(|d| d["image_id"].as_i64().unwrap())
    .collect();
  assert_eq!(ids, [0, 2, 4, 1, 3]);
}

#[test]
fn zero_detections_write_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("detections.json");
  let source = BatchList::new(vec![batch(&[0, 1], &[1.0, 1.0])], images_manifest(2));
  let model = replay(vec![
    RawPrediction::new(
      Array2::zeros((2, 4)),
      Array3::from_elem((2, 4, 4), 3.0),
      Array2::zeros((2, 4)),
    )
    .unwrap(),
  ]);

  let outcome = InferTask::new(config(Some(path.clone()), 0, 0), Standalone)
    .run_task(source, model, EvaluationOutput::new(Some(path.clone()), CocoEvaluator))
    .unwrap();
  assert_eq!(outcome, Some(Outcome::NoDetections));
  assert!(!path.exists());
}

#[test]
fn exhausted_recording_fails_the_run() {
  let source = BatchList::new(
    vec![batch(&[0], &[1.0]), batch(&[1], &[1.0])],
    images_manifest(2),
  );
  let model = replay(vec![worker_prediction(0.5, 1, 1)]);
  let result = InferTask::new(config(None, 0, 0), Standalone).run_task(
    source,
    model,
    EvaluationOutput::new(None, CocoEvaluator),
  );
  assert!(result.is_err());
}

#[cfg(feature = "read_image_file")]
#[test]
fn image_directory_with_recorded_engine_output() {
  use qianliyan::{
    FromUrl,
    input::{ImageDirectory, ResizeOptions},
    model::{Model, ReplayModelBuilder},
  };

  let dir = tempfile::tempdir().unwrap();
  let images = dir.path().join("images");
  std::fs::create_dir(&images).unwrap();
  image::RgbImage::from_pixel(10, 10, image::Rgb([10, 20, 30]))
    .save(images.join("only.png"))
    .unwrap();

  let recording = dir.path().join("run.json");
  std::fs::write(
    &recording,
    json!({
      "input_size": [24, 24],
      "batches": [{
        "scores": [[0.8, 0.0]],
        "boxes": [[[10.0, 10.0, 30.0, 30.0], [0.0, 0.0, 1.0, 1.0]]],
        "classes": [[3, 0]]
      }]
    })
    .to_string(),
  )
  .unwrap();
  let url = url::Url::parse(&format!("replay://{}?backend=engine", recording.display())).unwrap();
  let model = ReplayModelBuilder::from_url(&url).unwrap().build().unwrap();
  let (height, width) = model.input_size().unwrap();

  let options = ResizeOptions {
    resize: 20,
    max_size: height.max(width),
    stride: model.stride(),
    fixed_size: Some((height, width)),
  };
  let manifest = Manifest::synthesize(&images).unwrap();
  let source = ImageDirectory::new(&images, manifest, options, 1, 0, 0).unwrap();

  let path = dir.path().join("detections.json");
  let outcome = InferTask::new(config(Some(path.clone()), 0, 0), Standalone)
    .run_task(source, model, EvaluationOutput::new(Some(path.clone()), CocoEvaluator))
    .unwrap();
  assert!(matches!(outcome, Some(Outcome::Published { summary: None, .. })));

  let file = read_json(&path);
  assert_eq!(
    file["annotations"],
    json!([{"image_id": 0, "score": 0.8, "bbox": [5.0, 5.0, 11.0, 11.0], "category_id": 3}])
  );
  assert_eq!(file["images"][0]["file_name"], "only.png");
  assert!(file.get("categories").is_none());
}
