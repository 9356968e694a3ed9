// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/manifest.rs - 数据集清单（COCO 格式）
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ManifestError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("清单解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("清单 {section}[{index}] 缺少字段 `{field}`")]
  MissingField {
    section: &'static str,
    index: usize,
    field: &'static str,
  },
}

/// 真值标注
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
  #[serde(default)]
  pub id: i64,
  pub image_id: i64,
  pub category_id: i64,
  /// [x, y, w, h]
  pub bbox: [f32; 4],
  #[serde(default)]
  pub area: Option<f32>,
  #[serde(default)]
  pub iscrowd: u8,
}

impl GroundTruth {
  pub fn area(&self) -> f32 {
    self.area.unwrap_or(self.bbox[2] * self.bbox[3])
  }

  pub fn is_crowd(&self) -> bool {
    self.iscrowd != 0
  }
}

/// 清单中的单张图片
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
  pub id: i64,
  pub file_name: String,
}

/// 数据集清单
///
/// `images` 与 `categories` 保留原始 JSON，写出结果时原样回显。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
  #[serde(default)]
  pub images: Vec<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub annotations: Option<Vec<GroundTruth>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub categories: Option<Vec<Value>>,
}

impl Manifest {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
    let path = path.as_ref();
    info!("读取清单: {}", path.display());
    let data = std::fs::read(path)?;
    let manifest: Manifest = serde_json::from_slice(&data)?;
    debug!(
      "清单图片数: {}, 真值数: {:?}",
      manifest.images.len(),
      manifest.annotations.as_ref().map(Vec::len)
    );
    Ok(manifest)
  }

  /// 枚举目录下的文件生成清单，按文件名排序后从 0 开始编号
  pub fn synthesize(images_dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
    let images_dir = images_dir.as_ref();
    let mut names = Vec::new();
    for entry in std::fs::read_dir(images_dir)? {
      let entry = entry?;
      if entry.file_type()?.is_file() {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
    names.sort();
    info!("未提供清单，枚举目录 {} 得到 {} 张图片", images_dir.display(), names.len());

    let images = names
      .into_iter()
      .enumerate()
      .map(|(id, file_name)| json!({ "id": id, "file_name": file_name }))
      .collect();
    Ok(Self {
      images,
      annotations: None,
      categories: None,
    })
  }

  pub fn image_entries(&self) -> Result<Vec<ImageEntry>, ManifestError> {
    self
      .images
      .iter()
      .enumerate()
      .map(|(index, image)| {
        let missing = |field| ManifestError::MissingField {
          section: "images",
          index,
          field,
        };
        let id = image.get("id").and_then(Value::as_i64).ok_or_else(|| missing("id"))?;
        let file_name = image
          .get("file_name")
          .and_then(Value::as_str)
          .ok_or_else(|| missing("file_name"))?;
        Ok(ImageEntry {
          id,
          file_name: file_name.to_string(),
        })
      })
      .collect()
  }

  pub fn has_ground_truth(&self) -> bool {
    self.annotations.is_some()
  }

  pub fn ground_truth(&self) -> &[GroundTruth] {
    self.annotations.as_deref().unwrap_or_default()
  }

  /// 类别 id 列表，按清单中的顺序
  pub fn category_ids(&self) -> Result<Vec<i64>, ManifestError> {
    self
      .categories
      .iter()
      .flatten()
      .enumerate()
      .map(|(index, category)| {
        category
          .get("id")
          .and_then(Value::as_i64)
          .ok_or(ManifestError::MissingField {
            section: "categories",
            index,
            field: "id",
          })
      })
      .collect()
  }

  /// 原始类别下标到类别 id 的映射表，仅在清单带有真值与类别时可用
  pub fn taxonomy(&self) -> Result<Option<Vec<i64>>, ManifestError> {
    if !self.has_ground_truth() || self.categories.is_none() {
      return Ok(None);
    }
    self.category_ids().map(Some)
  }

  pub fn image_ids(&self) -> Result<Vec<i64>, ManifestError> {
    Ok(self.image_entries()?.into_iter().map(|e| e.id).collect())
  }
}
