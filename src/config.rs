// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/config.rs - 推理运行配置
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

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ExecutionMode, Precision};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("未知的推理后端: {0}")]
  UnknownBackend(String),
  #[error("批大小必须大于 0")]
  ZeroBatchSize,
  #[error("缩放尺寸必须大于 0: resize {resize}, max_size {max_size}")]
  ZeroResize { resize: u32, max_size: u32 },
  #[error("rank {rank} 超出 world {world}")]
  RankOutOfRange { rank: usize, world: usize },
}

/// 一次推理运行的参数
#[derive(Debug, Clone)]
pub struct InferConfig {
  /// 检测结果输出文件，缺省时只计算不保存
  pub detections_file: Option<PathBuf>,
  /// 短边缩放目标
  pub resize: u32,
  /// 长边上限
  pub max_size: u32,
  pub batch_size: usize,
  pub mixed_precision: bool,
  /// 工作进程数，0 表示单进程且不做集合通信
  pub world: usize,
  pub rank: usize,
  pub verbose: bool,
}

impl Default for InferConfig {
  fn default() -> Self {
    Self {
      detections_file: None,
      resize: 800,
      max_size: 1333,
      batch_size: 2,
      mixed_precision: true,
      world: 0,
      rank: 0,
      verbose: true,
    }
  }
}

impl InferConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.batch_size == 0 {
      return Err(ConfigError::ZeroBatchSize);
    }
    if self.resize == 0 || self.max_size == 0 {
      return Err(ConfigError::ZeroResize {
        resize: self.resize,
        max_size: self.max_size,
      });
    }
    if self.rank >= self.world.max(1) {
      return Err(ConfigError::RankOutOfRange {
        rank: self.rank,
        world: self.world,
      });
    }
    Ok(())
  }

  /// 主进程负责解码、写出与评估
  pub fn is_master(&self) -> bool {
    self.rank == 0
  }

  /// 需要跨进程交换结果
  pub fn is_distributed(&self) -> bool {
    self.world > 1
  }

  pub fn precision(&self) -> Precision {
    if self.mixed_precision {
      Precision::Mixed
    } else {
      Precision::Full
    }
  }

  pub fn execution_mode(&self) -> ExecutionMode {
    ExecutionMode::inference(self.precision())
  }
}
