// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/task.rs - 推理任务
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
use std::time::Duration;

use tracing::{debug, info};

use crate::{
  config::InferConfig,
  detection::decode,
  distributed::{Accumulated, Collective, aggregate},
  input::DataSource,
  model::{BackendKind, ExecutionMode, ModeScope, Model},
  output::{Outcome, Publish},
  profiler::Profiler,
};

/// 累计推理时间超过该值时输出一次进度
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

const INFER: &str = "infer";
const FORWARD: &str = "fw";

pub trait Task<D, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, source: D, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 一条进度记录
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
  pub processed: usize,
  pub total: usize,
  pub batch_size: usize,
  /// 每批平均耗时
  pub infer: Duration,
  /// 每批平均前向耗时
  pub forward: Duration,
}

impl ProgressReport {
  pub fn images_per_second(&self) -> f64 {
    let secs = self.infer.as_secs_f64();
    if secs > 0.0 {
      self.batch_size as f64 / secs
    } else {
      0.0
    }
  }
}

impl fmt::Display for ProgressReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let width = self.total.to_string().len();
    write!(
      f,
      "[{:>width$}/{}] {:.3}s/{}-batch (fw: {:.3}s), {:.1} im/s",
      self.processed,
      self.total,
      self.infer.as_secs_f64(),
      self.batch_size,
      self.forward.as_secs_f64(),
      self.images_per_second(),
      width = width
    )
  }
}

/// 推理循环的产出
#[derive(Debug)]
pub struct LoopOutput {
  pub accumulated: Accumulated,
  pub reports: Vec<ProgressReport>,
}

/// 推理循环：逐批调用模型，计时并累积原始预测
#[derive(Debug, Clone)]
pub struct InferenceLoop {
  batch_size: usize,
  mode: ExecutionMode,
  verbose: bool,
  pub(crate) report_interval: Duration,
}

impl InferenceLoop {
  pub fn new(batch_size: usize, mode: ExecutionMode) -> Self {
    Self {
      batch_size,
      mode,
      verbose: true,
      report_interval: REPORT_INTERVAL,
    }
  }

  pub fn with_verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }

  pub fn run<D, M>(&self, source: &D, model: &mut M) -> anyhow::Result<LoopOutput>
  where
    D: DataSource,
    D::Error: std::error::Error + Send + Sync + 'static,
    M: Model + ?Sized,
    M::Error: std::error::Error + Send + Sync + 'static,
  {
    let total = source.num_images();
    let num_batches = source.num_batches();
    let mut profiler = Profiler::new([INFER, FORWARD]);
    let mut accumulated = Accumulated::with_capacity(num_batches);
    let mut reports = Vec::new();

    let mut scope = ModeScope::enter(model, self.mode);
    // infer 计时覆盖取批次、前向与累积的整个步骤
    profiler.start(INFER);
    for (i, batch) in source.batches().enumerate() {
      let batch = batch?;
      debug!("第 {} 批: {} 张图片, ids {:?}", i, batch.len(), batch.ids());

      profiler.start(FORWARD);
      let prediction = scope.forward(batch.data())?;
      profiler.stop(FORWARD);

      let (_, ids, ratios) = batch.into_parts();
      accumulated.push(prediction, &ids, &ratios)?;

      profiler.stop(INFER);
      profiler.bump(INFER);
      profiler.bump(FORWARD);

      let due = profiler.total(INFER) > self.report_interval || i + 1 == num_batches;
      if self.verbose && due {
        let report = ProgressReport {
          processed: ((i + 1) * self.batch_size).min(total),
          total,
          batch_size: self.batch_size,
          infer: profiler.mean(INFER),
          forward: profiler.mean(FORWARD),
        };
        info!("{}", report);
        reports.push(report);
        profiler.reset();
      }
      profiler.start(INFER);
    }

    Ok(LoopOutput {
      accumulated,
      reports,
    })
  }
}

/// 完整的推理任务：推理、汇总，主进程解码并发布结果
pub struct InferTask<C> {
  config: InferConfig,
  group: C,
}

impl<C: Collective> InferTask<C> {
  pub fn new(config: InferConfig, group: C) -> Self {
    Self { config, group }
  }

  fn banner(&self, backend: BackendKind, model_name: &str) {
    let world = self.config.world.max(1);
    let precision = match backend {
      BackendKind::Engine => "unknown".to_string(),
      BackendKind::Native => self.config.precision().to_string(),
    };
    info!("加载模型 {}...", model_name);
    info!("   backend: {}", backend);
    info!("    device: {} {}", world, if world == 1 { "worker" } else { "workers" });
    info!("     batch: {}, precision: {}", self.config.batch_size, precision);
    info!("开始推理...");
  }
}

impl<D, M, O, C> Task<D, M, O> for InferTask<C>
where
  C: Collective,
  D: DataSource,
  D::Error: std::error::Error + Send + Sync + 'static,
  M: Model,
  M::Error: std::error::Error + Send + Sync + 'static,
  O: Publish,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  /// 仅主进程返回发布结果
  type Output = Option<Outcome>;
  type Error = anyhow::Error;

  fn run_task(self, source: D, mut model: M, output: O) -> Result<Self::Output, Self::Error> {
    self.config.validate()?;
    anyhow::ensure!(
      self.group.world() == self.config.world.max(1) && self.group.rank() == self.config.rank,
      "进程组 (rank {}, world {}) 与配置 (rank {}, world {}) 不一致",
      self.group.rank(),
      self.group.world(),
      self.config.rank,
      self.config.world
    );

    if self.config.is_master() && self.config.verbose {
      self.banner(model.backend(), std::any::type_name::<M>());
    }

    let looped = InferenceLoop::new(self.config.batch_size, self.config.execution_mode())
      .with_verbose(self.config.verbose)
      .run(&source, &mut model)?;

    if self.config.verbose {
      info!("汇总结果...");
    }
    let aggregated = aggregate(looped.accumulated, &self.group)?;
    if !self.config.is_master() {
      debug!("rank {} 汇总完成，退出", self.config.rank);
      return Ok(None);
    }

    let manifest = source.manifest();
    let taxonomy = manifest.taxonomy()?;
    let detections = decode(&aggregated, taxonomy.as_deref())?;
    let outcome = output.publish(manifest, &detections)?;
    Ok(Some(outcome))
  }
}
