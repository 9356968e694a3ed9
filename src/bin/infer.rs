// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/bin/infer.rs - 批量推理与评估入口
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

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{Level, info};
use url::Url;

use qianliyan::{
  FromUrl,
  config::InferConfig,
  distributed::{Collective, Standalone, ThreadGroup},
  input::{ImageDirectory, ResizeOptions},
  manifest::Manifest,
  model::{Model, ReplayModel, ReplayModelBuilder},
  output::{CocoEvaluator, EvaluationOutput, Outcome},
  task::{InferTask, Task},
};

/// Qianliyan 批量推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 replay:///data/run.json?backend=engine
  /// 多进程时地址中的 `{rank}` 替换为进程编号
  #[arg(long, value_name = "MODEL")]
  pub model: String,

  /// 图片目录
  #[arg(long, value_name = "DIR")]
  pub images: PathBuf,

  /// COCO 格式清单，缺省时枚举图片目录
  #[arg(long, value_name = "FILE")]
  pub annotations: Option<PathBuf>,

  /// 检测结果输出文件
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,

  /// 短边缩放目标
  #[arg(long, default_value_t = 800)]
  pub resize: u32,

  /// 长边上限
  #[arg(long, default_value_t = 1333)]
  pub max_size: u32,

  #[arg(long, default_value_t = 2)]
  pub batch_size: usize,

  /// 关闭混合精度
  #[arg(long)]
  pub full_precision: bool,

  /// 工作进程数，0 表示单进程
  #[arg(long, default_value_t = 0)]
  pub world: usize,

  /// 不输出进度
  #[arg(long, short)]
  pub quiet: bool,

  /// 输出调试日志
  #[arg(long, short)]
  pub verbose: bool,
}

fn load_model(pattern: &str, rank: usize) -> Result<ReplayModel> {
  let url = Url::parse(&pattern.replace("{rank}", &rank.to_string()))?;
  Ok(ReplayModelBuilder::from_url(&url)?.build()?)
}

fn run_rank<C: Collective>(
  config: InferConfig,
  group: C,
  images: &Path,
  manifest: Manifest,
  model: ReplayModel,
) -> Result<Option<Outcome>> {
  let mut options = ResizeOptions {
    resize: config.resize,
    max_size: config.max_size,
    stride: model.stride(),
    fixed_size: None,
  };
  if model.backend().has_fixed_input()
    && let Some((height, width)) = model.input_size()
  {
    options.max_size = height.max(width);
    options.fixed_size = Some((height, width));
  }

  let source = ImageDirectory::new(
    images,
    manifest,
    options,
    config.batch_size,
    config.rank,
    config.world,
  )?;
  let output = EvaluationOutput::new(config.detections_file.clone(), CocoEvaluator);
  InferTask::new(config, group).run_task(source, model, output)
}

fn main() -> Result<()> {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
    .init();

  let config = InferConfig {
    detections_file: args.output.clone(),
    resize: args.resize,
    max_size: args.max_size,
    batch_size: args.batch_size,
    mixed_precision: !args.full_precision,
    world: args.world,
    rank: 0,
    verbose: !args.quiet,
  };
  config.validate()?;

  info!("模型地址: {}", args.model);
  info!("图片目录: {}", args.images.display());
  let manifest = match &args.annotations {
    Some(path) => Manifest::load(path)?,
    None => Manifest::synthesize(&args.images)?,
  };

  let world = config.world.max(1);
  let models = (0..world)
    .map(|rank| load_model(&args.model, rank))
    .collect::<Result<Vec<_>>>()?;

  let outcome = if world == 1 {
    let model = models
      .into_iter()
      .next()
      .ok_or_else(|| anyhow!("没有可用的模型"))?;
    run_rank(config, Standalone, &args.images, manifest, model)?
  } else {
    info!("启动 {} 个工作线程", world);
    std::thread::scope(|scope| -> Result<Option<Outcome>> {
      let handles: Vec<_> = ThreadGroup::create(world)
        .into_iter()
        .zip(models)
        .map(|(member, model)| {
          let config = InferConfig {
            rank: member.rank(),
            ..config.clone()
          };
          let manifest = manifest.clone();
          let images = args.images.as_path();
          scope.spawn(move || run_rank(config, member, images, manifest, model))
        })
        .collect();

      let mut outcome = None;
      for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
          .join()
          .map_err(|_| anyhow!("rank {} 线程异常退出", rank))??;
        if rank == 0 {
          outcome = result;
        }
      }
      Ok(outcome)
    })?
  };

  match outcome {
    Some(Outcome::NoDetections) => println!("No detections!"),
    Some(Outcome::Published { written, .. }) => {
      if let Some(path) = written {
        info!("检测结果已写入 {}", path.display());
      }
    }
    None => {}
  }
  info!("完成");
  Ok(())
}
