// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/profiler.rs - 命名计时器
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

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 单个计时器的累计状态
#[derive(Debug, Clone, Default)]
pub struct ProfilerSample {
  started: Option<Instant>,
  total: Duration,
  count: u64,
}

impl ProfilerSample {
  pub fn total(&self) -> Duration {
    self.total
  }

  pub fn count(&self) -> u64 {
    self.count
  }

  /// 平均耗时，计数为零时按 1 计算
  pub fn mean(&self) -> Duration {
    self.total.div_f64(self.count.max(1) as f64)
  }
}

/// 命名计时器集合
///
/// `stop` 只累计时间，`bump` 只累计次数，两者互不影响，
/// 因此“累计秒数”和“统计批次数”可以分别维护。
#[derive(Debug, Clone, Default)]
pub struct Profiler {
  samples: HashMap<String, ProfilerSample>,
}

impl Profiler {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let samples = names
      .into_iter()
      .map(|name| (name.into(), ProfilerSample::default()))
      .collect();
    Self { samples }
  }

  fn sample_mut(&mut self, name: &str) -> &mut ProfilerSample {
    self.samples.entry(name.to_string()).or_default()
  }

  pub fn start(&mut self, name: &str) {
    self.sample_mut(name).started = Some(Instant::now());
  }

  pub fn stop(&mut self, name: &str) {
    let sample = self.sample_mut(name);
    if let Some(started) = sample.started.take() {
      sample.total += started.elapsed();
    }
  }

  pub fn bump(&mut self, name: &str) {
    self.sample_mut(name).count += 1;
  }

  pub fn total(&self, name: &str) -> Duration {
    self
      .samples
      .get(name)
      .map(ProfilerSample::total)
      .unwrap_or_default()
  }

  pub fn count(&self, name: &str) -> u64 {
    self.samples.get(name).map(ProfilerSample::count).unwrap_or(0)
  }

  pub fn mean(&self, name: &str) -> Duration {
    self
      .samples
      .get(name)
      .map(ProfilerSample::mean)
      .unwrap_or_default()
  }

  /// 清零所有累计值，保留已注册的名字
  pub fn reset(&mut self) {
    for sample in self.samples.values_mut() {
      sample.total = Duration::ZERO;
      sample.count = 0;
    }
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.samples.keys().map(String::as_str)
  }
}
