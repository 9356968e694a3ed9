// 该文件是 Qianliyan （千里眼） 项目的一部分。
// src/distributed.rs - 多进程结果汇总
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

use std::any::Any;
use std::cell::Cell;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{PredictionError, RawPrediction};

#[derive(Error, Debug, PartialEq)]
pub enum CollectiveError {
  #[error("rank {peer} 已断开")]
  PeerDisconnected { peer: usize },
  #[error("等待 rank {peer} 超时 ({timeout:?})")]
  Timeout { peer: usize, timeout: Duration },
  #[error("集合通信不同步: 期望第 {expected} 轮，rank {peer} 发来第 {found} 轮")]
  Desynchronized {
    peer: usize,
    expected: u64,
    found: u64,
  },
  #[error("rank {peer} 发来的数据类型不匹配")]
  TypeMismatch { peer: usize },
}

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
  #[error("集合通信错误: {0}")]
  Collective(#[from] CollectiveError),
  #[error("预测错误: {0}")]
  Prediction(#[from] PredictionError),
  #[error("批次含 {samples} 个样本，但 ids {ids} 个、ratios {ratios} 个")]
  RowMismatch {
    samples: usize,
    ids: usize,
    ratios: usize,
  },
}

/// 进程组集合通信
///
/// `all_gather` 是同步屏障：组内每个成员都必须以相同顺序调用，
/// 任一成员缺席时其余成员会一直阻塞（除非实现配置了超时）。
pub trait Collective {
  fn rank(&self) -> usize;

  fn world(&self) -> usize;

  /// 收集每个成员的值，按 rank 升序返回
  fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, CollectiveError>;
}

/// 单进程，不做任何通信
#[derive(Debug, Clone, Copy, Default)]
pub struct Standalone;

impl Collective for Standalone {
  fn rank(&self) -> usize {
    0
  }

  fn world(&self) -> usize {
    1
  }

  fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, CollectiveError> {
    Ok(vec![value])
  }
}

struct Envelope {
  round: u64,
  payload: Box<dyn Any + Send>,
}

/// 进程内的线程组，每个成员对应一个 rank
pub struct ThreadGroup;

impl ThreadGroup {
  /// 创建 `world` 个成员，下标即 rank
  pub fn create(world: usize) -> Vec<GroupMember> {
    let world = world.max(1);
    let mut senders: Vec<Vec<Sender<Envelope>>> =
      (0..world).map(|_| Vec::with_capacity(world)).collect();
    let mut receivers: Vec<Vec<Receiver<Envelope>>> =
      (0..world).map(|_| Vec::with_capacity(world)).collect();
    for src in 0..world {
      for dst in 0..world {
        let (tx, rx) = unbounded();
        senders[src].push(tx);
        receivers[dst].push(rx);
      }
    }

    senders
      .into_iter()
      .zip(receivers)
      .enumerate()
      .map(|(rank, (senders, receivers))| GroupMember {
        rank,
        world,
        senders,
        receivers,
        round: Cell::new(0),
        timeout: None,
      })
      .collect()
  }
}

/// 线程组成员
///
/// 每对成员之间有独立的 FIFO 通道，因此同一来源的消息按发送顺序到达。
/// 每次交换带有轮次号，轮次不一致时报告不同步。
pub struct GroupMember {
  rank: usize,
  world: usize,
  /// 下标为目标 rank
  senders: Vec<Sender<Envelope>>,
  /// 下标为来源 rank
  receivers: Vec<Receiver<Envelope>>,
  round: Cell<u64>,
  timeout: Option<Duration>,
}

impl GroupMember {
  /// 为每个来源的等待设置上限，默认无限等待
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  fn recv_from(&self, peer: usize) -> Result<Envelope, CollectiveError> {
    let receiver = &self.receivers[peer];
    match self.timeout {
      None => receiver
        .recv()
        .map_err(|_| CollectiveError::PeerDisconnected { peer }),
      Some(timeout) => receiver.recv_timeout(timeout).map_err(|e| match e {
        RecvTimeoutError::Timeout => CollectiveError::Timeout { peer, timeout },
        RecvTimeoutError::Disconnected => CollectiveError::PeerDisconnected { peer },
      }),
    }
  }
}

impl Collective for GroupMember {
  fn rank(&self) -> usize {
    self.rank
  }

  fn world(&self) -> usize {
    self.world
  }

  fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, CollectiveError> {
    let round = self.round.get();
    self.round.set(round + 1);
    debug!("rank {} 进入第 {} 轮交换", self.rank, round);

    for (peer, sender) in self.senders.iter().enumerate() {
      let envelope = Envelope {
        round,
        payload: Box::new(value.clone()),
      };
      sender
        .send(envelope)
        .map_err(|_| CollectiveError::PeerDisconnected { peer })?;
    }

    let mut gathered = Vec::with_capacity(self.world);
    for peer in 0..self.world {
      let envelope = self.recv_from(peer)?;
      if envelope.round != round {
        return Err(CollectiveError::Desynchronized {
          peer,
          expected: round,
          found: envelope.round,
        });
      }
      let value = envelope
        .payload
        .downcast::<T>()
        .map_err(|_| CollectiveError::TypeMismatch { peer })?;
      gathered.push(*value);
    }
    Ok(gathered)
  }
}

/// 单进程累积的原始预测，按批次顺序保存，汇总时一次性拼接
#[derive(Debug, Clone, Default)]
pub struct Accumulated {
  parts: Vec<RawPrediction>,
  ids: Vec<i64>,
  ratios: Vec<f32>,
}

impl Accumulated {
  pub fn with_capacity(batches: usize) -> Self {
    Self {
      parts: Vec::with_capacity(batches),
      ids: Vec::new(),
      ratios: Vec::new(),
    }
  }

  pub fn push(
    &mut self,
    prediction: RawPrediction,
    ids: &[i64],
    ratios: &[f32],
  ) -> Result<(), AggregateError> {
    let samples = prediction.samples();
    if ids.len() != samples || ratios.len() != samples {
      return Err(AggregateError::RowMismatch {
        samples,
        ids: ids.len(),
        ratios: ratios.len(),
      });
    }
    self.parts.push(prediction);
    self.ids.extend_from_slice(ids);
    self.ratios.extend_from_slice(ratios);
    Ok(())
  }

  /// 已累积的批次数
  pub fn batches(&self) -> usize {
    self.parts.len()
  }

  pub fn samples(&self) -> usize {
    self.ids.len()
  }

  pub fn concat(self) -> Aggregated {
    Aggregated {
      prediction: RawPrediction::concat(&self.parts),
      ids: self.ids,
      ratios: self.ratios,
    }
  }
}

/// 汇总后的结果，多进程时每个 rank 上完全一致
///
/// 预测行数、ids 与 ratios 长度始终相同。
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
  prediction: RawPrediction,
  ids: Vec<i64>,
  ratios: Vec<f32>,
}

impl Aggregated {
  pub fn new(
    prediction: RawPrediction,
    ids: Vec<i64>,
    ratios: Vec<f32>,
  ) -> Result<Self, AggregateError> {
    let samples = prediction.samples();
    if ids.len() != samples || ratios.len() != samples {
      return Err(AggregateError::RowMismatch {
        samples,
        ids: ids.len(),
        ratios: ratios.len(),
      });
    }
    Ok(Self {
      prediction,
      ids,
      ratios,
    })
  }

  pub fn prediction(&self) -> &RawPrediction {
    &self.prediction
  }

  pub fn ids(&self) -> &[i64] {
    &self.ids
  }

  pub fn ratios(&self) -> &[f32] {
    &self.ratios
  }

  pub fn samples(&self) -> usize {
    self.ids.len()
  }
}

/// 拼接本进程的结果，并在 world > 1 时与其他 rank 交换
///
/// scores、boxes、classes、ids、ratios 各自独立交换，拼接顺序为 rank 升序。
pub fn aggregate<C: Collective>(
  accumulated: Accumulated,
  group: &C,
) -> Result<Aggregated, AggregateError> {
  let local = accumulated.concat();
  if group.world() <= 1 {
    return Ok(local);
  }

  info!(
    "rank {} 等待与其余 {} 个进程交换结果",
    group.rank(),
    group.world() - 1
  );
  let Aggregated {
    prediction,
    ids,
    ratios,
  } = local;
  let (scores, boxes, classes) = prediction.into_parts();

  let scores = group.all_gather(scores)?;
  let boxes = group.all_gather(boxes)?;
  let classes = group.all_gather(classes)?;
  let ids = group.all_gather(ids)?;
  let ratios = group.all_gather(ratios)?;

  let parts = scores
    .into_iter()
    .zip(boxes)
    .zip(classes)
    .map(|((s, b), c)| RawPrediction::new(s, b, c))
    .collect::<Result<Vec<_>, _>>()?;
  let prediction = RawPrediction::concat(&parts);
  let aggregated = Aggregated::new(prediction, ids.concat(), ratios.concat())?;
  debug!("汇总完成，共 {} 个样本", aggregated.samples());
  Ok(aggregated)
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array2, Array3};

  fn prediction(first_score: f32, samples: usize, candidates: usize) -> RawPrediction {
    let scores = Array2::from_shape_fn((samples, candidates), |(i, j)| {
      first_score + i as f32 + j as f32 / 10.0
    });
    RawPrediction::new(
      scores,
      Array3::zeros((samples, candidates, 4)),
      Array2::zeros((samples, candidates)),
    )
    .unwrap()
  }

  #[test]
  fn all_gather_orders_by_rank() {
    let members = ThreadGroup::create(3);
    let results: Vec<_> = std::thread::scope(|scope| {
      let handles: Vec<_> = members
        .into_iter()
        .map(|member| scope.spawn(move || member.all_gather(member.rank() * 10)))
        .collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in results {
      assert_eq!(result.unwrap(), [0, 10, 20]);
    }
  }

  #[test]
  fn timeout_then_desynchronized() {
    let mut members = ThreadGroup::create(2);
    let m1 = members.pop().unwrap();
    let m0 = members.pop().unwrap().with_timeout(Duration::from_millis(20));

    assert_eq!(
      m0.all_gather(1),
      Err(CollectiveError::Timeout {
        peer: 1,
        timeout: Duration::from_millis(20)
      })
    );
    assert_eq!(m1.all_gather(2).unwrap(), [1, 2]);
    assert_eq!(
      m0.all_gather(3),
      Err(CollectiveError::Desynchronized {
        peer: 1,
        expected: 1,
        found: 0
      })
    );
  }

  #[test]
  fn reports_type_mismatch_and_disconnect() {
    let mut members = ThreadGroup::create(2);
    let m1 = members.pop().unwrap();
    let m0 = members.pop().unwrap().with_timeout(Duration::from_millis(10));

    m0.all_gather(7u32).unwrap_err();
    assert_eq!(
      m1.all_gather("seven"),
      Err(CollectiveError::TypeMismatch { peer: 0 })
    );

    let members = ThreadGroup::create(2);
    let mut members = members.into_iter();
    let m0 = members.next().unwrap();
    drop(members);
    assert_eq!(
      m0.all_gather(1),
      Err(CollectiveError::PeerDisconnected { peer: 1 })
    );
  }

  #[test]
  fn standalone_concatenates_locally() {
    let mut acc = Accumulated::with_capacity(2);
    acc.push(prediction(0.5, 2, 3), &[0, 1], &[1.0, 2.0]).unwrap();
    acc.push(prediction(0.1, 1, 3), &[2], &[1.0]).unwrap();
    assert_eq!(acc.batches(), 2);

    let aggregated = aggregate(acc, &Standalone).unwrap();
    assert_eq!(aggregated.prediction.samples(), 3);
    assert_eq!(aggregated.ids, [0, 1, 2]);
    assert_eq!(aggregated.ratios, [1.0, 2.0, 1.0]);
    assert_eq!(aggregated.prediction.scores()[[2, 0]], 0.1);
  }

  #[test]
  fn push_rejects_misattributed_rows() {
    let mut acc = Accumulated::default();
    assert!(matches!(
      acc.push(prediction(0.5, 2, 1), &[0], &[1.0, 1.0]),
      Err(AggregateError::RowMismatch { .. })
    ));
  }

  #[test]
  fn aggregated_requires_matching_rows() {
    assert_eq!(
      Aggregated::new(prediction(0.5, 1, 2), vec![0, 1], vec![1.0, 1.0]),
      Err(AggregateError::RowMismatch {
        samples: 1,
        ids: 2,
        ratios: 2
      })
    );
    assert!(matches!(
      Aggregated::new(prediction(0.5, 2, 2), vec![0, 1], vec![1.0]),
      Err(AggregateError::RowMismatch { ratios: 1, .. })
    ));
    let aggregated = Aggregated::new(prediction(0.5, 2, 2), vec![0, 1], vec![1.0, 2.0]).unwrap();
    assert_eq!(aggregated.ids(), [0, 1]);
    assert_eq!(aggregated.ratios(), [1.0, 2.0]);
  }

  #[test]
  fn threads_agree_on_aggregated_result() {
    let members = ThreadGroup::create(2);
    let results: Vec<_> = std::thread::scope(|scope| {
      let handles: Vec<_> = members
        .into_iter()
        .map(|member| {
          scope.spawn(move || {
            let rank = member.rank();
            let mut acc = Accumulated::default();
            // 两个 rank 的候选框数不同
            acc
              .push(prediction(rank as f32, 1, 2 + rank), &[rank as i64], &[1.0])
              .unwrap();
            aggregate(acc, &member).unwrap()
          })
        })
        .collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results[0], results[1]);
    let aggregated = &results[0];
    assert_eq!(aggregated.ids, [0, 1]);
    assert_eq!(aggregated.prediction.candidates(), 3);
    assert_eq!(aggregated.prediction.scores()[[0, 2]], 0.0);
    assert!((aggregated.prediction.scores()[[1, 2]] - 1.2).abs() < 1e-6);
  }
}
