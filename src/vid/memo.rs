// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 流式推理的参考帧缓存 (sliding window, FIFO)

use std::collections::VecDeque;

use ndarray::{Array4, Axis};
use tracing::debug;

use crate::error::{FgfaError, Result};
use crate::utils::tensor::cat;

/// 一个视频内的参考帧图像与各层特征
///
/// 每个条目对应一帧, 形状均为 (1, C, H, W); 条目数在 `slide` 前后保持不变
#[derive(Debug, Clone)]
pub struct FeatureMemo {
    imgs: VecDeque<Array4<f32>>,
    feats: Vec<VecDeque<Array4<f32>>>, // [level][frame]
    key_index: usize,
    stride: Option<usize>, // None: 自适应步长 (整段视频预先缓存)
    last_frame_id: i64,
}

fn split_batch(x: &Array4<f32>) -> VecDeque<Array4<f32>> {
    x.axis_iter(Axis(0))
        .map(|v| v.insert_axis(Axis(0)).to_owned())
        .collect()
}

fn check_batches(imgs: &Array4<f32>, feats: &[Array4<f32>]) -> Result<()> {
    let n = imgs.dim().0;
    if n == 0 {
        return Err(FgfaError::Shape("no reference images to cache".to_string()));
    }
    if feats.is_empty() {
        return Err(FgfaError::Shape("no feature levels to cache".to_string()));
    }
    for (level, f) in feats.iter().enumerate() {
        if f.dim().0 != n {
            return Err(FgfaError::Shape(format!(
                "level {} has {} features for {} images",
                level,
                f.dim().0,
                n
            )));
        }
    }
    Ok(())
}

impl FeatureMemo {
    /// 用一个视频的初始参考帧 (N, C, H, W) 及其各层特征建立缓存
    pub fn init(
        imgs: &Array4<f32>,
        feats: &[Array4<f32>],
        key_index: usize,
        stride: Option<usize>,
    ) -> Result<Self> {
        check_batches(imgs, feats)?;
        let n = imgs.dim().0;
        if key_index >= n {
            return Err(FgfaError::State(format!(
                "key frame index {} outside a window of {} frames",
                key_index, n
            )));
        }
        debug!(
            "memo init: {} frames, {} levels, key index {}, stride {:?}",
            n,
            feats.len(),
            key_index,
            stride
        );
        Ok(Self {
            imgs: split_batch(imgs),
            feats: feats.iter().map(split_batch).collect(),
            key_index,
            stride,
            last_frame_id: 0,
        })
    }

    /// 追加新参考帧并丢弃同样数量的最旧条目
    pub fn slide(&mut self, imgs: &Array4<f32>, feats: &[Array4<f32>]) -> Result<()> {
        check_batches(imgs, feats)?;
        if feats.len() != self.feats.len() {
            return Err(FgfaError::Shape(format!(
                "memo holds {} levels, got {}",
                self.feats.len(),
                feats.len()
            )));
        }
        for img in split_batch(imgs) {
            self.imgs.push_back(img);
            self.imgs.pop_front();
        }
        for (cached, new) in self.feats.iter_mut().zip(feats) {
            for f in split_batch(new) {
                cached.push_back(f);
                cached.pop_front();
            }
        }
        debug!("memo slide: +{} frames, size {}", imgs.dim().0, self.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.imgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imgs.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.feats.len()
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn stride(&self) -> Option<usize> {
        self.stride
    }

    pub fn last_frame_id(&self) -> i64 {
        self.last_frame_id
    }

    pub(crate) fn set_last_frame_id(&mut self, frame_id: i64) {
        self.last_frame_id = frame_id;
    }

    /// 缓存的全部图像 (M, C, H, W)
    pub fn images(&self) -> Result<Array4<f32>> {
        let views: Vec<_> = self.imgs.iter().map(|x| x.view()).collect();
        cat(&views, Axis(0))
    }

    /// 第 `level` 层的全部特征 (M, C', H', W')
    pub fn feats(&self, level: usize) -> Result<Array4<f32>> {
        let cached = self.level(level)?;
        let views: Vec<_> = cached.iter().map(|x| x.view()).collect();
        cat(&views, Axis(0))
    }

    /// 关键帧位置的特征 (1, C', H', W')
    pub fn key_feat(&self, level: usize) -> Result<Array4<f32>> {
        let cached = self.level(level)?;
        cached.get(self.key_index).cloned().ok_or_else(|| {
            FgfaError::State(format!(
                "key frame index {} outside a window of {} frames",
                self.key_index,
                cached.len()
            ))
        })
    }

    fn level(&self, level: usize) -> Result<&VecDeque<Array4<f32>>> {
        self.feats.get(level).ok_or_else(|| {
            FgfaError::Shape(format!(
                "feature level {} not cached ({} levels)",
                level,
                self.feats.len()
            ))
        })
    }
}
