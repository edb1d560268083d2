// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 参考帧采样 (Reference-frame sampling)
//
// 训练: uniform / bilateral_uniform 在关键帧附近随机采样
// 测试: test_with_adaptive_stride 覆盖整段视频, test_with_fix_stride 滑动窗口

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::coco_vid::FrameInfo;
use crate::error::{FgfaError, Result};

/// 采样范围配置: 整数 k 表示 [-k, k], 或者显式的 [low, high]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameRange {
    Symmetric(i64),
    Bounds(Vec<i64>),
}

impl FrameRange {
    /// 校验并转换为采样窗口
    pub fn validate(&self) -> Result<SamplingWindow> {
        match self {
            FrameRange::Symmetric(k) => {
                if *k < 0 {
                    return Err(FgfaError::InvalidRange(format!(
                        "frame_range can not be a negative value, got {}",
                        k
                    )));
                }
                Ok(SamplingWindow { low: -k, high: *k })
            }
            FrameRange::Bounds(bounds) => {
                if bounds.len() != 2 {
                    return Err(FgfaError::InvalidRange(format!(
                        "the length must be 2, got {}",
                        bounds.len()
                    )));
                }
                let (low, high) = (bounds[0], bounds[1]);
                if low > 0 || high < 0 {
                    return Err(FgfaError::InvalidRange(format!(
                        "expected low <= 0 <= high, got [{}, {}]",
                        low, high
                    )));
                }
                Ok(SamplingWindow { low, high })
            }
        }
    }
}

impl From<i64> for FrameRange {
    fn from(k: i64) -> Self {
        FrameRange::Symmetric(k)
    }
}

impl From<[i64; 2]> for FrameRange {
    fn from(bounds: [i64; 2]) -> Self {
        FrameRange::Bounds(bounds.to_vec())
    }
}

/// 已校验的采样窗口, 满足 low <= 0 <= high
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingWindow {
    pub low: i64,
    pub high: i64,
}

impl SamplingWindow {
    /// high - low
    pub fn span(&self) -> usize {
        self.high.saturating_sub(self.low) as usize
    }

    /// 左侧跨度 |low|
    pub fn left_span(&self) -> usize {
        self.low.unsigned_abs() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.low == 0 && self.high == 0
    }
}

/// 采样策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SamplingPolicy {
    Uniform,
    BilateralUniform,
    TestWithAdaptiveStride,
    TestWithFixStride,
}

impl SamplingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingPolicy::Uniform => "uniform",
            SamplingPolicy::BilateralUniform => "bilateral_uniform",
            SamplingPolicy::TestWithAdaptiveStride => "test_with_adaptive_stride",
            SamplingPolicy::TestWithFixStride => "test_with_fix_stride",
        }
    }

    /// 仅用于测试阶段的策略
    pub fn is_test(&self) -> bool {
        matches!(
            self,
            SamplingPolicy::TestWithAdaptiveStride | SamplingPolicy::TestWithFixStride
        )
    }
}

impl FromStr for SamplingPolicy {
    type Err = FgfaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "uniform" => Ok(SamplingPolicy::Uniform),
            "bilateral_uniform" => Ok(SamplingPolicy::BilateralUniform),
            "test_with_adaptive_stride" | "adaptive_stride" => {
                Ok(SamplingPolicy::TestWithAdaptiveStride)
            }
            "test_with_fix_stride" | "fixed_stride" | "fix_stride" => {
                Ok(SamplingPolicy::TestWithFixStride)
            }
            other => Err(FgfaError::NotImplemented(format!(
                "sampling policy '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for SamplingPolicy {
    type Error = FgfaError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SamplingPolicy> for String {
    fn from(p: SamplingPolicy) -> Self {
        p.name().to_string()
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 参考帧采样参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    #[serde(rename = "frame_range", alias = "window")]
    pub window: FrameRange,
    pub stride: usize,
    #[serde(rename = "num_ref_imgs", alias = "num_refs")]
    pub num_refs: usize,
    #[serde(rename = "filter_key_img", alias = "filter_key_frame")]
    pub filter_key_frame: bool,
    #[serde(rename = "method", alias = "policy")]
    pub policy: SamplingPolicy,
    #[serde(rename = "return_key_img", alias = "return_key_frame")]
    pub return_key_frame: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            window: FrameRange::Symmetric(9),
            stride: 1,
            num_refs: 2,
            filter_key_frame: false,
            policy: SamplingPolicy::BilateralUniform,
            return_key_frame: true,
        }
    }
}

impl SamplerConfig {
    /// 测试阶段默认值: [-7, 7] 自适应步长
    pub fn test_default() -> Self {
        Self {
            window: FrameRange::Bounds(vec![-7, 7]),
            stride: 1,
            num_refs: 14,
            filter_key_frame: false,
            policy: SamplingPolicy::TestWithAdaptiveStride,
            return_key_frame: true,
        }
    }
}

/// 银行家舍入: round(4.5) == 4
pub fn round_half_even(x: f64) -> i64 {
    x.round_ties_even() as i64
}

/// 为关键帧采样参考帧
///
/// # 参数
/// - `key`: 关键帧信息, 固定步长策略会写入 `num_left_ref_imgs`/`frame_stride`
/// - `video`: 关键帧所在视频的全部帧, 按 frame_id 排序; `None` 表示不按视频加载
/// - `cfg`: 采样参数
/// - `rng`: 随机数源 (训练策略使用)
///
/// # Returns
/// 按 frame_id 排序的参考帧; `return_key_frame` 时关键帧排在最前
pub fn sample<R: Rng + ?Sized>(
    key: &mut FrameInfo,
    video: Option<&[FrameInfo]>,
    cfg: &SamplerConfig,
    rng: &mut R,
) -> Result<Vec<FrameInfo>> {
    let window = cfg.window.validate()?;

    let mut num_refs = cfg.num_refs;
    if cfg.policy.is_test() && window.span() != num_refs {
        warn!(
            "⚠️ frame_range[1] - frame_range[0] ({}) != num_ref_imgs ({}), use {}",
            window.span(),
            num_refs,
            window.span()
        );
        num_refs = window.span();
    }

    let refs = match video {
        Some(video) if key.frame_id >= 0 && !window.is_empty() => {
            let mut refs = select(key, video, window, cfg, num_refs, rng)?;
            refs.sort_by_key(|f| f.frame_id);
            refs
        }
        // 无视频结构: 直接复制关键帧
        _ => vec![key.clone(); num_refs],
    };

    if cfg.return_key_frame {
        let mut out = Vec::with_capacity(refs.len() + 1);
        out.push(key.clone());
        out.extend(refs);
        Ok(out)
    } else {
        Ok(refs)
    }
}

fn select<R: Rng + ?Sized>(
    key: &mut FrameInfo,
    video: &[FrameInfo],
    window: SamplingWindow,
    cfg: &SamplerConfig,
    num_refs: usize,
    rng: &mut R,
) -> Result<Vec<FrameInfo>> {
    let frame_id = key.frame_id as usize;
    if frame_id >= video.len() {
        return Err(FgfaError::Configuration(format!(
            "frame_id {} is outside the video ({} frames)",
            frame_id,
            video.len()
        )));
    }
    let last = video.len() - 1;
    let left = key.frame_id.saturating_add(window.low).max(0) as usize;
    let right = (key.frame_id.saturating_add(window.high).max(0) as usize).min(last);

    let key_id = key.id;
    let candidates = |range: &[FrameInfo]| -> Vec<FrameInfo> {
        range
            .iter()
            .filter(|f| !(cfg.filter_key_frame && f.id == key_id))
            .cloned()
            .collect()
    };

    let mut refs = Vec::new();
    match cfg.policy {
        SamplingPolicy::Uniform => {
            let valid = candidates(&video[left..=right]);
            let n = num_refs.min(valid.len());
            refs.extend(valid.choose_multiple(rng, n).cloned());
        }
        SamplingPolicy::BilateralUniform => {
            if num_refs % 2 != 0 {
                return Err(FgfaError::Configuration(format!(
                    "bilateral_uniform only supports an even number of reference frames, got {}",
                    num_refs
                )));
            }
            let half = num_refs / 2;
            for side in [&video[left..=frame_id], &video[frame_id..=right]] {
                let mut valid = candidates(side);
                if valid.len() < half {
                    // 候选不足时用关键帧自身补齐
                    valid = vec![key.clone(); half];
                }
                refs.extend(valid.choose_multiple(rng, half).cloned());
            }
        }
        SamplingPolicy::TestWithAdaptiveStride => {
            if frame_id == 0 {
                if num_refs == 1 {
                    refs.push(video[0].clone());
                } else if num_refs > 1 {
                    let stride = last as f64 / (num_refs - 1) as f64;
                    for i in 0..num_refs {
                        let idx = (round_half_even(i as f64 * stride) as usize).min(last);
                        refs.push(video[idx].clone());
                    }
                }
            }
        }
        SamplingPolicy::TestWithFixStride => {
            let stride = cfg.stride;
            if stride == 0 {
                return Err(FgfaError::Configuration(
                    "test_with_fix_stride requires stride >= 1".to_string(),
                ));
            }
            if frame_id == 0 {
                // 新视频: 左侧用第一帧补齐 (含关键帧自身)
                for _ in window.low..=0 {
                    refs.push(video[0].clone());
                }
                for i in 1..=window.high as usize {
                    refs.push(video[i.saturating_mul(stride).min(last)].clone());
                }
            } else if frame_id % stride == 0 {
                // 滑动窗口: 只推入一帧新参考帧
                let idx = frame_id
                    .saturating_add((window.high as usize).saturating_mul(stride))
                    .min(last);
                refs.push(video[idx].clone());
            }
            key.num_left_ref_imgs = Some(window.left_span());
            key.frame_stride = Some(stride);
        }
    }
    Ok(refs)
}
