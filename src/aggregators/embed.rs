// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 基于 embedding 余弦相似度的特征聚合 (FGFA)

use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array4, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AggregatorConfig;
use crate::error::{FgfaError, Result};
use crate::utils::tensor::{conv2d, l2_normalize_channels, repeat_interleave, softmax};

/// 推理模式 BatchNorm
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    #[serde(default = "default_eps")]
    pub eps: f32,
}

fn default_eps() -> f32 {
    1e-5
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            eps: default_eps(),
        }
    }

    fn forward(&self, x: &mut Array4<f32>) -> Result<()> {
        let c = x.dim().1;
        if self.gamma.len() != c {
            return Err(FgfaError::Shape(format!(
                "batch norm has {} channels, input has {}",
                self.gamma.len(),
                c
            )));
        }
        for ch in 0..c {
            let scale = self.gamma[ch] / (self.running_var[ch] + self.eps).sqrt();
            let shift = self.beta[ch] - self.running_mean[ch] * scale;
            x.slice_mut(s![.., ch, .., ..])
                .mapv_inplace(|v| v * scale + shift);
        }
        Ok(())
    }
}

/// conv + (BN) + (ReLU)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvModule {
    pub weight: Array4<f32>,
    pub bias: Option<Array1<f32>>,
    pub norm: Option<BatchNorm>,
    pub act: bool,
}

impl ConvModule {
    /// Kaiming uniform 初始化, 有 BN 时不带偏置
    pub fn kaiming<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        norm: bool,
        act: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = (in_channels * kernel_size * kernel_size).max(1) as f32;
        let bound = (6.0 / fan_in).sqrt();
        let weight = Array4::from_shape_simple_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            || rng.gen_range(-bound..bound),
        );
        Self {
            weight,
            bias: if norm {
                None
            } else {
                Some(Array1::zeros(out_channels))
            },
            norm: norm.then(|| BatchNorm::new(out_channels)),
            act,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, _, kh, kw) = self.weight.dim();
        if kh != kw || kh % 2 == 0 {
            return Err(FgfaError::Configuration(format!(
                "embed conv kernel must be square and odd, got {}x{}",
                kh, kw
            )));
        }
        let mut y = conv2d(x, &self.weight, self.bias.as_ref(), (kh - 1) / 2)?;
        if let Some(bn) = &self.norm {
            bn.forward(&mut y)?;
        }
        if self.act {
            y.mapv_inplace(|v| v.max(0.0));
        }
        Ok(y)
    }
}

#[derive(Serialize, Deserialize)]
struct WeightFile {
    convs: Vec<ConvModule>,
}

/// Embedding 卷积栈 + softmax 余弦相似度加权求和
#[derive(Clone, Debug, PartialEq)]
pub struct EmbedAggregator {
    convs: Vec<ConvModule>,
}

impl EmbedAggregator {
    /// 按配置随机初始化 (最后一层不带 norm / act)
    pub fn new(cfg: &AggregatorConfig, seed: u64) -> Result<Self> {
        if cfg.num_convs == 0 {
            return Err(FgfaError::Configuration(
                "the number of embed convs must be at least 1".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let convs = (0..cfg.num_convs)
            .map(|i| {
                let last = i == cfg.num_convs - 1;
                ConvModule::kaiming(
                    cfg.channels,
                    cfg.channels,
                    cfg.kernel_size,
                    cfg.norm && !last,
                    cfg.act && !last,
                    &mut rng,
                )
            })
            .collect();
        Self::from_convs(convs)
    }

    pub fn from_convs(convs: Vec<ConvModule>) -> Result<Self> {
        if convs.is_empty() {
            return Err(FgfaError::Configuration(
                "the number of embed convs must be at least 1".to_string(),
            ));
        }
        for pair in convs.windows(2) {
            if pair[0].out_channels() != pair[1].in_channels() {
                return Err(FgfaError::Configuration(format!(
                    "embed conv channels do not chain: {} -> {}",
                    pair[0].out_channels(),
                    pair[1].in_channels()
                )));
            }
        }
        Ok(Self { convs })
    }

    /// 从JSON权重文件加载
    pub fn load_weights<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file: WeightFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        let agg = Self::from_convs(file.convs)?;
        info!(
            "✅ 聚合器权重已从 {} 加载 ({} 层)",
            path.display(),
            agg.convs.len()
        );
        Ok(agg)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = WeightFile {
            convs: self.convs.clone(),
        };
        fs::write(path, serde_json::to_string(&file)?)?;
        Ok(())
    }

    pub fn convs(&self) -> &[ConvModule] {
        &self.convs
    }

    fn embed(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let mut y = self.convs[0].forward(x)?;
        for conv in &self.convs[1..] {
            y = conv.forward(&y)?;
        }
        Ok(l2_normalize_channels(&y))
    }

    /// 每个参考帧在每个像素上的聚合权重 (B, R, H, W), 沿 R 和为1
    ///
    /// # 参数
    /// - `x`: 关键帧特征 (B, C, H, W)
    /// - `ref_x`: 参考帧特征 (B·R, C, H, W), 第 b 个样本的参考帧位于 [b·R, (b+1)·R)
    pub fn weights(&self, x: &Array4<f32>, ref_x: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, c, h, w) = x.dim();
        let (rb, rc, rh, rw) = ref_x.dim();
        if b == 0 || rb == 0 || rb % b != 0 {
            return Err(FgfaError::Shape(format!(
                "reference batch {} is not a multiple of key batch {}",
                rb, b
            )));
        }
        if (c, h, w) != (rc, rh, rw) {
            return Err(FgfaError::Shape(format!(
                "key feature {:?} and reference features {:?} differ",
                x.dim(),
                ref_x.dim()
            )));
        }
        let num_refs = rb / b;

        let x_embed = repeat_interleave(&self.embed(x)?, num_refs);
        let ref_embed = self.embed(ref_x)?;

        // 逐像素余弦相似度 (B·R, H, W)
        let sim = (&ref_embed * &x_embed).sum_axis(Axis(1));
        let sim = sim.into_shape_with_order((b, num_refs, h, w))?;
        Ok(softmax(&sim, Axis(1)))
    }

    /// 聚合参考帧特征
    ///
    /// # Returns
    /// 加权求和后的特征 (B, C, H, W)
    pub fn aggregate(&self, x: &Array4<f32>, ref_x: &Array4<f32>) -> Result<Array4<f32>> {
        let ada_weights = self.weights(x, ref_x)?;
        let (b, num_refs, _, _) = ada_weights.dim();
        let (_, c, h, w) = ref_x.dim();

        let mut agg = Array4::<f32>::zeros((b, c, h, w));
        for (bi, mut out) in agg.axis_iter_mut(Axis(0)).enumerate() {
            for r in 0..num_refs {
                let feat = ref_x.index_axis(Axis(0), bi * num_refs + r);
                let weight = ada_weights.slice(s![bi, r, .., ..]);
                Zip::from(&mut out)
                    .and(&feat)
                    .and_broadcast(&weight)
                    .for_each(|o, &f, &wt| *o += f * wt);
            }
        }
        Ok(agg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn cfg(num_convs: usize, channels: usize) -> AggregatorConfig {
        AggregatorConfig {
            num_convs,
            channels,
            kernel_size: 3,
            norm: true,
            act: true,
            pretrained: None,
        }
    }

    fn feats(n: usize, c: usize, h: usize, w: usize, offset: f32) -> Array4<f32> {
        Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            ((b * 7 + ch * 3 + y * 5 + x) as f32 * 0.37 + offset).sin()
        })
    }

    #[test]
    fn test_zero_convs_is_configuration_error() {
        assert!(matches!(
            EmbedAggregator::new(&cfg(0, 4), 0),
            Err(FgfaError::Configuration(_))
        ));
    }

    #[test]
    fn test_last_conv_has_no_norm_or_act() {
        let agg = EmbedAggregator::new(&cfg(3, 4), 0).unwrap();
        let convs = agg.convs();
        assert_eq!(convs.len(), 3);
        assert!(convs[0].norm.is_some() && convs[0].act);
        assert!(convs[0].bias.is_none());
        assert!(convs[2].norm.is_none() && !convs[2].act);
        assert!(convs[2].bias.is_some());
    }

    #[test]
    fn test_single_reference_is_exact_identity() {
        let agg = EmbedAggregator::new(&cfg(2, 4), 7).unwrap();
        let x = feats(2, 4, 5, 6, 0.0);
        let ref_x = feats(2, 4, 5, 6, 1.3);
        let y = agg.aggregate(&x, &ref_x).unwrap();
        assert_eq!(y, ref_x);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let agg = EmbedAggregator::new(&cfg(1, 3), 1).unwrap();
        let x = feats(2, 3, 4, 4, 0.0);
        let ref_x = feats(6, 3, 4, 4, 0.5);
        let w = agg.weights(&x, &ref_x).unwrap();
        assert_eq!(w.dim(), (2, 3, 4, 4));
        for s in w.sum_axis(Axis(1)).iter() {
            assert_abs_diff_eq!(*s, 1.0, epsilon = 1e-5);
        }
        assert!(w.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_aggregate_is_convex_combination() {
        let agg = EmbedAggregator::new(&cfg(1, 2), 3).unwrap();
        let x = feats(1, 2, 3, 3, 0.0);
        // 两个参考帧为常数 1 和 3 → 结果在 [1, 3] 内
        let mut ref_x = Array4::<f32>::ones((2, 2, 3, 3));
        ref_x.index_axis_mut(Axis(0), 1).fill(3.0);
        let y = agg.aggregate(&x, &ref_x).unwrap();
        assert_eq!(y.dim(), (1, 2, 3, 3));
        assert!(y.iter().all(|&v| (1.0 - 1e-5..=3.0 + 1e-5).contains(&v)));
    }

    #[test]
    fn test_shape_errors() {
        let agg = EmbedAggregator::new(&cfg(1, 2), 0).unwrap();
        let x = feats(2, 2, 3, 3, 0.0);
        assert!(matches!(
            agg.aggregate(&x, &feats(3, 2, 3, 3, 0.0)),
            Err(FgfaError::Shape(_))
        ));
        assert!(matches!(
            agg.aggregate(&x, &feats(2, 2, 4, 3, 0.0)),
            Err(FgfaError::Shape(_))
        ));
    }

    #[test]
    fn test_weights_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embed.json");
        let agg = EmbedAggregator::new(&cfg(2, 3), 11).unwrap();
        agg.save_weights(&path).unwrap();
        let loaded = EmbedAggregator::load_weights(&path).unwrap();
        assert_eq!(loaded, agg);
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = EmbedAggregator::new(&cfg(1, 3), 5).unwrap();
        let b = EmbedAggregator::new(&cfg(1, 3), 5).unwrap();
        let c = EmbedAggregator::new(&cfg(1, 3), 6).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
