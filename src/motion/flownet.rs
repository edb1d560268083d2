// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// FlowNetSimple (ONNX 导出) 光流估计

use std::path::Path;

use ndarray::{s, Array4};
use tracing::debug;

use super::MotionEstimator;
use crate::dataset::ImgMeta;
use crate::error::{FgfaError, Result};
use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use crate::utils::interpolate::resize_bilinear;
use crate::utils::tensor::to_nchw;

/// FlowNet 训练时使用的图像均值 (RGB, 0-1)
const FLOW_IMG_MEAN: [f32; 3] = [0.411, 0.432, 0.45];

/// 网络下采样倍数, 输入尺寸需为其整数倍
const FLOW_STRIDE: usize = 64;

pub struct FlowNetOnnx {
    engine: OrtBackend,
    img_scale_factor: f32,
    flow_scale_factor: f32, // 网络输出乘以该系数得到像素位移
}

impl FlowNetOnnx {
    pub fn new<P: AsRef<Path>>(f: P, ep: OrtEP, img_scale_factor: f32) -> Result<Self> {
        if img_scale_factor <= 0.0 {
            return Err(FgfaError::Configuration(format!(
                "img_scale_factor must be positive, got {}",
                img_scale_factor
            )));
        }
        let engine = OrtBackend::build(OrtConfig::new(f.as_ref(), ep))?;
        Ok(Self {
            engine,
            img_scale_factor,
            flow_scale_factor: 5.0,
        })
    }

    pub fn with_flow_scale(mut self, flow_scale_factor: f32) -> Self {
        self.flow_scale_factor = flow_scale_factor;
        self
    }

    /// 缩放到 64 的整数倍并减去均值
    fn preprocess(&self, pairs: &Array4<f32>) -> Array4<f32> {
        let (_, c, h, w) = pairs.dim();
        let th = scaled_size(h, self.img_scale_factor);
        let tw = scaled_size(w, self.img_scale_factor);
        let mut xs = resize_bilinear(pairs, (th, tw));
        if c % 3 == 0 {
            for ch in 0..c {
                let mean = FLOW_IMG_MEAN[ch % 3];
                xs.slice_mut(s![.., ch, .., ..]).mapv_inplace(|v| v - mean);
            }
        }
        xs
    }
}

fn scaled_size(size: usize, factor: f32) -> usize {
    let scaled = (size as f32 * factor).round() as usize;
    (scaled.div_ceil(FLOW_STRIDE) * FLOW_STRIDE).max(FLOW_STRIDE)
}

impl MotionEstimator for FlowNetOnnx {
    fn forward(&mut self, pairs: &Array4<f32>, _metas: &[ImgMeta]) -> Result<Array4<f32>> {
        let xs = self.preprocess(pairs);
        debug!("FlowNet input {:?}", xs.dim());
        let ys = self.engine.run(xs)?;
        let y = ys
            .into_iter()
            .next()
            .ok_or_else(|| FgfaError::Ort("flownet produced no outputs".to_string()))?;
        let mut flow = to_nchw(y)?;
        flow.mapv_inplace(|v| v * self.flow_scale_factor);
        Ok(flow)
    }
}

/// 零光流: 参考帧特征不做对齐, 直接参与聚合
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroMotion;

impl MotionEstimator for ZeroMotion {
    fn forward(&mut self, pairs: &Array4<f32>, _metas: &[ImgMeta]) -> Result<Array4<f32>> {
        let (m, _, h, w) = pairs.dim();
        Ok(Array4::zeros((m, 2, h, w)))
    }
}
