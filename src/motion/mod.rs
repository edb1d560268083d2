// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 运动估计模块 (光流网络适配 + 特征对齐)
/// Motion estimation
pub mod flow;
pub mod flownet;

use std::str::FromStr;

use ndarray::Array4;

use crate::config::MotionConfig;
use crate::dataset::ImgMeta;
use crate::error::{FgfaError, Result};

pub use flow::flow_warp_feats;
pub use flownet::{FlowNetOnnx, ZeroMotion};

/// 光流估计接口
///
/// 输入为沿通道拼接的图像对 (M, 2·C, H, W), 输出光流 (M, 2, H', W')
pub trait MotionEstimator {
    /// 具体网络的前向计算
    fn forward(&mut self, pairs: &Array4<f32>, metas: &[ImgMeta]) -> Result<Array4<f32>>;

    /// 校验输入输出后调用 `forward`
    fn estimate(&mut self, pairs: &Array4<f32>, metas: &[ImgMeta]) -> Result<Array4<f32>> {
        let (m, c, _, _) = pairs.dim();
        if c == 0 || c % 2 != 0 {
            return Err(FgfaError::Shape(format!(
                "image pairs must have an even channel count, got {}",
                c
            )));
        }
        let flow = self.forward(pairs, metas)?;
        let (fm, fc, _, _) = flow.dim();
        if fm != m || fc != 2 {
            return Err(FgfaError::Shape(format!(
                "motion output must be ({}, 2, H, W), got {:?}",
                m,
                flow.dim()
            )));
        }
        Ok(flow)
    }
}

/// 支持的光流网络
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionType {
    FlowNetSimple,
    Zero, // 不估计运动, 光流恒为0
}

impl FromStr for MotionType {
    type Err = FgfaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "flownetsimple" | "flownet_simple" | "flownet" => Ok(MotionType::FlowNetSimple),
            "zero" | "none" | "identity" => Ok(MotionType::Zero),
            other => Err(FgfaError::NotImplemented(format!("motion type '{}'", other))),
        }
    }
}

/// 根据配置创建光流网络
pub fn build_motion(cfg: &MotionConfig) -> Result<Box<dyn MotionEstimator>> {
    match cfg.kind.parse::<MotionType>()? {
        MotionType::FlowNetSimple => {
            let Some(path) = &cfg.pretrained else {
                return Err(FgfaError::Configuration(
                    "FlowNetSimple requires pretrained onnx weights".to_string(),
                ));
            };
            let net = FlowNetOnnx::new(path, cfg.device.to_ep(cfg.device_id), cfg.img_scale_factor)?;
            Ok(Box::new(net))
        }
        MotionType::Zero => Ok(Box::new(ZeroMotion)),
    }
}
