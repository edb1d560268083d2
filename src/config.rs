// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
//! FGFA 配置 - 通过JSON文件调整参数

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::SamplerConfig;
use crate::error::Result;
use crate::ort_backend::OrtEP;

/// 特征聚合器参数 (embedding 卷积栈)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    #[serde(alias = "num_embed_layers")]
    pub num_convs: usize, // 卷积层数, >= 1
    #[serde(alias = "embed_channels")]
    pub channels: usize, // 输入/中间通道数
    #[serde(alias = "embed_kernel_size")]
    pub kernel_size: usize, // 卷积核大小 (奇数)
    pub norm: bool,         // 中间层 BatchNorm
    pub act: bool,          // 中间层 ReLU
    pub pretrained: Option<PathBuf>, // JSON 权重, 为空时随机初始化
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            num_convs: 1,
            channels: 512,
            kernel_size: 3,
            norm: false,
            act: true,
            pretrained: None,
        }
    }
}

/// 运行设备
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Trt,
}

impl Device {
    pub fn to_ep(self, device_id: i32) -> OrtEP {
        match self {
            Device::Cpu => OrtEP::CPU,
            Device::Cuda => OrtEP::CUDA(device_id),
            Device::Trt => OrtEP::Trt(device_id),
        }
    }
}

/// 光流网络参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionConfig {
    #[serde(rename = "type")]
    pub kind: String, // 光流网络类型 (目前只有 FlowNetSimple)
    pub pretrained: Option<PathBuf>, // 预训练 ONNX 权重
    pub img_scale_factor: f32,       // 输入图像缩放倍数
    pub device: Device,
    pub device_id: i32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            kind: "FlowNetSimple".to_string(),
            pretrained: None,
            img_scale_factor: 0.5,
            device: Device::Cpu,
            device_id: 0,
        }
    }
}

/// 检测器参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub backbone: Option<PathBuf>,  // 主干网络 ONNX (每个输出为一层特征)
    pub bbox_head: Option<PathBuf>, // 单阶段检测头 ONNX
    pub num_classes: usize,
    pub conf_threshold: f32, // 检测置信度阈值
    pub iou_threshold: f32,  // NMS IOU阈值
    pub max_per_img: usize,
    pub device: Device,
    pub device_id: i32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backbone: None,
            bbox_head: None,
            num_classes: 30,
            conf_threshold: 0.05,
            iou_threshold: 0.5,
            max_per_img: 100,
            device: Device::Cpu,
            device_id: 0,
        }
    }
}

/// 完整配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FgfaConfig {
    #[serde(rename = "ref_img_sampler", alias = "sampler")]
    pub sampler: SamplerConfig,
    pub aggregator: AggregatorConfig,
    pub motion: MotionConfig,
    pub detector: DetectorConfig,
    pub test_mode: bool,
    pub seed: u64,
}

impl Default for FgfaConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            aggregator: AggregatorConfig::default(),
            motion: MotionConfig::default(),
            detector: DetectorConfig::default(),
            test_mode: false,
            seed: 0,
        }
    }
}

impl FgfaConfig {
    /// 从JSON文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        info!("✅ 配置已从 {} 加载", path.display());
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 打印当前配置
    pub fn summary(&self) {
        info!("🎛️  当前 FGFA 配置:");
        info!(
            "  采样: {} | 窗口 {:?} | 参考帧 {} | 步长 {}",
            self.sampler.policy, self.sampler.window, self.sampler.num_refs, self.sampler.stride
        );
        info!(
            "  聚合: {} 层卷积 | {} 通道 | kernel {}",
            self.aggregator.num_convs, self.aggregator.channels, self.aggregator.kernel_size
        );
        info!(
            "  光流: {} | 权重 {:?} | {:?}",
            self.motion.kind, self.motion.pretrained, self.motion.device
        );
        info!(
            "  检测: {} 类 | conf {:.2} | iou {:.2}",
            self.detector.num_classes, self.detector.conf_threshold, self.detector.iou_threshold
        );
    }
}

/// 命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "FGFA 视频目标检测", long_about = None)]
pub struct Args {
    /// 配置文件 (JSON), 不存在时使用默认值
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 帧目录 (按文件名排序视为一个视频)
    #[arg(short, long)]
    pub frames: PathBuf,

    /// 主干网络 ONNX
    #[arg(long)]
    pub backbone: Option<PathBuf>,

    /// 检测头 ONNX
    #[arg(long)]
    pub bbox_head: Option<PathBuf>,

    /// 光流网络 ONNX
    #[arg(long)]
    pub flownet: Option<PathBuf>,

    /// 使用CUDA
    #[arg(long)]
    pub cuda: bool,

    /// 使用TensorRT
    #[arg(long)]
    pub trt: bool,

    /// 设备id
    #[arg(long, default_value_t = 0)]
    pub device_id: i32,

    /// 固定采样步长
    #[arg(long)]
    pub stride: Option<usize>,

    /// 日志级别 (trace/debug/info/warn/error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn device(&self) -> Device {
        if self.trt {
            Device::Trt
        } else if self.cuda {
            Device::Cuda
        } else {
            Device::Cpu
        }
    }

    /// 命令行参数覆盖配置文件
    pub fn apply(&self, config: &mut FgfaConfig) {
        if let Some(p) = &self.backbone {
            config.detector.backbone = Some(p.clone());
        }
        if let Some(p) = &self.bbox_head {
            config.detector.bbox_head = Some(p.clone());
        }
        if let Some(p) = &self.flownet {
            config.motion.pretrained = Some(p.clone());
        }
        if self.cuda || self.trt {
            config.detector.device = self.device();
            config.detector.device_id = self.device_id;
            config.motion.device = self.device();
            config.motion.device_id = self.device_id;
        }
        if let Some(stride) = self.stride {
            config.sampler.stride = stride;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FrameRange, SamplingPolicy};

    #[test]
    fn test_defaults() {
        let c = FgfaConfig::default();
        assert_eq!(c.aggregator.num_convs, 1);
        assert_eq!(c.aggregator.channels, 512);
        assert_eq!(c.aggregator.kernel_size, 3);
        assert_eq!(c.sampler.window, FrameRange::Symmetric(9));
        assert_eq!(c.sampler.num_refs, 2);
        assert_eq!(c.sampler.policy, SamplingPolicy::BilateralUniform);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fgfa.json");
        let mut c = FgfaConfig::default();
        c.sampler = SamplerConfig::test_default();
        c.motion.pretrained = Some(PathBuf::from("flownet.onnx"));
        c.save(&path).unwrap();
        let loaded = FgfaConfig::load(&path).unwrap();
        assert_eq!(loaded, c);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "ref_img_sampler": {"frame_range": 3, "method": "uniform"},
            "aggregator": {"num_embed_layers": 3, "embed_channels": 256}
        }"#;
        let c: FgfaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.sampler.window, FrameRange::Symmetric(3));
        assert_eq!(c.sampler.policy, SamplingPolicy::Uniform);
        assert_eq!(c.aggregator.num_convs, 3);
        assert_eq!(c.aggregator.channels, 256);
        assert_eq!(c.aggregator.kernel_size, 3);
        assert_eq!(c.motion.device, Device::Cpu);
    }

    #[test]
    fn test_option_names_are_honored() {
        let json = r#"{
            "sampler": {"window": [-2, 2], "num_refs": 4, "policy": "fixed-stride", "stride": 3},
            "aggregator": {"num_convs": 2}
        }"#;
        let c: FgfaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.sampler.window, FrameRange::Bounds(vec![-2, 2]));
        assert_eq!(c.sampler.num_refs, 4);
        assert_eq!(c.sampler.stride, 3);
        assert_eq!(c.sampler.policy, SamplingPolicy::TestWithFixStride);
        assert_eq!(c.aggregator.num_convs, 2);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        for json in [
            r#"{"samplr": {}}"#,
            r#"{"sampler": {"num_ref": 3}}"#,
            r#"{"motion": {"img_scale": 0.5}}"#,
            r#"{"detector": {"conf": 0.3}}"#,
        ] {
            assert!(serde_json::from_str::<FgfaConfig>(json).is_err(), "{}", json);
        }
    }

    #[test]
    fn test_load_missing_file() {
        assert!(FgfaConfig::load("/nonexistent/fgfa.json").is_err());
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "fgfa", "--frames", "video", "--flownet", "f.onnx", "--cuda", "--device-id", "1",
            "--stride", "2",
        ]);
        let mut c = FgfaConfig::default();
        args.apply(&mut c);
        assert_eq!(c.motion.pretrained, Some(PathBuf::from("f.onnx")));
        assert_eq!(c.motion.device.to_ep(c.motion.device_id), OrtEP::CUDA(1));
        assert_eq!(c.sampler.stride, 2);
    }
}
