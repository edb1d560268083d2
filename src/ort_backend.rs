// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端 (CPU / CUDA / TensorRT)

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use ndarray::{Array4, ArrayD};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::{debug, info};

use crate::error::{ort_err, FgfaError, Result};

/// 执行设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

impl fmt::Display for OrtEP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrtEP::CPU => write!(f, "CPU"),
            OrtEP::CUDA(id) => write!(f, "CUDA:{}", id),
            OrtEP::Trt(id) => write!(f, "TensorRT:{}", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf, // onnx 文件
    pub ep: OrtEP,
    pub fp16: bool, // 仅 TensorRT 生效
    pub intra_threads: usize,
    pub profile: bool, // 打印推理耗时
}

impl OrtConfig {
    pub fn new<P: Into<PathBuf>>(f: P, ep: OrtEP) -> Self {
        Self {
            f: f.into(),
            ep,
            fp16: false,
            intra_threads: 0,
            profile: false,
        }
    }
}

/// 单输入多输出的 ONNX 会话
pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    input_name: String,
    output_names: Vec<String>,
    profile: bool,
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let mut builder = Session::builder()
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?;
        if config.intra_threads > 0 {
            builder = builder
                .with_intra_threads(config.intra_threads)
                .map_err(ort_err)?;
        }

        // 按优先级注册, 失败时回退到 CPU
        builder = match config.ep {
            OrtEP::CPU => builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(ort_err)?,
            OrtEP::CUDA(id) => builder
                .with_execution_providers([
                    CUDAExecutionProvider::default().with_device_id(id).build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(ort_err)?,
            OrtEP::Trt(id) => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(id)
                        .with_fp16(config.fp16)
                        .build(),
                    CUDAExecutionProvider::default().with_device_id(id).build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(ort_err)?,
        };

        let session = builder.commit_from_file(&config.f).map_err(ort_err)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| FgfaError::Ort(format!("{} has no inputs", config.f.display())))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            return Err(FgfaError::Ort(format!(
                "{} has no outputs",
                config.f.display()
            )));
        }

        info!(
            "📦 加载模型 {} | {} | 输入 {} | 输出 {:?}",
            config.f.display(),
            config.ep,
            input_name,
            output_names
        );

        Ok(Self {
            session,
            ep: config.ep,
            input_name,
            output_names,
            profile: config.profile,
        })
    }

    /// 推理, 按模型声明顺序返回全部输出
    pub fn run(&mut self, xs: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let t = Instant::now();
        let input = ort::value::Tensor::from_array(xs).map_err(ort_err)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(ort_err)?;

        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let value = outputs
                .get(name.as_str())
                .ok_or_else(|| FgfaError::Ort(format!("output '{}' not found", name)))?;
            let y = value.try_extract_array::<f32>().map_err(ort_err)?;
            ys.push(y.to_owned());
        }
        if self.profile {
            debug!("[ORT {}] {:?}", self.ep, t.elapsed());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}
