// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 检测器接口与实现
///
/// # 架构说明
///
/// - **Backbone**: 图像 → 多层特征 `Vec<Array4<f32>>`
/// - **两阶段**: `RpnHead` 生成候选框 + `RoiHead` 分类回归
/// - **单阶段**: `BboxHead` 直接回归
///
/// 检测器在构造时确定为 `TwoStage` 或 `SingleStage`, 调用时不再探测
///
/// ## 使用示例
/// ```ignore
/// let detector = Detector::builder()
///     .backbone(Box::new(OnnxBackbone::new("backbone.onnx", OrtEP::CPU)?))
///     .bbox_head(Box::new(OnnxBboxHead::new("head.onnx", OrtEP::CPU, 30)?))
///     .build()?;
/// ```
pub mod onnx;

use std::collections::BTreeMap;

use ndarray::{Array2, Array4};
use tracing::warn;

use crate::dataset::{GroundTruth, ImgMeta};
use crate::error::{FgfaError, Result};
use crate::DetectionResult;

pub use onnx::{OnnxBackbone, OnnxBboxHead};

/// 损失名 → 标量
pub type Losses = BTreeMap<String, f32>;

/// 每张图的候选框 (K, 5): [x1, y1, x2, y2, score]
pub type Proposals = Vec<Array2<f32>>;

/// 一个批次的真值
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GtInstances {
    pub bboxes: Vec<Array2<f32>>, // 每张图 (K, 4) [x1, y1, x2, y2]
    pub labels: Vec<Vec<usize>>,
    pub bboxes_ignore: Option<Vec<Array2<f32>>>,
}

impl GtInstances {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl From<Vec<GroundTruth>> for GtInstances {
    fn from(gts: Vec<GroundTruth>) -> Self {
        let (bboxes, labels) = gts.into_iter().map(|gt| (gt.bboxes, gt.labels)).unzip();
        Self {
            bboxes,
            labels,
            bboxes_ignore: None,
        }
    }
}

/// 主干网络 (含 neck)
pub trait Backbone {
    /// (N, C, H, W) → 每层 (N, C', H', W')
    fn extract_feat(&mut self, img: &Array4<f32>) -> Result<Vec<Array4<f32>>>;
}

/// 区域候选网络
pub trait RpnHead {
    fn forward_train(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        gt: &GtInstances,
    ) -> Result<(Losses, Proposals)>;

    fn simple_test_rpn(&mut self, x: &[Array4<f32>], metas: &[ImgMeta]) -> Result<Proposals>;
}

/// 两阶段检测的 RoI 头
pub trait RoiHead {
    fn forward_train(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        proposals: &Proposals,
        gt: &GtInstances,
    ) -> Result<Losses>;

    fn simple_test(
        &mut self,
        x: &[Array4<f32>],
        proposals: &Proposals,
        metas: &[ImgMeta],
        rescale: bool,
    ) -> Result<Vec<DetectionResult>>;
}

/// 单阶段检测头
pub trait BboxHead {
    fn num_classes(&self) -> usize;

    fn forward_train(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        gt: &GtInstances,
    ) -> Result<Losses>;

    fn simple_test(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        rescale: bool,
    ) -> Result<Vec<DetectionResult>>;
}

/// 检测头组合
pub enum DetectorHeads {
    TwoStage {
        rpn: Option<Box<dyn RpnHead>>,
        roi_head: Box<dyn RoiHead>,
    },
    SingleStage {
        bbox_head: Box<dyn BboxHead>,
    },
}

pub struct Detector {
    backbone: Box<dyn Backbone>,
    heads: DetectorHeads,
    num_classes: usize,
}

impl Detector {
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    pub fn heads(&self) -> &DetectorHeads {
        &self.heads
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn is_two_stage(&self) -> bool {
        matches!(self.heads, DetectorHeads::TwoStage { .. })
    }

    pub fn extract_feat(&mut self, img: &Array4<f32>) -> Result<Vec<Array4<f32>>> {
        let feats = self.backbone.extract_feat(img)?;
        if feats.is_empty() {
            return Err(FgfaError::Shape("backbone returned no feature levels".to_string()));
        }
        Ok(feats)
    }

    /// 在(聚合后的)特征上计算训练损失
    pub fn forward_train(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        gt: &GtInstances,
        proposals: Option<&Proposals>,
    ) -> Result<Losses> {
        let mut losses = Losses::new();
        match &mut self.heads {
            DetectorHeads::TwoStage { rpn, roi_head } => {
                let proposal_list = match rpn {
                    Some(rpn) => {
                        let (rpn_losses, proposal_list) = rpn.forward_train(x, metas, gt)?;
                        losses.extend(rpn_losses);
                        proposal_list
                    }
                    None => proposals.cloned().ok_or_else(|| {
                        FgfaError::Configuration(
                            "two-stage detector without rpn needs proposals".to_string(),
                        )
                    })?,
                };
                losses.extend(roi_head.forward_train(x, metas, &proposal_list, gt)?);
            }
            DetectorHeads::SingleStage { bbox_head } => {
                losses.extend(bbox_head.forward_train(x, metas, gt)?);
            }
        }
        Ok(losses)
    }

    /// 在(聚合后的)特征上检测
    pub fn simple_test(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        proposals: Option<&Proposals>,
        rescale: bool,
    ) -> Result<Vec<DetectionResult>> {
        match &mut self.heads {
            DetectorHeads::TwoStage { rpn, roi_head } => {
                let proposal_list = match (proposals, rpn) {
                    (Some(p), _) => p.clone(),
                    (None, Some(rpn)) => rpn.simple_test_rpn(x, metas)?,
                    (None, None) => {
                        return Err(FgfaError::Configuration(
                            "two-stage detector without rpn needs proposals".to_string(),
                        ))
                    }
                };
                roi_head.simple_test(x, &proposal_list, metas, rescale)
            }
            DetectorHeads::SingleStage { bbox_head } => bbox_head.simple_test(x, metas, rescale),
        }
    }
}

#[derive(Default)]
pub struct DetectorBuilder {
    backbone: Option<Box<dyn Backbone>>,
    rpn: Option<Box<dyn RpnHead>>,
    roi_head: Option<Box<dyn RoiHead>>,
    bbox_head: Option<Box<dyn BboxHead>>,
    num_classes: Option<usize>,
}

impl DetectorBuilder {
    pub fn backbone(mut self, backbone: Box<dyn Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    pub fn rpn_head(mut self, rpn: Box<dyn RpnHead>) -> Self {
        self.rpn = Some(rpn);
        self
    }

    pub fn roi_head(mut self, roi_head: Box<dyn RoiHead>) -> Self {
        self.roi_head = Some(roi_head);
        self
    }

    pub fn bbox_head(mut self, bbox_head: Box<dyn BboxHead>) -> Self {
        self.bbox_head = Some(bbox_head);
        self
    }

    /// 两阶段检测器的类别数 (单阶段取自 bbox_head)
    pub fn num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn build(self) -> Result<Detector> {
        let backbone = self
            .backbone
            .ok_or_else(|| FgfaError::Configuration("detector needs a backbone".to_string()))?;

        let (heads, num_classes) = match (self.roi_head, self.bbox_head) {
            (Some(roi_head), bbox_head) => {
                if bbox_head.is_some() {
                    warn!("⚠️ both roi_head and bbox_head given, bbox_head is ignored");
                }
                let num_classes = self.num_classes.ok_or_else(|| {
                    FgfaError::Configuration("two-stage detector needs num_classes".to_string())
                })?;
                (
                    DetectorHeads::TwoStage {
                        rpn: self.rpn,
                        roi_head,
                    },
                    num_classes,
                )
            }
            (None, Some(bbox_head)) => {
                if self.rpn.is_some() {
                    return Err(FgfaError::Configuration(
                        "rpn head requires a roi head".to_string(),
                    ));
                }
                let num_classes = bbox_head.num_classes();
                (DetectorHeads::SingleStage { bbox_head }, num_classes)
            }
            (None, None) => {
                return Err(FgfaError::Configuration(
                    "detector must have roi_head or bbox_head".to_string(),
                ))
            }
        };

        Ok(Detector {
            backbone,
            heads,
            num_classes,
        })
    }
}
