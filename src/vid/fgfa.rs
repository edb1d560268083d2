// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// Flow-Guided Feature Aggregation 视频目标检测

use ndarray::{s, Array4, Array5, Axis};
use tracing::{debug, info};

use super::memo::FeatureMemo;
use crate::aggregators::{build_aggregator, EmbedAggregator};
use crate::config::FgfaConfig;
use crate::dataset::ImgMeta;
use crate::error::{FgfaError, Result};
use crate::models::{
    Detector, GtInstances, Losses, OnnxBackbone, OnnxBboxHead, Proposals,
};
use crate::motion::{build_motion, flow_warp_feats, MotionEstimator};
use crate::utils::tensor::{cat, repeat_interleave};
use crate::{bbox2result, ClassDetections};

/// 单帧检测结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TestResults {
    /// 每个类别一组 [x1, y1, x2, y2, score]
    pub det_bboxes: Vec<ClassDetections>,
    pub det_masks: Option<Vec<Vec<u8>>>,
}

pub struct Fgfa {
    detector: Detector,
    motion: Box<dyn MotionEstimator>,
    aggregator: EmbedAggregator,
    memo: Option<FeatureMemo>,
}

impl Fgfa {
    pub fn new(
        detector: Detector,
        motion: Box<dyn MotionEstimator>,
        aggregator: EmbedAggregator,
    ) -> Self {
        Self {
            detector,
            motion,
            aggregator,
            memo: None,
        }
    }

    /// 从配置加载 ONNX 主干网络、检测头与光流网络
    pub fn from_config(cfg: &FgfaConfig) -> Result<Self> {
        let det = &cfg.detector;
        let ep = det.device.to_ep(det.device_id);
        let backbone = det.backbone.as_ref().ok_or_else(|| {
            FgfaError::Configuration("detector.backbone onnx path is required".to_string())
        })?;
        let bbox_head = det.bbox_head.as_ref().ok_or_else(|| {
            FgfaError::Configuration("detector.bbox_head onnx path is required".to_string())
        })?;

        let detector = Detector::builder()
            .backbone(Box::new(OnnxBackbone::new(backbone, ep)?))
            .bbox_head(Box::new(
                OnnxBboxHead::new(bbox_head, ep, det.num_classes)?.with_thresholds(
                    det.conf_threshold,
                    det.iou_threshold,
                    det.max_per_img,
                ),
            ))
            .build()?;
        let motion = build_motion(&cfg.motion)?;
        let aggregator = build_aggregator(&cfg.aggregator, cfg.seed)?;
        info!("✅ FGFA 模型就绪 ({} 类)", detector.num_classes());
        Ok(Self::new(detector, motion, aggregator))
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn memo(&self) -> Option<&FeatureMemo> {
        self.memo.as_ref()
    }

    /// 丢弃缓存, 下一帧必须是新视频的第0帧
    pub fn reset(&mut self) {
        self.memo = None;
    }

    /// 训练: 关键帧与参考帧一起提取特征, 光流对齐后聚合, 再计算检测损失
    ///
    /// # 参数
    /// - `img`: 关键帧 (N, C, H, W)
    /// - `ref_img`: 参考帧 (N, R, C, H, W)
    pub fn forward_train(
        &mut self,
        img: &Array4<f32>,
        metas: &[ImgMeta],
        gt: &GtInstances,
        ref_img: &Array5<f32>,
        proposals: Option<&Proposals>,
    ) -> Result<Losses> {
        let (n, c, h, w) = img.dim();
        let (rn, num_refs, rc, rh, rw) = ref_img.dim();
        if rn != n || (rc, rh, rw) != (c, h, w) || num_refs == 0 {
            return Err(FgfaError::Shape(format!(
                "reference images {:?} do not match key images {:?}",
                ref_img.dim(),
                img.dim()
            )));
        }
        // (N, R, C, H, W) → (N·R, C, H, W), 样本 n 的参考帧连续存放
        let ref_img = ref_img
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n * num_refs, c, h, w))?;

        let all_imgs = cat(&[img.view(), ref_img.view()], Axis(0))?;
        let all_x = self.detector.extract_feat(&all_imgs)?;

        // 各层共用同一份光流
        let motion_input = cat(
            &[repeat_interleave(img, num_refs).view(), ref_img.view()],
            Axis(1),
        )?;
        let flows = self.motion.estimate(&motion_input, metas)?;

        let mut x = Vec::with_capacity(all_x.len());
        for feats in &all_x {
            let cur_feat = feats.slice(s![..n, .., .., ..]).to_owned();
            let ref_feats = feats.slice(s![n.., .., .., ..]).to_owned();
            let ref_x = flow_warp_feats(&ref_feats, &flows)?;
            x.push(self.aggregator.aggregate(&cur_feat, &ref_x)?);
        }

        self.detector.forward_train(&x, metas, gt, proposals)
    }

    /// 测试时提取 (聚合后的) 关键帧特征
    ///
    /// - 自适应步长: 第0帧缓存整段视频的参考帧, 之后只提取关键帧
    /// - 固定步长: 第0帧建立滑动窗口, 每 `stride` 帧滑动一次
    ///
    /// # 参数
    /// - `img`: 关键帧 (1, C, H, W)
    /// - `ref_img`: 本帧新到的参考帧 (M, C, H, W), 可能为空
    pub fn extract_feats(
        &mut self,
        img: &Array4<f32>,
        metas: &[ImgMeta],
        ref_img: Option<&Array4<f32>>,
    ) -> Result<Vec<Array4<f32>>> {
        let meta = metas
            .first()
            .ok_or_else(|| FgfaError::State("img_metas is empty".to_string()))?;
        let frame_id = meta.frame_id;
        if frame_id < 0 {
            return Err(FgfaError::State(
                "frame_id must be set for streaming inference".to_string(),
            ));
        }
        if img.dim().0 != 1 {
            return Err(FgfaError::Shape(format!(
                "streaming inference takes one key frame, got {}",
                img.dim().0
            )));
        }
        let stride = meta.frame_stride.filter(|&s| s >= 1);
        let key_index = meta.num_left_ref_imgs.unwrap_or(0);

        if frame_id > 0 {
            let memo = self.memo.as_ref().ok_or_else(|| {
                FgfaError::State(format!(
                    "frame {} arrived before frame 0 of its video",
                    frame_id
                ))
            })?;
            if frame_id <= memo.last_frame_id() {
                return Err(FgfaError::State(format!(
                    "frame {} submitted after frame {}",
                    frame_id,
                    memo.last_frame_id()
                )));
            }
            if memo.stride() != stride {
                return Err(FgfaError::State(format!(
                    "frame stride changed from {:?} to {:?} within a video",
                    memo.stride(),
                    stride
                )));
            }
        }

        let x = match stride {
            // 自适应步长
            None => {
                if frame_id == 0 {
                    let refs = require_refs(ref_img, frame_id)?;
                    let ref_x = self.detector.extract_feat(refs)?;
                    self.memo = Some(FeatureMemo::init(refs, &ref_x, 0, None)?);
                }
                self.detector.extract_feat(img)?
            }
            // 固定步长
            Some(stride) => {
                if frame_id == 0 {
                    let refs = require_refs(ref_img, frame_id)?;
                    let ref_x = self.detector.extract_feat(refs)?;
                    let memo = FeatureMemo::init(refs, &ref_x, key_index, Some(stride))?;
                    // 关键帧特征就是缓存中 key_index 处的特征
                    let x = key_feats(&memo)?;
                    self.memo = Some(memo);
                    x
                } else if frame_id as usize % stride == 0 {
                    let refs = require_refs(ref_img, frame_id)?;
                    let ref_x = self.detector.extract_feat(refs)?;
                    let memo = self.memo_mut()?;
                    memo.slide(refs, &ref_x)?;
                    key_feats(memo)?
                } else {
                    if ref_img.is_some() {
                        return Err(FgfaError::State(format!(
                            "frame {} is not on the stride {} but carries reference images",
                            frame_id, stride
                        )));
                    }
                    self.detector.extract_feat(img)?
                }
            }
        };

        let memo = self.memo_mut()?;
        memo.set_last_frame_id(frame_id);
        if x.len() != memo.num_levels() {
            return Err(FgfaError::Shape(format!(
                "key frame has {} feature levels, memo has {}",
                x.len(),
                memo.num_levels()
            )));
        }

        // 关键帧与缓存中每一帧的光流, 一次计算各层共用
        let memo_imgs = memo.images()?;
        let num_cached = memo_imgs.dim().0;
        let motion_input = cat(
            &[repeat_interleave(img, num_cached).view(), memo_imgs.view()],
            Axis(1),
        )?;
        let key_index = memo.key_index();
        let mut ref_feats = Vec::with_capacity(x.len());
        for level in 0..x.len() {
            ref_feats.push(memo.feats(level)?);
        }
        let flows = self.motion.estimate(&motion_input, metas)?;
        debug!("frame {}: {} cached frames, {} levels", frame_id, num_cached, x.len());

        let mut agg_x = Vec::with_capacity(x.len());
        for (cur_feat, ref_feats) in x.iter().zip(&ref_feats) {
            let warped = flow_warp_feats(ref_feats, &flows)?;
            let refs = match stride {
                None => cat(&[cur_feat.view(), warped.view()], Axis(0))?,
                Some(_) => {
                    let mut warped = warped;
                    // 关键帧自身的特征不做对齐
                    warped
                        .slice_mut(s![key_index..key_index + 1, .., .., ..])
                        .assign(cur_feat);
                    warped
                }
            };
            agg_x.push(self.aggregator.aggregate(cur_feat, &refs)?);
        }
        Ok(agg_x)
    }

    /// 单帧测试 (无增强)
    pub fn simple_test(
        &mut self,
        img: &Array4<f32>,
        metas: &[ImgMeta],
        ref_img: Option<&Array4<f32>>,
        proposals: Option<&Proposals>,
        rescale: bool,
    ) -> Result<TestResults> {
        let x = self.extract_feats(img, metas, ref_img)?;
        let outs = self.detector.simple_test(&x, metas, proposals, rescale)?;
        let out = outs
            .into_iter()
            .next()
            .ok_or_else(|| FgfaError::Shape("detector returned no results".to_string()))?;
        Ok(TestResults {
            det_bboxes: bbox2result(out.bboxes(), self.detector.num_classes()),
            det_masks: out.masks,
        })
    }

    /// 测试时增强
    pub fn aug_test(
        &mut self,
        _imgs: &[Array4<f32>],
        _metas: &[Vec<ImgMeta>],
    ) -> Result<TestResults> {
        Err(FgfaError::NotImplemented("aug_test".to_string()))
    }

    fn memo_mut(&mut self) -> Result<&mut FeatureMemo> {
        self.memo
            .as_mut()
            .ok_or_else(|| FgfaError::State("no cached reference features".to_string()))
    }
}

fn require_refs(ref_img: Option<&Array4<f32>>, frame_id: i64) -> Result<&Array4<f32>> {
    ref_img.ok_or_else(|| {
        FgfaError::State(format!("frame {} requires reference images", frame_id))
    })
}

fn key_feats(memo: &FeatureMemo) -> Result<Vec<Array4<f32>>> {
    (0..memo.num_levels()).map(|l| memo.key_feat(l)).collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    use super::*;
    use crate::config::AggregatorConfig;
    use crate::models::{Backbone, BboxHead};
    use crate::motion::ZeroMotion;
    use crate::{Bbox, DetectionResult};

    /// 特征即图像, 记录调用次数
    struct Identity(Rc<Cell<usize>>);

    impl Backbone for Identity {
        fn extract_feat(&mut self, img: &Array4<f32>) -> Result<Vec<Array4<f32>>> {
            self.0.set(self.0.get() + 1);
            Ok(vec![img.clone()])
        }
    }

    /// 每张图一个框, 置信度取特征左上角的值
    struct PeakHead;

    impl BboxHead for PeakHead {
        fn num_classes(&self) -> usize {
            2
        }

        fn forward_train(
            &mut self,
            x: &[Array4<f32>],
            _metas: &[ImgMeta],
            _gt: &GtInstances,
        ) -> Result<Losses> {
            let mut losses = Losses::new();
            losses.insert("loss_cls".to_string(), x[0].sum());
            Ok(losses)
        }

        fn simple_test(
            &mut self,
            x: &[Array4<f32>],
            _metas: &[ImgMeta],
            _rescale: bool,
        ) -> Result<Vec<DetectionResult>> {
            Ok(x[0]
                .outer_iter()
                .map(|f| {
                    DetectionResult::new(vec![Bbox::new(0., 0., 4., 4., 1, f[[0, 0, 0]])], None)
                })
                .collect())
        }
    }

    fn model() -> (Fgfa, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let detector = Detector::builder()
            .backbone(Box::new(Identity(calls.clone())))
            .bbox_head(Box::new(PeakHead))
            .build()
            .unwrap();
        let cfg = AggregatorConfig {
            channels: 1,
            kernel_size: 1,
            ..Default::default()
        };
        let aggregator = EmbedAggregator::new(&cfg, 0).unwrap();
        (Fgfa::new(detector, Box::new(ZeroMotion), aggregator), calls)
    }

    fn imgs(n: usize, v: f32) -> Array4<f32> {
        Array4::from_elem((n, 1, 4, 4), v)
    }

    fn meta(frame_id: i64, stride: Option<usize>) -> Vec<ImgMeta> {
        vec![ImgMeta {
            frame_id,
            num_left_ref_imgs: stride.map(|_| 1),
            frame_stride: stride,
            ..ImgMeta::with_frame_id(frame_id)
        }]
    }

    #[test]
    fn test_fixed_stride_memo_slides() {
        let (mut fgfa, calls) = model();
        let x = fgfa
            .extract_feats(&imgs(1, 0.5), &meta(0, Some(2)), Some(&imgs(3, 0.5)))
            .unwrap();
        assert_eq!(x[0].dim(), (1, 1, 4, 4));
        assert_abs_diff_eq!(x[0][[0, 0, 2, 2]], 0.5, epsilon = 1e-5);
        // 第0帧只提取参考帧
        assert_eq!(calls.get(), 1);
        assert_eq!(fgfa.memo().unwrap().len(), 3);
        assert_eq!(fgfa.memo().unwrap().key_index(), 1);

        // 非步长帧不能带参考帧
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(1, Some(2)), Some(&imgs(1, 0.5))),
            Err(FgfaError::State(_))
        ));
        fgfa.extract_feats(&imgs(1, 0.5), &meta(1, Some(2)), None)
            .unwrap();
        assert_eq!(calls.get(), 2);

        // 步长帧必须带参考帧
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(2, Some(2)), None),
            Err(FgfaError::State(_))
        ));
        for frame_id in [2, 4, 6] {
            fgfa.extract_feats(&imgs(1, 0.5), &meta(frame_id, Some(2)), Some(&imgs(1, 0.5)))
                .unwrap();
            assert_eq!(fgfa.memo().unwrap().len(), 3);
            assert_eq!(fgfa.memo().unwrap().last_frame_id(), frame_id);
        }
    }

    #[test]
    fn test_frame_order_is_enforced() {
        let (mut fgfa, _) = model();
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(3, Some(2)), None),
            Err(FgfaError::State(_))
        ));
        fgfa.extract_feats(&imgs(1, 0.5), &meta(0, Some(2)), Some(&imgs(3, 0.5)))
            .unwrap();
        fgfa.extract_feats(&imgs(1, 0.5), &meta(3, Some(2)), None)
            .unwrap();
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(1, Some(2)), None),
            Err(FgfaError::State(_))
        ));
        // 同一视频内不能切换步长模式
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(5, None), None),
            Err(FgfaError::State(_))
        ));
        assert!(matches!(
            fgfa.extract_feats(&imgs(1, 0.5), &meta(-1, None), None),
            Err(FgfaError::State(_))
        ));
        assert!(matches!(
            fgfa.extract_feats(&imgs(2, 0.5), &meta(4, Some(2)), None),
            Err(FgfaError::Shape(_))
        ));

        // 新视频从第0帧重新开始
        fgfa.extract_feats(&imgs(1, 0.5), &meta(0, Some(2)), Some(&imgs(3, 0.5)))
            .unwrap();
        fgfa.reset();
        assert!(fgfa.memo().is_none());
    }

    #[test]
    fn test_adaptive_stride_caches_whole_video() {
        let (mut fgfa, calls) = model();
        let res = fgfa
            .simple_test(&imgs(1, 0.25), &meta(0, None), Some(&imgs(4, 0.25)), None, false)
            .unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(fgfa.memo().unwrap().len(), 4);
        assert_eq!(res.det_bboxes.len(), 2);
        assert!(res.det_bboxes[0].is_empty());
        assert_abs_diff_eq!(res.det_bboxes[1][0][4], 0.25, epsilon = 1e-5);
        assert_eq!(res.det_bboxes[1][0][2], 4.0);

        // 之后的帧只提取关键帧, 缓存不变
        fgfa.simple_test(&imgs(1, 0.25), &meta(7, None), None, None, false)
            .unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(fgfa.memo().unwrap().len(), 4);
    }

    #[test]
    fn test_forward_train_aggregates_refs() {
        let (mut fgfa, calls) = model();
        let img = imgs(2, 1.0);
        let ref_img = Array5::from_elem((2, 3, 1, 4, 4), 1.0f32);
        let metas = vec![ImgMeta::default(); 2];
        let losses = fgfa
            .forward_train(&img, &metas, &GtInstances::default(), &ref_img, None)
            .unwrap();
        // 一次主干网络前向
        assert_eq!(calls.get(), 1);
        assert_abs_diff_eq!(losses["loss_cls"], 32.0, epsilon = 1e-3);

        let bad = Array5::from_elem((1, 3, 1, 4, 4), 1.0f32);
        assert!(matches!(
            fgfa.forward_train(&img, &metas, &GtInstances::default(), &bad, None),
            Err(FgfaError::Shape(_))
        ));
    }

    #[test]
    fn test_aug_test_not_implemented() {
        let (mut fgfa, _) = model();
        assert!(matches!(
            fgfa.aug_test(&[imgs(1, 0.0)], &[meta(0, None)]),
            Err(FgfaError::NotImplemented(_))
        ));
    }
}
