// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX 主干网络与单阶段检测头

use std::path::Path;

use ndarray::{s, Array4, ArrayView2, Axis};

use super::{Backbone, BboxHead, GtInstances, Losses};
use crate::dataset::ImgMeta;
use crate::error::{FgfaError, Result};
use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
use crate::utils::tensor::to_nchw;
use crate::{non_max_suppression, Bbox, DetectionResult};

/// 多输出主干网络, 每个输出为一层特征
pub struct OnnxBackbone {
    engine: OrtBackend,
}

impl OnnxBackbone {
    pub fn new<P: AsRef<Path>>(f: P, ep: OrtEP) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig::new(f.as_ref(), ep))?;
        Ok(Self { engine })
    }
}

impl Backbone for OnnxBackbone {
    fn extract_feat(&mut self, img: &Array4<f32>) -> Result<Vec<Array4<f32>>> {
        self.engine
            .run(img.clone())?
            .into_iter()
            .map(to_nchw)
            .collect()
    }
}

/// 无锚点单阶段检测头, 输出 (B, 4 + nc, anchors), 框为 [cx, cy, w, h]
pub struct OnnxBboxHead {
    engine: OrtBackend,
    nc: usize,
    conf: f32,
    iou: f32,
    max_per_img: usize,
}

impl OnnxBboxHead {
    pub fn new<P: AsRef<Path>>(f: P, ep: OrtEP, nc: usize) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig::new(f.as_ref(), ep))?;
        Ok(Self {
            engine,
            nc,
            conf: 0.05,
            iou: 0.5,
            max_per_img: 100,
        })
    }

    pub fn with_thresholds(mut self, conf: f32, iou: f32, max_per_img: usize) -> Self {
        self.conf = conf;
        self.iou = iou;
        self.max_per_img = max_per_img;
        self
    }
}

impl BboxHead for OnnxBboxHead {
    fn num_classes(&self) -> usize {
        self.nc
    }

    fn forward_train(
        &mut self,
        _x: &[Array4<f32>],
        _metas: &[ImgMeta],
        _gt: &GtInstances,
    ) -> Result<Losses> {
        Err(FgfaError::NotImplemented(
            "training through an onnx bbox head".to_string(),
        ))
    }

    fn simple_test(
        &mut self,
        x: &[Array4<f32>],
        metas: &[ImgMeta],
        rescale: bool,
    ) -> Result<Vec<DetectionResult>> {
        let [feat] = x else {
            return Err(FgfaError::Shape(format!(
                "onnx bbox head takes exactly one feature level, got {}",
                x.len()
            )));
        };
        let ys = self.engine.run(feat.clone())?;
        let preds = ys
            .into_iter()
            .next()
            .ok_or_else(|| FgfaError::Ort("bbox head produced no outputs".to_string()))?
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| FgfaError::Shape(format!("bbox head output: {}", e)))?;

        let mut results = Vec::with_capacity(preds.dim().0);
        for (idx, anchors) in preds.axis_iter(Axis(0)).enumerate() {
            let meta = metas.get(idx);
            let bboxes = decode(
                anchors,
                self.nc,
                self.conf,
                self.iou,
                self.max_per_img,
                meta.filter(|_| rescale),
            )?;
            results.push(DetectionResult::new(bboxes, None));
        }
        Ok(results)
    }
}

/// 解码一张图的预测 (4 + nc, anchors): 置信度过滤 → 类别无关 NMS
fn decode(
    preds: ArrayView2<f32>,
    nc: usize,
    conf: f32,
    iou: f32,
    max_per_img: usize,
    rescale: Option<&ImgMeta>,
) -> Result<Vec<Bbox>> {
    const CXYWH_OFFSET: usize = 4;
    if preds.dim().0 != CXYWH_OFFSET + nc {
        return Err(FgfaError::Shape(format!(
            "expected {} prediction rows, got {}",
            CXYWH_OFFSET + nc,
            preds.dim().0
        )));
    }
    let (sx, sy) = rescale.map_or((1.0, 1.0), |m| m.scale_factor);
    let (max_w, max_h) = match rescale {
        Some(m) if m.ori_shape != (0, 0) => (m.ori_shape.1 as f32, m.ori_shape.0 as f32),
        _ => (f32::INFINITY, f32::INFINITY),
    };

    let mut data = Vec::new();
    for pred in preds.axis_iter(Axis(1)) {
        let bbox = pred.slice(s![0..CXYWH_OFFSET]);
        let clss = pred.slice(s![CXYWH_OFFSET..]);
        let Some((id, &confidence)) = clss
            .iter()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if confidence < conf {
            continue;
        }
        let w = bbox[2] / sx;
        let h = bbox[3] / sy;
        let x = bbox[0] / sx - w / 2.;
        let y = bbox[1] / sy - h / 2.;
        data.push(Bbox::new(
            x.max(0.0f32).min(max_w),
            y.max(0.0f32).min(max_h),
            w,
            h,
            id,
            confidence,
        ));
    }

    non_max_suppression(&mut data, iou);
    data.truncate(max_per_img);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn preds(cols: &[[f32; 6]]) -> Array2<f32> {
        // 每列: cx, cy, w, h, score0, score1
        Array2::from_shape_fn((6, cols.len()), |(r, c)| cols[c][r])
    }

    #[test]
    fn test_decode_thresholds_and_nms() {
        let p = preds(&[
            [50.0, 50.0, 20.0, 20.0, 0.9, 0.1],
            [51.0, 50.0, 20.0, 20.0, 0.2, 0.8], // 与第一个重叠, 被 NMS 去掉
            [150.0, 150.0, 10.0, 10.0, 0.1, 0.6],
            [10.0, 10.0, 4.0, 4.0, 0.01, 0.02], // 低于阈值
        ]);
        let boxes = decode(p.view(), 2, 0.05, 0.5, 100, None).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].id(), 0);
        assert_eq!(boxes[0].xmin(), 40.0);
        assert_eq!(boxes[0].confidence(), 0.9);
        assert_eq!(boxes[1].id(), 1);
        assert_eq!(boxes[1].xmax(), 155.0);
    }

    #[test]
    fn test_decode_rescale() {
        let p = preds(&[[100.0, 50.0, 20.0, 10.0, 0.9, 0.0]]);
        let meta = ImgMeta {
            ori_shape: (50, 100),
            img_shape: (100, 200),
            scale_factor: (2.0, 2.0),
            ..Default::default()
        };
        let boxes = decode(p.view(), 2, 0.05, 0.5, 100, Some(&meta)).unwrap();
        assert_eq!(boxes[0].xmin(), 45.0);
        assert_eq!(boxes[0].ymin(), 22.5);
        assert_eq!(boxes[0].width(), 10.0);
    }

    #[test]
    fn test_decode_row_mismatch() {
        let p = preds(&[[0.0; 6]]);
        assert!(matches!(
            decode(p.view(), 3, 0.05, 0.5, 100, None),
            Err(FgfaError::Shape(_))
        ));
    }

    #[test]
    fn test_max_per_img() {
        let cols: Vec<[f32; 6]> = (0..10)
            .map(|i| [i as f32 * 100.0, 0.0, 10.0, 10.0, 0.5 + i as f32 * 0.01, 0.0])
            .collect();
        let boxes = decode(preds(&cols).view(), 2, 0.05, 0.5, 3, None).unwrap();
        assert_eq!(boxes.len(), 3);
        // 按置信度降序
        assert!(boxes[0].confidence() > boxes[2].confidence());
    }
}
