#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod aggregators; // 特征聚合
pub mod config; // 配置参数
pub mod dataset; // 视频数据集与参考帧采样
pub mod error;
pub mod logging;
pub mod models; // 检测器接口与 ONNX 实现
pub mod motion; // 光流估计与特征对齐
pub mod ort_backend;
pub mod utils;
pub mod vid; // FGFA 视频检测

pub use crate::config::{Args, FgfaConfig};
pub use crate::error::{FgfaError, Result};
pub use crate::models::{Detector, OnnxBackbone, OnnxBboxHead};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::vid::{Fgfa, FeatureMemo, TestResults};

/// 一个类别的检测结果, 每行 [x1, y1, x2, y2, score]
pub type ClassDetections = Vec<[f32; 5]>;

/// 按置信度降序的贪心 NMS (类别无关)
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| {
        b2.confidence()
            .partial_cmp(&b1.confidence())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 检测框按类别分组, 类别 id 超出范围的框被丢弃
pub fn bbox2result(dets: &[Bbox], num_classes: usize) -> Vec<ClassDetections> {
    let mut results = vec![ClassDetections::new(); num_classes];
    for bbox in dets {
        if let Some(cls) = results.get_mut(bbox.id()) {
            cls.push([
                bbox.xmin(),
                bbox.ymin(),
                bbox.xmax(),
                bbox.ymax(),
                bbox.confidence(),
            ]);
        }
    }
    results
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionResult {
    // 一张图的检测结果
    pub bboxes: Vec<Bbox>,
    pub masks: Option<Vec<Vec<u8>>>,
}

impl DetectionResult {
    pub fn new(bboxes: Vec<Bbox>, masks: Option<Vec<Vec<u8>>>) -> Self {
        Self { bboxes, masks }
    }

    pub fn bboxes(&self) -> &[Bbox] {
        &self.bboxes
    }

    pub fn masks(&self) -> Option<&Vec<Vec<u8>>> {
        self.masks.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    /// 由 [x1, y1, x2, y2] 构造
    pub fn from_xyxy(xyxy: [f32; 4], id: usize, confidence: f32) -> Self {
        let [x1, y1, x2, y2] = xyxy;
        Self::new(x1, y1, x2 - x1, y2 - y1, id, confidence)
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_iou() {
        let a = Bbox::new(0., 0., 10., 10., 0, 0.9);
        let b = Bbox::new(5., 0., 10., 10., 0, 0.8);
        assert_abs_diff_eq!(a.intersection_area(&b), 50.);
        assert_abs_diff_eq!(a.iou(&b), 50. / 150.);
        assert_eq!(a.iou(&Bbox::new(20., 20., 5., 5., 0, 0.1)), 0.);
        assert_eq!(Bbox::default().iou(&Bbox::default()), 0.);
    }

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let mut xs = vec![
            Bbox::new(1., 0., 10., 10., 0, 0.5),
            Bbox::new(0., 0., 10., 10., 1, 0.9),
            Bbox::new(50., 50., 10., 10., 0, 0.7),
        ];
        non_max_suppression(&mut xs, 0.5);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].confidence(), 0.9);
        assert_eq!(xs[1].confidence(), 0.7);
    }

    #[test]
    fn test_bbox2result_groups_by_class() {
        let dets = vec![
            Bbox::from_xyxy([0., 0., 4., 2.], 1, 0.9),
            Bbox::from_xyxy([1., 1., 2., 2.], 1, 0.3),
            Bbox::from_xyxy([5., 5., 6., 6.], 7, 0.8), // 越界类别
        ];
        let res = bbox2result(&dets, 3);
        assert_eq!(res.len(), 3);
        assert!(res[0].is_empty());
        assert_eq!(res[1], vec![[0., 0., 4., 2., 0.9], [1., 1., 2., 2., 0.3]]);
        assert!(res[2].is_empty());
    }
}
