// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ImageNet VID 数据集 (video object detection)

use std::collections::HashMap;
use std::path::Path;

use ndarray::Array2;
use rand::Rng;
use tracing::info;

use super::coco_vid::{CocoVid, FrameInfo};
use super::sampler::{self, SamplerConfig};
use crate::error::{FgfaError, Result};

/// ImageNet VID 的 30 个类别
pub const CLASSES: [&str; 30] = [
    "airplane",
    "antelope",
    "bear",
    "bicycle",
    "bird",
    "bus",
    "car",
    "cattle",
    "dog",
    "domestic_cat",
    "elephant",
    "fox",
    "giant_panda",
    "hamster",
    "horse",
    "lion",
    "lizard",
    "monkey",
    "motorcycle",
    "rabbit",
    "red_panda",
    "sheep",
    "snake",
    "squirrel",
    "tiger",
    "train",
    "turtle",
    "watercraft",
    "whale",
    "zebra",
];

/// 单帧的真值框 ([x1, y1, x2, y2]) 与类别标签
#[derive(Clone, Debug, PartialEq)]
pub struct GroundTruth {
    pub bboxes: Array2<f32>,
    pub labels: Vec<usize>,
}

impl GroundTruth {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub struct VideoDataset {
    coco: CocoVid,
    load_as_video: bool,
    test_mode: bool,
    cat_ids: Vec<u64>,
    cat2label: HashMap<u64, usize>,
    vid_ids: Vec<u64>,
    img_ids: Vec<u64>,
    data_infos: Vec<FrameInfo>,
}

impl VideoDataset {
    /// 从标注文件加载
    pub fn load<P: AsRef<Path>>(ann_file: P, load_as_video: bool, test_mode: bool) -> Result<Self> {
        let coco = CocoVid::load(ann_file)?;
        Self::new(coco, load_as_video, test_mode)
    }

    pub fn new(coco: CocoVid, load_as_video: bool, test_mode: bool) -> Result<Self> {
        let cat_ids = coco.get_cat_ids(&CLASSES);
        let cat2label = cat_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut dataset = Self {
            coco,
            load_as_video,
            test_mode,
            cat_ids,
            cat2label,
            vid_ids: Vec::new(),
            img_ids: Vec::new(),
            data_infos: Vec::new(),
        };
        if load_as_video {
            dataset.load_video_anns()?;
        } else {
            dataset.load_image_anns()?;
        }
        info!(
            "📂 VID dataset: {} videos, {} frames (video={}, test={})",
            dataset.vid_ids.len(),
            dataset.data_infos.len(),
            load_as_video,
            test_mode
        );
        Ok(dataset)
    }

    /// 图片模式: 只保留可训练帧, 没有视频结构
    fn load_image_anns(&mut self) -> Result<()> {
        for img_id in self.coco.get_img_ids() {
            let info = self.coco.load_img(img_id)?;
            if info.is_vid_train_frame {
                self.img_ids.push(img_id);
                self.data_infos.push(info);
            }
        }
        Ok(())
    }

    /// 视频模式: 按视频、按 frame_id 顺序加载
    fn load_video_anns(&mut self) -> Result<()> {
        self.vid_ids = self.coco.get_vid_ids();
        for &vid_id in &self.vid_ids {
            for img_id in self.coco.get_img_ids_from_vid(vid_id) {
                let info = self.coco.load_img(img_id)?;
                if self.test_mode {
                    if info.is_vid_train_frame {
                        return Err(FgfaError::Configuration(format!(
                            "is_vid_train_frame must be false in testing (image {})",
                            img_id
                        )));
                    }
                } else if !info.is_vid_train_frame {
                    continue;
                }
                self.img_ids.push(img_id);
                self.data_infos.push(info);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data_infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_infos.is_empty()
    }

    pub fn data_infos(&self) -> &[FrameInfo] {
        &self.data_infos
    }

    pub fn img_ids(&self) -> &[u64] {
        &self.img_ids
    }

    pub fn vid_ids(&self) -> &[u64] {
        &self.vid_ids
    }

    pub fn cat_ids(&self) -> &[u64] {
        &self.cat_ids
    }

    pub fn cat2label(&self) -> &HashMap<u64, usize> {
        &self.cat2label
    }

    pub fn coco(&self) -> &CocoVid {
        &self.coco
    }

    /// 为关键帧采样同一视频内的参考帧
    pub fn ref_img_sampling<R: Rng + ?Sized>(
        &self,
        img_info: &mut FrameInfo,
        cfg: &SamplerConfig,
        rng: &mut R,
    ) -> Result<Vec<FrameInfo>> {
        if !self.load_as_video {
            return sampler::sample(img_info, None, cfg, rng);
        }
        let video = self.coco.frames_of_video(img_info.video_id)?;
        sampler::sample(img_info, Some(&video), cfg, rng)
    }

    /// 真值: bbox 由 [x, y, w, h] 转为 [x1, y1, x2, y2], 忽略 crowd 与未知类别
    pub fn ground_truth(&self, img_id: u64) -> GroundTruth {
        let mut boxes = Vec::new();
        let mut labels = Vec::new();
        for ann in self.coco.anns_for_img(img_id) {
            let Some(&label) = self.cat2label.get(&ann.category_id) else {
                continue;
            };
            let [x, y, w, h] = ann.bbox;
            if ann.iscrowd != 0 || w < 1.0 || h < 1.0 {
                continue;
            }
            boxes.extend_from_slice(&[x, y, x + w, y + h]);
            labels.push(label);
        }
        let bboxes = Array2::from_shape_vec((labels.len(), 4), boxes)
            .unwrap_or_else(|_| Array2::zeros((0, 4)));
        GroundTruth { bboxes, labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::coco_vid::{Annotation, Category, VideoInfo};
    use crate::dataset::sampler::{FrameRange, SamplingPolicy};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn coco(train_flags: &[bool]) -> CocoVid {
        let images = train_flags
            .iter()
            .enumerate()
            .map(|(i, &train)| {
                let mut f = FrameInfo::new(i as u64 + 1, 7, i as i64);
                f.is_vid_train_frame = train;
                f
            })
            .collect();
        let anns = vec![
            Annotation {
                id: 1,
                image_id: 1,
                category_id: 30,
                bbox: [10.0, 20.0, 5.0, 8.0],
                iscrowd: 0,
                instance_id: Some(0),
            },
            Annotation {
                id: 2,
                image_id: 1,
                category_id: 99,
                bbox: [0.0, 0.0, 4.0, 4.0],
                iscrowd: 0,
                instance_id: None,
            },
        ];
        let cats = vec![
            Category {
                id: 30,
                name: "zebra".to_string(),
            },
            Category {
                id: 1,
                name: "airplane".to_string(),
            },
        ];
        CocoVid::from_parts(
            vec![VideoInfo {
                id: 7,
                name: "v".to_string(),
            }],
            images,
            anns,
            cats,
        )
    }

    #[test]
    fn test_cat2label_follows_class_order() {
        let ds = VideoDataset::new(coco(&[true]), true, false).unwrap();
        assert_eq!(ds.cat_ids(), &[1, 30]);
        assert_eq!(ds.cat2label()[&1], 0);
        assert_eq!(ds.cat2label()[&30], 1);
    }

    #[test]
    fn test_video_mode_keeps_train_frames() {
        let ds = VideoDataset::new(coco(&[true, false, true]), true, false).unwrap();
        assert_eq!(ds.img_ids(), &[1, 3]);
        assert_eq!(ds.vid_ids(), &[7]);
    }

    #[test]
    fn test_test_mode_rejects_train_frames() {
        assert!(matches!(
            VideoDataset::new(coco(&[false, true]), true, true),
            Err(FgfaError::Configuration(_))
        ));
        let ds = VideoDataset::new(coco(&[false, false]), true, true).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn test_image_mode_duplicates_key() {
        let ds = VideoDataset::new(coco(&[true, true, true]), false, false).unwrap();
        assert!(ds.vid_ids().is_empty());
        let cfg = SamplerConfig {
            window: FrameRange::Symmetric(2),
            num_refs: 2,
            policy: SamplingPolicy::BilateralUniform,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let mut key = ds.data_infos()[1].clone();
        let out = ds.ref_img_sampling(&mut key, &cfg, &mut rng).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|f| f.id == key.id));
    }

    #[test]
    fn test_video_mode_samples_neighbours() {
        let ds = VideoDataset::new(coco(&[true; 6]), true, false).unwrap();
        let cfg = SamplerConfig {
            window: FrameRange::Symmetric(1),
            num_refs: 2,
            filter_key_frame: true,
            policy: SamplingPolicy::Uniform,
            return_key_frame: false,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut key = ds.data_infos()[3].clone();
        let out = ds.ref_img_sampling(&mut key, &cfg, &mut rng).unwrap();
        let ids: Vec<i64> = out.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn test_ground_truth_xyxy() {
        let ds = VideoDataset::new(coco(&[true]), true, false).unwrap();
        let gt = ds.ground_truth(1);
        // 未知类别 99 被忽略
        assert_eq!(gt.len(), 1);
        assert_eq!(gt.labels, vec![1]);
        assert_eq!(gt.bboxes.row(0).to_vec(), vec![10.0, 20.0, 15.0, 28.0]);
        assert!(ds.ground_truth(42).is_empty());
    }
}
