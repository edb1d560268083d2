// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// COCO-VID 标注格式 (videos / images / annotations / categories)

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FgfaError, Result};

/// 视频信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// 单帧信息 (image record)
///
/// `num_left_ref_imgs` / `frame_stride` 由固定步长采样策略写入,供流式推理使用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub id: u64,
    pub video_id: u64,
    /// 在视频中的位置 (0开始); 负数表示未知
    pub frame_id: i64,
    pub file_name: String,
    #[serde(default)]
    pub is_vid_train_frame: bool,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_left_ref_imgs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_stride: Option<usize>,
}

impl FrameInfo {
    pub fn new(id: u64, video_id: u64, frame_id: i64) -> Self {
        Self {
            id,
            video_id,
            frame_id,
            file_name: format!("{:06}.JPEG", frame_id.max(0)),
            is_vid_train_frame: true,
            width: 0,
            height: 0,
            num_left_ref_imgs: None,
            frame_stride: None,
        }
    }
}

/// 目标标注, bbox 为 [x, y, w, h]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    pub bbox: [f32; 4],
    #[serde(default)]
    pub iscrowd: u8,
    #[serde(default)]
    pub instance_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CocoVidFile {
    #[serde(default)]
    videos: Vec<VideoInfo>,
    images: Vec<FrameInfo>,
    #[serde(default)]
    annotations: Vec<Annotation>,
    #[serde(default)]
    categories: Vec<Category>,
}

/// COCO-VID 标注索引
#[derive(Clone, Debug, Default)]
pub struct CocoVid {
    videos: Vec<VideoInfo>,
    images: HashMap<u64, FrameInfo>,
    categories: Vec<Category>,
    /// video_id → 按 frame_id 排序的 image id
    vid_to_imgs: BTreeMap<u64, Vec<u64>>,
    img_to_anns: HashMap<u64, Vec<Annotation>>,
}

impl CocoVid {
    /// 从JSON文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: CocoVidFile = serde_json::from_str(json)?;
        Ok(Self::from_parts(
            file.videos,
            file.images,
            file.annotations,
            file.categories,
        ))
    }

    pub fn from_parts(
        videos: Vec<VideoInfo>,
        images: Vec<FrameInfo>,
        annotations: Vec<Annotation>,
        categories: Vec<Category>,
    ) -> Self {
        let mut vid_to_imgs: BTreeMap<u64, Vec<(i64, u64)>> = BTreeMap::new();
        for img in &images {
            vid_to_imgs
                .entry(img.video_id)
                .or_default()
                .push((img.frame_id, img.id));
        }
        let vid_to_imgs = vid_to_imgs
            .into_iter()
            .map(|(vid, mut frames)| {
                frames.sort();
                (vid, frames.into_iter().map(|(_, id)| id).collect())
            })
            .collect();

        let mut img_to_anns: HashMap<u64, Vec<Annotation>> = HashMap::new();
        for ann in annotations {
            img_to_anns.entry(ann.image_id).or_default().push(ann);
        }

        Self {
            videos,
            images: images.into_iter().map(|img| (img.id, img)).collect(),
            categories,
            vid_to_imgs,
            img_to_anns,
        }
    }

    /// 所有视频id (升序)
    pub fn get_vid_ids(&self) -> Vec<u64> {
        if self.videos.is_empty() {
            return self.vid_to_imgs.keys().copied().collect();
        }
        let mut ids: Vec<u64> = self.videos.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids
    }

    /// 视频内的帧id, 按 frame_id 排序
    pub fn get_img_ids_from_vid(&self, vid_id: u64) -> Vec<u64> {
        self.vid_to_imgs.get(&vid_id).cloned().unwrap_or_default()
    }

    pub fn get_img_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.images.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn load_img(&self, img_id: u64) -> Result<FrameInfo> {
        self.images
            .get(&img_id)
            .cloned()
            .ok_or_else(|| FgfaError::Configuration(format!("unknown image id {}", img_id)))
    }

    /// 视频全部帧信息 (按 frame_id 排序)
    pub fn frames_of_video(&self, vid_id: u64) -> Result<Vec<FrameInfo>> {
        self.get_img_ids_from_vid(vid_id)
            .into_iter()
            .map(|id| self.load_img(id))
            .collect()
    }

    pub fn anns_for_img(&self, img_id: u64) -> &[Annotation] {
        self.img_to_anns
            .get(&img_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 按类别名查找类别id, 顺序与 `names` 一致, 未知名字跳过
    pub fn get_cat_ids(&self, names: &[&str]) -> Vec<u64> {
        names
            .iter()
            .filter_map(|name| {
                self.categories
                    .iter()
                    .find(|c| c.name == *name)
                    .map(|c| c.id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "videos": [{"id": 2, "name": "b"}, {"id": 1, "name": "a"}],
        "images": [
            {"id": 11, "video_id": 1, "frame_id": 1, "file_name": "a/1.JPEG", "is_vid_train_frame": true},
            {"id": 10, "video_id": 1, "frame_id": 0, "file_name": "a/0.JPEG", "is_vid_train_frame": false},
            {"id": 20, "video_id": 2, "frame_id": 0, "file_name": "b/0.JPEG"}
        ],
        "annotations": [
            {"id": 1, "image_id": 11, "category_id": 3, "bbox": [1.0, 2.0, 3.0, 4.0]}
        ],
        "categories": [{"id": 3, "name": "bear"}, {"id": 1, "name": "airplane"}]
    }"#;

    #[test]
    fn test_index_orders_frames() {
        let coco = CocoVid::from_json(SAMPLE).unwrap();
        assert_eq!(coco.get_vid_ids(), vec![1, 2]);
        assert_eq!(coco.get_img_ids_from_vid(1), vec![10, 11]);
        assert_eq!(coco.get_img_ids_from_vid(99), Vec::<u64>::new());
        assert_eq!(coco.anns_for_img(11).len(), 1);
        assert!(coco.anns_for_img(10).is_empty());
    }

    #[test]
    fn test_cat_ids_follow_name_order() {
        let coco = CocoVid::from_json(SAMPLE).unwrap();
        assert_eq!(coco.get_cat_ids(&["airplane", "bear", "zebra"]), vec![1, 3]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let coco = CocoVid::load(&path).unwrap();
        assert_eq!(coco.load_img(20).unwrap().file_name, "b/0.JPEG");
        assert!(matches!(coco.load_img(7), Err(FgfaError::Configuration(_))));
    }
}
