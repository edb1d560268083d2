// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 数据集模块: COCO-VID 标注、ImageNet VID 数据集、参考帧采样
/// Dataset module
pub mod coco_vid;
pub mod imagenet_vid;
pub mod sampler;

pub use coco_vid::{Annotation, Category, CocoVid, FrameInfo, VideoInfo};
pub use imagenet_vid::{GroundTruth, VideoDataset, CLASSES};
pub use sampler::{FrameRange, SamplerConfig, SamplingPolicy, SamplingWindow};

/// 每帧推理所需的元信息
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImgMeta {
    pub file_name: String,
    /// 视频内帧序号, -1 表示未知
    pub frame_id: i64,
    /// 原图尺寸 (h, w)
    pub ori_shape: (usize, usize),
    /// 送入网络的尺寸 (h, w)
    pub img_shape: (usize, usize),
    /// 网络尺寸 / 原图尺寸 (w, h)
    pub scale_factor: (f32, f32),
    pub num_left_ref_imgs: Option<usize>,
    pub frame_stride: Option<usize>,
}

impl ImgMeta {
    pub fn with_frame_id(frame_id: i64) -> Self {
        Self {
            frame_id,
            scale_factor: (1.0, 1.0),
            ..Default::default()
        }
    }
}

impl From<&FrameInfo> for ImgMeta {
    fn from(info: &FrameInfo) -> Self {
        let shape = (info.height as usize, info.width as usize);
        Self {
            file_name: info.file_name.clone(),
            frame_id: info.frame_id,
            ori_shape: shape,
            img_shape: shape,
            scale_factor: (1.0, 1.0),
            num_left_ref_imgs: info.num_left_ref_imgs,
            frame_stride: info.frame_stride,
        }
    }
}
