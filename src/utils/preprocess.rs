// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 图像预处理: DynamicImage → (1, 3, H, W) 张量
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use ndarray::Array4;

use crate::dataset::ImgMeta;
use crate::error::Result;

/// 按通道 (RGB, 0-1) 归一化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub const IMAGENET: Normalize = Normalize {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

/// 图像转张量, 可选缩放到 (w, h) 与均值方差归一化
pub fn image_to_tensor(
    img: &DynamicImage,
    size: Option<(u32, u32)>,
    norm: Option<&Normalize>,
) -> Array4<f32> {
    let img = match size {
        Some((w, h)) if (w, h) != img.dimensions() => {
            img.resize_exact(w, h, image::imageops::FilterType::Triangle)
        }
        _ => img.clone(),
    };
    let (w, h) = img.dimensions();
    let mut ys = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, rgb) in img.pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b, _] = rgb.0;
        for (c, v) in [r, g, b].into_iter().enumerate() {
            let v = v as f32 / 255.0;
            ys[[0, c, y, x]] = match norm {
                Some(n) => (v - n.mean[c]) / n.std[c],
                None => v,
            };
        }
    }
    ys
}

/// 读取一帧图像并生成对应的元信息
pub fn load_frame<P: AsRef<Path>>(
    path: P,
    frame_id: i64,
    size: Option<(u32, u32)>,
    norm: Option<&Normalize>,
) -> Result<(Array4<f32>, ImgMeta)> {
    let path = path.as_ref();
    let img = image::open(path)?;
    let (w0, h0) = img.dimensions();
    let xs = image_to_tensor(&img, size, norm);
    let (_, _, h, w) = xs.dim();
    let meta = ImgMeta {
        file_name: path.display().to_string(),
        frame_id,
        ori_shape: (h0 as usize, w0 as usize),
        img_shape: (h, w),
        scale_factor: (w as f32 / w0 as f32, h as f32 / h0 as f32),
        num_left_ref_imgs: None,
        frame_stride: None,
    };
    Ok((xs, meta))
}
