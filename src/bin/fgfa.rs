// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// FGFA 视频目标检测 - 逐帧流式推理
///
/// 主程序入口 - 直接运行: cargo run --bin fgfa --release -- --frames <dir> --backbone <onnx> --bbox-head <onnx> --flownet <onnx>
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use fgfa_rs::dataset::{sampler, FrameInfo, SamplerConfig, SamplingPolicy, CLASSES};
use fgfa_rs::utils::preprocess::{load_frame, Normalize};
use fgfa_rs::utils::tensor::cat;
use fgfa_rs::{logging, Args, Fgfa, FgfaConfig};

const IMG_EXTS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 帧目录按文件名排序, 视为同一个视频
fn list_frames(dir: &Path) -> anyhow::Result<Vec<FrameInfo>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("无法读取帧目录 {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMG_EXTS.contains(&e.to_lowercase().as_str()))
        })
        .collect();
    paths.sort();

    Ok(paths
        .iter()
        .enumerate()
        .map(|(i, p)| FrameInfo {
            file_name: p.display().to_string(),
            is_vid_train_frame: false,
            ..FrameInfo::new(i as u64, 0, i as i64)
        })
        .collect())
}

fn load_refs(refs: &[FrameInfo], norm: &Normalize) -> anyhow::Result<Option<Array4<f32>>> {
    if refs.is_empty() {
        return Ok(None);
    }
    let mut xs = Vec::with_capacity(refs.len());
    for r in refs {
        let (x, _) = load_frame(&r.file_name, r.frame_id, None, Some(norm))?;
        xs.push(x);
    }
    let views: Vec<_> = xs.iter().map(|x| x.view()).collect();
    Ok(Some(cat(&views, Axis(0))?))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_with_level(&args.log_level);

    let mut config = match &args.config {
        Some(path) if path.exists() => FgfaConfig::load(path)?,
        Some(path) => {
            warn!("⚠️ 配置文件 {} 不存在, 使用默认配置", path.display());
            FgfaConfig::default()
        }
        None => FgfaConfig::default(),
    };
    args.apply(&mut config);
    config.test_mode = true;
    if args.stride.is_some() {
        config.sampler.policy = SamplingPolicy::TestWithFixStride;
    } else if !config.sampler.policy.is_test() {
        let stride = config.sampler.stride;
        config.sampler = SamplerConfig::test_default();
        config.sampler.stride = stride;
    }
    // 只需要新到的参考帧, 关键帧单独读取
    config.sampler.return_key_frame = false;
    config.summary();

    let video = list_frames(&args.frames)?;
    if video.is_empty() {
        bail!("帧目录 {} 中没有图像", args.frames.display());
    }
    info!("🎞️  {} 帧: {}", video.len(), args.frames.display());

    let mut model = Fgfa::from_config(&config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let norm = Normalize::IMAGENET;

    let t_all = Instant::now();
    for frame in &video {
        let t = Instant::now();
        let mut key = frame.clone();
        let refs = sampler::sample(&mut key, Some(&video[..]), &config.sampler, &mut rng)?;
        let ref_img = load_refs(&refs, &norm)?;

        let (img, mut meta) = load_frame(&key.file_name, key.frame_id, None, Some(&norm))?;
        meta.num_left_ref_imgs = key.num_left_ref_imgs;
        meta.frame_stride = key.frame_stride;

        let res = model.simple_test(&img, &[meta], ref_img.as_ref(), None, true)?;
        let num_dets: usize = res.det_bboxes.iter().map(|c| c.len()).sum();
        info!(
            "frame {:>5} | {} 参考帧 | {} 个目标 | {:.1?}",
            key.frame_id,
            refs.len(),
            num_dets,
            t.elapsed()
        );
        for (cls, dets) in res.det_bboxes.iter().enumerate() {
            let name = CLASSES.get(cls).copied().unwrap_or("unknown");
            for [x1, y1, x2, y2, score] in dets {
                info!(
                    "  {} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
                    name, score, x1, y1, x2, y2
                );
            }
        }
    }
    info!(
        "✅ 完成 {} 帧, 用时 {:.1?}",
        video.len(),
        t_all.elapsed()
    );
    Ok(())
}
