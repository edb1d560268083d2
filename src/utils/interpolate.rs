// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 插值与重采样工具模块
/// 实现类似于 F.interpolate(bilinear) / F.grid_sample 的功能 (NCHW, f32)
use ndarray::{Array3, Array4, ArrayView2, Axis, Zip};

use crate::error::{FgfaError, Result};

/// 双线性缩放 (align_corners = false)
///
/// 采用半像素中心约定: `src = (dst + 0.5) * in / out - 0.5`, 负坐标截断为0
pub fn resize_bilinear(x: &Array4<f32>, size: (usize, usize)) -> Array4<f32> {
    let (n, c, in_h, in_w) = x.dim();
    let (out_h, out_w) = size;
    if (in_h, in_w) == (out_h, out_w) {
        return x.clone();
    }

    let ys = source_taps(in_h, out_h);
    let xs = source_taps(in_w, out_w);

    let mut out = Array4::<f32>::zeros((n, c, out_h, out_w));
    for b in 0..n {
        for ch in 0..c {
            let src = x.index_axis(Axis(0), b);
            let src = src.index_axis(Axis(0), ch);
            let mut dst = out.index_axis_mut(Axis(0), b);
            let mut dst = dst.index_axis_mut(Axis(0), ch);
            for (oy, &(y0, y1, fy)) in ys.iter().enumerate() {
                for (ox, &(x0, x1, fx)) in xs.iter().enumerate() {
                    let v0 = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
                    let v1 = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
                    dst[[oy, ox]] = v0 * (1.0 - fy) + v1 * fy;
                }
            }
        }
    }
    out
}

/// 预计算每个输出坐标对应的 (左, 右, 权重)
fn source_taps(in_size: usize, out_size: usize) -> Vec<(usize, usize, f32)> {
    let scale = in_size as f32 / out_size as f32;
    (0..out_size)
        .map(|dst| {
            let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (src.floor() as usize).min(in_size - 1);
            let i1 = (i0 + 1).min(in_size - 1);
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

/// 按像素坐标双线性重采样 (反向映射), 越界坐标截断到边缘
///
/// # 参数
/// - `x`: 源特征 (N, C, H, W)
/// - `map_x`/`map_y`: 每个输出像素对应的源坐标 (N, H_out, W_out)
pub fn remap(x: &Array4<f32>, map_x: &Array3<f32>, map_y: &Array3<f32>) -> Result<Array4<f32>> {
    let (n, c, h, w) = x.dim();
    if h == 0 || w == 0 {
        return Err(FgfaError::Shape(format!("empty source {:?}", x.dim())));
    }
    if map_x.dim() != map_y.dim() || map_x.dim().0 != n {
        return Err(FgfaError::Shape(format!(
            "sampling maps {:?}/{:?} do not match batch {}",
            map_x.dim(),
            map_y.dim(),
            n
        )));
    }
    let (_, out_h, out_w) = map_x.dim();

    let mut out = Array4::<f32>::zeros((n, c, out_h, out_w));
    for b in 0..n {
        let mx = map_x.index_axis(Axis(0), b);
        let my = map_y.index_axis(Axis(0), b);
        for ch in 0..c {
            let plane = x.slice(ndarray::s![b, ch, .., ..]);
            let mut dst = out.slice_mut(ndarray::s![b, ch, .., ..]);
            Zip::from(&mut dst)
                .and(&mx)
                .and(&my)
                .for_each(|d, &sx, &sy| *d = get_pixel_bilinear(&plane, sx, sy));
        }
    }
    Ok(out)
}

/// 归一化网格采样 (grid 取值 [-1, 1], 形状 (N, H_out, W_out, 2), 最后一维为 (x, y))
///
/// 相当于 padding_mode = border 的 F.grid_sample
pub fn grid_sample(x: &Array4<f32>, grid: &Array4<f32>, align_corners: bool) -> Result<Array4<f32>> {
    let (n, _, h, w) = x.dim();
    let (gn, gh, gw, two) = grid.dim();
    if gn != n || two != 2 {
        return Err(FgfaError::Shape(format!(
            "grid must be (N={}, H, W, 2), got {:?}",
            n,
            grid.dim()
        )));
    }

    let mut map_x = Array3::<f32>::zeros((gn, gh, gw));
    let mut map_y = Array3::<f32>::zeros((gn, gh, gw));
    Zip::from(&mut map_x)
        .and(&grid.index_axis(Axis(3), 0))
        .for_each(|m, &g| *m = unnormalize(g, w, align_corners));
    Zip::from(&mut map_y)
        .and(&grid.index_axis(Axis(3), 1))
        .for_each(|m, &g| *m = unnormalize(g, h, align_corners));

    remap(x, &map_x, &map_y)
}

/// [-1, 1] → 像素坐标
pub fn unnormalize(coord: f32, size: usize, align_corners: bool) -> f32 {
    if align_corners {
        (coord + 1.0) / 2.0 * (size as f32 - 1.0)
    } else {
        ((coord + 1.0) * size as f32 - 1.0) / 2.0
    }
}

/// 双线性插值, 坐标先截断到 [0, size-1]
fn get_pixel_bilinear(src: &ArrayView2<f32>, x: f32, y: f32) -> f32 {
    let (height, width) = src.dim();
    let x = x.clamp(0.0, width as f32 - 1.0);
    let y = y.clamp(0.0, height as f32 - 1.0);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    // 权重为0的邻点不参与计算,保证整数坐标处结果精确
    let p00 = src[[y0, x0]];
    let p10 = if fx > 0.0 { src[[y0, x1]] } else { 0.0 };
    let p01 = if fy > 0.0 { src[[y1, x0]] } else { 0.0 };
    let p11 = if fx > 0.0 && fy > 0.0 { src[[y1, x1]] } else { 0.0 };

    let v0 = p00 * (1.0 - fx) + p10 * fx;
    let v1 = p01 * (1.0 - fx) + p11 * fx;
    v0 * (1.0 - fy) + v1 * fy
}
