// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// NCHW 张量基础算子 (卷积 / softmax / 归一化 / 拼接)
use ndarray::{concatenate, s, Array1, Array4, ArrayD, ArrayView4, Axis, Ix4, Zip};

use crate::error::{FgfaError, Result};

/// 步长为1的二维卷积,零填充
///
/// # 参数
/// - `x`: 输入 (N, C_in, H, W)
/// - `weight`: 卷积核 (C_out, C_in, kH, kW)
/// - `bias`: 可选偏置 (C_out)
/// - `padding`: 四周零填充像素数
pub fn conv2d(
    x: &Array4<f32>,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    padding: usize,
) -> Result<Array4<f32>> {
    let (n, c_in, h, w) = x.dim();
    let (c_out, w_in, kh, kw) = weight.dim();
    if w_in != c_in {
        return Err(FgfaError::Shape(format!(
            "conv weight expects {} input channels, got {}",
            w_in, c_in
        )));
    }
    if let Some(b) = bias {
        if b.len() != c_out {
            return Err(FgfaError::Shape(format!(
                "conv bias has {} entries, expected {}",
                b.len(),
                c_out
            )));
        }
    }
    if h + 2 * padding < kh || w + 2 * padding < kw {
        return Err(FgfaError::Shape(format!(
            "kernel {}x{} larger than padded input {}x{}",
            kh,
            kw,
            h + 2 * padding,
            w + 2 * padding
        )));
    }
    let out_h = h + 2 * padding - kh + 1;
    let out_w = w + 2 * padding - kw + 1;

    let mut out = Array4::<f32>::zeros((n, c_out, out_h, out_w));
    for ky in 0..kh {
        for kx in 0..kw {
            // 输出坐标 o 对应输入坐标 o + k - padding
            let dy = ky as isize - padding as isize;
            let dx = kx as isize - padding as isize;
            let (oy0, oy1) = valid_span(dy, h, out_h);
            let (ox0, ox1) = valid_span(dx, w, out_w);
            if oy0 >= oy1 || ox0 >= ox1 {
                continue;
            }
            let iy0 = (oy0 as isize + dy) as usize;
            let ix0 = (ox0 as isize + dx) as usize;
            let iy1 = iy0 + (oy1 - oy0);
            let ix1 = ix0 + (ox1 - ox0);

            for b in 0..n {
                for o in 0..c_out {
                    for i in 0..c_in {
                        let k = weight[[o, i, ky, kx]];
                        if k == 0.0 {
                            continue;
                        }
                        let src = x.slice(s![b, i, iy0..iy1, ix0..ix1]);
                        out.slice_mut(s![b, o, oy0..oy1, ox0..ox1])
                            .scaled_add(k, &src);
                    }
                }
            }
        }
    }

    if let Some(bias) = bias {
        for (o, &bv) in bias.iter().enumerate() {
            out.slice_mut(s![.., o, .., ..]).mapv_inplace(|v| v + bv);
        }
    }
    Ok(out)
}

/// 输出坐标范围 [lo, hi), 满足 0 <= o + d < size
fn valid_span(d: isize, size: usize, out: usize) -> (usize, usize) {
    let lo = (-d).max(0) as usize;
    let hi = (size as isize - d).clamp(0, out as isize) as usize;
    (lo.min(hi), hi)
}

/// 沿指定轴做 softmax (减去最大值保证数值稳定)
pub fn softmax(x: &Array4<f32>, axis: Axis) -> Array4<f32> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// 沿通道轴做 L2 归一化 (不加 epsilon; 零向量保持为零)
pub fn l2_normalize_channels(x: &Array4<f32>) -> Array4<f32> {
    let norm = x
        .mapv(|v| v * v)
        .sum_axis(Axis(1))
        .mapv(f32::sqrt)
        .insert_axis(Axis(1));
    let mut out = x.clone();
    Zip::from(&mut out)
        .and_broadcast(&norm)
        .for_each(|v, &n| {
            if n > 0.0 {
                *v /= n
            }
        });
    out
}

/// 沿批维度重复每个样本 `repeats` 次: [a, b] → [a, a, b, b]
pub fn repeat_interleave(x: &Array4<f32>, repeats: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    Array4::from_shape_fn((n * repeats, c, h, w), |(i, ch, y, xx)| {
        x[[i / repeats, ch, y, xx]]
    })
}

/// 动态维度 → NCHW, 维度数不为4时报错
pub fn to_nchw(x: ArrayD<f32>) -> Result<Array4<f32>> {
    let shape = x.shape().to_vec();
    x.into_dimensionality::<Ix4>().map_err(|_| {
        FgfaError::Shape(format!("expected a 4-d (N, C, H, W) tensor, got {:?}", shape))
    })
}

/// 沿指定轴拼接
pub fn cat(arrays: &[ArrayView4<f32>], axis: Axis) -> Result<Array4<f32>> {
    concatenate(axis, arrays).map_err(|e| FgfaError::Shape(format!("concatenate failed: {}", e)))
}
