// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 光流特征对齐 (flow-guided feature warping)
use ndarray::{Array4, Axis, Zip};

use crate::error::{FgfaError, Result};
use crate::utils::interpolate::{grid_sample, resize_bilinear};

/// 用光流把特征图对齐到另一帧的坐标系
///
/// # 参数
/// - `x`: 特征 (N, C, H_x, W_x)
/// - `flow`: 光流 (N, 2, H_f, W_f), 通道顺序 (dx, dy)
///
/// # Returns
/// 对齐后的特征 (N, C, H_x, W_x)
pub fn flow_warp_feats(x: &Array4<f32>, flow: &Array4<f32>) -> Result<Array4<f32>> {
    let (n, _, h, w) = x.dim();
    let (fn_, fc, fh, fw) = flow.dim();
    if fc != 2 {
        return Err(FgfaError::Shape(format!(
            "flow must have 2 channels, got {}",
            fc
        )));
    }
    if fn_ != n {
        return Err(FgfaError::Shape(format!(
            "flow batch {} does not match feature batch {}",
            fn_, n
        )));
    }
    if h == 0 || w == 0 || fh == 0 || fw == 0 {
        return Err(FgfaError::Shape(format!(
            "empty spatial size: features {:?}, flow {:?}",
            x.dim(),
            flow.dim()
        )));
    }

    // 1. 光流缩放到特征分辨率, 位移按宽度比例放大
    let scale = w as f32 / fw as f32;
    let mut flow = resize_bilinear(flow, (h, w));
    if scale != 1.0 {
        flow.mapv_inplace(|v| v * scale);
    }

    // 2. 采样网格 = 像素坐标 + 位移, 归一化到 [-1, 1]
    let mut grid = Array4::<f32>::zeros((n, h, w, 2));
    for (b, mut g) in grid.axis_iter_mut(Axis(0)).enumerate() {
        let fx = flow.index_axis(Axis(0), b);
        let dx = fx.index_axis(Axis(0), 0);
        let dy = fx.index_axis(Axis(0), 1);
        Zip::indexed(g.lanes_mut(Axis(2)))
            .and(&dx)
            .and(&dy)
            .for_each(|(yy, xx), mut p, &u, &v| {
                p[0] = normalize(xx as f32 + u, w);
                p[1] = normalize(yy as f32 + v, h);
            });
    }

    // 3. 双线性采样, 越界取边缘值
    grid_sample(x, &grid, true)
}

/// 像素坐标 → [-1, 1] (align_corners)
fn normalize(coord: f32, size: usize) -> f32 {
    if size > 1 {
        coord / (size as f32 - 1.0) * 2.0 - 1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn feats(n: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            (b * 1000 + ch * 100 + y * 10 + x) as f32
        })
    }

    #[test]
    fn test_zero_flow_is_identity() {
        let x = feats(2, 3, 5, 7);
        let flow = Array4::zeros((2, 2, 5, 7));
        let y = flow_warp_feats(&x, &flow).unwrap();
        for (a, b) in y.iter().zip(x.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_zero_flow_at_other_resolution() {
        let x = feats(1, 2, 4, 6);
        let flow = Array4::zeros((1, 2, 8, 12));
        let y = flow_warp_feats(&x, &flow).unwrap();
        for (a, b) in y.iter().zip(x.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_integer_translation() {
        let x = feats(1, 1, 4, 6);
        let mut flow = Array4::zeros((1, 2, 4, 6));
        // 每个像素从右侧一列取值
        flow.index_axis_mut(Axis(1), 0).fill(1.0);
        let y = flow_warp_feats(&x, &flow).unwrap();
        for yy in 0..4 {
            for xx in 0..5 {
                assert_abs_diff_eq!(y[[0, 0, yy, xx]], x[[0, 0, yy, xx + 1]], epsilon = 1e-3);
            }
            // 越界 → 边缘复制
            assert_abs_diff_eq!(y[[0, 0, yy, 5]], x[[0, 0, yy, 5]], epsilon = 1e-3);
        }
    }

    #[test]
    fn test_flow_magnitude_scaled_with_width() {
        // 光流宽度为特征宽度一半: 位移 1 → 2 个像素
        let x = feats(1, 1, 4, 8);
        let mut flow = Array4::zeros((1, 2, 2, 4));
        flow.index_axis_mut(Axis(1), 0).fill(1.0);
        let y = flow_warp_feats(&x, &flow).unwrap();
        for yy in 0..4 {
            for xx in 0..6 {
                assert_abs_diff_eq!(y[[0, 0, yy, xx]], x[[0, 0, yy, xx + 2]], epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_shape_errors() {
        let x = feats(1, 2, 4, 4);
        assert!(matches!(
            flow_warp_feats(&x, &Array4::zeros((1, 3, 4, 4))),
            Err(FgfaError::Shape(_))
        ));
        assert!(matches!(
            flow_warp_feats(&x, &Array4::zeros((2, 2, 4, 4))),
            Err(FgfaError::Shape(_))
        ));
    }

    #[test]
    fn test_empty_flow_is_shape_error() {
        let x = feats(1, 2, 4, 4);
        for dim in [(1, 2, 0, 4), (1, 2, 4, 0)] {
            assert!(matches!(
                flow_warp_feats(&x, &Array4::zeros(dim)),
                Err(FgfaError::Shape(_))
            ));
        }
        assert!(matches!(
            flow_warp_feats(&Array4::zeros((1, 2, 0, 4)), &Array4::zeros((1, 2, 4, 4))),
            Err(FgfaError::Shape(_))
        ));
    }
}
