// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 错误类型 (Error taxonomy)

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FgfaError {
    /// 采样窗口非法 (malformed sampling window)
    #[error("invalid frame range: {0}")]
    InvalidRange(String),

    /// 张量维度/通道/批大小不匹配
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// 流式推理状态错误 (帧序号未设置/乱序)
    #[error("state error: {0}")]
    State(String),

    #[error("onnx runtime error: {0}")]
    Ort(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<ndarray::ShapeError> for FgfaError {
    fn from(e: ndarray::ShapeError) -> Self {
        FgfaError::Shape(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FgfaError>;

/// ort 各版本的错误类型不统一,统一转成字符串
pub(crate) fn ort_err<E: std::fmt::Display>(e: E) -> FgfaError {
    FgfaError::Ort(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FgfaError::InvalidRange("length must be 2, got 3".to_string());
        assert_eq!(e.to_string(), "invalid frame range: length must be 2, got 3");

        let e = FgfaError::State("frame_id is unset".to_string());
        assert_eq!(e.to_string(), "state error: frame_id is unset");
    }

    #[test]
    fn test_shape_error_conversion() {
        let err = ndarray::Array::from_shape_vec((2, 2), vec![1.0f32; 3]).unwrap_err();
        let e: FgfaError = err.into();
        assert!(matches!(e, FgfaError::Shape(_)));
    }
}
