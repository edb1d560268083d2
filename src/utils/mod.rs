// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 工具模块
/// Utility modules
pub mod interpolate;
pub mod preprocess;
pub mod tensor;
