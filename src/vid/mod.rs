// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod fgfa;
pub mod memo;

pub use fgfa::{Fgfa, TestResults};
pub use memo::FeatureMemo;
