// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
/// 特征聚合模块
/// Feature aggregators
pub mod embed;

pub use embed::{BatchNorm, ConvModule, EmbedAggregator};

use crate::config::AggregatorConfig;
use crate::error::Result;

/// 有权重文件时加载, 否则按种子初始化
pub fn build_aggregator(cfg: &AggregatorConfig, seed: u64) -> Result<EmbedAggregator> {
    match &cfg.pretrained {
        Some(path) => EmbedAggregator::load_weights(path),
        None => EmbedAggregator::new(cfg, seed),
    }
}
