//! 比较三种 patch 中心采样器 (截断高斯 / 正样本偏置 / 均匀) 的中心分布.
//!
//! 标注目录由 `$MIP_MASK_DIR` 指定, 找不到时使用合成标注.

use log::LevelFilter;
use simple_logger::SimpleLogger;

mod algos;
mod result;
mod runner;

fn main() -> std::io::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .expect("logger should only be initialized once");

    runner::run().analyze()
}
