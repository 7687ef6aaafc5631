//! 对 `mip-berry::dataset` 的更一层封装. 提供更直接的标注加载器.

use mip_berry::data::VolumeResult;
use mip_berry::dataset::{self, Affix, DatasetResult};
use mip_berry::Volume;
use std::env;
use std::path::{Path, PathBuf};

/// 获取训练集标注基本路径.
///
/// 1. 若环境变量 `$MIP_MASK_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/training_data`.
///
/// 两者都不可用时返回 `None`.
pub fn mask_dir_from_env_or_home() -> Option<PathBuf> {
    match env::var("MIP_MASK_DIR") {
        Ok(d) if !d.is_empty() => Some(PathBuf::from(d)),
        _ => dataset::home_dataset_dir_with(["training_data"]),
    }
}

/// 逐个加载 `dir` 下的所有标注, 产出 `(序号, 加载结果)`.
pub fn mask_loader<P: AsRef<Path>>(
    dir: P,
) -> DatasetResult<impl Iterator<Item = (usize, VolumeResult<Volume>)>> {
    let files = dataset::discover(dir, &Affix::mask())?;
    Ok(files.into_iter().enumerate().map(|(i, p)| (i, Volume::open(p))))
}
