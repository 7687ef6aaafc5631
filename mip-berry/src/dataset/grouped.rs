//! 按轮次 (epoch) 分组的预提取 patch 数据集.

use std::path::PathBuf;

use super::cache::{build_cache, sample_rng};
use super::{
    check_image_mask_files, discover, load_pair, DatasetConfig, DatasetError, DatasetResult,
    PairedDataset,
};
use crate::transform::{get_transform, Compose, RandomState};
use crate::{MaskOperation, Volume};

/// 预先离线提取好的 patch, 每轮一组.
///
/// 第 `e` 轮的文件名形如 `{prefix}*_patch[e]{suffix}`. 第 `e` 轮访问第
/// `e % max_epochs` 组, 各组的样本数必须相同. 与 [`NiftiDataset`](super::NiftiDataset)
/// 不同, 这里不做训练/验证划分.
#[derive(Debug)]
pub struct GroupedNiftiDataset {
    image_files: Vec<Vec<PathBuf>>,
    mask_files: Vec<Vec<PathBuf>>,
    transform: Compose,
    mask_operation: MaskOperation,
    epoch: usize,
    seed: u64,
    use_cache: bool,
    cache_pooling: usize,
    cache: Option<Vec<(Volume, Volume)>>,
}

impl GroupedNiftiDataset {
    /// 按配置创建.
    ///
    /// `cfg.max_epochs` 为 0 时按 1 处理. `cfg.max_samples` 在每组内部截断.
    pub fn new(cfg: &DatasetConfig) -> DatasetResult<Self> {
        let max_epochs = cfg.max_epochs.max(1);
        let mut image_files = Vec::with_capacity(max_epochs);
        let mut mask_files = Vec::with_capacity(max_epochs);

        for epoch in 0..max_epochs {
            let infix = format!("_patch[{epoch}]");
            let mut images = discover(&cfg.data_dir, &cfg.image_affix.with_infix(&infix))?;
            let mut masks = discover(&cfg.mask_dir, &cfg.mask_affix.with_infix(&infix))?;
            if let Some(m) = cfg.max_samples {
                images.truncate(m);
                masks.truncate(m);
            }
            check_image_mask_files(
                &images,
                &masks,
                &cfg.image_affix,
                &cfg.mask_affix,
                &cfg.data_dir,
                &cfg.mask_dir,
            )?;
            if let Some(first) = image_files.first().map(Vec::len) {
                if images.len() != first {
                    return Err(DatasetError::UnequalEpochs {
                        epoch,
                        expected: first,
                        found: images.len(),
                    });
                }
            }
            image_files.push(images);
            mask_files.push(masks);
        }
        log::debug!(
            "{max_epochs} patch group(s) of {} in {:?}",
            image_files[0].len(),
            cfg.data_dir
        );

        let transform = get_transform(
            cfg.transform,
            cfg.size,
            cfg.target_pixel_dim,
            cfg.target_spatial_size,
            cfg.sigma_ratio,
            cfg.pos_center_prob,
        )?;
        let mut ans = Self {
            image_files,
            mask_files,
            transform,
            mask_operation: cfg.mask_operation,
            epoch: 0,
            seed: cfg.seed,
            use_cache: cfg.cache,
            cache_pooling: cfg.cache_pooling,
            cache: None,
        };
        if ans.use_cache {
            ans.cache = Some(ans.build_cache(0)?);
        }
        Ok(ans)
    }

    /// 分组个数.
    #[inline]
    pub fn max_epochs(&self) -> usize {
        self.image_files.len()
    }

    /// 当前轮次.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// 当前轮次使用的 `(扫描, 标注)` 文件.
    pub fn current_files(&self) -> (&[PathBuf], &[PathBuf]) {
        self.files_of(self.epoch)
    }

    /// 进入下一轮. 打开缓存时重新缓存新一组的样本.
    ///
    /// 重新缓存失败时, 轮次与缓存都保持不变.
    pub fn next_epoch(&mut self) -> DatasetResult<()> {
        let epoch = self.epoch + 1;
        if self.use_cache {
            self.cache = Some(self.build_cache(epoch)?);
        }
        self.epoch = epoch;
        Ok(())
    }

    fn files_of(&self, epoch: usize) -> (&[PathBuf], &[PathBuf]) {
        let g = epoch % self.max_epochs();
        (&self.image_files[g], &self.mask_files[g])
    }

    fn load(
        &self,
        epoch: usize,
        idx: usize,
        rng: &mut RandomState,
    ) -> DatasetResult<(Volume, Volume)> {
        let (images, masks) = self.files_of(epoch);
        load_pair(&images[idx], &masks[idx], &self.transform, self.mask_operation, rng)
    }

    /// 加载并变换第 `epoch` 轮的所有样本.
    fn build_cache(&self, epoch: usize) -> DatasetResult<Vec<(Volume, Volume)>> {
        // 不同轮次的样本使用不同的随机状态.
        let seed = self.seed.wrapping_add(epoch as u64);
        build_cache(self.len(), self.cache_pooling, |i| {
            self.load(epoch, i, &mut sample_rng(seed, i))
        })
    }
}

impl PairedDataset for GroupedNiftiDataset {
    #[inline]
    fn len(&self) -> usize {
        self.image_files[0].len()
    }

    fn get(&self, idx: usize, rng: &mut RandomState) -> DatasetResult<(Volume, Volume)> {
        if idx >= self.len() {
            return Err(DatasetError::IndexOutOfRange {
                index: idx,
                len: self.len(),
            });
        }
        match &self.cache {
            Some(cache) => Ok(cache[idx].clone()),
            None => self.load(self.epoch, idx, rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_nii;
    use crate::dataset::tests::touch;
    use crate::transform::{random_state, TransformType};
    use ndarray::Array3;
    use std::path::Path;

    fn config(dir: &Path) -> DatasetConfig {
        DatasetConfig {
            data_dir: dir.to_path_buf(),
            mask_dir: dir.to_path_buf(),
            transform: TransformType::ToTensor,
            grouped: true,
            max_epochs: 2,
            ..DatasetConfig::default()
        }
    }

    fn names(epoch: usize, cases: &[&str]) -> Vec<String> {
        cases
            .iter()
            .flat_map(|c| {
                [
                    format!("{c}_patch[{epoch}].img.nii.gz"),
                    format!("{c}_patch[{epoch}].label.nii.gz"),
                ]
            })
            .collect()
    }

    fn touch_all(dir: &Path, names: &[String]) {
        touch(dir, &names.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_epochs_rotate() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &names(0, &["a", "b", "c"]));
        touch_all(dir.path(), &names(1, &["d", "e", "f"]));
        // 不属于任何一组.
        touch_all(dir.path(), &["a.img.nii.gz".to_string()]);

        let mut ds = GroupedNiftiDataset::new(&config(dir.path())).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.max_epochs(), 2);

        let first = |ds: &GroupedNiftiDataset| {
            ds.current_files().0[0]
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        };
        assert_eq!(first(&ds), "a_patch[0].img.nii.gz");
        ds.next_epoch().unwrap();
        assert_eq!(ds.epoch(), 1);
        assert_eq!(first(&ds), "d_patch[1].img.nii.gz");
        ds.next_epoch().unwrap();
        assert_eq!(first(&ds), "a_patch[0].img.nii.gz");
    }

    #[test]
    fn test_unequal_epochs() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &names(0, &["a", "b", "c"]));
        touch_all(dir.path(), &names(1, &["d", "e"]));
        assert!(matches!(
            GroupedNiftiDataset::new(&config(dir.path())),
            Err(DatasetError::UnequalEpochs { epoch: 1, expected: 3, found: 2 })
        ));

        // 截断后各组相同.
        let mut cfg = config(dir.path());
        cfg.max_samples = Some(2);
        assert_eq!(GroupedNiftiDataset::new(&cfg).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_epoch() {
        let dir = tempfile::tempdir().unwrap();
        touch_all(dir.path(), &names(0, &["a"]));
        assert!(matches!(
            GroupedNiftiDataset::new(&config(dir.path())),
            Err(DatasetError::NoImageFiles(_))
        ));
    }

    #[test]
    fn test_failed_recache_keeps_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut mask = Array3::zeros((2, 2, 2));
        mask[(1, 1, 1)] = 1.0;
        for name in names(0, &["a", "b"]) {
            write_nii(&dir.path().join(name), &mask, [1.0; 3]);
        }
        // 第 1 组不是合法的 nifti.
        touch_all(dir.path(), &names(1, &["c", "d"]));

        let mut cfg = config(dir.path());
        cfg.cache = true;
        let mut ds = GroupedNiftiDataset::new(&cfg).unwrap();
        assert!(matches!(ds.next_epoch(), Err(DatasetError::Volume(_))));
        assert_eq!(ds.epoch(), 0);
        assert!(ds.current_files().0[0].ends_with("a_patch[0].img.nii.gz"));

        let (_, m) = ds.get(1, &mut random_state(0)).unwrap();
        assert_eq!(m[(0, 1, 1, 1)], 1.0);

        // 不缓存时只切换文件.
        cfg.cache = false;
        let mut ds = GroupedNiftiDataset::new(&cfg).unwrap();
        ds.next_epoch().unwrap();
        assert_eq!(ds.epoch(), 1);
        assert!(ds.get(0, &mut random_state(0)).is_err());
    }
}
