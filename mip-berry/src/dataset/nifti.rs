//! 按划分加载完整体数据的数据集.

use std::path::PathBuf;

use super::cache::{build_cache, sample_rng};
use super::{
    check_image_mask_files, discover, load_pair, split_indices, DatasetConfig, DatasetError,
    DatasetResult, PairedDataset,
};
use crate::transform::{get_transform, Compose, RandomState};
use crate::{MaskOperation, Volume};

/// 成对的 nifti 扫描与标注.
///
/// 构造时发现并校验文件, 按固定种子划分出训练集或验证集, 再按 `max_samples` 截断.
/// 打开缓存时, 所有样本在构造时就被加载并变换一次, 之后的访问只返回副本;
/// 因此缓存下的随机裁剪在整个训练过程中是固定的.
#[derive(Debug)]
pub struct NiftiDataset {
    image_files: Vec<PathBuf>,
    mask_files: Vec<PathBuf>,
    transform: Compose,
    mask_operation: MaskOperation,
    seed: u64,
    cache_pooling: usize,
    cache: Option<Vec<(Volume, Volume)>>,
}

impl NiftiDataset {
    /// 按配置创建, 变换流水线由 `cfg.transform` 决定.
    pub fn new(cfg: &DatasetConfig) -> DatasetResult<Self> {
        let transform = get_transform(
            cfg.transform,
            cfg.size,
            cfg.target_pixel_dim,
            cfg.target_spatial_size,
            cfg.sigma_ratio,
            cfg.pos_center_prob,
        )?;
        Self::with_transform(cfg, transform)
    }

    /// 按配置创建, 但使用给定的变换流水线 (忽略 `cfg.transform`).
    pub fn with_transform(cfg: &DatasetConfig, transform: Compose) -> DatasetResult<Self> {
        let images = discover(&cfg.data_dir, &cfg.image_affix)?;
        let masks = discover(&cfg.mask_dir, &cfg.mask_affix)?;
        check_image_mask_files(
            &images,
            &masks,
            &cfg.image_affix,
            &cfg.mask_affix,
            &cfg.data_dir,
            &cfg.mask_dir,
        )?;

        let mut indices = split_indices(images.len(), cfg.split_ratio, cfg.train);
        if let Some(m) = cfg.max_samples {
            indices.truncate(m);
        }
        log::debug!(
            "{} split: {} of {} pairs in {:?}",
            if cfg.train { "train" } else { "val" },
            indices.len(),
            images.len(),
            cfg.data_dir
        );

        let mut ans = Self {
            image_files: indices.iter().map(|&i| images[i].clone()).collect(),
            mask_files: indices.iter().map(|&i| masks[i].clone()).collect(),
            transform,
            mask_operation: cfg.mask_operation,
            seed: cfg.seed,
            cache_pooling: cfg.cache_pooling,
            cache: None,
        };
        if cfg.cache {
            ans.init_cache()?;
        }
        Ok(ans)
    }

    /// 扫描文件, 与 [`mask_files`](Self::mask_files) 一一对应.
    #[inline]
    pub fn image_files(&self) -> &[PathBuf] {
        &self.image_files
    }

    /// 标注文件.
    #[inline]
    pub fn mask_files(&self) -> &[PathBuf] {
        &self.mask_files
    }

    /// 是否已缓存.
    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// 缓存内容, 可交给 [`write_npz_cache`](super::write_npz_cache) 保存. 未缓存时为 `None`.
    #[inline]
    pub fn cached(&self) -> Option<&[(Volume, Volume)]> {
        self.cache.as_deref()
    }

    fn load(&self, idx: usize, rng: &mut RandomState) -> DatasetResult<(Volume, Volume)> {
        load_pair(
            &self.image_files[idx],
            &self.mask_files[idx],
            &self.transform,
            self.mask_operation,
            rng,
        )
    }

    /// 加载并变换所有样本.
    pub fn init_cache(&mut self) -> DatasetResult<()> {
        let seed = self.seed;
        let cached = build_cache(self.len(), self.cache_pooling, |i| {
            self.load(i, &mut sample_rng(seed, i))
        })?;
        self.cache = Some(cached);
        Ok(())
    }
}

impl PairedDataset for NiftiDataset {
    #[inline]
    fn len(&self) -> usize {
        self.image_files.len()
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
            None => self.load(idx, rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_nii;
    use crate::dataset::tests::touch;
    use crate::dataset::Affix;
    use crate::transform::{random_state, TransformType};
    use ndarray::{Array3, Array4};

    fn config(dir: &std::path::Path, n: usize) -> DatasetConfig {
        let names: Vec<String> = (0..n)
            .flat_map(|i| [format!("case{i:02}.img.nii.gz"), format!("case{i:02}.label.nii.gz")])
            .collect();
        touch(dir, &names.iter().map(String::as_str).collect::<Vec<_>>());
        DatasetConfig {
            data_dir: dir.to_path_buf(),
            mask_dir: dir.to_path_buf(),
            transform: TransformType::ToTensor,
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn test_split_and_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 10);
        let train = NiftiDataset::new(&cfg).unwrap();
        cfg.train = false;
        let val = NiftiDataset::new(&cfg).unwrap();
        assert_eq!(train.len(), 9);
        assert_eq!(val.len(), 1);

        let (ia, ma) = (Affix::image(), Affix::mask());
        for ds in [&train, &val] {
            for (i, m) in ds.image_files().iter().zip(ds.mask_files()) {
                let a = ia.strip(i.file_name().unwrap().to_str().unwrap());
                let b = ma.strip(m.file_name().unwrap().to_str().unwrap());
                assert_eq!(a, b);
            }
        }
        assert!(!train.image_files().contains(&val.image_files()[0]));
    }

    #[test]
    fn test_max_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 10);
        cfg.max_samples = Some(4);
        let ds = NiftiDataset::new(&cfg).unwrap();
        assert_eq!(ds.len(), 4);
        assert!(!ds.is_cached());
    }

    #[test]
    fn test_get_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let ds = NiftiDataset::new(&config(dir.path(), 3)).unwrap();
        assert!(matches!(
            ds.get(5, &mut random_state(0)),
            Err(DatasetError::IndexOutOfRange { index: 5, len: 2 })
        ));
        // 空文件不是合法的 nifti.
        assert!(matches!(
            ds.get(0, &mut random_state(0)),
            Err(DatasetError::Volume(_))
        ));
    }

    #[test]
    fn test_cache_failure_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 4);
        cfg.cache = true;
        cfg.cache_pooling = 2;
        assert!(matches!(NiftiDataset::new(&cfg), Err(DatasetError::Volume(_))));
    }

    /// 写一对 `(x, y, z) = (4, 3, 2)` 的扫描与标注, 标注只有 `(3, 2, 1)` 处为 1.
    fn write_case(dir: &std::path::Path, name: &str) {
        let image = Array3::from_shape_fn((4, 3, 2), |(x, y, z)| (100 * z + 10 * y + x) as f32);
        let mut mask = Array3::zeros((4, 3, 2));
        mask[(3, 2, 1)] = 1.0;
        let pix_dim = [0.5, 0.75, 2.0];
        write_nii(&dir.join(format!("{name}.img.nii.gz")), &image, pix_dim);
        write_nii(&dir.join(format!("{name}.label.nii.gz")), &mask, pix_dim);
    }

    #[test]
    fn test_get_reads_volumes() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "case00");
        let cfg = DatasetConfig {
            data_dir: dir.path().to_path_buf(),
            mask_dir: dir.path().to_path_buf(),
            transform: TransformType::ToTensor,
            split_ratio: 1.0,
            ..DatasetConfig::default()
        };
        let ds = NiftiDataset::new(&cfg).unwrap();
        assert_eq!(ds.len(), 1);

        let (image, mask) = ds.get(0, &mut random_state(0)).unwrap();
        assert_eq!(image.shape(), (2, 3, 4));
        assert_eq!(image.pix_dim(), [2.0, 0.75, 0.5]);
        assert_eq!(image[(0, 1, 2, 3)], 123.0);
        assert_eq!(mask[(0, 1, 2, 3)], 1.0);
        assert_eq!(mask.count_positive(), 1);
    }

    #[test]
    fn test_positive_patch_from_files() {
        let dir = tempfile::tempdir().unwrap();
        write_case(dir.path(), "case00");
        let cfg = DatasetConfig {
            data_dir: dir.path().to_path_buf(),
            mask_dir: dir.path().to_path_buf(),
            transform: TransformType::PatchPosCenter,
            size: (1, 1, 1),
            split_ratio: 1.0,
            target_pixel_dim: [2.0, 0.75, 0.5],
            target_spatial_size: (2, 3, 4),
            pos_center_prob: 1.0,
            ..DatasetConfig::default()
        };

        let ds = NiftiDataset::new(&cfg).unwrap();
        let (image, mask) = ds.get(0, &mut random_state(3)).unwrap();
        assert_eq!(image.shape(), (1, 1, 1));
        assert_eq!(mask.data(), Array4::<f32>::ones((1, 1, 1, 1)));

        // 缓存路径给出同样的 patch.
        let cached = NiftiDataset::new(&DatasetConfig { cache: true, ..cfg }).unwrap();
        assert!(cached.is_cached());
        let (_, mask) = cached.get(0, &mut random_state(0)).unwrap();
        assert_eq!(mask[(0, 0, 0, 0)], 1.0);
    }
}
