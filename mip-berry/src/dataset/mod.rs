//! 数据集操作.
//!
//! 扫描与标注以文件名前后缀 ([`Affix`]) 区分, 分别放在两个目录中 (可以相同).
//! 去掉前后缀后的文件名 (stem) 必须两两对应.
//!
//! # 流程
//!
//! 1. [`discover`] 找出目录中所有匹配前后缀的文件, 按路径排序;
//! 2. [`check_image_mask_files`] 检查扫描与标注一一配对;
//! 3. [`split_indices`] 以固定种子划分训练/验证集;
//! 4. 每次访问时 (或缓存时一次性地) 加载 → 变换 → 标注操作.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use rand::seq::index;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consts::{
    DEFAULT_DATA_DIR, DEFAULT_IMAGE_AFFIX, DEFAULT_MASK_AFFIX, DEFAULT_PATCH_LEN,
    GOOD_SIGMA_RATIO, KEY_IMAGE, KEY_MASK, POS_CENTER_PROB, SPLIT_SEED, TARGET_PIXEL_DIM,
    TARGET_SPATIAL_SIZE,
};
use crate::transform::{random_state, Compose, RandomState, TransformError, TransformType};
use crate::{Idx3d, MaskOperation, Sample, Volume, VolumeError};

mod cache;
mod grouped;
mod nifti;
mod npz_cache;

pub use cache::split_shards;
pub use grouped::GroupedNiftiDataset;
pub use nifti::NiftiDataset;
pub use npz_cache::{write_npz_cache, NpzArchive, OpenArchiveError};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

/// 数据集错误.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// 目录中没有找到扫描文件.
    #[error("no image files found in {0:?}")]
    NoImageFiles(PathBuf),

    /// 目录中没有找到标注文件.
    #[error("no mask files found in {0:?}")]
    NoMaskFiles(PathBuf),

    /// 扫描与标注个数不同.
    #[error("found {images} image files but {masks} mask files")]
    CountMismatch {
        /// 扫描个数.
        images: usize,
        /// 标注个数.
        masks: usize,
    },

    /// 排序后同一位置的扫描与标注不对应.
    #[error("image {image:?} does not pair with mask {mask:?}")]
    PairMismatch {
        /// 扫描文件.
        image: PathBuf,
        /// 标注文件.
        mask: PathBuf,
    },

    /// 分组数据集各轮的样本数不同.
    #[error("epoch {epoch} has {found} samples, expected {expected}")]
    UnequalEpochs {
        /// 出问题的轮次.
        epoch: usize,
        /// 第 0 轮的样本数.
        expected: usize,
        /// 该轮的样本数.
        found: usize,
    },

    /// 样本索引越界.
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange {
        /// 索引.
        index: usize,
        /// 数据集长度.
        len: usize,
    },

    /// 读取体数据失败.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// 执行变换失败.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// 读写 npz 缓存失败.
    #[error(transparent)]
    Archive(#[from] OpenArchiveError),

    /// 底层 I/O 错误.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 无法创建缓存用的线程池.
    #[error("cannot build worker pool: {0}")]
    WorkerPool(String),
}

/// 数据集操作结果.
pub type DatasetResult<T> = Result<T, DatasetError>;

/// 文件名前后缀.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Affix {
    /// 前缀.
    pub prefix: String,

    /// 后缀.
    pub suffix: String,
}

impl Affix {
    /// 创建.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// 默认的扫描文件前后缀.
    pub fn image() -> Self {
        Self::new(DEFAULT_IMAGE_AFFIX.0, DEFAULT_IMAGE_AFFIX.1)
    }

    /// 默认的标注文件前后缀.
    pub fn mask() -> Self {
        Self::new(DEFAULT_MASK_AFFIX.0, DEFAULT_MASK_AFFIX.1)
    }

    /// 在后缀之前插入 `infix`, 得到新的前后缀.
    pub fn with_infix(&self, infix: &str) -> Self {
        Self::new(self.prefix.as_str(), format!("{infix}{}", self.suffix))
    }

    /// 文件名 `name` 是否匹配.
    #[inline]
    pub fn matches(&self, name: &str) -> bool {
        self.strip(name).is_some()
    }

    /// 去掉 `name` 的前后缀. 不匹配时返回 `None`.
    ///
    /// # 注意
    ///
    /// 前后缀不能重叠, 例如 `"a.nii"` 不匹配 `("a.n", ".nii")`.
    pub fn strip<'a>(&self, name: &'a str) -> Option<&'a str> {
        if name.len() < self.prefix.len() + self.suffix.len() {
            return None;
        }
        name.strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())
    }
}

fn file_name(p: &Path) -> &str {
    p.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// 找出目录 `dir` 中所有匹配 `affix` 的文件, 按路径排序.
pub fn discover<P: AsRef<Path>>(dir: P, affix: &Affix) -> DatasetResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if affix.matches(file_name(&path)) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// 检查扫描与标注一一配对: 都不为空, 个数相同, 且对应位置去掉前后缀后的名字相同.
///
/// `image_dir` 与 `mask_dir` 只用于错误信息.
pub fn check_image_mask_files(
    images: &[PathBuf],
    masks: &[PathBuf],
    image_affix: &Affix,
    mask_affix: &Affix,
    image_dir: &Path,
    mask_dir: &Path,
) -> DatasetResult<()> {
    if images.is_empty() {
        return Err(DatasetError::NoImageFiles(image_dir.to_path_buf()));
    }
    if masks.is_empty() {
        return Err(DatasetError::NoMaskFiles(mask_dir.to_path_buf()));
    }
    if images.len() != masks.len() {
        return Err(DatasetError::CountMismatch {
            images: images.len(),
            masks: masks.len(),
        });
    }
    for (image, mask) in images.iter().zip(masks) {
        let a = image_affix.strip(file_name(image));
        let b = mask_affix.strip(file_name(mask));
        if a.is_none() || a != b {
            return Err(DatasetError::PairMismatch {
                image: image.clone(),
                mask: mask.clone(),
            });
        }
    }
    Ok(())
}

/// 以固定种子划分 `n` 个样本.
///
/// 训练集为随机抽取的 `floor(n * split_ratio)` 个索引 (按抽取顺序),
/// 验证集为其余索引 (升序). 同样的 `n` 与 `split_ratio` 总是给出同样的划分.
pub fn split_indices(n: usize, split_ratio: f64, train: bool) -> Vec<usize> {
    let num_train = ((n as f64 * split_ratio.clamp(0.0, 1.0)).floor() as usize).min(n);
    let mut rng = random_state(SPLIT_SEED);
    let train_indices = index::sample(&mut rng, n, num_train).into_vec();
    if train {
        return train_indices;
    }
    let mut is_train = vec![false; n];
    train_indices.iter().for_each(|&i| is_train[i] = true);
    (0..n).filter(|&i| !is_train[i]).collect()
}

/// 加载一对文件, 执行变换与标注操作.
pub(crate) fn load_pair(
    image: &Path,
    mask: &Path,
    transform: &Compose,
    mask_operation: MaskOperation,
    rng: &mut RandomState,
) -> DatasetResult<(Volume, Volume)> {
    let mut sample = Sample::from_pair(Volume::open(image)?, Volume::open(mask)?);
    transform.apply(&mut sample, rng)?;
    let (image, mut mask) = sample.into_pair().ok_or_else(|| {
        TransformError::MissingKeys(vec![KEY_IMAGE.to_string(), KEY_MASK.to_string()])
    })?;
    mask_operation.apply(&mut mask);
    Ok((image, mask))
}

/// 由 `(扫描, 标注)` 对组成的数据集.
pub trait PairedDataset {
    /// 样本个数.
    fn len(&self) -> usize;

    /// 是否为空.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取第 `idx` 个样本.
    ///
    /// 未缓存时每次调用都重新加载并以 `rng` 执行随机变换; 已缓存时直接返回缓存副本,
    /// 不消耗 `rng`.
    fn get(&self, idx: usize, rng: &mut RandomState) -> DatasetResult<(Volume, Volume)>;
}

/// 数据集配置.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DatasetConfig {
    /// 扫描所在目录.
    pub data_dir: PathBuf,

    /// 标注所在目录.
    pub mask_dir: PathBuf,

    /// 扫描文件前后缀.
    pub image_affix: Affix,

    /// 标注文件前后缀.
    pub mask_affix: Affix,

    /// 变换流水线种类.
    pub transform: TransformType,

    /// 缩放目标大小或 patch 大小.
    pub size: Idx3d,

    /// 是否为训练集. 决定划分时取哪一侧.
    pub train: bool,

    /// 训练集占比.
    pub split_ratio: f64,

    /// 重采样的目标分辨率.
    pub target_pixel_dim: [f64; 3],

    /// 统一画布大小.
    pub target_spatial_size: Idx3d,

    /// 截断高斯采样的标准差比例.
    pub sigma_ratio: f64,

    /// 正样本偏置采样以正体素为中心的概率.
    pub pos_center_prob: f64,

    /// 最多使用的样本数.
    pub max_samples: Option<usize>,

    /// 构造时是否一次性加载并变换所有样本.
    pub cache: bool,

    /// 缓存时的 worker 个数, 0 表示在当前线程顺序构建.
    pub cache_pooling: usize,

    /// 标注操作.
    pub mask_operation: MaskOperation,

    /// 分组数据集的轮数.
    pub max_epochs: usize,

    /// 是否为预先提取 patch 的分组数据集.
    pub grouped: bool,

    /// 缓存时派生每个样本随机状态的种子.
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mask_dir: PathBuf::from(DEFAULT_DATA_DIR),
            image_affix: Affix::image(),
            mask_affix: Affix::mask(),
            transform: TransformType::default(),
            size: (DEFAULT_PATCH_LEN, DEFAULT_PATCH_LEN, DEFAULT_PATCH_LEN),
            train: true,
            split_ratio: 0.9,
            target_pixel_dim: TARGET_PIXEL_DIM,
            target_spatial_size: TARGET_SPATIAL_SIZE,
            sigma_ratio: GOOD_SIGMA_RATIO,
            pos_center_prob: POS_CENTER_PROB,
            max_samples: None,
            cache: false,
            cache_pooling: 0,
            mask_operation: MaskOperation::default(),
            max_epochs: 1,
            grouped: false,
            seed: 0,
        }
    }
}

/// 训练与验证数据集配置.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DataLoaderConfig {
    /// 训练集.
    pub train: DatasetConfig,

    /// 验证集.
    pub val: DatasetConfig,
}

/// 两种数据集之一.
#[derive(Debug)]
pub enum Dataset {
    /// 按划分加载完整体数据.
    Nifti(NiftiDataset),

    /// 按轮次加载预先提取的 patch.
    Grouped(GroupedNiftiDataset),
}

impl PairedDataset for Dataset {
    fn len(&self) -> usize {
        match self {
            Self::Nifti(d) => d.len(),
            Self::Grouped(d) => d.len(),
        }
    }

    fn get(&self, idx: usize, rng: &mut RandomState) -> DatasetResult<(Volume, Volume)> {
        match self {
            Self::Nifti(d) => d.get(idx, rng),
            Self::Grouped(d) => d.get(idx, rng),
        }
    }
}

impl Dataset {
    /// 进入下一轮. 只对分组数据集有效, 其余情况什么都不做.
    pub fn next_epoch(&mut self) -> DatasetResult<()> {
        match self {
            Self::Nifti(_) => Ok(()),
            Self::Grouped(d) => d.next_epoch(),
        }
    }
}

/// 按 `cfg.grouped` 创建训练集或验证集.
///
/// 分组数据集的每个 patch 已是最终形状, 因此不做任何变换, 标注也保持原样.
fn build_dataset(mut cfg: DatasetConfig) -> DatasetResult<Dataset> {
    if cfg.grouped {
        cfg.transform = TransformType::ToTensor;
        cfg.mask_operation = MaskOperation::Std;
        Ok(Dataset::Grouped(GroupedNiftiDataset::new(&cfg)?))
    } else {
        Ok(Dataset::Nifti(NiftiDataset::new(&cfg)?))
    }
}

/// 按配置创建 `(训练集, 验证集)`.
///
/// 两侧的 `train` 字段会被分别强制为 `true` / `false`, 各自的 `grouped` 决定数据集种类.
/// 分组数据集不做划分, 因此分组的验证集应当指向单独的目录.
pub fn get_dataset(cfg: &DataLoaderConfig) -> DatasetResult<(Dataset, Dataset)> {
    let mut train_cfg = cfg.train.clone();
    train_cfg.train = true;
    let mut val_cfg = cfg.val.clone();
    val_cfg.train = false;

    let train = build_dataset(train_cfg)?;
    let val = build_dataset(val_cfg)?;
    log::info!("train: {} samples, val: {} samples", train.len(), val.len());
    Ok((train, val))
}
