//! 随机 patch 裁剪.
//!
//! 每次调用只采样 **一个** 中心, 所有键用同一个中心裁剪, 因此扫描与标注始终对齐.

use ndarray::s;
use rand::Rng;

use super::{KeySet, MapTransform, RandomState, TransformError, TransformResult};
use crate::{Idx3d, Sample, Volume};

mod sampler;

pub use sampler::{
    truncated_normal, CenterSource, PositiveBiasedCenter, TruncatedGaussianCenter, UniformCenter,
};

/// 裁剪参数: patch 的空间大小 `(z, y, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropSpec {
    roi_size: Idx3d,
}

impl CropSpec {
    /// 任一分量为 0 时返回 `None`.
    pub fn new(roi_size: Idx3d) -> Option<Self> {
        let (z, y, x) = roi_size;
        (z > 0 && y > 0 && x > 0).then_some(Self { roi_size })
    }

    /// 立方体 patch.
    #[inline]
    pub fn cube(len: usize) -> Option<Self> {
        Self::new((len, len, len))
    }

    /// patch 大小.
    #[inline]
    pub fn roi_size(&self) -> Idx3d {
        self.roi_size
    }

    /// 每个轴的 `roi / 2` (向下取整).
    #[inline]
    pub fn half(&self) -> [usize; 3] {
        let (z, y, x) = self.roi_size;
        [z / 2, y / 2, x / 2]
    }

    /// 检查 patch 能否放入空间形状 `shape`.
    pub fn check(&self, shape: Idx3d) -> TransformResult<()> {
        let (rz, ry, rx) = self.roi_size;
        if rz > shape.0 || ry > shape.1 || rx > shape.2 {
            return Err(TransformError::RoiTooLarge {
                roi: self.roi_size,
                shape,
            });
        }
        Ok(())
    }

    /// 每个轴上合法中心的闭区间 `[roi / 2, shape - roi + roi / 2]`.
    ///
    /// 以其中任一点为中心, patch 的起点 `c - roi / 2` 都落在 `[0, shape - roi]`.
    pub fn center_bounds(&self, shape: Idx3d) -> TransformResult<[(usize, usize); 3]> {
        self.check(shape)?;
        let (rz, ry, rx) = self.roi_size;
        let [hz, hy, hx] = self.half();
        Ok([
            (hz, shape.0 - rz + hz),
            (hy, shape.1 - ry + hy),
            (hx, shape.2 - rx + hx),
        ])
    }

    /// `center` 是否为 `shape` 下的合法中心.
    pub fn is_valid_center(&self, shape: Idx3d, center: Idx3d) -> bool {
        let Ok(b) = self.center_bounds(shape) else {
            return false;
        };
        let c = [center.0, center.1, center.2];
        (0..3).all(|i| b[i].0 <= c[i] && c[i] <= b[i].1)
    }
}

/// 以 `center` 为中心, 从 `volume` 的所有通道中提取大小为 `crop.roi_size()` 的 patch.
///
/// 元数据原样保留.
///
/// # 注意
///
/// 不做越界检查, 由调用方保证 `center` 合法 (见 [`CropSpec::center_bounds`]),
/// 否则会 panic.
pub fn extract_patch(volume: &Volume, center: Idx3d, crop: &CropSpec) -> Volume {
    let [hz, hy, hx] = crop.half();
    let (rz, ry, rx) = crop.roi_size();
    let (z0, y0, x0) = (center.0 - hz, center.1 - hy, center.2 - hx);
    let patch = volume
        .data()
        .slice(s![.., z0..z0 + rz, y0..y0 + ry, x0..x0 + rx])
        .to_owned();
    Volume::new(patch, *volume.meta())
}

/// 用同一个中心裁剪 `sample` 中 `keys` 的所有体数据.
fn crop_all(sample: &mut Sample, keys: &[String], center: Idx3d, crop: &CropSpec) {
    for key in keys {
        if let Some(v) = sample.get(key) {
            let patch = extract_patch(v, center, crop);
            sample.insert(key.clone(), patch);
        }
    }
}

/// 截断高斯随机裁剪: 中心偏向体数据的几何中心.
#[derive(Debug, Clone)]
pub struct TruncatedGaussianRandomCrop {
    keys: KeySet,
    sampler: TruncatedGaussianCenter,
}

impl TruncatedGaussianRandomCrop {
    /// 创建变换, `sigma_ratio` 为标准差相对边长的比例.
    pub fn new(keys: KeySet, crop: CropSpec, sigma_ratio: f64) -> TransformResult<Self> {
        Ok(Self {
            keys,
            sampler: TruncatedGaussianCenter::new(crop, sigma_ratio)?,
        })
    }

    /// 中心采样器.
    #[inline]
    pub fn sampler(&self) -> &TruncatedGaussianCenter {
        &self.sampler
    }

    /// 对空间形状为 `shape` 的体数据采样一个中心.
    #[inline]
    pub fn sample_center<R: Rng + ?Sized>(&self, shape: Idx3d, rng: &mut R) -> TransformResult<Idx3d> {
        self.sampler.sample_center(shape, rng)
    }
}

impl MapTransform for TruncatedGaussianRandomCrop {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, rng: &mut RandomState) -> TransformResult<()> {
        let Some(shape) = self.keys.common_shape(sample)? else {
            return Ok(());
        };
        let center = self.sample_center(shape, rng)?;
        let present = self.keys.present(sample)?;
        crop_all(sample, &present, center, self.sampler.crop());
        Ok(())
    }
}

/// 均匀随机裁剪.
#[derive(Debug, Clone)]
pub struct RandSpatialCrop {
    keys: KeySet,
    sampler: UniformCenter,
}

impl RandSpatialCrop {
    /// 创建变换.
    pub fn new(keys: KeySet, crop: CropSpec) -> Self {
        Self {
            keys,
            sampler: UniformCenter::new(crop),
        }
    }

    /// 中心采样器.
    #[inline]
    pub fn sampler(&self) -> &UniformCenter {
        &self.sampler
    }
}

impl MapTransform for RandSpatialCrop {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, rng: &mut RandomState) -> TransformResult<()> {
        let Some(shape) = self.keys.common_shape(sample)? else {
            return Ok(());
        };
        let center = self.sampler.sample_center(shape, rng)?;
        let present = self.keys.present(sample)?;
        crop_all(sample, &present, center, self.sampler.crop());
        Ok(())
    }
}

/// 正样本偏置的随机裁剪.
///
/// 中心由 `positive_key` 对应的标注决定, 见 [`PositiveBiasedCenter`].
/// 即便允许缺失键, 标注本身也必须存在.
#[derive(Debug, Clone)]
pub struct PositiveBiasedRandomCrop {
    keys: KeySet,
    positive_key: String,
    sampler: PositiveBiasedCenter,
}

impl PositiveBiasedRandomCrop {
    /// 创建变换. `positive_probability` 必须位于 `[0, 1]`.
    pub fn new(
        keys: KeySet,
        positive_key: impl Into<String>,
        crop: CropSpec,
        positive_probability: f64,
    ) -> TransformResult<Self> {
        Ok(Self {
            keys,
            positive_key: positive_key.into(),
            sampler: PositiveBiasedCenter::new(crop, positive_probability)?,
        })
    }

    /// 中心采样器.
    #[inline]
    pub fn sampler(&self) -> &PositiveBiasedCenter {
        &self.sampler
    }

    /// 裁剪 `sample`, 并返回中心的来源.
    pub fn apply_traced(
        &self,
        sample: &mut Sample,
        rng: &mut RandomState,
    ) -> TransformResult<CenterSource> {
        let Some(mask) = sample.get(&self.positive_key) else {
            return Err(TransformError::MissingKeys(vec![self.positive_key.clone()]));
        };
        let shape = mask.shape();
        if let Some(expected) = self.keys.common_shape(sample)? {
            if expected != shape {
                return Err(TransformError::ShapeMismatch {
                    key: self.positive_key.clone(),
                    expected,
                    found: shape,
                });
            }
        }

        let (center, source) = self.sampler.sample_center(mask.data(), rng)?;
        let present = self.keys.present(sample)?;
        crop_all(sample, &present, center, self.sampler.crop());
        Ok(source)
    }
}

impl MapTransform for PositiveBiasedRandomCrop {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, rng: &mut RandomState) -> TransformResult<()> {
        self.apply_traced(sample, rng).map(|_| ())
    }
}
