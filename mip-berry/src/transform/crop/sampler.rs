//! Patch 中心采样器.
//!
//! 三种采样器都只返回 **合法** 中心: 以该中心提取的 patch 完全落在体数据内.
//! 合法中心的范围见 [`CropSpec::center_bounds`].

use std::f64::consts::TAU;

use ndarray::{s, ArrayView4, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use super::CropSpec;
use crate::transform::{TransformError, TransformResult};
use crate::Idx3d;

/// 从截断到 `[lower, upper]` 的正态分布 N(`mean`, `std`²) 中采样.
///
/// 采样是精确的 (拒绝采样, 无近似):
///
/// 1. 区间包含均值且足够宽时, 直接用正态分布作为提议分布;
/// 2. 区间包含均值但较窄时, 用均匀分布作为提议分布;
/// 3. 区间完全位于均值一侧时, 用平移指数分布作为提议分布 (Robert, 1995).
///
/// 若 `std` 不是正数, 或者区间退化, 则返回被限制在区间内的 `mean`.
pub fn truncated_normal<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    std: f64,
    lower: f64,
    upper: f64,
) -> f64 {
    if !(std > 0.0) || !(lower < upper) {
        return mean.clamp(lower.min(upper), upper.max(lower));
    }
    let (a, b) = ((lower - mean) / std, (upper - mean) / std);
    let z = if b < 0.0 {
        // 关于均值对称.
        -standard_tail(rng, -b, -a)
    } else if a > 0.0 {
        standard_tail(rng, a, b)
    } else if b - a >= TAU.sqrt() {
        loop {
            let z: f64 = rng.sample(StandardNormal);
            if (a..=b).contains(&z) {
                break z;
            }
        }
    } else {
        loop {
            let z = rng.gen_range(a..=b);
            if rng.gen::<f64>() <= (-0.5 * z * z).exp() {
                break z;
            }
        }
    };
    (mean + std * z).clamp(lower, upper)
}

/// 标准正态分布截断到 `[a, b]`, 其中 `0 < a < b`.
fn standard_tail<R: Rng + ?Sized>(rng: &mut R, a: f64, b: f64) -> f64 {
    debug_assert!(0.0 < a && a < b);
    // 区间很窄时, 均匀提议分布的接受率更高.
    if b - a < 1.0 / a.max(1.0) {
        return loop {
            let z = rng.gen_range(a..=b);
            if rng.gen::<f64>() <= (0.5 * (a * a - z * z)).exp() {
                break z;
            }
        };
    }
    let alpha = 0.5 * (a + (a * a + 4.0).sqrt());
    loop {
        // `1 - U` 落在 (0, 1], 对数有限.
        let z = a - (1.0 - rng.gen::<f64>()).ln() / alpha;
        if z <= b && rng.gen::<f64>() <= (-0.5 * (z - alpha).powi(2)).exp() {
            break z;
        }
    }
}

/// 以体数据中心为均值的截断高斯中心采样器.
///
/// 每个空间轴独立地从 N(`shape / 2`, (`shape * sigma_ratio`)²) 中采样,
/// 截断到 `[roi / 2, shape - roi / 2]`, 然后向下取整.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedGaussianCenter {
    crop: CropSpec,
    sigma_ratio: f64,
}

impl TruncatedGaussianCenter {
    /// 创建采样器. `sigma_ratio` 必须为非负有限值.
    pub fn new(crop: CropSpec, sigma_ratio: f64) -> TransformResult<Self> {
        if !(sigma_ratio.is_finite() && sigma_ratio >= 0.0) {
            return Err(TransformError::InvalidArgument(
                "sigma_ratio must be finite and non-negative",
            ));
        }
        Ok(Self { crop, sigma_ratio })
    }

    /// 裁剪参数.
    #[inline]
    pub fn crop(&self) -> &CropSpec {
        &self.crop
    }

    /// 标准差相对边长的比例.
    #[inline]
    pub fn sigma_ratio(&self) -> f64 {
        self.sigma_ratio
    }

    /// 对空间形状为 `shape` 的体数据采样一个 patch 中心.
    pub fn sample_center<R: Rng + ?Sized>(&self, shape: Idx3d, rng: &mut R) -> TransformResult<Idx3d> {
        let bounds = self.crop.center_bounds(shape)?;
        let half = self.crop.half();
        let shape = [shape.0, shape.1, shape.2];

        let mut center = [0usize; 3];
        for i in 0..3 {
            let n = shape[i] as f64;
            let x = truncated_normal(
                rng,
                (shape[i] / 2) as f64,
                n * self.sigma_ratio,
                half[i] as f64,
                (shape[i] - half[i]) as f64,
            );
            let (lo, hi) = bounds[i];
            center[i] = (x.floor() as usize).clamp(lo, hi);
        }
        Ok((center[0], center[1], center[2]))
    }
}

/// 均匀随机中心采样器.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformCenter {
    crop: CropSpec,
}

impl UniformCenter {
    /// 创建采样器.
    #[inline]
    pub fn new(crop: CropSpec) -> Self {
        Self { crop }
    }

    /// 裁剪参数.
    #[inline]
    pub fn crop(&self) -> &CropSpec {
        &self.crop
    }

    /// 在所有合法中心中均匀采样一个.
    pub fn sample_center<R: Rng + ?Sized>(&self, shape: Idx3d, rng: &mut R) -> TransformResult<Idx3d> {
        let [(z0, z1), (y0, y1), (x0, x1)] = self.crop.center_bounds(shape)?;
        Ok((
            rng.gen_range(z0..=z1),
            rng.gen_range(y0..=y1),
            rng.gen_range(x0..=x1),
        ))
    }
}

/// 采样得到的中心来自哪一个分支.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CenterSource {
    /// 在合法正体素中均匀选取.
    Positive,

    /// 按概率选择了均匀随机分支.
    Uniform,

    /// 本应以正体素为中心, 但合法区域内没有正体素, 退化为均匀随机.
    Fallback,
}

/// 正样本偏置的中心采样器.
///
/// 以 `positive_probability` 的概率在 "合法正体素" (标注任一通道 > 0,
/// 且位于合法中心范围内) 中均匀选取中心, 否则均匀随机选取合法中心.
/// 若不存在合法正体素, 则退化为均匀随机.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositiveBiasedCenter {
    uniform: UniformCenter,
    positive_probability: f64,
}

impl PositiveBiasedCenter {
    /// 创建采样器. `positive_probability` 必须位于 `[0, 1]`.
    pub fn new(crop: CropSpec, positive_probability: f64) -> TransformResult<Self> {
        if !(0.0..=1.0).contains(&positive_probability) {
            return Err(TransformError::InvalidArgument(
                "positive_probability must lie in [0, 1]",
            ));
        }
        Ok(Self {
            uniform: UniformCenter::new(crop),
            positive_probability,
        })
    }

    /// 裁剪参数.
    #[inline]
    pub fn crop(&self) -> &CropSpec {
        self.uniform.crop()
    }

    /// 以正体素为中心的概率.
    #[inline]
    pub fn positive_probability(&self) -> f64 {
        self.positive_probability
    }

    /// 根据标注 `mask` (`(channel, z, y, x)`) 采样一个中心, 并给出其来源.
    ///
    /// 先抽取一个 `[0, 1)` 均匀数决定分支, 之后的随机数全部来自同一 `rng`,
    /// 因此相同种子下结果完全可复现.
    pub fn sample_center<R: Rng + ?Sized>(
        &self,
        mask: ArrayView4<f32>,
        rng: &mut R,
    ) -> TransformResult<(Idx3d, CenterSource)> {
        if rng.gen::<f64>() < self.positive_probability {
            self.sample_center_positive(mask, rng)
        } else {
            let (_, z, y, x) = mask.dim();
            let center = self.uniform.sample_center((z, y, x), rng)?;
            Ok((center, CenterSource::Uniform))
        }
    }

    /// 在合法正体素中均匀选取中心. 若不存在合法正体素, 则退化为均匀随机.
    pub fn sample_center_positive<R: Rng + ?Sized>(
        &self,
        mask: ArrayView4<f32>,
        rng: &mut R,
    ) -> TransformResult<(Idx3d, CenterSource)> {
        let (_, z, y, x) = mask.dim();
        let [(z0, z1), (y0, y1), (x0, x1)] = self.crop().center_bounds((z, y, x))?;

        let valid = mask
            .slice(s![.., z0..=z1, y0..=y1, x0..=x1])
            .map_axis(Axis(0), |v| v.iter().any(|p| *p > 0.0));
        let count = valid.iter().filter(|b| **b).count();

        if count == 0 {
            log::debug!("no positive voxel inside the valid center box, sampling uniformly");
            let center = self.uniform.sample_center((z, y, x), rng)?;
            return Ok((center, CenterSource::Fallback));
        }

        let k = rng.gen_range(0..count);
        // `k < count`, 必然能找到.
        let (dz, dy, dx) = valid
            .indexed_iter()
            .filter(|(_, b)| **b)
            .nth(k)
            .map(|(idx, _)| idx)
            .unwrap_or_default();
        Ok(((z0 + dz, y0 + dy, x0 + dx), CenterSource::Positive))
    }

    /// 统计合法正体素个数.
    pub fn count_valid_positive(&self, mask: ArrayView4<f32>) -> TransformResult<usize> {
        let (_, z, y, x) = mask.dim();
        let [(z0, z1), (y0, y1), (x0, x1)] = self.crop().center_bounds((z, y, x))?;
        Ok(mask
            .slice(s![.., z0..=z1, y0..=y1, x0..=x1])
            .map_axis(Axis(0), |v| v.iter().any(|p| *p > 0.0))
            .iter()
            .filter(|b| **b)
            .count())
    }
}
