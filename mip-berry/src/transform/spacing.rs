//! 体素分辨率重采样.

use ndarray::{Array4, ArrayView4};

use super::resize::{apply_taps, check_modes, mode_of, tap_at, InterpMode, Tap};
use super::{KeySet, MapTransform, RandomState, TransformError, TransformResult};
use crate::Sample;

/// 单轴重采样后的长度. 两端体素中心在物理空间中的距离保持不变.
#[inline]
fn resampled_len(n: usize, from_mm: f64, to_mm: f64) -> usize {
    let extent = (n.saturating_sub(1)) as f64 * from_mm / to_mm;
    extent.round() as usize + 1
}

/// 单轴重采样抽头. 超出边界的位置取边缘值.
fn spacing_taps(n: usize, from_mm: f64, to_mm: f64, mode: InterpMode) -> Vec<Tap> {
    let last = (n - 1) as f64;
    (0..resampled_len(n, from_mm, to_mm))
        .map(|o| {
            let src = (o as f64 * to_mm / from_mm).clamp(0.0, last);
            tap_at(src, n, mode)
        })
        .collect()
}

/// 将 `data` 从 `from` 分辨率重采样到 `to` 分辨率.
pub fn resample(
    data: ArrayView4<f32>,
    from: [f64; 3],
    to: [f64; 3],
    mode: InterpMode,
) -> Array4<f32> {
    let (_, z, y, x) = data.dim();
    let tz = spacing_taps(z, from[0], to[0], mode);
    let ty = spacing_taps(y, from[1], to[1], mode);
    let tx = spacing_taps(x, from[2], to[2], mode);
    apply_taps(data, [&tz, &ty, &tx])
}

/// 将体数据重采样到统一的体素分辨率 (单位: 毫米, `(z, y, x)` 顺序).
#[derive(Debug, Clone)]
pub struct Spacing {
    keys: KeySet,
    pix_dim: [f64; 3],
    modes: Vec<InterpMode>,
}

impl Spacing {
    /// 创建变换. `pix_dim` 必须全为正的有限值.
    /// `modes` 与 `keys` 一一对应; 只给一个时对所有键生效.
    pub fn new(keys: KeySet, pix_dim: [f64; 3], modes: &[InterpMode]) -> TransformResult<Self> {
        if !pix_dim.iter().all(|d| d.is_finite() && *d > 0.0) {
            return Err(TransformError::InvalidArgument(
                "pix_dim must be positive and finite",
            ));
        }
        check_modes(&keys, modes)?;
        Ok(Self {
            keys,
            pix_dim,
            modes: modes.to_vec(),
        })
    }
}

impl MapTransform for Spacing {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, _: &mut RandomState) -> TransformResult<()> {
        for key in self.keys.present(sample)? {
            let mode = mode_of(&self.keys, &self.modes, &key);
            if let Some(mut v) = sample.remove(&key) {
                let data = resample(v.data(), v.pix_dim(), self.pix_dim, mode);
                v.meta_mut().pix_dim = self.pix_dim;
                sample.insert(key, v.with_data(data));
            }
        }
        Ok(())
    }
}
