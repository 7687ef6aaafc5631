//! 空间大小调整: 对称 pad / 中心 crop, 以及插值缩放.
//!
//! 插值采用 "每轴抽头" 的形式: 每个输出坐标对应输入坐标上的两个相邻索引和一个权重,
//! 三个轴的抽头组合起来即得到三线性插值. 最近邻插值就是权重为 0 的退化情形.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ndarray::{Array4, ArrayView4};

use super::{KeySet, MapTransform, RandomState, TransformError, TransformResult};
use crate::{Idx3d, Sample};

/// 插值方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InterpMode {
    /// 三线性插值, 用于扫描.
    #[default]
    Trilinear,

    /// 最近邻插值, 用于标注.
    Nearest,
}

/// pad 时的填充方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PadMode {
    /// 复制边缘体素.
    #[default]
    Edge,

    /// 填充 0.
    Constant,
}

/// 单轴抽头: `(低索引, 高索引, 高索引权重)`.
pub(crate) type Tap = (usize, usize, f32);

/// 已知连续的源坐标 `src` (已限制在 `[0, n - 1]` 内), 生成抽头.
#[inline]
pub(crate) fn tap_at(src: f64, n: usize, mode: InterpMode) -> Tap {
    debug_assert!(n > 0);
    let last = n - 1;
    match mode {
        InterpMode::Nearest => {
            let i = (src.round() as usize).min(last);
            (i, i, 0.0)
        }
        InterpMode::Trilinear => {
            let i0 = (src.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            (i0, i1, (src - i0 as f64) as f32)
        }
    }
}

/// 以 "半像素对齐" (align_corners = false) 方式为缩放生成单轴抽头.
fn resize_taps(n_in: usize, n_out: usize, mode: InterpMode) -> Vec<Tap> {
    let scale = n_in as f64 / n_out as f64;
    (0..n_out)
        .map(|o| match mode {
            InterpMode::Nearest => {
                let i = ((o as f64 * scale).floor() as usize).min(n_in - 1);
                (i, i, 0.0)
            }
            InterpMode::Trilinear => {
                let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
                tap_at(src, n_in, mode)
            }
        })
        .collect()
}

/// 按三个轴的抽头对每个通道插值.
pub(crate) fn apply_taps(data: ArrayView4<f32>, [tz, ty, tx]: [&[Tap]; 3]) -> Array4<f32> {
    let c = data.dim().0;
    Array4::from_shape_fn((c, tz.len(), ty.len(), tx.len()), |(c, z, y, x)| {
        let (z0, z1, wz) = tz[z];
        let (y0, y1, wy) = ty[y];
        let (x0, x1, wx) = tx[x];

        let lerp = |a: f32, b: f32, w: f32| a + (b - a) * w;
        let at = |z: usize, y: usize, x: usize| data[(c, z, y, x)];

        let c00 = lerp(at(z0, y0, x0), at(z0, y0, x1), wx);
        let c01 = lerp(at(z0, y1, x0), at(z0, y1, x1), wx);
        let c10 = lerp(at(z1, y0, x0), at(z1, y0, x1), wx);
        let c11 = lerp(at(z1, y1, x0), at(z1, y1, x1), wx);
        lerp(lerp(c00, c01, wy), lerp(c10, c11, wy), wz)
    })
}

/// 将 `data` 的空间形状插值缩放到 `size`.
pub fn resize(data: ArrayView4<f32>, size: Idx3d, mode: InterpMode) -> Array4<f32> {
    let (_, z, y, x) = data.dim();
    let tz = resize_taps(z, size.0, mode);
    let ty = resize_taps(y, size.1, mode);
    let tx = resize_taps(x, size.2, mode);
    apply_taps(data, [&tz, &ty, &tx])
}

/// 单轴上每个输出位置对应的输入位置. `None` 表示常数填充.
fn pad_or_crop_map(n: usize, target: usize, mode: PadMode) -> Vec<Option<usize>> {
    if target >= n {
        let before = (target - n) / 2;
        (0..target)
            .map(|o| {
                let src = o as isize - before as isize;
                match mode {
                    PadMode::Edge => Some(src.clamp(0, n as isize - 1) as usize),
                    PadMode::Constant => (0..n as isize).contains(&src).then_some(src as usize),
                }
            })
            .collect()
    } else {
        let start = n / 2 - target / 2;
        (start..start + target).map(Some).collect()
    }
}

/// 每个空间轴独立地对称 pad 或居中 crop 到 `size`.
pub fn pad_or_crop(data: ArrayView4<f32>, size: Idx3d, mode: PadMode) -> Array4<f32> {
    let (c, z, y, x) = data.dim();
    let mz = pad_or_crop_map(z, size.0, mode);
    let my = pad_or_crop_map(y, size.1, mode);
    let mx = pad_or_crop_map(x, size.2, mode);

    Array4::from_shape_fn((c, size.0, size.1, size.2), |(c, z, y, x)| {
        match (mz[z], my[y], mx[x]) {
            (Some(z), Some(y), Some(x)) => data[(c, z, y, x)],
            _ => 0.0,
        }
    })
}

#[inline]
fn check_size((z, y, x): Idx3d) -> TransformResult<()> {
    if z == 0 || y == 0 || x == 0 {
        return Err(TransformError::InvalidArgument("spatial size must be positive"));
    }
    Ok(())
}

/// 对称 pad 或居中 crop 到固定空间大小, 不改变体素长宽比.
#[derive(Debug, Clone)]
pub struct ResizeWithPadOrCrop {
    keys: KeySet,
    spatial_size: Idx3d,
    mode: PadMode,
}

impl ResizeWithPadOrCrop {
    /// 创建变换. `spatial_size` 任一分量为 0 时返回 `Err`.
    pub fn new(keys: KeySet, spatial_size: Idx3d, mode: PadMode) -> TransformResult<Self> {
        check_size(spatial_size)?;
        Ok(Self {
            keys,
            spatial_size,
            mode,
        })
    }
}

impl MapTransform for ResizeWithPadOrCrop {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, _: &mut RandomState) -> TransformResult<()> {
        for key in self.keys.present(sample)? {
            if let Some(v) = sample.remove(&key) {
                let data = pad_or_crop(v.data(), self.spatial_size, self.mode);
                sample.insert(key, v.with_data(data));
            }
        }
        Ok(())
    }
}

/// 插值缩放到固定空间大小. 会改变体素长宽比.
#[derive(Debug, Clone)]
pub struct Resize {
    keys: KeySet,
    spatial_size: Idx3d,
    modes: Vec<InterpMode>,
}

impl Resize {
    /// 创建变换. `modes` 与 `keys` 一一对应; 只给一个时对所有键生效.
    pub fn new(keys: KeySet, spatial_size: Idx3d, modes: &[InterpMode]) -> TransformResult<Self> {
        check_size(spatial_size)?;
        check_modes(&keys, modes)?;
        Ok(Self {
            keys,
            spatial_size,
            modes: modes.to_vec(),
        })
    }
}

/// `modes` 必须只有一个元素, 或与键一样多.
pub(crate) fn check_modes(keys: &KeySet, modes: &[InterpMode]) -> TransformResult<()> {
    if modes.len() == 1 || modes.len() == keys.keys().len() {
        Ok(())
    } else {
        Err(TransformError::InvalidArgument(
            "interpolation modes must match keys",
        ))
    }
}

/// 键 `key` 的插值方式.
#[inline]
pub(crate) fn mode_of(keys: &KeySet, modes: &[InterpMode], key: &str) -> InterpMode {
    if modes.len() == 1 {
        return modes[0];
    }
    keys.keys()
        .iter()
        .position(|k| k == key)
        .and_then(|i| modes.get(i).copied())
        .unwrap_or_default()
}

impl MapTransform for Resize {
    fn keys(&self) -> &KeySet {
        &self.keys
    }

    fn apply(&self, sample: &mut Sample, _: &mut RandomState) -> TransformResult<()> {
        for key in self.keys.present(sample)? {
            let mode = mode_of(&self.keys, &self.modes, &key);
            if let Some(mut v) = sample.remove(&key) {
                let (z, y, x) = v.shape();
                let (tz, ty, tx) = self.spatial_size;
                let data = resize(v.data(), self.spatial_size, mode);

                // 缩放后体素的物理尺寸随之变化.
                let [pz, py, px] = v.pix_dim();
                v.meta_mut().pix_dim = [
                    pz * z as f64 / tz as f64,
                    py * y as f64 / ty as f64,
                    px * x as f64 / tx as f64,
                ];
                sample.insert(key, v.with_data(data));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        let mut i = 0.0;
        Array4::from_shape_simple_fn(shape, || {
            i += 1.0;
            i
        })
    }

    #[test]
    fn test_pad_edge_and_constant() {
        let data = ramp((1, 1, 1, 3)); // [1, 2, 3]
        let edge = pad_or_crop(data.view(), (1, 1, 6), PadMode::Edge);
        assert_eq!(edge.iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);

        let constant = pad_or_crop(data.view(), (1, 1, 6), PadMode::Constant);
        assert_eq!(
            constant.iter().copied().collect::<Vec<_>>(),
            vec![0.0, 1.0, 2.0, 3.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_center_crop() {
        let data = ramp((1, 1, 1, 6)); // [1..=6]
        let out = pad_or_crop(data.view(), (1, 1, 3), PadMode::Edge);
        // start = 6 / 2 - 3 / 2 = 2
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_pad_or_crop_mixed_axes_shape() {
        let data = ramp((2, 5, 3, 8));
        let out = pad_or_crop(data.view(), (4, 6, 8), PadMode::Edge);
        assert_eq!(out.dim(), (2, 4, 6, 8));
        // x 轴不变.
        assert_eq!(out[(1, 0, 1, 7)], data[(1, 0, 0, 7)]);
    }

    #[test]
    fn test_resize_identity_and_nearest() {
        let data = ramp((1, 2, 3, 4));
        let same = resize(data.view(), (2, 3, 4), InterpMode::Trilinear);
        assert_eq!(same, data);

        // 最近邻放大两倍: 每个值重复两次.
        let row = ramp((1, 1, 1, 3));
        let up = resize(row.view(), (1, 1, 6), InterpMode::Nearest);
        assert_eq!(up.iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_resize_linear_midpoints() {
        let row = ramp((1, 1, 1, 2)); // [1, 2]
        let up = resize(row.view(), (1, 1, 4), InterpMode::Trilinear);
        let got: Vec<f32> = up.iter().copied().collect();
        // src = (o + 0.5) / 2 - 0.5 = [-0.25 -> 0, 0.25, 0.75, 1.25 -> clamp]
        let expected = [1.0, 1.25, 1.75, 2.0];
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-6, "{got:?}");
        }
    }
}
