//! 软骨架化 (soft skeletonization).
//!
//! 用可微的形态学操作 (最小/最大池化) 近似细化, 从概率图中提取 "软" 中心线.
//! 输入为 `(batch, channel, h, w)` 或 `(batch, channel, d, h, w)` 的数组,
//! 池化只在空间轴上进行.
//!
//! # 算法
//!
//! ```text
//! skel = relu(x - open(x))
//! 重复 num_iter 次:
//!     x     = erode(x)
//!     delta = relu(x - open(x))
//!     skel  = skel + relu(delta - skel * delta)
//! ```
//!
//! 其中 `open(x) = dilate(erode(x))`.

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use num::Float;
use thiserror::Error;

mod pool;
mod tape;

use pool::{dilate, erode, Layout};
pub use tape::SkelTape;

/// 软骨架化默认迭代次数.
pub const DEFAULT_SKEL_ITER: usize = 40;

/// 软骨架化错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkelError {
    /// 输入维数既不是 4 也不是 5.
    #[error("unsupported input rank {0}, expected 4 (b, c, h, w) or 5 (b, c, d, h, w)")]
    UnsupportedRank(usize),

    /// 梯度形状与前向输入不一致.
    #[error("gradient shape {found:?} differs from input shape {expected:?}")]
    ShapeMismatch {
        /// 前向输入形状.
        expected: Vec<usize>,
        /// 实际形状.
        found: Vec<usize>,
    },

    /// 数组构造失败.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// 软骨架化结果.
pub type SkelResult<T> = Result<T, SkelError>;

/// 空间维数.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SpatialDims {
    /// 2D: `(b, c, h, w)`.
    Planar,

    /// 3D: `(b, c, d, h, w)`.
    Volumetric,
}

impl SpatialDims {
    /// 由数组维数判断.
    pub fn from_rank(rank: usize) -> SkelResult<Self> {
        match rank {
            4 => Ok(Self::Planar),
            5 => Ok(Self::Volumetric),
            n => Err(SkelError::UnsupportedRank(n)),
        }
    }

    /// 数组维数.
    #[inline]
    pub const fn rank(self) -> usize {
        match self {
            Self::Planar => 4,
            Self::Volumetric => 5,
        }
    }

    /// 空间轴个数.
    #[inline]
    pub const fn spatial(self) -> usize {
        self.rank() - 2
    }
}

/// 展平为行优先的一维数据.
fn flatten<F: Float>(x: &ArrayViewD<F>) -> SkelResult<(Vec<F>, Layout)> {
    let dims = SpatialDims::from_rank(x.ndim())?;
    let layout = Layout::new(x.shape(), dims);
    Ok((x.iter().copied().collect(), layout))
}

#[inline]
fn reshape<F: Float>(values: Vec<F>, layout: &Layout) -> SkelResult<ArrayD<F>> {
    Ok(ArrayD::from_shape_vec(IxDyn(layout.shape()), values)?)
}

/// 软腐蚀: 每个空间轴上核长为 3 的最小池化, 再逐元素取最小.
pub fn soft_erode<F: Float>(x: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
    let (v, layout) = flatten(&x)?;
    reshape(erode(&v, &layout).values, &layout)
}

/// 软膨胀: 空间轴上各向同性的 3×3(×3) 最大池化.
pub fn soft_dilate<F: Float>(x: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
    let (v, layout) = flatten(&x)?;
    reshape(dilate(&v, &layout).values, &layout)
}

/// 软开运算 `dilate(erode(x))`.
pub fn soft_open<F: Float>(x: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
    let (v, layout) = flatten(&x)?;
    let e = erode(&v, &layout).values;
    reshape(dilate(&e, &layout).values, &layout)
}

/// 软骨架化.
///
/// 迭代次数越多, 能细化的结构越粗. 骨架逐元素非负.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SoftSkeletonize {
    num_iter: usize,
}

impl Default for SoftSkeletonize {
    fn default() -> Self {
        Self::new(DEFAULT_SKEL_ITER)
    }
}

impl SoftSkeletonize {
    /// 以 `num_iter` 次迭代创建.
    #[inline]
    pub const fn new(num_iter: usize) -> Self {
        Self { num_iter }
    }

    /// 迭代次数.
    #[inline]
    pub const fn num_iter(&self) -> usize {
        self.num_iter
    }

    /// 计算 `x` 的软骨架.
    pub fn soft_skel<F: Float>(&self, x: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
        let (mut v, layout) = flatten(&x)?;
        let zero = F::zero();

        let open = |v: &[F]| dilate(&erode(v, &layout).values, &layout).values;
        let relu_diff = |a: &[F], b: &[F]| -> Vec<F> {
            a.iter().zip(b).map(|(a, b)| (*a - *b).max(zero)).collect()
        };

        let mut skel = relu_diff(&v, &open(&v));
        for _ in 0..self.num_iter {
            v = erode(&v, &layout).values;
            let delta = relu_diff(&v, &open(&v));
            for (s, d) in skel.iter_mut().zip(delta) {
                *s = *s + (d - *s * d).max(zero);
            }
        }
        reshape(skel, &layout)
    }

    /// 同 [`soft_skel`](Self::soft_skel).
    #[inline]
    pub fn forward<F: Float>(&self, x: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
        self.soft_skel(x)
    }

    /// 计算软骨架, 同时记录中间结果以便反向传播.
    pub fn forward_with_tape<F: Float>(
        &self,
        x: ArrayViewD<F>,
    ) -> SkelResult<(ArrayD<F>, SkelTape<F>)> {
        let (v, layout) = flatten(&x)?;
        let (skel, tape) = SkelTape::record(v, layout.clone(), self.num_iter);
        Ok((reshape(skel, &layout)?, tape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array4, Array5};

    /// 中间一条粗 "血管": 在 h 方向上宽 3, 贯穿整个 w 方向.
    fn tube_2d() -> Array4<f64> {
        Array4::from_shape_fn((1, 1, 9, 12), |(_, _, h, _)| if (3..6).contains(&h) { 1.0 } else { 0.0 })
    }

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rank_dispatch() {
        assert_eq!(SpatialDims::from_rank(4), Ok(SpatialDims::Planar));
        assert_eq!(SpatialDims::from_rank(5), Ok(SpatialDims::Volumetric));
        assert_eq!(SpatialDims::Volumetric.spatial(), 3);

        let x = Array::<f32, _>::zeros(IxDyn(&[2, 3, 4]));
        let skel = SoftSkeletonize::default();
        assert_eq!(skel.soft_skel(x.view()), Err(SkelError::UnsupportedRank(3)));
        assert_eq!(soft_erode(x.view()), Err(SkelError::UnsupportedRank(3)));
    }

    #[test]
    fn test_zeros_stay_zeros() {
        let skel = SoftSkeletonize::new(10);
        let x = Array5::<f32>::zeros((1, 2, 4, 5, 6)).into_dyn();
        let out = skel.soft_skel(x.view()).unwrap();
        assert_eq!(out.shape(), x.shape());
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_erode_dilate_open() {
        let x = tube_2d().into_dyn();
        let e = soft_erode(x.view()).unwrap();
        // 宽 3 的带子腐蚀后只剩中间一行.
        assert!((0..12).all(|w| e[[0, 0, 4, w]] == 1.0));
        assert!((0..12).all(|w| e[[0, 0, 3, w]] == 0.0 && e[[0, 0, 5, w]] == 0.0));

        let d = soft_dilate(e.view()).unwrap();
        assert_eq!(d, soft_open(x.view()).unwrap());
        // 开运算恢复了整条带子.
        assert_eq!(d, x);
    }

    #[test]
    fn test_skeleton_of_tube_is_centerline() {
        let x = tube_2d().into_dyn();
        let skel = SoftSkeletonize::new(5).soft_skel(x.view()).unwrap();
        assert!(skel.iter().all(|v| *v >= 0.0));
        for w in 0..12 {
            assert!(float_eq(skel[[0, 0, 4, w]], 1.0), "w = {w}");
            assert!(float_eq(skel[[0, 0, 3, w]], 0.0));
        }
    }

    #[test]
    fn test_skeleton_nonnegative_3d() {
        let mut seed = 7u64;
        let x = Array5::from_shape_simple_fn((1, 1, 5, 6, 7), || {
            // 线性同余, 足够当作测试噪声.
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 11) as f64 / (1u64 << 53) as f64
        })
        .into_dyn();
        let skel = SoftSkeletonize::new(3).soft_skel(x.view()).unwrap();
        assert!(skel.iter().all(|v| *v >= 0.0 && v.is_finite()));

        let (taped, _) = SoftSkeletonize::new(3).forward_with_tape(x.view()).unwrap();
        assert_eq!(taped, skel);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        // 取值两两不同, 池化不会在不同源之间打平.
        let x = Array4::from_shape_fn((1, 1, 5, 5), |(_, _, h, w)| {
            0.1 + 0.8 * ((h * 5 + w) * 7 % 25) as f64 / 25.0
        })
        .into_dyn();
        let skel = SoftSkeletonize::new(2);
        // 随便取一个线性泛函作为 "损失".
        let weights = Array4::from_shape_fn((1, 1, 5, 5), |(_, _, h, w)| 1.0 + (h + 2 * w) as f64 * 0.1)
            .into_dyn();

        let loss = |x: &ArrayD<f64>| (skel.soft_skel(x.view()).unwrap() * &weights).sum();
        let (_, tape) = skel.forward_with_tape(x.view()).unwrap();
        let grad = tape.backward(weights.view()).unwrap();

        let eps = 1e-6;
        for idx in [[0, 0, 2, 2], [0, 0, 0, 1], [0, 0, 3, 4], [0, 0, 4, 0]] {
            let mut xp = x.clone();
            xp[idx] += eps;
            let mut xm = x.clone();
            xm[idx] -= eps;
            let fd = (loss(&xp) - loss(&xm)) / (2.0 * eps);
            assert!((fd - grad[idx]).abs() < 1e-4, "{idx:?}: {fd} vs {}", grad[idx]);
        }
    }

    #[test]
    fn test_backward_rejects_bad_shape() {
        let x = Array4::<f64>::zeros((1, 1, 3, 3)).into_dyn();
        let (_, tape) = SoftSkeletonize::new(1).forward_with_tape(x.view()).unwrap();
        let g = Array4::<f64>::zeros((1, 1, 3, 4)).into_dyn();
        assert!(matches!(tape.backward(g.view()), Err(SkelError::ShapeMismatch { .. })));
    }
}
