//! 软腐蚀 / 软膨胀的池化实现.
//!
//! 数据按行优先顺序展平为一维切片. 池化时记录每个输出元素取自哪个输入元素
//! (源索引), 反向传播只需按源索引做 scatter-add.

use num::Float;

use super::SpatialDims;

/// 行优先布局下的形状与步长.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dims: SpatialDims,
}

impl Layout {
    pub(crate) fn new(shape: &[usize], dims: SpatialDims) -> Self {
        debug_assert_eq!(shape.len(), dims.rank());
        let mut strides = vec![1usize; shape.len()];
        for a in (0..shape.len().saturating_sub(1)).rev() {
            strides[a] = strides[a + 1] * shape[a + 1];
        }
        Self {
            shape: shape.to_vec(),
            strides,
            dims,
        }
    }

    #[inline]
    pub(crate) fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// 空间轴编号, 即除去前两个 (batch, channel) 轴之外的轴.
    #[inline]
    fn spatial_axes(&self) -> std::ops::Range<usize> {
        2..self.dims.rank()
    }

    /// 元素 `i` 沿轴 `a` 的前后邻居, 越界为 `None`.
    #[inline]
    fn neighbors(&self, i: usize, a: usize) -> (Option<usize>, Option<usize>) {
        let s = self.strides[a];
        let coord = (i / s) % self.shape[a];
        let prev = (coord > 0).then(|| i - s);
        let next = (coord + 1 < self.shape[a]).then(|| i + s);
        (prev, next)
    }
}

/// 池化结果: 输出值及其源索引.
#[derive(Clone, Debug)]
pub(crate) struct Pooled<F> {
    pub(crate) values: Vec<F>,
    pub(crate) src: Vec<usize>,
}

/// 软腐蚀: 沿每个空间轴做核长为 3 的最小池化, 再逐元素取最小.
///
/// 等价于在 "十字形" 邻域 (中心加上每个轴的前后邻居) 上取最小值.
/// 相等时保留先出现者: 中心, 然后按轴依次为前邻居、后邻居.
pub(crate) fn erode<F: Float>(x: &[F], layout: &Layout) -> Pooled<F> {
    let n = layout.len();
    debug_assert_eq!(x.len(), n);
    let mut values = Vec::with_capacity(n);
    let mut src = Vec::with_capacity(n);

    for i in 0..n {
        let (mut best, mut arg) = (x[i], i);
        for a in layout.spatial_axes() {
            let (prev, next) = layout.neighbors(i, a);
            for j in [prev, next].into_iter().flatten() {
                if x[j] < best {
                    best = x[j];
                    arg = j;
                }
            }
        }
        values.push(best);
        src.push(arg);
    }
    Pooled { values, src }
}

/// 软膨胀: 在空间轴上做 3×3(×3) 的最大池化, padding 不参与.
///
/// 按轴分离计算, 源索引逐轴复合.
pub(crate) fn dilate<F: Float>(x: &[F], layout: &Layout) -> Pooled<F> {
    let n = layout.len();
    debug_assert_eq!(x.len(), n);
    let mut values = x.to_vec();
    let mut src: Vec<usize> = (0..n).collect();

    for a in layout.spatial_axes() {
        let mut next_values = Vec::with_capacity(n);
        let mut next_src = Vec::with_capacity(n);
        for i in 0..n {
            let (mut best, mut arg) = (values[i], i);
            let (prev, next) = layout.neighbors(i, a);
            for j in [prev, next].into_iter().flatten() {
                if values[j] > best {
                    best = values[j];
                    arg = j;
                }
            }
            next_values.push(best);
            next_src.push(src[arg]);
        }
        values = next_values;
        src = next_src;
    }
    Pooled { values, src }
}

/// `grad_in[src[i]] += grad_out[i]`.
#[inline]
pub(crate) fn scatter_add<F: Float>(grad_out: &[F], src: &[usize], grad_in: &mut [F]) {
    for (g, &s) in grad_out.iter().zip(src) {
        grad_in[s] = grad_in[s] + *g;
    }
}
