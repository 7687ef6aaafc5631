//! 记录软骨架化的中间结果, 用于反向传播.

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use num::Float;

use super::pool::{dilate, erode, scatter_add, Layout};
use super::{SkelError, SkelResult};

/// 第 `k` 层: `x_{k+1} = erode(x_k)`, `o_k = dilate(x_{k+1})`, `delta_k = relu(x_k - o_k)`.
#[derive(Clone, Debug)]
struct Layer<F> {
    erode_src: Vec<usize>,
    dilate_src: Vec<usize>,
    /// `x_k - o_k > 0`.
    active: Vec<bool>,
    delta: Vec<F>,
}

/// 软骨架化的计算记录.
///
/// 由 [`SoftSkeletonize::forward_with_tape`](super::SoftSkeletonize::forward_with_tape) 生成.
#[derive(Clone, Debug)]
pub struct SkelTape<F> {
    layout: Layout,
    layers: Vec<Layer<F>>,
    /// `skel_0 .. skel_{n-1}`, 第 `j` 次更新前的骨架.
    skels: Vec<Vec<F>>,
}

impl<F: Float> SkelTape<F> {
    /// 前向计算并记录. 返回 `(骨架, 记录)`, 骨架按行优先展平.
    pub(crate) fn record(x: Vec<F>, layout: Layout, num_iter: usize) -> (Vec<F>, Self) {
        let zero = F::zero();
        let mut layers = Vec::with_capacity(num_iter + 1);
        let mut skels = Vec::with_capacity(num_iter);

        let mut x = x;
        let mut skel: Vec<F> = Vec::new();
        for k in 0..=num_iter {
            let e = erode(&x, &layout);
            let d = dilate(&e.values, &layout);
            let diff: Vec<F> = x.iter().zip(&d.values).map(|(a, b)| *a - *b).collect();
            let active: Vec<bool> = diff.iter().map(|v| *v > zero).collect();
            let delta: Vec<F> = diff.into_iter().map(|v| v.max(zero)).collect();

            if k == 0 {
                skel = delta.clone();
            } else {
                let next = skel
                    .iter()
                    .zip(&delta)
                    .map(|(&s, &d)| s + (d - s * d).max(zero))
                    .collect();
                skels.push(std::mem::replace(&mut skel, next));
            }

            layers.push(Layer {
                erode_src: e.src,
                dilate_src: d.src,
                active,
                delta,
            });
            x = e.values;
        }

        let tape = Self {
            layout,
            layers,
            skels,
        };
        (skel, tape)
    }

    /// 输入形状.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// 迭代次数.
    #[inline]
    pub fn num_iter(&self) -> usize {
        self.layers.len() - 1
    }

    /// 已知损失对骨架的梯度 `grad`, 求损失对输入的梯度.
    ///
    /// 腐蚀/膨胀的梯度只流向池化时取得极值的元素 (相等时取先出现者).
    pub fn backward(&self, grad: ArrayViewD<F>) -> SkelResult<ArrayD<F>> {
        if grad.shape() != self.layout.shape() {
            return Err(SkelError::ShapeMismatch {
                expected: self.layout.shape().to_vec(),
                found: grad.shape().to_vec(),
            });
        }
        let zero = F::zero();
        let one = F::one();
        let n = self.num_iter();
        let len = self.layout.len();

        // 先沿骨架累加链求出每个 delta_j 的梯度.
        let mut g_skel: Vec<F> = grad.iter().copied().collect();
        let mut g_delta: Vec<Vec<F>> = vec![Vec::new(); n + 1];
        for j in (1..=n).rev() {
            let s = &self.skels[j - 1];
            let d = &self.layers[j].delta;
            let mut gd = Vec::with_capacity(len);
            for i in 0..len {
                let m = d[i] - s[i] * d[i] > zero;
                if m {
                    gd.push(g_skel[i] * (one - s[i]));
                    g_skel[i] = g_skel[i] * (one - d[i]);
                } else {
                    gd.push(zero);
                }
            }
            g_delta[j] = gd;
        }
        g_delta[0] = g_skel;

        // g_o_k = -g_delta_k * [x_k > o_k]
        let g_open = |k: usize| -> Vec<F> {
            let layer = &self.layers[k];
            g_delta[k]
                .iter()
                .zip(&layer.active)
                .map(|(g, &a)| if a { -*g } else { zero })
                .collect()
        };

        // x_{n+1} 只经由 o_n 参与计算.
        let mut g_next = vec![zero; len];
        scatter_add(&g_open(n), &self.layers[n].dilate_src, &mut g_next);

        for k in (0..=n).rev() {
            let layer = &self.layers[k];
            let mut g = vec![zero; len];
            for i in 0..len {
                if layer.active[i] {
                    g[i] = g_delta[k][i];
                }
            }
            scatter_add(&g_next, &layer.erode_src, &mut g);
            if k > 0 {
                scatter_add(&g_open(k - 1), &self.layers[k - 1].dilate_src, &mut g);
            }
            g_next = g;
        }

        Ok(ArrayD::from_shape_vec(IxDyn(self.layout.shape()), g_next)?)
    }
}
