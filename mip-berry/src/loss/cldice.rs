//! clDice: 拓扑感知的中心线 Dice 损失.
//!
//! 参见 Shit et al., "clDice - a Novel Topology-Preserving Loss Function for
//! Tubular Structure Segmentation", CVPR 2021.

use ndarray::{ArrayD, ArrayViewD};
use num::Float;

use super::{
    check_inputs, drop_background, lit, restore_background, sigmoid, Loss, LossResult,
};
use crate::skel::SoftSkeletonize;

/// 损失内部使用的软骨架化迭代次数.
const LOSS_SKEL_ITER: usize = 10;

/// soft-Dice 损失 `1 - (2 Σ(t·p) + 1) / (Σt + Σp + 1)`. 对整个数组求和.
pub fn soft_dice<F: Float>(y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>) -> F {
    let one = F::one();
    let two = one + one;
    let inter = (&y_true * &y_pred).sum();
    one - (two * inter + one) / (y_true.sum() + y_pred.sum() + one)
}

/// 同 [`soft_dice`], 并给出对 `y_pred` 的梯度.
pub fn soft_dice_with_grad<F: Float>(y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>) -> (F, ArrayD<F>) {
    let one = F::one();
    let two = one + one;
    let num = two * (&y_true * &y_pred).sum() + one;
    let den = y_true.sum() + y_pred.sum() + one;
    // d(1 - num / den) / dp_i = (num - 2 t_i den) / den²
    let grad = y_true.mapv(|t| (num - two * t * den) / (den * den));
    (one - num / den, grad)
}

/// `(tprec, tsens)` 合成 clDice.
#[inline]
fn cl_dice_of<F: Float>(tprec: F, tsens: F) -> F {
    let one = F::one();
    one - (one + one) * tprec * tsens / (tprec + tsens)
}

/// 以 `p` 为预测 (概率) 计算 clDice. 不记录反向传播所需的中间结果.
fn cl_dice<F: Float>(
    skel: &SoftSkeletonize,
    smooth: F,
    t: ArrayViewD<F>,
    p: ArrayViewD<F>,
) -> LossResult<F> {
    let skel_p = skel.soft_skel(p.view())?;
    let skel_t = skel.soft_skel(t.view())?;
    let tprec = ((&skel_p * &t).sum() + smooth) / (skel_p.sum() + smooth);
    let tsens = ((&skel_t * &p).sum() + smooth) / (skel_t.sum() + smooth);
    Ok(cl_dice_of(tprec, tsens))
}

/// 同 [`cl_dice`], 并给出对 `p` 的梯度.
fn cl_dice_with_grad<F: Float>(
    skel: &SoftSkeletonize,
    smooth: F,
    t: ArrayViewD<F>,
    p: ArrayViewD<F>,
) -> LossResult<(F, ArrayD<F>)> {
    let two = F::one() + F::one();

    let (skel_p, tape) = skel.forward_with_tape(p.view())?;
    let skel_t = skel.soft_skel(t.view())?;

    let sum_skel_p = skel_p.sum() + smooth;
    let sum_skel_t = skel_t.sum() + smooth;
    let tprec = ((&skel_p * &t).sum() + smooth) / sum_skel_p;
    let tsens = ((&skel_t * &p).sum() + smooth) / sum_skel_t;
    let loss = cl_dice_of(tprec, tsens);

    let sq = (tprec + tsens) * (tprec + tsens);
    let d_prec = -two * tsens * tsens / sq;
    let d_sens = -two * tprec * tprec / sq;

    // tprec 经由 skel_p 依赖 p.
    let g_skel = t.mapv(|t| d_prec * (t - tprec) / sum_skel_p);
    let mut grad = tape.backward(g_skel.view())?;
    // tsens 直接依赖 p.
    grad.zip_mut_with(&skel_t, |g, &s| *g = *g + d_sens * s / sum_skel_t);
    Ok((loss, grad))
}

/// 共同的预处理: 检查形状, 去掉背景通道, 可选 sigmoid. 返回 `(t, p)`.
fn prepare<'a, 'b, F: Float>(
    y_true: ArrayViewD<'a, F>,
    y_pred: ArrayViewD<'b, F>,
    exclude_background: bool,
    use_sigmoid: bool,
) -> LossResult<(ArrayViewD<'a, F>, ArrayD<F>)> {
    check_inputs(&y_true, &y_pred)?;
    let (t, x) = if exclude_background {
        (drop_background(y_true), drop_background(y_pred))
    } else {
        (y_true, y_pred)
    };
    let p = if use_sigmoid {
        x.mapv(sigmoid)
    } else {
        x.to_owned()
    };
    Ok((t, p))
}

/// 把对 `p` 的梯度链回原始输入. `p` 为 [`prepare`] 给出的预测.
fn finish<F: Float>(
    mut grad: ArrayD<F>,
    p: &ArrayD<F>,
    use_sigmoid: bool,
    exclude_background: bool,
    shape: &[usize],
) -> ArrayD<F> {
    if use_sigmoid {
        grad.zip_mut_with(p, |g, &p| *g = *g * p * (F::one() - p));
    }
    if exclude_background {
        restore_background(grad, shape)
    } else {
        grad
    }
}

/// clDice 损失.
///
/// 预测默认是 logits, 会先经过 sigmoid.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SoftClDice {
    smooth: f64,
    exclude_background: bool,
    sigmoid: bool,
    skel: SoftSkeletonize,
}

impl Default for SoftClDice {
    fn default() -> Self {
        Self {
            smooth: 1.0,
            exclude_background: false,
            sigmoid: true,
            skel: SoftSkeletonize::new(LOSS_SKEL_ITER),
        }
    }
}

impl SoftClDice {
    /// 设置平滑项.
    pub fn with_smooth(mut self, smooth: f64) -> Self {
        self.smooth = smooth;
        self
    }

    /// 设置是否忽略第 0 个通道.
    pub fn with_exclude_background(mut self, exclude: bool) -> Self {
        self.exclude_background = exclude;
        self
    }

    /// 设置是否对预测先做 sigmoid.
    pub fn with_sigmoid(mut self, sigmoid: bool) -> Self {
        self.sigmoid = sigmoid;
        self
    }

    /// 设置软骨架化迭代次数.
    pub fn with_skel_iter(mut self, num_iter: usize) -> Self {
        self.skel = SoftSkeletonize::new(num_iter);
        self
    }
}

impl<F: Float> Loss<F> for SoftClDice {
    fn name(&self) -> &'static str {
        "soft_cl_dice"
    }

    fn forward(&self, y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>) -> LossResult<F> {
        let (t, p) = prepare(y_true, y_pred, self.exclude_background, self.sigmoid)?;
        cl_dice(&self.skel, lit(self.smooth), t, p.view())
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let shape = y_pred.shape().to_vec();
        let (t, p) = prepare(y_true, y_pred, self.exclude_background, self.sigmoid)?;
        let (loss, grad) = cl_dice_with_grad(&self.skel, lit(self.smooth), t, p.view())?;
        Ok((loss, finish(grad, &p, self.sigmoid, self.exclude_background, &shape)))
    }
}

/// soft-Dice 与 clDice 的凸组合 `(1 - alpha) · dice + alpha · clDice`.
///
/// 与 [`SoftClDice`] 不同, 默认 **不** 对预测做 sigmoid.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SoftDiceClDice {
    alpha: f64,
    smooth: f64,
    exclude_background: bool,
    sigmoid: bool,
    skel: SoftSkeletonize,
}

impl Default for SoftDiceClDice {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl SoftDiceClDice {
    /// 以 clDice 权重 `alpha` 创建.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            smooth: 1.0,
            exclude_background: false,
            sigmoid: false,
            skel: SoftSkeletonize::new(LOSS_SKEL_ITER),
        }
    }

    /// clDice 权重.
    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// 设置平滑项.
    pub fn with_smooth(mut self, smooth: f64) -> Self {
        self.smooth = smooth;
        self
    }

    /// 设置是否忽略第 0 个通道.
    pub fn with_exclude_background(mut self, exclude: bool) -> Self {
        self.exclude_background = exclude;
        self
    }

    /// 设置是否对预测先做 sigmoid.
    pub fn with_sigmoid(mut self, sigmoid: bool) -> Self {
        self.sigmoid = sigmoid;
        self
    }

    /// 设置软骨架化迭代次数.
    pub fn with_skel_iter(mut self, num_iter: usize) -> Self {
        self.skel = SoftSkeletonize::new(num_iter);
        self
    }
}

impl<F: Float> Loss<F> for SoftDiceClDice {
    fn name(&self) -> &'static str {
        "soft_dice_cl_dice"
    }

    fn forward(&self, y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>) -> LossResult<F> {
        let (t, p) = prepare(y_true, y_pred, self.exclude_background, self.sigmoid)?;
        let alpha: F = lit(self.alpha);
        let dice = soft_dice(t.view(), p.view());
        let cl = cl_dice(&self.skel, lit(self.smooth), t, p.view())?;
        Ok((F::one() - alpha) * dice + alpha * cl)
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let shape = y_pred.shape().to_vec();
        let (t, p) = prepare(y_true, y_pred, self.exclude_background, self.sigmoid)?;

        let alpha: F = lit(self.alpha);
        let (dice, g_dice) = soft_dice_with_grad(t.view(), p.view());
        let (cl, g_cl) = cl_dice_with_grad(&self.skel, lit(self.smooth), t, p.view())?;

        let beta = F::one() - alpha;
        let grad = g_dice.mapv(|g| g * beta) + g_cl.mapv(|g| g * alpha);
        let grad = finish(grad, &p, self.sigmoid, self.exclude_background, &shape);
        Ok((beta * dice + alpha * cl, grad))
    }
}
