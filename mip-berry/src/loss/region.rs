//! 区域类损失: Dice, Dice + 交叉熵, Focal, Tversky.
//!
//! 计算方式与 MONAI 的同名损失一致 (包含背景通道, 结果取平均).

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use num::Float;

use super::{check_inputs, lit, sigmoid, Loss, LossResult};

/// Dice / Tversky 的平滑项.
const SMOOTH: f64 = 1e-5;

/// 按 `(batch, channel)` (或仅按 channel) 分组求和.
#[derive(Copy, Clone, Debug)]
struct Groups {
    channels: usize,
    spatial: usize,
    batch: bool,
    count: usize,
}

impl Groups {
    fn new(shape: &[usize], batch: bool) -> Self {
        let channels = shape[1];
        let spatial = shape[2..].iter().product();
        let count = if batch { channels } else { shape[0] * channels };
        Self {
            channels,
            spatial,
            batch,
            count,
        }
    }

    /// 展平索引 `i` 所属的组.
    #[inline]
    fn of(&self, i: usize) -> usize {
        let bc = i / self.spatial.max(1);
        if self.batch {
            bc % self.channels.max(1)
        } else {
            bc
        }
    }

    /// 按组累加 `f(i)`.
    fn sum<F: Float>(&self, len: usize, f: impl Fn(usize) -> F) -> Vec<F> {
        let mut acc = vec![F::zero(); self.count];
        for i in 0..len {
            let g = self.of(i);
            acc[g] = acc[g] + f(i);
        }
        acc
    }
}

/// 展平后的输入.
struct Flat<F> {
    shape: Vec<usize>,
    t: Vec<F>,
    x: Vec<F>,
    /// sigmoid 之后 (若启用) 的预测.
    p: Vec<F>,
    use_sigmoid: bool,
}

impl<F: Float> Flat<F> {
    fn new(y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>, use_sigmoid: bool) -> LossResult<Self> {
        check_inputs(&y_true, &y_pred)?;
        let t: Vec<F> = y_true.iter().copied().collect();
        let x: Vec<F> = y_pred.iter().copied().collect();
        let p = if use_sigmoid {
            x.iter().map(|v| sigmoid(*v)).collect()
        } else {
            x.clone()
        };
        Ok(Self {
            shape: y_pred.shape().to_vec(),
            t,
            x,
            p,
            use_sigmoid,
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.x.len()
    }

    /// 把对 `p` 的梯度链回原始输入.
    fn chain(&self, mut g: Vec<F>) -> Vec<F> {
        if self.use_sigmoid {
            for (g, p) in g.iter_mut().zip(&self.p) {
                *g = *g * *p * (F::one() - *p);
            }
        }
        g
    }

    fn to_array(&self, g: Vec<F>) -> LossResult<ArrayD<F>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), g)?)
    }
}

/// 每组的 Dice 损失及对 `p` 的梯度.
fn dice_with_grad<F: Float>(input: &Flat<F>, batch: bool) -> (F, Vec<F>) {
    let groups = Groups::new(&input.shape, batch);
    let smooth: F = lit(SMOOTH);
    let two = F::one() + F::one();
    let m: F = lit(groups.count as f64);
    let (t, p) = (&input.t, &input.p);

    let inter = groups.sum(input.len(), |i| t[i] * p[i]);
    let denom = groups.sum(input.len(), |i| t[i] + p[i]);

    let mut loss = F::zero();
    for g in 0..groups.count {
        loss = loss + F::one() - (two * inter[g] + smooth) / (denom[g] + smooth);
    }
    let grad = (0..input.len())
        .map(|i| {
            let g = groups.of(i);
            let (n, d) = (two * inter[g] + smooth, denom[g] + smooth);
            (n - two * t[i] * d) / (d * d) / m
        })
        .collect();
    (loss / m, grad)
}

/// Dice 损失. 对每个 `(batch, channel)` 分别计算后取平均.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dice {
    sigmoid: bool,
    batch: bool,
}

impl Dice {
    /// 创建. `sigmoid` 表示预测为 logits.
    pub fn new(sigmoid: bool) -> Self {
        Self {
            sigmoid,
            batch: false,
        }
    }

    /// 设置是否在 batch 维上一起求和.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }
}

impl<F: Float> Loss<F> for Dice {
    fn name(&self) -> &'static str {
        "dice"
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let input = Flat::new(y_true, y_pred, self.sigmoid)?;
        let (loss, g) = dice_with_grad(&input, self.batch);
        Ok((loss, input.to_array(input.chain(g))?))
    }
}

/// 交叉熵部分, 输入为 logits.
///
/// 单通道时为 BCE-with-logits; 多通道时为沿通道轴 softmax 的软标签交叉熵.
/// 两者都对所有位置取平均. 梯度直接对 logits.
fn cross_entropy_with_grad<F: Float>(input: &Flat<F>) -> (F, Vec<F>) {
    let (t, x) = (&input.t, &input.x);
    let channels = input.shape[1];
    let spatial: usize = input.shape[2..].iter().product();
    let zero = F::zero();

    if channels == 1 {
        let n: F = lit(input.len() as f64);
        let mut loss = zero;
        let grad = (0..input.len())
            .map(|i| {
                // max(x, 0) - x t + ln(1 + e^{-|x|})
                loss = loss + x[i].max(zero) - x[i] * t[i] + (-x[i].abs()).exp().ln_1p();
                (sigmoid(x[i]) - t[i]) / n
            })
            .collect();
        return (loss / n, grad);
    }

    let positions = input.shape[0] * spatial;
    let n: F = lit(positions as f64);
    let mut loss = zero;
    let mut grad = vec![zero; input.len()];
    for b in 0..input.shape[0] {
        for s in 0..spatial {
            let at = |c: usize| (b * channels + c) * spatial + s;
            let max = (0..channels).map(|c| x[at(c)]).fold(F::neg_infinity(), F::max);
            let lse = (0..channels)
                .map(|c| (x[at(c)] - max).exp())
                .fold(zero, |a, e| a + e)
                .ln()
                + max;
            let t_sum = (0..channels).map(|c| t[at(c)]).fold(zero, |a, v| a + v);
            for c in 0..channels {
                let i = at(c);
                loss = loss - t[i] * (x[i] - lse);
                grad[i] = ((x[i] - lse).exp() * t_sum - t[i]) / n;
            }
        }
    }
    (loss / n, grad)
}

/// Dice + 交叉熵: `lambda_dice · dice + lambda_ce · ce`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DiceCe {
    dice: Dice,
    lambda_dice: f64,
    lambda_ce: f64,
}

impl DiceCe {
    /// 以默认权重 `(1.0, 1.0)` 创建.
    pub fn new(sigmoid: bool) -> Self {
        Self {
            dice: Dice::new(sigmoid),
            lambda_dice: 1.0,
            lambda_ce: 1.0,
        }
    }

    /// 设置两项的权重.
    pub fn with_lambdas(mut self, lambda_dice: f64, lambda_ce: f64) -> Self {
        self.lambda_dice = lambda_dice;
        self.lambda_ce = lambda_ce;
        self
    }

    /// 设置 Dice 项是否在 batch 维上一起求和.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.dice = self.dice.with_batch(batch);
        self
    }
}

impl<F: Float> Loss<F> for DiceCe {
    fn name(&self) -> &'static str {
        "ce_dice"
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let input = Flat::new(y_true, y_pred, self.dice.sigmoid)?;
        let (wd, wc): (F, F) = (lit(self.lambda_dice), lit(self.lambda_ce));

        let (dice, g_dice) = dice_with_grad(&input, self.dice.batch);
        let g_dice = input.chain(g_dice);
        let (ce, g_ce) = cross_entropy_with_grad(&input);

        let grad = g_dice
            .into_iter()
            .zip(g_ce)
            .map(|(a, b)| wd * a + wc * b)
            .collect();
        Ok((wd * dice + wc * ce, input.to_array(grad)?))
    }
}

/// sigmoid focal 损失, 输入为 logits, 对所有元素取平均.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Focal {
    gamma: f64,
}

impl Default for Focal {
    fn default() -> Self {
        Self { gamma: 2.0 }
    }
}

impl Focal {
    /// 以聚焦参数 `gamma` 创建.
    pub fn new(gamma: f64) -> Self {
        Self { gamma }
    }
}

impl<F: Float> Loss<F> for Focal {
    fn name(&self) -> &'static str {
        "focal"
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let input = Flat::new(y_true, y_pred, false)?;
        let (t, x) = (&input.t, &input.x);
        let zero = F::zero();
        let one = F::one();
        let two = one + one;
        let gamma: F = lit(self.gamma);
        let n: F = lit(input.len() as f64);

        let mut loss = zero;
        let grad = (0..input.len())
            .map(|i| {
                let bce = x[i].max(zero) - x[i] * t[i] + (-x[i].abs()).exp().ln_1p();
                // w = sigmoid(z)^gamma, z = -x (2t - 1)
                let sign = two * t[i] - one;
                let sz = sigmoid(-x[i] * sign);
                let w = sz.powf(gamma);
                loss = loss + w * bce;

                let dw = -gamma * w * (one - sz) * sign;
                (w * (sigmoid(x[i]) - t[i]) + bce * dw) / n
            })
            .collect();
        Ok((loss / n, input.to_array(grad)?))
    }
}

/// Tversky 损失. `alpha` 惩罚假阳性, `beta` 惩罚假阴性.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Tversky {
    sigmoid: bool,
    alpha: f64,
    beta: f64,
}

impl Tversky {
    /// 以 `alpha = beta = 0.5` 创建, 此时等价于 Dice.
    pub fn new(sigmoid: bool) -> Self {
        Self {
            sigmoid,
            alpha: 0.5,
            beta: 0.5,
        }
    }

    /// 设置假阳性/假阴性权重.
    pub fn with_weights(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }
}

impl<F: Float> Loss<F> for Tversky {
    fn name(&self) -> &'static str {
        "tversky"
    }

    fn forward_backward(
        &self,
        y_true: ArrayViewD<F>,
        y_pred: ArrayViewD<F>,
    ) -> LossResult<(F, ArrayD<F>)> {
        let input = Flat::new(y_true, y_pred, self.sigmoid)?;
        let groups = Groups::new(&input.shape, false);
        let (t, p) = (&input.t, &input.p);
        let one = F::one();
        let smooth: F = lit(SMOOTH);
        let (alpha, beta): (F, F) = (lit(self.alpha), lit(self.beta));
        let m: F = lit(groups.count as f64);

        let tp = groups.sum(input.len(), |i| p[i] * t[i]);
        let fp = groups.sum(input.len(), |i| p[i] * (one - t[i]));
        let fneg = groups.sum(input.len(), |i| (one - p[i]) * t[i]);

        let num: Vec<F> = tp.iter().map(|v| *v + smooth).collect();
        let den: Vec<F> = (0..groups.count)
            .map(|g| tp[g] + alpha * fp[g] + beta * fneg[g] + smooth)
            .collect();
        let loss = (0..groups.count).fold(F::zero(), |acc, g| acc + one - num[g] / den[g]) / m;

        let grad = (0..input.len())
            .map(|i| {
                let g = groups.of(i);
                let d_den = t[i] + alpha * (one - t[i]) - beta * t[i];
                -(t[i] * den[g] - num[g] * d_den) / (den[g] * den[g]) / m
            })
            .collect();
        Ok((loss, input.to_array(input.chain(grad))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::tests::{check_gradient, logits, target};

    #[test]
    fn test_dice_perfect_and_worst() {
        let t = target(&[2, 1, 4, 4, 4]);
        let loss = Dice::new(false);
        let l: f64 = loss.forward(t.view(), t.view()).unwrap();
        assert!(l.abs() < 1e-6);

        let inv = t.mapv(|v| 1.0 - v);
        let l: f64 = loss.forward(t.view(), inv.view()).unwrap();
        assert!((l - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tversky_half_equals_dice() {
        let t = target(&[1, 2, 4, 6]);
        let x = logits(&[1, 2, 4, 6]);
        let d: f64 = Dice::new(true).forward(t.view(), x.view()).unwrap();
        let tv: f64 = Tversky::new(true).forward(t.view(), x.view()).unwrap();
        // 只差在平滑项上.
        assert!((d - tv).abs() < 1e-5, "{d} vs {tv}");
    }

    #[test]
    fn test_bce_known_value() {
        // 单个元素: x = 0, t = 1 -> ln 2.
        let t = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1]), vec![1.0f64]).unwrap();
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 1, 1]), vec![0.0f64]).unwrap();
        let l: f64 = DiceCe::new(true)
            .with_lambdas(0.0, 1.0)
            .forward(t.view(), x.view())
            .unwrap();
        assert!((l - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_focal_down_weights_easy_examples() {
        let t = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![1.0f64, 1.0]).unwrap();
        let easy = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![4.0f64, 4.0]).unwrap();
        let focal: f64 = Focal::default().forward(t.view(), easy.view()).unwrap();
        let bce: f64 = DiceCe::new(true)
            .with_lambdas(0.0, 1.0)
            .forward(t.view(), easy.view())
            .unwrap();
        // (1 - sigmoid(4))^2 ≈ 3.2e-4
        assert!(focal < bce * 1e-3);
        assert!(focal > 0.0);
    }

    #[test]
    fn test_region_gradients() {
        let shape = [2, 1, 3, 4];
        let t = target(&shape);
        let x = logits(&shape);
        check_gradient(&Dice::new(true), &t, &x, 1e-6);
        check_gradient(&Dice::new(true).with_batch(true), &t, &x, 1e-6);
        check_gradient(&DiceCe::new(true).with_lambdas(1.0, 0.3), &t, &x, 1e-6);
        check_gradient(&Focal::default(), &t, &x, 1e-6);
        check_gradient(&Tversky::new(true).with_weights(0.3, 0.7), &t, &x, 1e-6);

        // 多通道交叉熵.
        let shape = [1, 3, 2, 3];
        let t = target(&shape);
        let x = logits(&shape);
        check_gradient(&DiceCe::new(true).with_batch(true), &t, &x, 1e-6);
    }
}
