//! 分割损失.
//!
//! 所有损失都按 `forward(y_true, y_pred)` 的参数顺序调用, 输入形状为
//! `(batch, channel, 空间轴...)`. [`Loss::forward_backward`] 同时给出损失对
//! **原始** `y_pred` (即 sigmoid 之前, 若启用) 的梯度, 训练代码可直接把它交给优化器.
//!
//! # 损失一览
//!
//! | [`LossType`] | 实现 |
//! |---|---|
//! | `dice` | [`Dice`] |
//! | `ce_dice` | [`DiceCe`] |
//! | `focal` | [`Focal`] |
//! | `tversky` | [`Tversky`] |
//! | `soft_cl_dice` | [`SoftClDice`] |
//! | `soft_dice_cl_dice` | [`SoftDiceClDice`] |

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ndarray::{ArrayD, ArrayViewD, Axis, Slice};
use num::Float;
use thiserror::Error;

use crate::skel::SkelError;

mod cldice;
mod region;

pub use cldice::{soft_dice, soft_dice_with_grad, SoftClDice, SoftDiceClDice};
pub use region::{Dice, DiceCe, Focal, Tversky};

/// 损失计算错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LossError {
    /// 标注与预测形状不一致.
    #[error("y_true shape {y_true:?} differs from y_pred shape {y_pred:?}")]
    ShapeMismatch {
        /// 标注形状.
        y_true: Vec<usize>,
        /// 预测形状.
        y_pred: Vec<usize>,
    },

    /// 输入维数不足, 至少需要 `(batch, channel, 空间轴)`.
    #[error("unsupported input rank {0}")]
    UnsupportedRank(usize),

    /// 软骨架化失败.
    #[error(transparent)]
    Skel(#[from] SkelError),

    /// 数组构造失败.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// 损失计算结果.
pub type LossResult<T> = Result<T, LossError>;

/// 分割损失.
pub trait Loss<F: Float>: Send + Sync {
    /// 损失名.
    fn name(&self) -> &'static str;

    /// 计算损失值.
    fn forward(&self, y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>) -> LossResult<F> {
        self.forward_backward(y_true, y_pred).map(|(loss, _)| loss)
    }

    /// 计算损失值, 以及损失对 `y_pred` 的梯度 (形状与 `y_pred` 相同).
    fn forward_backward(&self, y_true: ArrayViewD<F>, y_pred: ArrayViewD<F>)
        -> LossResult<(F, ArrayD<F>)>;
}

/// 损失种类.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LossType {
    /// Dice.
    Dice,

    /// Dice + 交叉熵.
    #[default]
    CeDice,

    /// Focal.
    Focal,

    /// Tversky.
    Tversky,

    /// clDice.
    SoftClDice,

    /// soft-Dice 与 clDice 的凸组合.
    SoftDiceClDice,
}

/// 损失配置.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LossConfig {
    /// 损失种类.
    pub loss_type: LossType,

    /// `ce_dice` 中 Dice 项的权重.
    pub lambda_dice: f64,

    /// `ce_dice` 中交叉熵项的权重.
    pub lambda_ce: f64,

    /// `ce_dice` 的 Dice 项是否在 batch 维上一起求和.
    pub cedice_batch: bool,

    /// `soft_dice_cl_dice` 中 clDice 的权重.
    pub alpha: f64,

    /// 预测是否为 logits (需要先过 sigmoid).
    pub sigmoid: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: LossType::default(),
            lambda_dice: 1.0,
            lambda_ce: 0.3,
            cedice_batch: false,
            alpha: 0.5,
            sigmoid: true,
        }
    }
}

/// 根据配置创建损失.
pub fn get_loss<F: Float + 'static>(cfg: &LossConfig) -> Box<dyn Loss<F>> {
    log::debug!("using {:?} loss", cfg.loss_type);
    match cfg.loss_type {
        LossType::Dice => Box::new(Dice::new(cfg.sigmoid)),
        LossType::CeDice => Box::new(
            DiceCe::new(cfg.sigmoid)
                .with_lambdas(cfg.lambda_dice, cfg.lambda_ce)
                .with_batch(cfg.cedice_batch),
        ),
        LossType::Focal => Box::new(Focal::default()),
        LossType::Tversky => Box::new(Tversky::new(cfg.sigmoid)),
        LossType::SoftClDice => Box::new(SoftClDice::default()),
        LossType::SoftDiceClDice => Box::new(SoftDiceClDice::new(cfg.alpha)),
    }
}

/// `f64` 常数转换到 `F`. 对 `f32` / `f64` 总是成功.
#[inline]
pub(crate) fn lit<F: Float>(v: f64) -> F {
    F::from(v).unwrap_or_else(F::nan)
}

#[inline]
pub(crate) fn sigmoid<F: Float>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}

/// 检查两个输入形状一致, 且至少有 `(batch, channel, 空间轴)` 三维.
pub(crate) fn check_inputs<F>(y_true: &ArrayViewD<F>, y_pred: &ArrayViewD<F>) -> LossResult<()> {
    if y_true.shape() != y_pred.shape() {
        return Err(LossError::ShapeMismatch {
            y_true: y_true.shape().to_vec(),
            y_pred: y_pred.shape().to_vec(),
        });
    }
    if y_pred.ndim() < 3 {
        return Err(LossError::UnsupportedRank(y_pred.ndim()));
    }
    Ok(())
}

/// 去掉第 0 个 (背景) 通道.
#[inline]
pub(crate) fn drop_background<F>(mut x: ArrayViewD<F>) -> ArrayViewD<F> {
    x.slice_axis_inplace(Axis(1), Slice::from(1..));
    x
}

/// 把去掉背景通道后的梯度放回完整形状, 背景通道梯度为 0.
pub(crate) fn restore_background<F: Float>(grad: ArrayD<F>, shape: &[usize]) -> ArrayD<F> {
    let mut full = ArrayD::zeros(shape);
    full.slice_axis_mut(Axis(1), Slice::from(1..)).assign(&grad);
    full
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::{Dimension, IxDyn};

    /// 用中心差分检查 `loss` 在若干位置的梯度.
    pub(crate) fn check_gradient(
        loss: &dyn Loss<f64>,
        y_true: &ArrayD<f64>,
        y_pred: &ArrayD<f64>,
        tol: f64,
    ) {
        let (_, grad) = loss.forward_backward(y_true.view(), y_pred.view()).unwrap();
        assert_eq!(grad.shape(), y_pred.shape());

        let eps = 1e-6;
        let n = y_pred.len();
        for k in [0, n / 3, n / 2, n - 1] {
            let mut idx = vec![0usize; y_pred.ndim()];
            let mut rem = k;
            for a in (0..idx.len()).rev() {
                idx[a] = rem % y_pred.shape()[a];
                rem /= y_pred.shape()[a];
            }
            let idx = idx.as_slice();

            let mut xp = y_pred.clone();
            xp[idx] += eps;
            let mut xm = y_pred.clone();
            xm[idx] -= eps;
            let fp = loss.forward(y_true.view(), xp.view()).unwrap();
            let fm = loss.forward(y_true.view(), xm.view()).unwrap();
            let fd = (fp - fm) / (2.0 * eps);
            assert!(
                (fd - grad[idx]).abs() < tol,
                "{}: at {idx:?}, fd = {fd}, grad = {}",
                loss.name(),
                grad[idx]
            );
        }
    }

    /// 确定性的 "随机" 预测 logits, 取值两两不同.
    pub(crate) fn logits(shape: &[usize]) -> ArrayD<f64> {
        let n: usize = shape.iter().product();
        let v = (0..n)
            .map(|i| ((i * 37 + 11) % (n.max(2) * 3 + 1)) as f64 / n as f64 - 1.2)
            .collect();
        ArrayD::from_shape_vec(IxDyn(shape), v).unwrap()
    }

    /// 一块实心的标注.
    pub(crate) fn target(shape: &[usize]) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(shape), |idx| {
            let inside = (2..idx.ndim()).all(|a| {
                let n = shape[a];
                idx[a] >= n / 4 && idx[a] < n - n / 4
            });
            if inside {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_get_loss_names() {
        let mut cfg = LossConfig::default();
        assert_eq!(get_loss::<f32>(&cfg).name(), "ce_dice");
        for (t, name) in [
            (LossType::Dice, "dice"),
            (LossType::Focal, "focal"),
            (LossType::Tversky, "tversky"),
            (LossType::SoftClDice, "soft_cl_dice"),
            (LossType::SoftDiceClDice, "soft_dice_cl_dice"),
        ] {
            cfg.loss_type = t;
            assert_eq!(get_loss::<f64>(&cfg).name(), name);
        }
    }

    #[test]
    fn test_shape_checks() {
        let loss = get_loss::<f64>(&LossConfig::default());
        let a = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4, 4]));
        let b = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4, 5]));
        assert!(matches!(
            loss.forward(a.view(), b.view()),
            Err(LossError::ShapeMismatch { .. })
        ));

        let c = ArrayD::<f64>::zeros(IxDyn(&[4, 4]));
        assert_eq!(
            loss.forward(c.view(), c.view()),
            Err(LossError::UnsupportedRank(2))
        );
    }

    #[test]
    fn test_background_round_trip() {
        let x = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2]), |i| (i[1] * 2 + i[2]) as f64);
        let fg = drop_background(x.view());
        assert_eq!(fg.shape(), &[1, 2, 2]);
        let back = restore_background(fg.to_owned(), x.shape());
        assert_eq!(back[[0, 0, 1]], 0.0);
        assert_eq!(back[[0, 2, 1]], x[[0, 2, 1]]);
    }
}
