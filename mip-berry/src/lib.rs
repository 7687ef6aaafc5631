#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 为 3D 医学影像 (血管等管状结构) 分割训练提供数据加载、
//! 几何/强度归一化、patch 采样增强, 以及拓扑感知的 clDice 损失.
//!
//! 模型结构、训练循环驱动 (优化器、checkpoint) 和实验追踪不在本 crate 范围内,
//! 它们是围绕采样与损失核心的编排代码.
//!
//! # 约定
//!
//! 1. 体数据统一按 `(channel, z, y, x)` 组织, 通道轴永远在第一维,
//!   空间轴恰好三个. nifti 文件中 `(x, y, z[, c])` 的存储顺序在加载时被反转.
//! 2. 所有随机操作都显式接收 [`transform::RandomState`],
//!   不依赖任何全局随机源. 同样的种子保证同样的结果.
//! 3. 参数不合法时返回 `Err`, 而不是 panic.
//!
//! # 模块
//!
//! ### 体数据与 nifti 读取 ✅
//!
//! 实现位于 `mip-berry/src/data`.
//!
//! ### 几何重采样、强度缩放、pad/crop ✅
//!
//! 实现位于 `mip-berry/src/transform/{spacing, intensity, resize}.rs`.
//!
//! ### Patch 中心采样 (截断高斯 / 正样本偏置 / 均匀) 与 patch 提取 ✅
//!
//! 实现位于 `mip-berry/src/transform/crop`.
//!
//! ### 软骨架化 (soft skeletonization) 及其反向传播 ✅
//!
//! 实现位于 `mip-berry/src/skel`.
//!
//! ### soft-Dice / clDice 及 Dice, DiceCE, Focal, Tversky 损失 ✅
//!
//! 每个损失都能同时给出对预测输入的梯度.
//!
//! 实现位于 `mip-berry/src/loss`.
//!
//! ### 数据集: 文件发现、配对校验、划分、缓存 ✅
//!
//! 实现位于 `mip-berry/src/dataset`.

/// 三维索引 `(z, y, x)`, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 体数据与 nifti 文件读取.
pub mod data;

pub mod consts;

pub mod dataset;
pub mod loss;
pub mod prelude;
pub mod skel;
pub mod transform;

pub use data::{MaskOperation, Sample, Volume, VolumeError, VolumeMeta};
