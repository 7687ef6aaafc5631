//! 通用常量.
//!
//! 所有三元组均按 `(z, y, x)` 顺序给出.

use crate::Idx3d;

/// 样本中 CT 扫描的键.
pub const KEY_IMAGE: &str = "image";

/// 样本中分割标注的键.
pub const KEY_MASK: &str = "mask";

/// 重采样的目标体素分辨率 (单位: 毫米).
///
/// 该值来自对数据集重采样后最大图像尺寸的观察.
pub const TARGET_PIXEL_DIM: [f64; 3] = [0.5, 0.35, 0.35];

/// 重采样后统一 pad/crop 到的目标画布大小. 这样不需要太多 padding.
pub const TARGET_SPATIAL_SIZE: Idx3d = (280, 600, 600);

/// 截断高斯采样中, 标准差相对体数据边长的比例. 经实验得到的较好取值.
pub const GOOD_SIGMA_RATIO: f64 = 0.1;

/// 正样本偏置采样中, 以正体素为中心的概率.
pub const POS_CENTER_PROB: f64 = 0.75;

/// 默认 patch 边长.
pub const DEFAULT_PATCH_LEN: usize = 96;

/// 训练/验证划分所用的固定种子.
pub const SPLIT_SEED: u64 = 42;

/// 默认的扫描文件名前后缀.
pub const DEFAULT_IMAGE_AFFIX: (&str, &str) = ("", ".img.nii.gz");

/// 默认的标注文件名前后缀.
pub const DEFAULT_MASK_AFFIX: (&str, &str) = ("", ".label.nii.gz");

/// 默认数据目录.
pub const DEFAULT_DATA_DIR: &str = "/data/training_data";
