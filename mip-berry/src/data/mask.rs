//! 标注后处理.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::Volume;

/// 加载并变换之后对标注执行的操作.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MaskOperation {
    /// 保持原样.
    #[default]
    Std,

    /// 二分类: 所有不等于 1 的体素置为 0.
    #[cfg_attr(feature = "serde", serde(rename = "binary"))]
    BinaryClass,
}

impl MaskOperation {
    /// 就地对 `mask` 执行该操作.
    ///
    /// 返回被修改的体素个数.
    pub fn apply(&self, mask: &mut Volume) -> usize {
        match self {
            Self::Std => 0,
            Self::BinaryClass => {
                let mut cnt = 0usize;
                mask.data_mut()
                    .iter_mut()
                    .filter(|p| **p != 1.0 && **p != 0.0)
                    .for_each(|p| {
                        cnt += 1;
                        *p = 0.0;
                    });
                cnt
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MaskOperation;
    use crate::Volume;
    use ndarray::Array4;

    #[test]
    fn test_binary_class() {
        let data = Array4::from_shape_vec((1, 1, 2, 3), vec![0.0, 1.0, 2.0, 3.0, 1.0, 0.5]).unwrap();
        let mut v = Volume::from_array(data);

        assert_eq!(MaskOperation::Std.apply(&mut v), 0);
        assert_eq!(v[(0, 0, 0, 2)], 2.0);

        assert_eq!(MaskOperation::BinaryClass.apply(&mut v), 3);
        let got: Vec<f32> = v.data().iter().copied().collect();
        assert_eq!(got, vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }
}
