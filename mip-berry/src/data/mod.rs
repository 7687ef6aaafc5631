use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array4, ArrayView3, ArrayView4, ArrayViewMut4, Axis, Ix4};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::consts::{KEY_IMAGE, KEY_MASK};
use crate::Idx3d;

mod mask;

pub use mask::MaskOperation;

/// 读取体数据时的错误.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// 底层 nifti 读取错误.
    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 体数据维数既不是 3 也不是 4.
    #[error("unsupported volume rank {0}, expected 3 or 4")]
    UnsupportedRank(usize),

    /// 数据形状转换失败.
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// 体数据读取结果.
pub type VolumeResult<T> = Result<T, VolumeError>;

/// 体数据的元信息. 所有三元组均按 `(z, y, x)` 组织.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeMeta {
    /// 当前体素分辨率, 单位为毫米.
    pub pix_dim: [f64; 3],

    /// 加载时 (任何变换之前) 的体素分辨率.
    pub original_pix_dim: [f64; 3],

    /// 加载时 (任何变换之前) 的空间形状.
    pub original_shape: Idx3d,
}

impl VolumeMeta {
    /// 以同一分辨率和形状初始化当前值与原始值.
    pub fn new(pix_dim: [f64; 3], shape: Idx3d) -> Self {
        Self {
            pix_dim,
            original_pix_dim: pix_dim,
            original_shape: shape,
        }
    }

    /// 各向同性 1mm 分辨率的元信息, 主要用于合成数据.
    #[inline]
    pub fn unit(shape: Idx3d) -> Self {
        Self::new([1.0; 3], shape)
    }
}

/// 从 nifti header 读取 `(z, y, x)` 顺序的体素分辨率.
#[inline]
fn pix_dim_from_header(h: &NiftiHeader) -> [f64; 3] {
    // [_, x, y, z, ...]
    let [_, x, y, z, ..] = h.pixdim;
    [z as f64, y as f64, x as f64]
}

/// 单个 4D 体数据 `(channel, z, y, x)` 及其元信息. 体素值以 `f32` 保存.
///
/// 扫描和标注共用该结构, 与 MONAI 一致, 标注同样以浮点数保存.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array4<f32>,
    meta: VolumeMeta,
}

impl Index<(usize, usize, usize, usize)> for Volume {
    type Output = f32;

    #[inline]
    fn index(&self, index: (usize, usize, usize, usize)) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<(usize, usize, usize, usize)> for Volume {
    #[inline]
    fn index_mut(&mut self, index: (usize, usize, usize, usize)) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl Volume {
    /// 直接由数据与元信息创建.
    #[inline]
    pub fn new(data: Array4<f32>, meta: VolumeMeta) -> Self {
        Self { data, meta }
    }

    /// 以 1mm 各向同性元信息包装数据. 原始形状取 `data` 的空间形状.
    pub fn from_array(data: Array4<f32>) -> Self {
        let (_, z, y, x) = data.dim();
        Self {
            data,
            meta: VolumeMeta::unit((z, y, x)),
        }
    }

    /// 打开 nii / nii.gz 文件. `path` 为本地路径.
    ///
    /// 3D 文件会被补上长度为 1 的通道轴; 4D 文件的最后一维被视为通道.
    pub fn open<P: AsRef<Path>>(path: P) -> VolumeResult<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let pix_dim = pix_dim_from_header(obj.header());

        // [x, y, z(, c)] -> [(c,) z, y, x].
        let data = obj.into_volume().into_ndarray::<f32>()?.reversed_axes();
        let data = match data.ndim() {
            3 => data.insert_axis(Axis(0)),
            4 => data,
            n => return Err(VolumeError::UnsupportedRank(n)),
        };
        let data = data
            .into_dimensionality::<Ix4>()?
            .as_standard_layout()
            .into_owned();

        let (_, z, y, x) = data.dim();
        log::debug!("loaded {:?}: shape {:?}", path.as_ref(), data.dim());
        Ok(Self {
            data,
            meta: VolumeMeta::new(pix_dim, (z, y, x)),
        })
    }

    /// 获取空间形状 `(z, y, x)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let (_, z, y, x) = self.data.dim();
        (z, y, x)
    }

    /// 获取通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// 获取体素总数 (含通道).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 数据是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 获取元信息.
    #[inline]
    pub fn meta(&self) -> &VolumeMeta {
        &self.meta
    }

    /// 获取可修改的元信息.
    #[inline]
    pub fn meta_mut(&mut self) -> &mut VolumeMeta {
        &mut self.meta
    }

    /// 当前体素分辨率, 按 `(z, y, x)`.
    #[inline]
    pub fn pix_dim(&self) -> [f64; 3] {
        self.meta.pix_dim
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut4<'_, f32> {
        self.data.view_mut()
    }

    /// 获取第 `c` 个通道的视图. 越界时 panic.
    #[inline]
    pub fn channel(&self, c: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(0), c)
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_array(self) -> Array4<f32> {
        self.data
    }

    /// 用新数据替换底层数据, 保留原始形状/分辨率信息.
    #[inline]
    pub fn with_data(self, data: Array4<f32>) -> Self {
        Self {
            data,
            meta: self.meta,
        }
    }

    /// 统计体素值大于 0 的 (任一通道) 空间位置个数.
    pub fn count_positive(&self) -> usize {
        self.data
            .map_axis(Axis(0), |v| v.iter().any(|p| *p > 0.0))
            .iter()
            .filter(|b| **b)
            .count()
    }
}

/// 按键组织的体数据集合, 是所有映射变换 (map transform) 的输入与输出.
///
/// 约定使用 [`KEY_IMAGE`] 和 [`KEY_MASK`] 两个键.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    items: BTreeMap<String, Volume>,
}

impl Sample {
    /// 创建空样本.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 由扫描与标注创建样本.
    pub fn from_pair(image: Volume, mask: Volume) -> Self {
        let mut s = Self::new();
        s.insert(KEY_IMAGE, image);
        s.insert(KEY_MASK, mask);
        s
    }

    /// 插入或替换 `key` 对应的体数据, 返回旧值.
    #[inline]
    pub fn insert(&mut self, key: impl Into<String>, v: Volume) -> Option<Volume> {
        self.items.insert(key.into(), v)
    }

    /// 获取 `key` 对应的体数据.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Volume> {
        self.items.get(key)
    }

    /// 获取 `key` 对应的可变体数据.
    #[inline]
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Volume> {
        self.items.get_mut(key)
    }

    /// 取出 `key` 对应的体数据.
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Volume> {
        self.items.remove(key)
    }

    /// 是否包含 `key`.
    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// 按键的字典序迭代所有键.
    #[inline]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// 消费自我, 取出扫描与标注. 任一缺失则返回 `None`.
    pub fn into_pair(mut self) -> Option<(Volume, Volume)> {
        let image = self.remove(KEY_IMAGE)?;
        let mask = self.remove(KEY_MASK)?;
        Some((image, mask))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Sample, Volume};
    use crate::consts::{KEY_IMAGE, KEY_MASK};
    use ndarray::{Array3, Array4};
    use nifti::writer::WriterOptions;
    use nifti::NiftiHeader;
    use std::path::Path;

    /// 将 `(x, y, z)` 顺序的 `data` 写为 nifti 文件, `pix_dim` 同样按 `(x, y, z)`.
    pub(crate) fn write_nii(path: &Path, data: &Array3<f32>, pix_dim: [f32; 3]) {
        let [x, y, z] = pix_dim;
        let header = NiftiHeader {
            pixdim: [1.0, x, y, z, 1.0, 1.0, 1.0, 1.0],
            ..NiftiHeader::default()
        };
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(data)
            .unwrap();
    }

    #[test]
    fn test_open_reverses_axes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case.nii.gz");
        let mut data = Array3::zeros((4, 3, 2));
        data[(3, 2, 1)] = 321.0;
        data[(1, 0, 0)] = 7.0;
        write_nii(&path, &data, [0.5, 0.75, 2.0]);

        let v = Volume::open(&path).unwrap();
        assert_eq!(v.channels(), 1);
        assert_eq!(v.shape(), (2, 3, 4));
        assert_eq!(v.pix_dim(), [2.0, 0.75, 0.5]);
        assert_eq!(v.meta().original_pix_dim, [2.0, 0.75, 0.5]);
        assert_eq!(v.meta().original_shape, (2, 3, 4));
        assert_eq!(v[(0, 1, 2, 3)], 321.0);
        assert_eq!(v[(0, 0, 0, 1)], 7.0);
        assert_eq!(v.count_positive(), 2);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Volume::open(dir.path().join("missing.nii.gz")).is_err());
    }

    #[test]
    fn test_volume_shape_and_meta() {
        let v = Volume::from_array(Array4::zeros((2, 3, 4, 5)));
        assert_eq!(v.shape(), (3, 4, 5));
        assert_eq!(v.channels(), 2);
        assert_eq!(v.len(), 120);
        assert_eq!(v.meta().original_shape, (3, 4, 5));
        assert_eq!(v.pix_dim(), [1.0; 3]);
    }

    #[test]
    fn test_count_positive_merges_channels() {
        let mut data = Array4::zeros((2, 2, 2, 2));
        data[(0, 0, 0, 0)] = 1.0;
        data[(1, 0, 0, 0)] = 1.0;
        data[(1, 1, 1, 1)] = 0.5;
        data[(0, 1, 0, 0)] = -1.0;
        assert_eq!(Volume::from_array(data).count_positive(), 2);
    }

    #[test]
    fn test_sample_pair() {
        let image = Volume::from_array(Array4::zeros((1, 2, 2, 2)));
        let mask = Volume::from_array(Array4::ones((1, 2, 2, 2)));
        let s = Sample::from_pair(image, mask);
        assert!(s.contains(KEY_IMAGE) && s.contains(KEY_MASK));
        assert_eq!(s.keys().collect::<Vec<_>>(), vec![KEY_IMAGE, KEY_MASK]);

        let (_, mask) = s.into_pair().unwrap();
        assert_eq!(mask[(0, 1, 1, 1)], 1.0);
        assert!(Sample::new().into_pair().is_none());
    }
}
