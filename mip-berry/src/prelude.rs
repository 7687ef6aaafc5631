//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::data::{MaskOperation, Sample, Volume, VolumeMeta};

pub use crate::consts::{
    GOOD_SIGMA_RATIO, KEY_IMAGE, KEY_MASK, POS_CENTER_PROB, TARGET_PIXEL_DIM, TARGET_SPATIAL_SIZE,
};

pub use crate::transform::{
    extract_patch, get_transform, random_state, restore_original, CenterSource, Compose,
    CropSpec, KeySet, MapTransform, RandomState, TransformType,
};

pub use crate::skel::SoftSkeletonize;

pub use crate::loss::{get_loss, Loss, LossConfig, LossType};

pub use crate::dataset::home_dataset_dir_with;
pub use crate::dataset::{self, get_dataset, DataLoaderConfig, DatasetConfig, PairedDataset};
