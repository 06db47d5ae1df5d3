use std::sync::Arc;

use common::Buffer3;

use crate::config::FeatureConfig;
use crate::features::{Classifier, FeatureKind};

mod agglomerate_tests;

/// 4x4x1 volume split into quadrants `1 2 / 3 4`.
pub(crate) fn quadrants() -> Buffer3<u32> {
    #[rustfmt::skip]
    let data = vec![
        1, 1, 2, 2,
        1, 1, 2, 2,
        3, 3, 4, 4,
        3, 3, 4, 4,
    ];
    Buffer3::new(4, 4, 1, data)
}

/// 5x5x1 volume of label 1 with a single voxel of label 2 in the middle.
pub(crate) fn enclosed() -> Buffer3<u32> {
    let mut labels = Buffer3::new_filled(5, 5, 1, 1u32);
    *labels.get_mut(2, 2, 0) = 2;
    labels
}

/// Deterministic patchwork of labels with some background voxels.
pub(crate) fn patchwork(w: usize, h: usize, d: usize) -> Buffer3<u32> {
    let voxels = (0..w * h * d)
        .map(|i| {
            let (x, y, z) = (i % w, (i / w) % h, i / (w * h));
            if (x + 2 * y + 3 * z) % 11 == 0 {
                0
            } else {
                ((x / 2) + 3 * (y / 2) + 7 * (z / 2)) as u32 % 13 + 1
            }
        })
        .collect();
    Buffer3::new(w, h, d, voxels)
}

pub(crate) fn uniform(labels: &Buffer3<u32>, value: f64) -> Buffer3<f64> {
    let (w, h, d) = labels.dims();
    Buffer3::new_filled(w, h, d, value)
}

pub(crate) fn gradient(labels: &Buffer3<u32>) -> Buffer3<f64> {
    let (w, h, d) = labels.dims();
    Buffer3::new(
        w,
        h,
        d,
        (0..w * h * d).map(|i| ((i * 7) % 10) as f64 / 10.0).collect(),
    )
}

pub(crate) fn constant(probability: f64) -> Arc<dyn Classifier> {
    Arc::new(move |_features: &[f64]| probability)
}

pub(crate) fn moments_config() -> FeatureConfig {
    FeatureConfig::new(vec![
        FeatureKind::Moments {
            nmoments: 3,
            use_diff: true,
        },
        FeatureKind::Inclusiveness,
    ])
}
