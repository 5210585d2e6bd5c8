//! Keypoint capability in the ORB family: FAST corners from `imageproc`,
//! BRIEF-style binary descriptors sampled on a smoothed patch, and
//! brute-force Hamming matching with cross-check.
//!
//! The sampling pattern is drawn once from a fixed seed so descriptors of
//! different images, and of different runs, are comparable.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use imageproc::corners::{Corner, corners_fast9};
use imageproc::filter::gaussian_blur_f32;

use crate::core::vision::{Signature, Vision};

pub const DESCRIPTOR_BITS: usize = 256;
const WORDS: usize = DESCRIPTOR_BITS / 64;
const PATCH_RADIUS: i32 = 15;
const PATTERN_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

pub type Descriptor = [u64; WORDS];

type Offset = (i32, i32);

pub struct KeypointMatcher {
    fast_threshold: u8,
    max_keypoints: usize,
    max_side: u32,
    blur_sigma: f32,
    pattern: Vec<(Offset, Offset)>,
}

impl KeypointMatcher {
    pub fn new(fast_threshold: u8, max_keypoints: usize) -> Self {
        Self {
            fast_threshold,
            max_keypoints: max_keypoints.max(1),
            max_side: 512,
            blur_sigma: 2.0,
            pattern: sampling_pattern(PATTERN_SEED),
        }
    }

    fn grayscale(&self, image: &DynamicImage) -> GrayImage {
        if image.width().max(image.height()) > self.max_side {
            image
                .resize(self.max_side, self.max_side, FilterType::Triangle)
                .to_luma8()
        } else {
            image.to_luma8()
        }
    }

    /// Strongest corners far enough from the border to hold a full patch.
    fn keypoints(&self, gray: &GrayImage) -> Vec<Corner> {
        let (width, height) = gray.dimensions();
        let margin = PATCH_RADIUS as u32;
        if width <= 2 * margin || height <= 2 * margin {
            return Vec::new();
        }

        let mut corners: Vec<Corner> = corners_fast9(gray, self.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= margin && c.y >= margin && c.x < width - margin && c.y < height - margin)
            .collect();
        corners.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        corners.truncate(self.max_keypoints);
        corners
    }

    fn describe(&self, smooth: &GrayImage, corner: &Corner) -> Descriptor {
        let (cx, cy) = (corner.x as i32, corner.y as i32);
        let at = |(dx, dy): Offset| smooth.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0];

        let mut descriptor = [0u64; WORDS];
        for (bit, &(p, q)) in self.pattern.iter().enumerate() {
            if at(p) < at(q) {
                descriptor[bit / 64] |= 1u64 << (bit % 64);
            }
        }
        descriptor
    }
}

impl Default for KeypointMatcher {
    fn default() -> Self {
        Self::new(20, 500)
    }
}

impl Vision for KeypointMatcher {
    fn compute_signature(&self, image: &DynamicImage) -> Option<Signature> {
        let gray = self.grayscale(image);
        let corners = self.keypoints(&gray);
        if corners.is_empty() {
            return None;
        }
        let smooth = gaussian_blur_f32(&gray, self.blur_sigma);
        let descriptors = corners.iter().map(|c| self.describe(&smooth, c)).collect();
        Some(Signature::Keypoints(descriptors))
    }

    /// Mean Hamming distance over cross-checked matches.
    fn distance(&self, a: &Signature, b: &Signature) -> Option<f64> {
        match (a, b) {
            (Signature::Keypoints(a), Signature::Keypoints(b)) if !a.is_empty() && !b.is_empty() => {
                let matches = cross_checked_matches(a, b);
                if matches.is_empty() {
                    return Some(DESCRIPTOR_BITS as f64);
                }
                let total: u64 = matches.iter().map(|&(_, _, d)| d as u64).sum();
                Some(total as f64 / matches.len() as f64)
            }
            _ => None,
        }
    }
}

/// Point pairs inside the patch, from a xorshift generator.
fn sampling_pattern(seed: u64) -> Vec<(Offset, Offset)> {
    let mut state = seed.max(1);
    let span = (2 * PATCH_RADIUS + 1) as u64;
    let mut offset = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % span) as i32 - PATCH_RADIUS
    };
    (0..DESCRIPTOR_BITS)
        .map(|_| ((offset(), offset()), (offset(), offset())))
        .collect()
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Index and distance of the closest descriptor; the lowest index wins ties.
fn nearest(descriptor: &Descriptor, pool: &[Descriptor]) -> Option<(usize, u32)> {
    pool.iter()
        .enumerate()
        .map(|(index, other)| (index, hamming(descriptor, other)))
        .min_by_key(|&(index, distance)| (distance, index))
}

/// Pairs `(i, j, distance)` where `b[j]` is the nearest neighbour of `a[i]`
/// and `a[i]` is the nearest neighbour of `b[j]`.
pub fn cross_checked_matches(a: &[Descriptor], b: &[Descriptor]) -> Vec<(usize, usize, u32)> {
    let back: Vec<Option<usize>> = b
        .iter()
        .map(|d| nearest(d, a).map(|(i, _)| i))
        .collect();

    a.iter()
        .enumerate()
        .filter_map(|(i, d)| {
            let (j, distance) = nearest(d, b)?;
            (back[j] == Some(i)).then_some((i, j, distance))
        })
        .collect()
}
