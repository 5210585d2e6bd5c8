use image::DynamicImage;
use image::imageops::FilterType;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::keypoints::{Descriptor, KeypointMatcher};

/// Opaque comparable value derived from an image.
#[derive(Debug, Clone, PartialEq)]
pub enum Signature {
    /// Perceptual hash, compared by Hamming distance.
    Hash(ImageHash),
    /// Normalized luminance per tile, compared by mean absolute difference.
    Tiles(Vec<f32>),
    /// Binary descriptors of the strongest keypoints.
    Keypoints(Vec<Descriptor>),
}

/// Signature computation and comparison for one method.
pub trait Vision: Send + Sync {
    /// `None` when the image yields nothing comparable.
    fn compute_signature(&self, image: &DynamicImage) -> Option<Signature>;

    /// `None` when the two signatures cannot be compared.
    fn distance(&self, a: &Signature, b: &Signature) -> Option<f64>;
}

/// Selectable signature methods.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// DCT perceptual hash
    #[value(name = "phash")]
    PHash,
    /// Gradient (difference) hash
    #[value(name = "dhash")]
    DHash,
    /// Mean hash
    #[value(name = "ahash")]
    AHash,
    /// Blockhash.io algorithm
    #[value(name = "blockhash")]
    Blockhash,
    /// Tile luminance descriptor
    #[value(name = "tiles")]
    Tiles,
    /// FAST keypoints with binary descriptors, cross-checked matching
    #[value(name = "orb")]
    Orb,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::PHash,
        Method::DHash,
        Method::AHash,
        Method::Blockhash,
        Method::Tiles,
        Method::Orb,
    ];

    pub fn vision(self) -> Box<dyn Vision> {
        match self {
            Method::PHash => Box::new(PerceptualHash::new(HashAlg::Mean, true)),
            Method::DHash => Box::new(PerceptualHash::new(HashAlg::Gradient, false)),
            Method::AHash => Box::new(PerceptualHash::new(HashAlg::Mean, false)),
            Method::Blockhash => Box::new(PerceptualHash::new(HashAlg::Blockhash, false)),
            Method::Tiles => Box::new(TileDescriptor::default()),
            Method::Orb => Box::new(KeypointMatcher::default()),
        }
    }

    /// Unit the method's distances are expressed in.
    pub fn scale(self) -> &'static str {
        match self {
            Method::Tiles => "mean tile difference (0..1)",
            Method::Orb => "mean hamming bits per matched keypoint (0..256)",
            _ => "hamming bits",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::PHash => "phash",
            Method::DHash => "dhash",
            Method::AHash => "ahash",
            Method::Blockhash => "blockhash",
            Method::Tiles => "tiles",
            Method::Orb => "orb",
        };
        f.write_str(name)
    }
}

/// Hash-based capability backed by `image_hasher`. Cheap and coarse.
pub struct PerceptualHash {
    hasher: Hasher,
}

impl PerceptualHash {
    pub fn new(alg: HashAlg, dct: bool) -> Self {
        let mut config = HasherConfig::new().hash_alg(alg).hash_size(8, 8);
        if dct {
            config = config.preproc_dct();
        }
        Self {
            hasher: config.to_hasher(),
        }
    }
}

impl Vision for PerceptualHash {
    fn compute_signature(&self, image: &DynamicImage) -> Option<Signature> {
        let hash = self.hasher.hash_image(image);
        if hash.as_bytes().is_empty() {
            return None;
        }
        Some(Signature::Hash(hash))
    }

    fn distance(&self, a: &Signature, b: &Signature) -> Option<f64> {
        match (a, b) {
            (Signature::Hash(a), Signature::Hash(b))
                if a.as_bytes().len() == b.as_bytes().len() =>
            {
                Some(a.dist(b) as f64)
            }
            _ => None,
        }
    }
}

/// Descriptor-based capability: the image is resampled onto a square grid
/// and every tile keeps its mean luminance. Finer than the hashes and
/// measured on a 0..1 scale.
pub struct TileDescriptor {
    grid: u32,
}

impl TileDescriptor {
    pub fn new(grid: u32) -> Self {
        Self { grid: grid.max(1) }
    }
}

impl Default for TileDescriptor {
    fn default() -> Self {
        Self::new(16)
    }
}

impl Vision for TileDescriptor {
    fn compute_signature(&self, image: &DynamicImage) -> Option<Signature> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let tiles = image
            .resize_exact(self.grid, self.grid, FilterType::Triangle)
            .to_luma8();
        let values = tiles.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        Some(Signature::Tiles(values))
    }

    fn distance(&self, a: &Signature, b: &Signature) -> Option<f64> {
        match (a, b) {
            (Signature::Tiles(a), Signature::Tiles(b)) if a.len() == b.len() && !a.is_empty() => {
                let sum: f64 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y).abs() as f64)
                    .sum();
                Some(sum / a.len() as f64)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            Rgb([v, v, v])
        }))
    }

    /// Bright rectangles on a dark background; every method finds
    /// something to work with here.
    fn blocks() -> DynamicImage {
        let rects = [(20, 20, 30, 25), (70, 30, 40, 20), (40, 70, 25, 35), (100, 80, 30, 25)];
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(160, 128, |x, y| {
            let inside = rects
                .iter()
                .any(|&(rx, ry, w, h)| x >= rx && x < rx + w && y >= ry && y < ry + h);
            let v = if inside { 220 } else { 30 };
            Rgb([v, v, v])
        }))
    }

    fn hash(bytes: &[u8]) -> Signature {
        Signature::Hash(ImageHash::<Box<[u8]>>::from_bytes(bytes).unwrap())
    }

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            let v = if (x / 8 + y / 8) % 2 == 0 { 0 } else { 255 };
            Rgb([v, v, v])
        }))
    }

    #[test]
    fn test_identical_images_have_zero_distance() {
        for method in Method::ALL {
            let vision = method.vision();
            let a = vision.compute_signature(&blocks()).unwrap();
            let b = vision.compute_signature(&blocks()).unwrap();
            assert_eq!(vision.distance(&a, &b), Some(0.0), "method {method}");
        }
    }

    #[test]
    fn test_tiles_distance_grows_with_difference() {
        let vision = TileDescriptor::default();
        let a = vision.compute_signature(&gradient(64, 64)).unwrap();
        let b = vision.compute_signature(&checkerboard(64, 64)).unwrap();
        let d = vision.distance(&a, &b).unwrap();
        assert!(d > 0.04, "distance {d}");
        assert!(d <= 1.0);
    }

    #[test]
    fn test_mismatched_signatures_are_incomparable() {
        let hash = PerceptualHash::new(HashAlg::Mean, false);
        let bits = self::hash(&[0u8; 8]);
        let short = self::hash(&[0u8; 4]);
        let tiles = Signature::Tiles(vec![0.0; 4]);

        assert_eq!(hash.distance(&bits, &short), None);
        assert_eq!(hash.distance(&bits, &tiles), None);
        assert_eq!(TileDescriptor::default().distance(&tiles, &bits), None);
    }

    #[test]
    fn test_hamming_counts_bits() {
        let hash = PerceptualHash::new(HashAlg::Mean, false);
        let a = self::hash(&[0b0000_0000, 0b1111_0000]);
        let b = self::hash(&[0b0000_0011, 0b1111_0001]);
        assert_eq!(hash.distance(&a, &b), Some(3.0));
    }

    #[test]
    fn test_method_names_round_trip_through_serde() {
        let json = serde_json::to_string(&Method::PHash).unwrap();
        assert_eq!(json, "\"phash\"");
        assert_eq!(Method::PHash.to_string(), "phash");
        assert_eq!(serde_json::to_string(&Method::Orb).unwrap(), "\"orb\"");
    }
}
