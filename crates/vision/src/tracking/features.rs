//! Corner seeding inside a detection box.

use image::GrayImage;
use ml_core::BoundingBox;

use super::motion::Point2;

/// Picks trackable points inside `roi`. Returned points are in full-image
/// coordinates; an empty result is allowed.
pub trait FeatureExtractor: Send {
    fn extract(&self, image: &GrayImage, roi: &BoundingBox) -> Vec<Point2>;
}
