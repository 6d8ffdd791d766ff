use crate::model::DopplerImage;
use std::collections::VecDeque;

/// The last few distinct images, oldest first. Used only to tell whether a
/// freshly fetched frame is new.
#[derive(Debug)]
pub struct ImageChangeCache {
    capacity: usize,
    images: VecDeque<DopplerImage>,
}

impl ImageChangeCache {
    /// `capacity` below one is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            images: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// True when `image` matches any cached image pixel for pixel.
    pub fn is_unchanged(&self, image: &DopplerImage) -> bool {
        self.images.iter().any(|cached| cached.same_pixels(image))
    }

    pub fn insert(&mut self, image: DopplerImage) {
        if self.images.len() == self.capacity {
            self.images.pop_front();
        }
        self.images.push_back(image);
    }

    /// Caches `image` unless it is unchanged. Returns whether it was new.
    pub fn observe(&mut self, image: &DopplerImage) -> bool {
        if self.is_unchanged(image) {
            return false;
        }
        self.insert(image.clone());
        true
    }
}
