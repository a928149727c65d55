//! Output buffer for cropped faces, one fixed-size slot per face.

use anyhow::Result;
use ndarray::{s, Array4, ArrayView3};

use crate::model::FACE_SIZE;

/// Zero-initialised `[N, 512, 512, 3]` buffer filled front to back.
///
/// Capacity grows to exactly what is asked for, never more, and never shrinks.
pub struct FaceSlots {
    data: Array4<f32>,
    next: usize,
}

impl FaceSlots {
    pub fn new(initial: usize) -> Self {
        Self {
            data: Array4::zeros((initial, FACE_SIZE, FACE_SIZE, 3)),
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.shape()[0]
    }

    /// Index of the next slot to be written.
    pub fn cursor(&self) -> usize {
        self.next
    }

    /// Leave the next slot blank, standing in for an image without faces.
    pub fn skip_placeholder(&mut self) {
        self.next += 1;
    }

    /// Grow so that at least `required` slots exist, keeping written slots.
    pub fn ensure_total(&mut self, required: usize) {
        let current = self.capacity();
        if current >= required {
            return;
        }
        log::debug!("growing face slots {} -> {}", current, required);
        let mut grown = Array4::<f32>::zeros((required, FACE_SIZE, FACE_SIZE, 3));
        grown.slice_mut(s![..current, .., .., ..]).assign(&self.data);
        self.data = grown;
    }

    /// Write `face` (`[512, 512, 3]`) into the next slot.
    pub fn push(&mut self, face: ArrayView3<'_, f32>) -> Result<()> {
        anyhow::ensure!(
            self.next < self.capacity(),
            "face slot {} out of range, capacity {}",
            self.next,
            self.capacity()
        );
        anyhow::ensure!(
            face.dim() == (FACE_SIZE, FACE_SIZE, 3),
            "face crop must be {}x{}x3, got {:?}",
            FACE_SIZE,
            FACE_SIZE,
            face.dim()
        );
        self.data.slice_mut(s![self.next, .., .., ..]).assign(&face);
        self.next += 1;
        Ok(())
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}
