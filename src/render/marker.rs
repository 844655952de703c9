//! Gaze marker drawing

use image::{Rgb, RgbImage};

/// Ring burned onto each frame at the gaze position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GazeMarker {
    radius: u32,
    thickness: u32,
    color: Rgb<u8>,
}

impl GazeMarker {
    #[must_use]
    pub fn new(radius: u32, thickness: u32, color: [u8; 3]) -> Self {
        Self {
            radius,
            thickness: thickness.max(1),
            color: Rgb(color),
        }
    }

    #[must_use]
    pub fn radius(&self) -> u32 {
        self.radius
    }

    /// Draw the ring centred on `(x, y)`; non-finite coordinates draw nothing.
    ///
    /// The stroke is centred on the radius. Pixels outside the frame are
    /// clipped, so gaze slightly off-frame still shows a partial ring.
    pub fn draw(&self, image: &mut RgbImage, x: f64, y: f64) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }

        // Truncate like an integer pixel cast
        let cx = x as i64;
        let cy = y as i64;

        let half = i64::from(self.thickness) / 2;
        let outer = i64::from(self.radius) + half;
        let inner = (i64::from(self.radius) - half).max(0);
        let (outer_sq, inner_sq) = (outer * outer, inner * inner);

        let width = i64::from(image.width());
        let height = i64::from(image.height());

        for py in (cy - outer).max(0)..=(cy + outer).min(height - 1) {
            let dy = py - cy;
            for px in (cx - outer).max(0)..=(cx + outer).min(width - 1) {
                let dx = px - cx;
                let d_sq = dx * dx + dy * dy;
                if d_sq >= inner_sq && d_sq <= outer_sq {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    image.put_pixel(px as u32, py as u32, self.color);
                }
            }
        }
    }
}

impl Default for GazeMarker {
    fn default() -> Self {
        Self::new(20, 10, [255, 0, 0])
    }
}
