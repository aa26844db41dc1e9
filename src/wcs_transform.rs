// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Bidirectional pixel/sky conversion for one plate solution. The solution's
//! scale, orientation and parity are expanded back into a linear transform
//! feeding a tangent-plane (TAN) projection, so every backend's solution
//! converts through the same math.

use crate::solution::{normalize_ra, ImagePos, Parity, SkyCoord, Solution,
                      StarRecord};

/// Pure transform built from exactly one `Solution`. Cheap to copy, safe to
/// share across threads for concurrent read-only use.
#[derive(Clone, Copy, Debug)]
pub struct WcsTransform {
    ref_pixel: ImagePos,
    // Degrees; kept in degrees so the reference pixel maps back to the
    // reference coordinate without a radian round trip.
    ra0: f64,
    sin_dec0: f64,
    cos_dec0: f64,
    // Pixel offsets to tangent-plane offsets, degrees/pixel, row major.
    cd: [f64; 4],
    // The inverse, pixels/degree.
    inv: [f64; 4],
}

impl WcsTransform {
    pub fn new(solution: &Solution) -> Self {
        let scale = solution.pixel_scale / 3600.0;
        let theta = solution.orientation.to_radians();
        let (sin_t, cos_t) = theta.sin_cos();

        // +y maps to `scale` along the orientation angle; +x completes an
        // orthogonal frame whose handedness encodes parity.
        let cd12 = scale * sin_t;
        let cd22 = scale * cos_t;
        let (cd11, cd21) = match solution.parity {
            Parity::Normal => (-scale * cos_t, scale * sin_t),
            Parity::Flipped => (scale * cos_t, -scale * sin_t),
        };

        let det = cd11 * cd22 - cd12 * cd21;
        let inv = [cd22 / det, -cd12 / det, -cd21 / det, cd11 / det];
        let dec0_rad = solution.ref_sky.dec.to_radians();
        WcsTransform {
            ref_pixel: solution.ref_pixel,
            ra0: solution.ref_sky.ra,
            sin_dec0: dec0_rad.sin(),
            cos_dec0: dec0_rad.cos(),
            cd: [cd11, cd12, cd21, cd22],
            inv,
        }
    }

    /// Converts an image position to its sky coordinate (degrees).
    pub fn pixel_to_sky(&self, pixel: ImagePos) -> SkyCoord {
        let dx = pixel.x - self.ref_pixel.x;
        let dy = pixel.y - self.ref_pixel.y;
        let xi = (self.cd[0] * dx + self.cd[1] * dy).to_radians();
        let eta = (self.cd[2] * dx + self.cd[3] * dy).to_radians();

        let ra = self.ra0
            + xi.atan2(self.cos_dec0 - eta * self.sin_dec0).to_degrees();
        let dec = ((self.sin_dec0 + eta * self.cos_dec0)
            / (1.0 + xi * xi + eta * eta).sqrt())
        .asin()
        .to_degrees();

        SkyCoord { ra: normalize_ra(ra), dec }
    }

    /// Converts a sky coordinate (degrees) to its image position. Input is
    /// wrapped/clamped into range first; the projection itself never fails.
    pub fn sky_to_pixel(&self, sky: SkyCoord) -> ImagePos {
        let sky = sky.normalized();
        let dec = sky.dec.to_radians();
        let dra = (sky.ra - self.ra0).to_radians();

        let mut denom = dec.sin() * self.sin_dec0
            + dec.cos() * self.cos_dec0 * dra.cos();
        // Positions approaching 90 degrees from the tangent point project
        // to infinity; pin the denominator so the math stays finite.
        if denom.abs() < 1e-9 {
            denom = if denom < 0.0 { -1e-9 } else { 1e-9 };
        }
        let xi = (dec.cos() * dra.sin() / denom).to_degrees();
        let eta = ((dec.sin() * self.cos_dec0
            - dec.cos() * self.sin_dec0 * dra.cos())
            / denom)
            .to_degrees();

        ImagePos {
            x: self.ref_pixel.x + self.inv[0] * xi + self.inv[1] * eta,
            y: self.ref_pixel.y + self.inv[2] * xi + self.inv[3] * eta,
        }
    }

    /// Back-fills sky coordinates into an extracted star list.
    pub fn annotate_stars(&self, stars: &mut [StarRecord]) {
        for star in stars {
            star.sky = Some(self.pixel_to_sky(star.pixel));
        }
    }
}

// mod tests.
