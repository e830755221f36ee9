//! Five-point face alignment.
//!
//! Fits a similarity transform (rotation, uniform scale, translation) from
//! the detected landmarks onto the canonical ArcFace template and warps the
//! photo into the 112×112 recognizer input.

use image::{Rgb, RgbImage};

/// Side of the aligned face crop.
pub const ALIGNED_SIZE: u32 = 112;

/// Landmark positions of the ArcFace training crops at 112×112: left eye,
/// right eye, nose tip, left and right mouth corner.
pub const ARCFACE_TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `(x, y) -> (a·x - b·y + tx, b·x + a·y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `from[i]` onto `to[i]`.
    ///
    /// Degenerate input (all points coincide) yields the identity.
    pub fn fit(from: &[(f32, f32)], to: &[(f32, f32)]) -> Similarity {
        let n = from.len().min(to.len());
        if n == 0 {
            return Self::IDENTITY;
        }

        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0f64, 0.0f64), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
            (sx / n as f64, sy / n as f64)
        };
        let (fx, fy) = centroid(from);
        let (gx, gy) = centroid(to);

        let (mut dot, mut cross, mut spread) = (0.0f64, 0.0f64, 0.0f64);
        for (&(x, y), &(u, v)) in from.iter().zip(to.iter()).take(n) {
            let (px, py) = (x as f64 - fx, y as f64 - fy);
            let (qx, qy) = (u as f64 - gx, v as f64 - gy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            spread += px * px + py * py;
        }
        if spread < 1e-12 {
            return Self::IDENTITY;
        }

        let a = dot / spread;
        let b = cross / spread;
        Similarity {
            a: a as f32,
            b: b as f32,
            tx: (gx - (a * fx - b * fy)) as f32,
            ty: (gy - (b * fx + a * fy)) as f32,
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// The reverse mapping, or `None` for a zero-scale transform.
    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Warp `image` so its landmarks land on [`ARCFACE_TEMPLATE`].
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::fit(landmarks, &ARCFACE_TEMPLATE);
    warp(image, &transform, ALIGNED_SIZE)
}

/// Render a `size`×`size` output where each pixel samples the source at the
/// inverse-transformed position. Pixels mapping outside the source are black.
pub fn warp(image: &RgbImage, transform: &Similarity, size: u32) -> RgbImage {
    let Some(back) = transform.inverse() else {
        return RgbImage::new(size, size);
    };
    RgbImage::from_fn(size, size, |x, y| {
        let (sx, sy) = back.apply((x as f32, y as f32));
        sample(image, sx, sy)
    })
}

/// Bilinear sample; neighbours outside the image count as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let texel = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= width || py >= height {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let (tl, tr) = (texel(x0, y0), texel(x0 + 1, y0));
    let (bl, br) = (texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] + (tr[c] - tl[c]) * fx;
        let bottom = bl[c] + (br[c] - bl[c]) * fx;
        out[c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&ARCFACE_TEMPLATE, &ARCFACE_TEMPLATE);
        assert!((t.a - 1.0).abs() < 1e-5);
        assert!(t.b.abs() < 1e-5);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_rotation_shift() {
        let expected = Similarity {
            a: 0.4,
            b: 0.3,
            tx: 12.0,
            ty: -7.0,
        };
        let from = [(100.0, 80.0), (180.0, 85.0), (140.0, 130.0), (110.0, 170.0), (175.0, 168.0)];
        let to: Vec<(f32, f32)> = from.iter().map(|&p| expected.apply(p)).collect();

        let t = Similarity::fit(&from, &to);
        assert!((t.a - 0.4).abs() < 1e-4);
        assert!((t.b - 0.3).abs() < 1e-4);
        for (&p, &q) in from.iter().zip(to.iter()) {
            assert!(close(t.apply(p), q));
        }
    }

    #[test]
    fn test_fit_degenerate_points() {
        let same = [(5.0, 5.0); 5];
        assert_eq!(Similarity::fit(&same, &ARCFACE_TEMPLATE), Similarity::IDENTITY);
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Similarity {
            a: 2.0,
            b: -1.0,
            tx: 3.0,
            ty: 4.0,
        };
        let back = t.inverse().unwrap();
        assert!(close(back.apply(t.apply((10.0, -6.0))), (10.0, -6.0)));

        let flat = Similarity {
            a: 0.0,
            b: 0.0,
            tx: 1.0,
            ty: 1.0,
        };
        assert!(flat.inverse().is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([90, 90, 90]));
        let landmarks = [(300.0, 200.0), (360.0, 200.0), (330.0, 240.0), (305.0, 280.0), (355.0, 280.0)];
        assert_eq!(align_face(&image, &landmarks).dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_align_face_moves_nose_to_template() {
        // Landmarks at twice the template scale, shifted by (50, 40).
        let landmarks: [(f32, f32); 5] =
            std::array::from_fn(|i| (ARCFACE_TEMPLATE[i].0 * 2.0 + 50.0, ARCFACE_TEMPLATE[i].1 * 2.0 + 40.0));
        let mut image = RgbImage::new(400, 400);
        let (nx, ny) = (landmarks[2].0 as u32, landmarks[2].1 as u32);
        for y in ny - 6..=ny + 6 {
            for x in nx - 6..=nx + 6 {
                image.put_pixel(x, y, Rgb([255, 40, 0]));
            }
        }

        let aligned = align_face(&image, &landmarks);
        let nose = aligned.get_pixel(ARCFACE_TEMPLATE[2].0 as u32, ARCFACE_TEMPLATE[2].1 as u32);
        assert_eq!(nose[0], 255);
        assert!(nose[2] < 10);
        assert_eq!(aligned.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_warp_outside_source_is_black() {
        let image = RgbImage::from_pixel(10, 10, Rgb([200, 200, 200]));
        let shifted = Similarity {
            tx: 500.0,
            ..Similarity::IDENTITY
        };
        let out = warp(&image, &shifted, 16);
        assert!(out.pixels().all(|p| p == &Rgb([0, 0, 0])));
    }
}
