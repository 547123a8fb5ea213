//! Five-point face alignment to the 112×112 ArcFace template.

use attend_core::Frame;

pub const ALIGNED_SIZE: usize = 112;

/// InsightFace template: eyes, nose tip, mouth corners.
const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Rotation + uniform scale + translation: `p' = [a -b; b a] p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit mapping `src` onto `dst`.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (msx, msy) = centroid(src);
        let (mdx, mdy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-6 {
            return None;
        }

        let (a, b) = (dot / norm, cross / norm);
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample; pixels outside the frame read as black.
fn sample(frame: &Frame, x: f32, y: f32) -> f32 {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let pixel = |px: i64, py: i64| {
        if px < 0 || py < 0 || px >= w || py >= h {
            0.0
        } else {
            frame.data.get((py * w + px) as usize).copied().unwrap_or(0) as f32
        }
    };

    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1, y0) * fx;
    let bottom = pixel(x0, y0 + 1) * (1.0 - fx) + pixel(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Warp the face described by `landmarks` into a 112×112 crop.
///
/// Degenerate landmarks (all on one point) produce a black crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    let Some(back) = Similarity::estimate(landmarks, &TEMPLATE).and_then(|m| m.invert()) else {
        return out;
    };

    for (i, px) in out.iter_mut().enumerate() {
        let (ox, oy) = ((i % ALIGNED_SIZE) as f32, (i / ALIGNED_SIZE) as f32);
        let (sx, sy) = back.apply((ox, oy));
        *px = sample(frame, sx, sy).round().clamp(0.0, 255.0) as u8;
    }
    out
}
