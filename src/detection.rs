/// Axis-aligned box in absolute pixel coordinates of the source image,
/// `x`/`y` being the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Builds a box from corner coordinates, clamped to `[0, max_x] x [0, max_y]`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, max_x: f32, max_y: f32) -> Self {
        let x1 = x1.clamp(0., max_x);
        let y1 = y1.clamp(0., max_y);
        let x2 = x2.clamp(0., max_x);
        let y2 = y2.clamp(0., max_y);

        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.),
            height: (y2 - y1).max(0.),
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        w.max(0.) * h.max(0.)
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection(other) / union
    }

    pub fn to_xywh(&self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_corners_clamps_to_image() {
        let bbox = BoundingBox::from_corners(-10., 5., 120., 60., 100., 50.);

        assert_eq!(bbox.to_xywh(), [0., 5., 100., 45.]);
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::from_corners(0., 0., 10., 10., 100., 100.);
        let b = BoundingBox::from_corners(5., 0., 15., 10., 100., 100.);
        let c = BoundingBox::from_corners(50., 50., 60., 60., 100., 100.);

        assert!((a.iou(&b) - 50. / 150.).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.);
        assert_eq!(a.iou(&a), 1.);
    }
}
