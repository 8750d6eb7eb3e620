use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle on the XZ plane. `min.y` / `max.y` hold world Z.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Rectangle with its corner at `(x, z)` extending by `width` / `depth`.
    pub fn from_xz(x: f32, z: f32, width: f32, depth: f32) -> Self {
        Self::new(Vec2::new(x, z), Vec2::new(x + width, z + depth))
    }

    pub fn from_center_size(center: Vec2, size: Vec2) -> Self {
        let half = size.abs() * 0.5;
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    pub fn area(&self) -> f32 {
        let s = self.size();
        s.x * s.y
    }

    /// Strict overlap: rectangles that only share an edge do not overlap.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
    }

    /// Inclusive containment of another rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.min.x >= self.min.x
            && other.max.x <= self.max.x
            && other.min.y >= self.min.y
            && other.max.y <= self.max.y
    }

    /// Half-open containment, so a point on a shared edge belongs to one cell only.
    pub fn contains_point(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x < self.max.x && p.y >= self.min.y && p.y < self.max.y
    }

    pub fn contains_position(&self, position: Vec3) -> bool {
        self.contains_point(Vec2::new(position.x, position.z))
    }

    /// Grow (or shrink, for negative margins) on every side.
    pub fn expand(&self, margin: f32) -> Self {
        Self::new(self.min - Vec2::splat(margin), self.max + Vec2::splat(margin))
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Split into four equal quadrants: SW, SE, NW, NE.
    pub fn quadrants(&self) -> [Rect; 4] {
        let c = self.center();
        [
            Rect::new(self.min, c),
            Rect::new(Vec2::new(c.x, self.min.y), Vec2::new(self.max.x, c.y)),
            Rect::new(Vec2::new(self.min.x, c.y), Vec2::new(c.x, self.max.y)),
            Rect::new(c, self.max),
        ]
    }
}
