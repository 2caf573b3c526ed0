use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Type-level marker for the physical (CRTC) coordinate space
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// A point as defined by its x and y coordinates
///
/// Coordinates are integers: the display hardware addresses whole pixels
/// on both the buffer and the CRTC side.
#[repr(C)]
pub struct Point<Kind> {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Point<Kind> {
    /// Create a new point
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<Kind> From<(i32, i32)> for Point<Kind> {
    #[inline]
    fn from((x, y): (i32, i32)) -> Self {
        Point::new(x, y)
    }
}

impl<Kind> Add for Point<Kind> {
    type Output = Point<Kind>;
    #[inline]
    fn add(self, other: Point<Kind>) -> Point<Kind> {
        Point::new(self.x.saturating_add(other.x), self.y.saturating_add(other.y))
    }
}

impl<Kind> Sub for Point<Kind> {
    type Output = Point<Kind>;
    #[inline]
    fn sub(self, other: Point<Kind>) -> Point<Kind> {
        Point::new(self.x.saturating_sub(other.x), self.y.saturating_sub(other.y))
    }
}

impl<Kind> Clone for Point<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Point<Kind> {}

impl<Kind> PartialEq for Point<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<Kind> Eq for Point<Kind> {}

impl<Kind> Default for Point<Kind> {
    #[inline]
    fn default() -> Self {
        Point::new(0, 0)
    }
}

impl<Kind> fmt::Debug for Point<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point").field("x", &self.x).field("y", &self.y).finish()
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive,
/// negative values are clamped to zero.
#[repr(C)]
pub struct Size<Kind> {
    /// horizontal coordinate
    pub w: i32,
    /// vertical coordinate
    pub h: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Size<Kind> {
    /// Create a new size, clamping negative dimensions to zero
    #[inline]
    pub const fn new(w: i32, h: i32) -> Self {
        Size {
            w: if w < 0 { 0 } else { w },
            h: if h < 0 { 0 } else { h },
            _kind: PhantomData,
        }
    }

    /// Check if this [`Size`] is empty
    ///
    /// Returns true if either the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Number of pixels covered by this size
    #[inline]
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

impl<Kind> From<(i32, i32)> for Size<Kind> {
    #[inline]
    fn from((w, h): (i32, i32)) -> Self {
        Size::new(w, h)
    }
}

impl<Kind> Clone for Size<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Size<Kind> {}

impl<Kind> PartialEq for Size<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<Kind> Eq for Size<Kind> {}

impl<Kind> Default for Size<Kind> {
    #[inline]
    fn default() -> Self {
        Size::new(0, 0)
    }
}

impl<Kind> fmt::Debug for Size<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size").field("w", &self.w).field("h", &self.h).finish()
    }
}

/// A rectangle defined by its top-left corner and dimensions
///
/// Operations on rectangles are saturating.
#[repr(C)]
pub struct Rectangle<Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<Kind>,
}

impl<Kind> Rectangle<Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<Kind>>, size: impl Into<Size<Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from its dimensions, with location zero
    #[inline]
    pub fn from_size(size: impl Into<Size<Kind>>) -> Self {
        Rectangle {
            loc: Point::default(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(topleft: impl Into<Point<Kind>>, bottomright: impl Into<Point<Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: Size::new(
                bottomright.x.saturating_sub(topleft.x),
                bottomright.y.saturating_sub(topleft.y),
            ),
        }
    }

    /// Check if this [`Rectangle`] is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Exclusive right edge
    #[inline]
    pub fn right(&self) -> i32 {
        self.loc.x.saturating_add(self.size.w)
    }

    /// Exclusive bottom edge
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Touching edges are not considered an overlap.
    pub fn overlaps(self, other: impl Into<Rectangle<Kind>>) -> bool {
        let other = other.into();
        self.loc.x < other.right()
            && other.loc.x < self.right()
            && self.loc.y < other.bottom()
            && other.loc.y < self.bottom()
    }

    /// Clamp rectangle to min and max corners resulting in the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    pub fn intersection(self, other: impl Into<Rectangle<Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (self.right().min(other.right()), self.bottom().min(other.bottom())),
        ))
    }

    /// Merge two [`Rectangle`] by producing the smallest rectangle that contains both
    ///
    /// An empty rectangle does not contribute to the result.
    pub fn merge(self, other: Self) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rectangle::from_extremities(
            (self.loc.x.min(other.loc.x), self.loc.y.min(other.loc.y)),
            (self.right().max(other.right()), self.bottom().max(other.bottom())),
        )
    }
}

impl<Kind> fmt::Debug for Rectangle<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<Kind> Clone for Rectangle<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Rectangle<Kind> {}

impl<Kind> PartialEq for Rectangle<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<Kind> Eq for Rectangle<Kind> {}

impl<Kind> Default for Rectangle<Kind> {
    #[inline]
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
/// Possible transformations applied by a window while scanning out a buffer
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

#[cfg(test)]
mod tests {
    use super::{Physical, Rectangle};

    #[test]
    fn rectangle_intersection() {
        let a = Rectangle::<Physical>::from_loc_and_size((0, 0), (100, 100));
        let b = Rectangle::<Physical>::from_loc_and_size((50, 50), (100, 100));
        assert_eq!(
            a.intersection(b),
            Some(Rectangle::from_loc_and_size((50, 50), (50, 50)))
        );

        let c = Rectangle::<Physical>::from_loc_and_size((100, 0), (10, 10));
        assert_eq!(a.intersection(c), None);
    }

    #[test]
    fn rectangle_merge_ignores_empty() {
        let a = Rectangle::<Physical>::from_loc_and_size((10, 10), (20, 20));
        let empty = Rectangle::<Physical>::default();
        assert_eq!(empty.merge(a), a);
        assert_eq!(a.merge(empty), a);

        let b = Rectangle::<Physical>::from_loc_and_size((40, 0), (10, 10));
        assert_eq!(a.merge(b), Rectangle::from_loc_and_size((10, 0), (40, 30)));
    }

    #[test]
    fn negative_sizes_are_clamped() {
        let rect = Rectangle::<Physical>::from_extremities((10, 10), (0, 0));
        assert!(rect.is_empty());
    }
}
