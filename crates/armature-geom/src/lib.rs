//! Integer cell geometry for the projection engine crates.
#![forbid(unsafe_code)]

use core::fmt;
use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Cell position inside a grid, in block coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IVec3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl IVec3 {
    pub const ZERO: IVec3 = IVec3 { x: 0, y: 0, z: 0 };

    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn min(self, rhs: IVec3) -> IVec3 {
        IVec3::new(self.x.min(rhs.x), self.y.min(rhs.y), self.z.min(rhs.z))
    }

    #[inline]
    pub fn max(self, rhs: IVec3) -> IVec3 {
        IVec3::new(self.x.max(rhs.x), self.y.max(rhs.y), self.z.max(rhs.z))
    }
}

impl fmt::Display for IVec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.x, self.y, self.z)
    }
}

impl Add for IVec3 {
    type Output = IVec3;
    #[inline]
    fn add(self, rhs: IVec3) -> IVec3 {
        IVec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for IVec3 {
    #[inline]
    fn add_assign(&mut self, rhs: IVec3) {
        *self = *self + rhs;
    }
}

impl Sub for IVec3 {
    type Output = IVec3;
    #[inline]
    fn sub(self, rhs: IVec3) -> IVec3 {
        IVec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl SubAssign for IVec3 {
    #[inline]
    fn sub_assign(&mut self, rhs: IVec3) {
        *self = *self - rhs;
    }
}

impl Neg for IVec3 {
    type Output = IVec3;
    #[inline]
    fn neg(self) -> IVec3 {
        IVec3::new(-self.x, -self.y, -self.z)
    }
}

/// Inclusive integer bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aabb {
    pub min: IVec3,
    pub max: IVec3,
}

impl Aabb {
    /// Box covering every representable cell.
    pub const EVERYTHING: Aabb = Aabb {
        min: IVec3 {
            x: i32::MIN,
            y: i32::MIN,
            z: i32::MIN,
        },
        max: IVec3 {
            x: i32::MAX,
            y: i32::MAX,
            z: i32::MAX,
        },
    };

    #[inline]
    pub const fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn contains(&self, p: IVec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    #[inline]
    pub fn is_everything(&self) -> bool {
        *self == Self::EVERYTHING
    }
}

/// One of the 24 axis-aligned grid rotations, stored as a signed
/// permutation matrix in row-major order. Entries are -1, 0 or 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rotation {
    rows: [[i8; 3]; 3],
}

impl Rotation {
    pub const IDENTITY: Rotation = Rotation {
        rows: [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
    };

    /// Quarter turns around the +X axis.
    pub fn around_x(steps: u8) -> Rotation {
        Self::pow(
            Rotation {
                rows: [[1, 0, 0], [0, 0, -1], [0, 1, 0]],
            },
            steps,
        )
    }

    /// Quarter turns around the +Y axis.
    pub fn around_y(steps: u8) -> Rotation {
        Self::pow(
            Rotation {
                rows: [[0, 0, 1], [0, 1, 0], [-1, 0, 0]],
            },
            steps,
        )
    }

    /// Quarter turns around the +Z axis.
    pub fn around_z(steps: u8) -> Rotation {
        Self::pow(
            Rotation {
                rows: [[0, -1, 0], [1, 0, 0], [0, 0, 1]],
            },
            steps,
        )
    }

    fn pow(step: Rotation, steps: u8) -> Rotation {
        let mut out = Rotation::IDENTITY;
        for _ in 0..(steps % 4) {
            out = step.then(out);
        }
        out
    }

    #[inline]
    pub fn apply(&self, v: IVec3) -> IVec3 {
        let r = &self.rows;
        IVec3::new(
            r[0][0] as i32 * v.x + r[0][1] as i32 * v.y + r[0][2] as i32 * v.z,
            r[1][0] as i32 * v.x + r[1][1] as i32 * v.y + r[1][2] as i32 * v.z,
            r[2][0] as i32 * v.x + r[2][1] as i32 * v.y + r[2][2] as i32 * v.z,
        )
    }

    /// Rotation equivalent to applying `self` first, then `next`.
    pub fn then(&self, next: Rotation) -> Rotation {
        let mut rows = [[0i8; 3]; 3];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                let mut sum = 0i8;
                for k in 0..3 {
                    sum += next.rows[i][k] * self.rows[k][j];
                }
                *cell = sum;
            }
        }
        Rotation { rows }
    }

    /// The inverse rotation (transpose of a signed permutation matrix).
    pub fn inverse(&self) -> Rotation {
        let r = &self.rows;
        Rotation {
            rows: [
                [r[0][0], r[1][0], r[2][0]],
                [r[0][1], r[1][1], r[2][1]],
                [r[0][2], r[1][2], r[2][2]],
            ],
        }
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::IDENTITY
    }
}

/// Rigid integer transform: `apply(v) = rotation * v + translation`.
///
/// Used as a grid pose (grid coordinates into world cell coordinates) and
/// for mapping preview cells into built-grid frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridTransform {
    pub rotation: Rotation,
    pub translation: IVec3,
}

impl GridTransform {
    pub const IDENTITY: GridTransform = GridTransform {
        rotation: Rotation::IDENTITY,
        translation: IVec3::ZERO,
    };

    #[inline]
    pub const fn new(rotation: Rotation, translation: IVec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    #[inline]
    pub const fn from_translation(translation: IVec3) -> Self {
        Self {
            rotation: Rotation::IDENTITY,
            translation,
        }
    }

    #[inline]
    pub fn apply(&self, v: IVec3) -> IVec3 {
        self.rotation.apply(v) + self.translation
    }

    /// Transform equivalent to applying `self` first, then `next`.
    pub fn then(&self, next: GridTransform) -> GridTransform {
        GridTransform {
            rotation: self.rotation.then(next.rotation),
            translation: next.rotation.apply(self.translation) + next.translation,
        }
    }

    pub fn inverse(&self) -> GridTransform {
        let rotation = self.rotation.inverse();
        GridTransform {
            rotation,
            translation: -rotation.apply(self.translation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_vec() -> impl Strategy<Value = IVec3> {
        (-64i32..64, -64i32..64, -64i32..64).prop_map(|(x, y, z)| IVec3::new(x, y, z))
    }

    fn arb_rotation() -> impl Strategy<Value = Rotation> {
        (0u8..4, 0u8..4, 0u8..4).prop_map(|(x, y, z)| {
            Rotation::around_x(x)
                .then(Rotation::around_y(y))
                .then(Rotation::around_z(z))
        })
    }

    fn arb_transform() -> impl Strategy<Value = GridTransform> {
        (arb_rotation(), arb_vec()).prop_map(|(r, t)| GridTransform::new(r, t))
    }

    #[test]
    fn quarter_turns_cycle() {
        assert_eq!(Rotation::around_y(4), Rotation::IDENTITY);
        let v = IVec3::new(1, 2, 3);
        assert_eq!(Rotation::around_y(1).apply(v), IVec3::new(3, 2, -1));
        assert_eq!(Rotation::around_y(2).apply(v), IVec3::new(-1, 2, -3));
    }

    #[test]
    fn aabb_contains_is_inclusive() {
        let b = Aabb::new(IVec3::new(-1, 0, 0), IVec3::new(1, 2, 3));
        assert!(b.contains(IVec3::new(-1, 0, 0)));
        assert!(b.contains(IVec3::new(1, 2, 3)));
        assert!(!b.contains(IVec3::new(2, 0, 0)));
        assert!(Aabb::EVERYTHING.contains(IVec3::new(i32::MIN, 0, i32::MAX)));
    }

    proptest! {
        #[test]
        fn rotation_inverse_roundtrip(r in arb_rotation(), v in arb_vec()) {
            prop_assert_eq!(r.inverse().apply(r.apply(v)), v);
            prop_assert_eq!(r.then(r.inverse()), Rotation::IDENTITY);
        }

        #[test]
        fn transform_inverse_roundtrip(t in arb_transform(), v in arb_vec()) {
            prop_assert_eq!(t.inverse().apply(t.apply(v)), v);
        }

        #[test]
        fn transform_composition_matches_sequential_application(
            a in arb_transform(),
            b in arb_transform(),
            v in arb_vec(),
        ) {
            prop_assert_eq!(a.then(b).apply(v), b.apply(a.apply(v)));
        }
    }
}
