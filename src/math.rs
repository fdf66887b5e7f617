/*
*   Lots of math stuff shared by the contour, mesher & region passes.
*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

use bevy::math::{IVec2, IVec4, UVec4, Vec2};

/// Index of the cell neighbouring ``index`` in direction ``dir`` in a square grid with sides of ``tile_side``.
#[inline]
pub(crate) fn get_neighbour_index(tile_side: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + tile_side,
        2 => index + 1,
        3 => index - tile_side,
        _ => panic!("Not a valid direction"),
    }
}

/// Cell offset of direction ``dir`` on the XZ-plane.
#[inline]
pub(crate) fn get_direction_offset(dir: usize) -> IVec2 {
    match dir {
        0 => IVec2::new(-1, 0),
        1 => IVec2::new(0, 1),
        2 => IVec2::new(1, 0),
        3 => IVec2::new(0, -1),
        _ => panic!("Not a valid direction"),
    }
}

pub(crate) fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    if a.x != b.x {
        return (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x);
    }

    (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
}

pub(crate) fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

pub(crate) fn area_sqr(a: IVec4, b: IVec4, c: IVec4) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) == 0
}

pub(crate) fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) < 0
}

pub(crate) fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_sqr(a, b, c) <= 0
}

pub(crate) fn in_cone(i: usize, outline_vertices: &[UVec4], point: UVec4) -> bool {
    let point_i = outline_vertices[i];
    let point_next = outline_vertices[(i + 1) % outline_vertices.len()];
    let point_previous =
        outline_vertices[(outline_vertices.len() + i - 1) % outline_vertices.len()];

    if left_on(point_i.as_ivec4(), point.as_ivec4(), point_next.as_ivec4()) {
        return left(
            point_i.as_ivec4(),
            point.as_ivec4(),
            point_previous.as_ivec4(),
        ) && left(point.as_ivec4(), point_i.as_ivec4(), point_next.as_ivec4());
    }

    !left_on(point_i.as_ivec4(), point.as_ivec4(), point_next.as_ivec4())
        && left_on(
            point.as_ivec4(),
            point_i.as_ivec4(),
            point_previous.as_ivec4(),
        )
}

/// Squared distance from ``point`` to the segment ``a``-``b`` on the XZ-plane.
pub(crate) fn distance_sqr_point_segment_2d(point: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let length_sqr = ab.length_squared();

    let t = if length_sqr > 0.0 {
        ((point - a).dot(ab) / length_sqr).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (a + ab * t).distance_squared(point)
}

/// Even-odd point in polygon test on the XZ-plane.
pub(crate) fn point_in_polygon_2d(point: Vec2, polygon: &[Vec2]) -> bool {
    let mut inside = false;

    let mut j = polygon.len().wrapping_sub(1);
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[j];

        if ((a.y > point.y) != (b.y > point.y))
            && (point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x)
        {
            inside = !inside;
        }

        j = i;
    }

    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbour_index_round_trips() {
        let side = 8;
        let index = 3 * side + 4;

        for dir in 0..4 {
            let neighbour = get_neighbour_index(side, index, dir);
            let back = get_neighbour_index(side, neighbour, (dir + 2) % 4);

            assert_eq!(back, index);

            let offset = get_direction_offset(dir);
            let expected = (index as i32 + offset.x + offset.y * side as i32) as usize;
            assert_eq!(neighbour, expected);
        }
    }

    #[test]
    fn point_in_square() {
        let square = [
            Vec2::new(0.0, 0.0),
            Vec2::new(4.0, 0.0),
            Vec2::new(4.0, 4.0),
            Vec2::new(0.0, 4.0),
        ];

        assert!(point_in_polygon_2d(Vec2::new(2.0, 2.0), &square));
        assert!(!point_in_polygon_2d(Vec2::new(5.0, 2.0), &square));
        assert!(!point_in_polygon_2d(Vec2::new(-0.5, -0.5), &square));
    }

    #[test]
    fn segment_distance() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(10.0, 0.0);

        assert_eq!(distance_sqr_point_segment_2d(Vec2::new(5.0, 3.0), a, b), 9.0);
        assert_eq!(distance_sqr_point_segment_2d(Vec2::new(-4.0, 3.0), a, b), 25.0);
    }
}
