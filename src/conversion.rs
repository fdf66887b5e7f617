//! Conversion of parry3d shapes into [`RawGeometryElement`]s.
use bevy::{
    log::warn,
    math::{Affine3A, Vec3},
};
use parry3d::{
    math::{Isometry, Point, Real},
    shape::TypedShape,
};

use crate::{geometry::RawGeometryElement, Area};

const SUBDIVISIONS: u32 = 5;

#[derive(Default)]
struct Triangles {
    vertices: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
}

impl Triangles {
    fn extend(&mut self, isometry: &Isometry<Real>, vertices: &[Point<Real>], triangles: &[[u32; 3]]) {
        let next_index = self.vertices.len() as u32;

        self.vertices.extend(vertices.iter().map(|point| {
            let point = isometry.transform_point(point);
            Vec3::new(point.x, point.y, point.z)
        }));
        self.triangles.extend(
            triangles
                .iter()
                .map(|triangle| triangle.map(|index| index + next_index)),
        );
    }
}

/// Converts ``shape`` into a single instance element transformed by ``transform``.
///
/// Returns ``None`` for shapes without triangles. Rounded shapes use their inner shape, half-spaces, polylines & segments are skipped.
pub fn shape_to_geometry_element(
    shape: TypedShape,
    transform: Affine3A,
    area: Option<Area>,
) -> Option<RawGeometryElement> {
    let mut triangles = Triangles::default();
    append_shape(shape, &Isometry::identity(), &mut triangles);

    if triangles.triangles.is_empty() {
        return None;
    }

    Some(
        RawGeometryElement::new(triangles.vertices, triangles.triangles)
            .with_instance_transforms(vec![transform])
            .with_area(area),
    )
}

fn append_shape(shape: TypedShape, isometry: &Isometry<Real>, triangles: &mut Triangles) {
    let (vertices, indices) = match shape {
        TypedShape::Ball(ball) => ball.to_trimesh(SUBDIVISIONS, SUBDIVISIONS),
        TypedShape::Cuboid(cuboid) => cuboid.to_trimesh(),
        TypedShape::Capsule(capsule) => capsule.to_trimesh(SUBDIVISIONS, SUBDIVISIONS),
        TypedShape::TriMesh(trimesh) => {
            triangles.extend(isometry, trimesh.vertices(), trimesh.indices());
            return;
        }
        TypedShape::HeightField(heightfield) => heightfield.to_trimesh(),
        TypedShape::ConvexPolyhedron(polyhedron) => polyhedron.to_trimesh(),
        TypedShape::Cylinder(cylinder) => cylinder.to_trimesh(SUBDIVISIONS),
        TypedShape::Cone(cone) => cone.to_trimesh(SUBDIVISIONS),
        TypedShape::RoundCuboid(round_cuboid) => round_cuboid.inner_shape.to_trimesh(),
        TypedShape::RoundCylinder(round_cylinder) => {
            round_cylinder.inner_shape.to_trimesh(SUBDIVISIONS)
        }
        TypedShape::RoundCone(round_cone) => round_cone.inner_shape.to_trimesh(SUBDIVISIONS),
        TypedShape::RoundConvexPolyhedron(round_polyhedron) => {
            round_polyhedron.inner_shape.to_trimesh()
        }
        TypedShape::Triangle(triangle) => (triangle.vertices().to_vec(), vec![[0, 1, 2]]),
        TypedShape::RoundTriangle(triangle) => {
            (triangle.inner_shape.vertices().to_vec(), vec![[0, 1, 2]])
        }
        TypedShape::Compound(compound) => {
            for (shape_isometry, shape) in compound.shapes() {
                append_shape(shape.as_typed_shape(), &(isometry * shape_isometry), triangles);
            }
            return;
        }
        // Not volumes.
        TypedShape::HalfSpace(_) | TypedShape::Polyline(_) | TypedShape::Segment(_) => return,
        TypedShape::Custom(_) => {
            warn!("Custom shapes are not supported for nav-mesh generation, skipping.");
            return;
        }
    };

    triangles.extend(isometry, &vertices, &indices);
}

#[cfg(test)]
mod tests {
    use parry3d::{
        math::Vector,
        shape::{HalfSpace, SharedShape},
    };

    use super::*;

    #[test]
    fn cuboid_keeps_transform_as_instance() {
        let shape = SharedShape::cuboid(1.0, 1.0, 1.0);
        let transform = Affine3A::from_translation(Vec3::new(5.0, 0.0, 0.0));

        let element = shape_to_geometry_element(shape.as_typed_shape(), transform, Some(Area(2)))
            .expect("Cuboids have triangles.");

        assert_eq!(element.triangles.len(), 12);
        assert_eq!(element.instance_count(), 1);
        assert_eq!(element.area, Some(Area(2)));

        let bounds = element.bounds().unwrap();
        assert_eq!(Vec3::from(bounds.min), Vec3::new(4.0, -1.0, -1.0));
        assert_eq!(Vec3::from(bounds.max), Vec3::new(6.0, 1.0, 1.0));
    }

    #[test]
    fn compound_parts_are_offset() {
        let shape = SharedShape::compound(vec![
            (
                Isometry::translation(-3.0, 0.0, 0.0),
                SharedShape::cuboid(1.0, 1.0, 1.0),
            ),
            (
                Isometry::translation(3.0, 0.0, 0.0),
                SharedShape::cuboid(1.0, 1.0, 1.0),
            ),
        ]);

        let element =
            shape_to_geometry_element(shape.as_typed_shape(), Affine3A::IDENTITY, Some(Area(0)))
                .unwrap();

        assert_eq!(element.triangles.len(), 24);
        assert!(element
            .triangles
            .iter()
            .flatten()
            .all(|index| (*index as usize) < element.vertices.len()));

        let bounds = element.bounds().unwrap();
        assert_eq!(bounds.min.x, -4.0);
        assert_eq!(bounds.max.x, 4.0);
    }

    #[test]
    fn half_spaces_are_skipped() {
        let shape = SharedShape::new(HalfSpace::new(Vector::y_axis()));

        assert!(
            shape_to_geometry_element(shape.as_typed_shape(), Affine3A::IDENTITY, None).is_none()
        );
    }
}
