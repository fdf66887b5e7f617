//! World geometry fed into tile generation.
//!
//! Geometry is provided to the generator through the [`GeometryProvider`] trait. [`GeometryIndex`] is the provider used by the plugin, but anything that can answer "what intersects this box" works.
use std::{collections::BTreeMap, sync::Arc};

use bevy::{
    math::{
        bounding::{Aabb3d, IntersectsVolume},
        Affine3A, Vec2, Vec3, Vec3A,
    },
    prelude::Resource,
};
use smallvec::SmallVec;

use crate::{
    generator::{DirtyArea, DirtyFlags},
    Area,
};

/// Flags changing how a [`RawGeometryElement`] is rasterized.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RasterizationFlags {
    /// Spans from this geometry extend all the way down to the bottom of the world, making anything underneath unwalkable.
    pub fill_to_bottom: bool,
}

/// A triangle soup with optional per-instance transforms.
#[derive(Clone, Debug, Default)]
pub struct RawGeometryElement {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<[u32; 3]>,
    /// Transforms applied to the vertices, once per instance. When empty the vertices are in world space.
    pub instance_transforms: Vec<Affine3A>,
    /// Area of walkable surfaces. ``None`` means the geometry is never walkable.
    pub area: Option<Area>,
    pub flags: RasterizationFlags,
}

impl RawGeometryElement {
    pub fn new(vertices: Vec<Vec3>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            triangles,
            instance_transforms: Vec::new(),
            area: Some(Area(0)),
            flags: RasterizationFlags::default(),
        }
    }

    pub fn with_instance_transforms(mut self, instance_transforms: Vec<Affine3A>) -> Self {
        self.instance_transforms = instance_transforms;

        self
    }

    pub fn with_area(mut self, area: Option<Area>) -> Self {
        self.area = area;

        self
    }

    pub fn with_flags(mut self, flags: RasterizationFlags) -> Self {
        self.flags = flags;

        self
    }

    /// Number of times the triangles are rasterized.
    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instance_transforms.len().max(1)
    }

    /// Returns the transform of ``instance``. Identity when there are no instance transforms.
    #[inline]
    pub fn instance_transform(&self, instance: usize) -> Affine3A {
        self.instance_transforms
            .get(instance)
            .copied()
            .unwrap_or(Affine3A::IDENTITY)
    }

    /// World space bounds of all instances. ``None`` if there are no vertices.
    pub fn bounds(&self) -> Option<Aabb3d> {
        let local = aabb_from_points(self.vertices.iter().copied())?;
        if self.instance_transforms.is_empty() {
            return Some(local);
        }

        let corners = self.instance_transforms.iter().flat_map(|transform| {
            let min = Vec3::from(local.min);
            let max = Vec3::from(local.max);

            (0..8).map(move |i| {
                let corner = Vec3::new(
                    if i & 1 == 0 { min.x } else { max.x },
                    if i & 2 == 0 { min.y } else { max.y },
                    if i & 4 == 0 { min.z } else { max.z },
                );

                transform.transform_point3(corner)
            })
        });

        aabb_from_points(corners)
    }
}

/// Smallest box containing all ``points``. ``None`` if empty.
pub fn aabb_from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Aabb3d> {
    let mut points = points.into_iter();
    let first = Vec3A::from(points.next()?);

    let (min, max) = points.fold((first, first), |(min, max), point| {
        let point = Vec3A::from(point);
        (min.min(point), max.max(point))
    });

    Some(Aabb3d { min, max })
}

/// How an [`AreaModifier`] changes the area of spans inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaModifierMode {
    /// Sets the area of every walkable span inside the shape.
    Overwrite,
    /// Only changes spans currently tagged with the given area.
    Replace(Area),
}

#[derive(Clone, Debug, PartialEq)]
pub enum AreaModifierShape {
    /// Vertical cylinder standing on ``base``.
    Cylinder { base: Vec3, radius: f32, height: f32 },
    /// Axis aligned box.
    Box { min: Vec3, max: Vec3 },
    /// Convex polygon on the XZ-plane extruded between ``min_y`` and ``max_y``.
    Convex {
        points: Vec<Vec2>,
        min_y: f32,
        max_y: f32,
    },
}

impl AreaModifierShape {
    pub fn bounds(&self) -> Aabb3d {
        match self {
            AreaModifierShape::Cylinder {
                base,
                radius,
                height,
            } => Aabb3d {
                min: Vec3A::new(base.x - radius, base.y, base.z - radius),
                max: Vec3A::new(base.x + radius, base.y + height, base.z + radius),
            },
            AreaModifierShape::Box { min, max } => Aabb3d {
                min: (*min).into(),
                max: (*max).into(),
            },
            AreaModifierShape::Convex {
                points,
                min_y,
                max_y,
            } => {
                let (min, max) = points.iter().fold(
                    (Vec2::splat(f32::MAX), Vec2::splat(f32::MIN)),
                    |(min, max), point| (min.min(*point), max.max(*point)),
                );

                Aabb3d {
                    min: Vec3A::new(min.x, *min_y, min.y),
                    max: Vec3A::new(max.x, *max_y, max.y),
                }
            }
        }
    }
}

/// Volume that changes the area of the nav-mesh inside it without requiring the geometry to be re-voxelized.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaModifier {
    pub shape: AreaModifierShape,
    /// Area to apply. ``None`` makes the volume unwalkable.
    pub area: Option<Area>,
    pub mode: AreaModifierMode,
    /// Extends the volume downwards by the agent height so agents can't stand just beneath it.
    pub include_agent_height: bool,
}

impl AreaModifier {
    pub fn new(shape: AreaModifierShape, area: Option<Area>) -> Self {
        Self {
            shape,
            area,
            mode: AreaModifierMode::Overwrite,
            include_agent_height: false,
        }
    }

    pub fn with_mode(mut self, mode: AreaModifierMode) -> Self {
        self.mode = mode;

        self
    }

    pub fn with_agent_height(mut self, include_agent_height: bool) -> Self {
        self.include_agent_height = include_agent_height;

        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OffMeshLinkShape {
    /// Connects two points.
    Point { start: Vec3, end: Vec3 },
    /// Connects two segments, usable along their whole length.
    Segment { start: [Vec3; 2], end: [Vec3; 2] },
}

impl OffMeshLinkShape {
    /// Point used to find which tile & polygon the link starts from.
    pub fn start_anchor(&self) -> Vec3 {
        match self {
            OffMeshLinkShape::Point { start, .. } => *start,
            OffMeshLinkShape::Segment { start, .. } => (start[0] + start[1]) * 0.5,
        }
    }

    pub fn end_anchor(&self) -> Vec3 {
        match self {
            OffMeshLinkShape::Point { end, .. } => *end,
            OffMeshLinkShape::Segment { end, .. } => (end[0] + end[1]) * 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffMeshLinkDirection {
    OneWay,
    Bidirectional,
}

/// A traversable connection between two places on the nav-mesh that aren't connected by walkable surface (ladders, jumps, teleporters).
#[derive(Clone, Debug, PartialEq)]
pub struct OffMeshLink {
    pub shape: OffMeshLinkShape,
    /// Max horizontal distance the link's endpoints snap to the nav-mesh.
    pub snap_radius: f32,
    /// Max vertical distance the link's endpoints snap to the nav-mesh. ``None`` uses ``step_height * cell_height``.
    pub snap_height: Option<f32>,
    pub direction: OffMeshLinkDirection,
    pub area: Area,
}

impl OffMeshLink {
    pub fn bounds(&self) -> Aabb3d {
        let points: SmallVec<[Vec3; 4]> = match self.shape {
            OffMeshLinkShape::Point { start, end } => SmallVec::from_slice(&[start, end]),
            OffMeshLinkShape::Segment { start, end } => {
                SmallVec::from_slice(&[start[0], start[1], end[0], end[1]])
            }
        };

        let mut bounds = aabb_from_points(points).unwrap_or(Aabb3d {
            min: Vec3A::ZERO,
            max: Vec3A::ZERO,
        });
        bounds.min -= Vec3A::splat(self.snap_radius);
        bounds.max += Vec3A::splat(self.snap_radius);

        bounds
    }
}

/// Everything gathered for a single tile build.
#[derive(Clone, Default)]
pub struct TileGeometry {
    pub elements: Vec<Arc<RawGeometryElement>>,
    pub modifiers: Vec<AreaModifier>,
    pub off_mesh_links: Vec<OffMeshLink>,
}

impl TileGeometry {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Source of geometry for tile generation. All queries must be deterministic for the same world state.
pub trait GeometryProvider {
    /// Returns all geometry intersecting ``bounds``.
    fn gather_geometry(&self, bounds: &Aabb3d) -> Vec<Arc<RawGeometryElement>>;
    /// Returns all area modifiers intersecting ``bounds``.
    fn gather_modifiers(&self, bounds: &Aabb3d) -> Vec<AreaModifier>;
    /// Returns all off-mesh links intersecting ``bounds``.
    fn gather_off_mesh_links(&self, bounds: &Aabb3d) -> Vec<OffMeshLink>;
}

/// Identifier of an entry in a [`GeometryIndex`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(pub u64);

struct IndexedGeometry {
    bounds: Aabb3d,
    geometry: Arc<RawGeometryElement>,
}

/// Ordered collection of geometry, modifiers & off-mesh links.
///
/// Every mutation returns the [`DirtyArea`]s that need to be passed on to the generator.
#[derive(Resource, Default)]
pub struct GeometryIndex {
    geometry: BTreeMap<ElementId, IndexedGeometry>,
    modifiers: BTreeMap<ElementId, AreaModifier>,
    off_mesh_links: BTreeMap<ElementId, OffMeshLink>,
}

impl GeometryIndex {
    /// Inserts or replaces the geometry with ``id``. Returns the areas of the old & new geometry.
    pub fn insert_geometry(
        &mut self,
        id: ElementId,
        geometry: RawGeometryElement,
    ) -> SmallVec<[DirtyArea; 2]> {
        let mut dirty = SmallVec::new();

        if let Some(old) = self.geometry.remove(&id) {
            dirty.push(DirtyArea::new(old.bounds, DirtyFlags::GEOMETRY));
        }

        if let Some(bounds) = geometry.bounds() {
            self.geometry.insert(
                id,
                IndexedGeometry {
                    bounds,
                    geometry: Arc::new(geometry),
                },
            );
            dirty.push(DirtyArea::new(bounds, DirtyFlags::GEOMETRY));
        }

        dirty
    }

    pub fn remove_geometry(&mut self, id: ElementId) -> Option<DirtyArea> {
        self.geometry
            .remove(&id)
            .map(|old| DirtyArea::new(old.bounds, DirtyFlags::GEOMETRY))
    }

    pub fn insert_modifier(
        &mut self,
        id: ElementId,
        modifier: AreaModifier,
    ) -> SmallVec<[DirtyArea; 2]> {
        let mut dirty = SmallVec::new();

        if let Some(old) = self.modifiers.remove(&id) {
            dirty.push(modifier_dirty_area(&old));
        }
        dirty.push(modifier_dirty_area(&modifier));
        self.modifiers.insert(id, modifier);

        dirty
    }

    pub fn remove_modifier(&mut self, id: ElementId) -> Option<DirtyArea> {
        self.modifiers
            .remove(&id)
            .map(|old| modifier_dirty_area(&old))
    }

    pub fn insert_off_mesh_link(
        &mut self,
        id: ElementId,
        link: OffMeshLink,
    ) -> SmallVec<[DirtyArea; 2]> {
        let mut dirty = SmallVec::new();

        if let Some(old) = self.off_mesh_links.remove(&id) {
            dirty.push(DirtyArea::new(old.bounds(), DirtyFlags::DYNAMIC_MODIFIER));
        }
        dirty.push(DirtyArea::new(link.bounds(), DirtyFlags::DYNAMIC_MODIFIER));
        self.off_mesh_links.insert(id, link);

        dirty
    }

    pub fn remove_off_mesh_link(&mut self, id: ElementId) -> Option<DirtyArea> {
        self.off_mesh_links
            .remove(&id)
            .map(|old| DirtyArea::new(old.bounds(), DirtyFlags::DYNAMIC_MODIFIER))
    }

    /// Bounds of all geometry in the index.
    pub fn geometry_bounds(&self) -> Option<Aabb3d> {
        self.geometry
            .values()
            .map(|indexed| indexed.bounds)
            .reduce(|a, b| Aabb3d {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
            })
    }

    pub fn geometry_count(&self) -> usize {
        self.geometry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty() && self.modifiers.is_empty() && self.off_mesh_links.is_empty()
    }
}

fn modifier_dirty_area(modifier: &AreaModifier) -> DirtyArea {
    let flags = if modifier.include_agent_height {
        DirtyFlags::DYNAMIC_MODIFIER | DirtyFlags::USE_AGENT_HEIGHT
    } else {
        DirtyFlags::DYNAMIC_MODIFIER
    };

    DirtyArea::new(modifier.shape.bounds(), flags)
}

impl GeometryProvider for GeometryIndex {
    fn gather_geometry(&self, bounds: &Aabb3d) -> Vec<Arc<RawGeometryElement>> {
        self.geometry
            .values()
            .filter(|indexed| indexed.bounds.intersects(bounds))
            .map(|indexed| indexed.geometry.clone())
            .collect()
    }

    fn gather_modifiers(&self, bounds: &Aabb3d) -> Vec<AreaModifier> {
        self.modifiers
            .values()
            .filter(|modifier| modifier.shape.bounds().intersects(bounds))
            .cloned()
            .collect()
    }

    fn gather_off_mesh_links(&self, bounds: &Aabb3d) -> Vec<OffMeshLink> {
        self.off_mesh_links
            .values()
            .filter(|link| link.bounds().intersects(bounds))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bevy::math::Quat;

    use super::*;

    fn quad(size: f32) -> RawGeometryElement {
        RawGeometryElement::new(
            vec![
                Vec3::new(-size, 0.0, -size),
                Vec3::new(size, 0.0, -size),
                Vec3::new(size, 0.0, size),
                Vec3::new(-size, 0.0, size),
            ],
            vec![[0, 2, 1], [0, 3, 2]],
        )
    }

    #[test]
    fn instance_bounds_cover_all_instances() {
        let element = quad(1.0).with_instance_transforms(vec![
            Affine3A::from_translation(Vec3::new(-10.0, 0.0, 0.0)),
            Affine3A::from_scale_rotation_translation(
                Vec3::splat(2.0),
                Quat::IDENTITY,
                Vec3::new(10.0, 5.0, 0.0),
            ),
        ]);

        let bounds = element.bounds().expect("Element has vertices.");
        assert_eq!(Vec3::from(bounds.min), Vec3::new(-11.0, 0.0, -2.0));
        assert_eq!(Vec3::from(bounds.max), Vec3::new(12.0, 5.0, 2.0));
    }

    #[test]
    fn index_reports_old_and_new_bounds() {
        let mut index = GeometryIndex::default();
        let id = ElementId(7);

        let dirty = index.insert_geometry(id, quad(1.0));
        assert_eq!(dirty.len(), 1);

        let dirty = index.insert_geometry(
            id,
            quad(1.0)
                .with_instance_transforms(vec![Affine3A::from_translation(Vec3::X * 100.0)]),
        );
        assert_eq!(dirty.len(), 2);
        assert!(dirty.iter().all(|area| area.flags.contains(DirtyFlags::GEOMETRY)));

        let far_away = Aabb3d {
            min: Vec3A::new(-2.0, -1.0, -2.0),
            max: Vec3A::new(2.0, 1.0, 2.0),
        };
        assert!(index.gather_geometry(&far_away).is_empty());

        assert!(index.remove_geometry(id).is_some());
        assert!(index.is_empty());
    }

    #[test]
    fn modifier_with_agent_height_is_flagged() {
        let mut index = GeometryIndex::default();

        let dirty = index.insert_modifier(
            ElementId(1),
            AreaModifier::new(
                AreaModifierShape::Box {
                    min: Vec3::ZERO,
                    max: Vec3::ONE,
                },
                None,
            )
            .with_agent_height(true),
        );

        assert!(dirty[0].flags.contains(DirtyFlags::USE_AGENT_HEIGHT));
        assert!(!dirty[0].flags.contains(DirtyFlags::GEOMETRY));
    }
}
