use std::{num::NonZeroU16, sync::Arc};

use bevy::{
    math::{bounding::Aabb3d, Affine3A, Vec3A},
    prelude::{UVec2, Vec3},
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parry3d::shape::SharedShape;
use tiled_navmesh::{
    conversion::shape_to_geometry_element,
    generator::{DirtyArea, DirtyFlags, NavMeshGenerator, PendingTileElement, TileGenerator},
    geometry::{AreaModifier, AreaModifierShape, ElementId, GeometryIndex},
    layers::TileLayerCache,
    Area, NavMeshSettings,
};

fn nav_mesh_settings() -> NavMeshSettings {
    NavMeshSettings {
        cell_width: 0.25,
        cell_height: 0.1,
        tile_width: NonZeroU16::new(100).unwrap(),
        world_half_extents: 12.5,
        world_bottom_bound: -100.0,
        max_traversable_slope_radians: (40.0_f32 - 0.1).to_radians(),
        walkable_height: 20,
        walkable_radius: 1,
        step_height: 3,
        min_region_area: 100,
        max_region_area_to_merge_into: 500,
        max_contour_simplification_error: 1.1,
        max_edge_length: 80,
        max_tile_generation_tasks: NonZeroU16::new(1),
        detail_mesh_generation: None,
        ..NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 12.5, -100.0)
    }
}

fn cuboid_index(cuboids: &[(Vec3, Vec3)]) -> GeometryIndex {
    let mut index = GeometryIndex::default();

    for (i, (translation, half_extents)) in cuboids.iter().enumerate() {
        let shape = SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z);
        let element = shape_to_geometry_element(
            shape.as_typed_shape(),
            Affine3A::from_translation(*translation),
            Some(Area(0)),
        )
        .unwrap();

        index.insert_geometry(ElementId(i as u64), element);
    }

    index
}

fn full_rebuild() -> PendingTileElement {
    PendingTileElement {
        coord: UVec2::ZERO,
        dirty_areas: Vec::new(),
        rebuild_geometry: true,
        seed_distance: 0.0,
    }
}

fn generate_tile(index: &GeometryIndex, settings: &Arc<NavMeshSettings>, cache: &TileLayerCache) {
    let generator = TileGenerator::new(&full_rebuild(), settings.clone(), index, cache);

    black_box(generator.run_to_completion().unwrap());
}

fn criterion_benchmark(c: &mut Criterion) {
    let settings = Arc::new(nav_mesh_settings());
    let cache = TileLayerCache::default();

    let single = cuboid_index(&[(Vec3::ZERO, Vec3::new(10.0, 0.2, 10.0))]);
    c.bench_function("Generate Single Primitive Geometry", |b| {
        b.iter(|| generate_tile(&single, &settings, &cache))
    });

    let many = cuboid_index(&[
        (Vec3::ZERO, Vec3::new(10.0, 0.2, 10.0)),
        (Vec3::new(5.0, 1.0, 0.0), Vec3::new(1.0, 1.0, 1.0)),
        (Vec3::new(-5.0, 1.0, 2.0), Vec3::new(4.0, 1.0, 1.0)),
        (Vec3::new(-2.5, 2.0, 2.0), Vec3::new(1.0, 2.0, 1.0)),
        (Vec3::new(-2.5, 2.0, -2.0), Vec3::new(1.0, 2.0, 1.0)),
    ]);
    c.bench_function("Generate Many Primitive Geometry", |b| {
        b.iter(|| generate_tile(&many, &settings, &cache))
    });

    // Rebuild from the layer cache after a modifier change.
    let mut generator = NavMeshGenerator::new(nav_mesh_settings());
    let mut index = cuboid_index(&[(Vec3::ZERO, Vec3::new(10.0, 0.2, 10.0))]);
    generator.mark_dirty(
        Aabb3d {
            min: Vec3A::splat(-12.5),
            max: Vec3A::splat(12.5),
        },
        DirtyFlags::GEOMETRY,
    );
    generator.ensure_build_completion(&index);

    let dirty = index.insert_modifier(
        ElementId(100),
        AreaModifier::new(
            AreaModifierShape::Box {
                min: Vec3::new(-2.0, -1.0, -2.0),
                max: Vec3::new(2.0, 1.0, 2.0),
            },
            Some(Area(1)),
        ),
    );
    let element = PendingTileElement {
        coord: UVec2::ZERO,
        dirty_areas: dirty.iter().copied().collect::<Vec<DirtyArea>>(),
        rebuild_geometry: false,
        seed_distance: 0.0,
    };

    c.bench_function("Rebuild Modified Layer", |b| {
        b.iter(|| {
            let tile_generator =
                TileGenerator::new(&element, settings.clone(), &index, generator.layer_cache());

            black_box(tile_generator.run_to_completion().unwrap())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
