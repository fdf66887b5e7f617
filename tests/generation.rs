use std::num::NonZeroU16;

use bevy::math::{bounding::Aabb3d, UVec2, Vec2, Vec3, Vec3A, Vec3Swizzles};
use tiled_navmesh::{
    generator::{DirtyFlags, NavMeshGenerator},
    geometry::{
        AreaModifier, AreaModifierShape, ElementId, GeometryIndex, OffMeshLink,
        OffMeshLinkDirection, OffMeshLinkShape, RawGeometryElement,
    },
    tiles::{NavMeshTiles, TileData, TileIndex},
    Area, GenerationMode, NavMeshSettings,
};

const MAX_TICKS: usize = 100_000;

/// Cells of 10 units, tiles of 64 cells, in a 1000x1000 world.
fn settings(mode: GenerationMode) -> NavMeshSettings {
    NavMeshSettings::from_agent_and_bounds(20.0, 20.0, 500.0, -10.0)
        .with_tile_width(NonZeroU16::new(64).unwrap())
        .with_generation_mode(mode)
}

fn plane(half_size: f32) -> RawGeometryElement {
    RawGeometryElement::new(
        vec![
            Vec3::new(-half_size, 0.0, -half_size),
            Vec3::new(half_size, 0.0, -half_size),
            Vec3::new(half_size, 0.0, half_size),
            Vec3::new(-half_size, 0.0, half_size),
        ],
        vec![[0, 2, 1], [0, 3, 2]],
    )
}

fn cuboid(min: Vec3, max: Vec3) -> RawGeometryElement {
    RawGeometryElement::new(
        vec![
            Vec3::new(min.x, min.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(max.x, max.y, max.z),
            Vec3::new(min.x, max.y, max.z),
        ],
        vec![
            // Top
            [4, 6, 5],
            [4, 7, 6],
            // Bottom
            [0, 1, 2],
            [0, 2, 3],
            // Sides
            [0, 1, 5],
            [0, 5, 4],
            [1, 2, 6],
            [1, 6, 5],
            [2, 3, 7],
            [2, 7, 6],
            [3, 0, 4],
            [3, 4, 7],
        ],
    )
}

fn world_bounds() -> Aabb3d {
    Aabb3d {
        min: Vec3A::new(-500.0, -10.0, -500.0),
        max: Vec3A::new(500.0, 100.0, 500.0),
    }
}

fn plane_index() -> GeometryIndex {
    let mut index = GeometryIndex::default();
    index.insert_geometry(ElementId(0), plane(500.0));

    index
}

fn build(generator: &mut NavMeshGenerator, index: &GeometryIndex) {
    generator.mark_dirty(world_bounds(), DirtyFlags::GEOMETRY);
    generator.ensure_build_completion(index);

    assert!(!generator.is_build_in_progress());
}

fn serialized_tiles(tiles: &NavMeshTiles) -> Vec<(TileIndex, Vec<u8>)> {
    tiles
        .iter()
        .map(|(index, tile)| (index, tile.data.to_bytes()))
        .collect()
}

fn polygon_contains(tile: &TileData, point: Vec2) -> bool {
    const EPSILON: f32 = 0.01;

    tile.polygons.iter().any(|polygon| {
        let outline: Vec<Vec2> = tile.polygon_vertices(polygon).map(|v| v.xz()).collect();

        let crosses = (0..outline.len()).map(|i| {
            let a = outline[i];
            let b = outline[(i + 1) % outline.len()];

            (b - a).perp_dot(point - a)
        });

        let (min, max) = crosses.fold((f32::MAX, f32::MIN), |(min, max), cross| {
            (min.min(cross), max.max(cross))
        });

        min >= -EPSILON || max <= EPSILON
    })
}

#[test]
fn large_plane_generates_four_tiles() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));

    build(&mut generator, &index);

    let tiles = generator.tiles();
    assert_eq!(tiles.tile_count(), 4);
    for y in 0..2 {
        for x in 0..2 {
            let coord = UVec2::new(x, y);
            assert_eq!(tiles.layers_at(coord).count(), 1, "{coord}");

            let tile = tiles
                .get_tile(TileIndex::new(coord, 0))
                .expect("Every tile has a layer.");
            assert!(!tile.data.polygons.is_empty(), "{coord}");
        }
    }
    assert_eq!(generator.layer_cache().len(), 4);
}

#[test]
fn plane_is_covered_across_seams() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));

    build(&mut generator, &index);

    let tile_size = generator.settings().get_tile_size();
    let seam = -500.0 + tile_size;

    let mut points = Vec::new();
    for z in (-16..=16).map(|i| i as f32 * 25.0) {
        for x in (-16..=16).map(|i| i as f32 * 25.0) {
            points.push(Vec2::new(x, z));
        }
        points.push(Vec2::new(seam - 1.0, z));
        points.push(Vec2::new(seam + 1.0, z));
        points.push(Vec2::new(z, seam - 1.0));
        points.push(Vec2::new(z, seam + 1.0));
    }

    for point in points {
        let covered = generator
            .tiles()
            .iter()
            .any(|(_, tile)| polygon_contains(&tile.data, point));

        assert!(covered, "{point} isn't covered by any polygon.");
    }
}

#[test]
fn rebuilding_unchanged_input_is_identical() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));

    build(&mut generator, &index);
    let first = serialized_tiles(generator.tiles());

    generator.rebuild_all();
    generator.ensure_build_completion(&index);
    let second = serialized_tiles(generator.tiles());

    assert_eq!(first, second);
}

#[test]
fn overlapping_dirty_areas_share_one_tile() {
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    let center = generator
        .settings()
        .get_tile_bounds(UVec2::ZERO)
        .center();

    let area = |offset: f32| Aabb3d {
        min: Vec3A::new(center.x - 5.0 + offset, 0.0, center.y - 5.0),
        max: Vec3A::new(center.x + 5.0 + offset, 1.0, center.y + 5.0),
    };

    generator.mark_dirty(area(0.0), DirtyFlags::GEOMETRY);
    generator.mark_dirty(area(3.0), DirtyFlags::GEOMETRY);

    assert_eq!(generator.dirty_tile_count(world_bounds()), 1);
    assert_eq!(generator.dirty_tile_count(area(0.0)), 1);
}

#[test]
fn tile_without_geometry_is_cleared() {
    let mut index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));

    build(&mut generator, &index);
    assert_eq!(generator.tiles().tile_count(), 4);

    let dirty = index
        .remove_geometry(ElementId(0))
        .expect("The plane was inserted.");
    generator.mark_dirty_areas(&[dirty]);
    let changed = generator.ensure_build_completion(&index);

    assert_eq!(changed.len(), 4);
    assert!(generator.tiles().is_empty());
    assert!(generator.layer_cache().is_empty());
    assert!(!generator.is_build_in_progress());
}

#[test]
fn time_sliced_matches_async() {
    let index = plane_index();

    let mut async_generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut async_generator, &index);

    let mut time_sliced = NavMeshGenerator::new(settings(GenerationMode::TimeSliced));
    time_sliced.mark_dirty(world_bounds(), DirtyFlags::GEOMETRY);

    let mut ticks = 0;
    while time_sliced.is_build_in_progress() {
        time_sliced.tick(&index, 1.0 / 60.0);

        ticks += 1;
        assert!(ticks < MAX_TICKS, "Time-sliced generation never finished.");
    }

    assert_eq!(
        serialized_tiles(async_generator.tiles()),
        serialized_tiles(time_sliced.tiles())
    );
}

#[test]
fn polygons_keep_agent_radius_from_obstacles() {
    let mut index = plane_index();
    let obstacle_min = Vec2::new(-200.0, -200.0);
    let obstacle_max = Vec2::new(-120.0, -120.0);
    index.insert_geometry(
        ElementId(1),
        cuboid(
            Vec3::new(obstacle_min.x, -5.0, obstacle_min.y),
            Vec3::new(obstacle_max.x, 100.0, obstacle_max.y),
        ),
    );

    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut generator, &index);

    let settings = generator.settings();
    let radius = f32::from(settings.walkable_radius) * settings.cell_width;
    let tolerance = settings.cell_width;

    for (_, tile) in generator.tiles().iter() {
        for vertex in tile.data.vertices.iter().filter(|vertex| vertex.y < 50.0) {
            let closest = vertex.xz().clamp(obstacle_min, obstacle_max);
            let distance = vertex.xz().distance(closest);

            assert!(
                distance >= radius - tolerance - 0.01,
                "{vertex} is {distance} from the obstacle."
            );
        }
    }
}

#[test]
fn replaced_tiles_invalidate_old_references() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut generator, &index);

    let tile_index = TileIndex::new(UVec2::ZERO, 0);
    let old_ref = generator
        .tiles()
        .get_tile_ref(tile_index)
        .expect("Tile was generated.")
        .poly_ref(0);
    assert!(generator.tiles().is_valid_poly_ref(old_ref));

    generator.re_add_tiles(&[UVec2::ZERO]);
    generator.ensure_build_completion(&index);

    let new_ref = generator
        .tiles()
        .get_tile_ref(tile_index)
        .expect("Tile was regenerated.")
        .poly_ref(0);

    assert!(!generator.tiles().is_valid_poly_ref(old_ref));
    assert!(generator.tiles().is_valid_poly_ref(new_ref));
    assert_ne!(old_ref.salt(), new_ref.salt());
}

fn platform_index() -> GeometryIndex {
    let mut index = plane_index();
    index.insert_geometry(
        ElementId(1),
        cuboid(Vec3::new(-400.0, 50.0, -400.0), Vec3::new(-100.0, 52.0, -100.0)),
    );

    index
}

#[test]
fn platform_adds_a_second_layer() {
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut generator, &platform_index());

    assert_eq!(generator.tiles().layers_at(UVec2::ZERO).count(), 2);
    assert_eq!(generator.tiles().tile_count(), 5);
}

#[test]
fn full_tile_pool_keeps_previous_tile() {
    let mut index = plane_index();
    let mut generator =
        NavMeshGenerator::new(settings(GenerationMode::Async).with_max_tiles(4));
    build(&mut generator, &index);
    assert_eq!(generator.tiles().free_tile_count(), 0);

    let tile_index = TileIndex::new(UVec2::ZERO, 0);
    let old_ref = generator.tiles().get_tile_ref(tile_index).unwrap();
    let old_tiles = serialized_tiles(generator.tiles());
    let old_cache = generator.layer_cache().get(UVec2::ZERO).to_vec();

    // The platform needs a second layer at the same coordinate, which doesn't fit.
    let dirty = index.insert_geometry(
        ElementId(1),
        cuboid(Vec3::new(-400.0, 50.0, -400.0), Vec3::new(-100.0, 52.0, -100.0)),
    );
    generator.mark_dirty_areas(&dirty);
    let changed = generator.ensure_build_completion(&index);

    assert!(changed.is_empty());
    assert!(!generator.is_build_in_progress());
    assert_eq!(generator.tiles().get_tile_ref(tile_index), Some(old_ref));
    assert!(generator.tiles().is_valid_poly_ref(old_ref.poly_ref(0)));
    assert_eq!(serialized_tiles(generator.tiles()), old_tiles);
    assert_eq!(generator.layer_cache().get(UVec2::ZERO), old_cache.as_slice());
}

#[test]
fn modifier_rebuilds_from_cached_layers() {
    let mut index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::TimeSliced));
    build(&mut generator, &index);

    let cached = generator.layer_cache().get(UVec2::ZERO).to_vec();

    let modifier_min = Vec3::new(-300.0, -5.0, -300.0);
    let modifier_max = Vec3::new(-200.0, 5.0, -200.0);
    let dirty = index.insert_modifier(
        ElementId(2),
        AreaModifier::new(
            AreaModifierShape::Box {
                min: modifier_min,
                max: modifier_max,
            },
            None,
        ),
    );
    generator.mark_dirty_areas(&dirty);
    let changed = generator.ensure_build_completion(&index);

    assert_eq!(changed, vec![TileIndex::new(UVec2::ZERO, 0)]);
    assert_eq!(generator.layer_cache().get(UVec2::ZERO), cached.as_slice());

    let tile = generator
        .tiles()
        .get_tile(TileIndex::new(UVec2::ZERO, 0))
        .expect("Tile was rebuilt.");
    for polygon in tile.data.polygons.iter() {
        let vertices: Vec<Vec3> = tile.data.polygon_vertices(polygon).collect();
        let centroid = vertices.iter().sum::<Vec3>() / vertices.len() as f32;

        assert!(
            centroid.x < modifier_min.x
                || centroid.x > modifier_max.x
                || centroid.z < modifier_min.z
                || centroid.z > modifier_max.z,
            "Polygon centered at {centroid} is inside the unwalkable modifier."
        );
    }
}

#[test]
fn restored_cache_rebuilds_without_geometry() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut generator, &index);

    let persisted: Vec<Vec<u8>> = generator
        .layer_cache()
        .iter()
        .map(|layer| layer.to_bytes())
        .collect();

    let mut restored = NavMeshGenerator::new(settings(GenerationMode::Async));
    restored.insert_cached_layers(
        persisted
            .iter()
            .map(|bytes| tiled_navmesh::layers::CompressedLayer::from_bytes(bytes).unwrap()),
    );
    assert_eq!(restored.layer_cache().len(), 4);

    // Nothing but the cache to build from.
    let empty = GeometryIndex::default();
    restored.mark_dirty(world_bounds(), DirtyFlags::DYNAMIC_MODIFIER);
    restored.ensure_build_completion(&empty);

    assert_eq!(
        serialized_tiles(generator.tiles()),
        serialized_tiles(restored.tiles())
    );
}

#[test]
fn off_mesh_links_snap_to_the_start_tile() {
    let mut index = plane_index();
    index.insert_off_mesh_link(
        ElementId(3),
        OffMeshLink {
            shape: OffMeshLinkShape::Point {
                start: Vec3::new(-300.0, 0.0, -300.0),
                end: Vec3::new(300.0, 0.0, 300.0),
            },
            snap_radius: 20.0,
            snap_height: None,
            direction: OffMeshLinkDirection::Bidirectional,
            area: Area(1),
        },
    );

    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    build(&mut generator, &index);

    let links: Vec<_> = generator
        .tiles()
        .iter()
        .flat_map(|(index, tile)| {
            tile.data
                .off_mesh_links
                .iter()
                .map(move |link| (index.coord, link.clone()))
        })
        .collect();

    assert_eq!(links.len(), 1);
    assert_eq!(links[0].0, UVec2::ZERO);
    assert!(links[0].1.bidirectional);
}

#[test]
fn removed_tiles_discard_running_work() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    generator.mark_dirty(world_bounds(), DirtyFlags::GEOMETRY);

    // Spawns the tasks.
    generator.tick(&index, 1.0 / 60.0);
    generator.remove_tiles(&[UVec2::ZERO, UVec2::X, UVec2::Y, UVec2::ONE]);
    generator.ensure_build_completion(&index);

    assert!(generator.tiles().is_empty());
    assert!(generator.layer_cache().is_empty());
}

#[test]
fn cancelled_build_leaves_nothing_pending() {
    let index = plane_index();
    let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
    generator.mark_dirty(world_bounds(), DirtyFlags::GEOMETRY);
    generator.tick(&index, 1.0 / 60.0);

    generator.cancel_build();

    assert!(!generator.is_build_in_progress());
    assert!(generator.tiles().is_empty());
}
