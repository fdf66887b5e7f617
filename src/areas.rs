use bevy::math::{UVec2, Vec2, Vec3Swizzles};

#[cfg(feature = "trace")]
use bevy::log::info_span;

use crate::{
    geometry::{AreaModifier, AreaModifierMode, AreaModifierShape},
    heightfields::OpenTile,
    math::{distance_sqr_point_segment_2d, point_in_polygon_2d},
    Area, NavMeshSettings, LOW_HEIGHT_AREA,
};

/// Applies ``modifiers`` to the spans of a decompressed layer, then clears any remaining low height areas.
pub(crate) fn mark_dynamic_areas(
    open_tile: &mut OpenTile,
    tile: UVec2,
    modifiers: &[AreaModifier],
    nav_mesh_settings: &NavMeshSettings,
) {
    #[cfg(feature = "trace")]
    let _span = info_span!("Mark dynamic areas").entered();

    let origin = nav_mesh_settings.get_tile_origin_with_border(tile);
    let agent_radius = f32::from(nav_mesh_settings.walkable_radius) * nav_mesh_settings.cell_width;
    let agent_height = f32::from(nav_mesh_settings.walkable_height) * nav_mesh_settings.cell_height;

    for modifier in modifiers {
        let bounds = modifier.shape.bounds();

        let mut min_y = bounds.min.y - nav_mesh_settings.cell_height;
        let max_y = bounds.max.y + nav_mesh_settings.cell_height;
        if modifier.include_agent_height {
            min_y -= agent_height;
        }

        let min_x = bounds.min.x - agent_radius;
        let max_x = bounds.max.x + agent_radius;
        let min_z = bounds.min.z - agent_radius;
        let max_z = bounds.max.z + agent_radius;

        let tile_side = open_tile.tile_side;
        let to_cell = |world: f32, origin: f32| {
            ((world - origin) / nav_mesh_settings.cell_width).floor() as i32
        };
        let cell_min_x = to_cell(min_x, origin.x).max(0);
        let cell_max_x = to_cell(max_x, origin.x).min(tile_side as i32 - 1);
        let cell_min_z = to_cell(min_z, origin.y).max(0);
        let cell_max_z = to_cell(max_z, origin.y).min(tile_side as i32 - 1);

        if cell_min_x > cell_max_x || cell_min_z > cell_max_z {
            continue;
        }

        for z in cell_min_z..=cell_max_z {
            for x in cell_min_x..=cell_max_x {
                let center = Vec2::new(
                    origin.x + (x as f32 + 0.5) * nav_mesh_settings.cell_width,
                    origin.y + (z as f32 + 0.5) * nav_mesh_settings.cell_width,
                );

                if !shape_contains(&modifier.shape, center, agent_radius) {
                    continue;
                }

                let cell = &open_tile.cells[x as usize + z as usize * tile_side];
                for span in cell.spans.iter() {
                    let y = f32::from(span.min) * nav_mesh_settings.cell_height
                        + nav_mesh_settings.world_bottom_bound;
                    if y < min_y || y > max_y {
                        continue;
                    }

                    let area = &mut open_tile.areas[span.tile_index];
                    apply_modifier(area, modifier);
                }
            }
        }
    }

    for area in open_tile.areas.iter_mut() {
        if *area == Some(LOW_HEIGHT_AREA) {
            *area = None;
        }
    }
}

fn apply_modifier(area: &mut Option<Area>, modifier: &AreaModifier) {
    match modifier.mode {
        AreaModifierMode::Overwrite => {
            if area.is_some() {
                *area = modifier.area;
            }
        }
        AreaModifierMode::Replace(replaced) => {
            if *area == Some(replaced) {
                *area = modifier.area;
            }
        }
    }
}

/// Whether ``point`` on the XZ-plane is inside the shape grown by ``expansion``.
fn shape_contains(shape: &AreaModifierShape, point: Vec2, expansion: f32) -> bool {
    match shape {
        AreaModifierShape::Cylinder { base, radius, .. } => {
            let radius = radius + expansion;
            point.distance_squared(base.xz()) <= radius * radius
        }
        AreaModifierShape::Box { min, max } => {
            point.x >= min.x - expansion
                && point.x <= max.x + expansion
                && point.y >= min.z - expansion
                && point.y <= max.z + expansion
        }
        AreaModifierShape::Convex { points, .. } => {
            if points.len() < 3 {
                return false;
            }

            point_in_polygon_2d(point, points)
                || (0..points.len()).any(|i| {
                    let j = (i + 1) % points.len();
                    distance_sqr_point_segment_2d(point, points[i], points[j])
                        <= expansion * expansion
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bevy::math::Vec3;

    use super::*;
    use crate::heightfields::{OpenCell, OpenSpan};

    fn settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
            .with_tile_width(NonZeroU16::new(16).unwrap())
    }

    /// Single layer at world height 0 with every cell walkable.
    fn flat_layer(settings: &NavMeshSettings, area: Area) -> OpenTile {
        let tile_side = settings.get_tile_side_with_border();
        let height = (-settings.world_bottom_bound / settings.cell_height) as u16;

        let cells = (0..tile_side * tile_side)
            .map(|i| OpenCell {
                spans: vec![OpenSpan {
                    min: height,
                    max: None,
                    tile_index: i,
                    ..Default::default()
                }],
            })
            .collect();

        OpenTile {
            cells,
            distances: vec![u16::MAX; tile_side * tile_side],
            areas: vec![Some(area); tile_side * tile_side],
            span_count: tile_side * tile_side,
            tile_side,
            ..Default::default()
        }
    }

    fn tile_containing(settings: &NavMeshSettings, position: Vec3) -> UVec2 {
        settings.get_tile_containing_position(position.xz())
    }

    #[test]
    fn box_overwrites_walkable_spans() {
        let settings = settings();
        let mut open_tile = flat_layer(&settings, Area(0));
        let tile = tile_containing(&settings, Vec3::ZERO);

        let modifier = AreaModifier::new(
            AreaModifierShape::Box {
                min: Vec3::new(-1.0, -0.5, -1.0),
                max: Vec3::new(1.0, 0.5, 1.0),
            },
            Some(Area(3)),
        );

        mark_dynamic_areas(&mut open_tile, tile, &[modifier], &settings);

        let marked = open_tile
            .areas
            .iter()
            .filter(|area| **area == Some(Area(3)))
            .count();
        // 2x2 meters grown by the agent radius on every side, 0.25 meter cells.
        assert!(marked >= 64, "{marked}");
        assert!(marked < open_tile.span_count);
    }

    #[test]
    fn replace_only_touches_matching_area() {
        let settings = settings();
        let tile = tile_containing(&settings, Vec3::ZERO);
        let modifier = AreaModifier::new(
            AreaModifierShape::Cylinder {
                base: Vec3::new(0.0, -1.0, 0.0),
                radius: 2.0,
                height: 2.0,
            },
            None,
        )
        .with_mode(AreaModifierMode::Replace(Area(1)));

        let mut open_tile = flat_layer(&settings, Area(0));
        mark_dynamic_areas(&mut open_tile, tile, &[modifier.clone()], &settings);
        assert!(open_tile.areas.iter().all(|area| *area == Some(Area(0))));

        let mut open_tile = flat_layer(&settings, Area(1));
        mark_dynamic_areas(&mut open_tile, tile, &[modifier], &settings);
        assert!(open_tile.areas.iter().any(|area| area.is_none()));
    }

    #[test]
    fn modifiers_above_the_floor_are_ignored_unless_covering_agent_height() {
        let settings = settings();
        let tile = tile_containing(&settings, Vec3::ZERO);
        let shape = AreaModifierShape::Convex {
            points: vec![
                Vec2::new(-1.0, -1.0),
                Vec2::new(1.0, -1.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(-1.0, 1.0),
            ],
            min_y: 1.0,
            max_y: 2.0,
        };

        let mut open_tile = flat_layer(&settings, Area(0));
        mark_dynamic_areas(
            &mut open_tile,
            tile,
            &[AreaModifier::new(shape.clone(), None)],
            &settings,
        );
        assert!(open_tile.areas.iter().all(Option::is_some));

        mark_dynamic_areas(
            &mut open_tile,
            tile,
            &[AreaModifier::new(shape, None).with_agent_height(true)],
            &settings,
        );
        assert!(open_tile.areas.iter().any(Option::is_none));
    }

    #[test]
    fn low_height_areas_are_cleared() {
        let settings = settings();
        let mut open_tile = flat_layer(&settings, LOW_HEIGHT_AREA);

        mark_dynamic_areas(&mut open_tile, UVec2::ZERO, &[], &settings);

        assert!(open_tile.areas.iter().all(Option::is_none));
    }
}
