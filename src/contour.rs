use std::cmp::Ordering;

use bevy::prelude::{IVec2, UVec2, UVec4};

use crate::{
    error::{try_reserve, BuildStage, TileBuildError},
    heightfields::{OpenSpan, OpenTile},
    math::{get_neighbour_index, in_cone, intersect},
    regions::BORDER_REGION,
    Area, NavMeshSettings,
};

pub(crate) const MASK_CONTOUR_REGION: u32 = 0xffff;

/// Simplified outline of a region.
///
/// Vertices are ``(x, y, z, neighbour region)`` in cells, relative to the tile origin without the border.
#[derive(Default, Clone, Debug)]
pub struct Contour {
    pub vertices: Vec<UVec4>,
    pub region: u16,
    /// Unlike [OpenSpan] this can't be ``None`` as ``None`` spans are ignored when generating contours.
    pub area: Area,
}

#[derive(Default)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
}

#[derive(Default, Clone)]
struct ContourHole {
    contour: usize,
    min_x: u32,
    min_z: u32,
    left_most_vertex: u32,
}

#[derive(Default, Clone)]
struct ContourRegion {
    outline: Option<usize>,
    holes: Vec<ContourHole>,
}

pub(crate) fn build_contours(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<ContourSet, TileBuildError> {
    let max_contours = open_tile.max_regions.max(8);
    let mut contour_set = ContourSet::default();
    try_reserve(
        &mut contour_set.contours,
        max_contours.into(),
        BuildStage::Contours,
    )?;

    let tile_side = open_tile.tile_side;
    let border = nav_mesh_settings.get_border_side() as u32;

    // Mark boundaries.
    let mut boundry_flags = vec![0u8; open_tile.span_count];
    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let mut res = 0;

            for dir in 0..4 {
                let mut other_region = 0;
                if let Some(span_index) = span.neighbours[dir] {
                    let other_span = &open_tile.cells
                        [get_neighbour_index(tile_side, cell_index, dir)]
                    .spans[span_index as usize];
                    other_region = other_span.region;
                }

                if span.region == other_region {
                    res |= 1 << dir;
                }
            }

            boundry_flags[span.tile_index] = res ^ 0b1111; // Flip so we mark unconnected sides.
        }
    }

    let mut vertices = Vec::with_capacity(256);
    let mut simplified_vertices = Vec::with_capacity(64);

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        for (span_index, span) in cell.spans.iter().enumerate() {
            if boundry_flags[span.tile_index] == 0 || boundry_flags[span.tile_index] == 0b1111 {
                boundry_flags[span.tile_index] = 0;
                continue;
            }
            if span.region == 0 || span.region & BORDER_REGION != 0 {
                continue;
            }
            let Some(area) = open_tile.areas[span.tile_index] else {
                continue;
            };

            vertices.clear();
            simplified_vertices.clear();

            // Walk contour
            walk_contour(
                cell_index,
                span_index,
                open_tile,
                &mut boundry_flags,
                &mut vertices,
            );

            // Simplify contour
            simplify_contour(
                &vertices,
                &mut simplified_vertices,
                nav_mesh_settings.max_contour_simplification_error,
                nav_mesh_settings.max_edge_length,
            );

            // Remove degenerate segments.
            remove_degenerate_segments(&mut simplified_vertices);

            if simplified_vertices.len() >= 3 {
                // Move to tile space.
                for vertex in simplified_vertices.iter_mut() {
                    vertex.x = vertex.x.saturating_sub(border);
                    vertex.z = vertex.z.saturating_sub(border);
                }

                try_reserve(&mut contour_set.contours, 1, BuildStage::Contours)?;
                contour_set.contours.push(Contour {
                    vertices: simplified_vertices.clone(),
                    region: span.region,
                    area,
                });
            }
        }
    }

    merge_holes(&mut contour_set, open_tile.max_regions);

    Ok(contour_set)
}

/// Stitches holes into the outline of their region. Holes of regions without an outline are dropped.
fn merge_holes(contour_set: &mut ContourSet, max_regions: u16) {
    if contour_set.contours.is_empty() {
        return;
    }

    let mut regions = vec![ContourRegion::default(); usize::from(max_regions) + 1];
    let mut num_holes = 0;

    for (i, contour) in contour_set.contours.iter().enumerate() {
        let Some(region) = regions.get_mut(contour.region as usize) else {
            continue;
        };

        if calc_area_of_polygon_2d(&contour.vertices) < 0 {
            num_holes += 1;
            region.holes.push(ContourHole {
                contour: i,
                min_x: contour.vertices[0].x,
                min_z: contour.vertices[0].z,
                left_most_vertex: 0,
            });
        } else {
            region.outline = Some(i);
        }
    }

    if num_holes == 0 {
        return;
    }

    for region in regions.iter_mut() {
        let Some(outline) = region.outline else {
            continue;
        };

        if !region.holes.is_empty() {
            merge_region_holes(outline, &mut region.holes, &mut contour_set.contours);
        }
    }

    let mut is_hole = vec![false; contour_set.contours.len()];
    for hole in regions.iter().flat_map(|region| region.holes.iter()) {
        is_hole[hole.contour] = true;
    }

    let mut i = 0;
    contour_set.contours.retain(|_| {
        i += 1;
        !is_hole[i - 1]
    });
}

#[derive(Default, Clone, Copy)]
struct PotentialDiagonal {
    vertex: u32,
    distance: u32,
}

fn merge_region_holes(outline: usize, holes: &mut [ContourHole], contours: &mut [Contour]) {
    // Find left-most vertex
    for hole in holes.iter_mut() {
        for (i, vertex) in contours[hole.contour].vertices.iter().enumerate() {
            if vertex.x < hole.min_x || (vertex.x == hole.min_x && vertex.z < hole.min_z) {
                hole.min_x = vertex.x;
                hole.min_z = vertex.z;
                hole.left_most_vertex = i as u32;
            }
        }
    }

    holes.sort_by(|a, b| match a.min_x.cmp(&b.min_x) {
        Ordering::Equal => a.min_z.cmp(&b.min_z),
        ordering => ordering,
    });

    let max_vertices = contours[outline].vertices.len()
        + holes
            .iter()
            .fold(0, |value, hole| value + contours[hole.contour].vertices.len());

    let mut diagonals = Vec::with_capacity(max_vertices);

    for hole_i in 0..holes.len() {
        let hole = &holes[hole_i];
        let hole_vertices = &contours[hole.contour].vertices;
        let outline_vertices = &contours[outline].vertices;

        let mut index = None;
        let mut best_vertex = hole.left_most_vertex;

        for _ in 0..hole_vertices.len() {
            // Find potential diagonals.
            diagonals.clear();
            let corner_vertex = hole_vertices[best_vertex as usize];
            for i in 0..outline_vertices.len() {
                if in_cone(i, outline_vertices, corner_vertex) {
                    let delta_x = outline_vertices[i].x.abs_diff(corner_vertex.x);
                    let delta_z = outline_vertices[i].z.abs_diff(corner_vertex.z);
                    let distance = delta_x * delta_x + delta_z * delta_z;
                    diagonals.push(PotentialDiagonal {
                        vertex: i as u32,
                        distance,
                    });
                }
            }

            diagonals.sort_by(|a, b| a.distance.cmp(&b.distance));

            // Find non-intersecting diagonals.
            index = None;

            for potential_diagonal in diagonals.iter() {
                let vertex = outline_vertices[potential_diagonal.vertex as usize];
                let mut intersects = intersect_segment_contour(
                    vertex,
                    corner_vertex,
                    potential_diagonal.vertex as usize,
                    outline_vertices,
                );

                for other_hole in holes.iter().skip(hole_i) {
                    intersects |= intersect_segment_contour_no_vertex(
                        vertex,
                        corner_vertex,
                        &contours[other_hole.contour].vertices,
                    );

                    if intersects {
                        break;
                    }
                }

                if !intersects {
                    index = Some(potential_diagonal.vertex);
                    break;
                }
            }

            if index.is_some() {
                break;
            }

            best_vertex = (best_vertex + 1) % hole_vertices.len() as u32;
        }

        let Some(index) = index else {
            continue;
        };

        let merged = merge_contours(
            outline_vertices,
            hole_vertices,
            index as usize,
            best_vertex as usize,
        );
        contours[outline].vertices = merged;
    }
}

fn merge_contours(
    target_vertices: &[UVec4],
    source_vertices: &[UVec4],
    index_a: usize,
    index_b: usize,
) -> Vec<UVec4> {
    let mut vertices = Vec::with_capacity(target_vertices.len() + source_vertices.len() + 2);

    // Both connecting vertices are duplicated to close the seam.
    for i in 0..=target_vertices.len() {
        vertices.push(target_vertices[(index_a + i) % target_vertices.len()]);
    }

    for i in 0..=source_vertices.len() {
        vertices.push(source_vertices[(index_b + i) % source_vertices.len()]);
    }

    vertices
}

pub(crate) fn calc_area_of_polygon_2d(vertices: &[UVec4]) -> i32 {
    let mut area = 0;
    for i in 0..vertices.len() {
        let previous = vertices[i].as_ivec4();
        let next = vertices[(i + 1) % vertices.len()].as_ivec4();

        area += next.x * previous.z - previous.x * next.z;
    }

    (area + 1) / 2
}

fn intersect_segment_contour(
    point: UVec4,
    corner: UVec4,
    diagonal_vertex: usize,
    outline_vertices: &[UVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();

        if i == diagonal_vertex || next == diagonal_vertex {
            continue;
        }

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];

        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(
            point.as_ivec4(),
            corner.as_ivec4(),
            point_i.as_ivec4(),
            point_next.as_ivec4(),
        ) {
            return true;
        }
    }

    false
}

fn intersect_segment_contour_no_vertex(
    point: UVec4,
    corner: UVec4,
    outline_vertices: &[UVec4],
) -> bool {
    for i in 0..outline_vertices.len() {
        let next = (i + 1) % outline_vertices.len();

        let point_i = outline_vertices[i];
        let point_next = outline_vertices[next];

        if (point.x == point_i.x && point.z == point_i.z)
            || (point_next.x == point_i.x && point_next.z == point_i.z)
            || (point_next.x == point.x && point_next.z == point.z)
        {
            continue;
        }

        if intersect(
            point.as_ivec4(),
            corner.as_ivec4(),
            point_i.as_ivec4(),
            point_next.as_ivec4(),
        ) {
            return true;
        }
    }

    false
}

fn walk_contour(
    mut cell_index: usize,
    mut span_index: usize,
    tile: &OpenTile,
    boundry_flags: &mut [u8],
    contour: &mut Vec<u32>,
) {
    let mut dir = 0u8;
    while (boundry_flags[tile.cells[cell_index].spans[span_index].tile_index] & (1 << dir)) == 0 {
        dir += 1;
    }
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;
    let tile_side = tile.tile_side;

    loop {
        let row = cell_index / tile_side;
        let column = cell_index % tile_side;

        let span = &tile.cells[cell_index].spans[span_index];
        if boundry_flags[span.tile_index] & (1 << dir) > 0 {
            // Check if this direction is unconnected.
            let height = get_corner_height(cell_index, span, tile, dir);

            let mut bordering_region = 0u32;
            if let Some(span_index) = span.neighbours[dir as usize] {
                let other_span = &tile.cells
                    [get_neighbour_index(tile_side, cell_index, dir.into())]
                .spans[span_index as usize];
                bordering_region = other_span.region.into();
            }

            let px = match dir {
                1 => column + 1,
                2 => column + 1,
                _ => column,
            } as u32;
            let py = height as u32;
            let pz = match dir {
                0 => row + 1,
                1 => row + 1,
                _ => row,
            } as u32;
            contour.extend_from_slice(&[px, py, pz, bordering_region]);

            boundry_flags[span.tile_index] &= !(1 << dir);
            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            let Some(index) = span.neighbours[dir as usize] else {
                // Boundary flags disagree with the links. Leave what we have.
                return;
            };
            span_index = index.into();

            cell_index = get_neighbour_index(tile_side, cell_index, dir.into());
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            break;
        }
    }
}

/// Highest floor of the (up to) four spans sharing the corner clock-wise of ``dir``.
fn get_corner_height(cell_index: usize, span: &OpenSpan, tile: &OpenTile, dir: u8) -> u16 {
    let tile_side = tile.tile_side;
    let next_dir = (dir + 1) & 0x3;

    let mut height = span.min;

    if let Some(span_index) = span.neighbours[dir as usize] {
        let other_cell_index = get_neighbour_index(tile_side, cell_index, dir.into());
        let other_span = &tile.cells[other_cell_index].spans[span_index as usize];

        height = height.max(other_span.min);

        if let Some(span_index) = other_span.neighbours[next_dir as usize] {
            let other_cell_index =
                get_neighbour_index(tile_side, other_cell_index, next_dir.into());
            let other_span = &tile.cells[other_cell_index].spans[span_index as usize];

            height = height.max(other_span.min);
        }
    }

    if let Some(span_index) = span.neighbours[next_dir as usize] {
        let other_cell_index = get_neighbour_index(tile_side, cell_index, next_dir.into());
        let other_span = &tile.cells[other_cell_index].spans[span_index as usize];

        height = height.max(other_span.min);

        if let Some(span_index) = other_span.neighbours[dir as usize] {
            let other_cell_index = get_neighbour_index(tile_side, other_cell_index, dir.into());
            let other_span = &tile.cells[other_cell_index].spans[span_index as usize];

            height = height.max(other_span.min);
        }
    }

    height
}

fn simplify_contour(
    points: &[u32],
    simplified: &mut Vec<UVec4>,
    max_error: f32,
    max_edge_len: u16,
) {
    if points.is_empty() {
        return;
    }

    let has_connections = points
        .chunks_exact(4)
        .any(|point| point[3] & MASK_CONTOUR_REGION != 0);

    if has_connections {
        let length = points.len() / 4;
        for i in 0..length {
            let next = ((i + 1) % length) * 4;
            let i_pre_mul = i * 4;

            let regions_differ = (points[i_pre_mul + 3] & MASK_CONTOUR_REGION)
                != (points[next + 3] & MASK_CONTOUR_REGION);
            if regions_differ {
                simplified.push(UVec4 {
                    x: points[i_pre_mul],
                    y: points[i_pre_mul + 1],
                    z: points[i_pre_mul + 2],
                    w: i as u32,
                });
            }
        }
    }

    if simplified.is_empty() {
        let mut lower_left = UVec4::new(points[0], points[1], points[2], 0);
        let mut upper_right = lower_left;

        for (i, point) in points.chunks_exact(4).enumerate() {
            let (x, y, z) = (point[0], point[1], point[2]);
            if x < lower_left.x || (x == lower_left.x && z < lower_left.z) {
                lower_left = UVec4::new(x, y, z, i as u32);
            }
            if x > upper_right.x || (x == upper_right.x && z > upper_right.z) {
                upper_right = UVec4::new(x, y, z, i as u32);
            }
        }

        simplified.push(lower_left);
        simplified.push(upper_right);
    }

    let point_count = points.len() / 4;
    let mut i = 0;
    while i < simplified.len() {
        let next = (i + 1) % simplified.len();

        let mut a = simplified[i];
        let mut b = simplified[next];

        let (mut c_i, c_increments, end_i) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            let c_increments = 1;
            let c_i = (a.w + c_increments) % point_count as u32;
            let end_i = b.w;
            (c_i, c_increments, end_i)
        } else {
            let c_increments = (point_count - 1) as u32;
            let c_i = (b.w + c_increments) % point_count as u32;
            let end_i = a.w;

            std::mem::swap(&mut a.x, &mut b.x);
            std::mem::swap(&mut a.z, &mut b.z);
            (c_i, c_increments, end_i)
        };

        let mut max_deviation = 0.0;
        let mut max_i = None;

        if (points[(c_i * 4 + 3) as usize] & MASK_CONTOUR_REGION) == 0 {
            // Checking if region is 0. We only tesellate unconnected edges.
            while c_i != end_i {
                let deviation = point_distance_from_segment(
                    UVec2::new(points[(c_i * 4) as usize], points[(c_i * 4 + 2) as usize])
                        .as_ivec2(),
                    UVec2::new(a.x, a.z).as_ivec2(),
                    UVec2::new(b.x, b.z).as_ivec2(),
                );
                if deviation > max_deviation {
                    max_deviation = deviation;
                    max_i = Some(c_i);
                }
                c_i = (c_i + c_increments) % point_count as u32;
            }
        }

        match (max_i, max_deviation > (max_error * max_error)) {
            (Some(max_i), true) => {
                simplified.insert(
                    i + 1,
                    UVec4 {
                        x: points[(max_i * 4) as usize],
                        y: points[(max_i * 4 + 1) as usize],
                        z: points[(max_i * 4 + 2) as usize],
                        w: max_i,
                    },
                );
            }
            _ => {
                i += 1;
            }
        }
    }

    // Split long edges.
    if max_edge_len > 0 {
        let mut i = 0;
        while i < simplified.len() {
            let a = simplified[i];
            let b = simplified[(i + 1) % simplified.len()];

            let next_original_point_index = (a.w + 1) as usize % point_count;
            let should_tesselate =
                points[next_original_point_index * 4 + 3] & MASK_CONTOUR_REGION == 0;

            let mut max_i = None;
            if should_tesselate {
                let delta_x = b.x.abs_diff(a.x);
                let delta_z = b.z.abs_diff(a.z);

                if delta_x * delta_x + delta_z * delta_z > max_edge_len as u32 * max_edge_len as u32
                {
                    let n = if b.w < a.w {
                        b.w as isize + point_count as isize - a.w as isize
                    } else {
                        b.w as isize - a.w as isize
                    };

                    if n > 1 {
                        if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            max_i = Some((a.w as usize + (n / 2) as usize) % point_count);
                        } else {
                            max_i = Some((a.w as usize + ((n + 1) / 2) as usize) % point_count)
                        }
                    }
                }
            }

            if let Some(max_i) = max_i {
                simplified.insert(
                    i + 1,
                    UVec4::new(
                        points[max_i * 4],
                        points[max_i * 4 + 1],
                        points[max_i * 4 + 2],
                        max_i as u32,
                    ),
                );
            } else {
                i += 1;
            }
        }
    }

    for point in simplified.iter_mut() {
        let next = (point.w + 1) % point_count as u32;
        point.w = points[(next * 4 + 3) as usize] & MASK_CONTOUR_REGION;
    }
}

pub(crate) fn point_distance_from_segment(point: IVec2, seg_a: IVec2, seg_b: IVec2) -> f32 {
    let segment_delta = (seg_b - seg_a).as_vec2();
    let point_delta = (point - seg_a).as_vec2();

    let d = segment_delta.x * segment_delta.x + segment_delta.y * segment_delta.y;
    let mut t = segment_delta.x * point_delta.x + segment_delta.y * point_delta.y;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let delta_x = seg_a.x as f32 + t * segment_delta.x - point.x as f32;
    let delta_y = seg_a.y as f32 + t * segment_delta.y - point.y as f32;

    delta_x * delta_x + delta_y * delta_y
}

fn remove_degenerate_segments(simplified: &mut Vec<UVec4>) {
    // Remove adjacent vertices which are equal on xz-plane,
    let mut i = 0;
    while i < simplified.len() && simplified.len() > 1 {
        let next = (i + 1) % simplified.len();

        let a = simplified[i];
        let b = simplified[next];

        if a.x == b.x && a.z == b.z {
            simplified.remove(i);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bevy::math::Vec3;

    use super::*;
    use crate::{
        heightfields::{
            build_open_heightfield_tile, erode_walkable_area, rasterize_triangle, VoxelizedTile,
        },
        regions::build_regions,
    };

    fn build(settings: &NavMeshSettings, hole: bool) -> ContourSet {
        let mut tile = VoxelizedTile::new(settings).unwrap();
        let side = tile.tile_side as f32 * settings.cell_width;
        let y = -settings.world_bottom_bound;

        let mut quad = |min: f32, max: f32, height: f32| {
            for triangle in [
                [
                    Vec3::new(min, y + height, min),
                    Vec3::new(min, y + height, max),
                    Vec3::new(max, y + height, max),
                ],
                [
                    Vec3::new(min, y + height, min),
                    Vec3::new(max, y + height, max),
                    Vec3::new(max, y + height, min),
                ],
            ] {
                rasterize_triangle(&mut tile, triangle, false, Some(Area(0)), false, settings);
            }
        };

        quad(0.0, side, 0.0);
        if hole {
            // A low plate in the middle of the tile leaves no room underneath.
            let center = side / 2.0;
            quad(center - 1.0, center + 1.0, 1.0);
        }

        let mut open_tile = build_open_heightfield_tile(tile, settings).unwrap();
        erode_walkable_area(&mut open_tile, settings);
        build_regions(&mut open_tile, settings).unwrap();

        build_contours(&open_tile, settings).unwrap()
    }

    fn settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
            .with_tile_width(NonZeroU16::new(32).unwrap())
            .with_region_area(0, 10_000)
    }

    #[test]
    fn contour_vertices_are_inside_tile() {
        let settings = settings();
        let contour_set = build(&settings, false);

        assert!(!contour_set.contours.is_empty());

        let tile_width = u32::from(settings.tile_width.get());
        for contour in contour_set.contours.iter() {
            assert!(contour.region & BORDER_REGION == 0);
            assert!(contour.vertices.len() >= 3);

            for vertex in contour.vertices.iter() {
                assert!(vertex.x <= tile_width && vertex.z <= tile_width);
            }
        }
    }

    #[test]
    fn flat_tile_contour_spans_whole_tile() {
        let settings = settings();
        let contour_set = build(&settings, false);

        let tile_width = u32::from(settings.tile_width.get());
        let (min, max) = contour_set
            .contours
            .iter()
            .flat_map(|contour| contour.vertices.iter())
            .fold((u32::MAX, 0), |(min, max), vertex| {
                (min.min(vertex.x), max.max(vertex.x))
            });

        assert_eq!(min, 0);
        assert_eq!(max, tile_width);
    }

    #[test]
    fn holes_are_merged_into_outlines() {
        let settings = settings();
        let contour_set = build(&settings, true);

        assert!(contour_set
            .contours
            .iter()
            .all(|contour| calc_area_of_polygon_2d(&contour.vertices) >= 0));
    }
}
