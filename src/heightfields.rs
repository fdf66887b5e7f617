use bevy::math::{Affine3A, IVec3, UVec2, Vec3};

use crate::{
    error::{try_reserve, BuildStage, TileBuildError},
    geometry::RawGeometryElement,
    math::get_neighbour_index,
    Area, NavMeshSettings, LOW_HEIGHT_AREA,
};

const MAX_HEIGHT: i32 = u16::MAX as i32;
const DEGENERATE_TRIANGLE_EPSILON: f32 = 1e-6;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HeightSpan {
    pub min: u16,
    pub max: u16,
    pub area: Option<Area>,
}

#[derive(Default, Clone)]
pub(crate) struct VoxelCell {
    pub spans: Vec<HeightSpan>, // Bottom to top.
}

/// Solid heightfield of a tile including its border.
pub(crate) struct VoxelizedTile {
    pub cells: Vec<VoxelCell>, // len = tile_side^2. Laid out X to Z
    pub tile_side: usize,
}

impl VoxelizedTile {
    pub fn new(nav_mesh_settings: &NavMeshSettings) -> Result<Self, TileBuildError> {
        let tile_side = nav_mesh_settings.get_tile_side_with_border();

        let mut cells = Vec::new();
        try_reserve(&mut cells, tile_side * tile_side, BuildStage::Heightfield)?;
        cells.resize(tile_side * tile_side, VoxelCell::default());

        Ok(Self { cells, tile_side })
    }

    pub fn span_count(&self) -> usize {
        self.cells.iter().map(|cell| cell.spans.len()).sum()
    }
}

/// Rasterizes a single instance of ``element`` into the tile.
pub(crate) fn rasterize_geometry_instance(
    voxelized_tile: &mut VoxelizedTile,
    tile_coord: UVec2,
    element: &RawGeometryElement,
    instance: usize,
    nav_mesh_settings: &NavMeshSettings,
) {
    let transform = element.instance_transform(instance);
    let flip_winding = transform_flips_winding(&transform);

    let tile_origin = nav_mesh_settings.get_tile_origin_with_border(tile_coord);
    let tile_origin = Vec3::new(
        tile_origin.x,
        nav_mesh_settings.world_bottom_bound,
        tile_origin.y,
    );

    let vertices = element
        .vertices
        .iter()
        .map(|vertex| transform.transform_point3(*vertex) - tile_origin)
        .collect::<Vec<_>>();

    for triangle in element.triangles.iter() {
        let (Some(a), Some(b), Some(c)) = (
            vertices.get(triangle[0] as usize),
            vertices.get(triangle[1] as usize),
            vertices.get(triangle[2] as usize),
        ) else {
            continue;
        };

        rasterize_triangle(
            voxelized_tile,
            [*a, *b, *c],
            flip_winding,
            element.area,
            element.flags.fill_to_bottom,
            nav_mesh_settings,
        );
    }
}

/// Mirroring transforms reverse the winding of triangles, which would flip their normals.
#[inline]
pub(crate) fn transform_flips_winding(transform: &Affine3A) -> bool {
    transform.matrix3.determinant() < 0.0
}

/// Rasterizes a triangle with vertices relative to the tile origin (with border) & world bottom.
pub(crate) fn rasterize_triangle(
    voxelized_tile: &mut VoxelizedTile,
    triangle: [Vec3; 3],
    flip_winding: bool,
    area: Option<Area>,
    fill_to_bottom: bool,
    nav_mesh_settings: &NavMeshSettings,
) {
    let [a, b, c] = if flip_winding {
        [triangle[0], triangle[2], triangle[1]]
    } else {
        triangle
    };

    let normal = (b - a).cross(c - a);
    let normal_length = normal.length();
    if normal_length < DEGENERATE_TRIANGLE_EPSILON {
        return;
    }

    let traversable =
        normal.y / normal_length > nav_mesh_settings.max_traversable_slope_radians.cos();
    let area = if traversable { area } else { None };

    let tile_side = voxelized_tile.tile_side as i32;
    let cell_width = nav_mesh_settings.cell_width;

    let min_bound = (a.min(b).min(c) / cell_width).floor().as_ivec3();
    let max_bound = (a.max(b).max(c) / cell_width).floor().as_ivec3();

    // Check if triangle is completely outside the tile.
    if max_bound.x < 0 || max_bound.z < 0 || min_bound.x >= tile_side || min_bound.z >= tile_side
    {
        return;
    }

    let clamped_bound_min = min_bound.max(IVec3::ZERO);
    let clamped_bound_max = max_bound.min(IVec3::new(tile_side - 1, 0, tile_side - 1));

    let vertices = [a, b, c, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO, Vec3::ZERO];

    // For cache reasons we go.
    // --> X
    // Z
    // |
    // V
    // X is column. Z is row.
    // Which means we iterate Z first.
    for z in clamped_bound_min.z..=clamped_bound_max.z {
        let row_clip_min = z as f32 * cell_width;
        let row_clip_max = row_clip_min + cell_width;

        // Clip polygon to the row.
        let (_, _, row_min_clip_vert_count, row_min_clip_verts) =
            divide_polygon(&vertices, 3, row_clip_min, 2);
        let (row_vert_count, row_verts, _, _) = divide_polygon(
            &row_min_clip_verts,
            row_min_clip_vert_count,
            row_clip_max,
            2,
        );
        if row_vert_count < 3 {
            continue;
        }

        // Calculate the column footprint of the row.
        let mut column_min_vert_x = row_verts[0].x;
        let mut column_max_vert_x = row_verts[0].x;
        for vertex in row_verts.iter().take(row_vert_count).skip(1) {
            column_min_vert_x = column_min_vert_x.min(vertex.x);
            column_max_vert_x = column_max_vert_x.max(vertex.x);
        }
        let column_min = ((column_min_vert_x / cell_width).floor() as i32).max(0);
        let column_max = ((column_max_vert_x / cell_width).floor() as i32).min(tile_side - 1);

        for x in column_min..=column_max {
            let column_clip_min = x as f32 * cell_width;
            let column_clip_max = column_clip_min + cell_width;

            // Clip polygon to column.
            let (_, _, column_min_clip_vert_count, column_min_clip_verts) =
                divide_polygon(&row_verts, row_vert_count, column_clip_min, 0);
            let (column_vert_count, column_verts, _, _) = divide_polygon(
                &column_min_clip_verts,
                column_min_clip_vert_count,
                column_clip_max,
                0,
            );
            if column_vert_count < 3 {
                continue;
            }

            let mut square_min_height = column_verts[0].y;
            let mut square_max_height = column_verts[0].y;
            for vertex in column_verts.iter().take(column_vert_count).skip(1) {
                square_min_height = square_min_height.min(vertex.y);
                square_max_height = square_max_height.max(vertex.y);
            }

            if square_max_height < 0.0 {
                continue;
            }

            let min_height = if fill_to_bottom {
                0
            } else {
                ((square_min_height / nav_mesh_settings.cell_height).floor() as i32)
                    .clamp(0, MAX_HEIGHT - 1)
            };
            let max_height = ((square_max_height / nav_mesh_settings.cell_height).ceil() as i32)
                .clamp(min_height + 1, MAX_HEIGHT);

            let index = (x + z * tile_side) as usize;
            add_span(
                &mut voxelized_tile.cells[index],
                HeightSpan {
                    min: min_height as u16,
                    max: max_height as u16,
                    area,
                },
                nav_mesh_settings.step_height,
            );
        }
    }
}

/// Inserts ``new_span`` into the cell, merging it with any spans it overlaps.
fn add_span(cell: &mut VoxelCell, mut new_span: HeightSpan, step_height: u16) {
    let mut i = 0;
    while i < cell.spans.len() {
        let existing_span = cell.spans[i];
        if existing_span.min > new_span.max {
            // i is beyond the new span. We can insert!
            break;
        } else if existing_span.max < new_span.min {
            // i is before the new span. Continue until we hit one that isn't.
            i += 1;
            continue;
        }

        // An overlap! The surface on top decides the area.
        let merged_max = existing_span.max.max(new_span.max);
        let new_top_area = if merged_max - new_span.max <= step_height {
            new_span.area
        } else {
            None
        };
        let existing_top_area = if merged_max - existing_span.max <= step_height {
            existing_span.area
        } else {
            None
        };

        new_span = HeightSpan {
            min: existing_span.min.min(new_span.min),
            max: merged_max,
            area: new_top_area.max(existing_top_area),
        };
        cell.spans.remove(i);
    }
    cell.spans.insert(i, new_span);
}

/*
*   This function takes in a polygon (of max 7 vertices), an line on which to divide it, and an axis.
*   It then returns the left polygon's vertex count, the left polygon's vertices,
*   the right polygon's vertex count, and the right polygon's vertices.
*/
fn divide_polygon(
    vertices: &[Vec3; 7],
    vertex_count_in: usize,
    clip_line: f32,
    axis: usize,
) -> (usize, [Vec3; 7], usize, [Vec3; 7]) {
    let mut polygon_a = [Vec3::ZERO; 7];
    let mut polygon_b = [Vec3::ZERO; 7];

    let mut delta_from_line = [0.0; 7];
    // This loop determines which side of the line the vertex is on.
    for i in 0..vertex_count_in {
        delta_from_line[i] = clip_line - vertices[i][axis];
    }

    let mut verts_a = 0;
    let mut verts_b = 0;

    for i in 0..vertex_count_in {
        let j = (vertex_count_in - 1 + i) % vertex_count_in; // j is i-1 wrapped.

        let in_a = delta_from_line[j] >= 0.0;
        let in_b = delta_from_line[i] >= 0.0;

        // Check if both vertices are on the same side of the line.
        if in_a != in_b {
            // We slide the vertex along to the edge.
            let slide = delta_from_line[j] / (delta_from_line[j] - delta_from_line[i]);

            polygon_a[verts_a] = vertices[j] + (vertices[i] - vertices[j]) * slide;
            polygon_b[verts_b] = polygon_a[verts_a];
            verts_a += 1;
            verts_b += 1;

            if delta_from_line[i] > 0.0 {
                polygon_a[verts_a] = vertices[i];
                verts_a += 1;
            } else if delta_from_line[i] < 0.0 {
                polygon_b[verts_b] = vertices[i];
                verts_b += 1;
            }
        } else {
            if delta_from_line[i] >= 0.0 {
                polygon_a[verts_a] = vertices[i];
                verts_a += 1;

                if delta_from_line[i] != 0.0 {
                    continue;
                }
            }
            polygon_b[verts_b] = vertices[i];
            verts_b += 1;
        }
    }
    (verts_a, polygon_a, verts_b, polygon_b)
}

/// Lets unwalkable spans directly above walkable ones (like curbs & stair steps) be walked on if they are within ``step_height``.
pub(crate) fn filter_low_hanging_walkable_obstacles(
    voxelized_tile: &mut VoxelizedTile,
    nav_mesh_settings: &NavMeshSettings,
) {
    let step_height = i32::from(nav_mesh_settings.step_height);

    for cell in voxelized_tile.cells.iter_mut() {
        let mut previous_walkable = false;
        let mut previous_area = None;
        let mut previous_max = 0;

        for span in cell.spans.iter_mut() {
            let walkable = span.area.is_some();

            if !walkable
                && previous_walkable
                && i32::from(span.max) - previous_max <= step_height
            {
                span.area = previous_area;
            }

            previous_walkable = walkable;
            previous_area = span.area;
            previous_max = i32::from(span.max);
        }
    }
}

/// Removes spans where stepping off in some direction would drop further than ``step_height``, or where the neighbouring floors are too uneven.
pub(crate) fn filter_ledge_spans(
    voxelized_tile: &mut VoxelizedTile,
    nav_mesh_settings: &NavMeshSettings,
) {
    let tile_side = voxelized_tile.tile_side;
    let walkable_height = i32::from(nav_mesh_settings.walkable_height);
    let step_height = i32::from(nav_mesh_settings.step_height);

    let mut ledges = Vec::new();

    for z in 0..tile_side {
        for x in 0..tile_side {
            let cell_index = x + z * tile_side;
            let spans = &voxelized_tile.cells[cell_index].spans;

            for (span_index, span) in spans.iter().enumerate() {
                if span.area.is_none() {
                    continue;
                }

                let bottom = i32::from(span.max);
                let top = spans
                    .get(span_index + 1)
                    .map_or(MAX_HEIGHT, |next| i32::from(next.min));

                let mut min_neighbour_height = MAX_HEIGHT;
                let mut accessible_min = bottom;
                let mut accessible_max = bottom;

                for dir in 0..4 {
                    let neighbour_x = match dir {
                        0 => x.checked_sub(1),
                        2 => Some(x + 1).filter(|x| *x < tile_side),
                        _ => Some(x),
                    };
                    let neighbour_z = match dir {
                        3 => z.checked_sub(1),
                        1 => Some(z + 1).filter(|z| *z < tile_side),
                        _ => Some(z),
                    };
                    let (Some(neighbour_x), Some(neighbour_z)) = (neighbour_x, neighbour_z) else {
                        // Outside the tile counts as a drop.
                        min_neighbour_height = min_neighbour_height.min(-step_height - bottom);
                        continue;
                    };

                    let neighbour_spans =
                        &voxelized_tile.cells[neighbour_x + neighbour_z * tile_side].spans;

                    // Space below the first neighbour span.
                    let neighbour_bottom = -step_height;
                    let neighbour_top = neighbour_spans
                        .first()
                        .map_or(MAX_HEIGHT, |span| i32::from(span.min));
                    if top.min(neighbour_top) - bottom.max(neighbour_bottom) > walkable_height {
                        min_neighbour_height = min_neighbour_height.min(neighbour_bottom - bottom);
                    }

                    for (i, neighbour_span) in neighbour_spans.iter().enumerate() {
                        let neighbour_bottom = i32::from(neighbour_span.max);
                        let neighbour_top = neighbour_spans
                            .get(i + 1)
                            .map_or(MAX_HEIGHT, |span| i32::from(span.min));

                        if top.min(neighbour_top) - bottom.max(neighbour_bottom) > walkable_height {
                            min_neighbour_height =
                                min_neighbour_height.min(neighbour_bottom - bottom);

                            if (neighbour_bottom - bottom).abs() <= step_height {
                                accessible_min = accessible_min.min(neighbour_bottom);
                                accessible_max = accessible_max.max(neighbour_bottom);
                            }
                        }
                    }
                }

                if min_neighbour_height < -step_height
                    || accessible_max - accessible_min > step_height
                {
                    ledges.push((cell_index, span_index));
                }
            }
        }
    }

    for (cell_index, span_index) in ledges {
        voxelized_tile.cells[cell_index].spans[span_index].area = None;
    }
}

/// Removes (or marks as [`LOW_HEIGHT_AREA`]) spans without enough room above them for the agent.
pub(crate) fn filter_walkable_low_height_spans(
    voxelized_tile: &mut VoxelizedTile,
    nav_mesh_settings: &NavMeshSettings,
) {
    let walkable_height = i32::from(nav_mesh_settings.walkable_height);

    for cell in voxelized_tile.cells.iter_mut() {
        for i in 0..cell.spans.len() {
            let bottom = i32::from(cell.spans[i].max);
            let top = cell
                .spans
                .get(i + 1)
                .map_or(MAX_HEIGHT, |next| i32::from(next.min));

            if top - bottom >= walkable_height {
                continue;
            }

            let span = &mut cell.spans[i];
            span.area = if nav_mesh_settings.mark_low_height_areas && span.area.is_some() {
                Some(LOW_HEIGHT_AREA)
            } else {
                None
            };
        }
    }
}

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct OpenSpan {
    pub min: u16,
    pub max: Option<u16>,
    pub neighbours: [Option<u16>; 4],
    pub tile_index: usize, // The index of this span in the whole tile.
    pub region: u16,
}

#[derive(Default, Clone, Debug)]
pub struct OpenCell {
    pub spans: Vec<OpenSpan>,
}

/// Compact heightfield of the open (walkable) space above spans.
#[derive(Default, Debug)]
pub struct OpenTile {
    pub cells: Vec<OpenCell>, // len = tile_side^2. Laid out X to Z
    pub distances: Vec<u16>,  // Distances used in watershed. One per span. Use tile_index to go from span to distance.
    pub areas: Vec<Option<Area>>,
    pub max_distance: u16,
    pub span_count: usize, // Total spans in all cells.
    pub max_regions: u16,
    pub tile_side: usize,
}

/// Builds the compact heightfield from the walkable spans of ``voxelized_tile``.
pub(crate) fn build_open_heightfield_tile(
    voxelized_tile: VoxelizedTile,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<OpenTile, TileBuildError> {
    let tile_side = voxelized_tile.tile_side;

    let mut cells = Vec::new();
    try_reserve(&mut cells, tile_side * tile_side, BuildStage::CompactHeightfield)?;
    cells.resize(tile_side * tile_side, OpenCell::default());

    let mut areas = Vec::new();
    let mut span_count = 0;

    // First we create open spaces.
    for (voxel_cell, open_cell) in voxelized_tile.cells.iter().zip(cells.iter_mut()) {
        let mut iter = voxel_cell.spans.iter().peekable();
        while let Some(span) = iter.next() {
            if span.area.is_none() {
                // Skip untraversable. Not filtered because we still need to peek at them so.
                continue;
            }

            open_cell.spans.push(OpenSpan {
                min: span.max,
                max: iter.peek().map(|next_span| next_span.min),
                tile_index: span_count,
                ..Default::default()
            });

            try_reserve(&mut areas, 1, BuildStage::CompactHeightfield)?;
            areas.push(span.area);
            span_count += 1;
        }
    }

    let mut open_tile = OpenTile {
        cells,
        distances: vec![u16::MAX; span_count],
        areas,
        max_distance: 0,
        span_count,
        max_regions: 0,
        tile_side,
    };

    link_neighbours(&mut open_tile, nav_mesh_settings);

    Ok(open_tile)
}

/// Connects every span to the spans of the neighbouring cells the agent can move to.
pub(crate) fn link_neighbours(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = open_tile.tile_side;
    // Spans that will be retagged as low height areas only need some room to connect.
    let required_clearance = if nav_mesh_settings.mark_low_height_areas {
        1
    } else {
        i32::from(nav_mesh_settings.walkable_height)
    };
    let step_height = i32::from(nav_mesh_settings.step_height);

    for cell_index in 0..open_tile.cells.len() {
        let row = cell_index / tile_side;
        let column = cell_index % tile_side;

        for span_index in 0..open_tile.cells[cell_index].spans.len() {
            let mut neighbours = [None; 4];

            {
                let span = &open_tile.cells[cell_index].spans[span_index];
                let span_top = span.max.map_or(MAX_HEIGHT, i32::from);

                for (dir, neighbour) in neighbours.iter_mut().enumerate() {
                    let contained = match dir {
                        0 => column > 0,
                        1 => row < tile_side - 1,
                        2 => column < tile_side - 1,
                        _ => row > 0,
                    };
                    if !contained {
                        continue;
                    }

                    let other_cell =
                        &open_tile.cells[get_neighbour_index(tile_side, cell_index, dir)];
                    for (i, other_span) in other_cell.spans.iter().enumerate() {
                        let other_top = other_span.max.map_or(MAX_HEIGHT, i32::from);

                        let bottom = i32::from(span.min.max(other_span.min));
                        let top = span_top.min(other_top);

                        if top - bottom >= required_clearance
                            && (i32::from(other_span.min) - i32::from(span.min)).abs()
                                <= step_height
                        {
                            *neighbour = Some(i as u16);
                            break;
                        }
                    }
                }
            }

            open_tile.cells[cell_index].spans[span_index].neighbours = neighbours;
        }
    }
}

/// Chamfer distance transform. ``distances`` must be initialized with 0 on boundaries and ``u16::MAX`` elsewhere.
fn calculate_distances(open_tile: &OpenTile, distances: &mut [u16]) {
    let tile_side = open_tile.tile_side;

    // Pass 1.
    for (i, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let mut distance = distances[span.tile_index];

            if let Some(index) = span.neighbours[0] {
                // (-1, 0)
                let other_cell_index = get_neighbour_index(tile_side, i, 0);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];

                distance = distance.min(distances[other_span.tile_index].saturating_add(2));

                // (-1, -1)
                if let Some(index) = other_span.neighbours[3] {
                    let other_span = &open_tile.cells
                        [get_neighbour_index(tile_side, other_cell_index, 3)]
                    .spans[index as usize];

                    distance = distance.min(distances[other_span.tile_index].saturating_add(3));
                }
            }

            if let Some(index) = span.neighbours[3] {
                // (0, -1)
                let other_cell_index = get_neighbour_index(tile_side, i, 3);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];

                distance = distance.min(distances[other_span.tile_index].saturating_add(2));

                // (1, -1)
                if let Some(index) = other_span.neighbours[2] {
                    let other_span = &open_tile.cells
                        [get_neighbour_index(tile_side, other_cell_index, 2)]
                    .spans[index as usize];

                    distance = distance.min(distances[other_span.tile_index].saturating_add(3));
                }
            }

            distances[span.tile_index] = distance;
        }
    }

    // Pass 2
    for (i, cell) in open_tile.cells.iter().enumerate().rev() {
        for span in cell.spans.iter() {
            let mut distance = distances[span.tile_index];

            if let Some(index) = span.neighbours[2] {
                // (1, 0)
                let other_cell_index = get_neighbour_index(tile_side, i, 2);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];

                distance = distance.min(distances[other_span.tile_index].saturating_add(2));

                // (1, 1)
                if let Some(index) = other_span.neighbours[1] {
                    let other_span = &open_tile.cells
                        [get_neighbour_index(tile_side, other_cell_index, 1)]
                    .spans[index as usize];

                    distance = distance.min(distances[other_span.tile_index].saturating_add(3));
                }
            }

            if let Some(index) = span.neighbours[1] {
                // (0, 1)
                let other_cell_index = get_neighbour_index(tile_side, i, 1);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];

                distance = distance.min(distances[other_span.tile_index].saturating_add(2));

                // (-1, 1)
                if let Some(index) = other_span.neighbours[0] {
                    let other_span = &open_tile.cells
                        [get_neighbour_index(tile_side, other_cell_index, 0)]
                    .spans[index as usize];

                    distance = distance.min(distances[other_span.tile_index].saturating_add(3));
                }
            }

            distances[span.tile_index] = distance;
        }
    }
}

/// Removes walkable spans closer than ``walkable_radius`` to anything unwalkable.
///
/// With ``mark_low_height_areas`` low height spans act as obstacles but are kept.
pub(crate) fn erode_walkable_area(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = open_tile.tile_side;
    let is_obstacle = |area: Option<Area>| {
        area.is_none() || (nav_mesh_settings.mark_low_height_areas && area == Some(LOW_HEIGHT_AREA))
    };

    let mut distances = vec![u16::MAX; open_tile.span_count];

    for (i, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            if is_obstacle(open_tile.areas[span.tile_index]) {
                distances[span.tile_index] = 0;
                continue;
            }

            let on_boundary = (0..4).any(|dir| {
                let Some(index) = span.neighbours[dir] else {
                    return true;
                };

                let other_span =
                    &open_tile.cells[get_neighbour_index(tile_side, i, dir)].spans[index as usize];
                is_obstacle(open_tile.areas[other_span.tile_index])
            });

            if on_boundary {
                distances[span.tile_index] = 0;
            }
        }
    }

    calculate_distances(open_tile, &mut distances);

    let threshold = nav_mesh_settings.walkable_radius.saturating_mul(2);
    for (area, distance) in open_tile.areas.iter_mut().zip(distances.iter()) {
        if *distance < threshold && !is_obstacle(*area) {
            *area = None;
        }
    }
}

/// Calculates the distance to the closest edge of the area for every span & blurs it. Used by watershed partitioning.
pub(crate) fn calculate_distance_field(open_tile: &mut OpenTile) {
    let tile_side = open_tile.tile_side;

    let mut distances = vec![u16::MAX; open_tile.span_count];

    for (i, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let area = open_tile.areas[span.tile_index];

            let on_boundary = (0..4).any(|dir| {
                let Some(index) = span.neighbours[dir] else {
                    return true;
                };

                let other_span =
                    &open_tile.cells[get_neighbour_index(tile_side, i, dir)].spans[index as usize];
                open_tile.areas[other_span.tile_index] != area
            });

            if on_boundary {
                distances[span.tile_index] = 0;
            }
        }
    }

    calculate_distances(open_tile, &mut distances);

    open_tile.max_distance = distances.iter().copied().max().unwrap_or(0);

    // Box blur.
    let threshold = 2;
    let mut blurred = distances.clone();

    for (i, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            let distance = distances[span.tile_index];
            if distance <= threshold {
                continue;
            }

            let mut d = u32::from(distance);
            for dir in 0..4 {
                let Some(index) = span.neighbours[dir] else {
                    d += u32::from(distance) * 2;
                    continue;
                };

                let other_cell_index = get_neighbour_index(tile_side, i, dir);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];

                d += u32::from(distances[other_span.tile_index]);

                let next_dir = (dir + 1) & 0x3;
                let Some(index) = other_span.neighbours[next_dir] else {
                    d += u32::from(distance);
                    continue;
                };

                let other_span = &open_tile.cells
                    [get_neighbour_index(tile_side, other_cell_index, next_dir)]
                .spans[index as usize];

                d += u32::from(distances[other_span.tile_index]);
            }

            blurred[span.tile_index] = ((d + 5) / 9) as u16;
        }
    }

    open_tile.distances = blurred;
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::*;

    pub(crate) fn test_settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
            .with_tile_width(NonZeroU16::new(32).unwrap())
            .with_walkable_radius(2)
    }

    fn flat_quad(voxelized_tile: &mut VoxelizedTile, y: f32, settings: &NavMeshSettings) {
        let size = voxelized_tile.tile_side as f32 * settings.cell_width;
        let y = y - settings.world_bottom_bound;

        for triangle in [
            [
                Vec3::new(0.0, y, 0.0),
                Vec3::new(0.0, y, size),
                Vec3::new(size, y, size),
            ],
            [
                Vec3::new(0.0, y, 0.0),
                Vec3::new(size, y, size),
                Vec3::new(size, y, 0.0),
            ],
        ] {
            rasterize_triangle(
                voxelized_tile,
                triangle,
                false,
                Some(Area(0)),
                false,
                settings,
            );
        }
    }

    #[test]
    fn flat_quad_covers_every_cell() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();

        flat_quad(&mut tile, 0.0, &settings);

        assert!(tile.cells.iter().all(|cell| cell.spans.len() == 1));
        assert!(tile
            .cells
            .iter()
            .all(|cell| cell.spans[0].area == Some(Area(0))));
    }

    #[test]
    fn flipped_winding_changes_walkability() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();

        let y = 10.0;
        // Clockwise seen from above, normal points down.
        let triangle = [
            Vec3::new(0.0, y, 0.0),
            Vec3::new(2.0, y, 0.0),
            Vec3::new(0.0, y, 2.0),
        ];

        rasterize_triangle(&mut tile, triangle, false, Some(Area(0)), false, &settings);
        assert!(tile.cells[0].spans[0].area.is_none());

        let mut tile = VoxelizedTile::new(&settings).unwrap();
        rasterize_triangle(&mut tile, triangle, true, Some(Area(0)), false, &settings);
        assert_eq!(tile.cells[0].spans[0].area, Some(Area(0)));

        assert!(transform_flips_winding(&Affine3A::from_scale(Vec3::new(
            -1.0, 1.0, 1.0
        ))));
        assert!(!transform_flips_winding(&Affine3A::from_scale(Vec3::new(
            -1.0, -1.0, 1.0
        ))));
    }

    #[test]
    fn degenerate_triangles_are_skipped() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();

        rasterize_triangle(
            &mut tile,
            [Vec3::new(1.0, 5.0, 1.0); 3],
            false,
            Some(Area(0)),
            false,
            &settings,
        );

        assert_eq!(tile.span_count(), 0);
    }

    #[test]
    fn overlapping_spans_merge() {
        let mut cell = VoxelCell::default();

        add_span(
            &mut cell,
            HeightSpan {
                min: 0,
                max: 10,
                area: None,
            },
            2,
        );
        add_span(
            &mut cell,
            HeightSpan {
                min: 20,
                max: 22,
                area: Some(Area(1)),
            },
            2,
        );
        add_span(
            &mut cell,
            HeightSpan {
                min: 5,
                max: 11,
                area: Some(Area(3)),
            },
            2,
        );

        assert_eq!(
            cell.spans,
            vec![
                HeightSpan {
                    min: 0,
                    max: 11,
                    area: Some(Area(3))
                },
                HeightSpan {
                    min: 20,
                    max: 22,
                    area: Some(Area(1))
                }
            ]
        );

        // Far below the top, the unwalkable top wins.
        add_span(
            &mut cell,
            HeightSpan {
                min: 18,
                max: 30,
                area: None,
            },
            2,
        );
        assert_eq!(cell.spans[1].area, None);
    }

    #[test]
    fn low_ceiling_is_filtered() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();

        flat_quad(&mut tile, 0.0, &settings);
        // Ceiling one cell above the floor.
        flat_quad(&mut tile, settings.cell_height * 2.0, &settings);

        filter_walkable_low_height_spans(&mut tile, &settings);
        assert!(tile.cells.iter().all(|cell| cell.spans[0].area.is_none()));

        let settings = settings.with_low_height_area_marking(true);
        let mut tile = VoxelizedTile::new(&settings).unwrap();
        flat_quad(&mut tile, 0.0, &settings);
        flat_quad(&mut tile, settings.cell_height * 2.0, &settings);

        filter_walkable_low_height_spans(&mut tile, &settings);
        assert!(tile
            .cells
            .iter()
            .all(|cell| cell.spans[0].area == Some(LOW_HEIGHT_AREA)));
    }

    #[test]
    fn erosion_pulls_back_from_edges() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();
        flat_quad(&mut tile, 0.0, &settings);

        filter_ledge_spans(&mut tile, &settings);

        let mut open_tile = build_open_heightfield_tile(tile, &settings).unwrap();
        erode_walkable_area(&mut open_tile, &settings);

        let side = open_tile.tile_side;
        let radius = usize::from(settings.walkable_radius);
        for (i, cell) in open_tile.cells.iter().enumerate() {
            let x = i % side;
            let z = i / side;
            let edge_distance = x.min(z).min(side - 1 - x).min(side - 1 - z);

            for span in cell.spans.iter() {
                let walkable = open_tile.areas[span.tile_index].is_some();
                // Ledge filter removes the outermost ring, erosion removes ``radius`` more.
                assert_eq!(walkable, edge_distance > radius, "cell ({x}, {z})");
            }
        }
    }

    #[test]
    fn neighbours_link_within_step_height() {
        let settings = test_settings();
        let mut tile = VoxelizedTile::new(&settings).unwrap();
        flat_quad(&mut tile, 0.0, &settings);

        let open_tile = build_open_heightfield_tile(tile, &settings).unwrap();
        let side = open_tile.tile_side;

        let center = &open_tile.cells[side * (side / 2) + side / 2].spans[0];
        assert!(center.neighbours.iter().all(Option::is_some));

        let corner = &open_tile.cells[0].spans[0];
        assert_eq!(corner.neighbours[0], None);
        assert_eq!(corner.neighbours[3], None);
        assert!(corner.neighbours[1].is_some());
        assert!(corner.neighbours[2].is_some());
    }
}
