use bevy::{
    log::warn,
    math::{U16Vec2, U16Vec3, UVec3, Vec3, Vec3Swizzles},
};

#[cfg(feature = "trace")]
use bevy::log::info_span;

use crate::{
    error::{try_reserve, BuildStage, TileBuildError},
    heightfields::OpenTile,
    math::get_neighbour_index,
    mesher::PolyMesh,
    DetailMeshSettings, NavMeshSettings,
};

/// Vertices a single polygon's detail mesh may have. Keeps indices within a ``u8``.
const MAX_VERTS: usize = 127;
const MAX_VERTS_PER_EDGE: usize = 32;
/// Radius in cells searched for a height when a sample lands outside the polygon's region.
const SEARCH_RADIUS: u16 = 3;

/// Range of vertices & triangles in a [`DetailMesh`] belonging to one polygon.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetailSubMesh {
    pub vertex_base: u32,
    pub vertex_count: u32,
    pub triangle_base: u32,
    pub triangle_count: u32,
}

/// Height corrected triangulation of every polygon in a [`PolyMesh`].
///
/// Triangle indices are local to their sub-mesh. The first vertices of a sub-mesh are the polygon's own vertices.
#[derive(Default, Debug)]
pub struct DetailMesh {
    pub meshes: Vec<DetailSubMesh>,
    pub vertices: Vec<U16Vec3>,
    pub triangles: Vec<[u8; 3]>,
}

#[derive(Debug)]
struct HeightPatch {
    min_x: u16,
    min_y: u16,
    width: u16,
    height: u16,

    /// Heights of the area covered by the patch extracted from OpenTile.
    heights: Vec<u16>,
}

/// Scratch buffers reused between polygons.
#[derive(Default)]
struct DetailScratch {
    edges: Vec<u32>,
    triangles: Vec<[u32; 3]>,
    samples: Vec<U16Vec3>,
    vertices: Vec<U16Vec3>,
    hull: Vec<usize>,
    queue: Vec<(usize, usize)>,
}

/// Builds a height corrected "detail" mesh from the poly-mesh.
///
/// Adds vertices at points where the height difference compared to the OpenTile is too great.
/// Returns ``None`` when detail meshes are disabled in the settings.
pub(crate) fn build_detail_mesh(
    nav_mesh_settings: &NavMeshSettings,
    open_tile: &OpenTile,
    poly_mesh: &PolyMesh,
) -> Result<Option<DetailMesh>, TileBuildError> {
    let Some(detail_mesh_settings) = &nav_mesh_settings.detail_mesh_generation else {
        return Ok(None);
    };

    #[cfg(feature = "trace")]
    let _span = info_span!("Build Detail Mesh").entered();

    let tile_width = nav_mesh_settings.tile_width.get();
    let mut max_bounds = U16Vec2::ZERO;

    let polygon_bounds = poly_mesh
        .polygons
        .iter()
        .map(|polygon| {
            let mut min = U16Vec2::splat(tile_width);
            let mut max = U16Vec2::ZERO;

            for i in polygon {
                let vertex = poly_mesh.vertices[*i as usize].xz();

                min = min.min(vertex);
                max = max.max(vertex);
            }

            min = min.saturating_sub(U16Vec2::ONE);
            max = (max + U16Vec2::ONE).min(U16Vec2::splat(tile_width));

            max_bounds = max_bounds.max(max.saturating_sub(min));

            (min, max)
        })
        .collect::<Vec<_>>();

    let mut height_patch = HeightPatch {
        min_x: 0,
        min_y: 0,
        width: 0,
        height: 0,
        heights: Vec::new(),
    };
    let patch_size = usize::from(max_bounds.x) * usize::from(max_bounds.y);
    try_reserve(&mut height_patch.heights, patch_size, BuildStage::DetailMesh)?;
    height_patch.heights.resize(patch_size, u16::MAX);

    let mut detail_mesh = DetailMesh::default();
    try_reserve(
        &mut detail_mesh.meshes,
        poly_mesh.polygons.len(),
        BuildStage::DetailMesh,
    )?;
    try_reserve(
        &mut detail_mesh.vertices,
        poly_mesh.vertices.len() * 2,
        BuildStage::DetailMesh,
    )?;

    let mut scratch = DetailScratch::default();
    let mut polygon_vertices = Vec::with_capacity(crate::mesher::MAX_VERTICES_PER_POLYGON);

    for ((polygon, (min, max)), region) in poly_mesh
        .polygons
        .iter()
        .zip(polygon_bounds.iter())
        .zip(poly_mesh.regions.iter())
    {
        polygon_vertices.clear();
        polygon_vertices.extend(
            polygon
                .iter()
                .map(|index| poly_mesh.vertices[*index as usize]),
        );

        height_patch.min_x = min.x;
        height_patch.min_y = min.y;
        height_patch.width = max.x.saturating_sub(min.x);
        height_patch.height = max.y.saturating_sub(min.y);

        extract_height_data(
            nav_mesh_settings,
            open_tile,
            &polygon_vertices,
            *region,
            &mut height_patch,
            &mut scratch.queue,
        );

        build_poly_detail(
            &height_patch,
            &polygon_vertices,
            detail_mesh_settings,
            &mut scratch,
        );

        try_reserve(
            &mut detail_mesh.vertices,
            scratch.vertices.len(),
            BuildStage::DetailMesh,
        )?;
        try_reserve(
            &mut detail_mesh.triangles,
            scratch.triangles.len(),
            BuildStage::DetailMesh,
        )?;

        detail_mesh.meshes.push(DetailSubMesh {
            vertex_base: detail_mesh.vertices.len() as u32,
            vertex_count: scratch.vertices.len() as u32,
            triangle_base: detail_mesh.triangles.len() as u32,
            triangle_count: scratch.triangles.len() as u32,
        });

        detail_mesh.vertices.extend_from_slice(&scratch.vertices);
        // Less than MAX_VERTS so always fits.
        detail_mesh.triangles.extend(
            scratch
                .triangles
                .iter()
                .map(|[a, b, c]| [*a as u8, *b as u8, *c as u8]),
        );
    }

    Ok(Some(detail_mesh))
}

fn extract_height_data(
    nav_mesh_settings: &NavMeshSettings,
    open_tile: &OpenTile,
    polygon_vertices: &[U16Vec3],
    region: u16,
    height_patch: &mut HeightPatch,
    queue: &mut Vec<(usize, usize)>,
) {
    queue.clear();

    height_patch.heights.fill(u16::MAX);

    let tile_side = open_tile.tile_side;
    // The border acts as a buffer zone around the tile but isn't part of the poly mesh.
    let border = nav_mesh_settings.get_border_side();
    let width = usize::from(height_patch.width);

    let mut empty = true;
    for y in 0..usize::from(height_patch.height) {
        let cell_y = y + usize::from(height_patch.min_y) + border;

        for x in 0..width {
            let cell_x = x + usize::from(height_patch.min_x) + border;
            let cell_i = cell_x + cell_y * tile_side;
            let cell = &open_tile.cells[cell_i];

            let Some((span_i, span)) = cell
                .spans
                .iter()
                .enumerate()
                .find(|(_, span)| span.region == region)
            else {
                continue;
            };

            height_patch.heights[x + y * width] = span.min;
            empty = false;

            let on_region_edge = span
                .neighbours
                .iter()
                .enumerate()
                .filter_map(|(i, neighbour)| Some(i).zip(*neighbour))
                .any(|(i, neighbour)| {
                    let neighbour_i = get_neighbour_index(tile_side, cell_i, i);

                    open_tile.cells[neighbour_i].spans[neighbour as usize].region != region
                });

            if on_region_edge {
                queue.push((cell_i, span_i));
            }
        }
    }

    // If no seed points were found, fall back to the polygon center
    if empty {
        seed_array_with_poly_center(
            open_tile,
            polygon_vertices,
            border,
            queue,
            height_patch,
        );
    }

    // If we go over this, we clear out the first retract_size elements in the queue.
    let retract_size = 256;
    let mut head = 0;

    while head < queue.len() {
        let (cell_i, span_i) = queue[head];

        head += 1;

        if head >= retract_size {
            queue.drain(..retract_size);
            head = 0;
        }

        let open_span = &open_tile.cells[cell_i].spans[span_i];

        for (i, neighbour) in open_span
            .neighbours
            .iter()
            .enumerate()
            .filter_map(|(i, neighbour)| Some(i).zip(*neighbour))
        {
            let neighbour_i = get_neighbour_index(tile_side, cell_i, i);

            let x = neighbour_i % tile_side;
            let y = neighbour_i / tile_side;

            let patch_x = x as isize - height_patch.min_x as isize - border as isize;
            let patch_y = y as isize - height_patch.min_y as isize - border as isize;

            if patch_x < 0
                || patch_y < 0
                || patch_y >= height_patch.height as isize
                || patch_x >= height_patch.width as isize
            {
                continue;
            }

            let patch_i = patch_x as usize + patch_y as usize * width;
            if height_patch.heights[patch_i] != u16::MAX {
                continue;
            }

            let neighbour_span = &open_tile.cells[neighbour_i].spans[neighbour as usize];
            height_patch.heights[patch_i] = neighbour_span.min;

            queue.push((neighbour_i, neighbour as usize));
        }
    }
}

fn seed_array_with_poly_center(
    open_tile: &OpenTile,
    vertices: &[U16Vec3],
    border: usize,
    queue: &mut Vec<(usize, usize)>,
    height_patch: &HeightPatch,
) {
    const OFFSETS: [(i16, i16); 9] = [
        (0, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut start_cell = None;
    let mut best_height_difference = u16::MAX;

    let min_x = height_patch.min_x;
    let max_x = height_patch.min_x + height_patch.width;

    let min_y = height_patch.min_y;
    let max_y = height_patch.min_y + height_patch.height;

    'vertices: for &vertex in vertices {
        for &(offset_x, offset_y) in &OFFSETS {
            let ax = vertex.x.saturating_add_signed(offset_x);
            let az = vertex.z.saturating_add_signed(offset_y);

            if ax < min_x || ax >= max_x || az < min_y || az >= max_y {
                continue;
            }

            let cell_i = (usize::from(ax) + border) + (usize::from(az) + border) * open_tile.tile_side;
            for (span_i, open_span) in open_tile.cells[cell_i].spans.iter().enumerate() {
                let height_difference = vertex.y.abs_diff(open_span.min);
                if height_difference < best_height_difference {
                    start_cell = Some((cell_i, span_i));
                    best_height_difference = height_difference;

                    if best_height_difference == 0 {
                        break 'vertices;
                    }
                }
            }
        }
    }

    let Some(start_cell) = start_cell else {
        return;
    };

    queue.clear();
    queue.push(start_cell);
}

fn distance_pt_seg(point: Vec3, va: Vec3, vb: Vec3) -> f32 {
    let ab = vb - va;
    let length_squared = ab.length_squared();
    if length_squared <= f32::EPSILON {
        return (point - va).length_squared();
    }

    let proj = (point - va).dot(ab) / length_squared;
    let closest = va + ab * proj.clamp(0.0, 1.0);

    (point - closest).length_squared()
}

fn build_poly_detail(
    height_patch: &HeightPatch,
    // Vertices of the polygon we are currently building detail for.
    poly: &[U16Vec3],
    detail_mesh_settings: &DetailMeshSettings,
    scratch: &mut DetailScratch,
) {
    let sample_distance = u32::from(detail_mesh_settings.sample_distance);
    let sample_max_error = f32::from(detail_mesh_settings.max_height_error.get());
    let sample_step = usize::from(detail_mesh_settings.sample_step.get());

    let DetailScratch {
        edges,
        triangles,
        samples,
        vertices: verts,
        hull,
        ..
    } = scratch;

    let mut edge = [U16Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];

    verts.clear();
    verts.extend(poly.iter().cloned());
    edges.clear();
    triangles.clear();
    samples.clear();
    hull.clear();

    let min_extent = poly_min_extent(verts);

    // Tesselate outlines.
    if sample_distance > 0 {
        for i in 0..poly.len() {
            let j = (i + poly.len() - 1) % poly.len();
            let mut vertex_j = poly[j];
            let mut vertex_i = poly[i];
            let mut swapped = false;

            if vertex_j.x == vertex_i.x {
                if vertex_j.z > vertex_i.z {
                    std::mem::swap(&mut vertex_j, &mut vertex_i);
                    swapped = true;
                }
            } else if vertex_j.x > vertex_i.x {
                std::mem::swap(&mut vertex_j, &mut vertex_i);
                swapped = true;
            }

            let delta = vertex_i.as_vec3() - vertex_j.as_vec3();
            let d = (delta.x * delta.x + delta.z * delta.z).sqrt();

            let mut nn = (1 + (d / sample_distance as f32).floor() as usize)
                .min(MAX_VERTS_PER_EDGE - 1);
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len()).max(1);
            }

            for (k, sample) in edge.iter_mut().enumerate().take(nn + 1) {
                let t = k as f32 / nn as f32;
                let mut pos = vertex_j
                    .as_vec3()
                    .lerp(vertex_i.as_vec3(), t)
                    .floor()
                    .as_uvec3();
                pos.y = u32::from(get_height(pos.x, pos.y, pos.z, SEARCH_RADIUS, height_patch));

                *sample = pos.as_u16vec3();
            }

            // Simplify samples
            let mut idx = vec![0, nn];
            let mut k = 0;
            while k < idx.len() - 1 {
                let a = idx[k];
                let b = idx[k + 1];
                let vertex_a = edge[a].as_vec3();
                let vertex_b = edge[b].as_vec3();

                // Find maximum deviation along the segment
                let mut max_dev = 0.0;
                let mut max_i = None;
                for (m, sample) in edge.iter().enumerate().take(b).skip(a + 1) {
                    let dev = distance_pt_seg(sample.as_vec3(), vertex_a, vertex_b);
                    if dev > max_dev {
                        max_dev = dev;
                        max_i = Some(m);
                    }
                }

                match max_i {
                    Some(max_i) if max_dev > sample_max_error * sample_max_error => {
                        idx.insert(k + 1, max_i);
                    }
                    _ => k += 1,
                }
            }

            hull.push(j);

            // Add new vertices
            let inner = &idx[1..idx.len() - 1];
            if swapped {
                for &k in inner.iter().rev() {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &k in inner.iter() {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            }
        }
    } else {
        hull.extend(0..poly.len());
    }

    triangulate_hull(verts, hull, poly.len(), triangles);

    if min_extent < (sample_distance * 2) as f32 || triangles.is_empty() {
        return;
    }

    if sample_distance > 0 {
        let mut min_bounds = poly[0];
        let mut max_bounds = poly[0];

        for vertex in poly.iter().skip(1) {
            min_bounds = min_bounds.min(*vertex);
            max_bounds = max_bounds.max(*vertex);
        }
        let y = ((max_bounds.y as f32 + min_bounds.y as f32) * 0.5).floor() as u16;

        for z in (min_bounds.z..max_bounds.z).step_by(sample_step) {
            for x in (min_bounds.x..max_bounds.x).step_by(sample_step) {
                let point = U16Vec3::new(x, y, z);

                // Make sure the samples are not too close to the edges.
                let distance = dist_to_poly(poly, point.as_vec3());
                if distance > -(sample_distance as f32) / 2.0 {
                    continue;
                }

                let y = get_height(
                    point.x.into(),
                    point.y.into(),
                    point.z.into(),
                    SEARCH_RADIUS,
                    height_patch,
                );

                samples.push(point.with_y(y));
            }
        }

        // Make sure there is at least one sample at the center of the polygon.
        if samples.is_empty() {
            let point_center = poly
                .iter()
                .fold(UVec3::ZERO, |acc, entry| acc + entry.as_uvec3())
                / poly.len() as u32;

            let y = get_height(
                point_center.x,
                point_center.y,
                point_center.z,
                SEARCH_RADIUS,
                height_patch,
            );

            samples.push(point_center.as_u16vec3().with_y(y));
        }

        // Find and add samples with the largest errors
        let nsamples = samples.len();
        for _ in 0..nsamples {
            if verts.len() >= MAX_VERTS {
                break;
            }

            let mut best_point = U16Vec3::ZERO;
            let mut best_distance = 0.0;
            let mut best_i = None;

            for (i, sample) in samples.iter().enumerate() {
                let Some(d) = dist_to_tri_mesh(sample.as_vec3(), verts, triangles) else {
                    continue;
                };

                if d > best_distance {
                    best_distance = d;
                    best_i = Some(i);
                    best_point = *sample;
                }
            }

            // Stop tessellating if error is within the threshold or no sample found
            if best_distance <= sample_max_error {
                break;
            }
            let Some(best_i) = best_i else {
                break;
            };

            samples.swap_remove(best_i);

            verts.push(best_point);

            // Rebuild triangulation
            edges.clear();
            triangles.clear();
            delaunay_hull(verts, hull, triangles, edges);
        }
    }

    // If we failed to add more points, let's just triangulate with the hull again.
    if triangles.is_empty() {
        triangulate_hull(verts, hull, poly.len(), triangles);
    }
}

fn get_height(fx: u32, fy: u32, fz: u32, radius: u16, height_patch: &HeightPatch) -> u16 {
    let initial_x = fx
        .saturating_sub(height_patch.min_x.into())
        .min(u32::from(height_patch.width.saturating_sub(1)));
    let initial_z = fz
        .saturating_sub(height_patch.min_y.into())
        .min(u32::from(height_patch.height.saturating_sub(1)));

    let mut h = height_patch.heights[(initial_x + initial_z * height_patch.width as u32) as usize];
    if h != u16::MAX {
        return h;
    }

    // Search adjacent cells in a spiral up to `radius` for valid height data.
    let mut x = 1;
    let mut z = 0;
    let mut dx = 1;
    let mut dz = 0;
    let max_size = radius * 2 + 1;
    let max_iter = max_size * max_size - 1;

    let mut next_ring_iter_start = 8;
    let mut next_ring_iters = 16;

    let mut min_distance = u32::MAX;
    for i in 0..max_iter {
        let nx = initial_x as i32 + x;
        let nz = initial_z as i32 + z;

        if nx >= 0 && nz >= 0 && nx < height_patch.width.into() && nz < height_patch.height.into()
        {
            let new_height = height_patch.heights[(nx + nz * height_patch.width as i32) as usize];
            if new_height != u16::MAX {
                let d = u32::from(new_height).abs_diff(fy);
                if d < min_distance {
                    h = new_height;
                    min_distance = d;
                }
            }
        }

        // Stop at the end of the first ring that found a height.
        if i + 1 == next_ring_iter_start {
            if h != u16::MAX {
                break;
            }
            next_ring_iter_start += next_ring_iters;
            next_ring_iters += 8;
        }

        if x == z || (x < 0 && x == -z) || (x > 0 && x == (1 - z)) {
            let temp = dx;
            dx = -dz;
            dz = temp;
        }
        x += dx;
        z += dz;
    }

    if h == u16::MAX {
        // Nothing found, keep the height we were given.
        fy as u16
    } else {
        h
    }
}

/// Signed distance on the XZ-plane, negative inside the polygon.
fn dist_to_poly(poly: &[U16Vec3], p: Vec3) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let nvert = poly.len();

    for i in 0..nvert {
        let vi = poly[i].as_vec3();
        let vj = poly[(i + nvert - 1) % nvert].as_vec3();

        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }

        dmin = dmin.min(distance_pt_seg_2d(p, vj, vi));
    }

    if inside {
        -dmin
    } else {
        dmin
    }
}

fn dist_to_tri_mesh(p: Vec3, verts: &[U16Vec3], tris: &[[u32; 3]]) -> Option<f32> {
    let mut minimum_distance: Option<f32> = None;

    for [a, b, c] in tris.iter() {
        let va = verts[*a as usize].as_vec3();
        let vb = verts[*b as usize].as_vec3();
        let vc = verts[*c as usize].as_vec3();

        if let Some(distance) = dist_point_to_triangle(p, va, vb, vc) {
            if minimum_distance.is_none_or(|minimum_distance| distance < minimum_distance) {
                minimum_distance = Some(distance);
            }
        }
    }

    minimum_distance
}

fn distance_pt_seg_2d(pt: Vec3, p: Vec3, q: Vec3) -> f32 {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;

    let dx = pt.x - p.x;
    let dz = pt.z - p.z;

    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;

    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;

    dx * dx + dz * dz
}

/// Vertical distance from ``p`` to the triangle. ``None`` if ``p`` is outside it on the XZ-plane.
fn dist_point_to_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPS: f32 = 1e-4;

    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.xz().dot(v0.xz());
    let dot01 = v0.xz().dot(v1.xz());
    let dot02 = v0.xz().dot(v2.xz());
    let dot11 = v1.xz().dot(v1.xz());
    let dot12 = v1.xz().dot(v2.xz());

    let denom = dot00 * dot11 - dot01 * dot01;
    if denom.abs() <= f32::EPSILON {
        return None;
    }

    let inv_denom = 1.0 / denom;
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + u * v0.y + v * v1.y;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn prev(i: usize, len: usize) -> usize {
    (i + len - 1) % len
}

fn next(i: usize, len: usize) -> usize {
    (i + 1) % len
}

/// Fan-free triangulation of the hull, always advancing the side with the shorter perimeter.
fn triangulate_hull(verts: &[U16Vec3], hull: &[usize], nin: usize, tris: &mut Vec<[u32; 3]>) {
    if hull.len() < 3 {
        return;
    }

    let mut start = 0;
    let mut left = 1;
    let mut right = hull.len() - 1;

    // Start from an ear with the shortest perimeter
    let mut min_perimeter = f32::MAX;
    for i in 0..hull.len() {
        // Only original vertices can be the middle of an ear.
        if hull[i] >= nin {
            continue;
        }

        let pi = prev(i, hull.len());
        let ni = next(i, hull.len());

        let pv = verts[hull[pi]].as_vec3().xz();
        let cv = verts[hull[i]].as_vec3().xz();
        let nv = verts[hull[ni]].as_vec3().xz();

        let perimeter = pv.distance(cv) + cv.distance(nv) + nv.distance(pv);

        if perimeter < min_perimeter {
            start = i;
            left = ni;
            right = pi;
            min_perimeter = perimeter;
        }
    }

    tris.push([hull[start] as u32, hull[left] as u32, hull[right] as u32]);

    while next(left, hull.len()) != right {
        let nleft = next(left, hull.len());
        let nright = prev(right, hull.len());

        let cv_left = verts[hull[left]].as_vec3().xz();
        let nv_left = verts[hull[nleft]].as_vec3().xz();
        let cv_right = verts[hull[right]].as_vec3().xz();
        let nv_right = verts[hull[nright]].as_vec3().xz();

        let dleft = cv_left.distance(nv_left) + nv_left.distance(cv_right);
        let dright = cv_right.distance(nv_right) + cv_left.distance(nv_right);

        if dleft < dright {
            tris.push([hull[left] as u32, hull[nleft] as u32, hull[right] as u32]);
            left = nleft;
        } else {
            tris.push([hull[left] as u32, hull[nright] as u32, hull[right] as u32]);
            right = nright;
        }
    }
}

const UNDEFINED: u32 = u32::MAX;

/// Delaunay triangulation of ``vertices`` constrained by ``hull``.
///
/// Edges are stored as ``[s, t, left face, right face]``.
fn delaunay_hull(
    vertices: &[U16Vec3],
    hull: &[usize],
    triangles: &mut Vec<[u32; 3]>,
    edges: &mut Vec<u32>,
) {
    let mut num_faces = 0;
    let mut num_edges = 0;
    let max_edges = vertices.len() * 10;
    edges.resize(max_edges * 4, UNDEFINED);

    for i in 0..hull.len() {
        let j = prev(i, hull.len());
        add_edge(
            edges,
            &mut num_edges,
            max_edges,
            hull[j] as u32,
            hull[i] as u32,
            UNDEFINED,
            UNDEFINED,
        );
    }

    let mut current_edge = 0;
    while current_edge < num_edges {
        if edges[current_edge * 4 + 2] == UNDEFINED {
            complete_facet(
                vertices,
                edges,
                &mut num_edges,
                max_edges,
                &mut num_faces,
                current_edge,
            );
        }
        if edges[current_edge * 4 + 3] == UNDEFINED {
            complete_facet(
                vertices,
                edges,
                &mut num_edges,
                max_edges,
                &mut num_faces,
                current_edge,
            );
        }
        current_edge += 1;
    }

    triangles.resize(num_faces, [UNDEFINED; 3]);

    for e in edges[..num_edges * 4].chunks_exact(4) {
        if e[3] != UNDEFINED {
            // Left face
            let t = &mut triangles[e[3] as usize];
            if t[0] == UNDEFINED {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] != UNDEFINED {
            // Right face
            let t = &mut triangles[e[2] as usize];
            if t[0] == UNDEFINED {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    // Remove dangling faces
    triangles.retain(|triangle| triangle.iter().all(|index| *index != UNDEFINED));
}

fn complete_facet(
    vertices: &[U16Vec3],
    edges: &mut [u32],
    nedges: &mut usize,
    max_edges: usize,
    nfaces: &mut usize,
    e: usize,
) {
    const EPS: f32 = 1e-5;
    const TOLERANCE: f32 = 0.001;

    let edge = &edges[e * 4..(e + 1) * 4];

    let (s, t) = if edge[2] == UNDEFINED {
        (edge[0], edge[1])
    } else if edge[3] == UNDEFINED {
        (edge[1], edge[0])
    } else {
        // Edge already completed
        return;
    };

    let vertex_s = vertices[s as usize].as_vec3();
    let vertex_t = vertices[t as usize].as_vec3();

    // Find the best point on the left of the edge
    let mut pt = vertices.len();
    let mut c = Vec3::ZERO;
    let mut r = -1.0;
    for (u, vertex_u) in vertices.iter().enumerate() {
        if u == s as usize || u == t as usize {
            continue;
        }
        let vertex_u = vertex_u.as_vec3();

        if vcross2(vertex_s, vertex_t, vertex_u) <= EPS {
            continue;
        }

        if r < 0.0 {
            pt = u;
            (c, r) = circum_circle(vertex_s, vertex_t, vertex_u);
            continue;
        }

        let d = c.xz().distance(vertex_u.xz());
        if d > r * (1.0 + TOLERANCE) {
            // Outside current circumcircle.
            continue;
        } else if d < r * (1.0 - TOLERANCE) {
            pt = u;
            (c, r) = circum_circle(vertex_s, vertex_t, vertex_u);
        } else {
            // Inside epsilon circumcircle, make sure the edges stay valid.
            if overlap_edges(vertices, edges, *nedges, s, u as u32)
                || overlap_edges(vertices, edges, *nedges, t, u as u32)
            {
                continue;
            }

            pt = u;
            (c, r) = circum_circle(vertex_s, vertex_t, vertex_u);
        }
    }

    if pt < vertices.len() {
        let face = *nfaces as u32;
        update_left_face(&mut edges[e * 4..(e + 1) * 4], s, t, face);

        match find_edge(edges, *nedges, pt as u32, s) {
            Some(e) => update_left_face(&mut edges[e * 4..(e + 1) * 4], pt as u32, s, face),
            None => add_edge(edges, nedges, max_edges, pt as u32, s, face, UNDEFINED),
        }

        match find_edge(edges, *nedges, t, pt as u32) {
            Some(e) => update_left_face(&mut edges[e * 4..(e + 1) * 4], t, pt as u32, face),
            None => add_edge(edges, nedges, max_edges, t, pt as u32, face, UNDEFINED),
        }

        *nfaces += 1;
    } else {
        // s-t is on the hull.
        update_left_face(&mut edges[e * 4..(e + 1) * 4], s, t, UNDEFINED - 1);
    }
}

/// Returns the center and radius of the circle through the three points on the XZ-plane.
fn circum_circle(p1: Vec3, p2: Vec3, p3: Vec3) -> (Vec3, f32) {
    const EPS: f32 = 1e-6;

    // Relative to p1 to avoid precision issues.
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = vcross2(Vec3::ZERO, v2, v3);
    if cp.abs() <= EPS {
        return (p1, 0.0);
    }

    let v2_sq = v2.xz().length_squared();
    let v3_sq = v3.xz().length_squared();

    let center = Vec3::new(
        (v2_sq * -v3.z + v3_sq * v2.z) / (2.0 * cp),
        0.0,
        (v2_sq * v3.x - v3_sq * v2.x) / (2.0 * cp),
    );

    (center + p1, center.xz().length())
}

fn overlap_seg_seg_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(vertices: &[U16Vec3], edges: &[u32], nedges: usize, s1: u32, t1: u32) -> bool {
    edges[..nedges * 4].chunks_exact(4).any(|edge| {
        let (s0, t0) = (edge[0], edge[1]);

        // Same or connected edges never overlap.
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            return false;
        }

        overlap_seg_seg_2d(
            vertices[s0 as usize].as_vec3(),
            vertices[t0 as usize].as_vec3(),
            vertices[s1 as usize].as_vec3(),
            vertices[t1 as usize].as_vec3(),
        )
    })
}

// Cross product on the XZ plane, positive when p3 is left of p1->p2.
fn vcross2(p1: Vec3, p2: Vec3, p3: Vec3) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

fn update_left_face(edge: &mut [u32], s: u32, t: u32, f: u32) {
    if edge[0] == s && edge[1] == t && edge[2] == UNDEFINED {
        edge[2] = f;
    } else if edge[1] == s && edge[0] == t && edge[3] == UNDEFINED {
        edge[3] = f;
    }
}

fn find_edge(edges: &[u32], nedges: usize, s: u32, t: u32) -> Option<usize> {
    edges[..nedges * 4]
        .chunks_exact(4)
        .position(|e| (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s))
}

fn add_edge(
    edges: &mut [u32],
    num_edges: &mut usize,
    max_edges: usize,
    s: u32,
    t: u32,
    l: u32,
    r: u32,
) {
    if *num_edges >= max_edges {
        warn!("Too many edges in detail triangulation ({}/{}).", *num_edges, max_edges);
        return;
    }

    if find_edge(edges, *num_edges, s, t).is_none() {
        edges[*num_edges * 4..(*num_edges + 1) * 4].copy_from_slice(&[s, t, l, r]);
        *num_edges += 1;
    }
}

/// Smallest "width" of the polygon on the XZ-plane.
fn poly_min_extent(vertices: &[U16Vec3]) -> f32 {
    let mut min_distance = f32::MAX;
    for i in 0..vertices.len() {
        let next_i = next(i, vertices.len());
        let vertex = vertices[i].as_vec3();
        let next_vertex = vertices[next_i].as_vec3();

        let max_edge_distance = vertices
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && *j != next_i)
            .map(|(_, other)| distance_pt_seg_2d(other.as_vec3(), vertex, next_vertex))
            .fold(0.0_f32, f32::max);

        min_distance = min_distance.min(max_edge_distance);
    }

    min_distance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_patch(width: u16, height: u16, y: u16) -> HeightPatch {
        HeightPatch {
            min_x: 0,
            min_y: 0,
            width,
            height,
            heights: vec![y; usize::from(width) * usize::from(height)],
        }
    }

    #[test]
    fn circum_circle_of_right_triangle() {
        let (center, radius) = circum_circle(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
        );

        assert!((center.x - 1.0).abs() < 1e-5);
        assert!((center.z - 1.0).abs() < 1e-5);
        assert!((radius - 2.0_f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn height_search_falls_back_to_nearby_cells() {
        let mut patch = flat_patch(5, 5, 7);
        patch.heights[12] = u16::MAX; // Center.

        assert_eq!(get_height(2, 0, 2, SEARCH_RADIUS, &patch), 7);
        assert_eq!(get_height(0, 0, 0, SEARCH_RADIUS, &patch), 7);
    }

    #[test]
    fn flat_polygon_needs_no_extra_vertices() {
        let patch = flat_patch(18, 18, 4);
        let poly = [
            U16Vec3::new(1, 4, 1),
            U16Vec3::new(1, 4, 17),
            U16Vec3::new(17, 4, 17),
            U16Vec3::new(17, 4, 1),
        ];
        let settings = DetailMeshSettings::default();
        let mut scratch = DetailScratch::default();

        build_poly_detail(&patch, &poly, &settings, &mut scratch);

        assert!(!scratch.triangles.is_empty());
        assert!(scratch.vertices.iter().all(|vertex| vertex.y == 4));
        assert!(scratch
            .triangles
            .iter()
            .flatten()
            .all(|index| (*index as usize) < scratch.vertices.len()));
    }
}
