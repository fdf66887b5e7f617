use bevy::{
    log::warn,
    math::{IVec4, U16Vec3, UVec2, UVec4},
};
use smallvec::SmallVec;

use crate::{
    contour::ContourSet,
    error::{try_reserve, BuildStage, LimitExceeded, TileBuildError},
    math::{intersect, intersect_prop, left, left_on},
    Area, NavMeshSettings,
};

/// Upper bound of [`NavMeshSettings::max_vertices_per_polygon`].
pub const MAX_VERTICES_PER_POLYGON: usize = 6;
/// Polygon meshes are addressed with ``u16`` indices.
pub(crate) const MAX_MESH_VERTICES: usize = 0xffff;

pub type PolygonIndices = SmallVec<[u32; MAX_VERTICES_PER_POLYGON]>;
pub type PolygonEdges = SmallVec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>;

/// Convex polygons of a single layer. Vertices are in cells relative to the tile origin.
#[derive(Default, Debug)]
pub struct PolyMesh {
    pub vertices: Vec<U16Vec3>,
    pub polygons: Vec<PolygonIndices>,
    pub edges: Vec<PolygonEdges>, // For each polygon edge points to a polygon (if any) that shares the edge.
    pub areas: Vec<Area>,
    pub regions: Vec<u16>,
}

const VERTEX_BUCKET_COUNT: usize = 1 << 12; // 4 096

pub(crate) fn build_poly_mesh(
    contour_set: &ContourSet,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<PolyMesh, TileBuildError> {
    let max_vertices_per_polygon = usize::from(nav_mesh_settings.max_vertices_per_polygon)
        .clamp(3, MAX_VERTICES_PER_POLYGON);

    let mut max_vertices = 0;
    let mut max_tris = 0;
    let mut max_verts_per_contour = 0;

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        max_vertices += contour.vertices.len();
        max_tris += contour.vertices.len() - 2;
        max_verts_per_contour = contour.vertices.len().max(max_verts_per_contour);
    }

    let mut poly_mesh = PolyMesh::default();
    try_reserve(&mut poly_mesh.vertices, max_vertices, BuildStage::PolyMesh)?;
    try_reserve(&mut poly_mesh.polygons, max_tris, BuildStage::PolyMesh)?;
    try_reserve(&mut poly_mesh.areas, max_tris, BuildStage::PolyMesh)?;
    try_reserve(&mut poly_mesh.regions, max_tris, BuildStage::PolyMesh)?;

    let mut first_vertex = vec![-1; VERTEX_BUCKET_COUNT];
    let mut next_vertex = vec![0; max_vertices];

    let mut indices = Vec::with_capacity(max_verts_per_contour);
    let mut triangles = Vec::with_capacity(max_verts_per_contour * 3);
    let mut polygons: Vec<PolygonIndices> = Vec::with_capacity(max_verts_per_contour + 1);

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        indices.clear();
        triangles.clear();
        polygons.clear();

        indices.extend(0..contour.vertices.len() as u32);

        if !triangulate(&contour.vertices, &mut indices, &mut triangles) {
            warn!(
                "Triangulation failed for contour of region {}. Output may be missing polygons.",
                contour.region
            );
        }

        indices.clear();
        for vertex in contour.vertices.iter() {
            let index = add_vertex(
                U16Vec3::new(vertex.x as u16, vertex.y as u16, vertex.z as u16),
                &mut poly_mesh.vertices,
                &mut first_vertex,
                &mut next_vertex,
            );

            if poly_mesh.vertices.len() >= MAX_MESH_VERTICES {
                return Err(LimitExceeded::Vertices.into());
            }

            indices.push(index);
        }

        for triangle in triangles.chunks_exact(3) {
            let (a, b, c) = (triangle[0], triangle[1], triangle[2]);

            if a != b && a != c && b != c {
                polygons.push(SmallVec::from_slice(&[
                    indices[a as usize],
                    indices[b as usize],
                    indices[c as usize],
                ]));
            }
        }

        if polygons.is_empty() {
            continue;
        }

        if max_vertices_per_polygon > 3 {
            merge_polygons(&mut polygons, &poly_mesh.vertices, max_vertices_per_polygon);
        }

        // Store polygons.
        try_reserve(&mut poly_mesh.polygons, polygons.len(), BuildStage::PolyMesh)?;
        poly_mesh.polygons.extend(polygons.drain(..));
        poly_mesh
            .areas
            .resize(poly_mesh.polygons.len(), contour.area);
        poly_mesh
            .regions
            .resize(poly_mesh.polygons.len(), contour.region);
    }

    // For each edge, find other polygon that shares that edge.
    build_mesh_adjacency(
        &poly_mesh.polygons,
        poly_mesh.vertices.len(),
        &mut poly_mesh.edges,
    );

    // Fix portal edges.
    let tile_width = nav_mesh_settings.tile_width.get();
    for (i, indices) in poly_mesh.polygons.iter().enumerate() {
        for index in 0..indices.len() {
            // Connect to edges that don't have an internal edge connection.
            let EdgeConnection::None = poly_mesh.edges[i][index] else {
                continue;
            };

            let vertex_a = poly_mesh.vertices[indices[index] as usize];
            let vertex_b = poly_mesh.vertices[indices[(index + 1) % indices.len()] as usize];

            // Only edges parallel to the tile edge.
            if vertex_a.x == 0 && vertex_b.x == 0 {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::XNegative);
            } else if vertex_a.z == tile_width && vertex_b.z == tile_width {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::ZPositive);
            } else if vertex_a.x == tile_width && vertex_b.x == tile_width {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::XPositive);
            } else if vertex_a.z == 0 && vertex_b.z == 0 {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::ZNegative);
            }
        }
    }

    Ok(poly_mesh)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EdgeConnectionDirection {
    XNegative,
    ZPositive,
    XPositive,
    ZNegative,
}
impl EdgeConnectionDirection {
    pub const ALL: [EdgeConnectionDirection; 4] = [
        EdgeConnectionDirection::XNegative,
        EdgeConnectionDirection::ZPositive,
        EdgeConnectionDirection::XPositive,
        EdgeConnectionDirection::ZNegative,
    ];

    /// Coordinate of the neighbouring tile in this direction. ``None`` if it would fall outside of the grid.
    pub fn offset(&self, coordinate: UVec2) -> Option<UVec2> {
        match self {
            EdgeConnectionDirection::XNegative => {
                coordinate.x.checked_sub(1).map(|x| coordinate.with_x(x))
            }
            EdgeConnectionDirection::ZPositive => {
                coordinate.y.checked_add(1).map(|y| coordinate.with_y(y))
            }
            EdgeConnectionDirection::XPositive => {
                coordinate.x.checked_add(1).map(|x| coordinate.with_x(x))
            }
            EdgeConnectionDirection::ZNegative => {
                coordinate.y.checked_sub(1).map(|y| coordinate.with_y(y))
            }
        }
    }

    pub fn opposite(&self) -> EdgeConnectionDirection {
        match self {
            EdgeConnectionDirection::XNegative => EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZPositive => EdgeConnectionDirection::ZNegative,
            EdgeConnectionDirection::XPositive => EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZNegative => EdgeConnectionDirection::ZPositive,
        }
    }

    pub(crate) fn to_bits(self) -> u8 {
        match self {
            EdgeConnectionDirection::XNegative => 0,
            EdgeConnectionDirection::ZPositive => 1,
            EdgeConnectionDirection::XPositive => 2,
            EdgeConnectionDirection::ZNegative => 3,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.get(usize::from(bits)).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeConnection {
    None,
    Internal(u16),
    External(EdgeConnectionDirection),
}

#[derive(Debug)]
struct Edge {
    // The vertices that make up this edge.
    vertices: [u32; 2],
    // The index of the edge in respective polygon.
    edge_in_polygon: [usize; 2],
    // The polygons that this edge makes up.
    polygon: [usize; 2],
}

fn build_mesh_adjacency(
    polygons: &[PolygonIndices],
    vertex_count: usize,
    in_edges: &mut Vec<PolygonEdges>,
) {
    let max_edge_count = polygons.iter().map(|polygon| polygon.len()).sum();

    let mut first_edge = vec![None; vertex_count];
    let mut next_edge = vec![None; max_edge_count];
    let mut edges = Vec::with_capacity(max_edge_count);

    for (i, indices) in polygons.iter().enumerate() {
        for (j, current) in indices.iter().enumerate() {
            let next = indices[(j + 1) % indices.len()];
            if *current < next {
                let edge = Edge {
                    vertices: [*current, next],
                    edge_in_polygon: [j, 0],
                    polygon: [i, i],
                };

                next_edge[edges.len()] = first_edge[*current as usize];
                first_edge[*current as usize] = Some(edges.len());
                edges.push(edge);
            }
        }
    }

    for (i, indices) in polygons.iter().enumerate() {
        for (j, current) in indices.iter().enumerate() {
            let next = indices[(j + 1) % indices.len()];
            if *current > next {
                let mut edge_iter = first_edge[next as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vertices[1] == *current && edge.polygon[0] == edge.polygon[1] {
                        edge.polygon[1] = i;
                        edge.edge_in_polygon[1] = j;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    in_edges.clear();
    in_edges.extend(
        polygons
            .iter()
            .map(|polygon| SmallVec::from_elem(EdgeConnection::None, polygon.len())),
    );
    for edge in edges.iter() {
        if edge.polygon[0] != edge.polygon[1] {
            let polygon_one = edge.polygon[0];
            let polygon_two = edge.polygon[1];
            in_edges[polygon_one][edge.edge_in_polygon[0]] =
                EdgeConnection::Internal(edge.polygon[1] as u16);
            in_edges[polygon_two][edge.edge_in_polygon[1]] =
                EdgeConnection::Internal(edge.polygon[0] as u16);
        }
    }
}

fn as_ivec4(vertex: U16Vec3) -> IVec4 {
    IVec4::new(vertex.x.into(), vertex.y.into(), vertex.z.into(), 0)
}

/// Greedily merges polygons sharing the longest edge while the result stays convex.
fn merge_polygons(polygons: &mut Vec<PolygonIndices>, vertices: &[U16Vec3], max_vertices: usize) {
    loop {
        let mut best: Option<(u32, usize, usize, usize, usize)> = None;

        for a in 0..polygons.len().saturating_sub(1) {
            for b in a + 1..polygons.len() {
                let Some((value, edge_a, edge_b)) =
                    get_poly_merge_value(&polygons[a], &polygons[b], vertices, max_vertices)
                else {
                    continue;
                };

                if best.is_none_or(|(best_value, ..)| value > best_value) {
                    best = Some((value, a, b, edge_a, edge_b));
                }
            }
        }

        let Some((_, a, b, edge_a, edge_b)) = best else {
            break;
        };

        let merged = merge_polygon_vertices(&polygons[a], &polygons[b], edge_a, edge_b);
        polygons[a] = merged;
        polygons.swap_remove(b);
    }
}

/// Returns the squared length of the shared edge if ``a`` and ``b`` can be merged into one convex polygon.
fn get_poly_merge_value(
    a: &PolygonIndices,
    b: &PolygonIndices,
    vertices: &[U16Vec3],
    max_vertices: usize,
) -> Option<(u32, usize, usize)> {
    let len_a = a.len();
    let len_b = b.len();

    if len_a + len_b - 2 > max_vertices {
        return None;
    }

    let mut shared = None;
    'outer: for i in 0..len_a {
        let mut va0 = a[i];
        let mut va1 = a[(i + 1) % len_a];
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }

        for j in 0..len_b {
            let mut vb0 = b[j];
            let mut vb1 = b[(j + 1) % len_b];
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }

            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }

    let (edge_a, edge_b) = shared?;

    // Check that the merged polygon would be convex.
    let vertex_a = as_ivec4(vertices[a[(edge_a + len_a - 1) % len_a] as usize]);
    let vertex_b = as_ivec4(vertices[a[edge_a] as usize]);
    let vertex_c = as_ivec4(vertices[b[(edge_b + 2) % len_b] as usize]);
    if !left(vertex_a, vertex_b, vertex_c) {
        return None;
    }

    let vertex_a = as_ivec4(vertices[b[(edge_b + len_b - 1) % len_b] as usize]);
    let vertex_b = as_ivec4(vertices[b[edge_b] as usize]);
    let vertex_c = as_ivec4(vertices[a[(edge_a + 2) % len_a] as usize]);
    if !left(vertex_a, vertex_b, vertex_c) {
        return None;
    }

    let vertex_a = vertices[a[edge_a] as usize];
    let vertex_b = vertices[a[(edge_a + 1) % len_a] as usize];

    let delta_x = u32::from(vertex_a.x.abs_diff(vertex_b.x));
    let delta_z = u32::from(vertex_a.z.abs_diff(vertex_b.z));

    Some((delta_x * delta_x + delta_z * delta_z, edge_a, edge_b))
}

fn merge_polygon_vertices(
    a: &PolygonIndices,
    b: &PolygonIndices,
    edge_a: usize,
    edge_b: usize,
) -> PolygonIndices {
    let mut merged = SmallVec::with_capacity(a.len() + b.len() - 2);

    for i in 0..a.len() - 1 {
        merged.push(a[(edge_a + 1 + i) % a.len()]);
    }
    for i in 0..b.len() - 1 {
        merged.push(b[(edge_b + 1 + i) % b.len()]);
    }

    merged
}

fn compute_vertex_hash(x: u64, z: u64) -> u64 {
    const HASH_X: u64 = 0x8da6b343; // Large multiplicative constants.
    const HASH_Z: u64 = 0xcb1ab31f; // Arbitrarily chosen primes.

    let hash = x * HASH_X + z * HASH_Z;

    hash & (VERTEX_BUCKET_COUNT - 1) as u64 // Wrap it.
}

fn add_vertex(
    vertex: U16Vec3,
    vertices: &mut Vec<U16Vec3>,
    first_vertex: &mut [i32],
    next_vertex: &mut [i32],
) -> u32 {
    let bucket = compute_vertex_hash(vertex.x.into(), vertex.z.into());
    let mut i = first_vertex[bucket as usize];

    while i != -1 {
        let other_vertex = vertices[i as usize];
        if other_vertex.x == vertex.x
            && other_vertex.y.abs_diff(vertex.y) <= 1
            && other_vertex.z == vertex.z
        {
            return i as u32;
        }
        i = next_vertex[i as usize];
    }

    let i = vertices.len();
    vertices.push(vertex);
    next_vertex[i] = first_vertex[bucket as usize];
    first_vertex[bucket as usize] = i as i32;
    i as u32
}

const INDEX_MASK: u32 = 0x0fffffff;
const EAR_FLAG: u32 = 0x80000000;

fn triangulate(vertices: &[UVec4], indices: &mut Vec<u32>, triangles: &mut Vec<u32>) -> bool {
    for i in 0..vertices.len() {
        let next = (i + 1) % vertices.len();
        let next_next = (next + 1) % vertices.len();

        if diagonal(i, next_next, vertices, indices) {
            indices[next] |= EAR_FLAG;
        }
    }

    while indices.len() > 3 {
        let mut min_len = u32::MAX;
        let mut min_index = None;

        for i in 0..indices.len() {
            let next = (i + 1) % indices.len();
            if indices[next] & EAR_FLAG != 0 {
                let point = vertices[(indices[i] & INDEX_MASK) as usize];
                let point_next =
                    vertices[(indices[(next + 1) % indices.len()] & INDEX_MASK) as usize];

                let delta_x = point_next.x.abs_diff(point.x);
                let delta_z = point_next.z.abs_diff(point.z);

                let square_length = delta_x * delta_x + delta_z * delta_z;

                if square_length < min_len {
                    min_len = square_length;
                    min_index = Some(i);
                }
            }
        }

        if min_index.is_none() {
            for i in 0..indices.len() {
                let next = (i + 1) % indices.len();
                let next_next = (next + 1) % indices.len();
                if diagonal_loose(i, next_next, vertices, indices) {
                    let point = vertices[(indices[i] & INDEX_MASK) as usize];
                    let point_next =
                        vertices[(indices[(next_next + 1) % indices.len()] & INDEX_MASK) as usize];

                    let delta_x = point_next.x.abs_diff(point.x);
                    let delta_z = point_next.z.abs_diff(point.z);

                    let square_length = delta_x * delta_x + delta_z * delta_z;

                    if square_length < min_len {
                        min_len = square_length;
                        min_index = Some(i);
                    }
                }
            }
        }

        let Some(i) = min_index else {
            return false;
        };

        let next = {
            let next = (i + 1) % indices.len();
            let next_next = (next + 1) % indices.len();

            triangles.push(indices[i] & INDEX_MASK);
            triangles.push(indices[next] & INDEX_MASK);
            triangles.push(indices[next_next] & INDEX_MASK);

            indices.remove(next);

            if next >= indices.len() {
                0
            } else {
                next
            }
        };

        let i = (indices.len() + next - 1) % indices.len();
        let prev = (indices.len() + i - 1) % indices.len();
        let next_next = (next + 1) % indices.len();

        if diagonal(prev, next, vertices, indices) {
            indices[i] |= EAR_FLAG;
        } else {
            indices[i] &= INDEX_MASK;
        }

        if diagonal(i, next_next, vertices, indices) {
            indices[next] |= EAR_FLAG;
        } else {
            indices[next] &= INDEX_MASK;
        }
    }

    triangles.push(indices[0] & INDEX_MASK);
    triangles.push(indices[1] & INDEX_MASK);
    triangles.push(indices[2] & INDEX_MASK);
    indices.clear();

    true
}

fn vec_equal(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}

fn in_cone(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    let point_i = vertices[(indices[i] & INDEX_MASK) as usize];
    let point_j = vertices[(indices[j] & INDEX_MASK) as usize];

    let point_i_next = vertices[(indices[(i + 1) % indices.len()] & INDEX_MASK) as usize];
    let point_i_prev =
        vertices[(indices[(indices.len() + i - 1) % indices.len()] & INDEX_MASK) as usize];

    if left_on(
        point_i_prev.as_ivec4(),
        point_i.as_ivec4(),
        point_i_next.as_ivec4(),
    ) {
        return left(
            point_i.as_ivec4(),
            point_j.as_ivec4(),
            point_i_prev.as_ivec4(),
        ) && left(
            point_j.as_ivec4(),
            point_i.as_ivec4(),
            point_i_next.as_ivec4(),
        );
    }

    !(left_on(
        point_i.as_ivec4(),
        point_j.as_ivec4(),
        point_i_next.as_ivec4(),
    ) && left_on(
        point_j.as_ivec4(),
        point_i.as_ivec4(),
        point_i_prev.as_ivec4(),
    ))
}

fn diagonalie(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    let diagonal_one = vertices[(indices[i] & INDEX_MASK) as usize];
    let diagonal_two = vertices[(indices[j] & INDEX_MASK) as usize];

    for edge in 0..indices.len() {
        let next_edge = (edge + 1) % indices.len();

        if !(edge == i || next_edge == i || edge == j || next_edge == j) {
            let point_one = vertices[(indices[edge] & INDEX_MASK) as usize];
            let point_two = vertices[(indices[next_edge] & INDEX_MASK) as usize];

            if vec_equal(diagonal_one, point_one)
                || vec_equal(diagonal_two, point_one)
                || vec_equal(diagonal_one, point_two)
                || vec_equal(diagonal_two, point_two)
            {
                continue;
            }

            if intersect(
                diagonal_one.as_ivec4(),
                diagonal_two.as_ivec4(),
                point_one.as_ivec4(),
                point_two.as_ivec4(),
            ) {
                return false;
            }
        }
    }

    true
}

fn diagonal(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    in_cone(i, j, vertices, indices) && diagonalie(i, j, vertices, indices)
}

fn in_cone_loose(a: usize, b: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    let point_a = vertices[(indices[a] & INDEX_MASK) as usize];
    let point_b = vertices[(indices[b] & INDEX_MASK) as usize];
    let point_a_next = vertices[(indices[(a + 1) % indices.len()] & INDEX_MASK) as usize];
    let point_a_prev =
        vertices[(indices[(indices.len() + a - 1) % indices.len()] & INDEX_MASK) as usize];

    if left_on(
        point_a_prev.as_ivec4(),
        point_a.as_ivec4(),
        point_a_next.as_ivec4(),
    ) {
        // only difference between in_cone is this being left_on instead of left:
        return left_on(
            point_a.as_ivec4(),
            point_b.as_ivec4(),
            point_a_prev.as_ivec4(),
        ) && left_on(
            point_b.as_ivec4(),
            point_a.as_ivec4(),
            point_a_next.as_ivec4(),
        );
    }

    !(left_on(
        point_a.as_ivec4(),
        point_b.as_ivec4(),
        point_a_next.as_ivec4(),
    ) && left_on(
        point_b.as_ivec4(),
        point_a.as_ivec4(),
        point_a_prev.as_ivec4(),
    ))
}

fn diagonalie_loose(a: usize, b: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    let diagonal_a = vertices[(indices[a] & INDEX_MASK) as usize];
    let diagonal_b = vertices[(indices[b] & INDEX_MASK) as usize];

    for edge in 0..indices.len() {
        let next_edge = (edge + 1) % indices.len();

        if !(edge == a || next_edge == a || edge == b || next_edge == b) {
            let point_one = vertices[(indices[edge] & INDEX_MASK) as usize];
            let point_two = vertices[(indices[next_edge] & INDEX_MASK) as usize];

            if vec_equal(diagonal_a, point_one)
                || vec_equal(diagonal_b, point_one)
                || vec_equal(diagonal_a, point_two)
                || vec_equal(diagonal_b, point_two)
            {
                continue;
            }

            // loose uses prop instead of regular.
            if intersect_prop(
                diagonal_a.as_ivec4(),
                diagonal_b.as_ivec4(),
                point_one.as_ivec4(),
                point_two.as_ivec4(),
            ) {
                return false;
            }
        }
    }

    true
}

fn diagonal_loose(i: usize, j: usize, vertices: &[UVec4], indices: &[u32]) -> bool {
    in_cone_loose(i, j, vertices, indices) && diagonalie_loose(i, j, vertices, indices)
}
