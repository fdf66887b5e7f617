//! Serialized tile data & the sparse grid of tiles making up the nav-mesh.
use std::io::{self, Read, Write};

use bevy::{
    log::debug,
    math::{bounding::Aabb3d, UVec2, Vec2, Vec3, Vec3A, Vec3Swizzles},
    platform::collections::HashMap,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

use crate::{
    detail_mesh::{DetailMesh, DetailSubMesh},
    error::{LimitExceeded, TileBuildError, TileDataError},
    geometry::{OffMeshLink, OffMeshLinkDirection, OffMeshLinkShape},
    math::{distance_sqr_point_segment_2d, point_in_polygon_2d},
    mesher::{EdgeConnection, EdgeConnectionDirection, PolyMesh, PolygonEdges, PolygonIndices},
    Area, NavMeshSettings, DEFAULT_POLYGON_FLAGS,
};

const TILE_MAGIC: u32 = u32::from_le_bytes(*b"TNTL");
const TILE_VERSION: u16 = 1;

// Salts wrap after 65535 replacements of a slot, see [`PolyRef`].
const SALT_BITS: u32 = 16;
const TILE_BITS: u32 = 28;
const POLY_BITS: u32 = 20;
const _: () = assert!(SALT_BITS + TILE_BITS + POLY_BITS == u64::BITS);
/// Maximum number of tile slots in a [`NavMeshTiles`].
pub const MAX_TILE_SLOTS: u32 = 1 << TILE_BITS;

const EDGE_EXTERNAL_FLAG: u32 = 0x8000_0000;

/// Tile coordinate & layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub coord: UVec2,
    pub layer: u8,
}

impl TileIndex {
    pub fn new(coord: UVec2, layer: u8) -> Self {
        Self { coord, layer }
    }
}

impl PartialOrd for TileIndex {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Row by row, then by layer.
impl Ord for TileIndex {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.coord.y, self.coord.x, self.layer).cmp(&(other.coord.y, other.coord.x, other.layer))
    }
}

/// Versioned reference to a tile slot. Becomes invalid once the slot is emptied or replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileRef(u64);

impl TileRef {
    fn new(salt: u16, slot: u32) -> Self {
        Self(u64::from(salt) << (TILE_BITS + POLY_BITS) | u64::from(slot) << POLY_BITS)
    }

    pub fn salt(&self) -> u16 {
        (self.0 >> (TILE_BITS + POLY_BITS)) as u16
    }

    pub fn slot(&self) -> u32 {
        ((self.0 >> POLY_BITS) & ((1 << TILE_BITS) - 1)) as u32
    }

    pub fn poly_ref(&self, polygon: u32) -> PolyRef {
        PolyRef(self.0 | u64::from(polygon & ((1 << POLY_BITS) - 1)))
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }
}

/// Versioned reference to a polygon, packing (salt, tile slot, polygon) into a ``u64``.
///
/// The salt is 16 bits & skips 0, so it repeats after 65535 replacements of the same slot. A reference held
/// across that many rebuilds of one tile may validate again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolyRef(u64);

impl PolyRef {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn salt(&self) -> u16 {
        (self.0 >> (TILE_BITS + POLY_BITS)) as u16
    }

    pub fn tile_slot(&self) -> u32 {
        ((self.0 >> POLY_BITS) & ((1 << TILE_BITS) - 1)) as u32
    }

    pub fn polygon(&self) -> u32 {
        (self.0 & ((1 << POLY_BITS) - 1)) as u32
    }

    pub fn tile_ref(&self) -> TileRef {
        TileRef(self.0 & !((1 << POLY_BITS) - 1))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TilePolygon {
    pub indices: PolygonIndices,
    pub edges: PolygonEdges,
    pub area: Area,
    pub flags: u16,
}

/// Off-mesh link starting inside a tile.
#[derive(Clone, Debug, PartialEq)]
pub struct OffMeshLinkRecord {
    /// Start segment. Both points are equal for point links.
    pub start: [Vec3; 2],
    pub end: [Vec3; 2],
    pub snap_radius: f32,
    pub snap_height: f32,
    pub bidirectional: bool,
    pub area: Area,
    /// Polygon the start of the link snapped to.
    pub start_polygon: u32,
}

/// Everything needed to place a layer of a tile into the nav-mesh. Vertices are in world space.
#[derive(Clone, Debug, PartialEq)]
pub struct TileData {
    pub tile: UVec2,
    pub layer: u8,
    pub bounds: Aabb3d,
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<TilePolygon>,
    pub detail_meshes: Vec<DetailSubMesh>,
    pub detail_vertices: Vec<Vec3>,
    pub detail_triangles: Vec<[u8; 3]>,
    pub off_mesh_links: Vec<OffMeshLinkRecord>,
}

impl TileData {
    /// Converts a polygon mesh & its optional detail mesh from cell space into world space tile data.
    pub(crate) fn from_poly_mesh(
        poly_mesh: &PolyMesh,
        detail_mesh: Option<&DetailMesh>,
        tile: UVec2,
        layer: u8,
        off_mesh_links: &[OffMeshLink],
        nav_mesh_settings: &NavMeshSettings,
    ) -> Self {
        let tile_origin = nav_mesh_settings.get_tile_origin(tile);
        let to_world = |x: u16, y: u16, z: u16| {
            Vec3::new(
                tile_origin.x + f32::from(x) * nav_mesh_settings.cell_width,
                nav_mesh_settings.world_bottom_bound + f32::from(y) * nav_mesh_settings.cell_height,
                tile_origin.y + f32::from(z) * nav_mesh_settings.cell_width,
            )
        };

        let vertices: Vec<Vec3> = poly_mesh
            .vertices
            .iter()
            .map(|vertex| to_world(vertex.x, vertex.y, vertex.z))
            .collect();

        let polygons: Vec<TilePolygon> = poly_mesh
            .polygons
            .iter()
            .zip(poly_mesh.edges.iter())
            .zip(poly_mesh.areas.iter())
            .map(|((indices, edges), area)| TilePolygon {
                indices: indices.clone(),
                edges: edges.clone(),
                area: *area,
                flags: nav_mesh_settings
                    .area_flags
                    .get(area)
                    .copied()
                    .unwrap_or(DEFAULT_POLYGON_FLAGS),
            })
            .collect();

        let (detail_meshes, detail_vertices, detail_triangles) = match detail_mesh {
            Some(detail_mesh) => (
                detail_mesh.meshes.clone(),
                detail_mesh
                    .vertices
                    .iter()
                    .map(|vertex| to_world(vertex.x, vertex.y, vertex.z))
                    .collect(),
                detail_mesh.triangles.clone(),
            ),
            None => Default::default(),
        };

        let tile_bounds = nav_mesh_settings.get_tile_bounds(tile);
        let default_snap_height =
            f32::from(nav_mesh_settings.step_height) * nav_mesh_settings.cell_height;

        let off_mesh_links = off_mesh_links
            .iter()
            .filter_map(|link| {
                let anchor = link.shape.start_anchor();
                if anchor.x < tile_bounds.min.x
                    || anchor.x >= tile_bounds.max.x
                    || anchor.z < tile_bounds.min.y
                    || anchor.z >= tile_bounds.max.y
                {
                    return None;
                }

                let snap_height = link.snap_height.unwrap_or(default_snap_height);
                let Some(start_polygon) = find_snapped_polygon(
                    &vertices,
                    &polygons,
                    anchor,
                    link.snap_radius,
                    snap_height,
                ) else {
                    debug!(
                        "Off-mesh link starting at {} couldn't snap to tile {} layer {}.",
                        anchor, tile, layer
                    );
                    return None;
                };

                let (start, end) = match link.shape {
                    OffMeshLinkShape::Point { start, end } => ([start; 2], [end; 2]),
                    OffMeshLinkShape::Segment { start, end } => (start, end),
                };

                Some(OffMeshLinkRecord {
                    start,
                    end,
                    snap_radius: link.snap_radius,
                    snap_height,
                    bidirectional: link.direction == OffMeshLinkDirection::Bidirectional,
                    area: link.area,
                    start_polygon,
                })
            })
            .collect();

        let bounds = vertices
            .iter()
            .fold(None, |bounds: Option<(Vec3, Vec3)>, vertex| {
                Some(bounds.map_or((*vertex, *vertex), |(min, max)| {
                    (min.min(*vertex), max.max(*vertex))
                }))
            })
            .map_or(
                Aabb3d {
                    min: Vec3A::new(tile_bounds.min.x, 0.0, tile_bounds.min.y),
                    max: Vec3A::new(tile_bounds.max.x, 0.0, tile_bounds.max.y),
                },
                |(min, max)| Aabb3d {
                    min: min.into(),
                    max: max.into(),
                },
            );

        Self {
            tile,
            layer,
            bounds,
            vertices,
            polygons,
            detail_meshes,
            detail_vertices,
            detail_triangles,
            off_mesh_links,
        }
    }

    pub fn index(&self) -> TileIndex {
        TileIndex::new(self.tile, self.layer)
    }

    /// Vertices of ``polygon`` in order.
    pub fn polygon_vertices<'a>(
        &'a self,
        polygon: &'a TilePolygon,
    ) -> impl Iterator<Item = Vec3> + 'a {
        polygon
            .indices
            .iter()
            .map(|index| self.vertices[*index as usize])
    }

    /// Serializes the tile into its little-endian binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            64 + self.vertices.len() * 12 + self.polygons.len() * 40 + self.detail_vertices.len() * 12,
        );
        self.write(&mut bytes)
            .expect("Writing into a Vec is infallible.");

        bytes
    }

    fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(TILE_MAGIC)?;
        writer.write_u16::<LittleEndian>(TILE_VERSION)?;

        writer.write_u32::<LittleEndian>(self.tile.x)?;
        writer.write_u32::<LittleEndian>(self.tile.y)?;
        writer.write_u8(self.layer)?;
        write_vec3(writer, self.bounds.min.into())?;
        write_vec3(writer, self.bounds.max.into())?;

        writer.write_u32::<LittleEndian>(self.vertices.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.polygons.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.detail_meshes.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.detail_vertices.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.detail_triangles.len() as u32)?;
        writer.write_u32::<LittleEndian>(self.off_mesh_links.len() as u32)?;

        for vertex in self.vertices.iter() {
            write_vec3(writer, *vertex)?;
        }

        for polygon in self.polygons.iter() {
            writer.write_u8(polygon.indices.len() as u8)?;
            for index in polygon.indices.iter() {
                writer.write_u16::<LittleEndian>(*index as u16)?;
            }
            for edge in polygon.edges.iter() {
                writer.write_u32::<LittleEndian>(encode_edge(*edge))?;
            }
            writer.write_u16::<LittleEndian>(polygon.area.0)?;
            writer.write_u16::<LittleEndian>(polygon.flags)?;
        }

        for mesh in self.detail_meshes.iter() {
            writer.write_u32::<LittleEndian>(mesh.vertex_base)?;
            writer.write_u32::<LittleEndian>(mesh.vertex_count)?;
            writer.write_u32::<LittleEndian>(mesh.triangle_base)?;
            writer.write_u32::<LittleEndian>(mesh.triangle_count)?;
        }
        for vertex in self.detail_vertices.iter() {
            write_vec3(writer, *vertex)?;
        }
        for triangle in self.detail_triangles.iter() {
            writer.write_all(triangle)?;
        }

        for link in self.off_mesh_links.iter() {
            for point in link.start.iter().chain(link.end.iter()) {
                write_vec3(writer, *point)?;
            }
            writer.write_f32::<LittleEndian>(link.snap_radius)?;
            writer.write_f32::<LittleEndian>(link.snap_height)?;
            writer.write_u8(link.bidirectional.into())?;
            writer.write_u16::<LittleEndian>(link.area.0)?;
            writer.write_u32::<LittleEndian>(link.start_polygon)?;
        }

        Ok(())
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, TileDataError> {
        let reader = &mut bytes;

        if reader.read_u32::<LittleEndian>()? != TILE_MAGIC {
            return Err(TileDataError::InvalidMagic);
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version != TILE_VERSION {
            return Err(TileDataError::UnsupportedVersion(version));
        }

        let tile = UVec2::new(
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        );
        let layer = reader.read_u8()?;
        let bounds = Aabb3d {
            min: read_vec3(reader)?.into(),
            max: read_vec3(reader)?.into(),
        };

        let vertex_count = read_count(reader)?;
        let polygon_count = read_count(reader)?;
        let detail_mesh_count = read_count(reader)?;
        let detail_vertex_count = read_count(reader)?;
        let detail_triangle_count = read_count(reader)?;
        let off_mesh_link_count = read_count(reader)?;

        let vertices = (0..vertex_count)
            .map(|_| read_vec3(reader))
            .collect::<io::Result<Vec<_>>>()?;

        let mut polygons = Vec::with_capacity(polygon_count);
        for _ in 0..polygon_count {
            let len = usize::from(reader.read_u8()?);

            let mut indices = PolygonIndices::new();
            for _ in 0..len {
                let index = reader.read_u16::<LittleEndian>()?;
                if usize::from(index) >= vertices.len() {
                    return Err(invalid_data("polygon index out of bounds"));
                }
                indices.push(u32::from(index));
            }

            let mut edges = PolygonEdges::new();
            for _ in 0..len {
                let edge = decode_edge(reader.read_u32::<LittleEndian>()?)
                    .ok_or_else(|| invalid_data("invalid edge connection"))?;
                edges.push(edge);
            }

            polygons.push(TilePolygon {
                indices,
                edges,
                area: Area(reader.read_u16::<LittleEndian>()?),
                flags: reader.read_u16::<LittleEndian>()?,
            });
        }

        let detail_meshes = (0..detail_mesh_count)
            .map(|_| {
                Ok(DetailSubMesh {
                    vertex_base: reader.read_u32::<LittleEndian>()?,
                    vertex_count: reader.read_u32::<LittleEndian>()?,
                    triangle_base: reader.read_u32::<LittleEndian>()?,
                    triangle_count: reader.read_u32::<LittleEndian>()?,
                })
            })
            .collect::<io::Result<Vec<_>>>()?;
        let detail_vertices = (0..detail_vertex_count)
            .map(|_| read_vec3(reader))
            .collect::<io::Result<Vec<_>>>()?;
        let detail_triangles = (0..detail_triangle_count)
            .map(|_| {
                let mut triangle = [0; 3];
                reader.read_exact(&mut triangle)?;
                Ok(triangle)
            })
            .collect::<io::Result<Vec<_>>>()?;

        let mut off_mesh_links = Vec::with_capacity(off_mesh_link_count);
        for _ in 0..off_mesh_link_count {
            let start = [read_vec3(reader)?, read_vec3(reader)?];
            let end = [read_vec3(reader)?, read_vec3(reader)?];

            off_mesh_links.push(OffMeshLinkRecord {
                start,
                end,
                snap_radius: reader.read_f32::<LittleEndian>()?,
                snap_height: reader.read_f32::<LittleEndian>()?,
                bidirectional: reader.read_u8()? != 0,
                area: Area(reader.read_u16::<LittleEndian>()?),
                start_polygon: reader.read_u32::<LittleEndian>()?,
            });
        }

        Ok(Self {
            tile,
            layer,
            bounds,
            vertices,
            polygons,
            detail_meshes,
            detail_vertices,
            detail_triangles,
            off_mesh_links,
        })
    }
}

fn invalid_data(message: &'static str) -> TileDataError {
    io::Error::new(io::ErrorKind::InvalidData, message).into()
}

/// Reads an element count, rejecting counts larger than the remaining data could hold.
fn read_count(reader: &mut &[u8]) -> Result<usize, TileDataError> {
    let count = reader.read_u32::<LittleEndian>()? as usize;
    if count > reader.len() {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }

    Ok(count)
}

fn write_vec3(writer: &mut impl Write, vector: Vec3) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(vector.x)?;
    writer.write_f32::<LittleEndian>(vector.y)?;
    writer.write_f32::<LittleEndian>(vector.z)
}

fn read_vec3(reader: &mut impl Read) -> io::Result<Vec3> {
    Ok(Vec3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn encode_edge(edge: EdgeConnection) -> u32 {
    match edge {
        EdgeConnection::None => 0,
        EdgeConnection::Internal(polygon) => u32::from(polygon) + 1,
        EdgeConnection::External(direction) => EDGE_EXTERNAL_FLAG | u32::from(direction.to_bits()),
    }
}

fn decode_edge(bits: u32) -> Option<EdgeConnection> {
    if bits & EDGE_EXTERNAL_FLAG != 0 {
        EdgeConnectionDirection::from_bits((bits & !EDGE_EXTERNAL_FLAG) as u8)
            .map(EdgeConnection::External)
    } else if bits == 0 {
        Some(EdgeConnection::None)
    } else {
        u16::try_from(bits - 1).ok().map(EdgeConnection::Internal)
    }
}

/// Finds the polygon closest to ``point`` within the snap distances.
fn find_snapped_polygon(
    vertices: &[Vec3],
    polygons: &[TilePolygon],
    point: Vec3,
    snap_radius: f32,
    snap_height: f32,
) -> Option<u32> {
    let mut best = None;
    let mut best_distance = (f32::MAX, f32::MAX);
    let mut outline: SmallVec<[Vec2; 6]> = SmallVec::new();

    for (polygon_index, polygon) in polygons.iter().enumerate() {
        outline.clear();
        outline.extend(
            polygon
                .indices
                .iter()
                .map(|index| vertices[*index as usize].xz()),
        );

        let horizontal_distance = if point_in_polygon_2d(point.xz(), &outline) {
            0.0
        } else {
            (0..outline.len())
                .map(|i| {
                    distance_sqr_point_segment_2d(
                        point.xz(),
                        outline[i],
                        outline[(i + 1) % outline.len()],
                    )
                })
                .fold(f32::MAX, f32::min)
                .sqrt()
        };
        if horizontal_distance > snap_radius {
            continue;
        }

        let height = polygon
            .indices
            .iter()
            .map(|index| vertices[*index as usize].y)
            .sum::<f32>()
            / polygon.indices.len() as f32;
        let vertical_distance = (height - point.y).abs();
        if vertical_distance > snap_height {
            continue;
        }

        let distance = (horizontal_distance, vertical_distance);
        if distance < best_distance {
            best_distance = distance;
            best = Some(polygon_index as u32);
        }
    }

    best
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Link {
    Internal {
        edge: u8,
        neighbour_polygon: u16,
    },
    External {
        edge: u8,
        neighbour: PolyRef,
        direction: EdgeConnectionDirection, // Knowing the direction of the other tile is enough to figure out the tile from our tile.
        bound_min: u8,                      // % bound of edge that links to this.
        bound_max: u8, // For example: 10% -> 50% = the connected edge covers 10% from vertex A to B to 50%.
    },
}

/// A layer of a tile placed in the nav-mesh, with its polygons linked to each other & to neighbouring tiles.
pub struct NavMeshTile {
    pub data: TileData,
    /// Links of every polygon.
    pub links: Vec<SmallVec<[Link; 8]>>,
}

impl NavMeshTile {
    fn new(data: TileData) -> Self {
        let links = data
            .polygons
            .iter()
            .map(|polygon| {
                polygon
                    .edges
                    .iter()
                    .enumerate()
                    .filter_map(|(i, edge)| {
                        let EdgeConnection::Internal(other_polygon) = edge else {
                            return None;
                        };

                        Some(Link::Internal {
                            edge: i as u8,
                            neighbour_polygon: *other_polygon,
                        })
                    })
                    .collect()
            })
            .collect();

        Self { data, links }
    }
}

#[derive(Default)]
struct TileSlot {
    salt: u16,
    tile: Option<NavMeshTile>,
}

/// Sparse grid of tiles. Tiles live in slots, addressed by salted [`TileRef`]s & [`PolyRef`]s.
pub struct NavMeshTiles {
    slots: Vec<TileSlot>,
    free_slots: Vec<u32>,
    lookup: HashMap<TileIndex, u32>,
    /// Slots of every layer at a coordinate.
    layers: HashMap<UVec2, SmallVec<[u32; 4]>>,
    max_tiles: u32,
}

impl Default for NavMeshTiles {
    fn default() -> Self {
        Self::with_max_tiles(MAX_TILE_SLOTS)
    }
}

impl NavMeshTiles {
    /// Creates an empty grid holding at most ``max_tiles`` tiles, clamped to [`MAX_TILE_SLOTS`].
    pub fn with_max_tiles(max_tiles: u32) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            lookup: HashMap::default(),
            layers: HashMap::default(),
            max_tiles: max_tiles.min(MAX_TILE_SLOTS),
        }
    }

    /// Number of tiles that can still be added without replacing any.
    pub fn free_tile_count(&self) -> usize {
        (self.max_tiles as usize).saturating_sub(self.lookup.len())
    }

    /// Places ``data`` in the grid, replacing any tile with the same coordinate & layer.
    ///
    /// Connects the tile's border edges to every layer of the neighbouring tiles.
    pub fn add_tile(
        &mut self,
        data: TileData,
        nav_mesh_settings: &NavMeshSettings,
    ) -> Result<TileRef, TileBuildError> {
        let index = data.index();
        if !self.lookup.contains_key(&index) && self.free_tile_count() == 0 {
            return Err(LimitExceeded::TilePool.into());
        }
        self.remove_tile(index);

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(TileSlot {
                    salt: 1,
                    tile: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let tile_ref = TileRef::new(self.slots[slot as usize].salt, slot);
        let mut tile = NavMeshTile::new(data);

        let step_height = f32::from(nav_mesh_settings.step_height) * nav_mesh_settings.cell_height;
        for direction in EdgeConnectionDirection::ALL {
            let Some(neighbour_coord) = direction.offset(index.coord) else {
                continue;
            };
            let Some(neighbour_slots) = self.layers.get(&neighbour_coord) else {
                continue;
            };

            for neighbour_slot in neighbour_slots.iter() {
                let tile_slot = &mut self.slots[*neighbour_slot as usize];
                let neighbour_ref = TileRef::new(tile_slot.salt, *neighbour_slot);
                let Some(neighbour) = tile_slot.tile.as_mut() else {
                    continue;
                };

                connect_external_links(&mut tile, neighbour, neighbour_ref, direction, step_height);
                connect_external_links(
                    neighbour,
                    &tile,
                    tile_ref,
                    direction.opposite(),
                    step_height,
                );
            }
        }

        self.slots[slot as usize].tile = Some(tile);
        self.lookup.insert(index, slot);
        self.layers.entry(index.coord).or_default().push(slot);

        Ok(tile_ref)
    }

    /// Removes the tile, bumping the slot's salt so references to it no longer validate.
    pub fn remove_tile(&mut self, index: TileIndex) -> Option<TileData> {
        let slot = self.lookup.remove(&index)?;

        if let Some(layers) = self.layers.get_mut(&index.coord) {
            layers.retain(|layer_slot| *layer_slot != slot);
            if layers.is_empty() {
                self.layers.remove(&index.coord);
            }
        }

        let tile_slot = &mut self.slots[slot as usize];
        let tile = tile_slot.tile.take()?;
        tile_slot.salt = next_salt(tile_slot.salt);
        self.free_slots.push(slot);

        // Unlink neighbours.
        for direction in EdgeConnectionDirection::ALL {
            let Some(neighbour_coord) = direction.offset(index.coord) else {
                continue;
            };
            let Some(neighbour_slots) = self.layers.get(&neighbour_coord) else {
                continue;
            };

            for neighbour_slot in neighbour_slots.iter() {
                let Some(neighbour) = self.slots[*neighbour_slot as usize].tile.as_mut() else {
                    continue;
                };

                for links in neighbour.links.iter_mut() {
                    links.retain(|link| {
                        !matches!(link, Link::External { neighbour, .. } if neighbour.tile_slot() == slot)
                    });
                }
            }
        }

        Some(tile.data)
    }

    /// Removes every layer at ``coord``.
    pub fn remove_tiles_at(&mut self, coord: UVec2) -> usize {
        let layers = self.layers_at(coord).collect::<SmallVec<[TileIndex; 4]>>();
        for index in layers.iter() {
            self.remove_tile(*index);
        }

        layers.len()
    }

    /// Indices of every layer at ``coord``.
    pub fn layers_at(&self, coord: UVec2) -> impl Iterator<Item = TileIndex> + '_ {
        self.layers
            .get(&coord)
            .into_iter()
            .flatten()
            .filter_map(|slot| self.slots[*slot as usize].tile.as_ref())
            .map(|tile| tile.data.index())
    }

    pub fn get_tile(&self, index: TileIndex) -> Option<&NavMeshTile> {
        let slot = self.lookup.get(&index)?;
        self.slots[*slot as usize].tile.as_ref()
    }

    pub fn get_tile_ref(&self, index: TileIndex) -> Option<TileRef> {
        let slot = *self.lookup.get(&index)?;
        Some(TileRef::new(self.slots[slot as usize].salt, slot))
    }

    /// Returns the tile if ``tile_ref`` is still valid.
    pub fn get_tile_by_ref(&self, tile_ref: TileRef) -> Option<&NavMeshTile> {
        let slot = self.slots.get(tile_ref.slot() as usize)?;
        if slot.salt != tile_ref.salt() {
            return None;
        }

        slot.tile.as_ref()
    }

    pub fn get_polygon(&self, poly_ref: PolyRef) -> Option<(&NavMeshTile, &TilePolygon)> {
        let tile = self.get_tile_by_ref(poly_ref.tile_ref())?;
        let polygon = tile.data.polygons.get(poly_ref.polygon() as usize)?;

        Some((tile, polygon))
    }

    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        self.get_polygon(poly_ref).is_some()
    }

    /// Every tile in the grid, ordered by coordinate & layer.
    pub fn iter(&self) -> impl Iterator<Item = (TileIndex, &NavMeshTile)> {
        let mut indices = self.lookup.iter().collect::<Vec<_>>();
        indices.sort_by_key(|(index, _)| **index);

        indices.into_iter().filter_map(|(index, slot)| {
            self.slots[*slot as usize]
                .tile
                .as_ref()
                .map(|tile| (*index, tile))
        })
    }

    pub fn tile_count(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn clear(&mut self) {
        let indices = self.lookup.keys().copied().collect::<Vec<_>>();
        for index in indices {
            self.remove_tile(index);
        }
    }
}

/// Next salt of a slot, wrapping from [`u16::MAX`] back to 1.
fn next_salt(salt: u16) -> u16 {
    match salt.wrapping_add(1) {
        0 => 1,
        salt => salt,
    }
}

/// Links the edges of ``tile`` facing ``direction`` to the matching edges of ``neighbour``.
fn connect_external_links(
    tile: &mut NavMeshTile,
    neighbour: &NavMeshTile,
    neighbour_ref: TileRef,
    direction: EdgeConnectionDirection,
    step_height: f32,
) {
    let neighbour_to_self_direction = direction.opposite();

    for (polygon, links) in tile.data.polygons.iter().zip(tile.links.iter_mut()) {
        for (edge_index, edge) in polygon.edges.iter().enumerate() {
            if *edge != EdgeConnection::External(direction) {
                continue;
            }

            let vertex_a = tile.data.vertices[polygon.indices[edge_index] as usize];
            let vertex_b = tile.data.vertices
                [polygon.indices[(edge_index + 1) % polygon.indices.len()] as usize];

            let connections = find_connecting_polygons_in_tile(
                vertex_a,
                vertex_b,
                neighbour,
                neighbour_to_self_direction,
                step_height,
            );

            for (neighbour_polygon, connection_area) in connections {
                let (along_a, along_b) = match direction {
                    EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive => {
                        (vertex_a.z, vertex_b.z)
                    }
                    EdgeConnectionDirection::ZNegative | EdgeConnectionDirection::ZPositive => {
                        (vertex_a.x, vertex_b.x)
                    }
                };

                let mut min = (connection_area.x - along_a) / (along_b - along_a);
                let mut max = (connection_area.y - along_a) / (along_b - along_a);
                if min > max {
                    std::mem::swap(&mut min, &mut max);
                }

                links.push(Link::External {
                    edge: edge_index as u8,
                    neighbour: neighbour_ref.poly_ref(neighbour_polygon),
                    direction,
                    bound_min: (min.clamp(0.0, 1.0) * 255.0).round() as u8,
                    bound_max: (max.clamp(0.0, 1.0) * 255.0).round() as u8,
                });
            }
        }
    }
}

/// End points of an edge along the tile side, as (position along the side, height).
fn calculate_slab_end_points(
    vertex_a: Vec3,
    vertex_b: Vec3,
    side: EdgeConnectionDirection,
) -> (Vec2, Vec2) {
    let (a, b) = match side {
        EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive => (
            Vec2::new(vertex_a.z, vertex_a.y),
            Vec2::new(vertex_b.z, vertex_b.y),
        ),
        EdgeConnectionDirection::ZNegative | EdgeConnectionDirection::ZPositive => (
            Vec2::new(vertex_a.x, vertex_a.y),
            Vec2::new(vertex_b.x, vertex_b.y),
        ),
    };

    if a.x < b.x {
        (a, b)
    } else {
        (b, a)
    }
}

fn get_slab_position(vertex: Vec3, side: EdgeConnectionDirection) -> f32 {
    match side {
        EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive => vertex.x,
        EdgeConnectionDirection::ZPositive | EdgeConnectionDirection::ZNegative => vertex.z,
    }
}

fn check_slabs_overlap(
    a_min: Vec2,
    a_max: Vec2,
    b_min: Vec2,
    b_max: Vec2,
    edge_shrink: f32,
    allowed_step: f32,
) -> bool {
    let min_edge = (a_min.x + edge_shrink).max(b_min.x + edge_shrink);
    let max_edge = (a_max.x - edge_shrink).min(b_max.x - edge_shrink);
    if min_edge > max_edge {
        return false;
    }

    let a_d = (a_max.y - a_min.y) / (a_max.x - a_min.x);
    let a_k = a_min.y - a_d * a_min.x;

    let b_d = (b_max.y - b_min.y) / (b_max.x - b_min.x);
    let b_k = b_min.y - b_d * b_min.x;

    let a_min_y = a_d * min_edge + a_k;
    let a_max_y = a_d * max_edge + a_k;

    let b_min_y = b_d * min_edge + b_k;
    let b_max_y = b_d * max_edge + b_k;

    let delta_min = b_min_y - a_min_y;
    let delta_max = b_max_y - a_max_y;

    // Crossing slabs.
    if delta_min * delta_max < 0.0 {
        return true;
    }

    let threshold = (allowed_step * 2.0).powi(2);

    delta_min * delta_min <= threshold || delta_max * delta_max <= threshold
}

const MAX_CONNECTING_POLYGONS: usize = 8;

/// Polygons of ``tile`` with an edge on ``side`` overlapping the edge from ``vertex_a`` to ``vertex_b``.
///
/// Returns the polygon & the overlapping range along the side.
fn find_connecting_polygons_in_tile(
    vertex_a: Vec3,
    vertex_b: Vec3,
    tile: &NavMeshTile,
    side: EdgeConnectionDirection,
    step_height: f32,
) -> SmallVec<[(u32, Vec2); MAX_CONNECTING_POLYGONS]> {
    let mut connections = SmallVec::new();

    let (in_min, in_max) = calculate_slab_end_points(vertex_a, vertex_b, side);
    let in_pos = get_slab_position(vertex_a, side);

    for (poly_index, polygon) in tile.data.polygons.iter().enumerate() {
        for (edge_index, edge) in polygon.edges.iter().enumerate() {
            if *edge != EdgeConnection::External(side) {
                continue;
            }

            let vertex_c = tile.data.vertices[polygon.indices[edge_index] as usize];
            let vertex_d = tile.data.vertices
                [polygon.indices[(edge_index + 1) % polygon.indices.len()] as usize];

            let edge_pos = get_slab_position(vertex_c, side);
            if (in_pos - edge_pos).abs() > 0.01 {
                continue;
            }

            let (edge_min, edge_max) = calculate_slab_end_points(vertex_c, vertex_d, side);
            if !check_slabs_overlap(in_min, in_max, edge_min, edge_max, 0.01, step_height) {
                continue;
            }

            if connections.len() < MAX_CONNECTING_POLYGONS {
                connections.push((
                    poly_index as u32,
                    Vec2::new(in_min.x.max(edge_min.x), in_max.x.min(edge_max.x)),
                ));
            }
            break;
        }
    }

    connections
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    /// Single square polygon covering ``min.x..max.x`` & ``min.y..max.y`` at height 0.
    fn square_tile(tile: UVec2, min: Vec2, max: Vec2, edges: [EdgeConnection; 4]) -> TileData {
        TileData {
            tile,
            layer: 0,
            bounds: Aabb3d {
                min: Vec3A::new(min.x, 0.0, min.y),
                max: Vec3A::new(max.x, 0.0, max.y),
            },
            vertices: vec![
                Vec3::new(min.x, 0.0, min.y),
                Vec3::new(min.x, 0.0, max.y),
                Vec3::new(max.x, 0.0, max.y),
                Vec3::new(max.x, 0.0, min.y),
            ],
            polygons: vec![TilePolygon {
                indices: smallvec![0, 1, 2, 3],
                edges: SmallVec::from_slice(&edges),
                area: Area(0),
                flags: DEFAULT_POLYGON_FLAGS,
            }],
            detail_meshes: Vec::new(),
            detail_vertices: Vec::new(),
            detail_triangles: Vec::new(),
            off_mesh_links: Vec::new(),
        }
    }

    fn left_tile() -> TileData {
        square_tile(
            UVec2::new(0, 0),
            Vec2::ZERO,
            Vec2::splat(4.0),
            [
                EdgeConnection::None,
                EdgeConnection::None,
                EdgeConnection::External(EdgeConnectionDirection::XPositive),
                EdgeConnection::None,
            ],
        )
    }

    fn right_tile() -> TileData {
        square_tile(
            UVec2::new(1, 0),
            Vec2::new(4.0, 0.0),
            Vec2::new(8.0, 4.0),
            [
                EdgeConnection::External(EdgeConnectionDirection::XNegative),
                EdgeConnection::None,
                EdgeConnection::None,
                EdgeConnection::None,
            ],
        )
    }

    fn settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
    }

    fn external_links(tiles: &NavMeshTiles, coord: UVec2) -> Vec<Link> {
        tiles
            .get_tile(TileIndex::new(coord, 0))
            .unwrap()
            .links[0]
            .iter()
            .filter(|link| matches!(link, Link::External { .. }))
            .copied()
            .collect()
    }

    #[test]
    fn neighbouring_tiles_link_both_ways() {
        let settings = settings();
        let mut tiles = NavMeshTiles::default();

        tiles.add_tile(left_tile(), &settings).unwrap();
        let right_ref = tiles.add_tile(right_tile(), &settings).unwrap();
        let left_ref = tiles.get_tile_ref(TileIndex::new(UVec2::ZERO, 0)).unwrap();

        let left_links = external_links(&tiles, UVec2::new(0, 0));
        assert_eq!(left_links.len(), 1);
        let Link::External {
            neighbour,
            bound_min,
            bound_max,
            ..
        } = left_links[0]
        else {
            unreachable!()
        };
        assert_eq!(neighbour, right_ref.poly_ref(0));
        assert_eq!((bound_min, bound_max), (0, 255));

        let right_links = external_links(&tiles, UVec2::new(1, 0));
        assert_eq!(right_links.len(), 1);
        assert!(matches!(
            right_links[0],
            Link::External { neighbour, .. } if neighbour == left_ref.poly_ref(0)
        ));
    }

    #[test]
    fn full_grid_rejects_new_tiles_but_allows_replacement() {
        let settings = settings();
        let mut tiles = NavMeshTiles::with_max_tiles(1);

        let left_ref = tiles.add_tile(left_tile(), &settings).unwrap();
        assert_eq!(
            tiles.add_tile(right_tile(), &settings),
            Err(TileBuildError::LimitExceeded(LimitExceeded::TilePool))
        );
        assert!(tiles.is_valid_poly_ref(left_ref.poly_ref(0)));
        assert_eq!(tiles.tile_count(), 1);

        let new_ref = tiles.add_tile(left_tile(), &settings).unwrap();
        assert!(tiles.is_valid_poly_ref(new_ref.poly_ref(0)));
        assert_eq!(tiles.free_tile_count(), 0);
    }

    #[test]
    fn replacing_a_tile_bumps_salt_and_relinks() {
        let settings = settings();
        let mut tiles = NavMeshTiles::default();

        tiles.add_tile(left_tile(), &settings).unwrap();
        let old_ref = tiles.add_tile(right_tile(), &settings).unwrap();
        let new_ref = tiles.add_tile(right_tile(), &settings).unwrap();

        assert_ne!(old_ref.salt(), new_ref.salt());
        assert!(!tiles.is_valid_poly_ref(old_ref.poly_ref(0)));
        assert!(tiles.is_valid_poly_ref(new_ref.poly_ref(0)));
        assert_ne!(new_ref.salt(), 0);

        // The left tile only links to the new right tile.
        let left_links = external_links(&tiles, UVec2::ZERO);
        assert_eq!(left_links.len(), 1);
        assert!(matches!(
            left_links[0],
            Link::External { neighbour, .. } if neighbour == new_ref.poly_ref(0)
        ));

        tiles.remove_tiles_at(UVec2::new(1, 0));
        assert!(external_links(&tiles, UVec2::ZERO).is_empty());
        assert!(!tiles.is_valid_poly_ref(new_ref.poly_ref(0)));
    }

    #[test]
    fn salt_skips_zero() {
        assert_eq!(next_salt(u16::MAX), 1);
        assert_eq!(next_salt(1), 2);
    }

    #[test]
    fn poly_ref_packs_fields() {
        let tile_ref = TileRef::new(0xbeef, MAX_TILE_SLOTS - 1);
        let poly_ref = tile_ref.poly_ref(0xabcde);

        assert_eq!(poly_ref.salt(), 0xbeef);
        assert_eq!(poly_ref.tile_slot(), MAX_TILE_SLOTS - 1);
        assert_eq!(poly_ref.polygon(), 0xabcde);
        assert_eq!(poly_ref.tile_ref(), tile_ref);
        assert_eq!(PolyRef::from_bits(poly_ref.to_bits()), poly_ref);
    }

    #[test]
    fn tile_data_survives_serialization() {
        let mut data = left_tile();
        data.off_mesh_links.push(OffMeshLinkRecord {
            start: [Vec3::new(1.0, 0.0, 1.0); 2],
            end: [Vec3::new(10.0, 2.0, 1.0); 2],
            snap_radius: 0.5,
            snap_height: 0.25,
            bidirectional: true,
            area: Area(4),
            start_polygon: 0,
        });

        let bytes = data.to_bytes();
        assert_eq!(TileData::from_bytes(&bytes).unwrap(), data);

        assert!(matches!(
            TileData::from_bytes(&bytes[..bytes.len() - 3]),
            Err(TileDataError::Malformed(_))
        ));
    }

    #[test]
    fn edge_encoding_rejects_unknown_directions() {
        assert_eq!(decode_edge(0), Some(EdgeConnection::None));
        assert_eq!(decode_edge(6), Some(EdgeConnection::Internal(5)));
        assert_eq!(decode_edge(EDGE_EXTERNAL_FLAG | 9), None);
    }

    #[test]
    fn off_mesh_link_snaps_to_nearby_polygon() {
        let data = left_tile();

        assert_eq!(
            find_snapped_polygon(
                &data.vertices,
                &data.polygons,
                Vec3::new(4.2, 0.1, 2.0),
                0.5,
                0.25
            ),
            Some(0)
        );
        assert_eq!(
            find_snapped_polygon(
                &data.vertices,
                &data.polygons,
                Vec3::new(2.0, 1.0, 2.0),
                0.5,
                0.25
            ),
            None
        );
    }
}
