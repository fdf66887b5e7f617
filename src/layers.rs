//! Splitting the compact heightfield of a tile into height bands that are compressed & cached.
//!
//! Cached layers let area modifiers be re-applied without voxelizing the geometry again.
use std::io::{self, Read, Write};

use bevy::{
    math::{bounding::Aabb3d, UVec2, Vec3A},
    platform::collections::HashMap,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

#[cfg(feature = "trace")]
use bevy::log::info_span;

use crate::{
    error::{try_reserve, BuildStage, LimitExceeded, TileBuildError, TileDataError},
    heightfields::{link_neighbours, OpenCell, OpenSpan, OpenTile},
    math::get_neighbour_index,
    regions::sweep_regions,
    Area, NavMeshSettings,
};

/// Maximum height range of a single layer in cells.
const MAX_LAYER_HEIGHT: u16 = 255;
const MAX_LAYERS: usize = 255;
const NO_LAYER: u8 = u8::MAX;
const EMPTY_CELL: u8 = u8::MAX;

const LAYER_MAGIC: u32 = u32::from_le_bytes(*b"TNLY");
const LAYER_VERSION: u16 = 1;

/// Height range of one layer in cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LayerRange {
    pub min_height: u16,
    pub max_height: u16,
}

/// Assignment of every span in an [`OpenTile`] to a layer.
#[derive(Default, Debug)]
pub(crate) struct LayerSet {
    /// Layer of each span, indexed by ``tile_index``. [`u8::MAX`] for spans not in any layer.
    pub span_layers: Vec<u8>,
    pub layers: Vec<LayerRange>,
}

#[derive(Default, Clone)]
struct LayerRegion {
    min_height: u16,
    max_height: u16,
    layer: u8,
    neighbours: SmallVec<[u16; 8]>,
    /// Regions stacked in the same columns as this one.
    overlaps: SmallVec<[u16; 8]>,
}

struct LayerGroup {
    range: LayerRange,
    regions: Vec<u16>,
    overlaps: Vec<u16>,
}

fn add_unique(list: &mut SmallVec<[u16; 8]>, value: u16) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Groups the walkable spans of ``open_tile`` into layers where no two spans share a column.
pub(crate) fn build_layer_set(
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<LayerSet, TileBuildError> {
    #[cfg(feature = "trace")]
    let _span = info_span!("Build layers").entered();

    let tile_side = open_tile.tile_side;

    let mut regions = Vec::new();
    try_reserve(&mut regions, open_tile.span_count, BuildStage::Layers)?;
    regions.resize(open_tile.span_count, 0u16);

    let mut region_count = sweep_regions(open_tile, 0, None, false, &mut regions, 1)?;

    // Spans in the same column may have been swept into the same region. Those need their own.
    let mut column_regions: SmallVec<[u16; 8]> = SmallVec::new();
    for cell in open_tile.cells.iter() {
        column_regions.clear();

        for span in cell.spans.iter() {
            let region = regions[span.tile_index];
            if region == 0 {
                continue;
            }

            if column_regions.contains(&region) {
                if region_count >= u16::MAX - 1 {
                    return Err(LimitExceeded::Regions.into());
                }
                regions[span.tile_index] = region_count;
                column_regions.push(region_count);
                region_count += 1;
            } else {
                column_regions.push(region);
            }
        }
    }

    // A single region may climb a ramp taller than a layer can hold. Split those into height bands.
    let mut region_min_heights = vec![u16::MAX; usize::from(region_count)];
    for cell in open_tile.cells.iter() {
        for span in cell.spans.iter() {
            let region = usize::from(regions[span.tile_index]);
            region_min_heights[region] = region_min_heights[region].min(span.min);
        }
    }

    let mut band_regions: HashMap<(u16, u16), u16> = HashMap::default();
    for cell in open_tile.cells.iter() {
        for span in cell.spans.iter() {
            let region = regions[span.tile_index];
            if region == 0 {
                continue;
            }

            let band = (span.min - region_min_heights[usize::from(region)]) / MAX_LAYER_HEIGHT;
            if band == 0 {
                continue;
            }

            let band_region = match band_regions.get(&(region, band)) {
                Some(band_region) => *band_region,
                None => {
                    if region_count >= u16::MAX - 1 {
                        return Err(LimitExceeded::Regions.into());
                    }
                    band_regions.insert((region, band), region_count);
                    region_count += 1;
                    region_count - 1
                }
            };
            regions[span.tile_index] = band_region;
        }
    }

    let mut layer_regions = vec![
        LayerRegion {
            min_height: u16::MAX,
            max_height: 0,
            layer: NO_LAYER,
            ..Default::default()
        };
        usize::from(region_count)
    ];

    for (cell_index, cell) in open_tile.cells.iter().enumerate() {
        column_regions.clear();

        for span in cell.spans.iter() {
            let region = regions[span.tile_index];
            if region == 0 {
                continue;
            }

            let layer_region = &mut layer_regions[usize::from(region)];
            layer_region.min_height = layer_region.min_height.min(span.min);
            layer_region.max_height = layer_region.max_height.max(span.min);

            for (dir, neighbour) in span.neighbours.iter().enumerate() {
                let Some(neighbour) = neighbour else {
                    continue;
                };

                let other_span = &open_tile.cells[get_neighbour_index(tile_side, cell_index, dir)]
                    .spans[*neighbour as usize];
                let other_region = regions[other_span.tile_index];
                if other_region != 0 && other_region != region {
                    add_unique(&mut layer_region.neighbours, other_region);
                }
            }

            column_regions.push(region);
        }

        for (i, a) in column_regions.iter().enumerate() {
            for b in column_regions.iter().skip(i + 1) {
                add_unique(&mut layer_regions[usize::from(*a)].overlaps, *b);
                add_unique(&mut layer_regions[usize::from(*b)].overlaps, *a);
            }
        }
    }

    let mut groups = flood_layers(&mut layer_regions);
    merge_layers(&mut groups, nav_mesh_settings.walkable_height);

    if groups.len() > MAX_LAYERS {
        return Err(LimitExceeded::Layers.into());
    }

    // Compact layer ids.
    for (layer, group) in groups.iter().enumerate() {
        for region in group.regions.iter() {
            layer_regions[usize::from(*region)].layer = layer as u8;
        }
    }

    let span_layers = regions
        .iter()
        .map(|region| {
            if *region == 0 {
                NO_LAYER
            } else {
                layer_regions[usize::from(*region)].layer
            }
        })
        .collect();

    Ok(LayerSet {
        span_layers,
        layers: groups.into_iter().map(|group| group.range).collect(),
    })
}

fn flood_layers(layer_regions: &mut [LayerRegion]) -> Vec<LayerGroup> {
    let mut groups: Vec<LayerGroup> = Vec::new();
    let mut stack = Vec::new();

    for start in 1..layer_regions.len() {
        let start_region = &layer_regions[start];
        // Regions emptied by the column split or never used.
        if start_region.layer != NO_LAYER || start_region.min_height > start_region.max_height {
            continue;
        }

        let mut group = LayerGroup {
            range: LayerRange {
                min_height: start_region.min_height,
                max_height: start_region.max_height,
            },
            regions: vec![start as u16],
            overlaps: start_region.overlaps.to_vec(),
        };
        // Temporary id while flooding, compacted once layers are merged.
        layer_regions[start].layer = 0;

        stack.clear();
        stack.push(start);

        while let Some(region) = stack.pop() {
            let neighbours = layer_regions[region].neighbours.clone();

            for neighbour in neighbours {
                let other = &layer_regions[usize::from(neighbour)];
                if other.layer != NO_LAYER || group.overlaps.contains(&neighbour) {
                    continue;
                }

                let min_height = group.range.min_height.min(other.min_height);
                let max_height = group.range.max_height.max(other.max_height);
                if max_height - min_height >= MAX_LAYER_HEIGHT {
                    continue;
                }

                group.range = LayerRange {
                    min_height,
                    max_height,
                };
                group.regions.push(neighbour);
                for overlap in other.overlaps.iter() {
                    if !group.overlaps.contains(overlap) {
                        group.overlaps.push(*overlap);
                    }
                }

                layer_regions[usize::from(neighbour)].layer = 0;
                stack.push(usize::from(neighbour));
            }
        }

        groups.push(group);
    }

    groups
}

/// Merges layers that are close in height & don't share any columns.
fn merge_layers(groups: &mut Vec<LayerGroup>, merge_height: u16) {
    let mut i = 0;
    while i < groups.len() {
        let mut merged = false;

        for j in 0..groups.len() {
            if i == j {
                continue;
            }

            let (a, b) = (&groups[i], &groups[j]);

            let overlaps_range = a.range.min_height <= b.range.max_height.saturating_add(merge_height)
                && b.range.min_height <= a.range.max_height.saturating_add(merge_height);
            if !overlaps_range {
                continue;
            }

            let min_height = a.range.min_height.min(b.range.min_height);
            let max_height = a.range.max_height.max(b.range.max_height);
            if max_height - min_height >= MAX_LAYER_HEIGHT {
                continue;
            }

            if b.regions.iter().any(|region| a.overlaps.contains(region)) {
                continue;
            }

            let other = groups.remove(j);
            let target = if j < i { i - 1 } else { i };
            let group = &mut groups[target];

            group.range = LayerRange {
                min_height,
                max_height,
            };
            group.regions.extend(other.regions);
            for overlap in other.overlaps {
                if !group.overlaps.contains(&overlap) {
                    group.overlaps.push(overlap);
                }
            }

            i = target;
            merged = true;
            break;
        }

        if !merged {
            i += 1;
        }
    }
}

/// Compresses every layer of ``layer_set`` for caching.
pub(crate) fn compress_layers(
    open_tile: &OpenTile,
    layer_set: &LayerSet,
    tile: UVec2,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<Vec<CompressedLayer>, TileBuildError> {
    #[cfg(feature = "trace")]
    let _span = info_span!("Build tile cache").entered();

    let cell_count = open_tile.tile_side * open_tile.tile_side;

    let mut compressed = Vec::new();
    try_reserve(&mut compressed, layer_set.layers.len(), BuildStage::Layers)?;

    let mut heights = Vec::new();
    let mut areas = Vec::new();
    let mut clearances = Vec::new();
    let mut raw = Vec::new();
    try_reserve(&mut heights, cell_count, BuildStage::Layers)?;
    try_reserve(&mut areas, cell_count, BuildStage::Layers)?;
    try_reserve(&mut clearances, cell_count, BuildStage::Layers)?;
    try_reserve(&mut raw, cell_count * 5, BuildStage::Layers)?;

    for (layer_index, range) in layer_set.layers.iter().enumerate() {
        heights.clear();
        heights.resize(cell_count, EMPTY_CELL);
        areas.clear();
        areas.resize(cell_count, 0u16);
        clearances.clear();
        clearances.resize(cell_count, u16::MAX);

        for (cell_index, cell) in open_tile.cells.iter().enumerate() {
            let Some(span) = cell
                .spans
                .iter()
                .find(|span| layer_set.span_layers[span.tile_index] == layer_index as u8)
            else {
                continue;
            };
            let Some(area) = open_tile.areas[span.tile_index] else {
                continue;
            };

            let height = span
                .min
                .checked_sub(range.min_height)
                .and_then(|height| u8::try_from(height).ok())
                .filter(|height| *height != EMPTY_CELL)
                .ok_or(TileBuildError::LimitExceeded(LimitExceeded::Layers))?;

            heights[cell_index] = height;
            areas[cell_index] = area.0;
            clearances[cell_index] = span.max.map_or(u16::MAX, |max| max - span.min);
        }

        raw.clear();
        raw.extend_from_slice(&heights);
        for area in areas.iter() {
            raw.extend_from_slice(&area.to_le_bytes());
        }
        for clearance in clearances.iter() {
            raw.extend_from_slice(&clearance.to_le_bytes());
        }

        compressed.push(CompressedLayer {
            tile,
            layer: layer_index as u8,
            bounds: layer_bounds(tile, *range, open_tile.tile_side, nav_mesh_settings),
            min_height: range.min_height,
            max_height: range.max_height,
            tile_side: open_tile.tile_side as u16,
            data: lz4_flex::compress_prepend_size(&raw),
        });
    }

    Ok(compressed)
}

fn layer_bounds(
    tile: UVec2,
    range: LayerRange,
    tile_side: usize,
    nav_mesh_settings: &NavMeshSettings,
) -> Aabb3d {
    let origin = nav_mesh_settings.get_tile_origin_with_border(tile);
    let size = tile_side as f32 * nav_mesh_settings.cell_width;

    let step_height = nav_mesh_settings.step_height;
    let min_y = f32::from(range.min_height.saturating_sub(step_height))
        * nav_mesh_settings.cell_height
        + nav_mesh_settings.world_bottom_bound;
    let max_y = f32::from(range.max_height.saturating_add(step_height))
        * nav_mesh_settings.cell_height
        + nav_mesh_settings.world_bottom_bound;

    Aabb3d {
        min: Vec3A::new(origin.x, min_y, origin.y),
        max: Vec3A::new(origin.x + size, max_y, origin.y + size),
    }
}

/// One height band of a tile's compact heightfield, compressed with lz4.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedLayer {
    pub tile: UVec2,
    pub layer: u8,
    /// World space bounds, expanded vertically by the step height.
    pub bounds: Aabb3d,
    min_height: u16,
    max_height: u16,
    tile_side: u16,
    data: Vec<u8>,
}

impl CompressedLayer {
    /// Size of the compressed span data in bytes.
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// Height range of the layer in cells above the world's bottom bound.
    pub fn height_range(&self) -> (u16, u16) {
        (self.min_height, self.max_height)
    }

    /// Decompresses the layer into a compact heightfield with neighbours linked.
    pub(crate) fn decompress(
        &self,
        nav_mesh_settings: &NavMeshSettings,
    ) -> Result<OpenTile, TileDataError> {
        let tile_side = usize::from(self.tile_side);
        let cell_count = tile_side * tile_side;

        let raw = lz4_flex::decompress_size_prepended(&self.data)?;
        if raw.len() != cell_count * 5 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "layer data doesn't match tile size",
            )
            .into());
        }

        let (heights, rest) = raw.split_at(cell_count);
        let (areas, clearances) = rest.split_at(cell_count * 2);

        let mut cells = vec![OpenCell::default(); cell_count];
        let mut span_areas = Vec::new();

        for (cell_index, cell) in cells.iter_mut().enumerate() {
            let height = heights[cell_index];
            if height == EMPTY_CELL {
                continue;
            }

            let area = u16::from_le_bytes([areas[cell_index * 2], areas[cell_index * 2 + 1]]);
            let clearance = u16::from_le_bytes([
                clearances[cell_index * 2],
                clearances[cell_index * 2 + 1],
            ]);

            let min = self.min_height + u16::from(height);
            cell.spans.push(OpenSpan {
                min,
                max: (clearance != u16::MAX).then(|| min.saturating_add(clearance)),
                tile_index: span_areas.len(),
                ..Default::default()
            });
            span_areas.push(Some(Area(area)));
        }

        let span_count = span_areas.len();
        let mut open_tile = OpenTile {
            cells,
            distances: vec![u16::MAX; span_count],
            areas: span_areas,
            max_distance: 0,
            span_count,
            max_regions: 0,
            tile_side,
        };

        link_neighbours(&mut open_tile, nav_mesh_settings);

        Ok(open_tile)
    }

    /// Serializes the layer so it can be persisted & later restored with [`CompressedLayer::from_bytes`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 48);
        self.write(&mut bytes)
            .expect("Writing into a Vec is infallible.");

        bytes
    }

    fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(LAYER_MAGIC)?;
        writer.write_u16::<LittleEndian>(LAYER_VERSION)?;

        writer.write_u32::<LittleEndian>(self.tile.x)?;
        writer.write_u32::<LittleEndian>(self.tile.y)?;
        writer.write_u8(self.layer)?;

        for value in self.bounds.min.to_array() {
            writer.write_f32::<LittleEndian>(value)?;
        }
        for value in self.bounds.max.to_array() {
            writer.write_f32::<LittleEndian>(value)?;
        }

        writer.write_u16::<LittleEndian>(self.min_height)?;
        writer.write_u16::<LittleEndian>(self.max_height)?;
        writer.write_u16::<LittleEndian>(self.tile_side)?;

        writer.write_u32::<LittleEndian>(self.data.len() as u32)?;
        writer.write_all(&self.data)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, TileDataError> {
        let reader = &mut bytes;

        if reader.read_u32::<LittleEndian>()? != LAYER_MAGIC {
            return Err(TileDataError::InvalidMagic);
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version != LAYER_VERSION {
            return Err(TileDataError::UnsupportedVersion(version));
        }

        let tile = UVec2::new(
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        );
        let layer = reader.read_u8()?;

        let mut bounds = [0.0; 6];
        reader.read_f32_into::<LittleEndian>(&mut bounds)?;

        let min_height = reader.read_u16::<LittleEndian>()?;
        let max_height = reader.read_u16::<LittleEndian>()?;
        let tile_side = reader.read_u16::<LittleEndian>()?;

        let data_len = reader.read_u32::<LittleEndian>()? as usize;
        if data_len > reader.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let mut data = vec![0; data_len];
        reader.read_exact(&mut data)?;

        Ok(Self {
            tile,
            layer,
            bounds: Aabb3d {
                min: Vec3A::new(bounds[0], bounds[1], bounds[2]),
                max: Vec3A::new(bounds[3], bounds[4], bounds[5]),
            },
            min_height,
            max_height,
            tile_side,
            data,
        })
    }
}

/// Compressed layers of every generated tile.
#[derive(Default)]
pub struct TileLayerCache {
    tiles: HashMap<UVec2, Vec<CompressedLayer>>,
}

impl TileLayerCache {
    /// Layers of ``tile``, sorted by layer index. Empty if the tile isn't cached.
    pub fn get(&self, tile: UVec2) -> &[CompressedLayer] {
        self.tiles.get(&tile).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, tile: UVec2) -> bool {
        self.tiles.contains_key(&tile)
    }

    /// Replaces every cached layer of ``tile``.
    pub fn insert_tile(&mut self, tile: UVec2, mut layers: Vec<CompressedLayer>) {
        layers.sort_by_key(|layer| layer.layer);
        self.tiles.insert(tile, layers);
    }

    /// Inserts a single layer, replacing any existing layer with the same index.
    pub fn insert_layer(&mut self, layer: CompressedLayer) {
        let layers = self.tiles.entry(layer.tile).or_default();

        match layers.binary_search_by_key(&layer.layer, |existing| existing.layer) {
            Ok(index) => layers[index] = layer,
            Err(index) => layers.insert(index, layer),
        }
    }

    pub fn remove_tile(&mut self, tile: UVec2) -> Option<Vec<CompressedLayer>> {
        self.tiles.remove(&tile)
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompressedLayer> {
        self.tiles.values().flatten()
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bevy::math::Vec3;

    use super::*;
    use crate::heightfields::{
        build_open_heightfield_tile, erode_walkable_area, rasterize_triangle, VoxelizedTile,
    };

    fn settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
            .with_tile_width(NonZeroU16::new(32).unwrap())
    }

    fn quad(tile: &mut VoxelizedTile, min: f32, max: f32, y: f32, settings: &NavMeshSettings) {
        let y = y - settings.world_bottom_bound;

        for triangle in [
            [
                Vec3::new(min, y, min),
                Vec3::new(min, y, max),
                Vec3::new(max, y, max),
            ],
            [
                Vec3::new(min, y, min),
                Vec3::new(max, y, max),
                Vec3::new(max, y, min),
            ],
        ] {
            rasterize_triangle(tile, triangle, false, Some(Area(0)), false, settings);
        }
    }

    fn open_tile(settings: &NavMeshSettings, floors: &[(f32, f32, f32)]) -> OpenTile {
        let mut tile = VoxelizedTile::new(settings).unwrap();
        for (min, max, y) in floors {
            quad(&mut tile, *min, *max, *y, settings);
        }

        let mut open_tile = build_open_heightfield_tile(tile, settings).unwrap();
        erode_walkable_area(&mut open_tile, settings);

        open_tile
    }

    #[test]
    fn flat_tile_is_one_layer() {
        let settings = settings();
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        let open_tile = open_tile(&settings, &[(0.0, size, 0.0)]);

        let layer_set = build_layer_set(&open_tile, &settings).unwrap();

        assert_eq!(layer_set.layers.len(), 1);
    }

    #[test]
    fn stacked_floors_get_separate_layers() {
        let settings = settings();
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        // A platform 5 meters above the middle of the floor.
        let open_tile = open_tile(
            &settings,
            &[(0.0, size, 0.0), (size * 0.25, size * 0.75, 5.0)],
        );

        let layer_set = build_layer_set(&open_tile, &settings).unwrap();
        assert_eq!(layer_set.layers.len(), 2);

        // No column has two spans in the same layer.
        for cell in open_tile.cells.iter() {
            let mut seen = SmallVec::<[u8; 4]>::new();
            for span in cell.spans.iter() {
                let layer = layer_set.span_layers[span.tile_index];
                if layer == NO_LAYER {
                    continue;
                }
                assert!(!seen.contains(&layer));
                seen.push(layer);
            }
        }
    }

    #[test]
    fn cached_layer_restores_spans() {
        let settings = settings();
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        let open_tile = open_tile(&settings, &[(0.0, size, 0.0)]);

        let layer_set = build_layer_set(&open_tile, &settings).unwrap();
        let layers = compress_layers(&open_tile, &layer_set, UVec2::new(3, 4), &settings).unwrap();

        let restored = CompressedLayer::from_bytes(&layers[0].to_bytes()).unwrap();
        assert_eq!(restored, layers[0]);

        let decompressed = restored.decompress(&settings).unwrap();
        let walkable = open_tile.areas.iter().filter(|area| area.is_some()).count();
        assert_eq!(decompressed.span_count, walkable);
        assert!(decompressed.areas.iter().all(|area| *area == Some(Area(0))));
    }

    #[test]
    fn tall_ramp_restores_exact_heights() {
        let settings = settings().with_tile_width(NonZeroU16::new(256).unwrap());
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        let low = 1.0 - settings.world_bottom_bound;
        let high = low + size * 0.73;

        let mut tile = VoxelizedTile::new(&settings).unwrap();
        for triangle in [
            [
                Vec3::new(0.0, low, 0.0),
                Vec3::new(0.0, low, size),
                Vec3::new(size, high, size),
            ],
            [
                Vec3::new(0.0, low, 0.0),
                Vec3::new(size, high, size),
                Vec3::new(size, high, 0.0),
            ],
        ] {
            rasterize_triangle(&mut tile, triangle, false, Some(Area(0)), false, &settings);
        }
        let mut open_tile = build_open_heightfield_tile(tile, &settings).unwrap();
        erode_walkable_area(&mut open_tile, &settings);

        let layer_set = build_layer_set(&open_tile, &settings).unwrap();
        assert!(layer_set.layers.len() > 1);
        for range in layer_set.layers.iter() {
            assert!(range.max_height - range.min_height < MAX_LAYER_HEIGHT, "{range:?}");
        }

        let layers = compress_layers(&open_tile, &layer_set, UVec2::ZERO, &settings).unwrap();
        let restored = layers
            .iter()
            .map(|layer| layer.decompress(&settings).unwrap())
            .collect::<Vec<_>>();

        let mut walkable = 0;
        for (cell_index, cell) in open_tile.cells.iter().enumerate() {
            let mut expected = cell
                .spans
                .iter()
                .filter(|span| open_tile.areas[span.tile_index].is_some())
                .map(|span| span.min)
                .collect::<Vec<_>>();
            let mut actual = restored
                .iter()
                .flat_map(|layer| layer.cells[cell_index].spans.iter().map(|span| span.min))
                .collect::<Vec<_>>();
            expected.sort_unstable();
            actual.sort_unstable();

            walkable += expected.len();
            assert_eq!(actual, expected, "cell {cell_index}");
        }
        assert!(walkable > 0);
    }

    #[test]
    fn layer_taller_than_a_band_is_rejected() {
        let settings = settings();
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        let open_tile = open_tile(&settings, &[(0.0, size, 40.0)]);

        let mut layer_set = build_layer_set(&open_tile, &settings).unwrap();
        // The floor ends up exactly one band above the layer's minimum.
        let range = &mut layer_set.layers[0];
        range.min_height = range.max_height - MAX_LAYER_HEIGHT;

        assert_eq!(
            compress_layers(&open_tile, &layer_set, UVec2::ZERO, &settings),
            Err(TileBuildError::LimitExceeded(LimitExceeded::Layers))
        );
    }

    #[test]
    fn corrupt_layer_is_rejected() {
        assert!(matches!(
            CompressedLayer::from_bytes(b"nope"),
            Err(TileDataError::InvalidMagic) | Err(TileDataError::Malformed(_))
        ));
    }

    #[test]
    fn cache_replaces_layers_by_index() {
        let settings = settings();
        let size = settings.get_tile_side_with_border() as f32 * settings.cell_width;
        let open_tile = open_tile(&settings, &[(0.0, size, 0.0)]);
        let layer_set = build_layer_set(&open_tile, &settings).unwrap();
        let layers = compress_layers(&open_tile, &layer_set, UVec2::ZERO, &settings).unwrap();

        let mut cache = TileLayerCache::default();
        cache.insert_tile(UVec2::ZERO, layers.clone());
        cache.insert_layer(layers[0].clone());

        assert_eq!(cache.get(UVec2::ZERO).len(), 1);
        assert!(cache.get(UVec2::ONE).is_empty());
        assert!(cache.remove_tile(UVec2::ZERO).is_some());
        assert!(cache.is_empty());
    }
}
