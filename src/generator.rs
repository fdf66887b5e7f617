//! Incremental generation of nav-mesh tiles.
//!
//! [`NavMeshGenerator`] tracks dirty tiles & schedules their generation, either as tasks on the [`AsyncComputeTaskPool`] or time-sliced on the calling thread.
//! Each tile is generated by a [`TileGenerator`], a resumable state machine that can be stepped with a time budget.
use std::{
    collections::VecDeque,
    ops::{BitOr, BitOrAssign},
    sync::Arc,
    time::Duration,
};

use bevy::{
    log::{debug, error, warn},
    math::{bounding::Aabb3d, bounding::IntersectsVolume, UVec2, Vec2, Vec3, Vec3A, Vec3Swizzles},
    platform::{collections::HashMap, time::Instant},
    prelude::Resource,
    tasks::{block_on, futures_lite::future::poll_once, AsyncComputeTaskPool, Task, TaskPool},
};

#[cfg(feature = "trace")]
use bevy::log::info_span;

use crate::{
    areas::mark_dynamic_areas,
    contour::{build_contours, ContourSet},
    detail_mesh::{build_detail_mesh, DetailMesh},
    error::{LimitExceeded, TileBuildError},
    geometry::{GeometryProvider, TileGeometry},
    heightfields::{
        build_open_heightfield_tile, erode_walkable_area, filter_ledge_spans,
        filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
        rasterize_geometry_instance, OpenTile, VoxelizedTile,
    },
    layers::{build_layer_set, compress_layers, CompressedLayer, LayerSet, TileLayerCache},
    mesher::{build_poly_mesh, PolyMesh},
    regions::build_regions,
    tiles::{NavMeshTiles, TileData, TileIndex},
    GenerationMode, NavMeshSettings, TimeSliceSettings,
};

/// What changed inside a [`DirtyArea`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    /// Geometry changed, the tile has to be voxelized again.
    pub const GEOMETRY: DirtyFlags = DirtyFlags(1);
    /// Only area modifiers or off-mesh links changed, cached layers can be reused.
    pub const DYNAMIC_MODIFIER: DirtyFlags = DirtyFlags(1 << 1);
    /// The area also affects the agent height below it.
    pub const USE_AGENT_HEIGHT: DirtyFlags = DirtyFlags(1 << 2);

    pub const fn empty() -> Self {
        DirtyFlags(0)
    }

    pub const fn contains(self, other: DirtyFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DirtyFlags {
    type Output = DirtyFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        DirtyFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// World space box that needs to be regenerated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirtyArea {
    pub bounds: Aabb3d,
    pub flags: DirtyFlags,
}

impl DirtyArea {
    pub fn new(bounds: Aabb3d, flags: DirtyFlags) -> Self {
        Self { bounds, flags }
    }
}

/// A tile waiting to be generated.
#[derive(Clone, Debug)]
pub struct PendingTileElement {
    pub coord: UVec2,
    /// Areas inside the tile that changed. Empty when the whole tile is rebuilt.
    pub dirty_areas: Vec<DirtyArea>,
    pub rebuild_geometry: bool,
    /// Distance on the XZ-plane to the closest seed location. Closer tiles are generated first.
    pub seed_distance: f32,
}

impl PendingTileElement {
    fn new(coord: UVec2, seed_distance: f32) -> Self {
        Self {
            coord,
            dirty_areas: Vec::new(),
            rebuild_geometry: false,
            seed_distance,
        }
    }

    /// Merges a new dirty area into the element. Partial areas are dropped once the geometry has to be rebuilt.
    pub fn merge(&mut self, area: DirtyArea) {
        self.rebuild_geometry |= area.flags.contains(DirtyFlags::GEOMETRY);

        if self.rebuild_geometry {
            self.dirty_areas.clear();
        } else {
            self.dirty_areas.push(area);
        }
    }
}

struct RunningTileElement {
    coord: UVec2,
    task: Task<Result<TileGenerationResult, TileBuildError>>,
    /// Set when the tile is removed while generating. The result is dropped.
    discard: bool,
}

/// Output of a [`TileGenerator`].
#[derive(Debug, Default)]
pub struct TileGenerationResult {
    pub coord: UVec2,
    /// All layers of the tile when the geometry was voxelized. ``None`` when cached layers were reused.
    pub cache_layers: Option<Vec<CompressedLayer>>,
    /// Layers that were regenerated. Layers without polygons have no tile data.
    pub rebuilt_layers: Vec<u8>,
    /// Serialized [`TileData`] of every rebuilt layer with polygons.
    pub tile_data: Vec<Vec<u8>>,
}

impl TileGenerationResult {
    /// A result with zero layers clears the tile.
    pub fn is_empty(&self) -> bool {
        self.tile_data.is_empty()
    }
}

/// Outcome of [`TileGenerator::step`].
#[derive(Debug)]
pub enum GeneratorStep {
    /// Out of time. Call [`TileGenerator::step`] again to continue.
    Continue,
    Done(TileGenerationResult),
    Failed(TileBuildError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    // Generate layers.
    CreateHeightfield,
    RasterizeTriangles,
    Filter,
    CompactHeightfield,
    ErodeWalkable,
    BuildLayers,
    BuildTileCache,
    // Generate navigation data, once per dirty layer.
    Decompress,
    MarkDynamicAreas,
    BuildRegions,
    BuildContours,
    BuildPolyMesh,
    BuildDetailMesh,
    Serialize,
    Finished,
    Cancelled,
}

/// Generates a single tile, one sub-step at a time.
///
/// All data the generator needs is gathered in [`TileGenerator::new`] so it can be moved to another thread.
pub struct TileGenerator {
    coord: UVec2,
    settings: Arc<NavMeshSettings>,
    geometry: TileGeometry,
    rebuild_geometry: bool,
    stage: Stage,

    element_index: usize,
    instance_index: usize,
    layer_index: usize,

    voxelized_tile: Option<VoxelizedTile>,
    open_tile: Option<OpenTile>,
    layer_set: Option<LayerSet>,
    layers: Vec<CompressedLayer>,
    dirty_layers: Vec<usize>,

    layer_tile: Option<OpenTile>,
    contour_set: Option<ContourSet>,
    poly_mesh: Option<PolyMesh>,
    detail_mesh: Option<DetailMesh>,

    rebuilt_layers: Vec<u8>,
    tile_data: Vec<Vec<u8>>,
}

impl TileGenerator {
    /// Gathers everything needed to generate the tile in ``element``.
    ///
    /// A modifier only element for a tile without cached layers is promoted to a full rebuild.
    pub fn new(
        element: &PendingTileElement,
        settings: Arc<NavMeshSettings>,
        provider: &impl GeometryProvider,
        layer_cache: &TileLayerCache,
    ) -> Self {
        #[cfg(feature = "trace")]
        let _span = info_span!("Gather geometry").entered();

        let coord = element.coord;
        let rebuild_geometry = element.rebuild_geometry || !layer_cache.contains(coord);

        let bounds = tile_gather_bounds(&settings, coord);
        let geometry = TileGeometry {
            elements: if rebuild_geometry {
                provider.gather_geometry(&bounds)
            } else {
                Vec::new()
            },
            modifiers: provider.gather_modifiers(&bounds),
            off_mesh_links: provider.gather_off_mesh_links(&bounds),
        };

        let (stage, layers, dirty_layers) = if rebuild_geometry {
            let stage = if geometry.is_empty() {
                Stage::Finished
            } else {
                Stage::CreateHeightfield
            };

            (stage, Vec::new(), Vec::new())
        } else {
            let layers = layer_cache.get(coord).to_vec();
            let dirty_layers = layers
                .iter()
                .enumerate()
                .filter(|(_, layer)| {
                    element
                        .dirty_areas
                        .iter()
                        .any(|area| layer.bounds.intersects(&area.bounds))
                })
                .map(|(i, _)| i)
                .collect::<Vec<_>>();

            let stage = if dirty_layers.is_empty() {
                Stage::Finished
            } else {
                Stage::Decompress
            };

            (stage, layers, dirty_layers)
        };

        Self {
            coord,
            settings,
            geometry,
            rebuild_geometry,
            stage,
            element_index: 0,
            instance_index: 0,
            layer_index: 0,
            voxelized_tile: None,
            open_tile: None,
            layer_set: None,
            layers,
            dirty_layers,
            layer_tile: None,
            contour_set: None,
            poly_mesh: None,
            detail_mesh: None,
            rebuilt_layers: Vec::new(),
            tile_data: Vec::new(),
        }
    }

    pub fn coord(&self) -> UVec2 {
        self.coord
    }

    /// Whether the geometry is voxelized or cached layers are reused.
    pub fn rebuilds_geometry(&self) -> bool {
        self.rebuild_geometry
    }

    /// Stops the generator. Any further step fails with [`TileBuildError::Cancelled`].
    pub fn cancel(&mut self) {
        self.stage = Stage::Cancelled;
        self.voxelized_tile = None;
        self.open_tile = None;
        self.layer_tile = None;
    }

    /// Runs sub-steps until the generator finishes or ``budget`` runs out.
    ///
    /// The elapsed time is checked after every sub-step, so at least one sub-step always runs.
    pub fn step(&mut self, budget: Duration) -> GeneratorStep {
        let start = Instant::now();

        loop {
            match self.step_once() {
                Ok(true) => return GeneratorStep::Done(self.take_result()),
                Ok(false) => {}
                Err(error) => {
                    self.cancel();
                    return GeneratorStep::Failed(error);
                }
            }

            if start.elapsed() >= budget {
                return GeneratorStep::Continue;
            }
        }
    }

    /// Steps the generator until it's done.
    pub fn run_to_completion(mut self) -> Result<TileGenerationResult, TileBuildError> {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build tile").entered();

        loop {
            match self.step(Duration::MAX) {
                GeneratorStep::Continue => {}
                GeneratorStep::Done(result) => return Ok(result),
                GeneratorStep::Failed(error) => return Err(error),
            }
        }
    }

    fn take_result(&mut self) -> TileGenerationResult {
        TileGenerationResult {
            coord: self.coord,
            cache_layers: self
                .rebuild_geometry
                .then(|| std::mem::take(&mut self.layers)),
            rebuilt_layers: std::mem::take(&mut self.rebuilt_layers),
            tile_data: std::mem::take(&mut self.tile_data),
        }
    }

    /// Runs a single sub-step. Returns true when the tile is finished.
    fn step_once(&mut self) -> Result<bool, TileBuildError> {
        let settings = self.settings.clone();
        let settings = settings.as_ref();

        match self.stage {
            Stage::CreateHeightfield => {
                self.voxelized_tile = Some(VoxelizedTile::new(settings)?);
                self.stage = Stage::RasterizeTriangles;
            }
            Stage::RasterizeTriangles => {
                let (Some(voxelized_tile), Some(element)) = (
                    self.voxelized_tile.as_mut(),
                    self.geometry.elements.get(self.element_index),
                ) else {
                    self.stage = Stage::Filter;
                    return Ok(false);
                };

                #[cfg(feature = "trace")]
                let _span = info_span!("Rasterize triangles").entered();

                rasterize_geometry_instance(
                    voxelized_tile,
                    self.coord,
                    element,
                    self.instance_index,
                    settings,
                );

                self.instance_index += 1;
                if self.instance_index >= element.instance_count() {
                    self.instance_index = 0;
                    self.element_index += 1;
                }
            }
            Stage::Filter => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Filter heightfield").entered();

                if let Some(voxelized_tile) = self.voxelized_tile.as_mut() {
                    filter_low_hanging_walkable_obstacles(voxelized_tile, settings);
                    filter_ledge_spans(voxelized_tile, settings);
                    filter_walkable_low_height_spans(voxelized_tile, settings);
                }
                self.stage = Stage::CompactHeightfield;
            }
            Stage::CompactHeightfield => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Build open heightfield tile").entered();

                let Some(voxelized_tile) = self.voxelized_tile.take() else {
                    self.stage = Stage::Finished;
                    return Ok(false);
                };
                let open_tile = build_open_heightfield_tile(voxelized_tile, settings)?;

                self.stage = if open_tile.span_count == 0 {
                    Stage::Finished
                } else {
                    Stage::ErodeWalkable
                };
                self.open_tile = Some(open_tile);
            }
            Stage::ErodeWalkable => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Erode walkable area").entered();

                if let Some(open_tile) = self.open_tile.as_mut() {
                    erode_walkable_area(open_tile, settings);
                }
                self.stage = Stage::BuildLayers;
            }
            Stage::BuildLayers => {
                if let Some(open_tile) = self.open_tile.as_ref() {
                    self.layer_set = Some(build_layer_set(open_tile, settings)?);
                }
                self.stage = Stage::BuildTileCache;
            }
            Stage::BuildTileCache => {
                let (Some(open_tile), Some(layer_set)) =
                    (self.open_tile.take(), self.layer_set.take())
                else {
                    self.stage = Stage::Finished;
                    return Ok(false);
                };

                self.layers = compress_layers(&open_tile, &layer_set, self.coord, settings)?;
                self.dirty_layers = (0..self.layers.len()).collect();
                self.layer_index = 0;

                self.stage = if self.layers.is_empty() {
                    Stage::Finished
                } else {
                    Stage::Decompress
                };
            }
            Stage::Decompress => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Decompress layer").entered();

                let Some(layer) = self
                    .dirty_layers
                    .get(self.layer_index)
                    .and_then(|layer| self.layers.get(*layer))
                else {
                    self.stage = Stage::Finished;
                    return Ok(false);
                };

                let layer_tile = layer.decompress(settings).map_err(|error| {
                    error!(
                        "Failed to decompress layer {} of tile {}: {}",
                        layer.layer, self.coord, error
                    );
                    TileBuildError::CorruptLayer(layer.layer)
                })?;

                self.layer_tile = Some(layer_tile);
                self.stage = Stage::MarkDynamicAreas;
            }
            Stage::MarkDynamicAreas => {
                if let Some(layer_tile) = self.layer_tile.as_mut() {
                    mark_dynamic_areas(layer_tile, self.coord, &self.geometry.modifiers, settings);
                }
                self.stage = Stage::BuildRegions;
            }
            Stage::BuildRegions => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Build regions").entered();

                if let Some(layer_tile) = self.layer_tile.as_mut() {
                    build_regions(layer_tile, settings)?;
                }
                self.stage = Stage::BuildContours;
            }
            Stage::BuildContours => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Build contours").entered();

                if let Some(layer_tile) = self.layer_tile.as_ref() {
                    self.contour_set = Some(build_contours(layer_tile, settings)?);
                }
                self.stage = Stage::BuildPolyMesh;
            }
            Stage::BuildPolyMesh => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Build poly mesh").entered();

                if let Some(contour_set) = self.contour_set.take() {
                    self.poly_mesh = Some(build_poly_mesh(&contour_set, settings)?);
                }
                self.stage = Stage::BuildDetailMesh;
            }
            Stage::BuildDetailMesh => {
                if let (Some(layer_tile), Some(poly_mesh)) =
                    (self.layer_tile.as_ref(), self.poly_mesh.as_ref())
                {
                    self.detail_mesh = build_detail_mesh(settings, layer_tile, poly_mesh)?;
                }
                self.stage = Stage::Serialize;
            }
            Stage::Serialize => {
                #[cfg(feature = "trace")]
                let _span = info_span!("Serialize tile").entered();

                self.layer_tile = None;
                let detail_mesh = self.detail_mesh.take();

                let layer = self.layers[self.dirty_layers[self.layer_index]].layer;
                if let Some(poly_mesh) = self.poly_mesh.take() {
                    if !poly_mesh.polygons.is_empty() {
                        let tile_data = TileData::from_poly_mesh(
                            &poly_mesh,
                            detail_mesh.as_ref(),
                            self.coord,
                            layer,
                            &self.geometry.off_mesh_links,
                            settings,
                        );
                        self.tile_data.push(tile_data.to_bytes());
                    }
                }
                self.rebuilt_layers.push(layer);

                self.layer_index += 1;
                self.stage = if self.layer_index < self.dirty_layers.len() {
                    Stage::Decompress
                } else {
                    Stage::Finished
                };
            }
            Stage::Finished => return Ok(true),
            Stage::Cancelled => return Err(TileBuildError::Cancelled),
        }

        Ok(false)
    }
}

/// Bounds of the tile including its border, vertically unbounded.
fn tile_gather_bounds(settings: &NavMeshSettings, coord: UVec2) -> Aabb3d {
    let tile_bounds = settings.get_tile_bounds(coord);
    let border = settings.get_border_size();

    Aabb3d {
        min: Vec3A::new(tile_bounds.min.x - border, f32::MIN, tile_bounds.min.y - border),
        max: Vec3A::new(tile_bounds.max.x + border, f32::MAX, tile_bounds.max.y + border),
    }
}

/// Moving average over the last ``capacity`` samples.
#[derive(Debug, Clone)]
struct MovingWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl MovingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, sample: f32) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }

        Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
    }
}

/// Decides how long tiles may be generated for each frame when time-slicing.
///
/// The slice is sized to drain the queued work within [`TimeSliceSettings::max_desired_tile_regen_duration`].
#[derive(Debug, Clone)]
pub struct TimeSliceBudget {
    frame_deltas: MovingWindow,
    tile_regen_durations: MovingWindow,
}

impl TimeSliceBudget {
    pub fn new(settings: &TimeSliceSettings) -> Self {
        Self {
            frame_deltas: MovingWindow::new(settings.frame_delta_window),
            tile_regen_durations: MovingWindow::new(settings.tile_regen_window),
        }
    }

    pub fn record_frame_delta(&mut self, delta_seconds: f32) {
        if delta_seconds > 0.0 {
            self.frame_deltas.push(delta_seconds);
        }
    }

    pub fn record_tile_regen_duration(&mut self, duration: Duration) {
        self.tile_regen_durations.push(duration.as_secs_f32());
    }

    /// Time to spend generating this frame.
    pub fn time_slice(
        &self,
        settings: &TimeSliceSettings,
        pending_tiles: usize,
        running_tiles: usize,
        current_tile_regen_duration: Duration,
    ) -> Duration {
        let avg_frame_delta = self
            .frame_deltas
            .average()
            .unwrap_or(settings.default_frame_delta.as_secs_f32());
        let avg_tile_regen_duration = self
            .tile_regen_durations
            .average()
            .unwrap_or(settings.default_tile_regen_duration.as_secs_f32())
            .max(f32::EPSILON);

        let max_frames = (settings.max_desired_tile_regen_duration.as_secs_f32() / avg_frame_delta)
            .floor()
            .max(1.0);
        let extra = current_tile_regen_duration.as_secs_f32() / avg_tile_regen_duration;
        let total = avg_tile_regen_duration * (pending_tiles as f32 + running_tiles as f32 + extra);

        Duration::from_secs_f32(total / max_frames)
            .clamp(settings.min_time_slice, settings.max_time_slice)
    }
}

struct TimeSlicedTile {
    generator: TileGenerator,
    /// Time spent stepping the generator so far.
    elapsed: Duration,
}

/// Tracks dirty tiles & generates them into a [`NavMeshTiles`].
///
/// All results are applied inside [`NavMeshGenerator::tick`] on the calling thread.
#[derive(Resource)]
pub struct NavMeshGenerator {
    settings: Arc<NavMeshSettings>,
    tiles: NavMeshTiles,
    layer_cache: TileLayerCache,

    pending: HashMap<UVec2, PendingTileElement>,
    running: Vec<RunningTileElement>,
    time_sliced: Option<TimeSlicedTile>,
    time_slice_budget: TimeSliceBudget,

    seed_locations: Vec<Vec3>,
}

impl NavMeshGenerator {
    pub fn new(settings: NavMeshSettings) -> Self {
        let time_slice_budget = TimeSliceBudget::new(&settings.time_slice_settings);
        let tiles = NavMeshTiles::with_max_tiles(settings.max_tiles);

        Self {
            settings: Arc::new(settings),
            tiles,
            layer_cache: TileLayerCache::default(),
            pending: HashMap::default(),
            running: Vec::new(),
            time_sliced: None,
            time_slice_budget,
            seed_locations: Vec::new(),
        }
    }

    pub fn settings(&self) -> &NavMeshSettings {
        &self.settings
    }

    /// The generated nav-mesh.
    pub fn tiles(&self) -> &NavMeshTiles {
        &self.tiles
    }

    pub fn layer_cache(&self) -> &TileLayerCache {
        &self.layer_cache
    }

    /// Seeds the layer cache, for example with layers restored with [`CompressedLayer::from_bytes`].
    ///
    /// Tiles with cached layers can then be rebuilt from modifier changes without voxelizing their geometry.
    pub fn insert_cached_layers(&mut self, layers: impl IntoIterator<Item = CompressedLayer>) {
        for layer in layers {
            self.layer_cache.insert_layer(layer);
        }
    }

    /// Tiles closer to the seed locations are generated first.
    pub fn set_seed_locations(&mut self, seed_locations: Vec<Vec3>) {
        self.seed_locations = seed_locations;

        let settings = self.settings.clone();
        for element in self.pending.values_mut() {
            element.seed_distance = seed_distance(&settings, &self.seed_locations, element.coord);
        }
    }

    pub fn mark_dirty(&mut self, bounds: Aabb3d, flags: DirtyFlags) {
        self.mark_dirty_areas(&[DirtyArea::new(bounds, flags)]);
    }

    /// Marks every tile touched by ``areas`` as dirty.
    ///
    /// Areas are grown by twice the tile border on the XZ-plane, as anything within the border affects the tile.
    pub fn mark_dirty_areas(&mut self, areas: &[DirtyArea]) {
        let border_expansion = self.settings.get_border_size() * 2.0;
        let agent_height =
            f32::from(self.settings.walkable_height) * self.settings.cell_height;

        for area in areas {
            let mut bounds = area.bounds;
            bounds.min -= Vec3A::new(border_expansion, 0.0, border_expansion);
            bounds.max += Vec3A::new(border_expansion, 0.0, border_expansion);
            if area.flags.contains(DirtyFlags::USE_AGENT_HEIGHT) {
                bounds.min.y -= agent_height;
            }

            let (min_tile, max_tile) = self
                .settings
                .get_tile_range(Vec3::from(bounds.min).xz(), Vec3::from(bounds.max).xz());

            let area = DirtyArea::new(bounds, area.flags);
            for y in min_tile.y..=max_tile.y {
                for x in min_tile.x..=max_tile.x {
                    let coord = UVec2::new(x, y);

                    self.pending
                        .entry(coord)
                        .or_insert_with(|| {
                            PendingTileElement::new(
                                coord,
                                seed_distance(&self.settings, &self.seed_locations, coord),
                            )
                        })
                        .merge(area);
                }
            }
        }
    }

    /// Fully rebuilds every tile that currently has nav-mesh data or cached layers.
    pub fn rebuild_all(&mut self) {
        let mut coords = self
            .tiles
            .iter()
            .map(|(index, _)| index.coord)
            .chain(self.layer_cache.iter().map(|layer| layer.tile))
            .collect::<Vec<_>>();
        coords.sort_by_key(|coord| (coord.y, coord.x));
        coords.dedup();

        self.re_add_tiles(&coords);
    }

    /// Queues a full rebuild of ``coords``.
    pub fn re_add_tiles(&mut self, coords: &[UVec2]) {
        let tile_bounds = self.settings.get_tile_size();

        for coord in coords {
            let origin = self.settings.get_tile_origin(*coord);
            let area = DirtyArea::new(
                Aabb3d {
                    min: Vec3A::new(origin.x, f32::MIN, origin.y),
                    max: Vec3A::new(origin.x + tile_bounds, f32::MAX, origin.y + tile_bounds),
                },
                DirtyFlags::GEOMETRY,
            );

            self.pending
                .entry(*coord)
                .or_insert_with(|| {
                    PendingTileElement::new(
                        *coord,
                        seed_distance(&self.settings, &self.seed_locations, *coord),
                    )
                })
                .merge(area);
        }
    }

    /// Removes the tiles & their cached layers. Generation in progress for the tiles is discarded.
    pub fn remove_tiles(&mut self, coords: &[UVec2]) {
        for coord in coords {
            self.pending.remove(coord);

            for running in self.running.iter_mut().filter(|running| running.coord == *coord) {
                running.discard = true;
            }

            if self
                .time_sliced
                .as_ref()
                .is_some_and(|time_sliced| time_sliced.generator.coord() == *coord)
            {
                if let Some(mut time_sliced) = self.time_sliced.take() {
                    time_sliced.generator.cancel();
                }
            }

            self.tiles.remove_tiles_at(*coord);
            self.layer_cache.remove_tile(*coord);
        }
    }

    pub fn is_build_in_progress(&self) -> bool {
        !self.pending.is_empty() || !self.running.is_empty() || self.time_sliced.is_some()
    }

    /// Number of pending or generating tiles touching ``bounds``.
    pub fn dirty_tile_count(&self, bounds: Aabb3d) -> usize {
        let (min_tile, max_tile) = self
            .settings
            .get_tile_range(Vec3::from(bounds.min).xz(), Vec3::from(bounds.max).xz());
        let in_range = |coord: &UVec2| {
            coord.x >= min_tile.x
                && coord.y >= min_tile.y
                && coord.x <= max_tile.x
                && coord.y <= max_tile.y
        };

        let mut coords = self
            .pending
            .keys()
            .copied()
            .chain(self.running.iter().map(|running| running.coord))
            .chain(
                self.time_sliced
                    .iter()
                    .map(|time_sliced| time_sliced.generator.coord()),
            )
            .filter(in_range)
            .collect::<Vec<_>>();
        coords.sort_by_key(|coord| (coord.y, coord.x));
        coords.dedup();

        coords.len()
    }

    /// Drops all pending work & waits for running tasks, discarding their results.
    pub fn cancel_build(&mut self) {
        self.pending.clear();

        for running in self.running.drain(..) {
            let _ = block_on(running.task);
            debug!("Discarded generation result for tile {}.", running.coord);
        }

        if let Some(mut time_sliced) = self.time_sliced.take() {
            time_sliced.generator.cancel();
        }
    }

    /// Advances generation & applies finished tiles. Returns the tiles that were added, replaced or removed.
    pub fn tick(&mut self, provider: &impl GeometryProvider, delta_seconds: f32) -> Vec<TileIndex> {
        let mut changed = Vec::new();

        match self.settings.generation_mode {
            GenerationMode::Async => {
                self.poll_running_tasks(&mut changed);
                self.spawn_tasks(provider);
            }
            GenerationMode::TimeSliced => {
                self.time_slice_budget.record_frame_delta(delta_seconds);

                let current = self
                    .time_sliced
                    .as_ref()
                    .map_or(Duration::ZERO, |time_sliced| time_sliced.elapsed);
                let budget = self.time_slice_budget.time_slice(
                    &self.settings.time_slice_settings,
                    self.pending.len(),
                    usize::from(self.time_sliced.is_some()),
                    current,
                );

                self.step_time_sliced(provider, budget, &mut changed);
            }
        }

        changed.sort();
        changed.dedup();

        changed
    }

    /// Blocks until every dirty tile has been generated & applied.
    pub fn ensure_build_completion(&mut self, provider: &impl GeometryProvider) -> Vec<TileIndex> {
        let mut changed = Vec::new();

        while self.is_build_in_progress() {
            match self.settings.generation_mode {
                GenerationMode::Async => {
                    self.spawn_tasks(provider);

                    for running in std::mem::take(&mut self.running) {
                        let result = block_on(running.task);
                        self.handle_result(running.coord, running.discard, result, &mut changed);
                    }
                }
                GenerationMode::TimeSliced => {
                    self.step_time_sliced(provider, Duration::MAX, &mut changed);
                }
            }
        }

        changed.sort();
        changed.dedup();

        changed
    }

    /// Takes the pending element closest to the seed locations that isn't already generating.
    fn pop_next_pending(&mut self) -> Option<PendingTileElement> {
        let coord = self
            .pending
            .values()
            .filter(|element| {
                !self.running.iter().any(|running| running.coord == element.coord)
                    && self
                        .time_sliced
                        .as_ref()
                        .is_none_or(|time_sliced| time_sliced.generator.coord() != element.coord)
            })
            .min_by(|a, b| {
                a.seed_distance
                    .total_cmp(&b.seed_distance)
                    .then_with(|| (a.coord.y, a.coord.x).cmp(&(b.coord.y, b.coord.x)))
            })?
            .coord;

        self.pending.remove(&coord)
    }

    fn spawn_tasks(&mut self, provider: &impl GeometryProvider) {
        let task_pool = AsyncComputeTaskPool::get_or_init(TaskPool::default);

        let max_tasks = self
            .settings
            .max_tile_generation_tasks
            .map_or(usize::MAX, |max| usize::from(max.get()));

        while self.running.len() < max_tasks {
            let Some(element) = self.pop_next_pending() else {
                break;
            };

            let generator = TileGenerator::new(
                &element,
                self.settings.clone(),
                provider,
                &self.layer_cache,
            );

            let task = task_pool.spawn(async move { generator.run_to_completion() });
            self.running.push(RunningTileElement {
                coord: element.coord,
                task,
                discard: false,
            });
        }
    }

    fn poll_running_tasks(&mut self, changed: &mut Vec<TileIndex>) {
        let mut i = 0;
        while i < self.running.len() {
            if !self.running[i].task.is_finished() {
                i += 1;
                continue;
            }

            let mut running = self.running.swap_remove(i);
            if let Some(result) = block_on(poll_once(&mut running.task)) {
                self.handle_result(running.coord, running.discard, result, changed);
            }
        }
    }

    fn step_time_sliced(
        &mut self,
        provider: &impl GeometryProvider,
        budget: Duration,
        changed: &mut Vec<TileIndex>,
    ) {
        let start = Instant::now();

        loop {
            if self.time_sliced.is_none() {
                let Some(element) = self.pop_next_pending() else {
                    return;
                };

                self.time_sliced = Some(TimeSlicedTile {
                    generator: TileGenerator::new(
                        &element,
                        self.settings.clone(),
                        provider,
                        &self.layer_cache,
                    ),
                    elapsed: Duration::ZERO,
                });
            }

            let remaining = budget.saturating_sub(start.elapsed());
            let Some(time_sliced) = self.time_sliced.as_mut() else {
                return;
            };

            let step_start = Instant::now();
            let step = time_sliced.generator.step(remaining);
            time_sliced.elapsed += step_start.elapsed();

            match step {
                GeneratorStep::Continue => return,
                GeneratorStep::Done(result) => {
                    if let Some(time_sliced) = self.time_sliced.take() {
                        self.time_slice_budget
                            .record_tile_regen_duration(time_sliced.elapsed);
                    }
                    self.handle_result(result.coord, false, Ok(result), changed);
                }
                GeneratorStep::Failed(error) => {
                    if let Some(time_sliced) = self.time_sliced.take() {
                        self.handle_result(time_sliced.generator.coord(), false, Err(error), changed);
                    }
                }
            }

            if start.elapsed() >= budget {
                return;
            }
        }
    }

    fn handle_result(
        &mut self,
        coord: UVec2,
        discard: bool,
        result: Result<TileGenerationResult, TileBuildError>,
        changed: &mut Vec<TileIndex>,
    ) {
        if discard {
            debug!("Discarded generation result for removed tile {}.", coord);
            return;
        }

        let result = result.and_then(|result| self.apply_result(result, changed));

        match result {
            Ok(()) => {}
            Err(TileBuildError::Cancelled) => {
                debug!("Generation of tile {} was cancelled.", coord);
            }
            Err(error) => {
                warn!("Failed to generate tile {}, keeping previous data: {}", coord, error);
            }
        }
    }

    /// Replaces the tiles at the result's coordinate. Nothing changes if the new tiles don't fit in the grid.
    fn apply_result(
        &mut self,
        result: TileGenerationResult,
        changed: &mut Vec<TileIndex>,
    ) -> Result<(), TileBuildError> {
        #[cfg(feature = "trace")]
        let _span = info_span!("Apply tile").entered();

        let coord = result.coord;

        let tile_data = result
            .tile_data
            .iter()
            .filter_map(|bytes| match TileData::from_bytes(bytes) {
                Ok(tile_data) => Some(tile_data),
                Err(error) => {
                    error!("Generated data for tile {} is invalid: {}", coord, error);
                    None
                }
            })
            .collect::<Vec<_>>();

        let replaced = match result.cache_layers {
            Some(_) => self.tiles.layers_at(coord).count(),
            None => self
                .tiles
                .layers_at(coord)
                .filter(|index| result.rebuilt_layers.contains(&index.layer))
                .count(),
        };
        if tile_data.len() > self.tiles.free_tile_count() + replaced {
            return Err(LimitExceeded::TilePool.into());
        }

        match result.cache_layers {
            Some(cache_layers) => {
                changed.extend(self.tiles.layers_at(coord).collect::<Vec<_>>());
                self.tiles.remove_tiles_at(coord);

                if cache_layers.is_empty() {
                    self.layer_cache.remove_tile(coord);
                } else {
                    self.layer_cache.insert_tile(coord, cache_layers);
                }
            }
            None => {
                for layer in result.rebuilt_layers.iter() {
                    let index = TileIndex::new(coord, *layer);
                    if self.tiles.remove_tile(index).is_some() {
                        changed.push(index);
                    }
                }
            }
        }

        let layer_count = tile_data.len();
        for tile_data in tile_data {
            let index = tile_data.index();
            match self.tiles.add_tile(tile_data, &self.settings) {
                Ok(_) => changed.push(index),
                Err(error) => error!("Failed to add tile {}: {}", coord, error),
            }
        }

        debug!("Applied tile {} with {} layers.", coord, layer_count);

        Ok(())
    }
}

fn seed_distance(settings: &NavMeshSettings, seed_locations: &[Vec3], coord: UVec2) -> f32 {
    let tile_bounds = settings.get_tile_bounds(coord);
    let center: Vec2 = tile_bounds.center();

    seed_locations
        .iter()
        .map(|seed| seed.xz().distance(center))
        .fold(None, |closest: Option<f32>, distance| {
            Some(closest.map_or(distance, |closest| closest.min(distance)))
        })
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use super::*;
    use crate::geometry::{GeometryIndex, ElementId, RawGeometryElement};

    fn settings(mode: GenerationMode) -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 100.0, -10.0)
            .with_tile_width(NonZeroU16::new(32).unwrap())
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

    fn unit_box(center: Vec3) -> Aabb3d {
        Aabb3d {
            min: Vec3A::from(center) - Vec3A::splat(0.5),
            max: Vec3A::from(center) + Vec3A::splat(0.5),
        }
    }

    #[test]
    fn overlapping_areas_share_one_element() {
        let mut generator = NavMeshGenerator::new(settings(GenerationMode::Async));
        let tile_center = generator.settings().get_tile_bounds(UVec2::new(12, 12)).center();
        let center = Vec3::new(tile_center.x, 0.0, tile_center.y);

        generator.mark_dirty(unit_box(center), DirtyFlags::DYNAMIC_MODIFIER);
        generator.mark_dirty(unit_box(center + Vec3::X * 0.25), DirtyFlags::DYNAMIC_MODIFIER);

        assert_eq!(generator.pending.len(), 1);
        let element = &generator.pending[&UVec2::new(12, 12)];
        assert_eq!(element.dirty_areas.len(), 2);
        assert!(!element.rebuild_geometry);

        generator.mark_dirty(unit_box(center), DirtyFlags::GEOMETRY);
        let element = &generator.pending[&UVec2::new(12, 12)];
        assert!(element.rebuild_geometry);
        assert!(element.dirty_areas.is_empty());
    }

    #[test]
    fn time_slice_is_clamped() {
        let settings = TimeSliceSettings::default();
        let mut budget = TimeSliceBudget::new(&settings);

        assert_eq!(
            budget.time_slice(&settings, 0, 0, Duration::ZERO),
            settings.min_time_slice
        );
        assert_eq!(
            budget.time_slice(&settings, 10_000, 0, Duration::ZERO),
            settings.max_time_slice
        );

        // 2 frames to drain 2 tiles of 2.5 ms.
        budget.record_frame_delta(0.25);
        let slice = budget.time_slice(&settings, 2, 0, Duration::ZERO);
        assert!((slice.as_secs_f32() - 0.0025).abs() < 1e-5, "{slice:?}");
    }

    #[test]
    fn stepping_matches_running_to_completion() {
        let settings = Arc::new(settings(GenerationMode::TimeSliced));
        let mut index = GeometryIndex::default();
        index.insert_geometry(ElementId(0), plane(20.0));

        let coord = settings.get_tile_containing_position(Vec2::ZERO);
        let mut element = PendingTileElement::new(coord, 0.0);
        element.merge(DirtyArea::new(unit_box(Vec3::ZERO), DirtyFlags::GEOMETRY));
        let cache = TileLayerCache::default();

        let complete = TileGenerator::new(&element, settings.clone(), &index, &cache)
            .run_to_completion()
            .unwrap();

        let mut generator = TileGenerator::new(&element, settings, &index, &cache);
        let mut steps = 0;
        let stepped = loop {
            steps += 1;
            match generator.step(Duration::ZERO) {
                GeneratorStep::Continue => {}
                GeneratorStep::Done(result) => break result,
                GeneratorStep::Failed(error) => panic!("{error}"),
            }
        };

        assert!(steps > 10);
        assert!(!complete.is_empty());
        assert_eq!(complete.tile_data, stepped.tile_data);
        assert_eq!(complete.rebuilt_layers, stepped.rebuilt_layers);
    }

    #[test]
    fn cancelled_generator_fails() {
        let settings = Arc::new(settings(GenerationMode::TimeSliced));
        let mut index = GeometryIndex::default();
        index.insert_geometry(ElementId(0), plane(20.0));

        let mut element = PendingTileElement::new(UVec2::new(3, 3), 0.0);
        element.merge(DirtyArea::new(unit_box(Vec3::ZERO), DirtyFlags::GEOMETRY));

        let mut generator =
            TileGenerator::new(&element, settings, &index, &TileLayerCache::default());
        generator.cancel();

        assert!(matches!(
            generator.step(Duration::MAX),
            GeneratorStep::Failed(TileBuildError::Cancelled)
        ));
    }

    #[test]
    fn seeds_order_pending_tiles() {
        let mut generator = NavMeshGenerator::new(settings(GenerationMode::TimeSliced));
        let near = generator.settings().get_tile_bounds(UVec2::new(2, 2)).center();
        let far = generator.settings().get_tile_bounds(UVec2::new(10, 10)).center();

        generator.re_add_tiles(&[UVec2::new(10, 10), UVec2::new(2, 2)]);
        generator.set_seed_locations(vec![Vec3::new(far.x, 0.0, far.y)]);
        assert_eq!(generator.pop_next_pending().unwrap().coord, UVec2::new(10, 10));

        generator.re_add_tiles(&[UVec2::new(10, 10)]);
        generator.set_seed_locations(vec![Vec3::new(near.x, 0.0, near.y)]);
        assert_eq!(generator.pop_next_pending().unwrap().coord, UVec2::new(2, 2));
    }
}
