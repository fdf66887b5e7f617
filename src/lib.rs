//! Tiled **Runtime** Nav-mesh Generation for 3D worlds in [Bevy].
//!
//! World geometry is voxelized per tile into height-banded layers which are compressed into a [`layers::TileLayerCache`]. Nav-mesh tiles are then built from those layers into [`tiles::NavMeshTiles`].
//! When only area modifiers or off-mesh links change, tiles are rebuilt from the cached layers without touching the geometry again.
//!
//! Tiles are generated incrementally by [`generator::NavMeshGenerator`], either **asynchronously** on the [`AsyncComputeTaskPool`](bevy::tasks::AsyncComputeTaskPool) or **time-sliced** on the main thread.
//!
//! ## Quick-start:
//! **Nav-mesh generation with the plugin:**
//! 1. Implement the `OxidizedCollider` trait for your collider component that wraps a `parry3d::shape::SharedShape`.
//! 2. Add ``TiledNavMeshPlugin`` as a plugin. (eg. `TiledNavMeshPlugin::<MyCollider>::new(NavMeshSettings::from_agent_and_bounds(...))`)
//! 3. Attach a ``NavMeshAffector`` component and your collider to any entity you want to affect the nav-mesh.
//! 4. Optionally spawn ``NavMeshAreaModifier`` and ``NavMeshOffMeshLink`` entities to mark areas & connect disjoint parts of the nav-mesh.
//!
//! *At this point tiles will be automatically generated whenever the collider or ``GlobalTransform`` of any entity with a ``NavMeshAffector`` is changed.*
//!
//! **Without the plugin:**
//! 1. Implement [`geometry::GeometryProvider`] or fill a [`geometry::GeometryIndex`] with [`geometry::RawGeometryElement`]s.
//! 2. Create a [`generator::NavMeshGenerator`] & mark the bounds of your geometry dirty with [`generator::NavMeshGenerator::mark_dirty`].
//! 3. Call [`generator::NavMeshGenerator::tick`] every frame, or [`generator::NavMeshGenerator::ensure_build_completion`] to block until it's done.
//!
//! ## FAQ
//!
//! > Why aren't my Parry3d colliders scaled properly?
//!
//! The collider's shape is converted in local space & then transformed by the entity's ``GlobalTransform``, including its scale.
//!
//! > Can I save the generated data?
//!
//! Both [`tiles::TileData`] & [`layers::CompressedLayer`] can be written with ``to_bytes`` & read back with ``from_bytes``. Restored layers can be handed to [`generator::NavMeshGenerator::insert_cached_layers`].
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::collections::BTreeMap;
use std::num::{NonZeroU16, NonZeroU8};
use std::time::Duration;

use bevy::{
    math::{Rect, UVec2, Vec2},
    prelude::{Reflect, Resource},
};

mod areas;
mod contour;
pub mod detail_mesh;
pub mod error;
pub mod generator;
pub mod geometry;
mod heightfields;
pub mod layers;
mod math;
pub mod mesher;
mod regions;
pub mod tiles;

cfg_if::cfg_if! {
    if #[cfg(feature = "parry3d")] {
        pub mod colliders;
        pub mod conversion;
        mod plugin;

        pub use plugin::*;
    }
}

/// Area type of a span or polygon. ``None`` in place of an area means unwalkable.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Reflect)]
pub struct Area(pub u16);

/// Area given to spans without enough clearance when [`NavMeshSettings::mark_low_height_areas`] is set.
pub const LOW_HEIGHT_AREA: Area = Area(u16::MAX - 1);

/// Polygon flags used for areas missing from [`NavMeshSettings::area_flags`].
pub const DEFAULT_POLYGON_FLAGS: u16 = 1;

/// How walkable spans are partitioned into regions before contours are traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionPartitioning {
    /// Flood fills from the distance field. Produces the nicest regions but is the slowest.
    Watershed,
    /// Sweeps rows into regions. Fast, but may produce long thin polygons.
    Monotone,
    /// Monotone partitioning inside chunks of ``chunk_size`` cells.
    Chunky { chunk_size: NonZeroU16 },
}

/// Settings for generating the height detail of polygons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailMeshSettings {
    /// Distance between height samples in cells. ``0`` skips sampling the interior of polygons.
    pub sample_distance: u16,
    /// Maximum distance in cell_height(s) the detail mesh may deviate from the heightfield.
    pub max_height_error: NonZeroU16,
    /// Step between cells when searching for heights.
    pub sample_step: NonZeroU8,
}

impl Default for DetailMeshSettings {
    fn default() -> Self {
        Self {
            sample_distance: 3,
            max_height_error: NonZeroU16::MIN,
            sample_step: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
        }
    }
}

/// Where tiles are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationMode {
    /// Tiles are generated in tasks on the [`AsyncComputeTaskPool`](bevy::tasks::AsyncComputeTaskPool).
    #[default]
    Async,
    /// Tiles are generated on the thread calling [`generator::NavMeshGenerator::tick`], for a limited time each tick.
    TimeSliced,
}

/// Settings for [`GenerationMode::TimeSliced`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSliceSettings {
    pub min_time_slice: Duration,
    pub max_time_slice: Duration,
    /// Aim to finish all dirty tiles within this time.
    pub max_desired_tile_regen_duration: Duration,
    /// Frame time assumed before any frames have been measured.
    pub default_frame_delta: Duration,
    /// Time per tile assumed before any tiles have been generated.
    pub default_tile_regen_duration: Duration,
    /// Number of frames averaged.
    pub frame_delta_window: usize,
    /// Number of tiles averaged.
    pub tile_regen_window: usize,
}

impl Default for TimeSliceSettings {
    fn default() -> Self {
        Self {
            min_time_slice: Duration::from_micros(750),
            max_time_slice: Duration::from_millis(4),
            max_desired_tile_regen_duration: Duration::from_millis(700),
            default_frame_delta: Duration::from_secs_f32(1.0 / 30.0),
            default_tile_regen_duration: Duration::from_micros(2500),
            frame_delta_window: 30,
            tile_regen_window: 10,
        }
    }
}

/// Settings for nav-mesh generation.
#[derive(Resource, Clone)]
pub struct NavMeshSettings {
    /// The horizontal resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of character radius.
    ///
    /// Smaller values will increase tile generation times with diminishing returns in nav-mesh detail.
    pub cell_width: f32,
    /// The vertical resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of cell_width.
    ///
    /// Smaller values will increase tile generation times with diminishing returns in nav-mesh detail.
    pub cell_height: f32,

    /// Length of a tile's side in cells. Resulting size in world units is ``tile_width * cell_width``.
    ///
    /// Higher means more to update each time something within the tile changes, smaller means you will have more overhead from connecting the edges to other tiles & generating the tile itself.
    pub tile_width: NonZeroU16,

    /// Extents of the world as measured from the world origin (0.0, 0.0) on the XZ-plane.
    ///
    /// **Suggested value**: As small as possible whilst still keeping the entire world within it.
    ///
    /// This exists because figuring out which tile we are in around the world origin would not work without it.
    pub world_half_extents: f32,
    /// Bottom extents of the world on the Y-axis. The top extents is capped by ``world_bottom_bound + cell_height * u16::MAX``.
    ///
    /// **Suggested value**: Minium Y position of anything in the world that should be covered by the nav mesh.
    pub world_bottom_bound: f32,

    /// Maximum incline/slope traversable when navigating in radians.
    pub max_traversable_slope_radians: f32,
    /// Minimum open height for an area to be considered walkable in cell_height(s).
    ///
    /// **Suggested value**: The height of character / ``cell_height``, rounded up.
    pub walkable_height: u16,
    /// This will "pull-back" the nav-mesh from edges, meaning anywhere on the nav-mesh will be walkable for a character with a radius of ``walkable_radius * cell_width``.
    ///
    /// **Suggested value**: ``ceil(character_radius / cell_width)`` (2-3 if `cell_width` is 1/2 of ``character_radius``)
    pub walkable_radius: u16,
    /// Maximum height difference that is still considered traversable in cell_height(s). This smooths out stair steps and small ledges.
    pub step_height: u16,
    /// Keep spans without enough clearance as [`LOW_HEIGHT_AREA`] until area modifiers have been applied, instead of removing them.
    ///
    /// Lets modifiers that lower the agent height (eg. crouch volumes) open up low spaces.
    pub mark_low_height_areas: bool,

    /// Minimum size of a region in cells, anything smaller than this will be removed. This is used to filter out smaller disconnected island that may appear on surfaces like tables.
    pub min_region_area: u32,
    /// Maximum size of a region in cells we can merge other regions into.
    pub max_region_area_to_merge_into: u32,
    pub region_partitioning: RegionPartitioning,

    /// Maximum length of an edge before it's split.
    ///
    /// **Suggested value**: Start high and reduce if there are issues.
    pub max_edge_length: u16,
    /// Maximum difference allowed for simplified contour generation on the XZ-plane in cell_width(s).
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_contour_simplification_error: f32,
    /// Maximum number of vertices in a polygon. Clamped to `[3, 6]`.
    pub max_vertices_per_polygon: u8,
    /// Settings for the detail mesh. ``None`` skips building it.
    pub detail_mesh_generation: Option<DetailMeshSettings>,

    /// Polygon flags of each area. Areas not in the map get [`DEFAULT_POLYGON_FLAGS`].
    pub area_flags: BTreeMap<Area, u16>,

    pub generation_mode: GenerationMode,
    pub time_slice_settings: TimeSliceSettings,
    /// Max tiles to generate in parallel at once with [`GenerationMode::Async`]. A value of ``None`` will result in no limit.
    ///
    /// Adjust this to control memory & CPU usage. More tiles generating at once will have a higher memory footprint.
    pub max_tile_generation_tasks: Option<NonZeroU16>,
    /// Maximum number of tile layers kept in the nav-mesh. Clamped to [`tiles::MAX_TILE_SLOTS`].
    ///
    /// A rebuild that would need more fails & the tile keeps its previous data.
    pub max_tiles: u32,
}

impl NavMeshSettings {
    /// Helper function for creating nav-mesh settings with reasonable defaults from the size of your navigation agent and bounds of your world.
    #[inline]
    pub fn from_agent_and_bounds(
        agent_radius: f32,
        agent_height: f32,
        world_half_extents: f32,
        world_bottom_bound: f32,
    ) -> Self {
        let cell_width = agent_radius / 2.0;
        let cell_height = agent_radius / 4.0;

        let walkable_height = (agent_height / cell_height).ceil() as u16;
        let walkable_radius = (agent_radius / cell_width).ceil() as u16;

        Self {
            cell_width,
            cell_height,
            tile_width: NonZeroU16::new(120).unwrap_or(NonZeroU16::MAX),
            world_half_extents: world_half_extents.abs(),
            world_bottom_bound,
            max_traversable_slope_radians: 50.0_f32.to_radians(),
            walkable_height,
            walkable_radius,
            step_height: 3,
            mark_low_height_areas: false,
            min_region_area: 100,
            max_region_area_to_merge_into: 500,
            region_partitioning: RegionPartitioning::Watershed,
            max_edge_length: 80,
            max_contour_simplification_error: 1.1,
            max_vertices_per_polygon: 6,
            detail_mesh_generation: Some(DetailMeshSettings::default()),
            area_flags: BTreeMap::new(),
            generation_mode: GenerationMode::Async,
            time_slice_settings: TimeSliceSettings::default(),
            max_tile_generation_tasks: NonZeroU16::new(8),
            max_tiles: tiles::MAX_TILE_SLOTS,
        }
    }
    /// Setter for [`NavMeshSettings::walkable_radius`]
    pub fn with_walkable_radius(mut self, walkable_radius: u16) -> Self {
        self.walkable_radius = walkable_radius;

        self
    }
    /// Setter for [`NavMeshSettings::tile_width`]
    pub fn with_tile_width(mut self, tile_width: NonZeroU16) -> Self {
        self.tile_width = tile_width;

        self
    }
    /// Setter for [`NavMeshSettings::max_traversable_slope_radians`]
    pub fn with_traversible_slope(mut self, traversible_slope: f32) -> Self {
        self.max_traversable_slope_radians = traversible_slope;

        self
    }
    /// Setter for [`NavMeshSettings::max_tile_generation_tasks`]
    pub fn with_max_tile_generation_tasks(
        mut self,
        max_tile_generation_tasks: Option<NonZeroU16>,
    ) -> Self {
        self.max_tile_generation_tasks = max_tile_generation_tasks;

        self
    }
    /// Setter for [`NavMeshSettings::max_tiles`]
    pub fn with_max_tiles(mut self, max_tiles: u32) -> Self {
        self.max_tiles = max_tiles;

        self
    }
    /// Setter for [`NavMeshSettings::step_height`]
    pub fn with_step_height(mut self, step_height: u16) -> Self {
        self.step_height = step_height;

        self
    }
    /// Setter for [`NavMeshSettings::min_region_area`] & [`NavMeshSettings::max_region_area_to_merge_into`]
    pub fn with_region_area(
        mut self,
        min_region_area: u32,
        max_region_area_to_merge_into: u32,
    ) -> Self {
        self.min_region_area = min_region_area;
        self.max_region_area_to_merge_into = max_region_area_to_merge_into;

        self
    }
    /// Setter for [`NavMeshSettings::region_partitioning`]
    pub fn with_region_partitioning(mut self, region_partitioning: RegionPartitioning) -> Self {
        self.region_partitioning = region_partitioning;

        self
    }
    /// Setter for [`NavMeshSettings::max_contour_simplification_error`]
    pub fn with_max_contour_simplification_error(
        mut self,
        max_contour_simplification_error: f32,
    ) -> Self {
        self.max_contour_simplification_error = max_contour_simplification_error;

        self
    }
    /// Setter for [`NavMeshSettings::max_edge_length`]
    pub fn with_max_edge_length(mut self, max_edge_length: u16) -> Self {
        self.max_edge_length = max_edge_length;

        self
    }
    /// Setter for [`NavMeshSettings::max_vertices_per_polygon`]
    pub fn with_max_vertices_per_polygon(mut self, max_vertices_per_polygon: u8) -> Self {
        self.max_vertices_per_polygon = max_vertices_per_polygon;

        self
    }
    /// Setter for [`NavMeshSettings::mark_low_height_areas`]
    pub fn with_low_height_area_marking(mut self, mark_low_height_areas: bool) -> Self {
        self.mark_low_height_areas = mark_low_height_areas;

        self
    }
    /// Setter for [`NavMeshSettings::detail_mesh_generation`]
    pub fn with_detail_mesh_generation(
        mut self,
        detail_mesh_generation: Option<DetailMeshSettings>,
    ) -> Self {
        self.detail_mesh_generation = detail_mesh_generation;

        self
    }
    /// Setter for [`NavMeshSettings::area_flags`]
    pub fn with_area_flags(mut self, area: Area, flags: u16) -> Self {
        self.area_flags.insert(area, flags);

        self
    }
    /// Setter for [`NavMeshSettings::generation_mode`]
    pub fn with_generation_mode(mut self, generation_mode: GenerationMode) -> Self {
        self.generation_mode = generation_mode;

        self
    }
    /// Setter for [`NavMeshSettings::time_slice_settings`]
    pub fn with_time_slice_settings(mut self, time_slice_settings: TimeSliceSettings) -> Self {
        self.time_slice_settings = time_slice_settings;

        self
    }

    /// Returns the length of a tile's side in world units.
    #[inline]
    pub fn get_tile_size(&self) -> f32 {
        self.cell_width * f32::from(self.tile_width.get())
    }
    /// Width of the border around a tile in world units.
    #[inline]
    pub fn get_border_size(&self) -> f32 {
        self.get_border_side() as f32 * self.cell_width
    }
    /// Width of the border around a tile in cells. Geometry this close to the tile is voxelized with it so erosion & neighbouring tiles line up.
    #[inline]
    pub fn get_border_side(&self) -> usize {
        usize::from(self.walkable_radius) + 3
    }
    #[inline]
    pub fn get_tile_side_with_border(&self) -> usize {
        usize::from(self.tile_width.get()) + self.get_border_side() * 2
    }

    /// Number of tiles along each axis of the world.
    #[inline]
    pub fn get_tiles_per_axis(&self) -> u32 {
        ((self.world_half_extents * 2.0) / self.get_tile_size())
            .ceil()
            .max(1.0) as u32
    }

    /// Returns the tile coordinate that contains the supplied ``world_position``.
    #[inline]
    pub fn get_tile_containing_position(&self, world_position: Vec2) -> UVec2 {
        let offset_world = world_position + self.world_half_extents;

        (offset_world / self.get_tile_size()).as_uvec2()
    }

    /// Returns the minimum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_origin(&self, tile: UVec2) -> Vec2 {
        tile.as_vec2() * self.get_tile_size() - self.world_half_extents
    }

    /// Returns the origin of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_origin_with_border(&self, tile: UVec2) -> Vec2 {
        self.get_tile_origin(tile) - self.get_border_size()
    }

    /// Returns the bounds of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_bounds(&self, tile: UVec2) -> Rect {
        let min_bound = self.get_tile_origin(tile);

        Rect::from_corners(min_bound, min_bound + self.get_tile_size())
    }

    /// Returns the first & last tile (inclusive) touched by the XZ-plane bounds, clamped to the world.
    #[inline]
    pub fn get_tile_range(&self, min: Vec2, max: Vec2) -> (UVec2, UVec2) {
        let last_tile = UVec2::splat(self.get_tiles_per_axis() - 1);

        let min_tile = self.get_tile_containing_position(min).min(last_tile);
        let max_tile = self.get_tile_containing_position(max).min(last_tile);

        (min_tile, max_tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_settings() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0);

        assert_eq!(settings.cell_width, 0.25);
        assert_eq!(settings.cell_height, 0.125);
        assert_eq!(settings.walkable_radius, 2);
        assert_eq!(settings.walkable_height, 16);
        assert_eq!(settings.get_border_side(), 5);
        assert_eq!(settings.get_tile_side_with_border(), 130);
    }

    #[test]
    fn tile_range_is_clamped_to_world() {
        let settings = NavMeshSettings::from_agent_and_bounds(20.0, 20.0, 500.0, -10.0)
            .with_tile_width(NonZeroU16::new(64).unwrap());

        assert_eq!(settings.get_tiles_per_axis(), 2);
        assert_eq!(
            settings.get_tile_range(Vec2::splat(-1000.0), Vec2::splat(1000.0)),
            (UVec2::ZERO, UVec2::ONE)
        );
        assert_eq!(
            settings.get_tile_range(Vec2::new(-10.0, 200.0), Vec2::new(150.0, 200.0)),
            (UVec2::new(0, 1), UVec2::new(1, 1))
        );
    }

    #[test]
    fn tile_bounds_touch() {
        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0);

        let a = settings.get_tile_bounds(UVec2::new(3, 4));
        let b = settings.get_tile_bounds(UVec2::new(4, 4));
        assert_eq!(a.max.x, b.min.x);
        assert_eq!(
            settings.get_tile_containing_position(a.center()),
            UVec2::new(3, 4)
        );
    }
}
