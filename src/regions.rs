use std::collections::BTreeMap;

use crate::{
    error::{LimitExceeded, TileBuildError},
    heightfields::{calculate_distance_field, OpenSpan, OpenTile},
    math::get_neighbour_index,
    Area, NavMeshSettings, RegionPartitioning,
};

/// Flag for regions painted in the border of a tile. These are never turned into contours.
pub(crate) const BORDER_REGION: u16 = 0x8000;

#[derive(Default, Clone, Copy)]
struct LevelStackEntry {
    cell_index: u32,
    span_index: u32,
    index: i32,
}

const EXPAND_ITERS: u16 = 8;
const LOG_NB_STACKS: i32 = 3;
const NB_STACKS: i32 = 1 << LOG_NB_STACKS; // 8.

/// Partitions the walkable spans of ``open_tile`` into regions using the configured [`RegionPartitioning`].
pub(crate) fn build_regions(
    open_tile: &mut OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<(), TileBuildError> {
    let mut regions = vec![0; open_tile.span_count];
    let border = nav_mesh_settings.get_border_side();

    let mut region_id = paint_border_regions(open_tile, border, &mut regions);

    match nav_mesh_settings.region_partitioning {
        RegionPartitioning::Watershed => {
            calculate_distance_field(open_tile);

            build_regions_watershed(open_tile, &mut regions, &mut region_id)?;
        }
        RegionPartitioning::Monotone => {
            region_id = sweep_regions(open_tile, border, None, true, &mut regions, region_id)?;
        }
        RegionPartitioning::Chunky { chunk_size } => {
            region_id = sweep_regions(
                open_tile,
                border,
                Some(usize::from(chunk_size.get())),
                true,
                &mut regions,
                region_id,
            )?;
        }
    }

    // Merge regions and filter out small ones.
    merge_regions(
        nav_mesh_settings,
        open_tile.tile_side,
        &mut regions,
        &mut region_id,
        open_tile,
    );

    // Write results into spans.
    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.region = regions[span.tile_index];
        }
    }

    open_tile.max_regions = region_id;

    Ok(())
}

/// Paints the four border strips with border regions. Returns the next free region id.
fn paint_border_regions(open_tile: &OpenTile, border: usize, regions: &mut [u16]) -> u16 {
    let tile_side = open_tile.tile_side;
    let border = border.min(tile_side);
    let mut region_id = 1;

    if border == 0 {
        return region_id;
    }

    for (min_x, max_x, min_z, max_z) in [
        (0, border, 0, tile_side),
        (tile_side - border, tile_side, 0, tile_side),
        (0, tile_side, 0, border),
        (0, tile_side, tile_side - border, tile_side),
    ] {
        for z in min_z..max_z {
            for x in min_x..max_x {
                for span in open_tile.cells[x + z * tile_side].spans.iter() {
                    if open_tile.areas[span.tile_index].is_some() {
                        regions[span.tile_index] = region_id | BORDER_REGION;
                    }
                }
            }
        }

        region_id += 1;
    }

    region_id
}

fn build_regions_watershed(
    open_tile: &OpenTile,
    regions: &mut [u16],
    region_id: &mut u16,
) -> Result<(), TileBuildError> {
    let tile_side = open_tile.tile_side;
    let mut distances = vec![0; open_tile.span_count];
    let mut dirty_entries = Vec::with_capacity(512);

    let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS as usize] = Default::default();
    for stack in level_stacks.iter_mut() {
        stack.reserve(256);
    }
    let mut stack = Vec::with_capacity(256);

    let mut level = (open_tile.max_distance + 1) & !1u16; // Rounded.

    let mut stack_id = -1;
    while level > 0 {
        level = level.saturating_sub(2);
        stack_id = (stack_id + 1) & (NB_STACKS - 1);

        if stack_id == 0 {
            // Sort cells by level.
            sort_cells_by_level(level, open_tile, &mut level_stacks, NB_STACKS, regions);
        } else {
            // append stacks
            let prev_stack = (stack_id - 1) as usize;
            let next_stack = stack_id as usize;
            for i in 0..level_stacks[prev_stack].len() {
                let index = level_stacks[prev_stack][i].index;
                if index < 0 || regions[index as usize] != 0 {
                    continue;
                }

                level_stacks[next_stack].push(level_stacks[prev_stack][i]);
            }
        }

        // expand regions.
        expand_regions(
            tile_side,
            EXPAND_ITERS,
            open_tile,
            regions,
            &mut distances,
            &mut level_stacks[stack_id as usize],
            &mut dirty_entries,
        );

        // Mark new regions with IDs.
        for entry in level_stacks[stack_id as usize].iter() {
            if entry.index >= 0
                && regions[entry.index as usize] == 0
                && flood_region(
                    tile_side,
                    *entry,
                    level,
                    *region_id,
                    open_tile,
                    regions,
                    &mut distances,
                    &mut stack,
                )
            {
                *region_id += 1;

                if *region_id >= BORDER_REGION {
                    return Err(LimitExceeded::Regions.into());
                }
            }
        }
    }

    // Expand regions until no empty connected cells are found.
    expand_regions_until_end(
        tile_side,
        open_tile,
        regions,
        &mut distances,
        &mut stack,
        &mut dirty_entries,
    );

    Ok(())
}

#[derive(Default, Clone, Copy)]
struct SweepSpan {
    id: u16,
    samples: u16,
    neighbour: u16,
}

const NULL_NEIGHBOUR: u16 = u16::MAX;

/// Partitions the spans inside ``border`` into monotone regions, sweeping one row at a time.
///
/// With ``chunk_size`` regions never cross the edges of ``chunk_size`` squares. Without ``respect_areas`` spans of different areas share regions.
///
/// Returns the next free region id.
pub(crate) fn sweep_regions(
    open_tile: &OpenTile,
    border: usize,
    chunk_size: Option<usize>,
    respect_areas: bool,
    regions: &mut [u16],
    mut next_id: u16,
) -> Result<u16, TileBuildError> {
    let tile_side = open_tile.tile_side;
    if tile_side <= border * 2 {
        return Ok(next_id);
    }

    let mut sweeps: Vec<SweepSpan> = Vec::with_capacity(tile_side + 1);
    let mut previous_counts: Vec<u16> = Vec::new();

    let same_area = |a: Option<Area>, b: Option<Area>| !respect_areas || a == b;
    let on_chunk_edge =
        |coord: usize| chunk_size.is_some_and(|chunk_size| (coord - border) % chunk_size == 0);

    for z in border..tile_side - border {
        previous_counts.clear();
        previous_counts.resize(usize::from(next_id) + 1, 0);
        sweeps.clear();
        sweeps.push(SweepSpan::default());

        let mut row_id: u16 = 1;

        for x in border..tile_side - border {
            let cell_index = x + z * tile_side;

            for span in open_tile.cells[cell_index].spans.iter() {
                let area = open_tile.areas[span.tile_index];
                if area.is_none() || regions[span.tile_index] & BORDER_REGION != 0 {
                    continue;
                }

                // (-1, 0)
                let mut previous_id = 0;
                if !on_chunk_edge(x) {
                    if let Some(index) = span.neighbours[0] {
                        let other_span = &open_tile.cells
                            [get_neighbour_index(tile_side, cell_index, 0)]
                        .spans[index as usize];
                        let other_region = regions[other_span.tile_index];

                        if other_region & BORDER_REGION == 0
                            && same_area(open_tile.areas[other_span.tile_index], area)
                        {
                            previous_id = other_region;
                        }
                    }
                }

                if previous_id == 0 {
                    previous_id = row_id;
                    row_id += 1;
                    sweeps.push(SweepSpan::default());
                }

                // (0, -1)
                if !on_chunk_edge(z) {
                    if let Some(index) = span.neighbours[3] {
                        let other_span = &open_tile.cells
                            [get_neighbour_index(tile_side, cell_index, 3)]
                        .spans[index as usize];
                        let other_region = regions[other_span.tile_index];

                        if other_region != 0
                            && other_region & BORDER_REGION == 0
                            && same_area(open_tile.areas[other_span.tile_index], area)
                        {
                            let sweep = &mut sweeps[usize::from(previous_id)];
                            if sweep.neighbour == 0 || sweep.neighbour == other_region {
                                sweep.neighbour = other_region;
                                sweep.samples += 1;
                                previous_counts[usize::from(other_region)] += 1;
                            } else {
                                sweep.neighbour = NULL_NEIGHBOUR;
                            }
                        }
                    }
                }

                regions[span.tile_index] = previous_id;
            }
        }

        // Create unique IDs. A row segment continues the region above if it's the only one touching it.
        for sweep in sweeps.iter_mut().skip(1) {
            if sweep.neighbour != NULL_NEIGHBOUR
                && sweep.neighbour != 0
                && previous_counts[usize::from(sweep.neighbour)] == sweep.samples
            {
                sweep.id = sweep.neighbour;
            } else {
                if next_id >= BORDER_REGION - 1 {
                    return Err(LimitExceeded::Regions.into());
                }

                sweep.id = next_id;
                next_id += 1;
            }
        }

        // Remap row ids.
        for x in border..tile_side - border {
            for span in open_tile.cells[x + z * tile_side].spans.iter() {
                let region = regions[span.tile_index];
                if region > 0 && region < row_id {
                    regions[span.tile_index] = sweeps[usize::from(region)].id;
                }
            }
        }
    }

    Ok(next_id)
}

fn sort_cells_by_level(
    start_level: u16,
    open_tile: &OpenTile,
    stacks: &mut [Vec<LevelStackEntry>],
    num_stacks: i32, // always NB_STACKS
    regions: &[u16],
) {
    let start_level = (start_level >> 1) as i32;

    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for (c_i, cell) in open_tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if open_tile.areas[span.tile_index].is_none() || regions[span.tile_index] != 0 {
                continue;
            }

            let level = (open_tile.distances[span.tile_index] >> 1) as i32;
            let stack_id = (start_level - level).max(0);
            if stack_id >= num_stacks {
                continue;
            }

            stacks[stack_id as usize].push(LevelStackEntry {
                cell_index: c_i as u32,
                span_index: s_i as u32,
                index: span.tile_index as i32,
            });
        }
    }
}

struct DirtyEntry {
    index: i32,
    region: u16,
    distance: u16,
}

/// Finds the closest neighbouring region (of the same area) for ``entry``. Border regions never expand.
fn closest_neighbour_region(
    tile_side: usize,
    tile: &OpenTile,
    entry: &LevelStackEntry,
    regions: &[u16],
    distances: &[u16],
) -> (u16, u16) {
    let mut new_region = regions[entry.index as usize];
    let mut distance = u16::MAX;
    let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
    let area = tile.areas[span.tile_index];

    for dir in 0..4 {
        let Some(span_index) = span.neighbours[dir] else {
            continue;
        };

        let other_span = &tile.cells[get_neighbour_index(tile_side, entry.cell_index as usize, dir)]
            .spans[span_index as usize];
        let other_area = tile.areas[other_span.tile_index];
        if other_area != area {
            continue;
        }

        let other_region = regions[other_span.tile_index];
        let other_distance = distances[other_span.tile_index];
        if other_region > 0
            && other_region & BORDER_REGION == 0
            && other_distance.saturating_add(2) < distance
        {
            new_region = other_region;
            distance = other_distance + 2;
        }
    }

    (new_region, distance)
}

fn expand_regions(
    tile_side: usize,
    max_iterations: u16,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    level_stack: &mut [LevelStackEntry],
    dirty_entries: &mut Vec<DirtyEntry>,
) {
    for entry in level_stack
        .iter_mut()
        .filter(|entry| regions[entry.index as usize] != 0)
    {
        entry.index = -1;
    }

    let mut iter = 0;
    loop {
        let mut failed = 0;
        dirty_entries.clear();

        for entry in level_stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }

            let (new_region, distance) =
                closest_neighbour_region(tile_side, tile, entry, regions, distances);

            if new_region != 0 {
                dirty_entries.push(DirtyEntry {
                    index: entry.index,
                    region: new_region,
                    distance,
                });
                entry.index = -1;
            } else {
                failed += 1;
            }
        }

        // Copy entries that differ between src and st to keep them in sync.
        for entry in dirty_entries.iter() {
            regions[entry.index as usize] = entry.region;
            distances[entry.index as usize] = entry.distance;
        }

        if failed == level_stack.len() {
            break;
        }

        iter += 1;
        if iter >= max_iterations {
            break;
        }
    }
}

fn expand_regions_until_end(
    tile_side: usize,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    level_stack: &mut Vec<LevelStackEntry>,
    dirty_entries: &mut Vec<DirtyEntry>,
) {
    level_stack.clear();

    for (c_i, cell) in tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            if regions[span.tile_index] == 0 && tile.areas[span.tile_index].is_some() {
                level_stack.push(LevelStackEntry {
                    cell_index: c_i as u32,
                    span_index: s_i as u32,
                    index: span.tile_index as i32,
                });
            }
        }
    }

    let mut failed = 0;
    while failed < level_stack.len() {
        failed = 0;
        dirty_entries.clear();

        for entry in level_stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }

            let (new_region, distance) =
                closest_neighbour_region(tile_side, tile, entry, regions, distances);

            if new_region != 0 {
                dirty_entries.push(DirtyEntry {
                    index: entry.index,
                    region: new_region,
                    distance,
                });
                entry.index = -1;
            } else {
                failed += 1;
            }
        }

        for entry in dirty_entries.iter() {
            regions[entry.index as usize] = entry.region;
            distances[entry.index as usize] = entry.distance;
        }

        if failed == level_stack.len() {
            break;
        }
    }
}

struct Region {
    id: u16,
    span_count: usize,
    remap: bool,
    visited: bool,
    overlap: bool,
    connects_to_border: bool,
    floors: Vec<u16>,
    connections: Vec<u16>,
    area: Option<Area>,
}

/// Number of span edges shared between pairs of regions. Keyed by ``(min id, max id)``.
#[derive(Default)]
struct SharedBorders(BTreeMap<(u16, u16), usize>);

impl SharedBorders {
    fn key(a: u16, b: u16) -> (u16, u16) {
        (a.min(b), a.max(b))
    }

    fn add(&mut self, a: u16, b: u16) {
        *self.0.entry(Self::key(a, b)).or_default() += 1;
    }

    fn get(&self, a: u16, b: u16) -> usize {
        self.0.get(&Self::key(a, b)).copied().unwrap_or(0)
    }

    /// Moves all borders of ``old_id`` over to ``new_id``.
    fn rename(&mut self, old_id: u16, new_id: u16) {
        let moved = self
            .0
            .iter()
            .filter(|((a, b), _)| *a == old_id || *b == old_id)
            .map(|(key, length)| (*key, *length))
            .collect::<Vec<_>>();

        for ((a, b), length) in moved {
            self.0.remove(&(a, b));

            let other = if a == old_id { b } else { a };
            if other != new_id {
                *self.0.entry(Self::key(other, new_id)).or_default() += length;
            }
        }
    }
}

fn merge_regions(
    nav_mesh_settings: &NavMeshSettings,
    tile_side: usize,
    source_regions: &mut [u16],
    max_region_id: &mut u16,
    tile: &OpenTile,
) {
    let mut regions = Vec::with_capacity(*max_region_id as usize);
    for i in 0..*max_region_id {
        regions.push(Region {
            id: i,
            span_count: 0,
            remap: false,
            visited: false,
            overlap: false,
            connects_to_border: false,
            floors: Vec::with_capacity(4),
            connections: Vec::with_capacity(4),
            area: None,
        });
    }

    let mut shared_borders = SharedBorders::default();

    for (c_i, cell) in tile.cells.iter().enumerate() {
        for (s_i, span) in cell.spans.iter().enumerate() {
            let region_id = source_regions[span.tile_index];
            if region_id == 0 || region_id >= *max_region_id {
                continue;
            }

            // Count shared edges once per pair, from the positive directions.
            for dir in [1, 2] {
                if let Some(index) = span.neighbours[dir] {
                    let other_span = &tile.cells[get_neighbour_index(tile_side, c_i, dir)].spans
                        [index as usize];
                    let other_region = source_regions[other_span.tile_index];

                    if other_region != 0 && other_region < *max_region_id && other_region != region_id
                    {
                        shared_borders.add(region_id, other_region);
                    }
                }
            }

            let region = &mut regions[region_id as usize];
            region.span_count += 1;

            // Update floors
            for other_span in cell
                .spans
                .iter()
                .filter(|other| other.tile_index != span.tile_index)
            {
                let other_region_id = source_regions[other_span.tile_index];
                if other_region_id == 0 || other_region_id >= *max_region_id {
                    continue;
                }
                region.overlap |= other_region_id == region_id;

                add_unique_floor_region(region, other_region_id);
            }

            // Contour already exists.
            if !region.connections.is_empty() {
                continue;
            }

            region.area = tile.areas[span.tile_index];

            let dir = (0..4).find(|dir| is_solid_edge(tile_side, tile, span, c_i, *dir, source_regions));

            if let Some(dir) = dir {
                region.connects_to_border = walk_contour(
                    c_i,
                    s_i,
                    dir,
                    tile,
                    tile_side,
                    source_regions,
                    &mut region.connections,
                );
            }
        }
    }
    // Remove too small regions
    let mut stack = Vec::with_capacity(32);
    let mut trace = Vec::with_capacity(32);
    let mut connections: Vec<u16> = Vec::with_capacity(16);

    for i in 0..*max_region_id {
        {
            let region = &mut regions[i as usize];
            if region.id == 0 || region.span_count == 0 || region.visited {
                continue;
            }

            region.visited = true;
        }

        stack.clear();
        trace.clear();

        stack.push(i);

        let mut span_count = 0;
        let mut connects_to_border = false;

        while let Some(r_i) = stack.pop() {
            connections.clear();
            trace.push(r_i);

            {
                let region = &regions[r_i as usize];
                connections.extend(region.connections.iter());
                span_count += region.span_count;
                connects_to_border |= region.connects_to_border;
            }

            for connected_region in &connections {
                let connected_region = &mut regions[*connected_region as usize];

                if connected_region.visited || connected_region.id == 0 {
                    continue;
                }

                stack.push(connected_region.id);
                connected_region.visited = true;
            }
        }

        // Islands touching the border may continue in the neighbouring tile.
        if span_count < nav_mesh_settings.min_region_area as usize && !connects_to_border {
            for trace in &trace {
                let region = &mut regions[*trace as usize];
                region.span_count = 0;
                region.id = 0;
            }
        }
    }

    // Merge regions into neighbour.
    loop {
        let mut merged = false;

        for region in 0..regions.len() {
            let merge_id = {
                let region = &regions[region];
                if region.id == 0 || region.overlap || region.span_count == 0 {
                    continue;
                }

                if region.span_count > nav_mesh_settings.max_region_area_to_merge_into as usize
                    && region.connections.contains(&0)
                {
                    continue;
                }

                // Prefer the longest shared border, then the smallest region.
                let mut merge_id = None;
                let mut best = (0, usize::MAX);

                for connected in &region.connections {
                    let other_region = &regions[*connected as usize];
                    if other_region.id == 0 || other_region.overlap || other_region.id == region.id {
                        continue;
                    }

                    let shared = shared_borders.get(region.id, other_region.id);
                    let better = shared > best.0
                        || (shared == best.0 && other_region.span_count < best.1);

                    if better
                        && can_merge_with_region(region, other_region)
                        && can_merge_with_region(other_region, region)
                    {
                        best = (shared, other_region.span_count);
                        merge_id = Some(other_region.id);
                    }
                }

                merge_id
            };

            if let Some(merge_id) = merge_id {
                let old_id = regions[region].id;

                if merge_regions_i(&mut regions, merge_id as usize, region) {
                    // Fix up regions pointing to this region.
                    for region in regions.iter_mut() {
                        if region.id == 0 {
                            continue;
                        }

                        if region.id == old_id {
                            region.id = merge_id;
                        }

                        replace_neighbour(region, old_id, merge_id);
                    }
                    shared_borders.rename(old_id, merge_id);

                    merged = true;
                }
            }
        }

        if !merged {
            break;
        }
    }

    // Compress region ids.
    for region in regions.iter_mut() {
        region.remap = region.id != 0;
    }

    let mut region_id_gen = 0;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        region_id_gen += 1;

        let old_id = regions[i].id;
        let new_id = region_id_gen;

        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = new_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = region_id_gen + 1;

    // Remap regions.
    for cell in tile.cells.iter() {
        for span in cell.spans.iter() {
            let region_id = source_regions[span.tile_index];
            if region_id & BORDER_REGION != 0 {
                continue;
            }

            source_regions[span.tile_index] = regions
                .get(region_id as usize)
                .map_or(0, |region| region.id);
        }
    }
}

fn replace_neighbour(region: &mut Region, old_id: u16, new_id: u16) {
    let mut connection_changed = false;
    for connection in region.connections.iter_mut() {
        if *connection == old_id {
            *connection = new_id;
            connection_changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if connection_changed {
        remove_adjacent_connection_duplicates(region);
    }
}

/// Merges region ``b`` into region ``a``.
fn merge_regions_i(regions: &mut [Region], a: usize, b: usize) -> bool {
    let merged_connections = {
        let a = &regions[a];
        let b = &regions[b];

        let Some(insert_point_a) = a.connections.iter().position(|i| *i == b.id) else {
            return false;
        };
        let Some(insert_point_b) = b.connections.iter().position(|i| *i == a.id) else {
            return false;
        };

        let mut merged_connections =
            Vec::with_capacity(a.connections.len() + b.connections.len() - 2);
        for i in 0..a.connections.len() - 1 {
            merged_connections.push(a.connections[(insert_point_a + 1 + i) % a.connections.len()]);
        }
        for i in 0..b.connections.len() - 1 {
            merged_connections.push(b.connections[(insert_point_b + 1 + i) % b.connections.len()]);
        }

        merged_connections
    };

    let (b_span_count, b_connects_to_border, floors) = {
        let b = &mut regions[b];
        b.connections.clear();

        let count = b.span_count;
        b.span_count = 0;

        (count, b.connects_to_border, std::mem::take(&mut b.floors))
    };

    {
        let a = &mut regions[a];
        a.span_count += b_span_count;
        a.connects_to_border |= b_connects_to_border;
        a.connections = merged_connections;

        remove_adjacent_connection_duplicates(a);

        // add unique floors.
        for floor in floors {
            add_unique_floor_region(a, floor);
        }
    }

    true
}

fn remove_adjacent_connection_duplicates(region: &mut Region) {
    if region.connections.len() > 1 {
        let mut i = 0;
        while i < region.connections.len() && region.connections.len() > 1 {
            let next_index = (i + 1) % region.connections.len();
            let current = region.connections[i];
            let next = region.connections[next_index];

            if current == next {
                region.connections.remove(next_index);
            } else {
                i += 1;
            }
        }
    }
}

fn can_merge_with_region(a: &Region, b: &Region) -> bool {
    if a.area != b.area {
        return false;
    }

    let n = a
        .connections
        .iter()
        .filter(|region| **region == b.id)
        .count();
    if n > 1 {
        return false;
    }

    !a.floors.contains(&b.id)
}

/// Walks the edge of a region collecting the regions it borders. Border regions are recorded as ``0``.
///
/// Returns true if the region touches a border region.
fn walk_contour(
    mut cell_index: usize,
    mut span_index: usize,
    mut dir: usize,
    tile: &OpenTile,
    tile_side: usize,
    source_regions: &[u16],
    contour: &mut Vec<u16>,
) -> bool {
    let start_direction = dir;
    let start_cell = cell_index;
    let start_span = span_index;

    let mut touches_border = false;
    let mut neighbour_region = |cell_index: usize, span: &OpenSpan, dir: usize| {
        let Some(span_index) = span.neighbours[dir] else {
            return 0;
        };
        let other_span =
            &tile.cells[get_neighbour_index(tile_side, cell_index, dir)].spans[span_index as usize];

        let region = source_regions[other_span.tile_index];
        if region & BORDER_REGION != 0 {
            touches_border = true;
            0
        } else {
            region
        }
    };

    let span = &tile.cells[cell_index].spans[span_index];
    let mut current_region = neighbour_region(cell_index, span, dir);
    contour.push(current_region);

    loop {
        let span = &tile.cells[cell_index].spans[span_index];
        if is_solid_edge(tile_side, tile, span, cell_index, dir, source_regions) {
            let r = neighbour_region(cell_index, span, dir);
            if r != current_region {
                current_region = r;
                contour.push(r);
            }

            dir = (dir + 1) & 0x3; // Rotate clock-wise.
        } else {
            // Direction is connected.
            if let Some(index) = span.neighbours[dir] {
                span_index = index.into();
            } else {
                return touches_border;
            }

            cell_index = get_neighbour_index(tile_side, cell_index, dir);
            dir = (dir + 3) & 0x3; // Rotate COUNTER clock-wise.
        }

        if start_cell == cell_index && start_span == span_index && start_direction == dir {
            break;
        }
    }

    // Remove adjacent duplicates.
    if contour.len() > 1 {
        let mut i = 0;
        while i < contour.len() && contour.len() > 1 {
            let next_index = (i + 1) % contour.len();

            if contour[i] == contour[next_index] {
                contour.remove(next_index);
            } else {
                i += 1;
            }
        }
    }

    touches_border
}

fn is_solid_edge(
    tile_side: usize,
    tile: &OpenTile,
    span: &OpenSpan,
    c_i: usize,
    dir: usize,
    source_region: &[u16],
) -> bool {
    let mut region = 0;
    if let Some(span_index) = span.neighbours[dir] {
        let other_span =
            &tile.cells[get_neighbour_index(tile_side, c_i, dir)].spans[span_index as usize];

        region = source_region[other_span.tile_index];
    }

    region != source_region[span.tile_index]
}

fn add_unique_floor_region(region: &mut Region, region_id: u16) {
    if region.floors.contains(&region_id) {
        return;
    }

    region.floors.push(region_id);
}

#[allow(clippy::too_many_arguments)]
fn flood_region(
    tile_side: usize,
    entry: LevelStackEntry,
    level: u16,
    region_id: u16,
    tile: &OpenTile,
    regions: &mut [u16],
    distances: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    stack.clear();
    stack.push(entry);

    let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];
    let area = tile.areas[span.tile_index];

    regions[entry.index as usize] = region_id;
    distances[entry.index as usize] = 0;

    let lev = level.saturating_sub(2);
    let mut expanded_any = false;

    while let Some(entry) = stack.pop() {
        let span = &tile.cells[entry.cell_index as usize].spans[entry.span_index as usize];

        let mut has_adjecant_region = false;
        for dir in 0..4 {
            let Some(span_index) = span.neighbours[dir] else {
                continue;
            };

            let other_cell_index = get_neighbour_index(tile_side, entry.cell_index as usize, dir);
            let other_span = &tile.cells[other_cell_index].spans[span_index as usize];
            let other_region = regions[other_span.tile_index];
            let other_area = tile.areas[other_span.tile_index];

            if other_area != area || other_region & BORDER_REGION != 0 {
                continue;
            }

            if other_region != 0 && other_region != region_id {
                has_adjecant_region = true;
                break;
            }

            let next_dir = (dir + 1) & 0x3;
            if let Some(span_index) = other_span.neighbours[next_dir] {
                let other_span = &tile.cells
                    [get_neighbour_index(tile_side, other_cell_index, next_dir)]
                .spans[span_index as usize];
                let other_region = regions[other_span.tile_index];
                let other_area = tile.areas[other_span.tile_index];

                if other_area != area || other_region & BORDER_REGION != 0 {
                    continue;
                }

                if other_region != 0 && other_region != region_id {
                    has_adjecant_region = true;
                    break;
                }
            }
        }

        if has_adjecant_region {
            regions[entry.index as usize] = 0;
            continue;
        }

        expanded_any = true;

        // Expand neighbours.
        for dir in 0..4 {
            let Some(span_index) = span.neighbours[dir] else {
                continue;
            };

            let other_cell_index = get_neighbour_index(tile_side, entry.cell_index as usize, dir);
            let other_span = &tile.cells[other_cell_index].spans[span_index as usize];
            let other_area = tile.areas[other_span.tile_index];
            if other_area != area {
                continue;
            }

            if tile.distances[other_span.tile_index] >= lev && regions[other_span.tile_index] == 0 {
                regions[other_span.tile_index] = region_id;
                distances[other_span.tile_index] = 0;
                stack.push(LevelStackEntry {
                    cell_index: other_cell_index as u32,
                    span_index: span_index.into(),
                    index: other_span.tile_index as i32,
                })
            }
        }
    }

    expanded_any
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bevy::math::Vec3;

    use super::*;
    use crate::heightfields::{
        build_open_heightfield_tile, erode_walkable_area, rasterize_triangle, VoxelizedTile,
    };

    fn flat_open_tile(settings: &NavMeshSettings) -> OpenTile {
        let mut tile = VoxelizedTile::new(settings).unwrap();
        let size = tile.tile_side as f32 * settings.cell_width;
        let y = -settings.world_bottom_bound;

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
            rasterize_triangle(&mut tile, triangle, false, Some(Area(0)), false, settings);
        }

        let mut open_tile = build_open_heightfield_tile(tile, settings).unwrap();
        erode_walkable_area(&mut open_tile, settings);

        open_tile
    }

    fn settings(partitioning: RegionPartitioning) -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 1.9, 250.0, -10.0)
            .with_tile_width(NonZeroU16::new(32).unwrap())
            .with_region_partitioning(partitioning)
    }

    fn assert_border_and_interior(open_tile: &OpenTile, border: usize) {
        let side = open_tile.tile_side;

        for (i, cell) in open_tile.cells.iter().enumerate() {
            let x = i % side;
            let z = i / side;
            let in_border = x < border || z < border || x >= side - border || z >= side - border;

            for span in cell.spans.iter() {
                if open_tile.areas[span.tile_index].is_none() {
                    continue;
                }

                assert_eq!(
                    span.region & BORDER_REGION != 0,
                    in_border,
                    "cell ({x}, {z}) region {}",
                    span.region
                );
                assert_ne!(span.region, 0);
            }
        }
    }

    #[test]
    fn watershed_flat_plane_is_single_region() {
        let settings = settings(RegionPartitioning::Watershed);
        let mut open_tile = flat_open_tile(&settings);

        build_regions(&mut open_tile, &settings).unwrap();

        assert_border_and_interior(&open_tile, settings.get_border_side());
        assert_eq!(open_tile.max_regions, 2);
    }

    #[test]
    fn monotone_flat_plane_is_single_region() {
        let settings = settings(RegionPartitioning::Monotone);
        let mut open_tile = flat_open_tile(&settings);

        build_regions(&mut open_tile, &settings).unwrap();

        assert_border_and_interior(&open_tile, settings.get_border_side());
        assert_eq!(open_tile.max_regions, 2);
    }

    #[test]
    fn chunky_regions_stay_inside_chunks() {
        let settings = settings(RegionPartitioning::Chunky {
            chunk_size: NonZeroU16::new(8).unwrap(),
        })
        .with_region_area(0, 0);
        let mut open_tile = flat_open_tile(&settings);

        build_regions(&mut open_tile, &settings).unwrap();

        let side = open_tile.tile_side;
        let border = settings.get_border_side();
        let mut chunk_of_region = BTreeMap::new();

        for (i, cell) in open_tile.cells.iter().enumerate() {
            let x = i % side;
            let z = i / side;
            if x < border || z < border || x >= side - border || z >= side - border {
                continue;
            }

            for span in cell.spans.iter() {
                let chunk = ((x - border) / 8, (z - border) / 8);
                let previous = chunk_of_region.insert(span.region, chunk);

                assert!(previous.is_none_or(|previous| previous == chunk));
            }
        }

        // 32 / 8 squared.
        assert_eq!(chunk_of_region.len(), 16);
    }

    #[test]
    fn shared_borders_follow_renames() {
        let mut borders = SharedBorders::default();
        borders.add(1, 2);
        borders.add(2, 1);
        borders.add(2, 3);

        assert_eq!(borders.get(2, 1), 2);

        borders.rename(2, 3);
        assert_eq!(borders.get(1, 3), 2);
        assert_eq!(borders.get(2, 3), 0);
    }
}
