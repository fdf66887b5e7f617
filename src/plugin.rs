use std::marker::PhantomData;

use bevy::prelude::*;

use crate::{
    colliders::OxidizedCollider,
    conversion::shape_to_geometry_element,
    generator::{DirtyArea, NavMeshGenerator},
    geometry::{AreaModifier, ElementId, GeometryIndex, OffMeshLink},
    Area, NavMeshSettings,
};

/// System sets containing the crate's systems.
#[derive(SystemSet, Debug, PartialEq, Eq, Hash, Clone)]
pub enum TiledNavMesh {
    /// Systems handling dirty marking when a component is removed.
    /// Separated to make sure that even if Main is throttled the removal events will be caught.
    RemovedComponent,
    /// Main systems, this syncs changed entities into the [`GeometryIndex`] & ticks the [`NavMeshGenerator`].
    Main,
}

pub struct TiledNavMeshPlugin<ColliderComponent> {
    pub settings: NavMeshSettings,
    _collider_type: PhantomData<ColliderComponent>,
}

impl<C> TiledNavMeshPlugin<C>
where
    C: OxidizedCollider,
{
    #[must_use]
    pub fn new(settings: NavMeshSettings) -> TiledNavMeshPlugin<C> {
        TiledNavMeshPlugin::<C> {
            settings,
            _collider_type: PhantomData::<C>,
        }
    }
}

impl<C> Plugin for TiledNavMeshPlugin<C>
where
    C: OxidizedCollider,
{
    fn build(&self, app: &mut App) {
        app.insert_resource(self.settings.clone())
            .insert_resource(NavMeshGenerator::new(self.settings.clone()))
            .init_resource::<GeometryIndex>();

        app.add_systems(
            Update,
            handle_removed_affectors_system
                .before(update_navmesh_affectors_system::<C>)
                .in_set(TiledNavMesh::RemovedComponent),
        );

        app.add_systems(
            Update,
            (
                update_navmesh_affectors_system::<C>,
                update_area_modifiers_system,
                update_off_mesh_links_system,
                tick_generator_system,
            )
                .chain()
                .in_set(TiledNavMesh::Main),
        );

        app.register_type::<NavMeshAffector>()
            .register_type::<NavMeshAreaType>();
    }
}

/// Component for entities that should affect the nav-mesh.
#[derive(Component, Reflect, Default)]
#[reflect(Component)]
pub struct NavMeshAffector;

/// Optional component to define the area type of an entity. Setting this to ``None`` means that the entity isn't walkable.
///
/// Any part of the nav-mesh generated from this entity will have this area type. Overlapping areas will prefer the higher area type.
#[derive(Component, Reflect, Default)]
#[reflect(Component)]
pub struct NavMeshAreaType(pub Option<Area>);

/// Changes the area of the nav-mesh inside a world space volume. Changing it only rebuilds the affected layers from the tile cache.
#[derive(Component, Clone, Debug)]
pub struct NavMeshAreaModifier(pub AreaModifier);

/// Adds an off-mesh link in world space to the nav-mesh.
#[derive(Component, Clone, Debug)]
pub struct NavMeshOffMeshLink(pub OffMeshLink);

fn element_id(entity: Entity) -> ElementId {
    ElementId(entity.to_bits())
}

fn update_navmesh_affectors_system<C: OxidizedCollider>(
    mut geometry_index: ResMut<GeometryIndex>,
    mut generator: ResMut<NavMeshGenerator>,
    query: Query<
        (
            Entity,
            &C::Component,
            &GlobalTransform,
            Option<&NavMeshAreaType>,
        ),
        (
            Or<(
                Changed<GlobalTransform>,
                Changed<C::Component>,
                Changed<NavMeshAffector>,
                Changed<NavMeshAreaType>,
            )>,
            With<NavMeshAffector>,
        ),
    >,
) {
    for (entity, collider, global_transform, area_type) in query.iter() {
        let area = area_type.map_or(Some(Area(0)), |area_type| area_type.0);
        let id = element_id(entity);

        match shape_to_geometry_element(
            C::oxidized_into_typed_shape(collider),
            global_transform.affine(),
            area,
        ) {
            Some(element) => {
                let dirty = geometry_index.insert_geometry(id, element);
                generator.mark_dirty_areas(&dirty);
            }
            None => {
                if let Some(dirty) = geometry_index.remove_geometry(id) {
                    generator.mark_dirty_areas(&[dirty]);
                }
            }
        }
    }
}

fn update_area_modifiers_system(
    mut geometry_index: ResMut<GeometryIndex>,
    mut generator: ResMut<NavMeshGenerator>,
    query: Query<(Entity, &NavMeshAreaModifier), Changed<NavMeshAreaModifier>>,
) {
    for (entity, modifier) in query.iter() {
        let dirty = geometry_index.insert_modifier(element_id(entity), modifier.0.clone());
        generator.mark_dirty_areas(&dirty);
    }
}

fn update_off_mesh_links_system(
    mut geometry_index: ResMut<GeometryIndex>,
    mut generator: ResMut<NavMeshGenerator>,
    query: Query<(Entity, &NavMeshOffMeshLink), Changed<NavMeshOffMeshLink>>,
) {
    for (entity, link) in query.iter() {
        let dirty = geometry_index.insert_off_mesh_link(element_id(entity), link.0.clone());
        generator.mark_dirty_areas(&dirty);
    }
}

fn handle_removed_affectors_system(
    mut removed_affectors: RemovedComponents<NavMeshAffector>,
    mut removed_modifiers: RemovedComponents<NavMeshAreaModifier>,
    mut removed_links: RemovedComponents<NavMeshOffMeshLink>,
    mut geometry_index: ResMut<GeometryIndex>,
    mut generator: ResMut<NavMeshGenerator>,
) {
    let mut dirty: Vec<DirtyArea> = removed_affectors
        .read()
        .filter_map(|removed| geometry_index.remove_geometry(element_id(removed)))
        .collect();
    dirty.extend(
        removed_modifiers
            .read()
            .filter_map(|removed| geometry_index.remove_modifier(element_id(removed))),
    );
    dirty.extend(
        removed_links
            .read()
            .filter_map(|removed| geometry_index.remove_off_mesh_link(element_id(removed))),
    );

    if !dirty.is_empty() {
        generator.mark_dirty_areas(&dirty);
    }
}

fn tick_generator_system(
    time: Res<Time>,
    geometry_index: Res<GeometryIndex>,
    mut generator: ResMut<NavMeshGenerator>,
) {
    if !generator.is_build_in_progress() {
        return;
    }

    let changed = generator.tick(&*geometry_index, time.delta_secs());
    if !changed.is_empty() {
        debug!("Updated {} nav-mesh tiles.", changed.len());
    }
}
