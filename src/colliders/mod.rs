use bevy::ecs::component::Component;

/// The trait that is required to implement for the collider that you want to use with tiled_navmesh's plugin.
/// Essentially it allows you to use any bevy component that contains a `parry3d::shape::SharedShape` as a collider.
///
/// This trait may be implemented directly on the component (though `OxidizedCollider::Component` must still be specified),
/// or may be implemented on a different (foreign) type.
pub trait OxidizedCollider: Send + Sync + 'static {
    type Component: Component;

    // Names are changed to avoid conflicting with the function calls on a `parry3d::shape::SharedShape`.
    fn oxidized_into_typed_shape(item: &Self::Component) -> parry3d::shape::TypedShape;
}
