//! Layer list planning.
//!
//! Decides, before any bytes move, exactly which layers the committed image
//! will contain and in what order. Each planned element is a sum type
//! rather than a bare layer ID, so storage-layer identities never get
//! conflated with pipeline placeholders.

use crate::error::Result;
use crate::store::Store;

/// Display token for the layer synthesized from extra image content.
pub(crate) const SYNTHESIZED_LAYER_ID: &str = "(synthesized layer)";

/// One element of the planned layer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlannedLayer {
    /// A parent layer inherited from the base image.
    Parent(String),
    /// The container's own read-write top layer.
    Top(String),
    /// The placeholder for content synthesized from the extra-content map.
    Synthesized,
    /// An ingested caller-supplied layer, indexed into the combined
    /// pre+post ingested list.
    Linked(usize),
}

/// Build the ordered layer list for a commit.
///
/// Pre-layers are emitted first, then the storage chain is walked from the
/// container's top layer: the top is appended and each parent is prepended
/// ahead of everything accumulated so far, leaving parents oldest-first at
/// the head of the list with the pre-layers still directly before the top.
/// The walk stops at the root, or immediately when a single-layer mode
/// (squash or confidential workload) is requested. The synthesized-layer
/// placeholder lands just after the top, and post-layers close the list.
pub(crate) fn plan_layers(
    store: &dyn Store,
    top_layer_id: &str,
    pre_count: usize,
    post_count: usize,
    single_layer: bool,
    synthesize_extra: bool,
) -> Result<Vec<PlannedLayer>> {
    let mut layers: Vec<PlannedLayer> = (0..pre_count).map(PlannedLayer::Linked).collect();

    let mut layer_id = top_layer_id.to_string();
    let mut layer = store.layer(&layer_id)?;
    loop {
        if layer_id == top_layer_id {
            // The layer for this container goes after any prepended
            // layers, wherever the walk ends up putting its parents.
            layers.push(PlannedLayer::Top(layer_id.clone()));
        } else {
            layers.insert(0, PlannedLayer::Parent(layer_id.clone()));
        }
        let parent = layer.parent.clone().unwrap_or_default();
        if parent.is_empty() || single_layer {
            break;
        }
        layer_id = parent;
        layer = store.layer(&layer_id)?;
    }

    if synthesize_extra && !single_layer {
        layers.push(PlannedLayer::Synthesized);
    }
    for i in 0..post_count {
        layers.push(PlannedLayer::Linked(pre_count + i));
    }
    Ok(layers)
}
