use indexmap::IndexMap;
use tapedeck_protocol::{Keyframe, MutationOp, NodeDescriptor, RenderSurface, SurfaceError};

/// Headless render surface that tracks replayed state in memory.
///
/// It does not parse keyframe markup. Nodes added by structure changes are
/// tracked per parent path; removing a node the surface never saw added is
/// recorded as a detach of keyframe content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualSurface {
    keyframe: Option<Keyframe>,
    scroll: (f64, f64),
    children: IndexMap<String, Vec<NodeDescriptor>>,
    detached: Vec<(String, NodeDescriptor)>,
    attributes: IndexMap<(String, String), String>,
    texts: IndexMap<String, String>,
    route: Option<String>,
    pulses: usize,
    reconstructions: usize,
}

impl VirtualSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyframe(&self) -> Option<&Keyframe> {
        self.keyframe.as_ref()
    }

    pub fn scroll(&self) -> (f64, f64) {
        self.scroll
    }

    pub fn children(&self, parent_path: &str) -> &[NodeDescriptor] {
        self.children
            .get(parent_path)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn attribute(&self, path: &str, name: &str) -> Option<&str> {
        self.attributes
            .get(&(path.to_owned(), name.to_owned()))
            .map(String::as_str)
    }

    pub fn text(&self, path: &str) -> Option<&str> {
        self.texts.get(path).map(String::as_str)
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn pulses(&self) -> usize {
        self.pulses
    }

    pub fn reconstructions(&self) -> usize {
        self.reconstructions
    }

    /// Applied-state equality, ignoring how many times the surface was
    /// rebuilt to get there.
    pub fn same_state(&self, other: &Self) -> bool {
        Self {
            reconstructions: 0,
            ..self.clone()
        } == Self {
            reconstructions: 0,
            ..other.clone()
        }
    }
}

fn require_path(path: &str) -> Result<(), SurfaceError> {
    if path.trim().is_empty() {
        return Err(SurfaceError::NodeNotFound("<empty path>".into()));
    }
    Ok(())
}

impl RenderSurface for VirtualSurface {
    fn reconstruct(&mut self, keyframe: &Keyframe) -> Result<(), SurfaceError> {
        if keyframe.markup.trim().is_empty() {
            return Err(SurfaceError::Rejected("keyframe has no markup".into()));
        }
        let reconstructions = self.reconstructions + 1;
        *self = Self {
            keyframe: Some(keyframe.clone()),
            reconstructions,
            ..Self::default()
        };
        Ok(())
    }

    fn set_scroll(&mut self, x: f64, y: f64) -> Result<(), SurfaceError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(SurfaceError::Rejected(format!("scroll offset ({x}, {y})")));
        }
        self.scroll = (x, y);
        Ok(())
    }

    fn apply_mutation(&mut self, op: &MutationOp) -> Result<(), SurfaceError> {
        match op {
            MutationOp::StructureChange {
                parent_path,
                added,
                removed,
            } => {
                require_path(parent_path)?;
                let nodes = self.children.entry(parent_path.clone()).or_default();
                for node in removed {
                    match nodes.iter().position(|existing| existing == node) {
                        Some(position) => {
                            nodes.remove(position);
                        }
                        None => self.detached.push((parent_path.clone(), node.clone())),
                    }
                }
                nodes.extend(added.iter().cloned());
            }
            MutationOp::AttributeChange {
                path,
                name,
                new_value,
                ..
            } => {
                require_path(path)?;
                let key = (path.clone(), name.clone());
                match new_value {
                    Some(value) => {
                        self.attributes.insert(key, value.clone());
                    }
                    None => {
                        self.attributes.shift_remove(&key);
                    }
                }
            }
            MutationOp::TextChange {
                path, new_value, ..
            } => {
                require_path(path)?;
                self.texts
                    .insert(path.clone(), new_value.clone().unwrap_or_default());
            }
            MutationOp::Error { reason } => {
                return Err(SurfaceError::Rejected(format!("placeholder op: {reason}")));
            }
            MutationOp::Unknown { op, .. } => {
                return Err(SurfaceError::Rejected(format!("unknown op {op}")));
            }
        }
        Ok(())
    }

    fn pulse(&mut self, _x: f64, _y: f64) {
        self.pulses += 1;
    }

    fn navigated(&mut self, path: &str) {
        self.route = Some(path.to_owned());
    }
}
