//! Annotation and model payloads.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A freehand annotation: one or more polyline sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    /// RGBA, each in [0, 1]
    pub color: [f32; 4],
    pub width: f32,
    pub sections: Vec<Vec<Vector3<f32>>>,
}

impl Annotation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: [0.0, 0.0, 0.0, 1.0],
            width: 1.0,
            sections: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }

    /// Starts a new section, unless the last one is still empty.
    pub fn add_section(&mut self) {
        if self.sections.last().map_or(true, |s| !s.is_empty()) {
            self.sections.push(Vec::new());
        }
    }

    /// Appends a point to the last section, starting one if needed.
    pub fn add_point(&mut self, point: Vector3<f32>) {
        if self.sections.is_empty() {
            self.add_section();
        }
        if let Some(section) = self.sections.last_mut() {
            section.push(point);
        }
    }

    pub fn point_count(&self) -> usize {
        self.sections.iter().map(Vec::len).sum()
    }
}

/// Payload of a `LoadRequest`: what to place at the event's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Where the model came from (file name, asset id, ...)
    pub source: String,

    /// Child part names created under the model node
    #[serde(default)]
    pub parts: Vec<String>,
}

impl ModelManifest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            parts: Vec::new(),
        }
    }

    pub fn with_part(mut self, part: impl Into<String>) -> Self {
        self.parts.push(part.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections() {
        let mut a = Annotation::new("Doodle");
        a.add_section();
        a.add_section(); // still empty, no new section
        assert_eq!(a.sections.len(), 1);

        a.add_point(Vector3::new(0.0, 0.0, 0.0));
        a.add_point(Vector3::new(1.0, 0.0, 0.0));
        a.add_section();
        a.add_point(Vector3::new(2.0, 0.0, 0.0));

        assert_eq!(a.sections.len(), 2);
        assert_eq!(a.point_count(), 3);

        a.clear();
        assert_eq!(a.point_count(), 0);
    }

    #[test]
    fn test_add_point_starts_section() {
        let mut a = Annotation::new("Doodle");
        a.add_point(Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(a.sections.len(), 1);
    }
}
