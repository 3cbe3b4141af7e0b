//! Vertex layout and mesh data

use bytemuck::{Pod, Zeroable};

use crate::render::error::{RenderError, RenderResult};

/// Vertex with position, normal and texture coordinates
///
/// Matches the vertex input of every pipeline: location 0 position,
/// location 1 normal, location 2 uv.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Position
    pub position: [f32; 3],
    /// Normal
    pub normal: [f32; 3],
    /// Texture coordinates
    pub uv: [f32; 2],
}

impl Vertex {
    /// Byte stride
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
    /// Offset of the normal attribute
    pub const NORMAL_OFFSET: u32 = 12;
    /// Offset of the uv attribute
    pub const UV_OFFSET: u32 = 24;

    /// Create a vertex
    pub const fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, normal, uv }
    }
}

/// Contiguous index range drawn with its own material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submesh {
    /// First index
    pub first_index: u32,
    /// Index count
    pub index_count: u32,
    /// Material identifier
    pub material: String,
}

/// CPU-side geometry
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshData {
    /// Vertices
    pub vertices: Vec<Vertex>,
    /// Triangle list indices
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Mesh from vertices and indices
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// Axis-aligned cube centred on the origin, 24 vertices, 36 indices
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        // (normal, tangent u, tangent v) per face
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = [
                    (normal[0] + u[0] * su + v[0] * sv) * h,
                    (normal[1] + u[1] * su + v[1] * sv) * h,
                    (normal[2] + u[2] * su + v[2] * sv) * h,
                ];
                let uv = [(su + 1.0) * 0.5, 1.0 - (sv + 1.0) * 0.5];
                vertices.push(Vertex::new(position, normal, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self { vertices, indices }
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Vertex bytes for upload
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index bytes for upload
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Reject empty meshes, partial triangles and out-of-range indices
    pub fn validate(&self) -> RenderResult<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::InvalidArgument("mesh has no geometry".into()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "{} indices do not form whole triangles",
                self.indices.len()
            )));
        }
        let vertex_count = self.vertices.len() as u32;
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= vertex_count) {
            return Err(RenderError::InvalidArgument(format!(
                "index {} out of range for {} vertices",
                bad, vertex_count
            )));
        }
        Ok(())
    }

    /// Check that submesh ranges lie inside the index buffer
    pub fn validate_submeshes(&self, submeshes: &[Submesh]) -> RenderResult<()> {
        for submesh in submeshes {
            let end = submesh.first_index.checked_add(submesh.index_count);
            if end.map_or(true, |end| end > self.index_count()) {
                return Err(RenderError::InvalidArgument(format!(
                    "submesh {}..+{} exceeds {} indices",
                    submesh.first_index,
                    submesh.index_count,
                    self.index_count()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 32);
        let vertex = Vertex::new([1.0, 2.0, 3.0], [0.0, 1.0, 0.0], [0.5, 0.5]);
        let bytes = bytemuck::bytes_of(&vertex);
        assert_eq!(&bytes[Vertex::NORMAL_OFFSET as usize..][..4], &0.0f32.to_ne_bytes());
        assert_eq!(&bytes[Vertex::UV_OFFSET as usize..][..4], &0.5f32.to_ne_bytes());
    }

    #[test]
    fn test_cube() {
        let cube = MeshData::cube(2.0);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);
        assert!(cube.validate().is_ok());
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| (c.abs() - 1.0).abs() < 1e-6)));
        assert_eq!(cube.vertex_bytes().len(), 24 * 32);
    }

    #[test]
    fn test_validation() {
        let mut mesh = MeshData::cube(1.0);
        mesh.indices.push(0);
        assert!(mesh.validate().is_err());

        let mut mesh = MeshData::cube(1.0);
        mesh.indices[0] = 99;
        assert!(mesh.validate().is_err());

        let mesh = MeshData::cube(1.0);
        let inside = Submesh {
            first_index: 30,
            index_count: 6,
            material: "m".into(),
        };
        let outside = Submesh {
            first_index: 30,
            index_count: 7,
            material: "m".into(),
        };
        assert!(mesh.validate_submeshes(&[inside]).is_ok());
        assert!(mesh.validate_submeshes(&[outside]).is_err());
    }
}
