use glam::Vec3;

/// An evaluated mesh as handed out by the host.
///
/// Per-corner layers are indexed by corner, where corners are numbered by
/// walking `faces` in order and each face's vertices in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub faces: Vec<Face>,
    /// Edges carrying flags. Edges absent here are smooth and not seams.
    pub edges: Vec<Edge>,
    pub uv_layers: Vec<CornerLayer<[f32; 2]>>,
    pub color_layers: Vec<CornerLayer<[f32; 3]>>,
    /// Custom split normals, one per corner.
    pub custom_normals: Option<Vec<Vec3>>,
    /// Vertex group weights, one list per vertex.
    pub weights: Vec<Vec<VertexWeight>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub vertices: Vec<u32>,
    /// Index into the owning object's material slots.
    pub material: u16,
    pub smooth: bool,
}

impl Face {
    pub fn new(vertices: impl Into<Vec<u32>>) -> Self {
        Face {
            vertices: vertices.into(),
            material: 0,
            smooth: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub vertices: [u32; 2],
    pub seam: bool,
    pub sharp: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CornerLayer<T> {
    pub name: String,
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexWeight {
    pub group: usize,
    pub weight: f32,
}

impl Mesh {
    pub fn corner_count(&self) -> usize {
        self.faces.iter().map(|f| f.vertices.len()).sum()
    }

    /// Offset of each face's first corner.
    pub fn corner_starts(&self) -> Vec<usize> {
        let mut starts = Vec::with_capacity(self.faces.len());
        let mut acc = 0;
        for face in &self.faces {
            starts.push(acc);
            acc += face.vertices.len();
        }
        starts
    }

    /// Flat-shaded cube of half extent `half` centred on the origin, as six quads.
    pub fn cube(half: f32) -> Mesh {
        let positions = [
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ]
        .into_iter()
        .map(|p| Vec3::from_array(p) * half)
        .collect();
        let faces: Vec<Face> = [
            [0, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [1, 2, 6, 5],
            [2, 3, 7, 6],
            [3, 0, 4, 7],
        ]
        .into_iter()
        .map(|v| Face {
            smooth: false,
            ..Face::new(v)
        })
        .collect();
        let uvs = faces
            .iter()
            .flat_map(|_| [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]])
            .collect();
        Mesh {
            positions,
            faces,
            uv_layers: vec![CornerLayer {
                name: "UVMap".to_string(),
                data: uvs,
            }],
            ..Mesh::default()
        }
    }
}
